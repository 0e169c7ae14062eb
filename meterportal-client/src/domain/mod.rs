pub mod meter;
pub mod reading;
pub mod statistic;

pub use meter::{Counter, CounterType, Meter, MeterType, ReadingKind, Role};
pub use reading::Reading;
pub use statistic::{meter_reading_sensor_name, StatisticId, StatisticPoint};
