pub mod meterportal;
#[cfg(test)]
pub mod scripted;

pub use meterportal::MeterportalClient;
