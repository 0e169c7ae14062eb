#[cfg(test)]
pub mod memory;
pub mod questdb;

pub use questdb::QuestDbStatisticsSink;
