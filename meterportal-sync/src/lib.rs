pub mod api;
pub mod app;
pub mod backfill;
pub mod clock;
pub mod config;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod scheduler;
pub mod sinks;
pub mod sources;
pub mod state;
pub mod sync;
pub mod transform;

pub use pipeline::{FetchError, SinkError, SyncError};
