// Library root. The binary in `src/main.rs` and the integration tests in
// `tests/` both build on these modules.

pub mod api;
pub mod cache;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod services;
pub mod source;

// Ambient pieces used by the binary.
pub mod cli;
pub mod config;
pub mod logging;

pub use engine::Engine;
pub use error::{AppError, DataSourceError, ErrorKind};
pub use source::{DataSource, HealthReport, Params, SourceConfig, SourceError};
