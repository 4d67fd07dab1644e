//! Telemetry: logging infrastructure for the job core.
//!
//! Metrics are emitted through the `metrics` facade at the call sites
//! (error construction, job lifecycle transitions); installing an exporter
//! is the embedding process's concern.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
