pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;

pub use config::{AdapterDriver, Config};
pub use error::{Error, Result};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
