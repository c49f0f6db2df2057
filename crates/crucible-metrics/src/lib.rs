// Metrics Cache client: a bounded window of recent execution durations per
// (organization, image), used by the Worker's flakiness heuristics and by
// the dashboard for trend display.

use thiserror::Error;

mod store;

pub use store::{InMemoryMetricsCache, MetricsCache, RedisMetricsCache};

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Metrics cache error: {0}")]
    Cache(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

impl From<MetricsError> for crucible_common::CoreError {
    fn from(err: MetricsError) -> Self {
        crucible_common::CoreError::Metrics(err.to_string())
    }
}
