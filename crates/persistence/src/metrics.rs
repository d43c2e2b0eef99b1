//! Store query metrics.

use metrics::histogram;
use std::time::Instant;

/// Histogram of store operation latency, labelled by query and backend.
pub const QUERY_DURATION_SECONDS: &str = "database_query_duration_seconds";

/// Record how long a store operation took.
pub fn record_query_duration(query: &'static str, backend: &'static str, duration_secs: f64) {
    histogram!(
        QUERY_DURATION_SECONDS,
        "query" => query,
        "backend" => backend
    )
    .record(duration_secs);
}

/// Times one store operation.
///
/// ```ignore
/// let timer = QueryTimer::postgres("get_export_request");
/// let row = sqlx::query_as::<_, ExportRequestEntity>(...).fetch_optional(&pool).await;
/// timer.observe(row)
/// ```
pub struct QueryTimer {
    query: &'static str,
    backend: &'static str,
    start: Instant,
}

impl QueryTimer {
    pub fn postgres(query: &'static str) -> Self {
        Self::new(query, "postgres")
    }

    pub fn memory(query: &'static str) -> Self {
        Self::new(query, "memory")
    }

    fn new(query: &'static str, backend: &'static str) -> Self {
        Self {
            query,
            backend,
            start: Instant::now(),
        }
    }

    /// Record the elapsed duration.
    pub fn record(self) {
        record_query_duration(self.query, self.backend, self.start.elapsed().as_secs_f64());
    }

    /// Record the elapsed duration and pass `value` through.
    pub fn observe<T>(self, value: T) -> T {
        self.record();
        value
    }
}
