use chrono::{DateTime, Utc};
use serde::Serialize;

/// Hourly request counter per external service endpoint (PostgreSQL `api_usage`).
///
/// Unique Key: (service, endpoint, hour_bucket)
/// Incremented once per request a provider accepted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiUsageCounter {
    pub service: String,
    pub endpoint: String,
    pub hour_bucket: DateTime<Utc>,
    pub request_count: i64,
}
