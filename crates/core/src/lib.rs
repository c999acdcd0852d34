pub mod config;
pub mod error;
pub mod telemetry;

pub use config::{Settings, TransportMode};
pub use error::AppError;

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
