//! Tracing/logging setup shared by the worker binaries.

/// Initialize process-wide logging with the format taken from `LOG_FORMAT`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, layers, worker span).
pub mod tracing;

pub use self::tracing::{LogFormat, worker_span};
