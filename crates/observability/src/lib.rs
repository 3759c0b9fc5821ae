//! Tracing and logging setup shared by hosts of the job executor.

/// Initialize process-wide observability (tracing/logging) with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Initialize with the format named by `JOBFLOW_LOG_FORMAT` (JSON if unset).
pub fn init_from_env() {
    let format = std::env::var("JOBFLOW_LOG_FORMAT")
        .map(|v| tracing::LogFormat::from_setting(&v))
        .unwrap_or_default();
    tracing::init(format);
}

/// Initialize with an explicit output format.
pub fn init_with(format: tracing::LogFormat) {
    tracing::init(format);
}

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;
