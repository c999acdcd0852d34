use tracing_subscriber::{fmt, EnvFilter};

/// Default directives when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,padwatch_ingest=debug";

/// Initialise the global tracing subscriber.
///
/// Respects `RUST_LOG` env var; defaults to `info`, with the ingest pipeline at `debug`.
pub fn init() {
    init_with(DEFAULT_FILTER);
}

/// Same as [`init`] with caller-supplied fallback directives. A second call is a no-op.
pub fn init_with(default_directives: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
