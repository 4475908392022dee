use tracing::dispatcher::DefaultGuard;
use tracing::{Level, subscriber};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initializes the `tracing` logging framework.
///
/// Regular output is influenced by the
/// [`RUST_LOG`](tracing_subscriber::filter::EnvFilter) environment variable
/// and defaults to `INFO`. Setting `LOG_FORMAT=json` switches to JSON lines.
pub fn init() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let json = matches!(
        lease_queue_env_vars::var("LOG_FORMAT").ok().flatten().as_deref(),
        Some("json")
    );

    let log_layer = match json {
        true => fmt::layer().json().with_filter(env_filter).boxed(),
        false => fmt::layer().compact().with_filter(env_filter).boxed(),
    };

    tracing_subscriber::registry().with(log_layer).init();
}

/// Installs a subscriber for the current thread that writes `DEBUG` output
/// through the test harness, so it is only shown for failing tests.
pub fn init_for_test() -> DefaultGuard {
    let subscriber = fmt()
        .compact()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();

    subscriber::set_default(subscriber)
}
