use tracing_subscriber::EnvFilter;

/// Install the process-wide tracing subscriber. `RUST_LOG` overrides the
/// default filter. Safe to call more than once (later calls are no-ops),
/// which keeps test setups simple.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,crewd=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
