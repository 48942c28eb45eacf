use tracing_subscriber::EnvFilter;

/// Installs the tracing subscriber for CLI entry points.
///
/// `DOCKHAND_LOG` overrides the default filter; repeated init attempts are
/// ignored so tests can call this freely.
pub fn init() {
    let filter = EnvFilter::try_from_env("DOCKHAND_LOG")
        .unwrap_or_else(|_| EnvFilter::new("dockhand=info,sqlx=warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
