use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the built-in filter.
pub fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,backup_profiles=debug,tower_http=info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
