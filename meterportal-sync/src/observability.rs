use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins; otherwise this crate logs at info.
pub fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "meterportal_sync=info".parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
