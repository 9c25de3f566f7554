/// Initialize the tracing subscriber for transitflow binaries and tests.
///
/// Reads `RUST_LOG` from the environment, falling back to `default_level`
/// for everything and `info` for the transitflow crates. Calling it more than
/// once is harmless; later calls are ignored.
pub fn init_with_default(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("{default_level},transitflow_core=info,transitflow=info"))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// [`init_with_default`] with `warn` for third-party crates.
pub fn init() {
    init_with_default("warn");
}
