use tracing_subscriber::EnvFilter;

/// Level for this crate's events: `warn` by default, `info` for long-running
/// commands, raised by each `-v`.
pub fn level_for(verbose: u8, long_running: bool) -> &'static str {
    match (verbose, long_running) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        (2, _) => "debug",
        _ => "trace",
    }
}

/// Install the stderr subscriber. `RUST_LOG` replaces the computed filter.
pub fn init(verbose: u8, long_running: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("warn,stitch={}", level_for(verbose, long_running)))
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
