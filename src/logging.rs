//! Subscriber setup for the `tracing` events emitted by the connection core.

use tracing_subscriber::EnvFilter;

/// Map a `-v` count to a default filter directive.
///
/// 0 = warnings only, 1 (`-v`) = info for this crate, 2+ (`-vv`) = debug everywhere.
pub fn filter_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "warn,jolokia_session=info",
        _ => "debug,hyper=info,reqwest=info",
    }
}

/// Install a compact stderr subscriber. `RUST_LOG` takes precedence over `verbosity`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(verbosity: u8) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_for(verbosity)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init();
}
