//! Tracing subscriber setup for the `gw` binary.
//!
//! `GW_LOG` takes precedence (standard `EnvFilter` syntax, e.g.
//! `GW_LOG=groundwork_core=debug,info`). Without it the `-v` count picks
//! the level: warn, info, debug, trace. Logs always go to stderr so that
//! `--json` output on stdout stays machine-readable.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

pub const LOG_ENV: &str = "GW_LOG";

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

pub fn init(verbosity: u8, json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    let layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    };

    // A second init (tests) is a no-op rather than a panic.
    let _ = tracing_subscriber::registry().with(layer).try_init();
}
