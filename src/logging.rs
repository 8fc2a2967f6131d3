//! Log setup for the binary.
//!
//! Records go to stderr so `--exec` commands keep stdout to themselves.
//! `RUST_LOG` takes precedence over the level picked from the command line.

use tracing::Level;
use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// Minimum level: `warn` when silenced, `info` otherwise.
pub fn level(silent: bool) -> Level {
    if silent { Level::WARN } else { Level::INFO }
}

/// Build a subscriber writing formatted records to `writer`.
pub fn subscriber<W>(level: Level, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(writer)
        .finish()
}

/// Install the process-wide subscriber. Returns false if one was already set.
pub fn init(silent: bool) -> bool {
    tracing::subscriber::set_global_default(subscriber(level(silent), std::io::stderr)).is_ok()
}
