use anyhow::Context;
use anyhow::Result;
use tracing::metadata::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Set up logging on stderr for the lock server.
///
/// `level` is the default verbosity; setting `RUST_LOG` replaces it with the
/// usual directive syntax. With `json` set, output is line-delimited JSON
/// for log shippers; otherwise it is human-readable, coloured when stderr is
/// a terminal.
pub fn init_tracing(level: LevelFilter, json: bool) -> Result<()> {
    if level == LevelFilter::OFF {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));

    let output = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(atty::is(atty::Stream::Stderr));
    let output = if json {
        output.json().boxed()
    } else {
        output.boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init()
        .context("Failed to initialise the tracing subscriber")?;

    tracing::debug!(%level, json, "Lock server logging ready");

    Ok(())
}
