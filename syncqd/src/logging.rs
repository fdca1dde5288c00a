use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::Context;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber.
///
/// Events go to `logfile` when one is configured, otherwise to stderr. `to_stderr` adds stderr
/// output next to the log file. `RUST_LOG` overrides the default `info` level.
pub fn init(logfile: Option<&Path>, to_stderr: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file = logfile
        .map(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))
        })
        .transpose()?;
    let stderr = (file.is_none() || to_stderr).then(|| fmt::layer().with_writer(std::io::stderr));
    let file = file.map(|file| fmt::layer().with_ansi(false).with_writer(Mutex::new(file)));

    tracing_subscriber::registry()
        .with(filter)
        .with(file)
        .with(stderr)
        .try_init()
        .context("failed to install the log subscriber")
}
