use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, reload};

pub type FileFmtLayer =
    fmt::Layer<tracing_subscriber::Registry, fmt::format::DefaultFields, fmt::format::Format, BoxMakeWriter>;

pub type LogReloadHandle = reload::Handle<FileFmtLayer, tracing_subscriber::Registry>;

const DEFAULT_LOG_FILTER: &str = "info";
pub const ENV_VAR_LOG_FILE: &str = "NETCONND_LOG_FILE";
pub const DEFAULT_LOG_FILE: &str = "/var/log/netconnd.log";

/// Creates a [`FileFmtLayer`] appending to `log_path`.
///
/// The file is opened (or created) in append mode and written without ANSI
/// colors. The daemon calls this again after `SIGHUP` to reopen a file that
/// was moved away by logrotate.
pub fn make_file_fmt_layer(log_path: &Path) -> Result<FileFmtLayer, io::Error> {
    let file = OpenOptions::new().create(true).append(true).open(log_path)?;
    Ok(fmt::layer().with_writer(BoxMakeWriter::new(file)).with_ansi(false))
}

/// Installs the global subscriber with a reloadable file layer.
///
/// Verbosity comes from `RUST_LOG` and falls back to `info`. The returned
/// [`LogReloadHandle`] swaps the file layer at runtime, see
/// [`make_file_fmt_layer`].
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_log_file(log_path: &Path) -> Result<LogReloadHandle, io::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (reload_layer, reload_handle): (
        reload::Layer<FileFmtLayer, tracing_subscriber::Registry>,
        LogReloadHandle,
    ) = reload::Layer::new(make_file_fmt_layer(log_path)?);
    tracing_subscriber::registry().with(reload_layer).with(filter).init();
    tracing::debug!(path = %log_path.display(), "logging initialized with file output");
    Ok(reload_handle)
}

/// Installs the global subscriber writing to stdout.
///
/// # Panics
///
/// Panics if a global subscriber has already been set.
pub fn setup_stdout() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(fmt::layer().with_ansi(true))
        .with(filter)
        .init();
    tracing::debug!("logging initialized with stdout output");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_layer_creates_missing_log_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("netconnd.log");
        make_file_fmt_layer(&path)?;
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn file_layer_reports_unwritable_location() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("missing").join("netconnd.log");
        assert!(make_file_fmt_layer(&path).is_err());
        Ok(())
    }
}
