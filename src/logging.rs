//! Tracing subscriber setup.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*, registry};

use crate::config::{LogFormat, LoggingSection};

/// Filter from `RUST_LOG` if set, else the configured level. Noisy
/// dependencies are capped at `warn`.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level))?,
    };
    Ok(filter
        .add_directive("hyper=warn".parse()?)
        .add_directive("hyper_util=warn".parse()?)
        .add_directive("bollard=warn".parse()?))
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process when file logging is enabled, or buffered lines are
/// lost on exit.
pub fn init_logging(settings: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let level = if verbose { "debug" } else { settings.level.as_str() };
    let filter = build_filter(level)?;
    let json = settings.format == LogFormat::Json;

    let console = fmt::layer().with_writer(std::io::stderr).with_target(verbose);
    let console = if json {
        console.json().boxed()
    } else {
        console.boxed()
    };

    let (file_layer, guard) = match &settings.file {
        Some(path) => {
            let (dir, name) = split_log_path(path);
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            let layer = if json { layer.json().boxed() } else { layer.boxed() };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn split_log_path(path: &Path) -> (&Path, &std::ffi::OsStr) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("berth.log"));
    (dir, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_directives() {
        assert!(build_filter("info").is_ok());
        assert!(build_filter("berth=debug,berth_runtime=trace").is_ok());
    }

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/berth/server.log"));
        assert_eq!(dir, Path::new("/var/log/berth"));
        assert_eq!(name, "server.log");

        let (dir, name) = split_log_path(Path::new("server.log"));
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "server.log");
    }
}
