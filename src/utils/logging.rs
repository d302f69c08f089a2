use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Filter for the cloner's own events; `RUST_LOG` directives are kept
fn log_filter(verbose: bool) -> Result<EnvFilter> {
    let level = if verbose { "debug" } else { "info" };
    Ok(EnvFilter::from_default_env()
        .add_directive("warn".parse()?)
        .add_directive(format!("site_cloner={}", level).parse()?))
}

/// Initialize the logging system.
///
/// Events go to stderr and, when `log_file` is set, are appended to that
/// file without colors so resumed jobs keep one history.
pub fn init_logging(verbose: bool, log_file: Option<PathBuf>) -> Result<()> {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE);

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_target(true).with_ansi(false).with_writer(file))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(log_filter(verbose)?)
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

/// Log file in the user data directory
pub fn default_log_file() -> PathBuf {
    directories::ProjectDirs::from("com", "site-cloner", "site-cloner")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("./logs"))
        .join("cloner.log")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_levels() {
        assert!(log_filter(true).unwrap().to_string().contains("site_cloner=debug"));
        assert!(log_filter(false).unwrap().to_string().contains("site_cloner=info"));
    }
}
