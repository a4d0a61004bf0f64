use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, registry};

use crate::app::APP_ID;

pub const LOG_FILE_NAME: &str = "shell.log";

/// Log file location:
/// - Windows: %LOCALAPPDATA%\xhs-desktop\logs\shell.log
/// - macOS: ~/Library/Application Support/xhs-desktop/logs/shell.log
/// - Linux: ~/.local/share/xhs-desktop/logs/shell.log
/// Falls back to the temp dir when no data dir is known
pub fn log_file_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_ID)
        .join("logs")
        .join(LOG_FILE_NAME)
}

/// Parse a level name; unknown names fall back to INFO
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" | "warning" => LevelFilter::WARN,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::INFO,
    }
}

// Truncated on every launch so the file only holds this session
fn open_log_file(path: &Path) -> Option<File> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).ok()?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .ok()
}

/// Install the global subscriber: stderr always, plus the log file when it can be opened.
/// Returns the log file path that is actually being written.
pub fn init_logging(level: &str) -> Option<PathBuf> {
    let filter = parse_level(level);

    let mut path = log_file_path();
    let mut file = open_log_file(&path);
    if file.is_none() {
        path = std::env::temp_dir()
            .join(APP_ID)
            .join("logs")
            .join(LOG_FILE_NAME);
        file = open_log_file(&path);
    }

    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let file_layer = file.map(|file| {
        fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false)
    });
    let has_file = file_layer.is_some();

    let installed = registry()
        .with(stderr_layer.with_filter(filter))
        .with(file_layer.with_filter(filter))
        .try_init()
        .is_ok();

    if !installed {
        // Someone else owns the global subscriber (tests)
        return None;
    }

    if has_file {
        tracing::info!("Logging to {}", path.display());
        Some(path)
    } else {
        tracing::warn!("Log file unavailable, logging to stderr only");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), LevelFilter::DEBUG);
        assert_eq!(parse_level(" WARN "), LevelFilter::WARN);
        assert_eq!(parse_level("verbose"), LevelFilter::INFO);
    }

    #[test]
    fn test_log_file_path() {
        let path = log_file_path();
        assert!(path.ends_with(PathBuf::from(APP_ID).join("logs").join(LOG_FILE_NAME)));
    }

    #[test]
    fn test_open_log_file_creates_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shell.log");
        assert!(open_log_file(&path).is_some());
        assert!(path.exists());
    }
}
