//! Logging system configuration and initialization
//!
//! This module provides the logging setup for the collector:
//! - Console output for interactive runs
//! - Non-blocking file output, previous file rotated aside on start
//! - Structured JSON file logs (optional)
//! - Local-time timestamps
//! - Cleanup of old log files beyond `max_files`

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use chrono::Local;
use lazy_static::lazy_static;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::{self, time::FormatTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use crate::infrastructure::config::LoggingConfig;

const LOG_FILE_NAME: &str = "collector.log";

/// Targets that drown the collector's own output below TRACE.
const NOISY_TARGETS: &[(&str, &str)] = &[
    ("sqlx::query", "warn"),
    ("sqlx::sqlite", "warn"),
    ("reqwest", "info"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("h2", "warn"),
    ("rustls", "warn"),
];

// Global guard to keep the log file writer alive
lazy_static! {
    static ref LOG_GUARDS: Mutex<Vec<WorkerGuard>> = Mutex::new(Vec::new());
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Local wall-clock timestamps with millisecond precision.
struct LocalTimeFormatter;

impl FormatTime for LocalTimeFormatter {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f %:z"))
    }
}

/// Log directory from config, or `logs/` next to the executable.
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    if let Some(dir) = &config.log_dir {
        return dir.clone();
    }

    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_default());

    exe_dir.join("logs")
}

/// Builds the filter. `RUST_LOG`, when given, replaces the configured level entirely.
///
/// ```bash
/// # Show SQL statements while debugging the store
/// RUST_LOG="debug,sqlx::query=debug" datamaster-collector collect
/// ```
pub fn build_env_filter(config: &LoggingConfig, rust_log: Option<&str>) -> Result<EnvFilter> {
    if let Some(spec) = rust_log.filter(|s| !s.trim().is_empty()) {
        return EnvFilter::try_new(spec).map_err(|e| anyhow!("Invalid RUST_LOG {:?}: {}", spec, e));
    }

    let mut filter = EnvFilter::try_new(&config.level)
        .map_err(|e| anyhow!("Invalid log level {:?}: {}", config.level, e))?;

    if !config.level.to_lowercase().contains("trace") {
        for (target, level) in NOISY_TARGETS {
            filter = filter.add_directive(format!("{target}={level}").parse()?);
        }
    }

    let mut module_filters: Vec<_> = config.module_filters.iter().collect();
    module_filters.sort();
    for (target, level) in module_filters {
        let directive = format!("{target}={level}");
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => warn!("Ignoring log filter {:?}: {}", directive, e),
        }
    }

    Ok(filter)
}

/// Initialize logging with custom configuration.
///
/// Safe to call once per process; a second call fails because the global
/// subscriber is already set.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if !config.console_output && !config.file_output {
        return Err(anyhow!("No logging output configured"));
    }

    let env_filter = build_env_filter(config, std::env::var("RUST_LOG").ok().as_deref())?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let log_dir = get_log_directory(config);

    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;
        rotate_existing_log_file(&log_dir)?;
        if config.auto_cleanup_logs {
            cleanup_old_logs(&log_dir, config.max_files)?;
        }

        let (file_writer, file_guard) = non_blocking(rolling::never(&log_dir, LOG_FILE_NAME));
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        let file_layer = if config.json_format {
            fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_timer(LocalTimeFormatter)
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(file_writer)
                .with_timer(LocalTimeFormatter)
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if config.console_output {
        layers.push(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_timer(LocalTimeFormatter)
                .with_target(false)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    info!("Logging system initialized");
    info!("Log level: {}", config.level);
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(LOG_FILE_NAME));
    }
    Ok(())
}

/// Moves the previous run's log aside with its modification time in the name.
fn rotate_existing_log_file(log_dir: &Path) -> Result<()> {
    let log_file_path = log_dir.join(LOG_FILE_NAME);
    if !log_file_path.exists() {
        return Ok(());
    }

    let metadata = std::fs::metadata(&log_file_path)
        .map_err(|e| anyhow!("Failed to get log file metadata: {}", e))?;
    let modified = metadata.modified().unwrap_or_else(|_| std::time::SystemTime::now());
    let stamp = chrono::DateTime::<Local>::from(modified).format("%Y%m%dT%H%M%S");

    let rotated = log_dir.join(format!("collector.{stamp}.log"));
    std::fs::rename(&log_file_path, &rotated).map_err(|e| {
        anyhow!(
            "Failed to rotate log file {} to {}: {}",
            log_file_path.display(),
            rotated.display(),
            e
        )
    })?;
    Ok(())
}

/// Deletes the oldest `.log` files so at most `max_files` remain.
/// Returns how many files were removed.
pub fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<usize> {
    if !log_dir.exists() {
        return Ok(0);
    }

    let mut log_files = Vec::new();
    for entry in std::fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path.is_file() && path.extension().is_some_and(|ext| ext == "log");
        if !is_log {
            continue;
        }
        if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
            log_files.push((path, modified));
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let keep = max_files as usize;
    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match std::fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn configured_log_dir_wins() {
        let config = LoggingConfig {
            log_dir: Some(PathBuf::from("/var/log/collector")),
            ..LoggingConfig::default()
        };
        assert_eq!(get_log_directory(&config), PathBuf::from("/var/log/collector"));
        assert!(get_log_directory(&LoggingConfig::default()).ends_with("logs"));
    }

    #[test]
    fn filter_builds_from_level_and_module_filters() {
        let config = LoggingConfig::default();
        let filter = build_env_filter(&config, None).unwrap();
        let rendered = filter.to_string();
        assert!(rendered.contains("info"));
        assert!(rendered.contains("sqlx=warn"));
    }

    #[test]
    fn rust_log_overrides_configured_level() {
        let filter = build_env_filter(&LoggingConfig::default(), Some("debug,reqwest=trace")).unwrap();
        assert!(filter.to_string().contains("reqwest=trace"));
        assert!(build_env_filter(&LoggingConfig::default(), Some("   ")).is_ok());
    }

    #[test]
    fn cleanup_keeps_newest_files() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            std::fs::write(dir.path().join(format!("collector.{i}.log")), "x").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "keep me").unwrap();

        let removed = cleanup_old_logs(dir.path(), 2).unwrap();
        assert_eq!(removed, 3);

        let remaining_logs = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "log"))
            .count();
        assert_eq!(remaining_logs, 2);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn rotation_moves_previous_log_aside() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(LOG_FILE_NAME), "old run").unwrap();

        rotate_existing_log_file(dir.path()).unwrap();

        assert!(!dir.path().join(LOG_FILE_NAME).exists());
        let rotated = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(rotated, 1);
    }
}
