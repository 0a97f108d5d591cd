//! Logging setup for the node binary.
//!
//! Logs go to stderr, to `<log_dir>/run.log`, or both. On every start the
//! previous `run.log` is archived under a timestamped name and only the newest
//! archives are kept.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LoggingError, LoggingResult};

/// Prefix for archived log files (`dash-node.2025-01-15.143025.log`).
const ARCHIVE_PREFIX: &str = "dash-node.";
/// Name of the active log file.
const ACTIVE_LOG_NAME: &str = "run.log";
const ARCHIVE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d.%H%M%S";

/// Keeps the background log writer alive. Buffered lines are flushed when it
/// is dropped, so hold it until shutdown.
#[derive(Debug)]
pub struct LoggingGuard {
    _worker_guard: Option<WorkerGuard>,
}

/// Where log output goes and how verbose it is.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level filter. `None` defers to `RUST_LOG`, then INFO.
    pub level: Option<LevelFilter>,
    /// Write to stderr.
    pub console: bool,
    /// Write to a log directory.
    pub file: Option<LogFileConfig>,
}

impl LoggingConfig {
    /// Console output only.
    pub fn console(level: Option<LevelFilter>) -> Self {
        Self {
            level,
            console: true,
            file: None,
        }
    }

    /// Add file output in `log_dir`.
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.file = Some(LogFileConfig {
            log_dir: log_dir.into(),
            ..LogFileConfig::default()
        });
        self
    }
}

/// File output settings.
#[derive(Debug, Clone)]
pub struct LogFileConfig {
    pub log_dir: PathBuf,
    /// Archived runs to keep besides the active log.
    pub max_files: usize,
}

impl Default for LogFileConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            max_files: 20,
        }
    }
}

/// Parse a level name as given on the command line (`info`, `DEBUG`, `off`, ...).
pub fn parse_level(level: &str) -> LoggingResult<LevelFilter> {
    level
        .parse::<LevelFilter>()
        .map_err(|_| LoggingError::SubscriberInit(format!("unknown log level '{}'", level)))
}

/// Install the global tracing subscriber described by `config`.
///
/// With neither console nor file output nothing is installed and the tracing
/// macros stay no-ops. Fails if a global subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> LoggingResult<LoggingGuard> {
    if !config.console && config.file.is_none() {
        return Ok(LoggingGuard {
            _worker_guard: None,
        });
    }

    let env_filter = match config.level {
        Some(level) => EnvFilter::new(level.to_string()),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string())),
    };

    let (file_layer, worker_guard) = match &config.file {
        Some(file_config) => {
            let writer = open_log_file(file_config)?;
            let (non_blocking, guard): (NonBlocking, WorkerGuard) =
                tracing_appender::non_blocking(writer);
            let layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let console_layer = config
        .console
        .then(|| fmt::layer().with_target(true).with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| LoggingError::SubscriberInit(e.to_string()))?;

    Ok(LoggingGuard {
        _worker_guard: worker_guard,
    })
}

/// Archive the previous run, prune old archives and start a fresh `run.log`.
fn open_log_file(config: &LogFileConfig) -> LoggingResult<File> {
    fs::create_dir_all(&config.log_dir)?;
    archive_active_log(&config.log_dir)?;
    prune_archives(&config.log_dir, config.max_files)?;
    Ok(File::create(config.log_dir.join(ACTIVE_LOG_NAME))?)
}

/// Rename `run.log` after its last modification time. Returns the archive path.
fn archive_active_log(log_dir: &Path) -> LoggingResult<Option<PathBuf>> {
    let active = log_dir.join(ACTIVE_LOG_NAME);
    let modified = match fs::metadata(&active) {
        Ok(metadata) => metadata.modified().unwrap_or_else(|_| SystemTime::now()),
        Err(_) => return Ok(None),
    };

    let stamp = DateTime::<Local>::from(modified).format(ARCHIVE_TIMESTAMP_FORMAT).to_string();
    let target = std::iter::once(format!("{}{}.log", ARCHIVE_PREFIX, stamp))
        .chain((1..=999).map(|n| format!("{}{}-{}.log", ARCHIVE_PREFIX, stamp, n)))
        .map(|name| log_dir.join(name))
        .find(|path| !path.exists())
        .ok_or_else(|| {
            LoggingError::RotationFailed(format!("no free archive name for {}", stamp))
        })?;

    fs::rename(&active, &target).map_err(|e| LoggingError::RotationFailed(e.to_string()))?;
    Ok(Some(target))
}

fn is_archive(name: &str) -> bool {
    name.starts_with(ARCHIVE_PREFIX) && name.ends_with(".log")
}

/// Delete the oldest archives until at most `max_files` remain.
fn prune_archives(log_dir: &Path, max_files: usize) -> LoggingResult<()> {
    let mut archives: Vec<(Option<SystemTime>, PathBuf)> = fs::read_dir(log_dir)
        .map_err(|e| LoggingError::RotationFailed(format!("failed to read log dir: {}", e)))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().map(is_archive).unwrap_or(false))
        .map(|entry| (entry.metadata().and_then(|m| m.modified()).ok(), entry.path()))
        .collect();

    if archives.len() <= max_files {
        return Ok(());
    }

    archives.sort();
    let excess = archives.len() - max_files;
    for (_, path) in archives.into_iter().take(excess) {
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Failed to remove old log file {}: {}", path.display(), e);
        }
    }
    Ok(())
}
