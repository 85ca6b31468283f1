use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, Level};
use tracing_subscriber::{fmt::writer::MakeWriterExt, prelude::*, EnvFilter};

const LOG_FILE_NAME: &str = "chat-composer.log";
const ROTATED_LOG_FILE_NAME: &str = "chat-composer.log.1";
const DEFAULT_LOG_FILTER: &str = "info,chat_composer=debug";
const MAX_LOG_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const DEFAULT_TAIL_LINES: usize = 20;

#[derive(Debug, Clone)]
pub struct LoggingState {
    log_file_path: PathBuf,
    filter: String,
}

impl LoggingState {
    pub fn new(log_file_path: PathBuf, filter: impl Into<String>) -> Self {
        Self {
            log_file_path,
            filter: filter.into(),
        }
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Last `count` lines of the current log file, oldest first.
    pub fn tail(&self, count: usize) -> Result<Vec<String>, String> {
        let contents = read_log_file(&self.log_file_path)?;
        Ok(last_lines(&contents, count))
    }
}

/// Installs the global subscriber. The file gets everything the filter admits;
/// the terminal only gets warnings and errors.
pub fn initialize(data_dir: &Path) -> Result<LoggingState, String> {
    fs::create_dir_all(data_dir).map_err(|error| {
        format!(
            "Failed to create data directory `{}`: {error}",
            data_dir.display()
        )
    })?;

    let log_file_path = data_dir.join(LOG_FILE_NAME);
    let rotated = rotate_if_oversized(&log_file_path, MAX_LOG_FILE_BYTES)?;
    let log_file = open_for_append(&log_file_path)?;

    let (env_filter, filter) = match EnvFilter::try_from_default_env() {
        Ok(env_filter) => {
            let filter = env_filter.to_string();
            (env_filter, filter)
        }
        Err(_) => (
            EnvFilter::new(DEFAULT_LOG_FILTER),
            DEFAULT_LOG_FILTER.to_string(),
        ),
    };

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(true)
                .with_writer(Arc::new(log_file)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(io::stderr.with_max_level(Level::WARN)),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|error| format!("Failed to initialize diagnostics logger: {error}"))?;

    info!(
        log_file = %log_file_path.display(),
        filter = %filter,
        rotated,
        "diagnostic logging initialized"
    );
    Ok(LoggingState::new(log_file_path, filter))
}

fn open_for_append(log_file_path: &Path) -> Result<File, String> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path)
        .map_err(|error| {
            format!(
                "Failed to open diagnostics log file `{}`: {error}",
                log_file_path.display()
            )
        })
}

/// Moves an oversized log aside, replacing any earlier rotation. Returns
/// whether a rotation happened.
fn rotate_if_oversized(log_file_path: &Path, max_bytes: u64) -> Result<bool, String> {
    let size = match fs::metadata(log_file_path) {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(error) => {
            return Err(format!(
                "Failed to inspect diagnostics log file `{}`: {error}",
                log_file_path.display()
            ))
        }
    };

    if size <= max_bytes {
        return Ok(false);
    }

    let rotated_path = log_file_path.with_file_name(ROTATED_LOG_FILE_NAME);
    fs::rename(log_file_path, &rotated_path).map_err(|error| {
        format!(
            "Failed to rotate diagnostics log file `{}` to `{}`: {error}",
            log_file_path.display(),
            rotated_path.display()
        )
    })?;

    Ok(true)
}

fn read_log_file(log_file_path: &Path) -> Result<String, String> {
    match fs::read(log_file_path) {
        Ok(contents) => Ok(String::from_utf8_lossy(&contents).into_owned()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(error) => Err(format!(
            "Failed to read diagnostics log file `{}`: {error}",
            log_file_path.display()
        )),
    }
}

fn last_lines(contents: &str, count: usize) -> Vec<String> {
    let mut lines = contents
        .lines()
        .rev()
        .take(count)
        .map(str::to_string)
        .collect::<Vec<_>>();
    lines.reverse();
    lines
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should progress")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("chat-composer-{prefix}-{nanos}"));
        fs::create_dir_all(&dir).expect("temp dir should be created");
        dir
    }

    #[test]
    fn oversized_log_is_rotated_aside() {
        let dir = temp_dir("log-rotate");
        let path = dir.join(LOG_FILE_NAME);
        fs::write(dir.join(ROTATED_LOG_FILE_NAME), "older run\n").expect("should seed rotation");
        fs::write(&path, "x".repeat(1024)).expect("should write test log file");

        assert!(rotate_if_oversized(&path, 128).expect("rotation should succeed"));

        assert!(!path.exists());
        let rotated =
            fs::read_to_string(dir.join(ROTATED_LOG_FILE_NAME)).expect("rotated log should exist");
        assert_eq!(rotated.len(), 1024);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn small_or_missing_log_is_left_alone() {
        let dir = temp_dir("log-small");
        let path = dir.join(LOG_FILE_NAME);

        assert!(!rotate_if_oversized(&path, 128).expect("missing log is fine"));

        fs::write(&path, "send started\n").expect("should write test log file");
        assert!(!rotate_if_oversized(&path, 128).expect("small log is fine"));
        assert_eq!(
            fs::read_to_string(&path).expect("log should still exist"),
            "send started\n"
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tail_returns_most_recent_lines_in_order() {
        let dir = temp_dir("log-tail");
        let path = dir.join(LOG_FILE_NAME);
        fs::write(&path, "one\ntwo\nthree\nfour\n").expect("should write test log file");
        let state = LoggingState::new(path, DEFAULT_LOG_FILTER);

        assert_eq!(
            state.tail(2).expect("tail should succeed"),
            vec!["three".to_string(), "four".to_string()]
        );
        assert_eq!(state.tail(10).expect("tail should succeed").len(), 4);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn tail_of_missing_log_is_empty() {
        let dir = temp_dir("log-missing");
        let state = LoggingState::new(dir.join(LOG_FILE_NAME), DEFAULT_LOG_FILTER);

        assert!(state.tail(5).expect("tail should succeed").is_empty());
        let _ = fs::remove_dir_all(dir);
    }
}
