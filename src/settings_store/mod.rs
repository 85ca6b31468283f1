use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    input_controller::RecordingMode, scroll_coordinator::ScrollConfig,
    send_pipeline::RetryPolicy,
};

pub const RECORDING_MODE_HOLD_TO_TALK: &str = "hold_to_talk";
pub const RECORDING_MODE_TOGGLE: &str = "toggle";
pub const DEFAULT_SCROLL_THROTTLE_MS: u64 = 300;
pub const DEFAULT_SEND_RETRY_DELAY_MS: u64 = 500;
pub const DEFAULT_SEND_MAX_ATTEMPTS: u32 = 2;

const SETTINGS_FILE_NAME: &str = "settings.json";
const MAX_SCROLL_THROTTLE_MS: u64 = 5_000;
const MAX_SEND_RETRY_DELAY_MS: u64 = 60_000;
const MAX_SEND_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ComposerSettings {
    pub recording_mode: String,
    pub auto_scroll: bool,
    pub scroll_throttle_ms: u64,
    pub send_retry_delay_ms: u64,
    pub send_max_attempts: u32,
    pub backend_url: Option<String>,
}

impl Default for ComposerSettings {
    fn default() -> Self {
        Self {
            recording_mode: RECORDING_MODE_HOLD_TO_TALK.to_string(),
            auto_scroll: true,
            scroll_throttle_ms: DEFAULT_SCROLL_THROTTLE_MS,
            send_retry_delay_ms: DEFAULT_SEND_RETRY_DELAY_MS,
            send_max_attempts: DEFAULT_SEND_MAX_ATTEMPTS,
            backend_url: None,
        }
    }
}

impl ComposerSettings {
    pub fn recording_mode(&self) -> RecordingMode {
        match self.recording_mode.as_str() {
            RECORDING_MODE_TOGGLE => RecordingMode::Toggle,
            _ => RecordingMode::HoldToTalk,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.send_max_attempts,
            retry_delay: Duration::from_millis(self.send_retry_delay_ms),
        }
    }

    pub fn scroll_config(&self) -> ScrollConfig {
        ScrollConfig {
            auto_scroll: self.auto_scroll,
            min_interval: Duration::from_millis(self.scroll_throttle_ms),
        }
    }

    fn normalized(mut self) -> Result<Self, String> {
        self.recording_mode = normalize_recording_mode(self.recording_mode)?;
        self.scroll_throttle_ms =
            validate_at_most(self.scroll_throttle_ms, MAX_SCROLL_THROTTLE_MS, "scroll_throttle_ms")?;
        self.send_retry_delay_ms = validate_at_most(
            self.send_retry_delay_ms,
            MAX_SEND_RETRY_DELAY_MS,
            "send_retry_delay_ms",
        )?;
        self.send_max_attempts = validate_send_attempts(self.send_max_attempts)?;
        self.backend_url = normalize_backend_url(self.backend_url)?;

        Ok(self)
    }

    fn with_update(mut self, update: ComposerSettingsUpdate) -> Result<Self, String> {
        if let Some(recording_mode) = update.recording_mode {
            self.recording_mode = recording_mode;
        }

        if let Some(auto_scroll) = update.auto_scroll {
            self.auto_scroll = auto_scroll;
        }

        if let Some(scroll_throttle_ms) = update.scroll_throttle_ms {
            self.scroll_throttle_ms = scroll_throttle_ms;
        }

        if let Some(send_retry_delay_ms) = update.send_retry_delay_ms {
            self.send_retry_delay_ms = send_retry_delay_ms;
        }

        if let Some(send_max_attempts) = update.send_max_attempts {
            self.send_max_attempts = send_max_attempts;
        }

        if let Some(backend_url) = update.backend_url {
            self.backend_url = backend_url;
        }

        self.normalized()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ComposerSettingsUpdate {
    pub recording_mode: Option<String>,
    pub auto_scroll: Option<bool>,
    pub scroll_throttle_ms: Option<u64>,
    pub send_retry_delay_ms: Option<u64>,
    pub send_max_attempts: Option<u32>,
    pub backend_url: Option<Option<String>>,
}

impl ComposerSettingsUpdate {
    /// Builds a single-field update from a `key value` pair as typed by the
    /// user. `none` or an empty value clears `backend_url`.
    pub fn from_assignment(key: &str, value: &str) -> Result<Self, String> {
        let value = value.trim();
        let mut update = Self::default();

        match key.trim() {
            "recording_mode" => update.recording_mode = Some(value.to_string()),
            "auto_scroll" => update.auto_scroll = Some(parse_switch(value)?),
            "scroll_throttle_ms" => {
                update.scroll_throttle_ms = Some(parse_number(value, "scroll_throttle_ms")?)
            }
            "send_retry_delay_ms" => {
                update.send_retry_delay_ms = Some(parse_number(value, "send_retry_delay_ms")?)
            }
            "send_max_attempts" => {
                update.send_max_attempts = Some(parse_number(value, "send_max_attempts")?)
            }
            "backend_url" => {
                update.backend_url = Some(match value {
                    "" | "none" => None,
                    url => Some(url.to_string()),
                })
            }
            other => return Err(format!("Unknown setting `{other}`")),
        }

        Ok(update)
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    settings_path: PathBuf,
    io_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(settings_dir: &Path) -> Self {
        let settings_path = settings_dir.join(SETTINGS_FILE_NAME);
        debug!(path = %settings_path.display(), "settings store initialized");
        Self {
            settings_path,
            io_lock: Mutex::new(()),
        }
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn load(&self) -> Result<ComposerSettings, String> {
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        debug!(path = %self.settings_path.display(), "loading settings from disk");
        read_settings_file_with_recovery(&self.settings_path)
    }

    pub fn update(&self, update: ComposerSettingsUpdate) -> Result<ComposerSettings, String> {
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        debug!(path = %self.settings_path.display(), "updating settings on disk");
        let current_settings = read_settings_file_with_recovery(&self.settings_path)?;
        let updated_settings = current_settings.with_update(update)?;
        write_settings_file(&self.settings_path, &updated_settings)?;
        Ok(updated_settings)
    }
}

#[derive(Debug)]
struct SettingsReadError {
    message: String,
    recoverable: bool,
}

impl SettingsReadError {
    fn read(message: String) -> Self {
        Self {
            message,
            recoverable: false,
        }
    }

    fn malformed(message: String) -> Self {
        Self {
            message,
            recoverable: true,
        }
    }
}

fn read_settings_file_with_recovery(settings_path: &Path) -> Result<ComposerSettings, String> {
    match read_settings_file(settings_path) {
        Ok(settings) => Ok(settings),
        Err(error) if error.recoverable => {
            let backup_path = backup_corrupt_settings_file(settings_path)?;
            let defaults = ComposerSettings::default();
            write_settings_file(settings_path, &defaults)?;
            warn!(
                path = %settings_path.display(),
                backup = %backup_path.display(),
                reason = %error.message,
                "recovered malformed settings file"
            );
            Ok(defaults)
        }
        Err(error) => Err(error.message),
    }
}

fn read_settings_file(settings_path: &Path) -> Result<ComposerSettings, SettingsReadError> {
    if !settings_path.exists() {
        info!(path = %settings_path.display(), "settings file missing; using defaults");
        return Ok(ComposerSettings::default());
    }

    let file_contents = fs::read_to_string(settings_path)
        .map_err(|error| {
            format!(
                "Failed to read settings file `{}`: {error}",
                settings_path.display()
            )
        })
        .map_err(SettingsReadError::read)?;

    let parsed = serde_json::from_str::<ComposerSettings>(&file_contents).map_err(|error| {
        SettingsReadError::malformed(format!(
            "Failed to parse settings file `{}`: {error}",
            settings_path.display()
        ))
    })?;

    parsed.normalized().map_err(|error| {
        SettingsReadError::malformed(format!(
            "Failed to validate settings file `{}`: {error}",
            settings_path.display()
        ))
    })
}

fn write_settings_file(settings_path: &Path, settings: &ComposerSettings) -> Result<(), String> {
    if let Some(parent_dir) = settings_path.parent() {
        fs::create_dir_all(parent_dir).map_err(|error| {
            format!(
                "Failed to create settings directory `{}`: {error}",
                parent_dir.display()
            )
        })?;
    }

    let serialized = serde_json::to_vec_pretty(settings)
        .map_err(|error| format!("Failed to serialize settings: {error}"))?;
    write_atomic_file(settings_path, &serialized)?;

    info!(
        path = %settings_path.display(),
        recording_mode = %settings.recording_mode,
        auto_scroll = settings.auto_scroll,
        "settings file written"
    );
    Ok(())
}

fn write_atomic_file(file_path: &Path, contents: &[u8]) -> Result<(), String> {
    let temp_path = temp_file_path_for(file_path);
    let mut temp_file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|error| {
            format!(
                "Failed to create temp settings file `{}`: {error}",
                temp_path.display()
            )
        })?;

    if let Err(error) = temp_file.write_all(contents) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!(
            "Failed to write temp settings file `{}`: {error}",
            temp_path.display()
        ));
    }

    if let Err(error) = temp_file.sync_all() {
        let _ = fs::remove_file(&temp_path);
        return Err(format!(
            "Failed to flush temp settings file `{}`: {error}",
            temp_path.display()
        ));
    }

    drop(temp_file);

    fs::rename(&temp_path, file_path).map_err(|error| {
        let _ = fs::remove_file(&temp_path);
        format!(
            "Failed to finalize settings file `{}`: {error}",
            file_path.display()
        )
    })?;

    Ok(())
}

fn temp_file_path_for(file_path: &Path) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = file_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("settings.json");
    let pid = std::process::id();

    file_path.with_file_name(format!(".{file_name}.{pid}.{timestamp}.tmp"))
}

fn backup_corrupt_settings_file(settings_path: &Path) -> Result<PathBuf, String> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = settings_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("settings.json");
    let backup_path = settings_path.with_file_name(format!(
        "{file_name}.corrupt-{}-{timestamp}.bak",
        std::process::id()
    ));

    fs::rename(settings_path, &backup_path).map_err(|error| {
        format!(
            "Failed to backup malformed settings file `{}` to `{}`: {error}",
            settings_path.display(),
            backup_path.display()
        )
    })?;

    Ok(backup_path)
}

fn normalize_optional_string(value: Option<String>) -> Option<String> {
    value.and_then(|candidate| {
        let trimmed = candidate.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn normalize_required_string(value: String, field_name: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("`{field_name}` cannot be empty"));
    }

    Ok(trimmed.to_string())
}

fn normalize_recording_mode(value: String) -> Result<String, String> {
    let normalized = normalize_required_string(value, "recording_mode")?.to_lowercase();
    match normalized.as_str() {
        RECORDING_MODE_HOLD_TO_TALK | RECORDING_MODE_TOGGLE => Ok(normalized),
        _ => Err(format!(
            "Unsupported recording mode `{normalized}`. Expected `{RECORDING_MODE_HOLD_TO_TALK}` or `{RECORDING_MODE_TOGGLE}`"
        )),
    }
}

fn validate_at_most(value: u64, max: u64, field_name: &str) -> Result<u64, String> {
    if value > max {
        return Err(format!("`{field_name}` must be at most {max}, got {value}"));
    }

    Ok(value)
}

fn validate_send_attempts(value: u32) -> Result<u32, String> {
    if !(1..=MAX_SEND_ATTEMPTS).contains(&value) {
        return Err(format!(
            "`send_max_attempts` must be between 1 and {MAX_SEND_ATTEMPTS}, got {value}"
        ));
    }

    Ok(value)
}

fn normalize_backend_url(value: Option<String>) -> Result<Option<String>, String> {
    let Some(candidate) = normalize_optional_string(value) else {
        return Ok(None);
    };

    let url = Url::parse(&candidate)
        .map_err(|error| format!("Invalid `backend_url` `{candidate}`: {error}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!(
            "Unsupported `backend_url` scheme `{}`. Expected `http` or `https`",
            url.scheme()
        ));
    }

    Ok(Some(candidate.trim_end_matches('/').to_string()))
}

fn parse_switch(value: &str) -> Result<bool, String> {
    match value.to_lowercase().as_str() {
        "true" | "on" | "yes" => Ok(true),
        "false" | "off" | "no" => Ok(false),
        other => Err(format!("Expected `on` or `off`, got `{other}`")),
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, field_name: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("`{field_name}` expects a whole number, got `{value}`"))
}

fn io_lock_error() -> String {
    "Settings store IO lock was poisoned".to_string()
}

#[cfg(test)]
mod tests {
    use std::time::{SystemTime, UNIX_EPOCH};

    use super::*;

    fn unique_settings_dir(prefix: &str) -> PathBuf {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should move forward")
            .as_nanos();
        std::env::temp_dir().join(format!("chat-composer-settings-{prefix}-{timestamp}"))
    }

    fn cleanup_settings_dir(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    fn corrupt_backup_paths(settings_path: &Path) -> Vec<PathBuf> {
        let Some(parent_dir) = settings_path.parent() else {
            return Vec::new();
        };
        let Some(file_name) = settings_path.file_name().and_then(|name| name.to_str()) else {
            return Vec::new();
        };

        let mut backups = Vec::new();
        if let Ok(entries) = fs::read_dir(parent_dir) {
            for entry in entries.flatten() {
                if let Some(candidate) = entry.file_name().to_str() {
                    if candidate.starts_with(&format!("{file_name}.corrupt-"))
                        && candidate.ends_with(".bak")
                    {
                        backups.push(entry.path());
                    }
                }
            }
        }

        backups
    }

    fn write_raw_settings(dir: &Path, contents: &str) {
        fs::create_dir_all(dir).expect("settings directory should be created");
        fs::write(dir.join(SETTINGS_FILE_NAME), contents).expect("settings file should be written");
    }

    #[test]
    fn defaults_match_expected_schema() {
        let defaults = ComposerSettings::default();

        assert_eq!(defaults.recording_mode, RECORDING_MODE_HOLD_TO_TALK);
        assert_eq!(defaults.recording_mode(), RecordingMode::HoldToTalk);
        assert!(defaults.auto_scroll);
        assert_eq!(defaults.retry_policy(), RetryPolicy::default());
        assert_eq!(defaults.scroll_config(), ScrollConfig::default());
        assert_eq!(defaults.backend_url, None);
    }

    #[test]
    fn load_uses_defaults_when_settings_file_is_missing() {
        let dir = unique_settings_dir("missing");
        let store = SettingsStore::new(&dir);

        let loaded = store.load().expect("loading missing settings should succeed");

        assert_eq!(loaded, ComposerSettings::default());
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn load_backfills_fields_missing_from_older_files() {
        let dir = unique_settings_dir("partial");
        write_raw_settings(&dir, r#"{ "recording_mode": "toggle" }"#);
        let store = SettingsStore::new(&dir);

        let loaded = store.load().expect("partial settings should load");

        assert_eq!(loaded.recording_mode(), RecordingMode::Toggle);
        assert_eq!(loaded.send_max_attempts, DEFAULT_SEND_MAX_ATTEMPTS);
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn update_persists_settings_to_disk() {
        let dir = unique_settings_dir("persist");
        let store = SettingsStore::new(&dir);

        let updated = store
            .update(ComposerSettingsUpdate {
                recording_mode: Some(" Toggle ".to_string()),
                auto_scroll: Some(false),
                scroll_throttle_ms: Some(150),
                send_retry_delay_ms: Some(1_000),
                send_max_attempts: Some(3),
                backend_url: Some(Some("https://chat.example.com/".to_string())),
            })
            .expect("update should succeed");

        let reloaded =
            read_settings_file(store.settings_path()).expect("reloading persisted settings");

        assert_eq!(updated.recording_mode, RECORDING_MODE_TOGGLE);
        assert!(!updated.auto_scroll);
        assert_eq!(
            updated.retry_policy(),
            RetryPolicy {
                max_attempts: 3,
                retry_delay: Duration::from_secs(1),
            }
        );
        assert_eq!(updated.scroll_config().min_interval, Duration::from_millis(150));
        assert_eq!(updated.backend_url.as_deref(), Some("https://chat.example.com"));
        assert_eq!(reloaded, updated);
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn update_accepts_null_to_clear_backend_url() {
        let dir = unique_settings_dir("clear-url");
        let store = SettingsStore::new(&dir);

        store
            .update(ComposerSettingsUpdate {
                backend_url: Some(Some("http://localhost:9000".to_string())),
                ..ComposerSettingsUpdate::default()
            })
            .expect("initial update should succeed");
        let cleared = store
            .update(ComposerSettingsUpdate {
                backend_url: Some(None),
                ..ComposerSettingsUpdate::default()
            })
            .expect("clearing update should succeed");

        assert_eq!(cleared.backend_url, None);
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn update_rejects_invalid_values() {
        let dir = unique_settings_dir("invalid");
        let store = SettingsStore::new(&dir);

        let cases = [
            (
                ComposerSettingsUpdate {
                    recording_mode: Some("push".to_string()),
                    ..ComposerSettingsUpdate::default()
                },
                "Unsupported recording mode",
            ),
            (
                ComposerSettingsUpdate {
                    send_max_attempts: Some(0),
                    ..ComposerSettingsUpdate::default()
                },
                "send_max_attempts",
            ),
            (
                ComposerSettingsUpdate {
                    scroll_throttle_ms: Some(60_000),
                    ..ComposerSettingsUpdate::default()
                },
                "scroll_throttle_ms",
            ),
            (
                ComposerSettingsUpdate {
                    backend_url: Some(Some("ftp://chat.example.com".to_string())),
                    ..ComposerSettingsUpdate::default()
                },
                "Unsupported `backend_url` scheme",
            ),
        ];

        for (update, expected) in cases {
            let error = store.update(update).expect_err("invalid update should fail");
            assert!(error.contains(expected), "unexpected error: {error}");
        }
        assert_eq!(
            store.load().expect("settings should still load"),
            ComposerSettings::default()
        );
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn typed_assignments_become_single_field_updates() {
        let dir = unique_settings_dir("assign");
        let store = SettingsStore::new(&dir);

        for (key, value) in [
            ("recording_mode", "toggle"),
            ("auto_scroll", "off"),
            ("send_max_attempts", "3"),
            ("backend_url", "http://localhost:9000/"),
        ] {
            let update = ComposerSettingsUpdate::from_assignment(key, value)
                .expect("assignment should parse");
            store.update(update).expect("update should succeed");
        }
        let cleared = store
            .update(
                ComposerSettingsUpdate::from_assignment("backend_url", "none")
                    .expect("clearing assignment should parse"),
            )
            .expect("clearing update should succeed");

        assert_eq!(cleared.recording_mode(), RecordingMode::Toggle);
        assert!(!cleared.auto_scroll);
        assert_eq!(cleared.send_max_attempts, 3);
        assert_eq!(cleared.backend_url, None);
        assert_eq!(cleared.scroll_throttle_ms, DEFAULT_SCROLL_THROTTLE_MS);
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        for (key, value, expected) in [
            ("volume", "11", "Unknown setting"),
            ("auto_scroll", "maybe", "Expected `on` or `off`"),
            ("send_retry_delay_ms", "soon", "whole number"),
        ] {
            let error = ComposerSettingsUpdate::from_assignment(key, value)
                .expect_err("assignment should be rejected");
            assert!(error.contains(expected), "unexpected error: {error}");
        }
    }

    #[test]
    fn load_recovers_from_malformed_json_by_backing_up_and_resetting_defaults() {
        let dir = unique_settings_dir("malformed");
        write_raw_settings(&dir, "{ definitely not json");
        let store = SettingsStore::new(&dir);

        let recovered = store.load().expect("malformed settings should be recovered");

        assert_eq!(recovered, ComposerSettings::default());
        assert_eq!(
            read_settings_file(store.settings_path())
                .expect("recovered settings file should be readable"),
            ComposerSettings::default()
        );
        assert_eq!(corrupt_backup_paths(store.settings_path()).len(), 1);
        cleanup_settings_dir(&dir);
    }

    #[test]
    fn update_recovers_from_invalid_values_before_applying_changes() {
        let dir = unique_settings_dir("invalid-file");
        write_raw_settings(&dir, r#"{ "send_max_attempts": 99 }"#);
        let store = SettingsStore::new(&dir);

        let updated = store
            .update(ComposerSettingsUpdate {
                auto_scroll: Some(false),
                ..ComposerSettingsUpdate::default()
            })
            .expect("update should recover invalid settings");

        assert!(!updated.auto_scroll);
        assert_eq!(updated.send_max_attempts, DEFAULT_SEND_MAX_ATTEMPTS);
        assert_eq!(corrupt_backup_paths(store.settings_path()).len(), 1);
        cleanup_settings_dir(&dir);
    }
}
