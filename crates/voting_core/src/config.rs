use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use shared::domain::ParticipantId;
use tracing::warn;

pub const SETTINGS_FILE: &str = "voting.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub participant_id: Option<ParticipantId>,
    /// Full resync period while a session is ready. `None` or 0 disables it.
    pub resync_interval_secs: Option<u64>,
    pub event_buffer: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/voting.db".into(),
            participant_id: None,
            resync_interval_secs: None,
            event_buffer: 256,
        }
    }
}

impl Settings {
    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

pub fn load_settings() -> Settings {
    let settings = load_settings_file(Path::new(SETTINGS_FILE));
    apply_env_overrides(settings, |key| std::env::var(key).ok())
}

pub fn load_settings_file(path: &Path) -> Settings {
    let Ok(raw) = fs::read_to_string(path) else {
        return Settings::default();
    };
    match toml::from_str::<Settings>(&raw) {
        Ok(settings) => settings,
        Err(error) => {
            warn!(path = %path.display(), %error, "config: ignoring unreadable settings file");
            Settings::default()
        }
    }
}

pub fn apply_env_overrides<F>(mut settings: Settings, lookup: F) -> Settings
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = lookup("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = lookup("APP__PARTICIPANT_ID") {
        match v.parse::<ParticipantId>() {
            Ok(parsed) => settings.participant_id = Some(parsed),
            Err(error) => warn!(value = %v, %error, "config: invalid APP__PARTICIPANT_ID"),
        }
    }

    if let Some(v) = lookup("APP__RESYNC_INTERVAL_SECS") {
        match v.trim().parse::<u64>() {
            Ok(parsed) => settings.resync_interval_secs = Some(parsed),
            Err(error) => warn!(value = %v, %error, "config: invalid APP__RESYNC_INTERVAL_SECS"),
        }
    }

    if let Some(v) = lookup("APP__EVENT_BUFFER") {
        match v.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => settings.event_buffer = parsed,
            _ => warn!(value = %v, "config: invalid APP__EVENT_BUFFER"),
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
