use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{TrackError, TrackResult};

/// Application name used to namespace the configuration directory.
pub static APP_NAME: &str = "git-track";

/// File name of the configuration file inside the configuration directory.
pub static CONFIG_FILE: &str = "config.json";

/// Runtime settings shared by the job runner and the tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Global switch; when off, `enable` is a no-op for every file.
    pub enabled: bool,
    /// Program used for every repository query.
    pub git: String,
    /// Quiet period a repository must observe before a refresh pass runs.
    #[serde(with = "crate::serde_helpers::duration")]
    pub debounce: Duration,
    /// Deadline for each git job issued by the tracker.
    #[serde(with = "crate::serde_helpers::duration")]
    pub job_timeout: Duration,
    /// Extra time a blocking wait allows on top of the job deadline.
    #[serde(with = "crate::serde_helpers::duration")]
    pub wait_grace: Duration,
    /// Environment overrides applied to every git job issued by the tracker.
    pub env: BTreeMap<String, String>,
    /// Buffer size of the outward broadcast channels.
    pub channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            git: "git".to_string(),
            debounce: Duration::from_millis(50),
            job_timeout: Duration::from_secs(10),
            wait_grace: Duration::from_millis(250),
            env: BTreeMap::new(),
            channel_capacity: 256,
        }
    }
}

impl Settings {
    /// Load settings from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults. A malformed file is an error that
    /// names the offending JSON path.
    #[tracing::instrument(name = "Loading settings", level = "debug")]
    pub fn load(path: Option<&Path>) -> TrackResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => config_dir()?.join(CONFIG_FILE),
        };
        match std::fs::read_to_string(&path) {
            Ok(raw) => Self::from_json(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse settings from a JSON document.
    pub fn from_json(raw: &str) -> TrackResult<Self> {
        let deserializer = &mut serde_json::Deserializer::from_str(raw);
        Ok(serde_path_to_error::deserialize(deserializer)?)
    }
}

/// Resolve the configuration directory from XDG or fallback environment hints.
pub fn config_dir() -> TrackResult<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        Ok(PathBuf::from(dir).join(APP_NAME))
    } else if let Some(home_dir) = env::home_dir() {
        Ok(home_dir.join(".config").join(APP_NAME))
    } else if let Ok(userprofile) = env::var("USERPROFILE") {
        Ok(PathBuf::from(userprofile).join(".config").join(APP_NAME))
    } else {
        Err(TrackError::DirNotFound(format!("~/.config/{APP_NAME}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings = Settings::from_json(r#"{"debounce": "120ms"}"#).unwrap();
        assert_eq!(settings.debounce, Duration::from_millis(120));
        assert_eq!(settings.job_timeout, Duration::from_secs(10));
        assert!(settings.enabled);
        assert_eq!(settings.git, "git");
    }

    #[test]
    fn malformed_field_names_its_path() {
        let err = Settings::from_json(r#"{"env": {"GIT_DIR": 3}}"#).unwrap_err();
        match err {
            TrackError::Config(e) => assert_eq!(e.path().to_string(), "env.GIT_DIR"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn loads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"enabled": false, "git": "/usr/bin/git"}"#).unwrap();
        let settings = Settings::load(Some(&path)).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.git, "/usr/bin/git");
    }
}
