//! Runtime configuration.
//!
//! Resolution order: built-in defaults under the platform project
//! directories, then an optional `config.yml` in the config directory, then
//! `CALNOTES_*` environment variables.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_APP_ID: &str = "calnotes";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Scopes the remote document path and preference keys.
    pub app_id: String,
    /// Root of the document store ("remote" side; may be a synced folder).
    pub store_dir: PathBuf,
    /// Local read-through/write-through cache of documents.
    pub cache_dir: PathBuf,
    pub log_dir: PathBuf,
    pub prefs_path: PathBuf,
    /// Identity to sign in as on startup, overriding the saved session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// Fields that may appear in `config.yml`; anything missing keeps its default.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    app_id: Option<String>,
    store_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    prefs_path: Option<PathBuf>,
    user: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", "calnotes").context("locating data directory")?;
        let mut config = Config::rooted(dirs.data_dir(), dirs.cache_dir(), dirs.config_dir());
        let file = dirs.config_dir().join("config.yml");
        if file.exists() {
            config.apply_file(&file)?;
        }
        config.apply_env(|name| env::var(name).ok());
        Ok(config)
    }

    pub fn rooted(data_dir: &Path, cache_dir: &Path, config_dir: &Path) -> Self {
        Config {
            app_id: DEFAULT_APP_ID.to_string(),
            store_dir: data_dir.join("store"),
            cache_dir: cache_dir.join("documents"),
            log_dir: data_dir.join("logs"),
            prefs_path: config_dir.join("prefs.yml"),
            user: None,
        }
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let data = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let file: ConfigFile = serde_yaml::from_str(&data).context("parsing config file")?;
        if let Some(v) = file.app_id {
            self.app_id = v;
        }
        if let Some(v) = file.store_dir {
            self.store_dir = v;
        }
        if let Some(v) = file.cache_dir {
            self.cache_dir = v;
        }
        if let Some(v) = file.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = file.prefs_path {
            self.prefs_path = v;
        }
        if file.user.is_some() {
            self.user = file.user;
        }
        Ok(())
    }

    fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| var(name).filter(|v| !v.trim().is_empty());
        if let Some(v) = non_empty("CALNOTES_APP_ID") {
            self.app_id = v;
        }
        if let Some(v) = non_empty("CALNOTES_STORE_DIR") {
            self.store_dir = v.into();
        }
        if let Some(v) = non_empty("CALNOTES_CACHE_DIR") {
            self.cache_dir = v.into();
        }
        if let Some(v) = non_empty("CALNOTES_LOG_DIR") {
            self.log_dir = v.into();
        }
        if let Some(v) = non_empty("CALNOTES_USER") {
            self.user = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base() -> Config {
        Config::rooted(Path::new("/d"), Path::new("/c"), Path::new("/cfg"))
    }

    #[test]
    fn defaults_live_under_project_dirs() {
        let config = base();
        assert_eq!(config.app_id, "calnotes");
        assert_eq!(config.store_dir, PathBuf::from("/d/store"));
        assert_eq!(config.cache_dir, PathBuf::from("/c/documents"));
        assert_eq!(config.prefs_path, PathBuf::from("/cfg/prefs.yml"));
    }

    #[test]
    fn file_then_env_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "app_id: work-notes\nstore_dir: /mnt/shared\nuser: carol\n").unwrap();

        let mut config = base();
        config.apply_file(&path).unwrap();
        assert_eq!(config.app_id, "work-notes");
        assert_eq!(config.store_dir, PathBuf::from("/mnt/shared"));
        assert_eq!(config.user.as_deref(), Some("carol"));

        let vars: HashMap<&str, &str> = [
            ("CALNOTES_STORE_DIR", "/srv/notes"),
            ("CALNOTES_USER", ""),
        ]
        .into_iter()
        .collect();
        config.apply_env(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(config.store_dir, PathBuf::from("/srv/notes"));
        assert_eq!(config.user.as_deref(), Some("carol"));
        assert_eq!(config.app_id, "work-notes");
    }
}
