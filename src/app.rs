use crate::auth::LocalAuth;
use crate::config::Config;
use crate::prefs::Preferences;
use crate::store::{CachedDocumentStore, FileDocumentStore};
use crate::sync::{AuthTransition, SyncCoordinator, SyncError};
use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

/// Everything a command or the TUI needs, built once at startup and passed
/// down by reference.
pub struct AppContext {
    pub config: Config,
    pub prefs: Arc<Mutex<Preferences>>,
    pub auth: LocalAuth,
    pub sync: Arc<SyncCoordinator>,
    pub runtime: Runtime,
}

impl AppContext {
    pub fn build(config: Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("starting async runtime")?;
        let prefs = Arc::new(Mutex::new(Preferences::open(
            &config.prefs_path,
            &config.app_id,
        )?));

        if let Err(err) = std::fs::create_dir_all(&config.store_dir) {
            tracing::warn!(event = "store_dir_unavailable", path = %config.store_dir.display(), error = %err);
        }
        let remote = FileDocumentStore::new(&config.store_dir);
        let store = CachedDocumentStore::new(remote, &config.cache_dir)
            .context("opening document cache")?;
        let sync = Arc::new(SyncCoordinator::new(Arc::new(store), config.app_id.clone()));

        let auth = LocalAuth::new(prefs.clone());
        if let Some(user) = config.user.as_deref() {
            if auth.current().map(|i| i.user_id) != Some(user.to_string()) {
                auth.login(user)?;
            }
        }

        Ok(AppContext {
            config,
            prefs,
            auth,
            sync,
            runtime,
        })
    }

    /// Hands the current identity to the coordinator and waits for the
    /// resulting load. Used by one-shot commands.
    pub fn start_session(&self) -> Result<AuthTransition, SyncError> {
        self.runtime
            .block_on(self.sync.handle_auth_change(self.auth.current()))
    }

    /// Keeps the coordinator following auth changes in the background.
    pub fn spawn_auth_watch(&self) {
        self.runtime
            .spawn(self.sync.clone().watch_auth(self.auth.subscribe()));
    }
}
