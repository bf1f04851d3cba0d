use crate::prefs::{Preferences, LAST_USER};
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const SESSION_USER: &str = "session_user";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
}

/// Single-machine identity provider. The signed-in user survives restarts
/// through the preference file; state changes are broadcast on a watch
/// channel whose receivers always start with the current state.
pub struct LocalAuth {
    prefs: Arc<Mutex<Preferences>>,
    state: watch::Sender<Option<Identity>>,
}

impl LocalAuth {
    pub fn new(prefs: Arc<Mutex<Preferences>>) -> Self {
        let current = prefs
            .lock()
            .ok()
            .and_then(|p| p.get(SESSION_USER).map(str::to_string))
            .map(|user_id| Identity { user_id });
        let (state, _) = watch::channel(current);
        LocalAuth { prefs, state }
    }

    pub fn current(&self) -> Option<Identity> {
        self.state.borrow().clone()
    }

    /// User that signed in most recently, even if signed out since.
    pub fn remembered_user(&self) -> Option<String> {
        self.prefs
            .lock()
            .ok()
            .and_then(|p| p.get(LAST_USER).map(str::to_string))
    }

    pub fn login(&self, user_id: &str) -> Result<Identity> {
        let user_id = user_id.trim();
        if user_id.is_empty() || user_id.contains(['/', '\\']) || user_id.starts_with('.') {
            bail!("invalid user id: {:?}", user_id);
        }
        {
            let mut prefs = self
                .prefs
                .lock()
                .map_err(|_| anyhow::anyhow!("preferences lock poisoned"))?;
            prefs.set(SESSION_USER, user_id)?;
            prefs.set(LAST_USER, user_id)?;
        }
        let identity = Identity {
            user_id: user_id.to_string(),
        };
        tracing::info!(event = "auth_login", user = %identity.user_id);
        self.state.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    pub fn logout(&self) -> Result<()> {
        {
            let mut prefs = self
                .prefs
                .lock()
                .map_err(|_| anyhow::anyhow!("preferences lock poisoned"))?;
            prefs.remove(SESSION_USER)?;
        }
        tracing::info!(event = "auth_logout");
        self.state.send_replace(None);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.state.subscribe()
    }
}
