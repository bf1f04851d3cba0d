//! Moves notes between the in-memory store and the per-user document.
//!
//! Saves, loads and auth transitions run one at a time in arrival order (the
//! operation lock is a fair FIFO), so a save issued while a load is in flight
//! applies its edit after the load has merged, and its full-document write
//! carries the merged result. A sign-in and its first load share one turn,
//! and saves are refused until a load for the current identity has
//! succeeded, so a full-document write never replaces remote notes that
//! were not read first. The notes map itself sits behind a plain mutex that
//! is never held across an await point.
//!
//! Outcomes are reported twice: as the return value of each operation and as
//! a [`SyncEvent`] for subscribers (the TUI reacts to the events).

use crate::auth::Identity;
use crate::events::Subscribers;
use crate::notes::{NoteChange, NotesDocument, NotesStore, NOTES_DOCUMENT};
use crate::store::{DocumentId, DocumentStore, StoreError};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("not signed in")]
    Unauthenticated,
    #[error("notes have not been loaded for this session")]
    NotLoaded,
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("remote document is malformed: {0}")]
    Malformed(String),
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::RemoteUnavailable(err.to_string())
    }
}

/// Read-only copy of the starred key set. Higher `seq` is newer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StarredSnapshot {
    pub seq: u64,
    pub keys: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Saved {
        key: String,
        snapshot: StarredSnapshot,
    },
    SaveFailed {
        key: String,
        error: SyncError,
    },
    Loaded {
        merged: usize,
        snapshot: StarredSnapshot,
    },
    /// No remote document exists yet. Not an error.
    Empty,
    LoadFailed {
        error: SyncError,
    },
    SignedOut {
        snapshot: StarredSnapshot,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded {
        merged: usize,
        snapshot: StarredSnapshot,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthTransition {
    Unchanged,
    SignedIn(Identity),
    Switched(Identity),
    SignedOut,
}

pub struct SyncCoordinator {
    store: Arc<dyn DocumentStore>,
    app_id: String,
    notes: Mutex<NotesStore>,
    identity: Mutex<Option<Identity>>,
    loaded: AtomicBool,
    turn: tokio::sync::Mutex<()>,
    seq: AtomicU64,
    subscribers: Mutex<Subscribers<SyncEvent>>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, app_id: impl Into<String>) -> Self {
        SyncCoordinator {
            store,
            app_id: app_id.into(),
            notes: Mutex::new(NotesStore::new()),
            identity: Mutex::new(None),
            loaded: AtomicBool::new(false),
            turn: tokio::sync::Mutex::new(()),
            seq: AtomicU64::new(0),
            subscribers: Mutex::new(Subscribers::new()),
        }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SyncEvent> {
        lock(&self.subscribers).subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        lock(&self.identity).clone()
    }

    /// True once a load for the current identity has returned the remote
    /// document (or found none). Saves are refused until then.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn note(&self, key: &str) -> Option<String> {
        lock(&self.notes).get(key).map(str::to_string)
    }

    pub fn notes(&self) -> Vec<(String, String)> {
        lock(&self.notes)
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    pub fn snapshot(&self) -> StarredSnapshot {
        let keys = lock(&self.notes).keys();
        StarredSnapshot {
            seq: self.seq.fetch_add(1, Ordering::SeqCst) + 1,
            keys,
        }
    }

    /// Writes the whole store to the diagnostic log.
    pub fn log_dump(&self) {
        let notes = self.notes();
        tracing::info!(event = "store_dump", count = notes.len(), user = ?self.identity().map(|i| i.user_id));
        for (key, text) in notes {
            tracing::info!(event = "store_dump_entry", %key, chars = text.chars().count(), %text);
        }
    }

    fn publish(&self, event: SyncEvent) {
        lock(&self.subscribers).publish(event);
    }

    fn document_id(&self) -> Result<DocumentId, SyncError> {
        let identity = self.identity().ok_or(SyncError::Unauthenticated)?;
        Ok(DocumentId::new(
            identity.user_id,
            self.app_id.clone(),
            NOTES_DOCUMENT,
        ))
    }

    /// Sets (or, for empty text, removes) a note and writes the full store.
    ///
    /// A failed remote write keeps the local edit. Without an identity, or
    /// before the remote notes have been loaded, nothing changes.
    pub async fn save(&self, key: &str, text: &str) -> Result<StarredSnapshot, SyncError> {
        let _turn = self.turn.lock().await;
        let result = self.save_in_turn(key, text).await;
        match &result {
            Ok(snapshot) => {
                tracing::info!(event = "notes_saved", %key, notes = snapshot.keys.len(), seq = snapshot.seq);
                self.publish(SyncEvent::Saved {
                    key: key.to_string(),
                    snapshot: snapshot.clone(),
                });
            }
            Err(error) => {
                tracing::error!(event = "notes_save_failed", %key, %error);
                self.publish(SyncEvent::SaveFailed {
                    key: key.to_string(),
                    error: error.clone(),
                });
            }
        }
        result
    }

    async fn save_in_turn(&self, key: &str, text: &str) -> Result<StarredSnapshot, SyncError> {
        let id = self.document_id()?;
        if !self.is_loaded() {
            return Err(SyncError::NotLoaded);
        }
        let (change, document) = {
            let mut notes = lock(&self.notes);
            let change = notes.set(key, text);
            (change, notes.to_document())
        };
        if change != NoteChange::Unchanged {
            tracing::debug!(event = "note_changed", %key, ?change);
        }
        let body = document
            .to_json()
            .map_err(|err| SyncError::Malformed(err.to_string()))?;
        self.store.write(&id, &body).await?;
        Ok(self.snapshot())
    }

    /// Reads the remote document and merges it into the store (remote wins on
    /// shared keys, local-only keys are kept).
    pub async fn load(&self) -> Result<LoadOutcome, SyncError> {
        let _turn = self.turn.lock().await;
        let result = self.load_in_turn().await;
        self.report_load(&result);
        result
    }

    fn report_load(&self, result: &Result<LoadOutcome, SyncError>) {
        match result {
            Ok(LoadOutcome::Loaded { merged, snapshot }) => {
                tracing::info!(event = "notes_loaded", merged, notes = snapshot.keys.len(), seq = snapshot.seq);
                self.publish(SyncEvent::Loaded {
                    merged: *merged,
                    snapshot: snapshot.clone(),
                });
            }
            Ok(LoadOutcome::Empty) => {
                tracing::info!(event = "notes_document_absent");
                self.publish(SyncEvent::Empty);
            }
            Err(error) => {
                tracing::error!(event = "notes_load_failed", %error);
                self.publish(SyncEvent::LoadFailed {
                    error: error.clone(),
                });
            }
        }
    }

    async fn load_in_turn(&self) -> Result<LoadOutcome, SyncError> {
        let id = self.document_id()?;
        let body = match self.store.read(&id).await? {
            Some(body) => body,
            None => {
                self.loaded.store(true, Ordering::SeqCst);
                return Ok(LoadOutcome::Empty);
            }
        };
        let document =
            NotesDocument::from_json(&body).map_err(|err| SyncError::Malformed(err.to_string()))?;
        let merged = lock(&self.notes).merge(&document);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(LoadOutcome::Loaded {
            merged,
            snapshot: self.snapshot(),
        })
    }

    /// Records an identity change. Repeated notifications with the same
    /// identity are no-ops. Leaving a session drops the in-memory notes.
    pub async fn on_auth_change(&self, identity: Option<Identity>) -> AuthTransition {
        let _turn = self.turn.lock().await;
        self.transition_in_turn(identity)
    }

    fn transition_in_turn(&self, identity: Option<Identity>) -> AuthTransition {
        let previous = {
            let mut current = lock(&self.identity);
            if *current == identity {
                return AuthTransition::Unchanged;
            }
            self.loaded.store(false, Ordering::SeqCst);
            std::mem::replace(&mut *current, identity.clone())
        };
        if previous.is_some() {
            lock(&self.notes).clear();
        }
        match (previous, identity) {
            (_, None) => {
                tracing::info!(event = "session_ended");
                let snapshot = self.snapshot();
                self.publish(SyncEvent::SignedOut { snapshot });
                AuthTransition::SignedOut
            }
            (None, Some(identity)) => {
                tracing::info!(event = "session_started", user = %identity.user_id);
                AuthTransition::SignedIn(identity)
            }
            (Some(_), Some(identity)) => {
                tracing::info!(event = "session_switched", user = %identity.user_id);
                AuthTransition::Switched(identity)
            }
        }
    }

    /// Applies an identity change and, when a session begins, loads the
    /// user's notes in the same turn. A failed load is returned (and
    /// published); the session stays signed in but refuses saves until a
    /// later [`SyncCoordinator::load`] succeeds.
    pub async fn handle_auth_change(
        &self,
        identity: Option<Identity>,
    ) -> Result<AuthTransition, SyncError> {
        let _turn = self.turn.lock().await;
        let transition = self.transition_in_turn(identity);
        if matches!(
            transition,
            AuthTransition::SignedIn(_) | AuthTransition::Switched(_)
        ) {
            let result = self.load_in_turn().await;
            self.report_load(&result);
            result?;
        }
        Ok(transition)
    }

    /// Follows an auth state channel until its sender goes away. The current
    /// state is handled first, so this runs at least once.
    pub async fn watch_auth(self: Arc<Self>, mut rx: watch::Receiver<Option<Identity>>) {
        loop {
            let identity = rx.borrow_and_update().clone();
            // Load failures are already published as events.
            let _ = self.handle_auth_change(identity).await;
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct MemoryDocumentStore {
        docs: Mutex<HashMap<DocumentId, String>>,
        fail_writes: AtomicBool,
        fail_reads: AtomicBool,
        read_delay: Option<Duration>,
    }

    impl MemoryDocumentStore {
        fn with_doc(id: DocumentId, body: &str) -> Self {
            let store = MemoryDocumentStore::default();
            store.docs.lock().unwrap().insert(id, body.to_string());
            store
        }

        fn body(&self, id: &DocumentId) -> Option<String> {
            self.docs.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl DocumentStore for MemoryDocumentStore {
        async fn read(&self, id: &DocumentId) -> Result<Option<String>, StoreError> {
            if let Some(delay) = self.read_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("offline".into()));
            }
            Ok(self.body(id))
        }

        async fn write(&self, id: &DocumentId, body: &str) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("quota exceeded".into()));
            }
            self.docs
                .lock()
                .unwrap()
                .insert(id.clone(), body.to_string());
            Ok(())
        }
    }

    fn alice() -> Identity {
        Identity {
            user_id: "alice".into(),
        }
    }

    fn alice_doc() -> DocumentId {
        DocumentId::new("alice", "calnotes", NOTES_DOCUMENT)
    }

    async fn signed_in(store: Arc<MemoryDocumentStore>) -> SyncCoordinator {
        let sync = SyncCoordinator::new(store, "calnotes");
        let _ = sync.handle_auth_change(Some(alice())).await;
        sync
    }

    #[tokio::test]
    async fn save_sets_then_removes_a_note() {
        let store = Arc::new(MemoryDocumentStore::default());
        let sync = signed_in(store.clone()).await;

        let snapshot = sync.save("2025-07-01", "hello").await.unwrap();
        assert!(snapshot.keys.contains("2025-07-01"));
        assert_eq!(sync.note("2025-07-01").as_deref(), Some("hello"));

        let snapshot = sync.save("2025-07-01", "").await.unwrap();
        assert!(snapshot.keys.is_empty());
        assert_eq!(sync.note("2025-07-01"), None);
        sync.save("2025-07-01", "").await.unwrap();

        let written = NotesDocument::from_json(&store.body(&alice_doc()).unwrap()).unwrap();
        assert!(written.notes.is_empty());
    }

    #[tokio::test]
    async fn failed_write_keeps_local_edit_and_signals() {
        let store = Arc::new(MemoryDocumentStore::default());
        store.fail_writes.store(true, Ordering::SeqCst);
        let sync = signed_in(store.clone()).await;
        let mut events = sync.subscribe();

        let result = sync.save("2025-07-01", "kept").await;
        assert!(matches!(result, Err(SyncError::RemoteUnavailable(_))));
        assert_eq!(sync.note("2025-07-01").as_deref(), Some("kept"));
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::SaveFailed { ref key, .. } if key == "2025-07-01"
        ));
        assert!(store.body(&alice_doc()).is_none());
    }

    #[tokio::test]
    async fn save_without_identity_changes_nothing() {
        let store = Arc::new(MemoryDocumentStore::default());
        let sync = SyncCoordinator::new(store, "calnotes");
        let mut events = sync.subscribe();
        assert_eq!(
            sync.save("2025-07-01", "x").await,
            Err(SyncError::Unauthenticated)
        );
        assert_eq!(sync.note("2025-07-01"), None);
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::SaveFailed {
                error: SyncError::Unauthenticated,
                ..
            }
        ));
        assert_eq!(sync.load().await, Err(SyncError::Unauthenticated));
    }

    #[tokio::test]
    async fn load_merges_additively() {
        let store = Arc::new(MemoryDocumentStore::with_doc(
            alice_doc(),
            r#"{"2025-01-01":"a"}"#,
        ));
        let sync = signed_in(store.clone()).await;
        assert_eq!(sync.note("2025-01-01").as_deref(), Some("a"));
        // Local-only edit made while the remote write failed.
        store.fail_writes.store(true, Ordering::SeqCst);
        let _ = sync.save("2025-02-02", "b").await;
        // Another device rewrote the remote document meanwhile.
        store.docs.lock().unwrap().insert(
            alice_doc(),
            r#"{"2025-01-01":"a2","2025-03-03":"c"}"#.to_string(),
        );

        let outcome = sync.load().await.unwrap();
        let LoadOutcome::Loaded { merged, snapshot } = outcome else {
            panic!("expected a loaded document");
        };
        assert_eq!(merged, 2);
        assert_eq!(
            snapshot.keys.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["2025-01-01", "2025-02-02", "2025-03-03"]
        );
        assert_eq!(sync.note("2025-01-01").as_deref(), Some("a2"));
        assert_eq!(sync.note("2025-02-02").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn absent_document_is_empty_not_error() {
        let store = Arc::new(MemoryDocumentStore::default());
        let sync = signed_in(store).await;
        let mut events = sync.subscribe();
        assert_eq!(sync.load().await, Ok(LoadOutcome::Empty));
        assert_eq!(events.try_recv().unwrap(), SyncEvent::Empty);
    }

    #[tokio::test]
    async fn failed_load_leaves_store_untouched() {
        let store = Arc::new(MemoryDocumentStore::default());
        let sync = signed_in(store.clone()).await;
        sync.save("2025-03-03", "c").await.unwrap();
        store.fail_reads.store(true, Ordering::SeqCst);
        let mut events = sync.subscribe();
        assert!(matches!(
            sync.load().await,
            Err(SyncError::RemoteUnavailable(_))
        ));
        assert_eq!(sync.note("2025-03-03").as_deref(), Some("c"));
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::LoadFailed { .. }
        ));
    }

    #[tokio::test]
    async fn malformed_document_is_reported() {
        let store = Arc::new(MemoryDocumentStore::with_doc(alice_doc(), "[1, 2]"));
        let sync = signed_in(store).await;
        assert!(matches!(sync.load().await, Err(SyncError::Malformed(_))));
    }

    #[tokio::test]
    async fn save_issued_during_load_is_queued_behind_it() {
        let store = Arc::new(MemoryDocumentStore {
            read_delay: Some(Duration::from_millis(50)),
            ..MemoryDocumentStore::with_doc(
                alice_doc(),
                r#"{"2025-01-01":"remote","2025-01-02":"other"}"#,
            )
        });
        let sync = Arc::new(signed_in(store.clone()).await);
        let mut events = sync.subscribe();

        let loader = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.load().await })
        };
        tokio::task::yield_now().await;
        let saved = sync.save("2025-01-01", "local edit").await.unwrap();
        let loaded = loader.await.unwrap().unwrap();

        let LoadOutcome::Loaded { snapshot, .. } = loaded else {
            panic!("expected a loaded document");
        };
        assert!(snapshot.seq < saved.seq);
        assert_eq!(sync.note("2025-01-01").as_deref(), Some("local edit"));
        let written = NotesDocument::from_json(&store.body(&alice_doc()).unwrap()).unwrap();
        assert_eq!(
            written.notes.get("2025-01-01").map(String::as_str),
            Some("local edit")
        );
        assert_eq!(
            written.notes.get("2025-01-02").map(String::as_str),
            Some("other")
        );
        assert!(matches!(events.try_recv().unwrap(), SyncEvent::Loaded { .. }));
        assert!(matches!(events.try_recv().unwrap(), SyncEvent::Saved { .. }));
    }

    #[tokio::test]
    async fn save_is_refused_until_the_first_load_succeeds() {
        let store = Arc::new(MemoryDocumentStore::with_doc(
            alice_doc(),
            r#"{"2025-01-01":"a","2025-01-02":"b"}"#,
        ));
        store.fail_reads.store(true, Ordering::SeqCst);
        let sync = SyncCoordinator::new(store.clone(), "calnotes");

        assert!(matches!(
            sync.handle_auth_change(Some(alice())).await,
            Err(SyncError::RemoteUnavailable(_))
        ));
        assert_eq!(sync.identity(), Some(alice()));
        assert!(!sync.is_loaded());
        assert_eq!(
            sync.save("2025-03-03", "c").await,
            Err(SyncError::NotLoaded)
        );
        assert_eq!(sync.note("2025-03-03"), None);

        store.fail_reads.store(false, Ordering::SeqCst);
        sync.load().await.unwrap();
        sync.save("2025-03-03", "c").await.unwrap();
        let written = NotesDocument::from_json(&store.body(&alice_doc()).unwrap()).unwrap();
        assert_eq!(
            written.notes.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["2025-01-01", "2025-01-02", "2025-03-03"]
        );
    }

    #[tokio::test]
    async fn save_queued_during_sign_in_runs_after_the_first_load() {
        let store = Arc::new(MemoryDocumentStore::with_doc(
            alice_doc(),
            r#"{"2025-01-01":"a","2025-01-02":"b"}"#,
        ));
        let sync = Arc::new(SyncCoordinator::new(store.clone(), "calnotes"));

        // Hold the operation lock so both tasks queue in a known order.
        let held = sync.turn.lock().await;
        let auth = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.handle_auth_change(Some(alice())).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let saver = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.save("2025-03-03", "c").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(
            auth.await.unwrap(),
            Ok(AuthTransition::SignedIn(alice()))
        );
        saver.await.unwrap().unwrap();
        let written = NotesDocument::from_json(&store.body(&alice_doc()).unwrap()).unwrap();
        assert_eq!(
            written.notes.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["2025-01-01", "2025-01-02", "2025-03-03"]
        );
    }

    #[tokio::test]
    async fn identity_change_alone_does_not_count_as_loaded() {
        let store = Arc::new(MemoryDocumentStore::default());
        let sync = SyncCoordinator::new(store.clone(), "calnotes");
        assert_eq!(
            sync.on_auth_change(Some(alice())).await,
            AuthTransition::SignedIn(alice())
        );
        assert!(!sync.is_loaded());
        assert_eq!(sync.save("2025-07-01", "x").await, Err(SyncError::NotLoaded));
        assert!(store.body(&alice_doc()).is_none());
        assert_eq!(sync.load().await, Ok(LoadOutcome::Empty));
        assert!(sync.is_loaded());
    }

    #[test]
    fn store_failures_surface_as_remote_unavailable() {
        let err = SyncError::from(StoreError::InvalidId("users/..".into()));
        assert!(matches!(err, SyncError::RemoteUnavailable(ref m) if m.contains("users/..")));
    }

    #[tokio::test]
    async fn duplicate_auth_notifications_are_ignored() {
        let store = Arc::new(MemoryDocumentStore::with_doc(
            alice_doc(),
            r#"{"2025-01-01":"a"}"#,
        ));
        let sync = SyncCoordinator::new(store, "calnotes");
        assert_eq!(
            sync.handle_auth_change(None).await,
            Ok(AuthTransition::Unchanged)
        );
        assert_eq!(
            sync.handle_auth_change(Some(alice())).await,
            Ok(AuthTransition::SignedIn(alice()))
        );
        assert_eq!(
            sync.handle_auth_change(Some(alice())).await,
            Ok(AuthTransition::Unchanged)
        );
        assert_eq!(sync.notes().len(), 1);
        assert!(sync.is_loaded());

        let mut events = sync.subscribe();
        assert_eq!(
            sync.handle_auth_change(None).await,
            Ok(AuthTransition::SignedOut)
        );
        assert!(sync.notes().is_empty());
        assert!(!sync.is_loaded());
        assert!(matches!(
            events.try_recv().unwrap(),
            SyncEvent::SignedOut { ref snapshot } if snapshot.keys.is_empty()
        ));
    }

    #[tokio::test]
    async fn watch_auth_loads_for_the_initial_identity() {
        let store = Arc::new(MemoryDocumentStore::with_doc(
            alice_doc(),
            r#"{"2025-01-01":"a"}"#,
        ));
        let sync = Arc::new(SyncCoordinator::new(store, "calnotes"));
        let mut events = sync.subscribe();
        let (tx, rx) = watch::channel(Some(alice()));
        let watcher = tokio::spawn(sync.clone().watch_auth(rx));

        assert!(matches!(events.recv().await, Some(SyncEvent::Loaded { .. })));
        assert_eq!(sync.note("2025-01-01").as_deref(), Some("a"));

        tx.send_replace(None);
        assert!(matches!(events.recv().await, Some(SyncEvent::SignedOut { .. })));
        drop(tx);
        watcher.await.unwrap();
    }
}
