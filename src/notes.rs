use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DOCUMENT_VERSION: u32 = 1;

/// Name of the per-user document holding every dated note.
pub const NOTES_DOCUMENT: &str = "notes";

/// Persisted form of the notes: short-key to non-empty text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesDocument {
    pub version: u32,
    pub notes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    Versioned(NotesDocument),
    Legacy(BTreeMap<String, String>),
}

impl NotesDocument {
    pub fn new(notes: BTreeMap<String, String>) -> Self {
        NotesDocument {
            version: DOCUMENT_VERSION,
            notes,
        }
    }

    /// Accepts the versioned layout and the older flat `{"YYYY-MM-DD": text}` object.
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        let mut doc = match serde_json::from_str::<StoredDocument>(data)? {
            StoredDocument::Versioned(doc) => doc,
            StoredDocument::Legacy(notes) => NotesDocument::new(notes),
        };
        doc.notes.retain(|_, text| !text.is_empty());
        Ok(doc)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoteChange {
    Set,
    Removed,
    Unchanged,
}

/// In-memory notes keyed by short-key. Empty text is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotesStore {
    notes: BTreeMap<String, String>,
}

impl NotesStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// Empty text removes the key.
    pub fn set(&mut self, key: &str, text: &str) -> NoteChange {
        if text.is_empty() {
            return match self.notes.remove(key) {
                Some(_) => NoteChange::Removed,
                None => NoteChange::Unchanged,
            };
        }
        match self.notes.get(key) {
            Some(existing) if existing == text => NoteChange::Unchanged,
            _ => {
                self.notes.insert(key.to_string(), text.to_string());
                NoteChange::Set
            }
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.notes.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.notes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    /// Union with `doc`; remote values win on overlapping keys and local-only
    /// keys survive. Returns how many keys changed.
    pub fn merge(&mut self, doc: &NotesDocument) -> usize {
        let mut changed = 0;
        for (key, text) in &doc.notes {
            if self.set(key, text) != NoteChange::Unchanged {
                changed += 1;
            }
        }
        changed
    }

    pub fn clear(&mut self) {
        self.notes.clear();
    }

    pub fn to_document(&self) -> NotesDocument {
        NotesDocument::new(self.notes.clone())
    }
}
