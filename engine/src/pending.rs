//! Registry of listeners waiting on media.
//!
//! The host owns one registry per session and hands it to the collaborators
//! that care. An export notifies it once per media source when that media has
//! either reached its destination or failed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use uuid::Uuid;

/// What became of a media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaStatus {
    Exported { destination: PathBuf },
    Failed { reason: String },
}

pub type ListenerId = Uuid;

type Listener = Box<dyn Fn(&Path, &MediaStatus) + Send>;

#[derive(Default)]
pub struct PendingMediaRegistry {
    listeners: Mutex<HashMap<PathBuf, Vec<(ListenerId, Listener)>>>,
}

impl PendingMediaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `media`. The returned id unregisters it.
    pub fn register<F>(&self, media: impl Into<PathBuf>, listener: F) -> ListenerId
    where
        F: Fn(&Path, &MediaStatus) + Send + 'static,
    {
        let id = Uuid::new_v4();
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners
            .entry(media.into())
            .or_default()
            .push((id, Box::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;
        listeners.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Call every listener registered for `media`; returns how many ran.
    pub fn notify(&self, media: &Path, status: &MediaStatus) -> usize {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        match listeners.get(media) {
            Some(entries) => {
                for (_, listener) in entries {
                    listener(media, status);
                }
                entries.len()
            }
            None => 0,
        }
    }

    pub fn is_pending(&self, media: &Path) -> bool {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.contains_key(media)
    }
}

impl std::fmt::Debug for PendingMediaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .listeners
            .lock()
            .map(|l| l.values().map(Vec::len).sum::<usize>())
            .unwrap_or(0);
        f.debug_struct("PendingMediaRegistry")
            .field("listeners", &count)
            .finish()
    }
}
