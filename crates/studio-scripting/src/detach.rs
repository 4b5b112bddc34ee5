//! Callback detachment registry.
//!
//! Callback records are shared through `Arc`. A host call into a script
//! first obtains a [`CallbackGuard`] with [`CallbackRecord::enter`], which
//! refuses records that were already detached. When a script unloads, each
//! of its records is handed to [`DetachedCallbacks::detach`]; the registry
//! keeps it alive until [`DetachedCallbacks::reclaim`] finds no guard still
//! holding it, or until [`DetachedCallbacks::drain_and_free_all`] at
//! subsystem teardown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::script::ScriptLanguage;

pub type CallbackId = u64;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// One script-owned callback registration.
#[derive(Debug)]
pub struct CallbackRecord {
    id: CallbackId,
    event: String,
    owner: String,
    language: ScriptLanguage,
    removed: AtomicBool,
}

impl CallbackRecord {
    pub fn new(
        event: impl Into<String>,
        owner: impl Into<String>,
        language: ScriptLanguage,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed),
            event: event.into(),
            owner: owner.into(),
            language,
            removed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    /// Event name the callback was registered for.
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Path of the script that registered the callback.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    /// Pin the record for an in-flight call. `None` once detached.
    pub fn enter(self: &Arc<Self>) -> Option<CallbackGuard> {
        if self.is_removed() {
            return None;
        }
        Some(CallbackGuard {
            record: Arc::clone(self),
        })
    }
}

/// Keeps a [`CallbackRecord`] alive for the duration of one call.
#[derive(Debug)]
pub struct CallbackGuard {
    record: Arc<CallbackRecord>,
}

impl std::ops::Deref for CallbackGuard {
    type Target = CallbackRecord;

    fn deref(&self) -> &CallbackRecord {
        &self.record
    }
}

/// Records removed from live scripts and not yet freed.
#[derive(Debug, Default)]
pub struct DetachedCallbacks {
    records: Mutex<Vec<Arc<CallbackRecord>>>,
}

impl DetachedCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `record` removed and park it until no call holds it.
    ///
    /// A record enters the registry at most once; detaching it again is a
    /// no-op that returns false.
    pub fn detach(&self, record: Arc<CallbackRecord>) -> bool {
        let mut records = self.records.lock();
        if record.removed.swap(true, Ordering::AcqRel) {
            return false;
        }
        tracing::trace!(
            callback = record.id,
            event = %record.event,
            script = %record.owner,
            "Detached callback"
        );
        records.push(record);
        true
    }

    /// Free every detached record that no in-flight call still holds.
    /// Returns how many were freed.
    pub fn reclaim(&self) -> usize {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|record| Arc::strong_count(record) > 1);
        before - records.len()
    }

    /// Free every detached record unconditionally. Returns how many there were.
    pub fn drain_and_free_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.records.lock());
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
