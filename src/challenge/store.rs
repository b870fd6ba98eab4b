use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use serde::Serialize;

use super::ChallengeType;

/// Bound on the ready queue; `present` never blocks on slow consumers.
pub const DEFAULT_READY_CAPACITY: usize = 100;

/// A proof the engine has published, tracked independently of (and prior
/// to) CA confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChallengeRecord {
    #[serde(rename = "type")]
    pub challenge_type: ChallengeType,
    pub identifier: String,
    pub content: String,
    pub verified: bool,
    /// Token the proof was published for; used for cleanup scoping and
    /// front-end lookup, not part of the serialized diagnostic shape.
    #[serde(skip)]
    pub token: String,
}

impl ChallengeRecord {
    pub fn new(
        challenge_type: ChallengeType,
        identifier: impl Into<String>,
        content: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            challenge_type,
            identifier: identifier.into(),
            content: content.into(),
            verified: false,
            token: token.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Stored and queued for `next_ready`.
    Inserted,
    /// Same identifier and content already tracked; nothing changed.
    Duplicate,
    /// An unresolved record for the identifier holds a different proof.
    Conflict,
}

/// Thread-safe registry of published challenges for one challenge type.
/// One instance per type is constructed at startup and shared by `Arc`
/// reference: the issuance flow publishes into it while serving
/// collaborators (web front-end, DNS publisher, diagnostics) read from it.
pub struct ChallengeStore {
    records: Mutex<Vec<ChallengeRecord>>,
    ready_tx: SyncSender<ChallengeRecord>,
    ready_rx: Mutex<Receiver<ChallengeRecord>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_READY_CAPACITY)
    }

    pub fn with_capacity(ready_capacity: usize) -> Self {
        let (ready_tx, ready_rx) = sync_channel(ready_capacity);
        Self {
            records: Mutex::new(Vec::new()),
            ready_tx,
            ready_rx: Mutex::new(ready_rx),
        }
    }

    /// Inserts the record unless an identical one is already tracked.
    /// Repeat presents with the same identifier and content are no-ops; a
    /// different unresolved proof for the same identifier is a conflict.
    /// When the ready queue is full the notification is dropped and the
    /// record stays queryable through `exists`.
    pub fn present(&self, record: ChallengeRecord) -> PresentOutcome {
        let mut records = lock(&self.records);
        for existing in records.iter() {
            if existing.identifier == record.identifier {
                if existing.content == record.content {
                    return PresentOutcome::Duplicate;
                }
                if !existing.verified {
                    return PresentOutcome::Conflict;
                }
            }
        }
        records.push(record.clone());
        match self.ready_tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                warn!(
                    "[challenge-store] ready queue full; {} record for {} stays lookup-only",
                    record.challenge_type, record.identifier
                );
            }
            Err(TrySendError::Disconnected(record)) => {
                debug!(
                    "[challenge-store] ready queue closed while presenting {}",
                    record.identifier
                );
            }
        }
        PresentOutcome::Inserted
    }

    /// Removes any record matching the identifier and content. Absent
    /// records are fine; deletion is idempotent.
    pub fn clean_up(&self, identifier: &str, content: &str) {
        let mut records = lock(&self.records);
        records.retain(|record| !(record.identifier == identifier && record.content == content));
    }

    pub fn exists(&self, identifier: &str, content: &str) -> bool {
        lock(&self.records)
            .iter()
            .any(|record| record.identifier == identifier && record.content == content)
    }

    /// Marks the matching record as confirmed by the CA.
    pub fn mark_verified(&self, identifier: &str, content: &str) {
        for record in lock(&self.records).iter_mut() {
            if record.identifier == identifier && record.content == content {
                record.verified = true;
            }
        }
    }

    /// Non-blocking single-consumer pop from the ready queue; `None` means
    /// "try later", not failure.
    pub fn next_ready(&self) -> Option<ChallengeRecord> {
        lock(&self.ready_rx).try_recv().ok()
    }

    /// Proof content stored for a token, for the collaborator serving
    /// `/.well-known/acme-challenge/<token>` lookups.
    pub fn content_for_token(&self, token: &str) -> Option<String> {
        lock(&self.records)
            .iter()
            .find(|record| record.token == token)
            .map(|record| record.content.clone())
    }

    /// Read-only export of all current records, each shaped
    /// `{type, identifier, content, verified}`.
    pub fn snapshot_json(&self) -> serde_json::Result<String> {
        let records = lock(&self.records);
        serde_json::to_string(&*records)
    }

    /// Drains both the record list and the ready queue. For test isolation
    /// and manual reset.
    pub fn clear_all(&self) {
        lock(&self.records).clear();
        let ready_rx = lock(&self.ready_rx);
        while ready_rx.try_recv().is_ok() {}
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
