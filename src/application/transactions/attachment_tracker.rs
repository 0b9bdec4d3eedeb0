use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::application::services::registry::DepotRegistry;
use crate::domain::entities::attached_file::AttachedFile;

/// A single field change observed while scanning dirty rows before a flush.
#[derive(Debug, Clone, Default)]
pub struct AttachmentDelta {
    pub old: Option<AttachedFile>,
    pub new: Option<AttachedFile>,
}

/// Hook surface tying attachments to a host ORM's unit of work.
///
/// The tracker implements these directly; ORM adapters only need to call
/// the right hook from the corresponding session event.
#[async_trait]
pub trait UnitOfWorkHooks: Send + Sync {
    /// A field was assigned: the previous value becomes deletable on
    /// commit, the new value's files deletable on rollback.
    fn on_field_set(&self, old: Option<&AttachedFile>, new: Option<&AttachedFile>);

    /// A row was deleted: its files become deletable on commit and are
    /// retained on rollback.
    fn on_row_delete(&self, value: &AttachedFile);

    /// Per-field deltas computed from dirty and deleted rows.
    fn before_flush(&self, deltas: &[AttachmentDelta]);

    /// The unit of work committed: physically delete the files replaced or
    /// removed during it.
    async fn after_commit(&self);

    /// The unit of work rolled back: physically delete the files created
    /// during it, keeping the previously attached ones.
    async fn after_rollback(&self);
}

#[derive(Default)]
struct PendingSets {
    /// Files to remove once the unit of work succeeds.
    pending_deletes: HashSet<String>,
    /// Files to remove if the unit of work fails.
    pending_rollback_deletes: HashSet<String>,
}

/// Per-unit-of-work tracker deferring physical deletes to the transaction
/// outcome, so commits and rollbacks never leak or lose files.
///
/// File paths are `depot_name/file_id` strings; drains resolve the store
/// through the registry. A path never sits in both sets: a reassignment
/// moves it, and rollback always wins over a stale commit-side entry.
#[derive(Default)]
pub struct AttachmentTracker {
    sets: Mutex<PendingSets>,
}

impl AttachmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sets<R>(&self, f: impl FnOnce(&mut PendingSets) -> R) -> R {
        let mut sets = self
            .sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut sets)
    }

    /// Schedules a newly attached value: its files are deleted on rollback
    /// and, if a previous pass had marked them for commit-time deletion,
    /// that mark is dropped.
    pub fn add(&self, value: Option<&AttachedFile>) {
        let Some(value) = value else { return };
        self.with_sets(|sets| {
            for path in value.files() {
                sets.pending_deletes.remove(path);
                sets.pending_rollback_deletes.insert(path.clone());
            }
        });
    }

    /// Schedules a detached value: its files are deleted on commit and no
    /// longer cleaned up on rollback.
    pub fn delete(&self, value: Option<&AttachedFile>) {
        let Some(value) = value else { return };
        self.with_sets(|sets| {
            for path in value.files() {
                sets.pending_rollback_deletes.remove(path);
                sets.pending_deletes.insert(path.clone());
            }
        });
    }

    /// Atomically records a reassignment.
    pub fn swap(&self, old: Option<&AttachedFile>, new: Option<&AttachedFile>) {
        self.delete(old);
        self.add(new);
    }

    pub fn pending_deletes(&self) -> Vec<String> {
        self.with_sets(|sets| sets.pending_deletes.iter().cloned().collect())
    }

    pub fn pending_rollback_deletes(&self) -> Vec<String> {
        self.with_sets(|sets| sets.pending_rollback_deletes.iter().cloned().collect())
    }

    /// Issues the physical deletes for a set of `depot/file_id` paths.
    /// Deletes are unordered and independent; failures are logged and do
    /// not stop the drain, idempotent delete makes retries safe.
    async fn drain(paths: HashSet<String>) {
        for path in paths {
            let Some((depot_name, file_id)) = path.split_once('/') else {
                tracing::warn!(path = %path, "skipping malformed attachment path");
                continue;
            };
            let depot = match DepotRegistry::get(Some(depot_name)) {
                Ok(depot) => depot,
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "could not resolve depot for deferred delete");
                    continue;
                }
            };
            if let Err(e) = depot.delete(file_id).await {
                tracing::warn!(path = %path, error = %e, "deferred delete failed");
            }
        }
    }
}

#[async_trait]
impl UnitOfWorkHooks for AttachmentTracker {
    fn on_field_set(&self, old: Option<&AttachedFile>, new: Option<&AttachedFile>) {
        self.swap(old, new);
    }

    fn on_row_delete(&self, value: &AttachedFile) {
        self.delete(Some(value));
    }

    fn before_flush(&self, deltas: &[AttachmentDelta]) {
        for delta in deltas {
            self.swap(delta.old.as_ref(), delta.new.as_ref());
        }
    }

    async fn after_commit(&self) {
        let to_delete = self.with_sets(|sets| {
            sets.pending_rollback_deletes.clear();
            std::mem::take(&mut sets.pending_deletes)
        });
        tracing::debug!(count = to_delete.len(), "draining commit-side deletes");
        Self::drain(to_delete).await;
    }

    async fn after_rollback(&self) {
        let to_delete = self.with_sets(|sets| {
            sets.pending_deletes.clear();
            std::mem::take(&mut sets.pending_rollback_deletes)
        });
        tracing::debug!(count = to_delete.len(), "draining rollback-side deletes");
        Self::drain(to_delete).await;
    }
}
