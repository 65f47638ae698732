use crate::cancel::CancelToken;
use crate::merge::{three_way_merge, MaterializeReason, MergeAction, MergePlan, PushReason, Side};
use crate::writer_lock::WriterLock;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use wpg_core::{
    CommitResult, ImageUpload, PushOutcome, Record, RecordId, RemoteError, RemoteMirror,
    Snapshot, SyncState,
};
use wpg_storage::{RecordStore, StorageError};

pub const DEFAULT_DATASET_ID: &str = "wallpapers";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    /// Writer lock and recovery pass ahead of the pull.
    Recovering,
    Pulling,
    Merging,
    CommittingLocal,
    Pushing,
    Failed,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recovering => "recovering",
            Self::Pulling => "pulling",
            Self::Merging => "merging",
            Self::CommittingLocal => "committing_local",
            Self::Pushing => "pushing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Remote(#[from] RemoteError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("writer lock {0} is held by another run")]
    LockConflict(PathBuf),
    #[error("remote rejected push: {reason}")]
    PushRejected {
        remote_revision: Option<String>,
        reason: String,
    },
    #[error("sync cancelled")]
    Cancelled,
}

/// A cycle that stopped. Local state is whatever the last completed step left,
/// and calling `sync` again is always safe.
#[derive(Debug, Error)]
#[error("sync failed during {phase}: {error}")]
pub struct SyncFailure {
    pub phase: SyncPhase,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    fn at(phase: SyncPhase) -> impl FnOnce(SyncError) -> Self {
        move |error| Self { phase, error }
    }

    /// Storage failures need the recovery pass first; everything else can be
    /// retried immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.error, SyncError::Storage(_) | SyncError::Io(_))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub dataset_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dataset_id: DEFAULT_DATASET_ID.to_string(),
        }
    }
}

/// Informational merge outcome; never needs user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictResolved {
    pub record_id: RecordId,
    pub winner: Side,
    pub conflict_id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub cycle_id: String,
    pub dataset_id: String,
    /// Repairs made by the recovery pass that opens every cycle.
    pub recovery: usize,
    pub local_records: usize,
    pub pulled: usize,
    pub in_sync: usize,
    pub materialized: usize,
    /// Local deletions undone by re-materializing the remote copy.
    pub restored: usize,
    /// Remote deletions undone by pushing the local copy again.
    pub kept_remote_deletions: usize,
    pub local_updates: usize,
    pub fast_forwarded: usize,
    /// Records both sides generated independently, folded into one.
    pub deduplicated: usize,
    pub conflicts: Vec<ConflictResolved>,
    pub pushed_records: usize,
    pub pushed_uploads: usize,
    pub commit: CommitResult,
    pub base_identity: String,
}

/// Pull, merge, commit locally, push. One cycle per call.
pub struct SyncEngine<M> {
    config: SyncConfig,
    mirror: M,
}

impl<M: RemoteMirror> SyncEngine<M> {
    pub fn new(config: SyncConfig, mirror: M) -> Self {
        Self { config, mirror }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn sync(&self, store: &RecordStore) -> Result<SyncReport, SyncFailure> {
        self.sync_with(store, &CancelToken::default())
    }

    pub fn sync_with(
        &self,
        store: &RecordStore,
        cancel: &CancelToken,
    ) -> Result<SyncReport, SyncFailure> {
        let cycle_id = Uuid::new_v4().to_string();
        let result = self.run_cycle(store, cancel, &cycle_id);
        match &result {
            Ok(report) => info!(
                cycle_id = %cycle_id,
                phase = SyncPhase::Idle.as_str(),
                revision = %report.commit.revision,
                conflicts = report.conflicts.len(),
                "sync cycle complete"
            ),
            Err(failure) => warn!(
                cycle_id = %cycle_id,
                phase = SyncPhase::Failed.as_str(),
                failed_step = failure.phase.as_str(),
                error = %failure.error,
                "sync cycle failed"
            ),
        }
        result
    }

    fn run_cycle(
        &self,
        store: &RecordStore,
        cancel: &CancelToken,
        cycle_id: &str,
    ) -> Result<SyncReport, SyncFailure> {
        let dataset_id = self.config.dataset_id.as_str();
        let lock_path = store.layout().writer_lock_path.clone();
        let _writer = WriterLock::try_acquire(&lock_path, "sync", Utc::now())
            .map_err(|err| SyncFailure::at(SyncPhase::Recovering)(err.into()))?
            .ok_or_else(|| {
                SyncFailure::at(SyncPhase::Recovering)(SyncError::LockConflict(lock_path))
            })?;

        self.enter(cycle_id, SyncPhase::Recovering, cancel)?;
        let recovery = store
            .recover()
            .map_err(|err| SyncFailure::at(SyncPhase::Recovering)(err.into()))?;

        self.enter(cycle_id, SyncPhase::Pulling, cancel)?;
        let remote = self
            .mirror
            .pull(dataset_id)
            .map_err(|err| SyncFailure::at(SyncPhase::Pulling)(err.into()))?;

        self.enter(cycle_id, SyncPhase::Merging, cancel)?;
        let (local, plan) = self
            .plan(store, &remote)
            .map_err(SyncFailure::at(SyncPhase::Merging))?;

        self.enter(cycle_id, SyncPhase::CommittingLocal, cancel)?;
        self.commit_local(store, &plan, cancel)
            .map_err(SyncFailure::at(SyncPhase::CommittingLocal))?;

        self.enter(cycle_id, SyncPhase::Pushing, cancel)?;
        let (merged, pushed, commit) = self
            .push(store, &remote)
            .map_err(SyncFailure::at(SyncPhase::Pushing))?;

        Ok(SyncReport {
            cycle_id: cycle_id.to_string(),
            dataset_id: dataset_id.to_string(),
            recovery: recovery.repairs(),
            local_records: local.len(),
            pulled: remote.len(),
            in_sync: plan.count_in_sync(),
            materialized: plan
                .materializations()
                .filter(|(_, reason)| *reason == MaterializeReason::RemoteAdded)
                .count(),
            restored: plan
                .materializations()
                .filter(|(_, reason)| *reason == MaterializeReason::LocalDeletionIgnored)
                .count(),
            kept_remote_deletions: plan.count_pushes(PushReason::RemoteDeletionIgnored),
            local_updates: plan.count_pushes(PushReason::LocalUpdated),
            fast_forwarded: plan.count_adopted(),
            deduplicated: plan.count_same_generation(),
            conflicts: plan
                .conflicts()
                .map(|conflict| ConflictResolved {
                    record_id: conflict.record_id.clone(),
                    winner: conflict.winner_side,
                    conflict_id: conflict.loser_copy.id.clone(),
                })
                .collect(),
            pushed_records: pushed,
            pushed_uploads: commit.uploaded_images,
            commit,
            base_identity: merged.identity(),
        })
    }

    fn enter(
        &self,
        cycle_id: &str,
        phase: SyncPhase,
        cancel: &CancelToken,
    ) -> Result<(), SyncFailure> {
        if cancel.is_cancelled() {
            return Err(SyncFailure {
                phase,
                error: SyncError::Cancelled,
            });
        }
        info!(cycle_id = %cycle_id, phase = phase.as_str(), "sync phase");
        Ok(())
    }

    fn plan(
        &self,
        store: &RecordStore,
        remote: &Snapshot,
    ) -> Result<(Snapshot, MergePlan), SyncError> {
        let base = store
            .sync_base(&self.config.dataset_id)?
            .unwrap_or_else(|| Snapshot::empty(Utc::now()));
        let local = store.snapshot()?;
        let plan = three_way_merge(&base, &local, remote);
        Ok((local, plan))
    }

    fn commit_local(
        &self,
        store: &RecordStore,
        plan: &MergePlan,
        cancel: &CancelToken,
    ) -> Result<(), SyncError> {
        for action in &plan.actions {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            match action {
                MergeAction::InSync { .. }
                | MergeAction::PushLocal { .. }
                | MergeAction::SameGeneration {
                    kept: Side::Local, ..
                } => {}
                MergeAction::Materialize { record, reason } => {
                    let bytes = self.mirror.fetch_image(&self.config.dataset_id, record)?;
                    store.put(&record.clone().with_sync_state(SyncState::Synced), &bytes)?;
                    info!(record_id = %record.id, reason = ?reason, "materialized remote record");
                }
                MergeAction::AdoptRemote { local, remote } => {
                    let bytes = self.image_bytes(store, local, remote)?;
                    store.put(&remote.clone().with_sync_state(SyncState::Synced), &bytes)?;
                    info!(record_id = %remote.id, "took remote edit");
                }
                MergeAction::SameGeneration {
                    local,
                    remote,
                    kept: Side::Remote,
                } => {
                    let bytes = self.image_bytes(store, local, remote)?;
                    store.put(&remote.clone().with_sync_state(SyncState::Synced), &bytes)?;
                    info!(
                        record_id = %remote.id,
                        created_at = %remote.created_at,
                        "took earlier remote copy of the same generation"
                    );
                }
                MergeAction::Conflict(conflict) => {
                    let (local, remote) = match conflict.winner_side {
                        Side::Local => (&conflict.winner, &conflict.loser),
                        Side::Remote => (&conflict.loser, &conflict.winner),
                    };
                    let loser_bytes = match conflict.winner_side {
                        Side::Local => self.image_bytes(store, local, remote)?,
                        Side::Remote => store.read_image(local)?,
                    };
                    store.put(&conflict.loser_copy, &loser_bytes)?;

                    if conflict.winner_side == Side::Remote {
                        let winner_bytes = if remote.image_hash == local.image_hash {
                            loser_bytes
                        } else {
                            self.mirror.fetch_image(&self.config.dataset_id, remote)?
                        };
                        store.put(
                            &remote.clone().with_sync_state(SyncState::Synced),
                            &winner_bytes,
                        )?;
                    }
                    info!(
                        record_id = %conflict.record_id,
                        winner = conflict.winner_side.as_str(),
                        conflict_id = %conflict.loser_copy.id,
                        "conflict resolved"
                    );
                }
            }
        }
        Ok(())
    }

    /// Bytes for `remote`'s image, reusing the local file when hashes match.
    fn image_bytes(
        &self,
        store: &RecordStore,
        local: &Record,
        remote: &Record,
    ) -> Result<Vec<u8>, SyncError> {
        if local.image_hash == remote.image_hash {
            if let Ok(bytes) = store.read_image(local) {
                return Ok(bytes);
            }
        }
        Ok(self.mirror.fetch_image(&self.config.dataset_id, remote)?)
    }

    fn push(
        &self,
        store: &RecordStore,
        remote: &Snapshot,
    ) -> Result<(Snapshot, usize, CommitResult), SyncError> {
        let local = store.snapshot()?;
        let mut merged = Snapshot::from_records(
            local.taken_at,
            remote.revision.clone(),
            local
                .records
                .into_values()
                .map(|record| record.with_sync_state(SyncState::Synced)),
        );

        let mut uploads = Vec::new();
        let mut pushed = 0;
        for record in merged.records.values() {
            let remote_record = remote.get(&record.id);
            if remote_record.map(Record::content_hash) != Some(record.content_hash()) {
                pushed += 1;
            }
            let needs_image = remote_record.map_or(true, |existing| {
                existing.image_hash != record.image_hash || existing.image_path != record.image_path
            });
            if needs_image {
                uploads.push(ImageUpload {
                    record_id: record.id.clone(),
                    image_path: record.image_path.clone(),
                    bytes: store.read_image(record)?,
                });
            }
        }

        let outcome = self.mirror.push(
            &self.config.dataset_id,
            &merged,
            remote.revision.as_deref(),
            &uploads,
        )?;
        let commit = match outcome {
            PushOutcome::Committed(commit) => commit,
            PushOutcome::ConflictHint {
                remote_revision,
                reason,
            } => {
                return Err(SyncError::PushRejected {
                    remote_revision,
                    reason,
                })
            }
        };

        merged.revision = Some(commit.revision.clone());
        store.commit_sync_base(&self.config.dataset_id, &merged)?;
        Ok((merged, pushed, commit))
    }
}
