//! Three-way merge of record snapshots.
//!
//! Classification per record id over `base`, `local` and `remote`:
//!
//! * only local: keep and push (a remote deletion is not propagated)
//! * only remote: materialize locally (a local deletion is not propagated)
//! * equal content on both sides: in sync
//! * the same generation made on two machines (only `created_at` differs): one
//!   record, the earlier `created_at` is kept
//! * differing content where one side still matches `base`: take the changed side
//! * differing content otherwise: conflict, last writer by `created_at` wins,
//!   ties go to remote, and the loser is kept under `<id>-conflict-<millis>`
//!
//! Nothing is ever deleted by a merge, and planning against an already merged
//! local snapshot yields the same end state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use wpg_core::{Record, RecordId, Snapshot, SyncState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PushReason {
    LocalAdded,
    LocalUpdated,
    RemoteDeletionIgnored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaterializeReason {
    RemoteAdded,
    LocalDeletionIgnored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictResolution {
    pub record_id: RecordId,
    pub winner_side: Side,
    pub winner: Record,
    pub loser: Record,
    pub loser_copy: Record,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    InSync {
        record_id: RecordId,
    },
    PushLocal {
        record_id: RecordId,
        reason: PushReason,
    },
    /// `record` carries `SyncState::RemoteOnly` until its image is local.
    Materialize {
        record: Record,
        reason: MaterializeReason,
    },
    /// Local still equals base, so the remote edit is taken as is.
    AdoptRemote {
        local: Record,
        remote: Record,
    },
    /// Both sides generated the same record; `kept` holds the earlier one.
    SameGeneration {
        local: Record,
        remote: Record,
        kept: Side,
    },
    Conflict(ConflictResolution),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergePlan {
    pub actions: Vec<MergeAction>,
}

impl MergePlan {
    pub fn conflicts(&self) -> impl Iterator<Item = &ConflictResolution> {
        self.actions.iter().filter_map(|action| match action {
            MergeAction::Conflict(conflict) => Some(conflict),
            _ => None,
        })
    }

    pub fn materializations(&self) -> impl Iterator<Item = (&Record, MaterializeReason)> {
        self.actions.iter().filter_map(|action| match action {
            MergeAction::Materialize { record, reason } => Some((record, *reason)),
            _ => None,
        })
    }

    pub fn count_in_sync(&self) -> usize {
        self.actions
            .iter()
            .filter(|action| matches!(action, MergeAction::InSync { .. }))
            .count()
    }

    pub fn count_pushes(&self, reason: PushReason) -> usize {
        self.actions
            .iter()
            .filter(|action| {
                matches!(action, MergeAction::PushLocal { reason: found, .. } if *found == reason)
            })
            .count()
    }

    pub fn count_adopted(&self) -> usize {
        self.actions
            .iter()
            .filter(|action| matches!(action, MergeAction::AdoptRemote { .. }))
            .count()
    }

    pub fn count_same_generation(&self) -> usize {
        self.actions
            .iter()
            .filter(|action| matches!(action, MergeAction::SameGeneration { .. }))
            .count()
    }

    /// Local end state the plan describes, without touching any store.
    pub fn apply_to(&self, local: &Snapshot, taken_at: DateTime<Utc>) -> Snapshot {
        let mut merged = local.clone();
        merged.taken_at = taken_at;
        for action in &self.actions {
            match action {
                MergeAction::InSync { .. } | MergeAction::PushLocal { .. } => {}
                MergeAction::Materialize { record, .. } => {
                    let record = record.clone().with_sync_state(SyncState::Synced);
                    merged.records.insert(record.id.clone(), record);
                }
                MergeAction::AdoptRemote { remote, .. }
                | MergeAction::SameGeneration {
                    remote,
                    kept: Side::Remote,
                    ..
                } => {
                    let record = remote.clone().with_sync_state(SyncState::Synced);
                    merged.records.insert(record.id.clone(), record);
                }
                MergeAction::SameGeneration {
                    kept: Side::Local, ..
                } => {}
                MergeAction::Conflict(conflict) => {
                    merged
                        .records
                        .insert(conflict.loser_copy.id.clone(), conflict.loser_copy.clone());
                    if conflict.winner_side == Side::Remote {
                        let winner = conflict.winner.clone().with_sync_state(SyncState::Synced);
                        merged.records.insert(winner.id.clone(), winner);
                    }
                }
            }
        }
        merged
    }
}

pub fn three_way_merge(base: &Snapshot, local: &Snapshot, remote: &Snapshot) -> MergePlan {
    let ids = local
        .records
        .keys()
        .chain(remote.records.keys())
        .cloned()
        .collect::<BTreeSet<_>>();

    let mut plan = MergePlan::default();
    for id in ids {
        let action = match (local.get(&id), remote.get(&id)) {
            (Some(_), None) => MergeAction::PushLocal {
                reason: if base.contains(&id) {
                    PushReason::RemoteDeletionIgnored
                } else {
                    PushReason::LocalAdded
                },
                record_id: id,
            },
            (None, Some(remote_record)) => MergeAction::Materialize {
                record: remote_record
                    .clone()
                    .with_sync_state(SyncState::RemoteOnly),
                reason: if base.contains(&id) {
                    MaterializeReason::LocalDeletionIgnored
                } else {
                    MaterializeReason::RemoteAdded
                },
            },
            (Some(local_record), Some(remote_record)) => {
                classify_shared(base.get(&id), local_record, remote_record)
            }
            (None, None) => continue,
        };
        plan.actions.push(action);
    }
    plan
}

fn classify_shared(base: Option<&Record>, local: &Record, remote: &Record) -> MergeAction {
    let local_hash = local.content_hash();
    let remote_hash = remote.content_hash();
    if local_hash == remote_hash {
        return MergeAction::InSync {
            record_id: local.id.clone(),
        };
    }

    if local.is_same_generation(remote) {
        let kept = if local.created_at < remote.created_at {
            Side::Local
        } else {
            Side::Remote
        };
        return MergeAction::SameGeneration {
            local: local.clone(),
            remote: remote.clone(),
            kept,
        };
    }

    let base_hash = base.map(Record::content_hash);
    if base_hash.as_deref() == Some(local_hash.as_str()) {
        return MergeAction::AdoptRemote {
            local: local.clone(),
            remote: remote.clone(),
        };
    }
    if base_hash.as_deref() == Some(remote_hash.as_str()) {
        return MergeAction::PushLocal {
            record_id: local.id.clone(),
            reason: PushReason::LocalUpdated,
        };
    }

    MergeAction::Conflict(resolve_conflict(local, remote))
}

fn resolve_conflict(local: &Record, remote: &Record) -> ConflictResolution {
    let (winner_side, winner, loser) = if local.created_at > remote.created_at {
        (Side::Local, local, remote)
    } else {
        (Side::Remote, remote, local)
    };

    ConflictResolution {
        record_id: local.id.clone(),
        winner_side,
        winner: winner.clone(),
        loser: loser.clone(),
        loser_copy: loser.conflict_copy(),
    }
}
