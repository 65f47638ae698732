//! Store edits outside generation and sync. Each one holds the writer lock so
//! it never races a running `generate` or `sync`.

use crate::writer_lock::WriterLock;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info};
use wpg_core::{Record, RecordId};
use wpg_storage::{RecordStore, RecoveryReport, StorageError};

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("writer lock {0} is held by another run")]
    LockConflict(PathBuf),
    #[error("no record with id {0}")]
    UnknownRecord(RecordId),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn acquire(
    store: &RecordStore,
    operation: &str,
    now: DateTime<Utc>,
) -> Result<WriterLock, MaintenanceError> {
    let lock_path = store.layout().writer_lock_path.clone();
    WriterLock::try_acquire(&lock_path, operation, now)?
        .ok_or(MaintenanceError::LockConflict(lock_path))
}

/// Recovery pass run when a process opens the store. `Ok(None)` when another
/// run holds the writer lock; its in-flight files are left alone.
pub fn recover_if_idle(
    store: &RecordStore,
    now: DateTime<Utc>,
) -> Result<Option<RecoveryReport>, MaintenanceError> {
    let lock_path = store.layout().writer_lock_path.clone();
    let Some(_writer) = WriterLock::try_acquire(&lock_path, "recover", now)? else {
        debug!(lock = %lock_path.display(), "writer busy, recovery skipped");
        return Ok(None);
    };
    Ok(Some(store.recover()?))
}

pub fn recover(
    store: &RecordStore,
    now: DateTime<Utc>,
) -> Result<RecoveryReport, MaintenanceError> {
    let _writer = acquire(store, "recover", now)?;
    Ok(store.recover()?)
}

pub fn annotate(
    store: &RecordStore,
    id: &RecordId,
    notes: Option<Option<&str>>,
    is_favorite: Option<bool>,
    now: DateTime<Utc>,
) -> Result<Record, MaintenanceError> {
    let _writer = acquire(store, "annotate", now)?;
    if store.find(id)?.is_none() {
        return Err(MaintenanceError::UnknownRecord(id.clone()));
    }
    let record = store.annotate(id, notes, is_favorite)?;
    info!(record_id = %id, favorite = record.is_favorite, "record annotated");
    Ok(record)
}

pub fn remove(
    store: &RecordStore,
    id: &RecordId,
    now: DateTime<Utc>,
) -> Result<(), MaintenanceError> {
    let _writer = acquire(store, "remove", now)?;
    if !store.remove(id)? {
        return Err(MaintenanceError::UnknownRecord(id.clone()));
    }
    info!(record_id = %id, "record removed");
    Ok(())
}
