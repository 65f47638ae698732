//! `RemoteMirror` over a shared directory (network share, synced folder).
//!
//! Layout per dataset:
//!
//! ```text
//! <root>/<dataset_id>/manifest.json
//! <root>/<dataset_id>/images/<image_path>
//! <root>/<dataset_id>/.mirror.lock
//! ```
//!
//! Pushes hold an advisory lock, compare the parent revision with the
//! manifest on disk, write images first and the manifest last.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use wpg_core::{
    content_hash, CommitResult, ContractError, ImageUpload, PushOutcome, Record, RecordId,
    RemoteError, RemoteFailureKind, RemoteMirror, Snapshot,
};

pub const MANIFEST_FORMAT_VERSION: u32 = 1;
const MANIFEST_FILE_NAME: &str = "manifest.json";
const IMAGE_DIR_NAME: &str = "images";
const LOCK_FILE_NAME: &str = ".mirror.lock";

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("unsupported manifest format {found}, max supported {supported}")]
    UnsupportedFormat { found: u32, supported: u32 },
    #[error("invalid dataset id {0:?}")]
    InvalidDataset(String),
    #[error("{0}")]
    Contract(#[from] ContractError),
    #[error("image {image_path} for {record_id} is missing on the mirror")]
    MissingImage {
        record_id: RecordId,
        image_path: String,
    },
    #[error("image {image_path} hashes to {found}, record says {expected}")]
    ImageHashMismatch {
        image_path: String,
        expected: String,
        found: String,
    },
}

impl From<MirrorError> for RemoteError {
    fn from(err: MirrorError) -> Self {
        let kind = match &err {
            MirrorError::Io(io) if io.kind() == ErrorKind::NotFound => RemoteFailureKind::NotFound,
            MirrorError::Io(io) if io.kind() == ErrorKind::PermissionDenied => {
                RemoteFailureKind::Auth
            }
            MirrorError::Io(io) if io.kind() == ErrorKind::TimedOut => RemoteFailureKind::Timeout,
            MirrorError::Io(_) => RemoteFailureKind::Io,
            MirrorError::InvalidDataset(_) => RemoteFailureKind::NotFound,
            MirrorError::MissingImage { .. } => RemoteFailureKind::NotFound,
            MirrorError::Manifest(_)
            | MirrorError::UnsupportedFormat { .. }
            | MirrorError::Contract(_)
            | MirrorError::ImageHashMismatch { .. } => RemoteFailureKind::Corrupt,
        };
        RemoteError::new(kind, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub revision: String,
    pub generation: u64,
    pub updated_at: DateTime<Utc>,
    pub records: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset_id: &str) -> Result<PathBuf, MirrorError> {
        let valid = !dataset_id.is_empty()
            && !dataset_id.starts_with('.')
            && dataset_id
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
        if !valid {
            return Err(MirrorError::InvalidDataset(dataset_id.to_string()));
        }
        Ok(self.root.join(dataset_id))
    }

    pub fn load_manifest(&self, dataset_id: &str) -> Result<Option<Manifest>, MirrorError> {
        let path = self.dataset_dir(dataset_id)?.join(MANIFEST_FILE_NAME);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let manifest: Manifest = serde_json::from_slice(&raw)?;
        if manifest.format_version > MANIFEST_FORMAT_VERSION {
            return Err(MirrorError::UnsupportedFormat {
                found: manifest.format_version,
                supported: MANIFEST_FORMAT_VERSION,
            });
        }
        Ok(Some(manifest))
    }

    fn image_file(&self, dataset_id: &str, image_path: &str) -> Result<PathBuf, MirrorError> {
        Ok(self
            .dataset_dir(dataset_id)?
            .join(IMAGE_DIR_NAME)
            .join(image_path))
    }

    fn read_image(&self, dataset_id: &str, record: &Record) -> Result<Vec<u8>, MirrorError> {
        record.validate_image_path()?;
        let path = self.image_file(dataset_id, &record.image_path)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(MirrorError::MissingImage {
                    record_id: record.id.clone(),
                    image_path: record.image_path.clone(),
                })
            }
            Err(err) => return Err(err.into()),
        };
        let found = content_hash(&bytes);
        if found != record.image_hash {
            return Err(MirrorError::ImageHashMismatch {
                image_path: record.image_path.clone(),
                expected: record.image_hash.clone(),
                found,
            });
        }
        Ok(bytes)
    }

    fn commit(
        &self,
        dataset_id: &str,
        snapshot: &Snapshot,
        parent_revision: Option<&str>,
        uploads: &[ImageUpload],
    ) -> Result<PushOutcome, MirrorError> {
        let dataset_dir = self.dataset_dir(dataset_id)?;
        let image_dir = dataset_dir.join(IMAGE_DIR_NAME);
        fs::create_dir_all(&image_dir)?;

        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dataset_dir.join(LOCK_FILE_NAME))?;
        if lock.try_lock_exclusive().is_err() {
            return Ok(PushOutcome::ConflictHint {
                remote_revision: None,
                reason: "another client is pushing".to_string(),
            });
        }
        let _guard = UnlockOnDrop(lock);

        let current = self.load_manifest(dataset_id)?;
        let current_revision = current.as_ref().map(|manifest| manifest.revision.clone());
        if current_revision.as_deref() != parent_revision {
            return Ok(PushOutcome::ConflictHint {
                remote_revision: current_revision,
                reason: "remote revision moved since pull".to_string(),
            });
        }

        for upload in uploads {
            let Some(record) = snapshot.get(&upload.record_id) else {
                debug!(record_id = %upload.record_id, "upload without record skipped");
                continue;
            };
            record.validate_image_path()?;
            let found = content_hash(&upload.bytes);
            if found != record.image_hash {
                return Err(MirrorError::ImageHashMismatch {
                    image_path: upload.image_path.clone(),
                    expected: record.image_hash.clone(),
                    found,
                });
            }
            write_atomically(&image_dir.join(&record.image_path), &upload.bytes)?;
        }

        for record in snapshot.records.values() {
            record.validate_image_path()?;
            if !image_dir.join(&record.image_path).is_file() {
                return Err(MirrorError::MissingImage {
                    record_id: record.id.clone(),
                    image_path: record.image_path.clone(),
                });
            }
        }

        let generation = current.map_or(0, |manifest| manifest.generation) + 1;
        let identity = snapshot.identity();
        let manifest = Manifest {
            format_version: MANIFEST_FORMAT_VERSION,
            revision: format!("r{generation:06}-{}", &identity[..12]),
            generation,
            updated_at: Utc::now(),
            records: snapshot.records.values().cloned().collect(),
        };
        let payload = serde_json::to_vec_pretty(&manifest)?;
        write_atomically(&dataset_dir.join(MANIFEST_FILE_NAME), &payload)?;

        info!(
            dataset_id,
            revision = %manifest.revision,
            records = manifest.records.len(),
            uploads = uploads.len(),
            "mirror manifest committed"
        );
        Ok(PushOutcome::Committed(CommitResult {
            revision: manifest.revision,
            records: manifest.records.len(),
            uploaded_images: uploads.len(),
        }))
    }
}

impl RemoteMirror for DirectoryMirror {
    fn pull(&self, dataset_id: &str) -> Result<Snapshot, RemoteError> {
        let manifest = self.load_manifest(dataset_id)?;
        Ok(match manifest {
            Some(manifest) => {
                Snapshot::from_records(Utc::now(), Some(manifest.revision), manifest.records)
            }
            None => Snapshot::empty(Utc::now()),
        })
    }

    fn fetch_image(&self, dataset_id: &str, record: &Record) -> Result<Vec<u8>, RemoteError> {
        Ok(self.read_image(dataset_id, record)?)
    }

    fn push(
        &self,
        dataset_id: &str,
        snapshot: &Snapshot,
        parent_revision: Option<&str>,
        uploads: &[ImageUpload],
    ) -> Result<PushOutcome, RemoteError> {
        Ok(self.commit(dataset_id, snapshot, parent_revision, uploads)?)
    }
}

struct UnlockOnDrop(File);

impl Drop for UnlockOnDrop {
    fn drop(&mut self) {
        let _ = self.0.unlock();
    }
}

fn write_atomically(target: &Path, bytes: &[u8]) -> Result<(), MirrorError> {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!(".{name}.tmp"));
    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, target)?;
    Ok(())
}
