use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use thiserror::Error;

pub const IMAGE_EXTENSION: &str = "png";
pub const SEED_SPACE: u64 = 1_000_000_000;
const RECORD_ID_PREFIX: &str = "wp";
const CONFLICT_MARKER: &str = "-conflict-";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContractError {
    #[error("unknown sync state: {0}")]
    UnknownSyncState(String),
    #[error("image path must be a bare file name, got {0:?}")]
    InvalidImagePath(String),
}

/// Content-stable record identity. Derived from the topic key, the prompt key
/// and the image content hash so independent machines collide on equal work.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Id under which a losing conflict version is preserved.
    pub fn conflict_copy(&self, loser_created_at: DateTime<Utc>) -> Self {
        Self(format!(
            "{}{CONFLICT_MARKER}{}",
            self.0,
            loser_created_at.timestamp_millis()
        ))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RecordId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    LocalOnly,
    Synced,
    RemoteOnly,
}

impl SyncState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Synced => "synced",
            Self::RemoteOnly => "remote_only",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "local_only" => Ok(Self::LocalOnly),
            "synced" => Ok(Self::Synced),
            "remote_only" => Ok(Self::RemoteOnly),
            other => Err(ContractError::UnknownSyncState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub topic: String,
    pub prompt: String,
    pub image_path: String,
    pub image_hash: String,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
    pub created_at: DateTime<Utc>,
    pub sync_state: SyncState,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub is_favorite: bool,
}

impl Record {
    /// Hash over everything a merge compares. `sync_state` is bookkeeping and
    /// is excluded.
    pub fn content_hash(&self) -> String {
        let fields = [
            self.id.to_string(),
            self.topic.clone(),
            self.prompt.clone(),
            self.image_path.clone(),
            self.image_hash.clone(),
            self.width.to_string(),
            self.height.to_string(),
            self.seed.to_string(),
            self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.notes.clone().unwrap_or_default(),
            u8::from(self.is_favorite).to_string(),
        ];
        let mut hasher = Sha256::new();
        for field in &fields {
            hasher.update(field.as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update([u8::from(self.notes.is_some())]);
        hex(&hasher.finalize())
    }

    /// Equal work done independently: everything but `created_at` and
    /// `sync_state` matches, annotations included.
    pub fn is_same_generation(&self, other: &Record) -> bool {
        let aligned = Record {
            created_at: other.created_at,
            sync_state: other.sync_state,
            ..self.clone()
        };
        aligned == *other
    }

    pub fn with_sync_state(mut self, sync_state: SyncState) -> Self {
        self.sync_state = sync_state;
        self
    }

    /// Copy of this version under its conflict id, with its own image file.
    pub fn conflict_copy(&self) -> Self {
        let id = self.id.conflict_copy(self.created_at);
        let extension = self
            .image_path
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .unwrap_or(IMAGE_EXTENSION);
        Self {
            image_path: image_file_name(&id, extension),
            id,
            sync_state: SyncState::LocalOnly,
            ..self.clone()
        }
    }

    pub fn validate_image_path(&self) -> Result<(), ContractError> {
        let path = self.image_path.as_str();
        if path.is_empty()
            || path.starts_with('.')
            || path.contains('/')
            || path.contains('\\')
            || path.contains("..")
        {
            return Err(ContractError::InvalidImagePath(path.to_string()));
        }
        Ok(())
    }
}

/// Read-only projection over all records sharing a topic key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicView {
    pub topic: String,
    pub record_count: usize,
    pub last_generated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    #[serde(default)]
    pub revision: Option<String>,
    pub records: BTreeMap<RecordId, Record>,
}

impl Snapshot {
    pub fn empty(taken_at: DateTime<Utc>) -> Self {
        Self {
            taken_at,
            revision: None,
            records: BTreeMap::new(),
        }
    }

    pub fn from_records(
        taken_at: DateTime<Utc>,
        revision: Option<String>,
        records: impl IntoIterator<Item = Record>,
    ) -> Self {
        Self {
            taken_at,
            revision,
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }

    pub fn get(&self, id: &RecordId) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Order-independent identity over (id, content hash) pairs.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        for (id, record) in &self.records {
            hasher.update(id.as_str().as_bytes());
            hasher.update(b"=");
            hasher.update(record.content_hash().as_bytes());
            hasher.update(b"\n");
        }
        hex(&hasher.finalize())
    }
}

pub fn normalize_prompt(prompt: &str) -> String {
    prompt
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn normalize_topic(topic: &str) -> String {
    normalize_prompt(topic)
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex(&hasher.finalize())
}

pub fn derive_record_id(topic: &str, prompt: &str, image_hash: &str) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(normalize_topic(topic).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_prompt(prompt).as_bytes());
    hasher.update(b"|");
    hasher.update(image_hash.as_bytes());
    let digest = hasher.finalize();
    RecordId(format!("{RECORD_ID_PREFIX}-{}", hex(&digest[..16])))
}

/// Seed handed to the image backend. Stable per (topic, prompt) so a pure
/// backend reproduces the same bytes on re-runs.
pub fn derive_seed(topic: &str, prompt: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(b"seed|");
    hasher.update(normalize_topic(topic).as_bytes());
    hasher.update(b"|");
    hasher.update(normalize_prompt(prompt).as_bytes());
    let digest = hasher.finalize();
    let mut head = [0_u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % SEED_SPACE
}

pub fn image_file_name(id: &RecordId, extension: &str) -> String {
    format!("{id}.{extension}")
}

/// Returns the id a conflict copy was split off from.
pub fn conflict_origin(id: &RecordId) -> Option<RecordId> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^(?P<origin>.+)-conflict-(?P<millis>-?\d+)$").expect("valid conflict regex")
    });
    pattern
        .captures(id.as_str())
        .and_then(|caps| caps.name("origin"))
        .map(|origin| RecordId::new(origin.as_str()))
}

fn hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
