pub mod cancel;
pub mod dedup_index;
pub mod maintenance;
pub mod merge;
pub mod sync_engine;
pub mod writer_lock;

pub use cancel::CancelToken;
pub use dedup_index::DedupIndex;
pub use maintenance::MaintenanceError;
pub use merge::{three_way_merge, ConflictResolution, MergeAction, MergePlan, Side};
pub use sync_engine::{
    ConflictResolved, SyncConfig, SyncEngine, SyncError, SyncFailure, SyncPhase, SyncReport,
    DEFAULT_DATASET_ID,
};
pub use writer_lock::WriterLock;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, info, warn};
use wpg_core::{
    content_hash, derive_record_id, derive_seed, image_file_name, normalize_topic, ImageFetcher,
    PromptGenerator, ProviderError, Record, RecordId, SyncState, IMAGE_EXTENSION,
};
use wpg_storage::{RecordStore, StorageError};

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 768;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("topic is empty after normalization")]
    EmptyTopic,
    #[error("writer lock {0} is held by another run")]
    LockConflict(PathBuf),
    #[error("prompt generation failed: {0}")]
    PromptGeneration(#[from] ProviderError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationFailure {
    pub prompt: String,
    pub error: ProviderError,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub topic: String,
    pub requested: usize,
    pub prompts_received: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_duplicates: usize,
    pub created: Vec<RecordId>,
    pub failures: Vec<GenerationFailure>,
    pub cancelled: bool,
}

impl GenerationReport {
    pub fn attempted(&self) -> usize {
        self.succeeded + self.failed + self.skipped_duplicates
    }
}

/// Turns one topic into new records through the prompt and image collaborators.
/// Image fetches are issued one at a time.
pub struct GenerationPipeline<P, F> {
    config: PipelineConfig,
    prompts: P,
    images: F,
}

impl<P, F> GenerationPipeline<P, F>
where
    P: PromptGenerator,
    F: ImageFetcher,
{
    pub fn new(config: PipelineConfig, prompts: P, images: F) -> Self {
        Self {
            config,
            prompts,
            images,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run(
        &self,
        store: &RecordStore,
        topic: &str,
        count: usize,
    ) -> Result<GenerationReport, PipelineError> {
        self.run_at(store, topic, count, Utc::now(), &CancelToken::default())
    }

    /// Per-prompt provider failures are counted and skipped. Storage failures
    /// abort the batch; records already put stay put.
    pub fn run_at(
        &self,
        store: &RecordStore,
        topic: &str,
        count: usize,
        now: DateTime<Utc>,
        cancel: &CancelToken,
    ) -> Result<GenerationReport, PipelineError> {
        let topic_key = normalize_topic(topic);
        if topic_key.is_empty() {
            return Err(PipelineError::EmptyTopic);
        }

        let lock_path = store.layout().writer_lock_path.clone();
        let _writer = WriterLock::try_acquire(&lock_path, "generate", now)?
            .ok_or(PipelineError::LockConflict(lock_path))?;

        let mut report = GenerationReport {
            topic: topic_key.clone(),
            requested: count,
            ..GenerationReport::default()
        };
        if count == 0 {
            return Ok(report);
        }

        let mut prompts = self.prompts.generate(topic, count)?;
        prompts.truncate(count);
        report.prompts_received = prompts.len();
        info!(
            topic = %topic_key,
            requested = count,
            received = prompts.len(),
            "prompts generated"
        );

        let mut index = DedupIndex::build(store)?;
        for (position, prompt) in prompts.into_iter().enumerate() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                info!(topic = %topic_key, position, "generation cancelled");
                break;
            }

            if index.is_duplicate_prompt(&topic_key, &prompt) {
                debug!(topic = %topic_key, prompt = %prompt, "duplicate prompt skipped");
                report.skipped_duplicates += 1;
                continue;
            }

            let seed = derive_seed(&topic_key, &prompt);
            let bytes = match self
                .images
                .fetch(&prompt, self.config.width, self.config.height, seed)
            {
                Ok(bytes) => bytes,
                Err(error) => {
                    warn!(topic = %topic_key, prompt = %prompt, error = %error, "image fetch failed");
                    report.failed += 1;
                    report.failures.push(GenerationFailure { prompt, error });
                    continue;
                }
            };

            let image_hash = content_hash(&bytes);
            if index.is_duplicate_image(&topic_key, &image_hash) {
                debug!(topic = %topic_key, prompt = %prompt, "duplicate image skipped");
                report.skipped_duplicates += 1;
                continue;
            }

            let id = derive_record_id(&topic_key, &prompt, &image_hash);
            let record = Record {
                image_path: image_file_name(&id, IMAGE_EXTENSION),
                id,
                topic: topic_key.clone(),
                prompt,
                image_hash,
                width: self.config.width,
                height: self.config.height,
                seed,
                created_at: now + Duration::milliseconds(position as i64),
                sync_state: SyncState::LocalOnly,
                notes: None,
                is_favorite: false,
            };
            let id = store.put(&record, &bytes)?;
            index.insert(&record);
            report.succeeded += 1;
            report.created.push(id);
        }

        info!(
            topic = %topic_key,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped_duplicates = report.skipped_duplicates,
            "generation finished"
        );
        Ok(report)
    }
}
