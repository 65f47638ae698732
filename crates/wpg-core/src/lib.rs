pub mod collaborators;
pub mod dataset_contracts;

pub use collaborators::{
    CommitResult, ImageFetcher, ImageUpload, PromptGenerator, ProviderError,
    ProviderFailureKind, PushOutcome, RemoteError, RemoteFailureKind, RemoteMirror,
};
pub use dataset_contracts::{
    conflict_origin, content_hash, derive_record_id, derive_seed, image_file_name,
    normalize_prompt, normalize_topic, ContractError, Record, RecordId, Snapshot, SyncState,
    TopicView, IMAGE_EXTENSION,
};
