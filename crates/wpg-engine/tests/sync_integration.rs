use chrono::{DateTime, TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use tempfile::TempDir;
use wpg_core::{
    content_hash, derive_record_id, image_file_name, CommitResult, ImageFetcher, ImageUpload,
    PromptGenerator, ProviderError, PushOutcome, Record, RecordId, RemoteError,
    RemoteFailureKind, RemoteMirror, Snapshot, SyncState, IMAGE_EXTENSION,
};
use wpg_engine::{
    CancelToken, GenerationPipeline, PipelineConfig, Side, SyncConfig, SyncEngine, SyncError,
    SyncPhase, WriterLock,
};
use wpg_storage::RecordStore;

const DATASET: &str = "wallpapers-test";

fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_760_000_000_000 + offset_ms)
        .single()
        .expect("valid timestamp")
}

fn record(topic: &str, prompt: &str, bytes: &[u8], created_at: DateTime<Utc>) -> Record {
    let image_hash = content_hash(bytes);
    let id = derive_record_id(topic, prompt, &image_hash);
    Record {
        image_path: image_file_name(&id, IMAGE_EXTENSION),
        id,
        topic: topic.to_string(),
        prompt: prompt.to_string(),
        image_hash,
        width: 1280,
        height: 768,
        seed: 11,
        created_at,
        sync_state: SyncState::LocalOnly,
        notes: None,
        is_favorite: false,
    }
}

#[derive(Default)]
struct MirrorState {
    records: BTreeMap<RecordId, Record>,
    images: HashMap<String, Vec<u8>>,
    generation: usize,
}

impl MirrorState {
    fn revision(&self) -> Option<String> {
        (self.generation > 0).then(|| format!("rev-{}", self.generation))
    }
}

/// In-memory remote with scriptable failures.
#[derive(Default)]
struct MemoryMirror {
    state: RefCell<MirrorState>,
    fail_pull: Cell<bool>,
    fail_push: Cell<bool>,
    /// Image fetch number (1-based) that fails with a network error.
    fail_fetch_on: Cell<Option<usize>>,
    fetches: Cell<usize>,
    move_before_push: Cell<bool>,
    pushes: Cell<usize>,
}

impl MemoryMirror {
    fn seed(&self, record: Record, bytes: &[u8]) {
        let mut state = self.state.borrow_mut();
        state
            .images
            .insert(record.image_path.clone(), bytes.to_vec());
        state
            .records
            .insert(record.id.clone(), record.with_sync_state(SyncState::Synced));
        state.generation += 1;
    }

    fn delete(&self, id: &RecordId) {
        let mut state = self.state.borrow_mut();
        state.records.remove(id);
        state.generation += 1;
    }

    fn edit(&self, id: &RecordId, edit: impl FnOnce(&mut Record)) {
        let mut state = self.state.borrow_mut();
        if let Some(record) = state.records.get_mut(id) {
            edit(record);
        }
        state.generation += 1;
    }

    fn get(&self, id: &RecordId) -> Option<Record> {
        self.state.borrow().records.get(id).cloned()
    }

    fn len(&self) -> usize {
        self.state.borrow().records.len()
    }
}

impl RemoteMirror for MemoryMirror {
    fn pull(&self, _dataset_id: &str) -> Result<Snapshot, RemoteError> {
        if self.fail_pull.get() {
            return Err(RemoteError::new(RemoteFailureKind::Network, "connection reset"));
        }
        let state = self.state.borrow();
        Ok(Snapshot::from_records(
            ts(0),
            state.revision(),
            state.records.values().cloned(),
        ))
    }

    fn fetch_image(&self, _dataset_id: &str, record: &Record) -> Result<Vec<u8>, RemoteError> {
        let fetch = self.fetches.get() + 1;
        self.fetches.set(fetch);
        if self.fail_fetch_on.get() == Some(fetch) {
            return Err(RemoteError::new(RemoteFailureKind::Network, "image download reset"));
        }
        self.state
            .borrow()
            .images
            .get(&record.image_path)
            .cloned()
            .ok_or_else(|| RemoteError::new(RemoteFailureKind::NotFound, record.image_path.clone()))
    }

    fn push(
        &self,
        _dataset_id: &str,
        snapshot: &Snapshot,
        parent_revision: Option<&str>,
        uploads: &[ImageUpload],
    ) -> Result<PushOutcome, RemoteError> {
        if self.fail_push.get() {
            return Err(RemoteError::new(RemoteFailureKind::Timeout, "push timed out"));
        }
        let mut state = self.state.borrow_mut();
        if self.move_before_push.get() {
            state.generation += 1;
        }
        if state.revision().as_deref() != parent_revision {
            return Ok(PushOutcome::ConflictHint {
                remote_revision: state.revision(),
                reason: "remote moved since pull".to_string(),
            });
        }
        for upload in uploads {
            state
                .images
                .insert(upload.image_path.clone(), upload.bytes.clone());
        }
        state.records = snapshot.records.clone();
        state.generation += 1;
        self.pushes.set(self.pushes.get() + 1);
        Ok(PushOutcome::Committed(CommitResult {
            revision: state.revision().unwrap_or_default(),
            records: state.records.len(),
            uploaded_images: uploads.len(),
        }))
    }
}

struct FixedPrompts(&'static [&'static str]);

impl PromptGenerator for FixedPrompts {
    fn generate(&self, _topic: &str, count: usize) -> Result<Vec<String>, ProviderError> {
        Ok(self.0.iter().take(count).map(|prompt| prompt.to_string()).collect())
    }
}

/// Deterministic backend: equal inputs render equal bytes on every machine.
struct SeededRenderer;

impl ImageFetcher for SeededRenderer {
    fn fetch(
        &self,
        prompt: &str,
        width: u32,
        height: u32,
        seed: u64,
    ) -> Result<Vec<u8>, ProviderError> {
        Ok(format!("{prompt}|{width}x{height}|{seed}").into_bytes())
    }
}

fn engine(mirror: &MemoryMirror) -> SyncEngine<&MemoryMirror> {
    SyncEngine::new(
        SyncConfig {
            dataset_id: DATASET.to_string(),
        },
        mirror,
    )
}

#[test]
fn local_and_remote_additions_meet_in_one_cycle() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let a = record("forest", "misty pines", b"A", ts(1));
    store.put(&a, b"A").expect("put a");

    let mirror = MemoryMirror::default();
    let b = record("forest", "frozen lake", b"B", ts(2));
    mirror.seed(b.clone(), b"B");

    let report = engine(&mirror).sync(&store).expect("sync");
    assert_eq!(report.pulled, 1);
    assert_eq!(report.materialized, 1);
    assert_eq!(report.pushed_uploads, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.commit.records, 2);

    for id in [&a.id, &b.id] {
        assert_eq!(
            store.get(id).expect("local record").sync_state,
            SyncState::Synced
        );
    }
    assert_eq!(store.read_image(&b).expect("b image"), b"B");
    assert!(mirror.get(&a.id).is_some());
    assert_eq!(
        store.sync_base_identity(DATASET).expect("base identity"),
        Some(report.base_identity)
    );
}

#[test]
fn second_cycle_after_success_changes_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    store
        .put(&record("forest", "misty pines", b"A", ts(1)), b"A")
        .expect("put");
    let mirror = MemoryMirror::default();
    mirror.seed(record("forest", "frozen lake", b"B", ts(2)), b"B");

    let sync = engine(&mirror);
    let first = sync.sync(&store).expect("first sync");
    let second = sync.sync(&store).expect("second sync");

    assert_eq!(second.in_sync, 2);
    assert_eq!(second.materialized, 0);
    assert_eq!(second.pushed_records, 0);
    assert_eq!(second.pushed_uploads, 0);
    assert_eq!(second.base_identity, first.base_identity);
    assert_eq!(store.record_count().expect("count"), 2);
}

#[test]
fn deletions_on_either_side_are_restored() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let a = record("forest", "misty pines", b"A", ts(1));
    let b = record("forest", "frozen lake", b"B", ts(2));
    store.put(&a, b"A").expect("put a");
    store.put(&b, b"B").expect("put b");

    let mirror = MemoryMirror::default();
    let sync = engine(&mirror);
    sync.sync(&store).expect("initial sync");

    mirror.delete(&a.id);
    assert!(store.remove(&b.id).expect("remove b"));

    let report = sync.sync(&store).expect("sync after deletions");
    assert_eq!(report.kept_remote_deletions, 1);
    assert_eq!(report.restored, 1);
    assert!(store.find(&a.id).expect("find a").is_some());
    assert_eq!(store.read_image(&b).expect("b restored"), b"B");
    assert!(mirror.get(&a.id).is_some());
    assert_eq!(mirror.len(), 2);
}

#[test]
fn concurrent_edits_keep_both_versions() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");

    let mut local = record("forest", "misty pines", b"pines", ts(10));
    local.notes = Some("mine".to_string());
    store.put(&local, b"pines").expect("put local");

    let mirror = MemoryMirror::default();
    let mut remote = record("forest", "misty pines", b"pines", ts(20));
    remote.notes = Some("theirs".to_string());
    mirror.seed(remote.clone(), b"pines");

    let report = engine(&mirror).sync(&store).expect("sync");
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.winner, Side::Remote);
    assert_eq!(conflict.conflict_id, local.id.conflict_copy(ts(10)));

    let winner = store.get(&local.id).expect("winner");
    assert_eq!(winner.notes.as_deref(), Some("theirs"));
    let loser = store.get(&conflict.conflict_id).expect("loser copy");
    assert_eq!(loser.notes.as_deref(), Some("mine"));
    assert_eq!(store.read_image(&loser).expect("loser image"), b"pines");

    assert!(mirror.get(&conflict.conflict_id).is_some());
    assert_eq!(
        mirror.get(&local.id).and_then(|r| r.notes),
        Some("theirs".to_string())
    );
}

#[test]
fn newer_local_edit_wins_and_remote_version_is_kept() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");

    let mut local = record("forest", "misty pines", b"pines", ts(30));
    local.is_favorite = true;
    store.put(&local, b"pines").expect("put local");

    let mirror = MemoryMirror::default();
    let remote = record("forest", "misty pines", b"pines", ts(20));
    mirror.seed(remote.clone(), b"pines");

    let report = engine(&mirror).sync(&store).expect("sync");
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.winner, Side::Local);

    assert!(store.get(&local.id).expect("winner").is_favorite);
    let kept = store.get(&conflict.conflict_id).expect("remote copy");
    assert!(!kept.is_favorite);
    assert_eq!(kept.created_at, ts(20));
    assert_eq!(
        mirror.get(&local.id).map(|r| r.is_favorite),
        Some(true)
    );
}

#[test]
fn remote_edit_of_an_unchanged_record_fast_forwards() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let a = record("forest", "misty pines", b"A", ts(1));
    store.put(&a, b"A").expect("put");

    let mirror = MemoryMirror::default();
    let sync = engine(&mirror);
    sync.sync(&store).expect("initial sync");

    mirror.edit(&a.id, |record| record.notes = Some("great in winter".to_string()));
    let report = sync.sync(&store).expect("sync");

    assert_eq!(report.fast_forwarded, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(
        store.get(&a.id).expect("get").notes.as_deref(),
        Some("great in winter")
    );
    assert_eq!(store.record_count().expect("count"), 1);
}

#[test]
fn pull_failure_leaves_the_store_untouched() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let a = record("forest", "misty pines", b"A", ts(1));
    store.put(&a, b"A").expect("put");

    let mirror = MemoryMirror::default();
    mirror.fail_pull.set(true);
    let failure = engine(&mirror).sync(&store).expect_err("pull fails");

    assert_eq!(failure.phase, SyncPhase::Pulling);
    assert!(failure.is_retryable());
    assert!(matches!(failure.error, SyncError::Remote(_)));
    assert_eq!(
        store.get(&a.id).expect("get").sync_state,
        SyncState::LocalOnly
    );
    assert!(store.sync_base(DATASET).expect("base").is_none());
}

#[test]
fn push_failure_keeps_the_merge_but_not_the_base() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let a = record("forest", "misty pines", b"A", ts(1));
    store.put(&a, b"A").expect("put a");

    let mirror = MemoryMirror::default();
    let b = record("forest", "frozen lake", b"B", ts(2));
    mirror.seed(b.clone(), b"B");
    mirror.fail_push.set(true);

    let sync = engine(&mirror);
    let failure = sync.sync(&store).expect_err("push fails");
    assert_eq!(failure.phase, SyncPhase::Pushing);
    assert!(store.find(&b.id).expect("find b").is_some());
    assert_eq!(
        store.get(&a.id).expect("get a").sync_state,
        SyncState::LocalOnly
    );
    assert!(store.sync_base(DATASET).expect("base").is_none());

    mirror.fail_push.set(false);
    let report = sync.sync(&store).expect("retry");
    assert_eq!(report.materialized, 0);
    assert_eq!(report.in_sync, 1);
    assert_eq!(mirror.len(), 2);
    assert_eq!(
        store.get(&a.id).expect("get a").sync_state,
        SyncState::Synced
    );
}

#[test]
fn remote_moving_during_the_cycle_rejects_the_push() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    store
        .put(&record("forest", "misty pines", b"A", ts(1)), b"A")
        .expect("put");

    let mirror = MemoryMirror::default();
    mirror.move_before_push.set(true);
    let failure = engine(&mirror).sync(&store).expect_err("rejected");

    assert_eq!(failure.phase, SyncPhase::Pushing);
    assert!(matches!(failure.error, SyncError::PushRejected { .. }));
    assert!(failure.is_retryable());
    assert_eq!(mirror.pushes.get(), 0);
}

#[test]
fn cancelled_cycle_stops_before_touching_anything() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let mirror = MemoryMirror::default();
    mirror.seed(record("forest", "frozen lake", b"B", ts(2)), b"B");

    let cancel = CancelToken::new();
    cancel.cancel();
    let failure = engine(&mirror)
        .sync_with(&store, &cancel)
        .expect_err("cancelled");
    assert!(matches!(failure.error, SyncError::Cancelled));
    assert_eq!(failure.phase, SyncPhase::Recovering);
    assert_eq!(store.record_count().expect("count"), 0);
}

#[test]
fn held_writer_lock_fails_fast() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let _held = WriterLock::try_acquire(&store.layout().writer_lock_path, "generate", ts(0))
        .expect("acquire")
        .expect("lock is free");

    let mirror = MemoryMirror::default();
    let failure = engine(&mirror).sync(&store).expect_err("lock conflict");
    assert_eq!(failure.phase, SyncPhase::Recovering);
    assert!(matches!(failure.error, SyncError::LockConflict(_)));
}

#[test]
fn two_clients_converge_through_the_shared_remote() {
    let dir_one = TempDir::new().expect("temp dir");
    let dir_two = TempDir::new().expect("temp dir");
    let one = RecordStore::open(dir_one.path()).expect("open one");
    let two = RecordStore::open(dir_two.path()).expect("open two");

    let shared = record("ocean", "quiet tide", b"tide", ts(0));
    one.put(&shared, b"tide").expect("put shared on one");
    two.put(&record("ocean", "quiet tide", b"tide", ts(5)), b"tide")
        .expect("put shared on two");
    one.put(&record("ocean", "storm front", b"storm", ts(1)), b"storm")
        .expect("put one");
    two.put(&record("ocean", "coral garden", b"coral", ts(2)), b"coral")
        .expect("put two");

    let mirror = MemoryMirror::default();
    let sync = engine(&mirror);
    sync.sync(&one).expect("one first");
    let middle = sync.sync(&two).expect("two");
    let last = sync.sync(&one).expect("one again");

    assert!(middle.conflicts.is_empty());
    assert_eq!(middle.deduplicated, 1);
    assert_eq!(two.get(&shared.id).expect("shared on two").created_at, ts(0));
    assert_eq!(mirror.len(), 3);
    assert_eq!(one.record_count().expect("one count"), 3);
    assert_eq!(two.record_count().expect("two count"), 3);
    assert!(last.conflicts.is_empty());
    assert_eq!(
        one.snapshot().expect("one snapshot").identity(),
        two.snapshot().expect("two snapshot").identity()
    );
}

#[test]
fn materialization_failure_midway_keeps_finished_records_and_resumes() {
    let dir = TempDir::new().expect("temp dir");
    let store = RecordStore::open(dir.path()).expect("open store");
    let mirror = MemoryMirror::default();
    mirror.seed(record("forest", "frozen lake", b"B", ts(2)), b"B");
    mirror.seed(record("forest", "birch grove", b"C", ts(3)), b"C");
    mirror.fail_fetch_on.set(Some(2));

    let sync = engine(&mirror);
    let failure = sync.sync(&store).expect_err("second fetch fails");
    assert_eq!(failure.phase, SyncPhase::CommittingLocal);
    assert!(matches!(failure.error, SyncError::Remote(_)));
    assert!(failure.is_retryable());

    let committed = store.list(None).expect("list");
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].sync_state, SyncState::Synced);
    assert!(store.read_image(&committed[0]).is_ok());
    assert!(store.sync_base(DATASET).expect("base").is_none());
    assert_eq!(mirror.pushes.get(), 0);

    mirror.fail_fetch_on.set(None);
    let report = sync.sync(&store).expect("resume");
    assert_eq!(report.in_sync, 1);
    assert_eq!(report.materialized, 1);
    assert!(report.conflicts.is_empty());
    assert_eq!(store.record_count().expect("count"), 2);
    assert_eq!(mirror.len(), 2);
}

#[test]
fn equal_generations_on_two_machines_sync_to_one_record_each() {
    let dir_one = TempDir::new().expect("temp dir");
    let dir_two = TempDir::new().expect("temp dir");
    let one = RecordStore::open(dir_one.path()).expect("open one");
    let two = RecordStore::open(dir_two.path()).expect("open two");

    let prompts = FixedPrompts(&["misty pines", "frozen lake", "birch grove"]);
    let pipeline = GenerationPipeline::new(PipelineConfig::default(), &prompts, SeededRenderer);
    let cancel = CancelToken::new();
    let first = pipeline
        .run_at(&one, "Forest", 3, ts(0), &cancel)
        .expect("generate on one");
    let second = pipeline
        .run_at(&two, "Forest", 3, ts(3_600_000), &cancel)
        .expect("generate on two");
    assert_eq!(first.created, second.created);

    let mirror = MemoryMirror::default();
    let sync = engine(&mirror);
    sync.sync(&one).expect("one first");
    let on_two = sync.sync(&two).expect("two");
    let back_on_one = sync.sync(&one).expect("one again");

    assert!(on_two.conflicts.is_empty());
    assert_eq!(on_two.deduplicated, 3);
    assert_eq!(on_two.pushed_uploads, 0);
    assert!(back_on_one.conflicts.is_empty());
    assert_eq!(back_on_one.in_sync, 3);

    assert_eq!(mirror.len(), 3);
    assert_eq!(one.record_count().expect("one count"), 3);
    assert_eq!(two.record_count().expect("two count"), 3);
    for record in two.list(None).expect("list two") {
        assert!(record.created_at < ts(3_600_000));
    }
    assert_eq!(
        one.snapshot().expect("one snapshot").identity(),
        two.snapshot().expect("two snapshot").identity()
    );
}
