use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use wpg_core::{
    content_hash, normalize_prompt, normalize_topic, ContractError, Record, RecordId, Snapshot,
    SyncState, TopicView,
};

pub const DATASET_SCHEMA_VERSION: i64 = 2;
pub const DATABASE_FILE_NAME: &str = "wallpapers.db";
pub const IMAGE_DIR_NAME: &str = "wp";
pub const WRITER_LOCK_FILE_NAME: &str = ".writer.lock";

const RECORD_COLUMNS: &str = "record_id, topic, prompt, image_path, image_hash, width, height, \
                              seed, created_at, sync_state, notes, is_favorite";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("record not found: {0}")]
    NotFound(RecordId),
    #[error("image bytes for {record_id} hash to {found}, record says {expected}")]
    ImageHashMismatch {
        record_id: RecordId,
        expected: String,
        found: String,
    },
    #[error("image path {image_path} already belongs to {owner}")]
    ImagePathTaken { image_path: String, owner: RecordId },
}

/// Where a store keeps its database, images and writer lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    pub root: PathBuf,
    pub database_path: PathBuf,
    pub image_dir: PathBuf,
    pub writer_lock_path: PathBuf,
}

impl StoreLayout {
    pub fn under(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_path: root.join(DATABASE_FILE_NAME),
            image_dir: root.join(IMAGE_DIR_NAME),
            writer_lock_path: root.join(WRITER_LOCK_FILE_NAME),
            root,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub partial_writes_removed: Vec<String>,
    pub orphaned_files_removed: Vec<String>,
    pub orphaned_records_removed: Vec<RecordId>,
}

impl RecoveryReport {
    pub fn repairs(&self) -> usize {
        self.partial_writes_removed.len()
            + self.orphaned_files_removed.len()
            + self.orphaned_records_removed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.repairs() == 0
    }
}

/// Local durable store: record metadata in SQLite plus the image directory.
/// It is the only component that touches image files.
pub struct RecordStore {
    conn: Connection,
    layout: StoreLayout,
}

impl RecordStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_layout(StoreLayout::under(root))
    }

    pub fn open_with_layout(layout: StoreLayout) -> Result<Self, StorageError> {
        fs::create_dir_all(&layout.image_dir)?;
        if let Some(parent) = layout.database_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&layout.database_path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        let store = Self { conn, layout };
        store.migrate()?;
        Ok(store)
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > DATASET_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: DATASET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_dataset_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_sync_base.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    pub fn image_file(&self, record: &Record) -> PathBuf {
        self.layout.image_dir.join(&record.image_path)
    }

    /// Writes the image file, then the metadata row. A crash between the two
    /// leaves an orphan that `recover` cleans up.
    pub fn put(&self, record: &Record, image_bytes: &[u8]) -> Result<RecordId, StorageError> {
        record.validate_image_path()?;
        let found = content_hash(image_bytes);
        if found != record.image_hash {
            return Err(StorageError::ImageHashMismatch {
                record_id: record.id.clone(),
                expected: record.image_hash.clone(),
                found,
            });
        }

        if let Some(owner) = self.image_path_owner(&record.image_path)? {
            if owner != record.id {
                return Err(StorageError::ImagePathTaken {
                    image_path: record.image_path.clone(),
                    owner,
                });
            }
        }

        let previous = self.find(&record.id)?;
        let target = self.image_file(record);
        let reuse_file = previous.as_ref().is_some_and(|existing| {
            existing.image_path == record.image_path
                && existing.image_hash == record.image_hash
                && target.is_file()
        });
        if !reuse_file {
            write_file_atomically(&target, image_bytes)?;
        }

        if let Err(err) = self.upsert_record(record) {
            if previous.is_none() {
                let _ = fs::remove_file(&target);
            }
            return Err(err);
        }

        if let Some(previous) = previous.filter(|existing| existing.image_path != record.image_path)
        {
            let stale = self.image_file(&previous);
            if let Err(err) = fs::remove_file(&stale) {
                debug!(path = %stale.display(), error = %err, "stale image already gone");
            }
        }

        Ok(record.id.clone())
    }

    fn upsert_record(&self, record: &Record) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT INTO records (
                record_id,
                topic,
                prompt,
                prompt_key,
                image_path,
                image_hash,
                width,
                height,
                seed,
                created_at,
                sync_state,
                notes,
                is_favorite
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(record_id) DO UPDATE SET
                topic=excluded.topic,
                prompt=excluded.prompt,
                prompt_key=excluded.prompt_key,
                image_path=excluded.image_path,
                image_hash=excluded.image_hash,
                width=excluded.width,
                height=excluded.height,
                seed=excluded.seed,
                created_at=excluded.created_at,
                sync_state=excluded.sync_state,
                notes=excluded.notes,
                is_favorite=excluded.is_favorite
            ",
            params![
                record.id.as_str(),
                normalize_topic(&record.topic),
                record.prompt,
                normalize_prompt(&record.prompt),
                record.image_path,
                record.image_hash,
                i64::from(record.width),
                i64::from(record.height),
                record.seed as i64,
                format_timestamp(record.created_at),
                record.sync_state.as_str(),
                record.notes,
                record.is_favorite,
            ],
        )?;
        Ok(())
    }

    fn image_path_owner(&self, image_path: &str) -> Result<Option<RecordId>, StorageError> {
        let owner = self
            .conn
            .query_row(
                "SELECT record_id FROM records WHERE image_path = ?1",
                [image_path],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(owner.map(RecordId::new))
    }

    pub fn find(&self, id: &RecordId) -> Result<Option<Record>, StorageError> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"),
                [id.as_str()],
                record_from_row,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get(&self, id: &RecordId) -> Result<Record, StorageError> {
        self.find(id)?
            .ok_or_else(|| StorageError::NotFound(id.clone()))
    }

    /// Records ordered by `created_at`, ties by id. `topic` is matched by key.
    pub fn list(&self, topic: Option<&str>) -> Result<Vec<Record>, StorageError> {
        let records = match topic {
            Some(topic) => {
                let mut statement = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM records WHERE topic = ?1 \
                     ORDER BY created_at ASC, record_id ASC"
                ))?;
                let rows = statement.query_map([normalize_topic(topic)], record_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut statement = self.conn.prepare(&format!(
                    "SELECT {RECORD_COLUMNS} FROM records ORDER BY created_at ASC, record_id ASC"
                ))?;
                let rows = statement.query_map([], record_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    pub fn topics(&self) -> Result<Vec<TopicView>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT topic, COUNT(*), MAX(created_at)
            FROM records
            GROUP BY topic
            ORDER BY topic ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            let last = row
                .get::<_, Option<String>>(2)?
                .map(|value| parse_timestamp(value).map_err(|err| conversion_error(2, err)))
                .transpose()?;
            Ok(TopicView {
                topic: row.get(0)?,
                record_count: row.get::<_, i64>(1)? as usize,
                last_generated_at: last,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn record_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?)
    }

    pub fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(Snapshot::from_records(Utc::now(), None, self.list(None)?))
    }

    pub fn read_image(&self, record: &Record) -> Result<Vec<u8>, StorageError> {
        Ok(fs::read(self.image_file(record))?)
    }

    pub fn mark_synced(&self, ids: &[RecordId]) -> Result<usize, StorageError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut updated = 0;
        for id in ids {
            updated += tx.execute(
                "UPDATE records SET sync_state = ?2 WHERE record_id = ?1",
                params![id.as_str(), SyncState::Synced.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Edits the user-facing annotations of one record.
    pub fn annotate(
        &self,
        id: &RecordId,
        notes: Option<Option<&str>>,
        is_favorite: Option<bool>,
    ) -> Result<Record, StorageError> {
        let mut record = self.get(id)?;
        if let Some(notes) = notes {
            record.notes = notes.map(str::to_string);
        }
        if let Some(is_favorite) = is_favorite {
            record.is_favorite = is_favorite;
        }
        self.conn.execute(
            "UPDATE records SET notes = ?2, is_favorite = ?3 WHERE record_id = ?1",
            params![id.as_str(), record.notes, record.is_favorite],
        )?;
        Ok(record)
    }

    /// Explicit user removal: drops the row and its image file.
    pub fn remove(&self, id: &RecordId) -> Result<bool, StorageError> {
        let Some(record) = self.find(id)? else {
            return Ok(false);
        };
        self.conn
            .execute("DELETE FROM records WHERE record_id = ?1", [id.as_str()])?;
        let file = self.image_file(&record);
        if let Err(err) = fs::remove_file(&file) {
            warn!(record_id = %id, path = %file.display(), error = %err, "image file missing on remove");
        }
        Ok(true)
    }

    /// Removes partial writes, files without a record and records without a file.
    pub fn recover(&self) -> Result<RecoveryReport, StorageError> {
        let mut report = RecoveryReport::default();
        let records = self.list(None)?;
        let known = records
            .iter()
            .map(|record| record.image_path.clone())
            .collect::<BTreeSet<_>>();

        let mut names = Vec::new();
        for entry in fs::read_dir(&self.layout.image_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        for name in names {
            let path = self.layout.image_dir.join(&name);
            if name.starts_with('.') && name.ends_with(".tmp") {
                fs::remove_file(&path)?;
                warn!(file = %name, "recovery removed partial image write");
                report.partial_writes_removed.push(name);
            } else if !known.contains(&name) {
                fs::remove_file(&path)?;
                warn!(file = %name, "recovery removed image without record");
                report.orphaned_files_removed.push(name);
            }
        }

        for record in records {
            if self.image_file(&record).is_file() {
                continue;
            }
            self.conn.execute(
                "DELETE FROM records WHERE record_id = ?1",
                [record.id.as_str()],
            )?;
            warn!(
                record_id = %record.id,
                file = %record.image_path,
                "recovery removed record without image"
            );
            report.orphaned_records_removed.push(record.id);
        }

        Ok(report)
    }

    pub fn sync_base(&self, dataset_id: &str) -> Result<Option<Snapshot>, StorageError> {
        let json = self
            .conn
            .query_row(
                "SELECT snapshot_json FROM sync_base WHERE dataset_id = ?1",
                [dataset_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        json.map(|json| {
            serde_json::from_str::<Snapshot>(&json)
                .map_err(|err| StorageError::Serialization(err.to_string()))
        })
        .transpose()
    }

    pub fn sync_base_identity(&self, dataset_id: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .conn
            .query_row(
                "SELECT identity FROM sync_base WHERE dataset_id = ?1",
                [dataset_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Records `snapshot` as the new base and marks its records synced, atomically.
    pub fn commit_sync_base(
        &self,
        dataset_id: &str,
        snapshot: &Snapshot,
    ) -> Result<usize, StorageError> {
        let snapshot_json = serde_json::to_string(snapshot)
            .map_err(|err| StorageError::Serialization(err.to_string()))?;

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "
            INSERT INTO sync_base (
                dataset_id,
                identity,
                revision,
                taken_at,
                record_count,
                snapshot_json,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(dataset_id) DO UPDATE SET
                identity=excluded.identity,
                revision=excluded.revision,
                taken_at=excluded.taken_at,
                record_count=excluded.record_count,
                snapshot_json=excluded.snapshot_json,
                updated_at=excluded.updated_at
            ",
            params![
                dataset_id,
                snapshot.identity(),
                snapshot.revision,
                format_timestamp(snapshot.taken_at),
                snapshot.len() as i64,
                snapshot_json,
                format_timestamp(Utc::now()),
            ],
        )?;

        let mut marked = 0;
        for id in snapshot.records.keys() {
            marked += tx.execute(
                "UPDATE records SET sync_state = ?2 WHERE record_id = ?1",
                params![id.as_str(), SyncState::Synced.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(marked)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table_name],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        Ok(exists)
    }
}

fn write_file_atomically(target: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = target
        .parent()
        .ok_or_else(|| std::io::Error::other("image path has no parent directory"))?;
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = dir.join(format!(".{name}.tmp"));

    let mut file = File::create(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);
    fs::rename(&temp, target)?;
    Ok(())
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let created_at =
        parse_timestamp(row.get::<_, String>(8)?).map_err(|err| conversion_error(8, err))?;
    let sync_state = row
        .get::<_, String>(9)?
        .parse::<SyncState>()
        .map_err(|err| conversion_error(9, err))?;

    Ok(Record {
        id: RecordId::new(row.get::<_, String>(0)?),
        topic: row.get(1)?,
        prompt: row.get(2)?,
        image_path: row.get(3)?,
        image_hash: row.get(4)?,
        width: row.get::<_, i64>(5)? as u32,
        height: row.get::<_, i64>(6)? as u32,
        seed: row.get::<_, i64>(7)? as u64,
        created_at,
        sync_state,
        notes: row.get(10)?,
        is_favorite: row.get(11)?,
    })
}

fn conversion_error<E>(column: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use wpg_core::{derive_record_id, image_file_name, IMAGE_EXTENSION};

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_760_000_000_000 + ms)
            .single()
            .expect("valid timestamp")
    }

    fn sample(topic: &str, prompt: &str, bytes: &[u8], created_at: DateTime<Utc>) -> Record {
        let image_hash = content_hash(bytes);
        let id = derive_record_id(topic, prompt, &image_hash);
        Record {
            image_path: image_file_name(&id, IMAGE_EXTENSION),
            id,
            topic: normalize_topic(topic),
            prompt: prompt.to_string(),
            image_hash,
            width: 1280,
            height: 768,
            seed: 7,
            created_at,
            sync_state: SyncState::LocalOnly,
            notes: None,
            is_favorite: false,
        }
    }

    #[test]
    fn migration_creates_dataset_tables() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");

        for table in ["records", "sync_base"] {
            assert!(store.table_exists(table).expect("table check"));
        }
        assert_eq!(
            store.schema_version().expect("schema version"),
            DATASET_SCHEMA_VERSION
        );
        assert!(store.layout().image_dir.is_dir());
    }

    #[test]
    fn put_then_get_roundtrip_and_list_order() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");

        let late = sample("Forest", "pines at dusk", b"dusk", ts(100));
        let early = sample("Forest", "pines at dawn", b"dawn", ts(0));
        let tied = sample("Ocean", "quiet tide", b"tide", ts(100));

        for (record, bytes) in [
            (&late, b"dusk".as_slice()),
            (&early, b"dawn".as_slice()),
            (&tied, b"tide".as_slice()),
        ] {
            store.put(record, bytes).expect("put");
        }

        let loaded = store.get(&early.id).expect("get");
        assert_eq!(loaded, early);
        assert_eq!(store.read_image(&loaded).expect("read image"), b"dawn");

        let listed = store.list(None).expect("list");
        assert_eq!(listed[0].id, early.id);
        let mut tied_ids = vec![late.id.clone(), tied.id.clone()];
        tied_ids.sort();
        assert_eq!(
            listed[1..].iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            tied_ids
        );

        let forest = store.list(Some("  FOREST ")).expect("list topic");
        assert_eq!(forest.len(), 2);

        assert!(matches!(
            store.get(&RecordId::new("wp-missing")),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn put_rejects_bytes_that_do_not_match_the_record_hash() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        let record = sample("forest", "pines", b"expected", ts(0));

        let err = store.put(&record, b"other").expect_err("hash mismatch");
        assert!(matches!(err, StorageError::ImageHashMismatch { .. }));
        assert_eq!(store.record_count().expect("count"), 0);
        assert!(!store.image_file(&record).exists());
    }

    #[test]
    fn topics_project_counts_and_latest_timestamp() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        store
            .put(&sample("Forest", "a", b"a", ts(0)), b"a")
            .expect("put a");
        store
            .put(&sample("Forest", "b", b"b", ts(50)), b"b")
            .expect("put b");
        store
            .put(&sample("Ocean", "c", b"c", ts(10)), b"c")
            .expect("put c");

        let topics = store.topics().expect("topics");
        assert_eq!(
            topics,
            vec![
                TopicView {
                    topic: "forest".to_string(),
                    record_count: 2,
                    last_generated_at: Some(ts(50)),
                },
                TopicView {
                    topic: "ocean".to_string(),
                    record_count: 1,
                    last_generated_at: Some(ts(10)),
                },
            ]
        );
    }

    #[test]
    fn recovery_removes_orphans_on_both_sides() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        let kept = sample("forest", "kept", b"kept", ts(0));
        let lost = sample("forest", "lost", b"lost", ts(1));
        store.put(&kept, b"kept").expect("put kept");
        store.put(&lost, b"lost").expect("put lost");

        fs::remove_file(store.image_file(&lost)).expect("drop file");
        let image_dir = store.layout().image_dir.clone();
        fs::write(image_dir.join("stray.png"), b"stray").expect("stray file");
        fs::write(image_dir.join(".wp-half.png.tmp"), b"half").expect("tmp file");

        let report = store.recover().expect("recover");
        assert_eq!(report.orphaned_records_removed, vec![lost.id.clone()]);
        assert_eq!(report.orphaned_files_removed, vec!["stray.png".to_string()]);
        assert_eq!(
            report.partial_writes_removed,
            vec![".wp-half.png.tmp".to_string()]
        );
        assert_eq!(report.repairs(), 3);

        assert!(store.find(&lost.id).expect("find").is_none());
        assert!(store.image_file(&kept).is_file());
        assert!(store.recover().expect("second pass").is_clean());
    }

    #[test]
    fn put_refuses_to_steal_another_records_image_path() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        let first = sample("forest", "first", b"first", ts(0));
        store.put(&first, b"first").expect("put first");

        let mut second = sample("forest", "second", b"second", ts(1));
        second.image_path = first.image_path.clone();
        let err = store.put(&second, b"second").expect_err("path taken");
        assert!(matches!(err, StorageError::ImagePathTaken { .. }));
        assert_eq!(store.read_image(&first).expect("image"), b"first");
    }

    #[test]
    fn sync_base_and_synced_marks_survive_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let record = sample("forest", "pines", b"pines", ts(0));
        let identity = {
            let store = RecordStore::open(dir.path()).expect("open store");
            store.put(&record, b"pines").expect("put");
            let mut snapshot = store.snapshot().expect("snapshot");
            snapshot.revision = Some("r1".to_string());
            assert_eq!(
                store
                    .commit_sync_base("dataset-a", &snapshot)
                    .expect("commit base"),
                1
            );
            snapshot.identity()
        };

        let store = RecordStore::open(dir.path()).expect("reopen store");
        let base = store
            .sync_base("dataset-a")
            .expect("load base")
            .expect("base present");
        assert_eq!(base.revision.as_deref(), Some("r1"));
        assert_eq!(base.identity(), identity);
        assert_eq!(
            store.sync_base_identity("dataset-a").expect("identity"),
            Some(identity)
        );
        assert!(store.sync_base("dataset-b").expect("other").is_none());
        assert_eq!(
            store.get(&record.id).expect("get").sync_state,
            SyncState::Synced
        );
    }

    #[test]
    fn annotate_and_remove_touch_only_the_target() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        let keep = sample("forest", "keep", b"keep", ts(0));
        let drop_me = sample("forest", "drop", b"drop", ts(1));
        store.put(&keep, b"keep").expect("put keep");
        store.put(&drop_me, b"drop").expect("put drop");

        let annotated = store
            .annotate(&keep.id, Some(Some("wallpaper of the week")), Some(true))
            .expect("annotate");
        assert!(annotated.is_favorite);
        assert_eq!(store.get(&keep.id).expect("get"), annotated);
        assert_ne!(annotated.content_hash(), keep.content_hash());

        assert!(store.remove(&drop_me.id).expect("remove"));
        assert!(!store.remove(&drop_me.id).expect("second remove"));
        assert!(!store.image_file(&drop_me).exists());
        assert_eq!(store.record_count().expect("count"), 1);
    }

    #[test]
    fn mark_synced_updates_only_known_ids() {
        let dir = TempDir::new().expect("temp dir");
        let store = RecordStore::open(dir.path()).expect("open store");
        let record = sample("forest", "pines", b"pines", ts(0));
        store.put(&record, b"pines").expect("put");

        let updated = store
            .mark_synced(&[record.id.clone(), RecordId::new("wp-unknown")])
            .expect("mark synced");
        assert_eq!(updated, 1);
        assert_eq!(
            store.get(&record.id).expect("get").sync_state,
            SyncState::Synced
        );
    }
}
