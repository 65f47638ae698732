use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory single-writer lock over a record store. Released on drop.
pub struct WriterLock {
    file: File,
    path: PathBuf,
}

impl WriterLock {
    /// `Ok(None)` when another process or handle already holds the lock.
    pub fn try_acquire(
        path: &Path,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Self>, std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "operation={operation}\nowner_pid={}\nacquired_at={}\n",
            std::process::id(),
            now.to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
