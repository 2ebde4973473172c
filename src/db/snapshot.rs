//! Page-level copies between the live in-memory database and the snapshot file.

use std::sync::Arc;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::OpenFlags;

use super::*;

/// Pages copied per backup step. The store lock is held for the whole copy.
const PAGES_PER_STEP: i32 = 256;

impl KeyStore {
    /// Copy the in-memory database out to the snapshot file. Runs under the
    /// same lock as writes, so the file is a consistent point-in-time image.
    /// No-op without a snapshot path.
    pub fn flush_to_disk(&self) -> Result<(), LedgerError> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(());
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        self.with_conn(|conn| {
            let mut dst = Connection::open(path)?;
            {
                let backup = Backup::new(conn, &mut dst)?;
                backup.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None)?;
            }
            Ok(())
        })?;
        tracing::debug!(path = %path.display(), "snapshot flushed");
        Ok(())
    }

    /// Replace the in-memory contents with the snapshot file's pages, then
    /// re-run migrations. Returns false when there is no file to restore.
    pub fn restore_from_disk(&self) -> Result<bool, LedgerError> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(false);
        };
        if !path.exists() {
            return Ok(false);
        }
        self.with_conn(|conn| {
            let src = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
            {
                let backup = Backup::new(&src, conn)?;
                backup.run_to_completion(PAGES_PER_STEP, Duration::ZERO, None)?;
            }
            apply_migrations(conn)?;
            Ok(true)
        })
    }

    /// Spawn the debounced flush actor and route this store's mutations to it.
    /// Only the first attached flusher receives dirty signals.
    pub fn start_flusher(self: &Arc<Self>, debounce: Duration) -> Flusher {
        let flusher = Flusher::spawn(Arc::clone(self), debounce);
        if self.flush_tx.set(flusher.sender()).is_err() {
            tracing::warn!("flusher already attached; new one will only flush on request");
        }
        flusher
    }
}

impl SnapshotTarget for KeyStore {
    fn flush_snapshot(&self) -> Result<(), LedgerError> {
        self.flush_to_disk()
    }
}
