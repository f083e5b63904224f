//! Persisted delivery cursor

use crate::wal::entry::Position;
use crate::wal::writer::WalError;
use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Name of the cursor file inside the WAL directory.
pub const CURSOR_FILE: &str = "last_processed";

/// The high-water mark of delivery, persisted across restarts.
///
/// Holds the position of the last record successfully written to the remote,
/// or `None` when nothing has been delivered yet. Every record at or below
/// the cursor has been delivered at least once; records above it may or may
/// not have been.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    current: RwLock<Option<Position>>,
}

impl CursorStore {
    /// Load the cursor stored in `wal_dir`, if any.
    pub fn open(wal_dir: &Path) -> Self {
        let path = wal_dir.join(CURSOR_FILE);
        let current = Self::load(&path);
        if let Some(pos) = current {
            info!(cursor = %pos, "Loaded delivery cursor");
        }
        Self {
            path,
            current: RwLock::new(current),
        }
    }

    fn load(path: &Path) -> Option<Position> {
        let raw = std::fs::read_to_string(path).ok()?;
        match raw.trim().parse::<i64>() {
            Ok(scalar) => Position::unpack(scalar),
            Err(_) => {
                warn!(
                    "Unparseable cursor file {:?} ({:?}), delivering everything",
                    path,
                    raw.trim()
                );
                None
            }
        }
    }

    /// The in-memory cursor value.
    pub fn get(&self) -> Option<Position> {
        *self.current.read()
    }

    /// Move the cursor forward to `pos` and persist it.
    ///
    /// The in-memory copy is updated even when persistence fails, so a save
    /// error costs at most redelivery after the next restart.
    pub fn advance(&self, pos: Position) -> Result<(), WalError> {
        *self.current.write() = Some(pos);
        self.persist(pos)
    }

    /// Atomically replace the cursor file (write to a sibling, then rename).
    fn persist(&self, pos: Position) -> Result<(), WalError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(pos.pack().to_string().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| WalError::Io(e.error))?;
        Ok(())
    }
}
