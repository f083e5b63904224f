//! Synchronous producer front-end

use crate::wal::Wal;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::{debug, error};

/// The write handle handed to the logging frontend.
///
/// Each call to [`write`](io::Write::write) stores one record: it appends to
/// the WAL, fsyncs and returns. Delivery to the remote happens asynchronously
/// in the flusher; this path never performs network I/O, so its latency is
/// bounded by the append + fsync pair.
///
/// Handles are cheap to clone and any number of threads may write
/// concurrently; records never interleave because the WAL mutex serializes
/// whole appends.
#[derive(Clone)]
pub struct ShipperHandle {
    wal: Arc<Mutex<Wal>>,
}

impl ShipperHandle {
    pub(crate) fn new(wal: Arc<Mutex<Wal>>) -> Self {
        Self { wal }
    }
}

impl io::Write for ShipperHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wal = self.wal.lock();
        let pos = wal.append(buf).map_err(io::Error::other)?;
        // A failed fsync leaves the record buffered; it will reach disk with
        // the next successful sync and a fresh reader will still observe it.
        if let Err(e) = wal.sync() {
            error!(position = %pos, error = %e, "WAL sync failed after append");
        }
        debug!(position = %pos, len = buf.len(), "record appended");
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.wal.lock().sync().map_err(io::Error::other)
    }
}
