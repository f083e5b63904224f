//! Durable network log shipper
//!
//! A [`NetWriter`] binds together the WAL store, the persisted delivery
//! cursor and the background flusher. Producers write records through a
//! cloneable [`ShipperHandle`]; the flusher ships them to the remote TCP
//! endpoint in append order, reconnecting across outages and resuming from
//! the cursor across restarts (at-least-once delivery).

mod flusher;
pub mod handle;

pub use handle::ShipperHandle;

use crate::config::{ConfigError, NetWriterConfig};
use crate::wal::{CursorStore, Wal, WalConfig, WalError, DEFAULT_SEGMENT_SIZE};
use flusher::Flusher;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info};

/// Errors surfaced while provisioning or running a writer instance.
#[derive(Debug, thiserror::Error)]
pub enum ShipperError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("failed to reach {address}: {source}")]
    Dial {
        address: String,
        source: std::io::Error,
    },
}

/// One durable writer instance bound to a remote address.
///
/// The WAL directory is exclusive to this instance; multiple instances may
/// target the same remote as long as each uses its own directory.
#[derive(Debug)]
pub struct NetWriter {
    config: NetWriterConfig,
    wal: Arc<Mutex<Wal>>,
    cursor: Arc<CursorStore>,
    connected: Arc<AtomicBool>,
    wal_dir: PathBuf,
    cancel: watch::Sender<bool>,
    flusher: Option<tokio::task::JoinHandle<()>>,
}

impl NetWriter {
    /// Open a writer with the default segment size.
    ///
    /// The WAL lives at `<data_dir>/wal/netwriter/<address>`. Unless
    /// `soft_start` is set, the remote is probed synchronously and an
    /// unreachable endpoint fails the open; with `soft_start` the error is
    /// deferred to the background reconnect loop.
    pub async fn open(
        config: NetWriterConfig,
        data_dir: impl AsRef<Path>,
    ) -> Result<Self, ShipperError> {
        Self::open_with_segment_size(config, data_dir, DEFAULT_SEGMENT_SIZE).await
    }

    /// Open a writer with an explicit WAL segment size.
    pub async fn open_with_segment_size(
        config: NetWriterConfig,
        data_dir: impl AsRef<Path>,
        max_segment_size: u64,
    ) -> Result<Self, ShipperError> {
        config.validate()?;

        let wal_dir = data_dir
            .as_ref()
            .join("wal")
            .join("netwriter")
            .join(&config.address);
        let wal = Wal::open(WalConfig {
            dir: wal_dir.clone(),
            max_segment_size,
        })?;
        let cursor = Arc::new(CursorStore::open(&wal_dir));

        if !config.soft_start {
            probe(&config.address, config.dial_timeout)
                .await
                .map_err(|e| ShipperError::Dial {
                    address: config.address.clone(),
                    source: e,
                })?;
        }

        let wal = Arc::new(Mutex::new(wal));
        let connected = Arc::new(AtomicBool::new(false));
        let (cancel, cancel_rx) = watch::channel(false);
        let flusher = Flusher::new(&config, wal.clone(), cursor.clone(), connected.clone(), cancel_rx);
        let task = tokio::spawn(flusher.run());

        info!(address = %config.address, wal_dir = %wal_dir.display(), "network writer opened");
        Ok(Self {
            config,
            wal,
            cursor,
            connected,
            wal_dir,
            cancel,
            flusher: Some(task),
        })
    }

    /// A cloneable producer handle routing `write` calls into the WAL.
    pub fn handle(&self) -> ShipperHandle {
        ShipperHandle::new(self.wal.clone())
    }

    /// Snapshot of the writer's observable state.
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "address": self.config.address,
            "connected": self.connected.load(Ordering::Relaxed),
            "cursor": self.cursor.get().map(|p| p.to_string()),
            "last_appended": self.wal.lock().last_position().map(|p| p.to_string()),
            "wal_dir": self.wal_dir.display().to_string(),
        })
    }

    /// Cancel the flusher, wait for its drain to finish, and close the WAL.
    pub async fn close(mut self) -> Result<(), ShipperError> {
        info!(address = %self.config.address, "closing network writer");
        let _ = self.cancel.send(true);
        if let Some(task) = self.flusher.take() {
            if let Err(e) = task.await {
                error!(error = %e, "flusher task failed");
            }
        }
        // The flusher closes the WAL on its way out; this covers the case
        // where it died early.
        self.wal.lock().close()?;
        Ok(())
    }
}

/// Dial-and-close reachability check used when soft start is off.
async fn probe(address: &str, dial_timeout: Duration) -> std::io::Result<()> {
    let stream = if dial_timeout.is_zero() {
        TcpStream::connect(address).await?
    } else {
        match timeout(dial_timeout, TcpStream::connect(address)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "connection attempt timed out",
                ))
            }
        }
    };
    drop(stream);
    Ok(())
}
