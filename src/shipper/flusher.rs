//! Background flusher draining the WAL to the remote endpoint

use crate::config::NetWriterConfig;
use crate::wal::{CursorStore, Position, Wal};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Period between WAL scans while connected.
const SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Per-record delivery attempts during the shutdown drain.
const DRAIN_ATTEMPTS: u32 = 3;

/// Pause between drain delivery attempts.
const DRAIN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Last-resort sink for records the shutdown drain cannot deliver.
pub(crate) type DumpSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// The single background task that ships WAL records to the remote.
///
/// Driven by two tickers: a scan tick that walks the WAL forward from the
/// cursor while connected, and a reconnect tick that redials while
/// disconnected. Every successful dial is followed immediately by a scan
/// pass. On cancellation the flusher drains with bounded retries, dumps
/// anything undeliverable to stderr, then syncs and closes the WAL.
pub(crate) struct Flusher {
    address: String,
    dial_timeout: Duration,
    reconnect_interval: Duration,
    wal: Arc<Mutex<Wal>>,
    cursor: Arc<CursorStore>,
    connected: Arc<AtomicBool>,
    cancel: watch::Receiver<bool>,
    conn: Option<TcpStream>,
    /// Highest segment id below which delivered segments were cleaned up.
    cleaned_below: u64,
    /// Where undeliverable records land during the drain (stderr by default).
    dump: DumpSink,
}

impl Flusher {
    pub(crate) fn new(
        config: &NetWriterConfig,
        wal: Arc<Mutex<Wal>>,
        cursor: Arc<CursorStore>,
        connected: Arc<AtomicBool>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            address: config.address.clone(),
            dial_timeout: config.dial_timeout,
            reconnect_interval: config.reconnect_interval,
            wal,
            cursor,
            connected,
            cancel,
            conn: None,
            cleaned_below: 0,
            dump: Arc::new(Mutex::new(
                Box::new(std::io::stderr()) as Box<dyn Write + Send>
            )),
        }
    }

    #[cfg(test)]
    pub(crate) fn set_dump(&mut self, dump: DumpSink) {
        self.dump = dump;
    }

    pub(crate) async fn run(mut self) {
        let mut cancel = self.cancel.clone();
        let mut scan = interval(SCAN_INTERVAL);
        scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconnect = interval(self.reconnect_interval);
        reconnect.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.changed() => break,

                _ = scan.tick() => {
                    if self.conn.is_some() {
                        self.scan_pass().await;
                    }
                }

                _ = reconnect.tick() => {
                    if self.conn.is_none() {
                        match self.dial().await {
                            Ok(stream) => {
                                info!(address = %self.address, "connected to remote");
                                self.conn = Some(stream);
                                self.connected.store(true, Ordering::Relaxed);
                                self.scan_pass().await;
                            }
                            Err(e) => {
                                warn!(address = %self.address, error = %e, "dial failed, will retry");
                            }
                        }
                    }
                }
            }
        }

        self.drain().await;
        self.connected.store(false, Ordering::Relaxed);

        let mut wal = self.wal.lock();
        if let Err(e) = wal.sync() {
            error!(error = %e, "failed to sync WAL on shutdown");
        }
        if let Err(e) = wal.close() {
            error!(error = %e, "failed to close WAL on shutdown");
        }
    }

    async fn dial(&self) -> std::io::Result<TcpStream> {
        if self.dial_timeout.is_zero() {
            return TcpStream::connect(self.address.as_str()).await;
        }
        match timeout(self.dial_timeout, TcpStream::connect(self.address.as_str())).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection attempt timed out",
            )),
        }
    }

    /// Walk the WAL forward from the cursor, shipping every newer record.
    ///
    /// Uses a fresh reader each pass so no long-lived iterator has to observe
    /// concurrent appends; the cursor filters records already delivered.
    async fn scan_pass(&mut self) {
        let last = self.wal.lock().last_position();
        if let (Some(cursor), Some(last)) = (self.cursor.get(), last) {
            if cursor >= last {
                return;
            }
        }

        let mut reader = match self.wal.lock().reader() {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "failed to open WAL reader");
                return;
            }
        };

        loop {
            let step = {
                let _wal = self.wal.lock();
                reader.next()
            };
            let (record, pos) = match step {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "WAL read failed, abandoning scan");
                    break;
                }
            };

            if let Some(cursor) = self.cursor.get() {
                if pos <= cursor {
                    debug!(position = %pos, "skipping already delivered record");
                    continue;
                }
            }

            if !self.send_record(&record).await {
                break;
            }
            self.advance(pos);
        }
    }

    /// Write one record to the socket; on failure disconnect and report
    /// `false` so the record stays beyond the cursor for the next pass.
    async fn send_record(&mut self, record: &Bytes) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        match conn.write_all(record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %self.address, error = %e, "remote write failed, disconnecting");
                self.disconnect();
                false
            }
        }
    }

    fn disconnect(&mut self) {
        self.conn = None;
        self.connected.store(false, Ordering::Relaxed);
    }

    fn advance(&mut self, pos: Position) {
        debug!(position = %pos, "advancing cursor");
        if let Err(e) = self.cursor.advance(pos) {
            // The record is already delivered; the cost of a lost save is
            // redelivery after the next restart.
            error!(position = %pos, error = %e, "failed to persist cursor");
        }

        if pos.segment_id > self.cleaned_below {
            match self.wal.lock().remove_segments_before(pos.segment_id) {
                Ok(_) => self.cleaned_below = pos.segment_id,
                Err(e) => warn!(error = %e, "failed to clean up delivered segments"),
            }
        }
    }

    /// Final delivery pass after cancellation.
    ///
    /// Each remaining record gets up to three attempts separated by one
    /// second, dialing opportunistically. Records that still cannot be
    /// delivered are dumped to stderr so nothing disappears silently.
    async fn drain(&mut self) {
        let mut reader = match self.wal.lock().reader() {
            Ok(reader) => reader,
            Err(e) => {
                error!(error = %e, "failed to open WAL reader for drain");
                return;
            }
        };

        let mut delivered = 0u64;
        let mut dumped = 0u64;
        loop {
            let step = {
                let _wal = self.wal.lock();
                reader.next()
            };
            let (record, pos) = match step {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "WAL read failed during drain");
                    break;
                }
            };

            if let Some(cursor) = self.cursor.get() {
                if pos <= cursor {
                    continue;
                }
            }

            if self.deliver_with_retries(&record).await {
                self.advance(pos);
                delivered += 1;
            } else {
                error!(position = %pos, "drain retries exhausted, dumping record to stderr");
                let mut dump = self.dump.lock();
                let _ = dump.write_all(&record);
                let _ = dump.flush();
                dumped += 1;
            }
        }

        info!(delivered, dumped, "flusher drained");
    }

    async fn deliver_with_retries(&mut self, record: &Bytes) -> bool {
        for attempt in 1..=DRAIN_ATTEMPTS {
            if attempt > 1 {
                sleep(DRAIN_RETRY_DELAY).await;
            }
            if self.conn.is_none() {
                match self.dial().await {
                    Ok(stream) => {
                        self.conn = Some(stream);
                        self.connected.store(true, Ordering::Relaxed);
                    }
                    Err(e) => {
                        debug!(attempt, error = %e, "drain dial failed");
                        continue;
                    }
                }
            }
            if self.send_record(record).await {
                return true;
            }
        }
        false
    }
}
