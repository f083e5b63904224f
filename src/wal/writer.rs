//! Segmented append-only log writer

use crate::wal::entry::{encode_frame, Position, SegmentHeader, FRAME_HEADER_LEN, MAX_RECORD_SIZE};
use crate::wal::reader::WalReader;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Default maximum segment size before rotation (64 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// WAL store configuration.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation.
    pub max_segment_size: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }
}

/// WAL-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("WAL directory creation failed: {0}")]
    DirectoryCreation(String),
    #[error("corrupt segment header in {0}")]
    CorruptHeader(String),
    #[error("record of {0} bytes exceeds the maximum record size")]
    RecordTooLarge(usize),
    #[error("WAL is closed")]
    Closed,
}

/// Durable, ordered, segmented record log.
///
/// Records are opaque byte slices stored as length-prefixed CRC-checked
/// frames. Appends are buffered until [`sync`](Wal::sync); rotation happens
/// transparently once the active segment exceeds the configured size.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    max_segment_size: u64,
    segment: Option<SegmentWriter>,
    last_pos: Option<Position>,
    closed: bool,
}

#[derive(Debug)]
struct SegmentWriter {
    file: BufWriter<File>,
    id: u64,
    /// Current byte size of the segment, including the header region.
    size: u64,
    /// Byte offset of the first record frame (right after the header).
    data_start: u64,
}

/// Result of scanning a segment for its last valid frame boundary.
struct SegmentScan {
    valid_len: u64,
    data_start: u64,
    last_frame: Option<u64>,
}

impl Wal {
    /// Open (or create) the log in `config.dir`.
    ///
    /// An existing newest segment is scanned and a torn tail left by a crash
    /// mid-append is truncated away before the segment is reused for appends.
    pub fn open(config: WalConfig) -> Result<Self, WalError> {
        if !config.dir.exists() {
            std::fs::create_dir_all(&config.dir)
                .map_err(|e| WalError::DirectoryCreation(e.to_string()))?;
            info!("Created WAL directory: {:?}", config.dir);
        }

        let segments = list_segments(&config.dir)?;
        let (segment, last_pos) = match segments.last() {
            None => (SegmentWriter::create(&config.dir, 0)?, None),
            Some((id, path)) => match SegmentWriter::reopen(*id, path) {
                Ok((writer, last_frame)) => {
                    let last_pos = last_frame.map(|offset| Position {
                        segment_id: *id,
                        offset,
                    });
                    (writer, last_pos)
                }
                Err(e) => {
                    warn!("Unreadable tail segment {:?} ({}), rotating past it", path, e);
                    (SegmentWriter::create(&config.dir, id + 1)?, None)
                }
            },
        };

        Ok(Self {
            dir: config.dir,
            max_segment_size: config.max_segment_size,
            segment: Some(segment),
            last_pos,
            closed: false,
        })
    }

    /// Append a single record and return its position.
    ///
    /// The record is not durable until [`sync`](Wal::sync) returns.
    pub fn append(&mut self, payload: &[u8]) -> Result<Position, WalError> {
        if self.closed {
            return Err(WalError::Closed);
        }
        if payload.len() as u64 > MAX_RECORD_SIZE {
            return Err(WalError::RecordTooLarge(payload.len()));
        }

        let frame = encode_frame(payload);
        let needs_rotation = match &self.segment {
            Some(seg) => {
                seg.size + frame.len() as u64 > self.max_segment_size && seg.size > seg.data_start
            }
            None => return Err(WalError::Closed),
        };
        if needs_rotation {
            self.rotate()?;
        }

        let seg = self.segment.as_mut().ok_or(WalError::Closed)?;
        let pos = Position {
            segment_id: seg.id,
            offset: seg.size,
        };
        seg.file.write_all(&frame)?;
        seg.size += frame.len() as u64;
        self.last_pos = Some(pos);
        Ok(pos)
    }

    /// Fsync all pending appends.
    pub fn sync(&mut self) -> Result<(), WalError> {
        if self.closed {
            return Err(WalError::Closed);
        }
        if let Some(seg) = self.segment.as_mut() {
            seg.file.flush()?;
            seg.file.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// A fresh iterator starting at the earliest retained record.
    ///
    /// Readers are cheap and independent of each other; a new one sees every
    /// record appended before its construction.
    pub fn reader(&mut self) -> Result<WalReader, WalError> {
        if self.closed {
            return Err(WalError::Closed);
        }
        // Surface buffered appends to the files the reader will open.
        if let Some(seg) = self.segment.as_mut() {
            seg.file.flush()?;
        }
        WalReader::open(&self.dir)
    }

    /// Position of the most recently appended record, if known.
    pub fn last_position(&self) -> Option<Position> {
        self.last_pos
    }

    /// Delete segments whose id is below `segment_id`.
    ///
    /// The active segment is never removed. Returns the number of files
    /// deleted.
    pub fn remove_segments_before(&mut self, segment_id: u64) -> Result<usize, WalError> {
        let active = self.segment.as_ref().map(|s| s.id);
        let mut removed = 0;
        for (id, path) in list_segments(&self.dir)? {
            if id >= segment_id || Some(id) == active {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!("Removed delivered WAL segment: {:?}", path);
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove WAL segment {:?}: {}", path, e),
            }
        }
        Ok(removed)
    }

    fn rotate(&mut self) -> Result<(), WalError> {
        if let Some(seg) = self.segment.as_mut() {
            seg.file.flush()?;
            seg.file.get_ref().sync_all()?;
        }
        let next_id = self.segment.as_ref().map(|s| s.id + 1).unwrap_or(0);
        self.segment = Some(SegmentWriter::create(&self.dir, next_id)?);
        Ok(())
    }

    /// Flush, fsync and release the active segment. Idempotent.
    pub fn close(&mut self) -> Result<(), WalError> {
        if self.closed {
            return Ok(());
        }
        let result = match self.segment.as_mut() {
            Some(seg) => seg
                .file
                .flush()
                .and_then(|_| seg.file.get_ref().sync_all())
                .map_err(WalError::Io),
            None => Ok(()),
        };
        self.segment = None;
        self.closed = true;
        result
    }
}

impl SegmentWriter {
    /// Create a fresh segment file with a header.
    fn create(dir: &Path, id: u64) -> Result<Self, WalError> {
        let path = segment_path(dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;

        let header = SegmentHeader::new();
        let header_bytes = header.serialize()?;

        let mut writer = BufWriter::new(file);
        writer.write_all(&(header_bytes.len() as u32).to_le_bytes())?;
        writer.write_all(&header_bytes)?;

        let data_start = 4 + header_bytes.len() as u64;
        info!("Created new WAL segment: {:?}", path);
        Ok(Self {
            file: writer,
            id,
            size: data_start,
            data_start,
        })
    }

    /// Reopen an existing segment for appends, truncating any torn tail.
    ///
    /// Returns the writer and the offset of the last valid frame, if any.
    fn reopen(id: u64, path: &Path) -> Result<(Self, Option<u64>), WalError> {
        let scan = scan_segment(path)?;
        let file_len = std::fs::metadata(path)?.len();
        if file_len > scan.valid_len {
            warn!(
                "Truncating torn tail of {:?} from {} to {} bytes",
                path, file_len, scan.valid_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }

        let file = OpenOptions::new().append(true).open(path)?;
        Ok((
            Self {
                file: BufWriter::new(file),
                id,
                size: scan.valid_len,
                data_start: scan.data_start,
            },
            scan.last_frame,
        ))
    }
}

/// Path of the segment file with the given id.
fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal-{:016x}.log", id))
}

fn parse_segment_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix("wal-")?.strip_suffix(".log")?;
    u64::from_str_radix(hex, 16).ok()
}

/// All segment files in the directory, sorted by id.
pub(crate) fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>, WalError> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}

/// Read and validate a segment header, returning it and the bytes consumed.
pub(crate) fn read_header<R: Read>(reader: &mut R) -> Result<(SegmentHeader, u64), WalError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > 1024 {
        return Err(WalError::CorruptHeader("oversized header".to_string()));
    }

    let mut header_bytes = vec![0u8; header_len];
    reader.read_exact(&mut header_bytes)?;

    let header = SegmentHeader::deserialize(&header_bytes)?;
    if !header.validate_checksum() {
        return Err(WalError::CorruptHeader("checksum mismatch".to_string()));
    }
    if header.version != SegmentHeader::VERSION {
        return Err(WalError::CorruptHeader(format!(
            "unsupported version {}",
            header.version
        )));
    }
    Ok((header, 4 + header_len as u64))
}

/// Walk a segment's frames and find the end of the last valid one.
fn scan_segment(path: &Path) -> Result<SegmentScan, WalError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let (_, data_start) =
        read_header(&mut reader).map_err(|_| WalError::CorruptHeader(format!("{:?}", path)))?;

    let mut offset = data_start;
    let mut last_frame = None;
    loop {
        let mut prefix = [0u8; 8];
        if read_full(&mut reader, &mut prefix)? < 8 {
            break;
        }
        let len = u32::from_le_bytes(prefix[0..4].try_into().unwrap()) as u64;
        let expected = u32::from_le_bytes(prefix[4..8].try_into().unwrap());
        if len > MAX_RECORD_SIZE {
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if read_full(&mut reader, &mut payload)? < payload.len() {
            break;
        }
        if crc32fast::hash(&payload) != expected {
            break;
        }
        last_frame = Some(offset);
        offset += FRAME_HEADER_LEN + len;
    }

    Ok(SegmentScan {
        valid_len: offset,
        data_start,
        last_frame,
    })
}

/// Read until `buf` is full or EOF; returns the number of bytes read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_wal(dir: &Path, max_segment_size: u64) -> Wal {
        Wal::open(WalConfig {
            dir: dir.to_path_buf(),
            max_segment_size,
        })
        .unwrap()
    }

    #[test]
    fn append_returns_increasing_positions() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);

        let p1 = wal.append(b"one").unwrap();
        let p2 = wal.append(b"two").unwrap();
        let p3 = wal.append(b"three").unwrap();
        assert!(p1 < p2 && p2 < p3);
        assert_eq!(wal.last_position(), Some(p3));

        wal.sync().unwrap();
        assert!(!list_segments(temp.path()).unwrap().is_empty());
    }

    #[test]
    fn rotation_rolls_to_new_segments() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path(), 128);

        for i in 0..20 {
            wal.append(format!("record-{:02}", i).as_bytes()).unwrap();
        }
        wal.sync().unwrap();

        let segments = list_segments(temp.path()).unwrap();
        assert!(segments.len() > 1, "expected rotation, got {} segment(s)", segments.len());

        // The reader crosses segment boundaries transparently.
        let mut reader = wal.reader().unwrap();
        let mut seen = Vec::new();
        while let Some((record, _)) = reader.next().unwrap() {
            seen.push(String::from_utf8(record.to_vec()).unwrap());
        }
        let expected: Vec<String> = (0..20).map(|i| format!("record-{:02}", i)).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn reopen_continues_append_sequence() {
        let temp = TempDir::new().unwrap();
        let p2;
        {
            let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
            wal.append(b"first").unwrap();
            p2 = wal.append(b"second").unwrap();
            wal.sync().unwrap();
            wal.close().unwrap();
        }

        let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
        assert_eq!(wal.last_position(), Some(p2));
        let p3 = wal.append(b"third").unwrap();
        assert!(p3 > p2);
        wal.sync().unwrap();

        let mut reader = wal.reader().unwrap();
        let mut count = 0;
        while reader.next().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn torn_tail_is_truncated_on_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
            wal.append(b"kept").unwrap();
            wal.sync().unwrap();
            wal.close().unwrap();
        }

        // Simulate a crash mid-append: garbage after the last valid frame.
        let (_, path) = list_segments(temp.path()).unwrap().pop().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xde, 0xad, 0xbe]).unwrap();
        file.sync_all().unwrap();

        let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
        let pos = wal.append(b"after-crash").unwrap();
        wal.sync().unwrap();
        assert_eq!(wal.last_position(), Some(pos));

        let mut reader = wal.reader().unwrap();
        let mut seen = Vec::new();
        while let Some((record, _)) = reader.next().unwrap() {
            seen.push(record.to_vec());
        }
        assert_eq!(seen, vec![b"kept".to_vec(), b"after-crash".to_vec()]);
    }

    #[test]
    fn append_fails_once_closed() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
        wal.close().unwrap();
        assert!(matches!(wal.append(b"late"), Err(WalError::Closed)));
        // Closing again is a no-op.
        wal.close().unwrap();
    }

    #[test]
    fn oversized_record_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path(), DEFAULT_SEGMENT_SIZE);
        let huge = vec![0u8; MAX_RECORD_SIZE as usize + 1];
        assert!(matches!(
            wal.append(&huge),
            Err(WalError::RecordTooLarge(_))
        ));
    }

    #[test]
    fn cleanup_spares_active_and_newer_segments() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path(), 64);
        for i in 0..12 {
            wal.append(format!("r{}", i).as_bytes()).unwrap();
        }
        wal.sync().unwrap();

        let before = list_segments(temp.path()).unwrap();
        assert!(before.len() > 2);

        let active_id = before.last().unwrap().0;
        let removed = wal.remove_segments_before(active_id).unwrap();
        assert!(removed > 0);

        let after = list_segments(temp.path()).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].0, active_id);
    }
}
