//! Forward iteration over WAL segments

use crate::wal::entry::{Position, FRAME_HEADER_LEN, MAX_RECORD_SIZE};
use crate::wal::writer::{list_segments, read_full, read_header, WalError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A fresh forward iterator over every retained record, in append order.
///
/// Readers snapshot the segment list at construction and cross segment
/// boundaries transparently. Exhaustion is not terminal: discard the reader
/// and build a new one to observe records appended since.
pub struct WalReader {
    segments: VecDeque<(u64, PathBuf)>,
    current: Option<SegmentCursor>,
}

struct SegmentCursor {
    id: u64,
    reader: BufReader<File>,
    offset: u64,
}

enum FrameRead {
    Record(Bytes),
    /// Clean end of the segment's frames.
    Eof,
    /// Incomplete frame at the tail, possibly still being written.
    Tail,
    Corrupt(&'static str),
}

impl WalReader {
    pub(crate) fn open(dir: &Path) -> Result<Self, WalError> {
        Ok(Self {
            segments: list_segments(dir)?.into(),
            current: None,
        })
    }

    /// The next record and its position, or `None` when no further records
    /// are currently present.
    pub fn next(&mut self) -> Result<Option<(Bytes, Position)>, WalError> {
        loop {
            if self.current.is_none() {
                let Some((id, path)) = self.segments.pop_front() else {
                    return Ok(None);
                };
                match SegmentCursor::open(id, &path)? {
                    Some(cursor) => self.current = Some(cursor),
                    None => continue,
                }
            }

            let Some(cursor) = self.current.as_mut() else {
                continue;
            };
            let offset = cursor.offset;
            match cursor.read_frame()? {
                FrameRead::Record(record) => {
                    return Ok(Some((
                        record,
                        Position {
                            segment_id: cursor.id,
                            offset,
                        },
                    )));
                }
                FrameRead::Eof => {
                    if self.segments.is_empty() {
                        return Ok(None);
                    }
                    self.current = None;
                }
                FrameRead::Tail => {
                    debug!(
                        segment = cursor.id,
                        offset, "partial frame at segment tail, stopping scan"
                    );
                    if self.segments.is_empty() {
                        return Ok(None);
                    }
                    self.current = None;
                }
                FrameRead::Corrupt(reason) => {
                    warn!(
                        segment = cursor.id,
                        offset, reason, "corrupt WAL frame, skipping rest of segment"
                    );
                    if self.segments.is_empty() {
                        return Ok(None);
                    }
                    self.current = None;
                }
            }
        }
    }
}

impl SegmentCursor {
    /// Open a segment for reading; `None` skips segments that vanished
    /// (retention cleanup) or whose header is unreadable.
    fn open(id: u64, path: &Path) -> Result<Option<Self>, WalError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Segment {:?} removed before read", path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        match read_header(&mut reader) {
            Ok((_, header_len)) => Ok(Some(Self {
                id,
                reader,
                offset: header_len,
            })),
            Err(e) => {
                warn!("Skipping segment {:?} with bad header: {}", path, e);
                Ok(None)
            }
        }
    }

    fn read_frame(&mut self) -> Result<FrameRead, WalError> {
        let mut prefix = [0u8; 8];
        match read_full(&mut self.reader, &mut prefix)? {
            0 => return Ok(FrameRead::Eof),
            n if n < 8 => return Ok(FrameRead::Tail),
            _ => {}
        }

        let len = u32::from_le_bytes(prefix[0..4].try_into().unwrap()) as u64;
        let expected = u32::from_le_bytes(prefix[4..8].try_into().unwrap());
        if len > MAX_RECORD_SIZE {
            return Ok(FrameRead::Corrupt("frame length exceeds maximum record size"));
        }

        let mut payload = vec![0u8; len as usize];
        if read_full(&mut self.reader, &mut payload)? < payload.len() {
            return Ok(FrameRead::Tail);
        }
        if crc32fast::hash(&payload) != expected {
            return Ok(FrameRead::Corrupt("checksum mismatch"));
        }

        self.offset += FRAME_HEADER_LEN + len;
        Ok(FrameRead::Record(Bytes::from(payload)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::writer::{Wal, WalConfig, DEFAULT_SEGMENT_SIZE};
    use std::io::Write;
    use tempfile::TempDir;

    fn open_wal(dir: &Path) -> Wal {
        Wal::open(WalConfig {
            dir: dir.to_path_buf(),
            max_segment_size: DEFAULT_SEGMENT_SIZE,
        })
        .unwrap()
    }

    #[test]
    fn reads_records_in_append_order() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path());
        let records = [&b"a"[..], &b"bb"[..], &b"ccc"[..]];
        let positions: Vec<Position> = records.iter().map(|r| wal.append(r).unwrap()).collect();
        wal.sync().unwrap();

        let mut reader = wal.reader().unwrap();
        for (expected, want_pos) in records.iter().zip(&positions) {
            let (record, pos) = reader.next().unwrap().unwrap();
            assert_eq!(&record[..], *expected);
            assert_eq!(pos, *want_pos);
        }
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn fresh_reader_sees_new_appends() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path());
        wal.append(b"first").unwrap();
        wal.sync().unwrap();

        let mut reader = wal.reader().unwrap();
        assert!(reader.next().unwrap().is_some());
        assert!(reader.next().unwrap().is_none());

        wal.append(b"second").unwrap();
        wal.sync().unwrap();

        let mut reader = wal.reader().unwrap();
        assert_eq!(&reader.next().unwrap().unwrap().0[..], b"first");
        assert_eq!(&reader.next().unwrap().unwrap().0[..], b"second");
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn empty_log_yields_nothing() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path());
        let mut reader = wal.reader().unwrap();
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn corrupt_tail_preserves_earlier_records() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path());
        wal.append(b"good").unwrap();
        let bad_pos = wal.append(b"mangled").unwrap();
        wal.sync().unwrap();

        // Flip a payload byte of the second record on disk.
        let (_, path) = list_segments(temp.path()).unwrap().pop().unwrap();
        let mut contents = std::fs::read(&path).unwrap();
        let corrupt_at = (bad_pos.offset + FRAME_HEADER_LEN) as usize;
        contents[corrupt_at] ^= 0xff;
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&contents)
            .unwrap();

        let mut reader = WalReader::open(temp.path()).unwrap();
        let (record, _) = reader.next().unwrap().unwrap();
        assert_eq!(&record[..], b"good");
        assert!(reader.next().unwrap().is_none());
    }

    #[test]
    fn zero_length_record_roundtrips() {
        let temp = TempDir::new().unwrap();
        let mut wal = open_wal(temp.path());
        let p1 = wal.append(b"").unwrap();
        let p2 = wal.append(b"tail").unwrap();
        wal.sync().unwrap();

        let mut reader = wal.reader().unwrap();
        let (empty, pos) = reader.next().unwrap().unwrap();
        assert!(empty.is_empty());
        assert_eq!(pos, p1);
        let (record, pos) = reader.next().unwrap().unwrap();
        assert_eq!(&record[..], b"tail");
        assert_eq!(pos, p2);
    }
}
