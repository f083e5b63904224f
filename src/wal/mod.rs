//! Write-ahead log: segmented durable record storage with a delivery cursor

pub mod cursor;
pub mod entry;
pub mod reader;
pub mod writer;

pub use cursor::{CursorStore, CURSOR_FILE};
pub use entry::{Position, SegmentHeader, MAX_RECORD_SIZE};
pub use reader::WalReader;
pub use writer::{Wal, WalConfig, WalError, DEFAULT_SEGMENT_SIZE};
