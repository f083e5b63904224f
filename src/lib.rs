//! CrabShip - Durable Network Log Shipper
//!
//! A reconnecting TCP log shipper backed by an on-disk write-ahead log.
//! Producers hand records to a non-blocking [`std::io::Write`] front-end;
//! a background flusher delivers them to the remote in order, surviving
//! crashes and outages with at-least-once semantics.

pub mod config;
pub mod shipper;
pub mod wal;

pub use config::{Config, NetWriterConfig};
pub use shipper::{NetWriter, ShipperHandle};

/// CrabShip version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for CrabShip operations
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
