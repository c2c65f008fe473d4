//! chainsync-storage: record store backends for ChainSync.
//!
//! Backends:
//! - [`memory`]: in-memory, versioned and revertible (dev/testing, no persistence)

pub mod memory;

pub use memory::MemoryRecordStore;
