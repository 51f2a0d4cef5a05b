//! Persistent resource store for the upgrade orchestrator
//!
//! Records are JSON blobs under fixed keys. Every write is a compare-and-swap
//! against the snapshot the writer last read; a stale writer gets
//! [`Error::Conflict`](stride_common::Error::Conflict) and must re-read.

pub mod codec;
pub mod file;
pub mod manager;
pub mod memory;
pub mod store;

pub use codec::RECORD_TYPE_VERSION;
pub use file::FileStore;
pub use manager::{Record, StoreManager, Stored};
pub use memory::MemoryStore;
pub use store::{ResourceStore, SnapshotToken, TimeoutStore, Versioned};
