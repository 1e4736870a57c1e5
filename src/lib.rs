//! deltablob - block-level delta synchronization for blob storage
//!
//! Keeps a local file and a block blob in sync by moving only the blocks
//! that changed: rolling-checksum signatures, signature search over the local
//! file, dedup-aware parallel block upload, and range-based reconstruction on
//! download.

pub mod cli;
pub mod config;
pub mod delta;
pub mod error;
pub mod format;
pub mod mmap;
pub mod retry;
pub mod signature;
pub mod storage;
pub mod sync;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use storage::ObjectStore;
pub use sync::SyncContext;
pub use types::*;
