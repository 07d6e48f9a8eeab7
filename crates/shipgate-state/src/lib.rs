//! shipgate-state: persistence for the shipgate release pipeline
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: small, durable, atomically written documents that survive between
//! separate CLI invocations of the pipeline stages.
//!
//! ## Key Components
//!
//! - `FingerprintStore`: input/output fingerprints backing up-to-date checks
//! - `VersionStore`: the resolved version, written once per run
//! - `PublishRegistry`: append-only publish history enforcing release immutability

mod error;
pub mod fakes;
pub mod fs;
pub mod storage_traits;

pub use error::StateError;
pub use fs::{write_atomic, FsFingerprintStore, FsPublishRegistry, FsVersionStore};
pub use storage_traits::{
    ContentDigest, FingerprintStore, FingerprintTable, PublishRecord, PublishRegistry,
    StorageResult, VersionStore,
};

/// Result type for shipgate-state operations
pub type Result<T> = std::result::Result<T, StateError>;
