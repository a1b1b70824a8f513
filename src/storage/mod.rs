//! Persistence for CleanupRequests and NodeExecutions
//!
//! The controller is the only writer of request records after submission.
//! Node tasks write their own execution records through
//! [`StatusStore::record_execution`], which never lets a record move
//! backwards, so a late worker write cannot undo a cancellation and a stale
//! attempt cannot overwrite a retry.

pub mod backends;
pub mod error;
pub mod traits;

#[cfg(test)]
mod tests;

pub use backends::{FileStore, MemoryStore};
pub use error::{StoreError, StoreResult};
pub use traits::StatusStore;
