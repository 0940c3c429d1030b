//! Versioned response cache for offline support.
//!
//! This module provides the persistent side of the agent:
//! - Named buckets mapping request identity to a stored response
//! - Request identity derived from method + URL, honouring `Vary`
//! - Worker registration records for the install/activate lifecycle

mod identity;
mod storage;
mod traits;

pub use identity::RequestKey;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{ResponseSource, WorkerRecord, WorkerState};
