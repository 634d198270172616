//! Durable mutation queue and its replay engine.
//!
//! Writes made while offline become [`QueuedOperation`]s persisted in the
//! store. The [`SyncEngine`] replays them when connectivity is good enough,
//! reconciles the cache from the server responses, and backs off or gives up
//! on failures.

mod backoff;
mod engine;
mod error;
mod operation;
mod queue;

pub use backoff::RetryPolicy;
pub use engine::{SyncConfig, SyncEngine, SyncReport};
pub use error::{SyncError, SyncResult};
pub use operation::{
  ConflictStrategy, NewOperation, OperationMetadata, OperationType, Priority, QueuedOperation,
};
pub use queue::OperationQueue;
