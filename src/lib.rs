//! Offline-first data layer for field record apps.
//!
//! Reads are served from a persistent local cache according to the current
//! connection quality, writes made without a connection are applied locally
//! and queued, and the queue is replayed with backoff once the backend is
//! reachable again. [`provider::Provider`] wires the pieces together.

pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod net;
pub mod provider;
pub mod state;
pub mod sync;

#[cfg(test)]
mod testing;

pub use client::{ClientError, OfflineClient, RequestOptions};
pub use config::Config;
pub use provider::{Provider, ProviderError};
pub use state::{ConnectionState, SyncStatus};
