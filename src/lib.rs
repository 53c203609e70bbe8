//! Real-time model synchronization client.
//!
//! Mirrors a server-held normalized object graph into an in-process store.
//! Long-lived streaming HTTP responses carry line-framed JSON deltas
//! (optionally base64+zstd compressed); many logical subscriptions are
//! multiplexed onto few physical connections; connection loss is retried
//! with a bounded budget; and full-list tracked relations are reconciled
//! against the store to infer deletions the server never signals explicitly.
//!
//! ```text
//! subscribe()          (debounce)            (per batch)
//! UI ------> SyncService ------> StreamService ------> Stream ---> Transport
//!                 ^                                      |
//!                 |  ModelData + authoritative id sets   | frames
//!                 +-- StoreUpdateService <-- demux <-----+
//!                          |
//!                          v
//!                      DataStore
//! ```

pub mod autoupdate;
pub mod endpoint;
pub mod error;
pub mod store;
pub mod streaming;
pub mod transport;

pub use autoupdate::{ModelRequest, ModelSubscription, SyncService};
pub use endpoint::{EndpointConfiguration, EndpointRegistry};
pub use error::{Result, SyncError};
pub use store::{DataStore, InMemoryStore, StoreUpdateService};
pub use streaming::{Stream, StreamService};
pub use transport::{Transport, TransportEvent, TransportRequest};
