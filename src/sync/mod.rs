//! Sync Module
//!
//! Off-device backup of the encrypted vault blob.

pub mod agent;
pub mod blob_store;
pub mod gist;
pub mod state;

pub use agent::{PullOutcome, PushOutcome, SyncAgent};
pub use blob_store::{BlobStore, Pushed, RemoteBlob, Revision};
pub use gist::GistBlobStore;
pub use state::{SyncState, SyncStateStore};
