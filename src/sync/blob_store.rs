//! Blob-store capability
//!
//! Authenticated push/pull of one named binary blob with revision metadata.

use async_trait::async_trait;

use crate::engine::error::EngineResult;
use crate::vault::SecretString;

/// Opaque revision identifier assigned by the store on every upload
pub type Revision = String;

/// A downloaded blob and the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlob {
    pub bytes: Vec<u8>,
    pub revision: Revision,
}

/// Where an upload landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pushed {
    pub blob_id: String,
    pub revision: Revision,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    fn store_id(&self) -> &'static str;

    /// Verifies that `token` is accepted by the store
    async fn check_access(&self, token: &SecretString) -> EngineResult<()>;

    /// Uploads `bytes`, creating a new blob when `blob_id` is `None`.
    async fn push(
        &self,
        token: &SecretString,
        blob_id: Option<&str>,
        bytes: &[u8],
    ) -> EngineResult<Pushed>;

    async fn pull(&self, token: &SecretString, blob_id: &str) -> EngineResult<RemoteBlob>;

    /// Current revision without caring about the contents
    async fn revision(&self, token: &SecretString, blob_id: &str) -> EngineResult<Revision> {
        self.pull(token, blob_id).await.map(|blob| blob.revision)
    }
}
