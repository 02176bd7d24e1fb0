use async_trait::async_trait;
use cid::Cid;

use crate::error::Result;

/// Trait for a content-addressed block store.
///
/// Implementations store opaque byte blocks under their CID. Reads are
/// idempotent and writes are content-addressed, so repeating either is
/// harmless. The tree core never deletes blocks; reclamation of unreferenced
/// buckets is the caller's concern.
#[async_trait]
pub trait BlockStore: Send + Sync + std::fmt::Debug + 'static {
    /// Retrieves a block by CID. Returns `Ok(None)` when absent.
    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>>;

    /// Stores a block under the given CID. Implementations may assume the
    /// CID matches the bytes; the tree verifies digests on read.
    async fn put(&self, cid: &Cid, bytes: Vec<u8>) -> Result<()>;

    /// Checks block presence without fetching the bytes.
    async fn has(&self, cid: &Cid) -> Result<bool> {
        self.get(cid).await.map(|opt| opt.is_some())
    }
}
