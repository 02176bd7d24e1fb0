use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cid::Cid;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::BlockStore;

#[derive(Debug, Default)]
struct MemoryBlockStoreInner {
    blocks: HashMap<Cid, Vec<u8>>,
}

/// An in-memory `BlockStore` backed by `tokio::sync::RwLock`.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<MemoryBlockStoreInner>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.blocks.is_empty()
    }

    /// Snapshot of every stored block, for tests and tooling.
    pub async fn all_blocks(&self) -> HashMap<Cid, Vec<u8>> {
        self.inner.read().await.blocks.clone()
    }

    /// Replaces a block's bytes regardless of content. Corruption-injection
    /// escape hatch for tests; regular writes go through `put`.
    pub async fn overwrite(&self, cid: &Cid, bytes: Vec<u8>) {
        self.inner.write().await.blocks.insert(*cid, bytes);
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        let guard = self.inner.read().await;
        Ok(guard.blocks.get(cid).cloned())
    }

    async fn put(&self, cid: &Cid, bytes: Vec<u8>) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.blocks.entry(*cid).or_insert(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{cid_for, digest_for};
    use crate::common::{DAG_CBOR, SHA2_256};

    fn cid_of(bytes: &[u8]) -> Cid {
        let digest = digest_for(SHA2_256, bytes).unwrap();
        cid_for(DAG_CBOR, SHA2_256, &digest).unwrap()
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = MemoryBlockStore::new();
        let bytes = b"block".to_vec();
        let cid = cid_of(&bytes);

        store.put(&cid, bytes.clone()).await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), Some(bytes));
        assert!(store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = MemoryBlockStore::new();
        let cid = cid_of(b"never stored");
        assert_eq!(store.get(&cid).await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_is_idempotent_by_cid() {
        let store = MemoryBlockStore::new();
        let bytes = b"original".to_vec();
        let cid = cid_of(&bytes);

        store.put(&cid, bytes.clone()).await.unwrap();
        store.put(&cid, b"imposter".to_vec()).await.unwrap();
        assert_eq!(store.get(&cid).await.unwrap(), Some(bytes));
        assert_eq!(store.len().await, 1);
    }
}
