//! Digest and CID helpers. One bucket is one block.

use cid::multihash::Multihash;
use cid::Cid;
use multihash_codetable::{Code, MultihashDigest};

use crate::error::{ProllyError, Result};

/// Computes the digest of `bytes` under the multihash code `hasher`.
pub fn digest_for(hasher: u64, bytes: &[u8]) -> Result<Vec<u8>> {
    let code = Code::try_from(hasher).map_err(|_| {
        ProllyError::BadInput(format!("unsupported multihash code: {hasher:#x}"))
    })?;
    Ok(code.digest(bytes).digest().to_vec())
}

/// Builds the content identifier for a bucket digest.
pub fn cid_for(codec: u64, hasher: u64, digest: &[u8]) -> Result<Cid> {
    let multihash = Multihash::wrap(hasher, digest)
        .map_err(|e| ProllyError::InvalidCid(e.to_string()))?;
    Ok(Cid::new_v1(codec, multihash))
}
