use cid::Cid;
use log::{trace, warn};

use crate::bucket::{Bucket, Prefix};
use crate::chunk;
use crate::codec;
use crate::error::{ProllyError, Result};
use crate::store::BlockStore;

/// Fetches a bucket by digest and verifies it end to end: decode must be
/// canonical, the prefix must match the expectation (level included), and the
/// bytes must hash back to the requested digest.
pub(crate) async fn load_bucket<S: BlockStore>(
    store: &S,
    digest: &[u8],
    expected: &Prefix,
) -> Result<Bucket> {
    let cid = chunk::cid_for(expected.codec, expected.hasher, digest)?;
    let bytes = store
        .get(&cid)
        .await?
        .ok_or(ProllyError::NotFound(cid))?;

    let (prefix, entries) = codec::decode_bucket(&bytes)?;

    if prefix.level != expected.level {
        warn!(
            "bucket {cid} carries level {} where {} was expected",
            prefix.level, expected.level
        );
        return Err(ProllyError::LevelMismatch {
            expected: expected.level,
            actual: prefix.level,
        });
    }
    if prefix != *expected {
        return Err(ProllyError::PrefixMismatch(format!(
            "expected {expected:?}, got {prefix:?}"
        )));
    }

    let actual_digest = chunk::digest_for(expected.hasher, &bytes)?;
    if actual_digest != digest {
        warn!("bucket {cid} bytes do not hash to the requested digest");
        return Err(ProllyError::DigestMismatch { cid });
    }

    trace!("loaded bucket {cid} (level {}, {} entries)", prefix.level, entries.len());
    Ok(Bucket::from_verified_parts(prefix, entries, bytes, actual_digest))
}

/// Writes a bucket's canonical bytes under its CID.
pub(crate) async fn store_bucket<S: BlockStore>(store: &S, bucket: &Bucket) -> Result<Cid> {
    let cid = bucket.cid()?;
    store.put(&cid, bucket.bytes().to_vec()).await?;
    trace!("stored bucket {cid} (level {})", bucket.level());
    Ok(cid)
}
