use serde::{Deserialize, Serialize};

use crate::error::{ProllyError, Result};

/// Multicodec code for DAG-CBOR, the codec used for bucket serialization.
pub const DAG_CBOR: u64 = 0x71;

/// Multihash code for SHA2-256, the default bucket hasher.
pub const SHA2_256: u64 = 0x12;

/// Multihash code for BLAKE3-256, accepted as an alternate hasher.
pub const BLAKE3_256: u64 = 0x1e;

/// Configuration fixed at tree creation and stamped into every bucket prefix.
///
/// All buckets of one tree share these values; two trees only compare equal
/// byte-for-byte when their configurations match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Expected number of entries per bucket at every level.
    pub average_bucket_size: u32,
    /// Multicodec code of the bucket codec.
    pub codec: u64,
    /// Multihash code of the bucket hasher.
    pub hasher: u64,
}

impl TreeConfig {
    pub fn new(average_bucket_size: u32, codec: u64, hasher: u64) -> Result<Self> {
        let config = TreeConfig {
            average_bucket_size,
            codec,
            hasher,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.average_bucket_size == 0 {
            return Err(ProllyError::BadInput(
                "average bucket size must be at least 1".to_string(),
            ));
        }
        if self.codec != DAG_CBOR {
            return Err(ProllyError::BadInput(format!(
                "unsupported bucket codec: {:#x}",
                self.codec
            )));
        }
        if self.hasher != SHA2_256 && self.hasher != BLAKE3_256 {
            return Err(ProllyError::BadInput(format!(
                "unsupported bucket hasher: {:#x}",
                self.hasher
            )));
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        TreeConfig {
            average_bucket_size: 30,
            codec: DAG_CBOR,
            hasher: SHA2_256,
        }
    }
}
