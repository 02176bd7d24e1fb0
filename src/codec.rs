//! Canonical bucket codec.
//!
//! A serialized bucket is one DAG-CBOR value: `[prefix, entries]` with
//! `prefix = [average, level, codec, hasher]` and each entry
//! `[timestamp, hash, message]` (hash and message as byte strings). Decoding
//! re-encodes and compares bytes; content addressing breaks the moment a
//! non-canonical encoding is accepted.

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::bucket::Prefix;
use crate::error::{ProllyError, Result};
use crate::node::{validate_entry_hash, Entry};

#[derive(Serialize, Deserialize)]
struct WirePrefix(u32, u32, u64, u64);

#[derive(Serialize, Deserialize)]
struct WireEntry(i64, ByteBuf, ByteBuf);

#[derive(Serialize, Deserialize)]
struct WireBucket(WirePrefix, Vec<WireEntry>);

/// Encodes a prefix and its entries into the canonical bucket bytes.
pub fn encode_bucket(prefix: &Prefix, entries: &[Entry]) -> Result<Vec<u8>> {
    let wire = WireBucket(
        WirePrefix(prefix.average, prefix.level, prefix.codec, prefix.hasher),
        entries
            .iter()
            .map(|e| {
                WireEntry(
                    e.timestamp,
                    ByteBuf::from(e.hash.clone()),
                    ByteBuf::from(e.message.clone()),
                )
            })
            .collect(),
    );
    serde_ipld_dagcbor::to_vec(&wire).map_err(|e| ProllyError::Serialization(e.to_string()))
}

/// Decodes bucket bytes, enforcing canonical form and entry validity.
pub fn decode_bucket(bytes: &[u8]) -> Result<(Prefix, Vec<Entry>)> {
    let wire: WireBucket = serde_ipld_dagcbor::from_slice(bytes)
        .map_err(|e| ProllyError::MalformedBlock(format!("cbor decode failed: {e}")))?;

    let WireBucket(WirePrefix(average, level, codec, hasher), wire_entries) = wire;
    let prefix = Prefix {
        average,
        level,
        codec,
        hasher,
    };

    let mut entries = Vec::with_capacity(wire_entries.len());
    for WireEntry(timestamp, hash, message) in wire_entries {
        let hash = hash.into_vec();
        validate_entry_hash(&hash)
            .map_err(|e| ProllyError::MalformedBlock(format!("invalid entry: {e}")))?;
        entries.push(Entry::new(timestamp, hash, message.into_vec()));
    }

    for pair in entries.windows(2) {
        if pair[0].cmp_entry_tuple(&pair[1]).is_ge() {
            return Err(ProllyError::MalformedBlock(
                "bucket entries are not strictly ascending".to_string(),
            ));
        }
    }

    // Canonicality: the bytes must round-trip exactly.
    let reencoded = encode_bucket(&prefix, &entries)?;
    if reencoded != bytes {
        return Err(ProllyError::MalformedBlock(
            "non-canonical bucket encoding".to_string(),
        ));
    }

    Ok((prefix, entries))
}
