use cid::Cid;
use multihash::Multihash;
use serde::{
    de::{Deserialize, Deserializer, Error as _},
    ser::{Serialize, Serializer},
};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Multicodec code for raw binary content.
const RAW_CODEC: u64 = 0x55;

/// Multihash code for SHA2-256.
const SHA2_256_CODE: u64 = 0x12;

/// Label every test identifier is derived from. Both the harness and any
/// external driver derive the same sequence from it, so they never need to
/// exchange identifiers explicitly.
const TEST_CID_BASE: &[u8] = b"dhttest";

/// Self-describing, hash-derived identifier for a piece of content.
///
/// Wraps a CIDv1 over a SHA2-256 multihash. The string form (base32) is the
/// wire representation used by the RPC layer and the CLI.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId(Cid);

impl ContentId {
    /// Derive the test identifier at the given sequence position.
    pub fn derive(seq: u64) -> Self {
        let mut input = Vec::with_capacity(TEST_CID_BASE.len() + 8);
        input.extend_from_slice(TEST_CID_BASE);
        input.extend_from_slice(&seq.to_le_bytes());

        let digest = Sha256::digest(&input);
        let hash = Multihash::<64>::wrap(SHA2_256_CODE, &digest)
            .expect("SHA2-256 digest always fits in a multihash");

        Self(Cid::new_v1(RAW_CODEC, hash))
    }

    /// Generate the deterministic test identifier sequence.
    ///
    /// Regenerating with the same `count` always yields the same sequence.
    pub fn test_set(count: usize) -> Vec<Self> {
        (0..count as u64).map(Self::derive).collect()
    }

    /// Key under which provider records for this identifier live: the SHA-256
    /// of the identifier's multihash digest (its "double hash"), truncated to
    /// a bit prefix when `prefix_length` is non-zero.
    ///
    /// A prefix length of 0 (or the full 256 bits) selects the whole key.
    /// Trailing bits of a partial byte are masked off so equal prefixes
    /// produce equal keys.
    pub fn record_key(&self, prefix_length: u16) -> Vec<u8> {
        let digest = Sha256::digest(self.0.hash().digest());

        if prefix_length == 0 || usize::from(prefix_length) >= digest.len() * 8 {
            return digest.to_vec();
        }

        let full_bytes = usize::from(prefix_length / 8);
        let partial_bits = prefix_length % 8;

        let mut key = digest[..full_bytes + usize::from(partial_bits > 0)].to_vec();
        if partial_bits > 0 {
            if let Some(last) = key.last_mut() {
                *last &= 0xffu8 << (8 - partial_bits);
            }
        }

        key
    }
}

#[derive(Debug, Error)]
#[error("invalid content identifier")]
pub struct ParseContentIdError(#[source] cid::Error);

impl FromStr for ContentId {
    type Err = ParseContentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Cid::try_from(s).map_err(ParseContentIdError)?))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ----------------------------------------------------------------------------//
