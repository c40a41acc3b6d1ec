//! Fingerprinting: SHA-256 digests of source identifiers and payload bytes

use std::io::Read;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// Width of every fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// Block size used when digesting a payload stream.
const READ_BLOCK_SIZE: usize = 8192;

/// Compute the SHA-256 digest of data
pub fn sha256(data: &[u8]) -> [u8; FINGERPRINT_LEN] {
    Sha256::digest(data).into()
}

macro_rules! fingerprint_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; FINGERPRINT_LEN]);

        impl $name {
            /// Return the fingerprint as a lowercase hex string
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parse a 64-character hex string
            pub fn from_hex(s: &str) -> StoreResult<Self> {
                let mut bytes = [0u8; FINGERPRINT_LEN];
                hex::decode_to_slice(s, &mut bytes)
                    .map_err(|e| StoreError::InvalidFingerprint(format!("{:?}: {}", s, e)))?;
                Ok(Self(bytes))
            }

            /// Return the raw bytes
            pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
                &self.0
            }

            /// First 12 hex characters, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..6])
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl std::str::FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_hex(s)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

fingerprint_type!(
    /// SHA-256 of a canonical source identifier (the URL string as fetched).
    /// Primary key under which an artifact's current content is tracked.
    IdentifierFingerprint
);

fingerprint_type!(
    /// SHA-256 of raw payload bytes. Equal fingerprints mean the same content.
    ContentFingerprint
);

impl IdentifierFingerprint {
    /// Fingerprint a source identifier
    pub fn of_source(source_identifier: &str) -> Self {
        Self(sha256(source_identifier.as_bytes()))
    }
}

impl ContentFingerprint {
    /// Fingerprint payload bytes
    pub fn of(payload: &[u8]) -> Self {
        Self(sha256(payload))
    }

    /// Read a payload stream to the end in fixed-size blocks, digesting as it
    /// goes. Fails once more than `limit` bytes have been read.
    pub fn digest_reader<R: Read>(mut reader: R, limit: u64) -> StoreResult<(Vec<u8>, Self)> {
        let mut hasher = Sha256::new();
        let mut payload = Vec::new();
        let mut block = [0u8; READ_BLOCK_SIZE];
        loop {
            let n = match reader.read(&mut block) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(StoreError::UnreadablePayload(e)),
            };
            if (payload.len() + n) as u64 > limit {
                return Err(StoreError::PayloadTooLarge {
                    size: (payload.len() + n) as u64,
                    limit,
                });
            }
            hasher.update(&block[..n]);
            payload.extend_from_slice(&block[..n]);
        }
        Ok((payload, Self(hasher.finalize().into())))
    }
}
