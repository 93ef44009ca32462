//! Versioned, checksummed envelope for cached snapshots.
//!
//! Layout: CBOR `{ magic, schema_version, checksum, payload }` where `payload`
//! is the CBOR encoding of a [`CachedSnapshot`] and `checksum` is its BLAKE3
//! hash. With a [`CryptoProvider`] configured the whole envelope is sealed
//! with AAD bound to the row's owner/kind/id.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::crypto::{build_aad, CryptoError, CryptoProvider};
use crate::model::{CachedSnapshot, SnapshotKey};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
const SNAPSHOT_MAGIC: [u8; 4] = *b"TNSN";
const MAX_SNAPSHOT_BYTES: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted snapshot: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("unknown schema version: {0}")]
    UnknownSchema(u32),

    #[error("snapshot too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    #[error("snapshot stored under {stored} but decoded as {decoded}")]
    KeyMismatch { stored: String, decoded: String },
}

impl CodecError {
    /// The bytes were readable but do not match what was written.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            Self::Corrupted { .. } | Self::IntegrityCheckFailed { .. } | Self::KeyMismatch { .. }
        )
    }

    pub fn is_crypto_failure(&self) -> bool {
        matches!(self, Self::Crypto(_))
    }
}

impl From<ciborium::de::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        CodecError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for CodecError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        CodecError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct SnapshotCodec {
    crypto: Option<Arc<dyn CryptoProvider>>,
}

impl std::fmt::Debug for SnapshotCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotCodec")
            .field("sealed", &self.crypto.is_some())
            .finish()
    }
}

impl SnapshotCodec {
    pub fn plain() -> Self {
        Self { crypto: None }
    }

    pub fn sealed(crypto: Arc<dyn CryptoProvider>) -> Self {
        Self {
            crypto: Some(crypto),
        }
    }

    pub fn encode(&self, snapshot: &CachedSnapshot) -> Result<Vec<u8>, CodecError> {
        let mut payload = Vec::new();
        ciborium::into_writer(snapshot, &mut payload)?;

        let envelope = SnapshotEnvelope {
            magic: SNAPSHOT_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)?;

        match &self.crypto {
            Some(crypto) => {
                let key = snapshot.key();
                let aad = build_aad(CURRENT_SCHEMA_VERSION, &key.owner, key.kind, &key.id)?;
                Ok(crypto.seal(&bytes, &aad)?)
            }
            None => Ok(bytes),
        }
    }

    /// Decodes a row and checks it really belongs to `expected`.
    pub fn decode(&self, expected: &SnapshotKey, bytes: &[u8]) -> Result<CachedSnapshot, CodecError> {
        if bytes.is_empty() {
            return Err(CodecError::Corrupted {
                reason: "empty row",
            });
        }
        if bytes.len() > MAX_SNAPSHOT_BYTES {
            return Err(CodecError::TooLarge {
                size: bytes.len(),
                max: MAX_SNAPSHOT_BYTES,
            });
        }

        let opened;
        let envelope_bytes = match &self.crypto {
            Some(crypto) => {
                let aad = build_aad(
                    CURRENT_SCHEMA_VERSION,
                    &expected.owner,
                    expected.kind,
                    &expected.id,
                )?;
                opened = crypto.open(bytes, &aad)?;
                &opened[..]
            }
            None => bytes,
        };

        let envelope: SnapshotEnvelope = ciborium::from_reader(envelope_bytes)?;

        if envelope.magic != SNAPSHOT_MAGIC {
            return Err(CodecError::Corrupted {
                reason: "invalid magic bytes",
            });
        }
        if envelope.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(CodecError::FutureSchema {
                found: envelope.schema_version,
                max: CURRENT_SCHEMA_VERSION,
            });
        }

        let actual = blake3::hash(&envelope.payload);
        if actual.as_bytes() != &envelope.checksum {
            return Err(CodecError::IntegrityCheckFailed {
                expected: hex::encode(envelope.checksum),
                actual: hex::encode(actual.as_bytes()),
            });
        }

        let snapshot = if envelope.schema_version < CURRENT_SCHEMA_VERSION {
            migrate(envelope.schema_version, &envelope.payload)?
        } else {
            ciborium::from_reader(&envelope.payload[..])?
        };

        let decoded = snapshot.key();
        if &decoded != expected {
            return Err(CodecError::KeyMismatch {
                stored: expected.to_string(),
                decoded: decoded.to_string(),
            });
        }
        Ok(snapshot)
    }
}

fn migrate(from_version: u32, _payload: &[u8]) -> Result<CachedSnapshot, CodecError> {
    // No released version predates v1 yet.
    Err(CodecError::UnknownSchema(from_version))
}
