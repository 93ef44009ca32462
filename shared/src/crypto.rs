use aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use secrecy::{ExposeSecret, Secret};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use zeroize::Zeroize;

use crate::model::{EntityId, EntityKind, OwnerId};

const SEAL_MAGIC: [u8; 8] = *b"TNSEAL01";
const CURRENT_VERSION: u8 = 1;
// magic(8) + version(1) + alg(1) + key_id(4) + nonce(24)
const HEADER_SIZE: usize = 38;
const TAG_SIZE: usize = 16;
const NONCE_SIZE: usize = 24;
const KEY_SIZE: usize = 32;
const MAX_AAD_FIELD: usize = 1024;
const MAX_SEALED_BYTES: usize = 2 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    Malformed,
    UnsupportedVersion(u8),
    UnsupportedAlgorithm(u8),
    WrongKey { key_id: u32 },
    AuthenticationFailed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("randomness unavailable")]
    RandomUnavailable,

    #[error("sealed payload too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("aad field too large: {field} has {size} > {max}")]
    AadFieldTooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("aad required but empty")]
    AadRequired,

    #[error("sealing failed")]
    SealFailed,

    #[error("unsealing failed: {0:?}")]
    OpenFailed(OpenFailure),
}

/// Authenticated encryption for snapshot bodies at rest.
pub trait CryptoProvider: Send + Sync {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
        getrandom::getrandom(out).map_err(|_| CryptoError::RandomUnavailable)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum AlgId {
    XChaCha20Poly1305 = 1,
}

/// Single-key XChaCha20-Poly1305 sealer. The key id is written into every
/// header so a rotated key fails loudly instead of producing garbage.
pub struct SnapshotSealer<R: RandomProvider = OsRng> {
    key_id: u32,
    key: Secret<[u8; KEY_SIZE]>,
    rng: R,
    sealed: AtomicU64,
    open_failures: AtomicU64,
}

impl SnapshotSealer<OsRng> {
    pub fn new(key_id: u32, key_bytes: &[u8]) -> Result<Self, CryptoError> {
        Self::with_rng(key_id, key_bytes, OsRng)
    }
}

impl<R: RandomProvider> SnapshotSealer<R> {
    pub fn with_rng(key_id: u32, key_bytes: &[u8], rng: R) -> Result<Self, CryptoError> {
        if key_bytes.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: key_bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(key_bytes);
        let sealer = Self {
            key_id,
            key: Secret::new(key),
            rng,
            sealed: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
        };
        key.zeroize();
        Ok(sealer)
    }

    pub fn key_id(&self) -> u32 {
        self.key_id
    }

    pub fn open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::Relaxed)
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(self.key.expose_secret()))
    }

    fn open_inner(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < HEADER_SIZE + TAG_SIZE || sealed[0..8] != SEAL_MAGIC {
            return Err(CryptoError::OpenFailed(OpenFailure::Malformed));
        }
        if sealed.len() > MAX_SEALED_BYTES {
            return Err(CryptoError::TooLarge {
                size: sealed.len(),
                max: MAX_SEALED_BYTES,
            });
        }
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }

        let version = sealed[8];
        if version != CURRENT_VERSION {
            return Err(CryptoError::OpenFailed(OpenFailure::UnsupportedVersion(
                version,
            )));
        }
        let alg = sealed[9];
        if alg != AlgId::XChaCha20Poly1305 as u8 {
            return Err(CryptoError::OpenFailed(OpenFailure::UnsupportedAlgorithm(
                alg,
            )));
        }

        let mut key_id_bytes = [0u8; 4];
        key_id_bytes.copy_from_slice(&sealed[10..14]);
        let key_id = u32::from_le_bytes(key_id_bytes);
        if key_id != self.key_id {
            return Err(CryptoError::OpenFailed(OpenFailure::WrongKey { key_id }));
        }

        let nonce = XNonce::from_slice(&sealed[14..HEADER_SIZE]);
        let body = &sealed[HEADER_SIZE..];
        let ct_len = body.len() - TAG_SIZE;
        let mut buffer = body[..ct_len].to_vec();

        if self
            .cipher()
            .decrypt_in_place_detached(nonce, aad, &mut buffer, body[ct_len..].into())
            .is_err()
        {
            buffer.zeroize();
            return Err(CryptoError::OpenFailed(OpenFailure::AuthenticationFailed));
        }
        Ok(buffer)
    }
}

impl<R: RandomProvider> CryptoProvider for SnapshotSealer<R> {
    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if aad.is_empty() {
            return Err(CryptoError::AadRequired);
        }
        let total_len = HEADER_SIZE + plaintext.len() + TAG_SIZE;
        if total_len > MAX_SEALED_BYTES {
            return Err(CryptoError::TooLarge {
                size: total_len,
                max: MAX_SEALED_BYTES,
            });
        }

        let mut nonce = [0u8; NONCE_SIZE];
        self.rng.fill(&mut nonce)?;

        let mut out = vec![0u8; total_len];
        out[0..8].copy_from_slice(&SEAL_MAGIC);
        out[8] = CURRENT_VERSION;
        out[9] = AlgId::XChaCha20Poly1305 as u8;
        out[10..14].copy_from_slice(&self.key_id.to_le_bytes());
        out[14..HEADER_SIZE].copy_from_slice(&nonce);

        let pt_end = HEADER_SIZE + plaintext.len();
        out[HEADER_SIZE..pt_end].copy_from_slice(plaintext);

        let tag = self
            .cipher()
            .encrypt_in_place_detached(XNonce::from_slice(&nonce), aad, &mut out[HEADER_SIZE..pt_end])
            .map_err(|_| CryptoError::SealFailed)?;
        out[pt_end..].copy_from_slice(&tag);

        self.sealed.fetch_add(1, Ordering::Relaxed);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let result = self.open_inner(sealed, aad);
        if result.is_err() {
            self.open_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

/// Binds a sealed body to the row it was written for, so a blob copied onto
/// another entity fails to open. Fields are length-prefixed.
pub fn build_aad(
    schema_version: u32,
    owner: &OwnerId,
    kind: EntityKind,
    id: &EntityId,
) -> Result<Vec<u8>, CryptoError> {
    let fields: [(&'static str, &str); 3] = [
        ("owner", owner.as_str()),
        ("kind", kind.as_str()),
        ("id", id.as_str()),
    ];

    let mut aad = Vec::with_capacity(4 + fields.iter().map(|(_, v)| 2 + v.len()).sum::<usize>());
    aad.extend_from_slice(&schema_version.to_le_bytes());
    for (name, value) in fields {
        if value.len() > MAX_AAD_FIELD {
            return Err(CryptoError::AadFieldTooLarge {
                field: name,
                size: value.len(),
                max: MAX_AAD_FIELD,
            });
        }
        aad.extend_from_slice(&(value.len() as u16).to_le_bytes());
        aad.extend_from_slice(value.as_bytes());
    }
    Ok(aad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    struct SequentialRng(AtomicU8);

    impl RandomProvider for SequentialRng {
        fn fill(&self, out: &mut [u8]) -> Result<(), CryptoError> {
            let seed = self.0.fetch_add(1, Ordering::Relaxed);
            for (i, b) in out.iter_mut().enumerate() {
                *b = seed.wrapping_add(i as u8);
            }
            Ok(())
        }
    }

    fn sealer() -> SnapshotSealer<SequentialRng> {
        SnapshotSealer::with_rng(7, &[0x42; 32], SequentialRng(AtomicU8::new(1))).unwrap()
    }

    fn aad_for(id: &str) -> Vec<u8> {
        build_aad(1, &OwnerId::new("u1"), EntityKind::Note, &EntityId::new(id)).unwrap()
    }

    #[test]
    fn seal_then_open() {
        let s = sealer();
        let sealed = s.seal(b"private body", &aad_for("n1")).unwrap();
        assert_eq!(&sealed[0..8], &SEAL_MAGIC);
        assert_eq!(sealed.len(), HEADER_SIZE + 12 + TAG_SIZE);
        assert_eq!(s.open(&sealed, &aad_for("n1")).unwrap(), b"private body");
    }

    #[test]
    fn blob_moved_to_another_row_fails() {
        let s = sealer();
        let sealed = s.seal(b"body", &aad_for("n1")).unwrap();
        assert_eq!(
            s.open(&sealed, &aad_for("n2")),
            Err(CryptoError::OpenFailed(OpenFailure::AuthenticationFailed))
        );
        assert_eq!(s.open_failures(), 1);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let s = sealer();
        let mut sealed = s.seal(b"body", &aad_for("n1")).unwrap();
        sealed[HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            s.open(&sealed, &aad_for("n1")),
            Err(CryptoError::OpenFailed(OpenFailure::AuthenticationFailed))
        ));
    }

    #[test]
    fn rotated_key_is_reported() {
        let sealed = sealer().seal(b"body", &aad_for("n1")).unwrap();
        let other =
            SnapshotSealer::with_rng(8, &[0x42; 32], SequentialRng(AtomicU8::new(1))).unwrap();
        assert_eq!(
            other.open(&sealed, &aad_for("n1")),
            Err(CryptoError::OpenFailed(OpenFailure::WrongKey { key_id: 7 }))
        );
    }

    #[test]
    fn rejects_bad_key_and_empty_aad() {
        assert!(matches!(
            SnapshotSealer::new(1, &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { actual: 16, .. })
        ));
        assert_eq!(sealer().seal(b"x", &[]), Err(CryptoError::AadRequired));
        assert_eq!(
            sealer().open(b"short", &aad_for("n1")),
            Err(CryptoError::OpenFailed(OpenFailure::Malformed))
        );
    }

    #[test]
    fn nonces_differ_between_seals() {
        let s = sealer();
        let a = s.seal(b"same", &aad_for("n1")).unwrap();
        let b = s.seal(b"same", &aad_for("n1")).unwrap();
        assert_ne!(a[14..HEADER_SIZE], b[14..HEADER_SIZE]);
    }
}
