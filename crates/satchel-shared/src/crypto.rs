//! Authenticated sealing of short server-issued tokens.
//!
//! Output layout is `nonce (24) || ciphertext || tag (16)`. The purpose
//! string goes into the associated data, so bytes sealed for one purpose
//! never open as another even under the same key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{NONCE_SIZE, SYMMETRIC_KEY_SIZE, TAG_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; SYMMETRIC_KEY_SIZE];

pub fn random_key() -> SymmetricKey {
    let mut key = [0u8; SYMMETRIC_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// BLAKE3 key derivation, domain-separated by `context`.
pub fn key_from_secret(secret: &[u8], context: &str) -> SymmetricKey {
    blake3::derive_key(context, secret)
}

pub fn seal(key: &SymmetricKey, purpose: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let ciphertext = XChaCha20Poly1305::new(key.into())
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: purpose,
            },
        )
        .map_err(|_| CryptoError::SealFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn open(key: &SymmetricKey, purpose: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Truncated);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    XChaCha20Poly1305::new(key.into())
        .decrypt(
            XNonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: purpose,
            },
        )
        .map_err(|_| CryptoError::OpenFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::KDF_CONTEXT_HANDLE_KEY;

    #[test]
    fn test_seal_open() {
        let key = random_key();
        let sealed = seal(&key, b"test", b"quarterly-report.pdf").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 20 + TAG_SIZE);
        assert_eq!(open(&key, b"test", &sealed).unwrap(), b"quarterly-report.pdf");
    }

    #[test]
    fn test_purpose_is_bound() {
        let key = random_key();
        let sealed = seal(&key, b"download", b"42").unwrap();
        assert_eq!(open(&key, b"preview", &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn test_wrong_key_and_tampering() {
        let sealed = seal(&random_key(), b"p", b"1337").unwrap();
        assert_eq!(open(&random_key(), b"p", &sealed), Err(CryptoError::OpenFailed));

        let key = random_key();
        let mut sealed = seal(&key, b"p", b"1337").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert_eq!(open(&key, b"p", &sealed), Err(CryptoError::OpenFailed));
        assert_eq!(open(&key, b"p", &sealed[..NONCE_SIZE]), Err(CryptoError::Truncated));
    }

    #[test]
    fn test_key_from_secret() {
        let a = key_from_secret(b"correct horse", KDF_CONTEXT_HANDLE_KEY);
        let b = key_from_secret(b"correct horse", KDF_CONTEXT_HANDLE_KEY);
        let c = key_from_secret(b"battery staple", KDF_CONTEXT_HANDLE_KEY);
        let d = key_from_secret(b"correct horse", "satchel-some-other-key-v1");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
