//! Download handles.
//!
//! A handle is `base64url(nonce || XChaCha20-Poly1305(id as decimal text))`.
//! Every encode draws a fresh nonce, so the same id yields a different
//! handle each time while all of them resolve back to it. Anything that fails
//! to authenticate is rejected outright.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::constants::{KDF_CONTEXT_HANDLE_KEY, NONCE_SIZE, TAG_SIZE};
use crate::crypto::{self, SymmetricKey};
use crate::error::HandleError;
use crate::types::BlobId;

const HANDLE_PURPOSE: &[u8] = b"blob-download";

#[derive(Clone)]
pub struct HandleCodec {
    key: SymmetricKey,
}

impl HandleCodec {
    pub fn new(key: SymmetricKey) -> Self {
        Self { key }
    }

    /// Derive the codec key from an operator-supplied secret.
    pub fn from_secret(secret: &str) -> Self {
        Self::new(crypto::key_from_secret(secret.as_bytes(), KDF_CONTEXT_HANDLE_KEY))
    }

    pub fn encode(&self, id: BlobId) -> Result<String, HandleError> {
        let sealed = crypto::seal(&self.key, HANDLE_PURPOSE, id.to_string().as_bytes())?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decode(&self, token: &str) -> Result<BlobId, HandleError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| HandleError::Encoding)?;
        if raw.len() <= NONCE_SIZE + TAG_SIZE {
            return Err(HandleError::Truncated);
        }

        let plaintext = crypto::open(&self.key, HANDLE_PURPOSE, &raw)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| HandleError::Payload)?;
        text.parse::<BlobId>().map_err(|_| HandleError::Payload)
    }
}

impl std::fmt::Debug for HandleCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleCodec").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_key;
    use rand::Rng;

    #[test]
    fn test_round_trip_random_ids() {
        let codec = HandleCodec::new(random_key());
        let mut rng = rand::thread_rng();

        for _ in 0..10_000 {
            let id = BlobId(rng.gen_range(1..i64::MAX));
            let token = codec.encode(id).unwrap();
            assert_eq!(codec.decode(&token).unwrap(), id);
        }
    }

    #[test]
    fn test_fresh_nonce_per_encode() {
        let codec = HandleCodec::from_secret("dev-secret");
        let a = codec.encode(BlobId(99)).unwrap();
        let b = codec.encode(BlobId(99)).unwrap();

        assert_ne!(a, b);
        assert_eq!(codec.decode(&a).unwrap(), BlobId(99));
        assert_eq!(codec.decode(&b).unwrap(), BlobId(99));
    }

    #[test]
    fn test_url_safe_alphabet() {
        let codec = HandleCodec::from_secret("dev-secret");
        for id in 0..200 {
            let token = codec.encode(BlobId(id)).unwrap();
            assert!(token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = HandleCodec::from_secret("one").encode(BlobId(5)).unwrap();
        assert_eq!(
            HandleCodec::from_secret("two").decode(&token),
            Err(HandleError::Authentication)
        );
    }

    #[test]
    fn test_tampered_and_truncated_rejected() {
        let codec = HandleCodec::from_secret("dev-secret");
        let token = codec.encode(BlobId(12)).unwrap();

        let mut raw = URL_SAFE_NO_PAD.decode(&token).unwrap();
        raw[NONCE_SIZE] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(&raw);
        assert!(codec.decode(&tampered).is_err());

        assert_eq!(codec.decode(&token[..20]), Err(HandleError::Truncated));
        assert_eq!(codec.decode("not base64!"), Err(HandleError::Encoding));
        assert!(codec.decode("").is_err());
    }

    #[test]
    fn test_non_numeric_payload_rejected() {
        let key = random_key();
        let sealed = crypto::seal(&key, HANDLE_PURPOSE, b"../etc/passwd").unwrap();
        let token = URL_SAFE_NO_PAD.encode(sealed);
        assert_eq!(
            HandleCodec::new(key).decode(&token),
            Err(HandleError::Payload)
        );
    }
}
