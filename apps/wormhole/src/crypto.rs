use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use spake2::{Ed25519Group, Identity, Password, Spake2};
use thiserror::Error;

const SESSION_SALT: &[u8] = b"wormhole:session:v1";
const HKDF_INFO_AEAD: &[u8] = b"wormhole:signaling:aead:v1";
const HKDF_INFO_FINGERPRINT: &[u8] = b"wormhole:fingerprint:v1";
const JOINER_IDENTITY: &[u8] = b"wormhole:slot-joiner";
const CREATOR_IDENTITY: &[u8] = b"wormhole:slot-creator";
const NONCE_LEN: usize = 12;
const FINGERPRINT_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key exchange failed: {0}")]
    Exchange(String),
    #[error("key derivation failed: {0}")]
    Derive(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SealError {
    #[error("message could not be opened with the session key")]
    BadKey,
    #[error("message could not be sealed")]
    Seal,
}

/// Symmetric key shared by both peers once the key exchange has completed.
///
/// Every signaling message after the exchange is sealed with it, and the
/// fingerprint shown to both users is derived from it.
#[derive(Clone)]
pub struct SessionKey {
    aead_key: [u8; 32],
    fingerprint: [u8; FINGERPRINT_LEN],
}

impl SessionKey {
    pub fn from_shared_secret(shared: &[u8]) -> Result<Self, KeyError> {
        let hkdf = Hkdf::<Sha256>::new(Some(SESSION_SALT), shared);
        let mut aead_key = [0u8; 32];
        hkdf.expand(HKDF_INFO_AEAD, &mut aead_key)
            .map_err(|err| KeyError::Derive(err.to_string()))?;
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        hkdf.expand(HKDF_INFO_FINGERPRINT, &mut fingerprint)
            .map_err(|err| KeyError::Derive(err.to_string()))?;
        Ok(Self {
            aead_key,
            fingerprint,
        })
    }

    /// Encrypts `plaintext` and returns `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.aead_key).map_err(|_| SealError::Seal)?;
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| SealError::Seal)?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < NONCE_LEN {
            return Err(SealError::BadKey);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher =
            ChaCha20Poly1305::new_from_slice(&self.aead_key).map_err(|_| SealError::BadKey)?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::BadKey)
    }

    /// Short value both users can compare out of band, e.g. `3f9a-01c2-77de-b410`.
    pub fn fingerprint(&self) -> String {
        self.fingerprint
            .chunks(2)
            .map(hex::encode)
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Password-authenticated key exchange, as seen by the handshake.
///
/// The slot joiner calls [`KeyExchange::start`] and sends the first message;
/// the slot creator answers with [`KeyExchange::exchange`]. Matching secrets
/// yield identical keys on both sides.
pub trait KeyExchange: Send + Sync {
    fn start(&self, secret: &[u8]) -> (Box<dyn PendingExchange>, Vec<u8>);

    fn exchange(&self, secret: &[u8], first: &[u8]) -> Result<(SessionKey, Vec<u8>), KeyError>;
}

pub trait PendingExchange: Send {
    fn finish(self: Box<Self>, second: &[u8]) -> Result<SessionKey, KeyError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Spake2Exchange;

struct PendingSpake2(Spake2<Ed25519Group>);

impl KeyExchange for Spake2Exchange {
    fn start(&self, secret: &[u8]) -> (Box<dyn PendingExchange>, Vec<u8>) {
        let (state, first) = Spake2::<Ed25519Group>::start_a(
            &Password::new(secret),
            &Identity::new(JOINER_IDENTITY),
            &Identity::new(CREATOR_IDENTITY),
        );
        (Box::new(PendingSpake2(state)), first)
    }

    fn exchange(&self, secret: &[u8], first: &[u8]) -> Result<(SessionKey, Vec<u8>), KeyError> {
        let (state, second) = Spake2::<Ed25519Group>::start_b(
            &Password::new(secret),
            &Identity::new(JOINER_IDENTITY),
            &Identity::new(CREATOR_IDENTITY),
        );
        let shared = state
            .finish(first)
            .map_err(|err| KeyError::Exchange(format!("{err:?}")))?;
        Ok((SessionKey::from_shared_secret(&shared)?, second))
    }
}

impl PendingExchange for PendingSpake2 {
    fn finish(self: Box<Self>, second: &[u8]) -> Result<SessionKey, KeyError> {
        let shared = self
            .0
            .finish(second)
            .map_err(|err| KeyError::Exchange(format!("{err:?}")))?;
        SessionKey::from_shared_secret(&shared)
    }
}
