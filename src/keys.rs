//! Symmetric thread keys, identities and access tokens.

use std::fmt::{self, Debug};

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use libp2p::identity::{Keypair, PublicKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub(crate) const NONCE_LEN: usize = 24;
pub(crate) const SYM_KEY_LEN: usize = 32;

/// A 32-byte symmetric key sealing blocks with XChaCha20-Poly1305.
///
/// Ciphertexts are nonce-prefixed: `nonce ‖ ct`.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; SYM_KEY_LEN]);

impl Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymmetricKey(<secret>)")
    }
}

impl SymmetricKey {
    /// Generates a fresh random key.
    pub fn new_random() -> Self {
        let mut bytes = [0u8; SYM_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        SymmetricKey(bytes)
    }

    /// Rebuilds a key from raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; SYM_KEY_LEN] = bytes.try_into().map_err(|_| Error::Crypto)?;
        Ok(SymmetricKey(arr))
    }

    /// Raw byte representation.
    pub fn as_bytes(&self) -> &[u8; SYM_KEY_LEN] {
        &self.0
    }

    /// Seals the cleartext under a random nonce.
    pub fn seal(&self, cleartext: &[u8]) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        // Encryption of in-memory buffers cannot fail with this cipher.
        let ct = cipher.encrypt(&nonce, cleartext).expect("sealing failed");
        let mut out = nonce.to_vec();
        out.extend(ct);
        out
    }

    /// Opens a ciphertext produced by [`Self::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Crypto);
        }
        let (nonce, ct) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&self.0));
        cipher
            .decrypt(XNonce::from_slice(nonce), ct)
            .map_err(|_| Error::Crypto)
    }
}

/// The two halves of a thread's key material.
///
/// The service half is required to read record envelopes and is what peers
/// present as bearer proof on RPC calls. The read half decrypts event
/// bodies; a thread without it is "service-only" and merely relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadKey {
    service: SymmetricKey,
    read: Option<SymmetricKey>,
}

impl ThreadKey {
    /// A full key with both halves, for threads this peer can interpret.
    pub fn new_random() -> Self {
        ThreadKey {
            service: SymmetricKey::new_random(),
            read: Some(SymmetricKey::new_random()),
        }
    }

    /// A service-only key, for relay peers.
    pub fn new_service_only() -> Self {
        ThreadKey {
            service: SymmetricKey::new_random(),
            read: None,
        }
    }

    /// Assembles a key from existing halves.
    pub fn new(service: SymmetricKey, read: Option<SymmetricKey>) -> Self {
        ThreadKey { service, read }
    }

    /// The service half.
    pub fn service(&self) -> &SymmetricKey {
        &self.service
    }

    /// The read half, if this peer can decrypt bodies.
    pub fn read(&self) -> Option<&SymmetricKey> {
        self.read.as_ref()
    }

    /// True when the read half is present.
    pub fn can_read(&self) -> bool {
        self.read.is_some()
    }
}

/// An identity that can prove itself by signing a challenge.
///
/// Implemented by applications; the engine itself only needs the public key
/// and a signature over the server challenge.
#[async_trait::async_trait]
pub trait Identity: Send + Sync {
    /// Signs the challenge bytes.
    async fn sign(&self, msg: &[u8]) -> Result<Vec<u8>>;
    /// The public key the signature verifies against.
    fn public(&self) -> PublicKey;
}

#[async_trait::async_trait]
impl Identity for Keypair {
    async fn sign(&self, msg: &[u8]) -> Result<Vec<u8>> {
        Keypair::sign(self, msg).map_err(|e| Error::Other(e.into()))
    }

    fn public(&self) -> PublicKey {
        Keypair::public(self)
    }
}

/// A host-signed binding of an identity public key.
///
/// Obtained through the challenge flow in
/// [`Net::get_token`](crate::net::Net::get_token) and presented on mutating
/// facade operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    identity: Vec<u8>,
    sig: Vec<u8>,
}

impl Token {
    /// Issues a token binding `identity` with the host key.
    pub(crate) fn issue(host: &Keypair, identity: &PublicKey) -> Result<Self> {
        let identity = identity.encode_protobuf();
        let sig = host
            .sign(&identity)
            .map_err(|e| Error::Other(e.into()))?;
        Ok(Token { identity, sig })
    }

    /// Verifies the binding and returns the identity key.
    ///
    /// ACL enforcement on top of the recovered identity is not performed
    /// here; see the design notes.
    pub fn validate(&self, host: &PublicKey) -> Result<PublicKey> {
        if !host.verify(&self.identity, &self.sig) {
            return Err(Error::InvalidToken);
        }
        PublicKey::try_decode_protobuf(&self.identity).map_err(|_| Error::InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = SymmetricKey::new_random();
        let sealed = key.seal(b"hello thread");
        assert_eq!(key.open(&sealed).unwrap(), b"hello thread");

        let other = SymmetricKey::new_random();
        assert!(other.open(&sealed).is_err());
        assert!(key.open(&sealed[..10]).is_err());
    }

    #[test]
    fn token_binding() {
        let host = Keypair::generate_ed25519();
        let identity = Keypair::generate_ed25519();
        let token = Token::issue(&host, &identity.public()).unwrap();
        let recovered = token.validate(&host.public()).unwrap();
        assert_eq!(recovered, identity.public());

        let stranger = Keypair::generate_ed25519();
        assert!(token.validate(&stranger.public()).is_err());
    }
}
