//! Node identity and crypto: keypairs, node ID, shared keys, authenticated encryption.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Size of a public key (X25519 u-coordinate).
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of a node ID.
pub const NODE_ID_SIZE: usize = 16;
/// Size of a short node ID (prefix of the node ID).
pub const SHORT_NODE_ID_SIZE: usize = 4;
/// AEAD nonce size.
pub const NONCE_SIZE: usize = 12;
/// AEAD tag size.
pub const TAG_SIZE: usize = 16;
/// Bytes added by [`seal`]: nonce + tag.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;
/// The key cache is reset once it grows past this many entries.
pub const KEY_CACHE_LIMIT: usize = 10_000;

/// Node public key (32 bytes, X25519).
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_SIZE]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Create a `PublicKey` from raw bytes.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        PublicKey(bytes)
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(self)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Node ID: the low 16 bytes of the public key's x-coordinate.
///
/// An X25519 public key is the little-endian encoding of the curve point's u
/// coordinate, so the low-order bytes are the first 16 bytes of the key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_SIZE]);

impl NodeId {
    pub fn from_public_key(public: &PublicKey) -> Self {
        let mut id = [0u8; NODE_ID_SIZE];
        id.copy_from_slice(&public.0[..NODE_ID_SIZE]);
        NodeId(id)
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// First four bytes, used where a full ID would be redundant (ping, TCP init).
    pub fn short(&self) -> ShortNodeId {
        let mut s = [0u8; SHORT_NODE_ID_SIZE];
        s.copy_from_slice(&self.0[..SHORT_NODE_ID_SIZE]);
        ShortNodeId(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidHex)?;
        let bytes: [u8; NODE_ID_SIZE] = raw
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(NODE_ID_SIZE))?;
        Ok(NodeId(bytes))
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct ShortNodeId([u8; SHORT_NODE_ID_SIZE]);

impl ShortNodeId {
    pub fn from_bytes(bytes: [u8; SHORT_NODE_ID_SIZE]) -> Self {
        ShortNodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SHORT_NODE_ID_SIZE] {
        &self.0
    }
}

/// X25519 keypair. Keep secret key private; expose only public key and node ID.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
    node_id: NodeId,
}

impl KeyPair {
    /// Generate a new random keypair and derive the node ID from its public key.
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Rebuild a keypair from a 32-byte secret.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Parse a hex-encoded 32-byte secret (as stored in config).
    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        let raw = hex::decode(s.trim()).map_err(|_| IdentityError::InvalidHex)?;
        let bytes: [u8; 32] = raw.try_into().map_err(|_| IdentityError::InvalidLength(32))?;
        Ok(Self::from_secret_bytes(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(X25519PublicKey::from(&secret).to_bytes());
        let node_id = NodeId::from_public_key(&public);
        Self {
            secret,
            public,
            node_id,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Hex encoding of the secret, for writing back into a config file.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }

    /// Symmetric 32-byte key shared with the owner of `remote`.
    /// `a.derive_shared_key(b.pub) == b.derive_shared_key(a.pub)`.
    pub fn derive_shared_key(&self, remote: &PublicKey) -> [u8; 32] {
        let other = X25519PublicKey::from(remote.0);
        let shared = self.secret.diffie_hellman(&other);
        derive_session_key(shared.as_bytes())
    }
}

/// Hash the raw X25519 output into the key used for ChaCha20-Poly1305.
pub fn derive_session_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"lanlink-shared-v1");
    hasher.update(shared_secret);
    hasher.finalize().into()
}

/// Per-peer derived keys. Cleared wholesale once it exceeds [`KEY_CACHE_LIMIT`].
#[derive(Default)]
pub struct KeyCache {
    keys: HashMap<NodeId, [u8; 32]>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_derive(&mut self, local: &KeyPair, remote: &PublicKey) -> [u8; 32] {
        let id = remote.node_id();
        if let Some(key) = self.keys.get(&id) {
            return *key;
        }
        if self.keys.len() >= KEY_CACHE_LIMIT {
            self.keys.clear();
        }
        let key = local.derive_shared_key(remote);
        self.keys.insert(id, key);
        key
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Fresh random nonce.
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `buf` in place and return the detached tag.
pub fn seal_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    buf: &mut [u8],
) -> Result<[u8; TAG_SIZE], CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf)
        .map_err(|_| CryptoError::Encrypt)?;
    let mut out = [0u8; TAG_SIZE];
    out.copy_from_slice(tag.as_slice());
    Ok(out)
}

/// Verify `tag` and decrypt `buf` in place. On failure the contents of `buf`
/// must not be used; they are zeroed so nothing unauthenticated leaks out.
pub fn open_detached(
    key: &[u8; 32],
    nonce: &[u8; NONCE_SIZE],
    buf: &mut [u8],
    tag: &[u8; TAG_SIZE],
) -> Result<(), CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", buf, Tag::from_slice(tag))
        .map_err(|_| {
            buf.iter_mut().for_each(|b| *b = 0);
            CryptoError::Authentication
        })
}

/// Encrypt with a random nonce. Output layout: nonce(12) | tag(16) | ciphertext.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = random_nonce();
    let mut out = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&[0u8; TAG_SIZE]);
    out.extend_from_slice(plaintext);
    let tag = seal_detached(key, &nonce, &mut out[SEAL_OVERHEAD..])?;
    out[NONCE_SIZE..SEAL_OVERHEAD].copy_from_slice(&tag);
    Ok(out)
}

/// Inverse of [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < SEAL_OVERHEAD {
        return Err(CryptoError::Truncated);
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&sealed[..NONCE_SIZE]);
    let mut tag = [0u8; TAG_SIZE];
    tag.copy_from_slice(&sealed[NONCE_SIZE..SEAL_OVERHEAD]);
    let mut plain = sealed[SEAL_OVERHEAD..].to_vec();
    open_detached(key, &nonce, &mut plain, &tag)?;
    Ok(plain)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encrypt,
    #[error("authentication tag mismatch")]
    Authentication,
    #[error("sealed payload shorter than nonce and tag")]
    Truncated,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid hex")]
    InvalidHex,
    #[error("expected {0} bytes")]
    InvalidLength(usize),
}
