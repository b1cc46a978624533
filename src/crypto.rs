//! Signature-scheme provider for stored records.
//!
//! The record codec never talks to a signature library directly. It asks a
//! [`SignatureScheme`] to sign, verify, and to encode or decode public keys,
//! and it relies on the scheme's fixed signature size to know how many bytes
//! trail a signed payload on the wire. [`Ed25519Scheme`] is the scheme used by
//! the overlay; its keys are the same keys that back peer identities.

use bytes::{BufMut, BytesMut};
use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use thiserror::Error;

use crate::identity::Keypair;

pub const ED25519_SIGNATURE_SIZE: usize = 64;
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("malformed public key ({0} bytes)")]
    MalformedKey(usize),
    #[error("malformed signature ({0} bytes)")]
    MalformedSignature(usize),
    #[error("public key does not fit a 16-bit length prefix ({0} bytes)")]
    KeyTooLong(usize),
    #[error("no public key available for verification")]
    MissingKey,
}

/// Encoded public key as carried in a record header.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey(Vec<u8>);

impl PublicKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "PublicKey({})", hex::encode(shown))
    }
}

/// Fixed-size signature bytes produced by a [`SignatureScheme`].
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = &self.0[..self.0.len().min(8)];
        write!(f, "Signature({}..)", hex::encode(shown))
    }
}

pub trait SignatureScheme: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of signature bytes that follow a signed payload.
    fn signature_size(&self) -> usize;

    fn sign(&self, keypair: &Keypair, payload: &[u8]) -> Result<Signature, SignatureError>;

    /// Returns `Ok(false)` for a well-formed signature that does not match,
    /// and an error when the key or signature cannot be parsed at all.
    fn verify(
        &self,
        key: &PublicKey,
        payload: &[u8],
        signature: &Signature,
    ) -> Result<bool, SignatureError>;

    fn public_key_of(&self, keypair: &Keypair) -> PublicKey;

    /// Parses key bytes taken from a record header. An empty slice means the
    /// header flagged a key but carried none.
    fn decode_public_key(&self, bytes: &[u8]) -> Result<Option<PublicKey>, SignatureError>;

    /// Writes the 2-byte length prefix followed by the key bytes.
    fn encode_public_key(
        &self,
        key: Option<&PublicKey>,
        out: &mut BytesMut,
    ) -> Result<(), SignatureError> {
        match key {
            None => out.put_u16(0),
            Some(key) => {
                let len = u16::try_from(key.as_bytes().len())
                    .map_err(|_| SignatureError::KeyTooLong(key.as_bytes().len()))?;
                out.put_u16(len);
                out.put_slice(key.as_bytes());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Scheme;

impl SignatureScheme for Ed25519Scheme {
    fn name(&self) -> &'static str {
        "ed25519"
    }

    fn signature_size(&self) -> usize {
        ED25519_SIGNATURE_SIZE
    }

    fn sign(&self, keypair: &Keypair, payload: &[u8]) -> Result<Signature, SignatureError> {
        Ok(Signature(keypair.sign(payload).to_bytes().to_vec()))
    }

    fn verify(
        &self,
        key: &PublicKey,
        payload: &[u8],
        signature: &Signature,
    ) -> Result<bool, SignatureError> {
        let verifying_key = VerifyingKey::try_from(key.as_bytes())
            .map_err(|_| SignatureError::MalformedKey(key.as_bytes().len()))?;
        let signature = DalekSignature::from_slice(signature.as_bytes())
            .map_err(|_| SignatureError::MalformedSignature(signature.len()))?;
        Ok(verifying_key.verify(payload, &signature).is_ok())
    }

    fn public_key_of(&self, keypair: &Keypair) -> PublicKey {
        PublicKey(keypair.public_key_bytes().to_vec())
    }

    fn decode_public_key(&self, bytes: &[u8]) -> Result<Option<PublicKey>, SignatureError> {
        if bytes.is_empty() {
            return Ok(None);
        }
        if bytes.len() != ED25519_PUBLIC_KEY_SIZE {
            return Err(SignatureError::MalformedKey(bytes.len()));
        }
        VerifyingKey::try_from(bytes).map_err(|_| SignatureError::MalformedKey(bytes.len()))?;
        Ok(Some(PublicKey(bytes.to_vec())))
    }
}
