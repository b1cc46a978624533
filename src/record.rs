//! # Record Codec
//!
//! A [`Record`] is a storable value together with a small bit-packed header.
//! The codec is incremental: every decode step can be driven with whatever
//! bytes the transport has delivered so far and reports "need more data"
//! instead of failing.
//!
//! ## Wire Layout (big-endian)
//!
//! ```text
//! [1]    header flags, bit0 = size class
//! [1|4]  payload length (1 byte if Small, 4 if Large)
//! [4]    ttl seconds              iff TTL
//! [1]    based-on count - 1       iff BASED_ON
//! [20*n] based-on keys            iff BASED_ON
//! [2]    public key length        iff PUBLIC_KEY
//! [N]    public key bytes         iff PUBLIC_KEY
//! [L]    payload
//! [S]    signature                iff SIGNED (S fixed by the scheme)
//! ```
//!
//! A small unsigned record without options costs two bytes of header.
//!
//! ## Decoding
//!
//! [`Record::decode_header`] only peeks at the buffer. When any field is
//! incomplete it returns `Ok(None)` and leaves the buffer untouched, so the
//! caller can retry with the same bytes after the next read. Payload bytes
//! are then moved out with [`Record::decode_payload`] as they arrive (each
//! read becomes one shared [`Bytes`] chunk, nothing is copied twice), and
//! [`Record::decode_signature`] picks up the trailing signature.
//!
//! ## Signing
//!
//! A signature covers the payload bytes only. It can be computed up front
//! ([`Record::sign`]) or deferred until the record is encoded
//! ([`Record::lazy_sign`]); the deferred key is never written to the wire.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::crypto::{PublicKey, Signature, SignatureScheme};
use crate::error::RecordError;
use crate::identity::{now_ms, Keypair};

/// Width of one based-on entry.
pub const VERSION_KEY_SIZE: usize = 20;

/// The count byte stores `count - 1`.
pub const MAX_BASED_ON: usize = 256;

/// Largest payload a Large header can describe.
pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

const SMALL_LIMIT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    Small,
    Large,
}

impl SizeClass {
    pub fn for_len(len: usize) -> Self {
        if len < SMALL_LIMIT {
            SizeClass::Small
        } else {
            SizeClass::Large
        }
    }

    pub fn admits(self, len: usize) -> bool {
        self == SizeClass::for_len(len)
    }

    /// Bytes taken by the length field.
    pub fn length_field_size(self) -> usize {
        match self {
            SizeClass::Small => 1,
            SizeClass::Large => 4,
        }
    }
}

/// The one-byte record header.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    pub const LARGE: u8 = 0x01;
    pub const PUBLIC_KEY: u8 = 0x02;
    pub const PREPARE: u8 = 0x04;
    pub const SECONDARY: u8 = 0x08;
    pub const PROTECTED: u8 = 0x10;
    pub const TTL: u8 = 0x20;
    pub const SIGNED: u8 = 0x40;
    pub const BASED_ON: u8 = 0x80;

    const NAMES: [(u8, &'static str); 7] = [
        (Self::PUBLIC_KEY, "public_key"),
        (Self::PREPARE, "prepare"),
        (Self::SECONDARY, "secondary"),
        (Self::PROTECTED, "protected"),
        (Self::TTL, "ttl"),
        (Self::SIGNED, "signed"),
        (Self::BASED_ON, "based_on"),
    ];

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// The header bits that take part in record equality.
    fn without_ttl(self) -> u8 {
        self.0 & !Self::TTL
    }

    #[inline]
    fn contains(self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    #[inline]
    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    pub fn size_class(self) -> SizeClass {
        if self.contains(Self::LARGE) {
            SizeClass::Large
        } else {
            SizeClass::Small
        }
    }

    fn set_size_class(&mut self, class: SizeClass) {
        self.set(Self::LARGE, class == SizeClass::Large);
    }

    pub fn has_public_key(self) -> bool {
        self.contains(Self::PUBLIC_KEY)
    }

    pub fn has_prepare_flag(self) -> bool {
        self.contains(Self::PREPARE)
    }

    pub fn has_secondary_flag(self) -> bool {
        self.contains(Self::SECONDARY)
    }

    pub fn is_protected(self) -> bool {
        self.contains(Self::PROTECTED)
    }

    pub fn has_ttl(self) -> bool {
        self.contains(Self::TTL)
    }

    pub fn is_signed(self) -> bool {
        self.contains(Self::SIGNED)
    }

    pub fn has_based_on(self) -> bool {
        self.contains(Self::BASED_ON)
    }
}

impl fmt::Debug for HeaderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_set();
        list.entry(&self.size_class());
        for (bit, name) in Self::NAMES {
            if self.contains(bit) {
                list.entry(&name);
            }
        }
        list.finish()
    }
}

/// 20-byte identifier of a version a record is derived from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionKey([u8; VERSION_KEY_SIZE]);

impl VersionKey {
    pub fn from_bytes(bytes: [u8; VERSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Truncated blake3 digest of `data`.
    pub fn for_content(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut key = [0u8; VERSION_KEY_SIZE];
        key.copy_from_slice(&digest.as_bytes()[..VERSION_KEY_SIZE]);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; VERSION_KEY_SIZE] {
        &self.0
    }

    fn from_slice(slice: &[u8]) -> Self {
        let mut key = [0u8; VERSION_KEY_SIZE];
        key.copy_from_slice(slice);
        Self(key)
    }
}

impl fmt::Debug for VersionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionKey({})", hex::encode(&self.0[..8]))
    }
}

/// How the signature of a signed record is obtained.
#[derive(Debug, Clone)]
pub enum Signing {
    Unsigned,
    Precomputed(Signature),
    /// Signed from this key when the record is encoded.
    PendingSign(Keypair),
}

pub struct Record {
    flags: HeaderFlags,
    length: usize,
    ttl_seconds: i32,
    based_on: Vec<VersionKey>,
    public_key: Option<PublicKey>,
    signing: Signing,
    chunks: Vec<Bytes>,
    received: usize,
    sent: usize,
    valid_from: u64,
    content_hash: OnceLock<[u8; 32]>,
    meta: bool,
}

impl Record {
    /// Wraps a complete payload, picking the size class from its length.
    pub fn new(payload: impl Into<Bytes>) -> Result<Self, RecordError> {
        let payload = payload.into();
        let class = SizeClass::for_len(payload.len());
        Self::with_size_class(payload, class)
    }

    /// Wraps a complete payload with an explicitly chosen size class.
    pub fn with_size_class(
        payload: impl Into<Bytes>,
        class: SizeClass,
    ) -> Result<Self, RecordError> {
        let payload = payload.into();
        let len = payload.len();
        if len > MAX_PAYLOAD_LEN {
            return Err(RecordError::PayloadTooLarge(len));
        }
        if !class.admits(len) {
            return Err(RecordError::SizeClassMismatch { class, len });
        }
        let mut flags = HeaderFlags::default();
        flags.set_size_class(class);
        let mut record = Self::blank(flags, len);
        if len > 0 {
            record.chunks.push(payload);
        }
        record.received = len;
        Ok(record)
    }

    pub fn empty() -> Self {
        Self::blank(HeaderFlags::default(), 0)
    }

    fn blank(flags: HeaderFlags, length: usize) -> Self {
        Self {
            flags,
            length,
            ttl_seconds: -1,
            based_on: Vec::new(),
            public_key: None,
            signing: Signing::Unsigned,
            chunks: Vec::new(),
            received: 0,
            sent: 0,
            valid_from: now_ms(),
            content_hash: OnceLock::new(),
            meta: false,
        }
    }

    pub fn flags(&self) -> HeaderFlags {
        self.flags
    }

    pub fn size_class(&self) -> SizeClass {
        self.flags.size_class()
    }

    /// Payload length announced by the header.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True once every payload byte has been received.
    pub fn is_complete(&self) -> bool {
        self.received == self.length
    }

    pub fn ttl_seconds(&self) -> i32 {
        self.ttl_seconds
    }

    pub fn based_on(&self) -> &[VersionKey] {
        &self.based_on
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn signature(&self) -> Option<&Signature> {
        match &self.signing {
            Signing::Precomputed(signature) => Some(signature),
            _ => None,
        }
    }

    pub fn signing(&self) -> &Signing {
        &self.signing
    }

    pub fn valid_from_ms(&self) -> u64 {
        self.valid_from
    }

    /// Wall-clock millisecond at which the record expires, `u64::MAX` if never.
    pub fn expiration_ms(&self) -> u64 {
        if self.ttl_seconds <= 0 {
            u64::MAX
        } else {
            self.valid_from
                .saturating_add(self.ttl_seconds as u64 * 1000)
        }
    }

    pub fn is_meta(&self) -> bool {
        self.meta
    }

    /// Received payload bytes as one buffer. Copies only when the payload
    /// arrived in more than one chunk.
    pub fn to_bytes(&self) -> Bytes {
        match self.chunks.as_slice() {
            [] => Bytes::new(),
            [single] => single.clone(),
            chunks => {
                let mut joined = BytesMut::with_capacity(self.received);
                for chunk in chunks {
                    joined.put_slice(chunk);
                }
                joined.freeze()
            }
        }
    }

    pub fn content_hash(&self) -> [u8; 32] {
        *self.content_hash.get_or_init(|| {
            let mut hasher = blake3::Hasher::new();
            for chunk in &self.chunks {
                hasher.update(chunk);
            }
            *hasher.finalize().as_bytes()
        })
    }

    pub fn with_ttl(mut self, ttl_seconds: i32) -> Self {
        self.ttl_seconds = ttl_seconds;
        self.flags.set(HeaderFlags::TTL, true);
        self
    }

    /// Appends a based-on key. Keys already present are ignored.
    pub fn add_based_on(mut self, key: VersionKey) -> Result<Self, RecordError> {
        if self.based_on.contains(&key) {
            return Ok(self);
        }
        if self.based_on.len() == MAX_BASED_ON {
            return Err(RecordError::TooManyBasedOn(MAX_BASED_ON + 1));
        }
        self.based_on.push(key);
        self.flags.set(HeaderFlags::BASED_ON, true);
        Ok(self)
    }

    /// Protected records always carry the public-key field.
    pub fn set_protected(mut self) -> Self {
        self.flags.set(HeaderFlags::PROTECTED, true);
        self.flags.set(HeaderFlags::PUBLIC_KEY, true);
        self
    }

    pub fn set_prepare_flag(mut self) -> Self {
        self.flags.set(HeaderFlags::PREPARE, true);
        self
    }

    pub fn set_secondary_flag(mut self) -> Self {
        self.flags.set(HeaderFlags::SECONDARY, true);
        self
    }

    pub fn with_public_key(mut self, key: PublicKey) -> Self {
        self.public_key = Some(key);
        self.flags.set(HeaderFlags::PUBLIC_KEY, true);
        self
    }

    /// Sets the public-key flag without a key; encodes as length 0.
    pub fn mark_public_key(mut self) -> Self {
        self.flags.set(HeaderFlags::PUBLIC_KEY, true);
        self
    }

    /// Sets the signed flag. The signature must be supplied by decoding or
    /// one of the signing builders before the record can be encoded.
    pub fn mark_signed(mut self) -> Self {
        self.flags.set(HeaderFlags::SIGNED, true);
        self
    }

    /// Signs the payload now and attaches the signer's public key.
    pub fn sign(
        self,
        keypair: &Keypair,
        scheme: &dyn SignatureScheme,
    ) -> Result<Self, RecordError> {
        if self.signature().is_some() {
            return Ok(self);
        }
        let key = scheme.public_key_of(keypair);
        Ok(self.sign_with(keypair, scheme)?.with_public_key(key))
    }

    /// Signs the payload now without attaching a public key.
    pub fn sign_with(
        mut self,
        keypair: &Keypair,
        scheme: &dyn SignatureScheme,
    ) -> Result<Self, RecordError> {
        if self.signature().is_some() {
            return Ok(self);
        }
        let signature = scheme.sign(keypair, &self.to_bytes())?;
        self.signing = Signing::Precomputed(signature);
        self.flags.set(HeaderFlags::SIGNED, true);
        Ok(self)
    }

    /// Defers signing to [`Record::encode_finalize`] and attaches the
    /// signer's public key.
    pub fn lazy_sign(self, keypair: &Keypair, scheme: &dyn SignatureScheme) -> Self {
        if self.signature().is_some() {
            return self;
        }
        let key = scheme.public_key_of(keypair);
        self.lazy_sign_keyless(keypair).with_public_key(key)
    }

    pub fn lazy_sign_keyless(mut self, keypair: &Keypair) -> Self {
        if self.signature().is_some() {
            return self;
        }
        self.signing = Signing::PendingSign(keypair.clone());
        self.flags.set(HeaderFlags::SIGNED, true);
        self
    }

    /// Rewinds the encode cursor so the payload can be written again.
    pub fn reset_already_transferred(&mut self) {
        self.sent = 0;
    }

    /// Parses a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` without consuming anything when the header is not
    /// fully buffered yet. On success exactly the header bytes are consumed
    /// and the returned record waits for its payload.
    pub fn decode_header(
        buf: &mut BytesMut,
        scheme: &dyn SignatureScheme,
    ) -> Result<Option<Record>, RecordError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let flags = HeaderFlags::from_byte(buf[0]);

        let (length, mut index) = match flags.size_class() {
            SizeClass::Small => (buf[1] as usize, 2),
            SizeClass::Large => {
                if buf.len() < 5 {
                    return Ok(None);
                }
                let raw = (&buf[1..5]).get_i32();
                if raw < 0 {
                    return Err(RecordError::NegativeLength(raw));
                }
                (raw as usize, 5)
            }
        };

        let mut ttl_seconds = -1;
        if flags.has_ttl() {
            if buf.len() < index + 4 {
                return Ok(None);
            }
            ttl_seconds = (&buf[index..index + 4]).get_i32();
            index += 4;
        }

        let mut based_on = Vec::new();
        if flags.has_based_on() {
            if buf.len() < index + 1 {
                return Ok(None);
            }
            let count = buf[index] as usize + 1;
            let end = index + 1 + count * VERSION_KEY_SIZE;
            if buf.len() < end {
                return Ok(None);
            }
            based_on = buf[index + 1..end]
                .chunks_exact(VERSION_KEY_SIZE)
                .map(VersionKey::from_slice)
                .collect();
            index = end;
        }

        let mut public_key = None;
        if flags.has_public_key() {
            if buf.len() < index + 2 {
                return Ok(None);
            }
            let key_len = (&buf[index..index + 2]).get_u16() as usize;
            let end = index + 2 + key_len;
            if buf.len() < end {
                return Ok(None);
            }
            public_key = scheme.decode_public_key(&buf[index + 2..end])?;
            index = end;
        }

        if flags.size_class() == SizeClass::Large && length < SMALL_LIMIT {
            return Err(RecordError::SizeClassMismatch {
                class: SizeClass::Large,
                len: length,
            });
        }

        let mut record = Record::blank(flags, length);
        record.ttl_seconds = ttl_seconds;
        record.based_on = based_on;
        record.public_key = public_key;
        buf.advance(index);
        Ok(Some(record))
    }

    /// Moves up to the missing number of payload bytes out of `buf`.
    /// Returns true once the whole payload has arrived.
    pub fn decode_payload(&mut self, buf: &mut BytesMut) -> bool {
        let remaining = self.length - self.received;
        if remaining == 0 {
            return true;
        }
        let take = remaining.min(buf.len());
        if take > 0 {
            self.chunks.push(buf.split_to(take).freeze());
            self.received += take;
            self.content_hash = OnceLock::new();
        }
        self.received == self.length
    }

    /// Reads the trailing signature of a signed record. Unsigned records are
    /// done immediately.
    pub fn decode_signature(&mut self, buf: &mut BytesMut, scheme: &dyn SignatureScheme) -> bool {
        if !self.flags.is_signed() || self.signature().is_some() {
            return true;
        }
        let size = scheme.signature_size();
        if buf.len() < size {
            return false;
        }
        let bytes = buf.split_to(size);
        self.signing = Signing::Precomputed(Signature::from_bytes(bytes.to_vec()));
        true
    }

    /// Like [`Record::decode_signature`], adopting `key` when a signed record
    /// arrived without a public key of its own.
    pub fn decode_signature_with_key(
        &mut self,
        buf: &mut BytesMut,
        key: &PublicKey,
        scheme: &dyn SignatureScheme,
    ) -> bool {
        if self.flags.is_signed() && self.public_key.is_none() {
            self.public_key = Some(key.clone());
        }
        self.decode_signature(buf, scheme)
    }

    /// Checks the signature against `key`, or against the record's own key
    /// when none is given.
    pub fn verify(
        &self,
        key: Option<&PublicKey>,
        scheme: &dyn SignatureScheme,
    ) -> Result<bool, RecordError> {
        let signature = self.signature().ok_or(RecordError::NotSigned)?;
        let key = key
            .or(self.public_key.as_ref())
            .ok_or(crate::crypto::SignatureError::MissingKey)?;
        Ok(scheme.verify(key, &self.to_bytes(), signature)?)
    }

    pub fn encode_header(
        &self,
        out: &mut BytesMut,
        scheme: &dyn SignatureScheme,
    ) -> Result<(), RecordError> {
        out.put_u8(self.flags.to_byte());
        match self.flags.size_class() {
            SizeClass::Small => out.put_u8(self.length as u8),
            SizeClass::Large => out.put_u32(self.length as u32),
        }
        if self.flags.has_ttl() {
            out.put_i32(self.ttl_seconds);
        }
        if self.flags.has_based_on() {
            out.put_u8((self.based_on.len() - 1) as u8);
            for key in &self.based_on {
                out.put_slice(key.as_bytes());
            }
        }
        if self.flags.has_public_key() {
            scheme.encode_public_key(self.public_key.as_ref(), out)?;
        }
        Ok(())
    }

    /// Writes the payload bytes not yet written. Returns true once the whole
    /// payload has been written; a record still being decoded can be
    /// forwarded as its bytes arrive.
    pub fn encode_payload(&mut self, out: &mut BytesMut) -> bool {
        let mut skip = self.sent;
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.put_slice(&chunk[skip..]);
            skip = 0;
        }
        self.sent = self.received;
        self.sent == self.length
    }

    /// Writes the signature of a signed record, signing now if the record
    /// was lazily signed.
    pub fn encode_finalize(
        &mut self,
        out: &mut BytesMut,
        scheme: &dyn SignatureScheme,
    ) -> Result<(), RecordError> {
        if !self.flags.is_signed() {
            return Ok(());
        }
        if let Signing::PendingSign(keypair) = &self.signing {
            let signature = scheme.sign(keypair, &self.to_bytes())?;
            self.signing = Signing::Precomputed(signature);
        }
        match &self.signing {
            Signing::Precomputed(signature) => {
                out.put_slice(signature.as_bytes());
                Ok(())
            }
            _ => Err(RecordError::MissingSignature),
        }
    }

    /// Header, payload and signature in one buffer.
    pub fn encode_to_vec(&mut self, scheme: &dyn SignatureScheme) -> Result<Vec<u8>, RecordError> {
        let mut out = BytesMut::new();
        self.encode_header(&mut out, scheme)?;
        self.encode_payload(&mut out);
        self.encode_finalize(&mut out, scheme)?;
        Ok(out.to_vec())
    }

    /// Shares the payload chunks with a fresh encode cursor.
    pub fn duplicate(&self) -> Record {
        Record {
            flags: self.flags,
            length: self.length,
            ttl_seconds: self.ttl_seconds,
            based_on: self.based_on.clone(),
            public_key: self.public_key.clone(),
            signing: self.signing.clone(),
            chunks: self.chunks.clone(),
            received: self.received,
            sent: 0,
            valid_from: self.valid_from,
            content_hash: self.content_hash.clone(),
            meta: self.meta,
        }
    }

    /// Same header metadata with an empty payload.
    pub fn duplicate_metadata_only(&self) -> Record {
        let mut flags = self.flags;
        flags.set_size_class(SizeClass::Small);
        Record {
            flags,
            length: 0,
            ttl_seconds: self.ttl_seconds,
            based_on: self.based_on.clone(),
            public_key: self.public_key.clone(),
            signing: self.signing.clone(),
            chunks: Vec::new(),
            received: 0,
            sent: 0,
            valid_from: self.valid_from,
            content_hash: OnceLock::new(),
            meta: true,
        }
    }

    fn payload_bytes(&self) -> impl Iterator<Item = &u8> {
        self.chunks.iter().flat_map(|chunk| chunk.iter())
    }
}

/// TTL, validity start and public key do not take part in equality.
impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.flags.without_ttl() == other.flags.without_ttl()
            && self.length == other.length
            && self.based_on == other.based_on
            && self.signature() == other.signature()
            && self.received == other.received
            && self.payload_bytes().eq(other.payload_bytes())
    }
}

impl Eq for Record {}

impl Hash for Record {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.flags.without_ttl().hash(state);
        self.length.hash(state);
        self.based_on.hash(state);
        self.signature().hash(state);
        self.content_hash().hash(state);
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("flags", &self.flags)
            .field("length", &self.length)
            .field("received", &self.received)
            .field("ttl_seconds", &self.ttl_seconds)
            .field("based_on", &self.based_on.len())
            .field("public_key", &self.public_key)
            .field("signing", &self.signing)
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Scheme, ED25519_SIGNATURE_SIZE};
    use std::collections::HashSet;

    fn decode_all(bytes: &[u8]) -> Record {
        let scheme = Ed25519Scheme;
        let mut buf = BytesMut::from(bytes);
        let mut record = Record::decode_header(&mut buf, &scheme)
            .unwrap()
            .expect("complete header");
        assert!(record.decode_payload(&mut buf));
        assert!(record.decode_signature(&mut buf, &scheme));
        assert!(buf.is_empty());
        record
    }

    fn decode_byte_by_byte(bytes: &[u8]) -> Record {
        let scheme = Ed25519Scheme;
        let mut buf = BytesMut::new();
        let mut input = bytes.iter();
        let mut record = loop {
            if let Some(record) = Record::decode_header(&mut buf, &scheme).unwrap() {
                break record;
            }
            buf.put_u8(*input.next().expect("header fits in input"));
        };
        while !record.decode_payload(&mut buf) {
            buf.put_u8(*input.next().expect("payload fits in input"));
        }
        while !record.decode_signature(&mut buf, &scheme) {
            buf.put_u8(*input.next().expect("signature fits in input"));
        }
        assert!(input.next().is_none());
        record
    }

    #[test]
    fn small_unsigned_record_has_two_byte_header() {
        let mut record = Record::new(&b"abc"[..]).unwrap();
        let encoded = record.encode_to_vec(&Ed25519Scheme).unwrap();
        assert_eq!(encoded, vec![0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn size_class_follows_length() {
        assert_eq!(Record::new(vec![0u8; 255]).unwrap().size_class(), SizeClass::Small);
        assert_eq!(Record::new(vec![0u8; 256]).unwrap().size_class(), SizeClass::Large);

        let err = Record::with_size_class(vec![0u8; 300], SizeClass::Small).unwrap_err();
        assert_eq!(
            err,
            RecordError::SizeClassMismatch {
                class: SizeClass::Small,
                len: 300
            }
        );
        assert!(Record::with_size_class(vec![0u8; 255], SizeClass::Large).is_err());
    }

    #[test]
    fn large_header_with_small_length_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(HeaderFlags::LARGE);
        buf.put_u32(10);
        let err = Record::decode_header(&mut buf, &Ed25519Scheme).unwrap_err();
        assert!(matches!(err, RecordError::SizeClassMismatch { .. }));

        let mut buf = BytesMut::new();
        buf.put_u8(HeaderFlags::LARGE);
        buf.put_i32(-5);
        assert_eq!(
            Record::decode_header(&mut buf, &Ed25519Scheme).unwrap_err(),
            RecordError::NegativeLength(-5)
        );
    }

    #[test]
    fn full_record_roundtrip() {
        let scheme = Ed25519Scheme;
        let keypair = Keypair::generate();
        let mut original = Record::new(vec![7u8; 1000])
            .unwrap()
            .with_ttl(3600)
            .add_based_on(VersionKey::for_content(b"v1"))
            .unwrap()
            .add_based_on(VersionKey::for_content(b"v2"))
            .unwrap()
            .set_protected()
            .set_prepare_flag()
            .sign(&keypair, &scheme)
            .unwrap();

        let encoded = original.encode_to_vec(&scheme).unwrap();
        let decoded = decode_all(&encoded);

        assert_eq!(decoded, original);
        assert_eq!(decoded.flags(), original.flags());
        assert_eq!(decoded.ttl_seconds(), 3600);
        assert_eq!(decoded.based_on(), original.based_on());
        assert_eq!(decoded.public_key(), Some(&scheme.public_key_of(&keypair)));
        assert!(decoded.flags().is_protected());
        assert!(decoded.flags().has_public_key());
        assert_eq!(decoded.verify(None, &scheme), Ok(true));
    }

    #[test]
    fn chunked_decode_matches_single_read() {
        let scheme = Ed25519Scheme;
        let keypair = Keypair::generate();
        let mut original = Record::new(vec![3u8; 300])
            .unwrap()
            .with_ttl(10)
            .add_based_on(VersionKey::from_bytes([1; 20]))
            .unwrap()
            .lazy_sign(&keypair, &scheme);
        let encoded = original.encode_to_vec(&scheme).unwrap();

        let whole = decode_all(&encoded);
        let trickled = decode_byte_by_byte(&encoded);

        assert_eq!(whole, trickled);
        assert_eq!(trickled.ttl_seconds(), 10);
        assert_eq!(trickled.to_bytes(), whole.to_bytes());
        assert_eq!(trickled.verify(None, &scheme), Ok(true));
    }

    #[test]
    fn incomplete_header_does_not_consume() {
        let scheme = Ed25519Scheme;
        let mut record = Record::new(vec![1u8; 20])
            .unwrap()
            .with_ttl(5)
            .with_public_key(scheme.public_key_of(&Keypair::generate()));
        let encoded = record.encode_to_vec(&scheme).unwrap();

        // Cut inside the public key.
        let mut buf = BytesMut::from(&encoded[..10]);
        assert!(Record::decode_header(&mut buf, &scheme).unwrap().is_none());
        assert_eq!(buf.len(), 10);
        assert_eq!(&buf[..], &encoded[..10]);

        let mut single = BytesMut::from(&encoded[..1]);
        assert!(Record::decode_header(&mut single, &scheme).unwrap().is_none());
        assert_eq!(single.len(), 1);
    }

    #[test]
    fn based_on_count_is_stored_minus_one() {
        let key = VersionKey::from_bytes([9; 20]);
        let mut record = Record::new(&b"x"[..]).unwrap().add_based_on(key).unwrap();
        let encoded = record.encode_to_vec(&Ed25519Scheme).unwrap();
        assert_eq!(encoded[0], HeaderFlags::BASED_ON);
        assert_eq!(encoded[2], 0);

        let decoded = decode_all(&encoded);
        assert_eq!(decoded.based_on(), &[key]);
    }

    #[test]
    fn based_on_rejects_entry_257() {
        let mut record = Record::new(&b"x"[..]).unwrap();
        for i in 0..MAX_BASED_ON {
            let mut key = [0u8; 20];
            key[..8].copy_from_slice(&(i as u64).to_be_bytes());
            record = record.add_based_on(VersionKey::from_bytes(key)).unwrap();
        }
        assert_eq!(record.based_on().len(), 256);
        let err = record
            .add_based_on(VersionKey::from_bytes([0xff; 20]))
            .unwrap_err();
        assert_eq!(err, RecordError::TooManyBasedOn(257));
    }

    #[test]
    fn equality_ignores_ttl() {
        let a = Record::new(&b"payload"[..]).unwrap().with_ttl(10);
        let b = Record::new(&b"payload"[..]).unwrap().with_ttl(99);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));

        let plain = Record::new(&b"payload"[..]).unwrap();
        let expiring = Record::new(&b"payload"[..]).unwrap().with_ttl(3600);
        assert!(!plain.flags().has_ttl());
        assert!(expiring.flags().has_ttl());
        assert_eq!(plain, expiring);
        assert!(set.contains(&plain));
        assert!(set.contains(&expiring));

        let c = Record::new(&b"payload"[..]).unwrap().with_ttl(10).set_prepare_flag();
        let d = Record::new(&b"other"[..]).unwrap().with_ttl(10);
        let e = Record::new(&b"payload"[..])
            .unwrap()
            .with_ttl(10)
            .add_based_on(VersionKey::from_bytes([1; 20]))
            .unwrap();
        let base = Record::new(&b"payload"[..]).unwrap().with_ttl(10);
        assert_ne!(base, c);
        assert_ne!(base, d);
        assert_ne!(base, e);
    }

    #[test]
    fn lazy_signing_happens_at_finalize() {
        let scheme = Ed25519Scheme;
        let keypair = Keypair::generate();
        let mut record = Record::new(&b"signed later"[..])
            .unwrap()
            .lazy_sign(&keypair, &scheme);
        assert!(record.signature().is_none());
        assert!(matches!(record.signing(), Signing::PendingSign(_)));

        let mut out = BytesMut::new();
        record.encode_header(&mut out, &scheme).unwrap();
        assert!(record.encode_payload(&mut out));
        let before = out.len();
        record.encode_finalize(&mut out, &scheme).unwrap();
        assert_eq!(out.len() - before, ED25519_SIGNATURE_SIZE);
        assert!(record.signature().is_some());
        assert_eq!(record.verify(None, &scheme), Ok(true));
    }

    #[test]
    fn signed_without_signature_or_key_fails_finalize() {
        let mut record = Record::new(&b"data"[..]).unwrap().mark_signed();
        let mut out = BytesMut::new();
        assert_eq!(
            record.encode_finalize(&mut out, &Ed25519Scheme),
            Err(RecordError::MissingSignature)
        );
        assert!(out.is_empty());
    }

    #[test]
    fn keyless_signature_verifies_with_supplied_key() {
        let scheme = Ed25519Scheme;
        let keypair = Keypair::generate();
        let key = scheme.public_key_of(&keypair);
        let mut record = Record::new(&b"keyless"[..])
            .unwrap()
            .sign_with(&keypair, &scheme)
            .unwrap();
        assert!(record.public_key().is_none());
        let encoded = record.encode_to_vec(&scheme).unwrap();

        let mut buf = BytesMut::from(&encoded[..]);
        let mut decoded = Record::decode_header(&mut buf, &scheme).unwrap().unwrap();
        assert!(decoded.decode_payload(&mut buf));
        assert!(decoded.decode_signature_with_key(&mut buf, &key, &scheme));

        assert_eq!(decoded.public_key(), Some(&key));
        assert_eq!(decoded.verify(None, &scheme), Ok(true));

        let stranger = scheme.public_key_of(&Keypair::generate());
        assert_eq!(decoded.verify(Some(&stranger), &scheme), Ok(false));
    }

    #[test]
    fn verify_reports_malformed_key() {
        let scheme = Ed25519Scheme;
        let record = Record::new(&b"x"[..])
            .unwrap()
            .sign_with(&Keypair::generate(), &scheme)
            .unwrap();
        let bad = PublicKey::from_bytes(vec![0u8; 3]);
        assert!(matches!(
            record.verify(Some(&bad), &scheme),
            Err(RecordError::Crypto(_))
        ));
        assert_eq!(
            Record::new(&b"x"[..]).unwrap().verify(None, &scheme),
            Err(RecordError::NotSigned)
        );
    }

    #[test]
    fn flagged_public_key_without_key_encodes_zero_length() {
        let mut record = Record::new(&b"k"[..]).unwrap().mark_public_key();
        let encoded = record.encode_to_vec(&Ed25519Scheme).unwrap();
        assert_eq!(&encoded[2..4], &[0, 0]);

        let decoded = decode_all(&encoded);
        assert!(decoded.flags().has_public_key());
        assert!(decoded.public_key().is_none());
    }

    #[test]
    fn duplicate_shares_payload_with_own_cursor() {
        let mut original = Record::new(vec![5u8; 64]).unwrap().with_ttl(30);
        let mut out = BytesMut::new();
        assert!(original.encode_payload(&mut out));
        assert_eq!(out.len(), 64);

        let mut copy = original.duplicate();
        assert_eq!(copy.to_bytes().as_ptr(), original.to_bytes().as_ptr());
        assert_eq!(copy.ttl_seconds(), 30);

        let mut again = BytesMut::new();
        assert!(copy.encode_payload(&mut again));
        assert_eq!(again.len(), 64);

        // The original stays finished.
        let mut nothing = BytesMut::new();
        assert!(original.encode_payload(&mut nothing));
        assert!(nothing.is_empty());

        original.reset_already_transferred();
        assert!(original.encode_payload(&mut nothing));
        assert_eq!(nothing.len(), 64);
    }

    #[test]
    fn metadata_duplicate_drops_payload() {
        let scheme = Ed25519Scheme;
        let keypair = Keypair::generate();
        let original = Record::new(vec![1u8; 400])
            .unwrap()
            .with_ttl(7)
            .add_based_on(VersionKey::from_bytes([2; 20]))
            .unwrap()
            .sign(&keypair, &scheme)
            .unwrap();

        let meta = original.duplicate_metadata_only();
        assert!(meta.is_meta());
        assert!(meta.is_empty());
        assert_eq!(meta.size_class(), SizeClass::Small);
        assert_eq!(meta.ttl_seconds(), 7);
        assert_eq!(meta.based_on(), original.based_on());
        assert_eq!(meta.public_key(), original.public_key());
        assert_eq!(meta.signature(), original.signature());
        assert!(meta.flags().is_signed());
    }

    #[test]
    fn partial_payload_can_be_forwarded() {
        let mut source = Record::new(vec![4u8; 10]).unwrap();
        let encoded = source.encode_to_vec(&Ed25519Scheme).unwrap();

        let mut buf = BytesMut::from(&encoded[..6]);
        let mut relayed = Record::decode_header(&mut buf, &Ed25519Scheme).unwrap().unwrap();
        assert!(!relayed.decode_payload(&mut buf));

        let mut out = BytesMut::new();
        assert!(!relayed.encode_payload(&mut out));
        assert_eq!(out.len(), 4);

        let mut rest = BytesMut::from(&encoded[6..]);
        assert!(relayed.decode_payload(&mut rest));
        assert!(relayed.encode_payload(&mut out));
        assert_eq!(&out[..], &[4u8; 10][..]);
    }

    #[test]
    fn expiration_uses_ttl() {
        let record = Record::new(&b"x"[..]).unwrap();
        assert_eq!(record.expiration_ms(), u64::MAX);

        let record = record.with_ttl(2);
        assert_eq!(record.expiration_ms(), record.valid_from_ms() + 2000);
    }

    #[test]
    fn content_hash_is_independent_of_chunking() {
        let mut whole = Record::new(vec![8u8; 32]).unwrap();
        let encoded = whole.encode_to_vec(&Ed25519Scheme).unwrap();
        let trickled = decode_byte_by_byte(&encoded);
        assert_eq!(whole.content_hash(), trickled.content_hash());
        assert_eq!(whole.content_hash(), *blake3::hash(&[8u8; 32]).as_bytes());
    }
}
