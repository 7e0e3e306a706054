//! Sealed (end-to-end encrypted) payloads.
//!
//! A sealed body is a COSE `Encrypt0`-shaped three-element array:
//!
//! ```text
//! [ protected:bstr(map{1: alg}), unprotected:map{4: kid}, ciphertext:bstr ]
//! ```
//!
//! The envelope's protected headers ride as external AAD through a COSE
//! `Enc_structure`, so a relay that flips a routing bit breaks
//! authentication at the subscriber.
//!
//! Nonces are 13 bytes derived from `(seq_num, pub_id)`; bit 7 of byte 4
//! separates publication nonces from acknowledgement nonces so the same
//! `(pub_id, seq_num)` never reuses a nonce across the two directions.
//! The key material itself comes from the key store through a resolver
//! closure; this module never sees identity management.

use crate::cbor::{Decoder, Encoder};
use bytes::Bytes;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use uuid::Uuid;
use weft_core::error::{Result, WeftError};
use weft_core::keyid::KeyId;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 13;

/// COSE header keys.
const HDR_ALG: u64 = 1;
const HDR_KID: u64 = 4;

/// Algorithm identifier of [`PlainSeal`] (private use).
pub const ALG_NONE: i64 = 0;

/// COSE algorithm identifier for `ChaCha20/Poly1305`.
pub const ALG_CHACHA20_POLY1305: i64 = 24;

/// Which direction a nonce protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    /// Publication payload.
    Pub,
    /// Acknowledgement payload.
    Ack,
}

/// Derive the 13-byte nonce for `(pub_id, seq_num)`.
///
/// Layout: `seq_num` little-endian ∥ first 9 bytes of `pub_id`, with the
/// top bit of byte 4 cleared for PUB and set for ACK.
#[must_use]
pub fn derive_nonce(pub_id: &Uuid, seq_num: u32, kind: NonceKind) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..4].copy_from_slice(&seq_num.to_le_bytes());
    nonce[4..].copy_from_slice(&pub_id.as_bytes()[..NONCE_LEN - 4]);
    match kind {
        NonceKind::Pub => nonce[4] &= 0x7f,
        NonceKind::Ack => nonce[4] |= 0x80,
    }
    nonce
}

/// A payload sealing scheme.
///
/// The node layer picks keys (via its key store) and nonces (via
/// [`derive_nonce`]); implementations only transform bytes.
pub trait SealCodec: Send + Sync {
    /// Algorithm identifier written into sealed structures.
    fn alg(&self) -> i64;

    /// Seal `plain` under `key`, naming `kid` as the recipient hint.
    fn seal(
        &self,
        kid: &KeyId,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plain: &[u8],
    ) -> Result<Bytes>;

    /// Open a sealed structure. `resolve` maps the structure's key
    /// identifier to key material and reports `Missing` when it cannot.
    fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
        resolve: &mut dyn FnMut(&KeyId) -> Result<Vec<u8>>,
    ) -> Result<(KeyId, Bytes)>;
}

fn encode_protected(alg: i64) -> Bytes {
    let mut p = Encoder::with_capacity(8);
    p.map(1);
    p.uint(HDR_ALG);
    p.int(alg);
    p.finish()
}

fn encode_sealed(alg: i64, kid: &KeyId, ciphertext: &[u8]) -> Bytes {
    let protected = encode_protected(alg);
    let mut e = Encoder::with_capacity(16 + kid.len() + ciphertext.len());
    e.array(3);
    e.bytes(&protected);
    e.map(1);
    e.uint(HDR_KID);
    e.bytes(kid.as_slice());
    e.bytes(ciphertext);
    e.finish()
}

struct SealedParts<'a> {
    alg: i64,
    kid: KeyId,
    protected: &'a [u8],
    ciphertext: &'a [u8],
}

fn decode_sealed(buf: &[u8]) -> Result<SealedParts<'_>> {
    let mut d = Decoder::new(buf);
    if d.array()? != 3 {
        return Err(WeftError::Invalid);
    }
    let protected = d.bytes()?;
    let mut pd = Decoder::new(protected);
    if pd.map()? != 1 || pd.uint()? != HDR_ALG {
        return Err(WeftError::Invalid);
    }
    let alg = pd.int()?;
    if d.map()? != 1 || d.uint()? != HDR_KID {
        return Err(WeftError::Invalid);
    }
    let kid = KeyId::from(d.bytes()?);
    let ciphertext = d.bytes()?;
    if !d.is_empty() {
        return Err(WeftError::Invalid);
    }
    Ok(SealedParts {
        alg,
        kid,
        protected,
        ciphertext,
    })
}

/// Read the algorithm identifier of a sealed structure without opening it.
///
/// Lets a relay decide whether a body is plaintext-wrapped or requires a
/// key it may not hold (relays forward sealed bodies unopened).
pub fn peek_alg(sealed: &[u8]) -> Result<i64> {
    decode_sealed(sealed).map(|p| p.alg)
}

/// COSE `Enc_structure` over the protected header and external AAD.
fn enc_structure(protected: &[u8], aad: &[u8]) -> Bytes {
    let mut e = Encoder::with_capacity(16 + protected.len() + aad.len());
    e.array(3);
    e.text("Encrypt0");
    e.bytes(protected);
    e.bytes(aad);
    e.finish()
}

/// Pass-through seal for meshes running without payload protection.
///
/// Keeps the wire structure (and the key identifier hint) so mixed test
/// setups decode uniformly, but provides no confidentiality.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSeal;

impl SealCodec for PlainSeal {
    fn alg(&self) -> i64 {
        ALG_NONE
    }

    fn seal(
        &self,
        kid: &KeyId,
        _key: &[u8],
        _nonce: &[u8; NONCE_LEN],
        _aad: &[u8],
        plain: &[u8],
    ) -> Result<Bytes> {
        Ok(encode_sealed(ALG_NONE, kid, plain))
    }

    fn open(
        &self,
        _nonce: &[u8; NONCE_LEN],
        _aad: &[u8],
        sealed: &[u8],
        _resolve: &mut dyn FnMut(&KeyId) -> Result<Vec<u8>>,
    ) -> Result<(KeyId, Bytes)> {
        let parts = decode_sealed(sealed)?;
        if parts.alg != ALG_NONE {
            return Err(WeftError::Invalid);
        }
        Ok((parts.kid, Bytes::copy_from_slice(parts.ciphertext)))
    }
}

/// `ChaCha20/Poly1305` seal. The AEAD nonce is the first 12 bytes of the
/// 13-byte Weft nonce, which includes the PUB/ACK separation bit.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaSeal;

impl ChaChaSeal {
    fn cipher(key: &[u8]) -> Result<ChaCha20Poly1305> {
        ChaCha20Poly1305::new_from_slice(key).map_err(|_| WeftError::Invalid)
    }
}

impl SealCodec for ChaChaSeal {
    fn alg(&self) -> i64 {
        ALG_CHACHA20_POLY1305
    }

    fn seal(
        &self,
        kid: &KeyId,
        key: &[u8],
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plain: &[u8],
    ) -> Result<Bytes> {
        let cipher = Self::cipher(key)?;
        let protected = encode_protected(ALG_CHACHA20_POLY1305);
        let enc_aad = enc_structure(&protected, aad);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce[..12]),
                Payload {
                    msg: plain,
                    aad: &enc_aad,
                },
            )
            .map_err(|_| WeftError::Invalid)?;
        Ok(encode_sealed(ALG_CHACHA20_POLY1305, kid, &ciphertext))
    }

    fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        sealed: &[u8],
        resolve: &mut dyn FnMut(&KeyId) -> Result<Vec<u8>>,
    ) -> Result<(KeyId, Bytes)> {
        let parts = decode_sealed(sealed)?;
        if parts.alg != ALG_CHACHA20_POLY1305 {
            return Err(WeftError::Invalid);
        }
        let key = resolve(&parts.kid)?;
        let cipher = Self::cipher(&key)?;
        let enc_aad = enc_structure(parts.protected, aad);
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce[..12]),
                Payload {
                    msg: parts.ciphertext,
                    aad: &enc_aad,
                },
            )
            .map_err(|_| WeftError::Invalid)?;
        Ok((parts.kid, Bytes::from(plain)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [7u8; 32];

    fn kid() -> KeyId {
        KeyId::from("content-key")
    }

    #[test]
    fn nonce_separation() {
        let id = Uuid::from_u128(0xdead_beef_cafe_f00d_1122_3344_5566_7788);
        for sn in [1u32, 2, 0xffff_ffff] {
            let p = derive_nonce(&id, sn, NonceKind::Pub);
            let a = derive_nonce(&id, sn, NonceKind::Ack);
            assert_eq!(p[4] & 0x80, 0);
            assert_eq!(a[4] & 0x80, 0x80);
            // Identical everywhere except bit 7 of byte 4
            for i in 0..NONCE_LEN {
                if i == 4 {
                    assert_eq!(p[i] | 0x80, a[i] | 0x80);
                } else {
                    assert_eq!(p[i], a[i]);
                }
            }
            assert_eq!(&p[..4], &sn.to_le_bytes());
        }
    }

    #[test]
    fn plain_roundtrip() {
        let seal = PlainSeal;
        let nonce = [0u8; NONCE_LEN];
        let sealed = seal.seal(&kid(), &[], &nonce, b"aad", b"hello").unwrap();
        let (got_kid, plain) = seal
            .open(&nonce, b"aad", &sealed, &mut |_: &KeyId| Ok(vec![]))
            .unwrap();
        assert_eq!(got_kid, kid());
        assert_eq!(plain.as_ref(), b"hello");
    }

    #[test]
    fn chacha_roundtrip() {
        let seal = ChaChaSeal;
        let id = Uuid::from_u128(42);
        let nonce = derive_nonce(&id, 1, NonceKind::Pub);
        let sealed = seal.seal(&kid(), &KEY, &nonce, b"headers", b"payload").unwrap();

        let mut resolve = |k: &KeyId| {
            if *k == kid() {
                Ok(KEY.to_vec())
            } else {
                Err(WeftError::Missing)
            }
        };
        let (got_kid, plain) = seal.open(&nonce, b"headers", &sealed, &mut resolve).unwrap();
        assert_eq!(got_kid, kid());
        assert_eq!(plain.as_ref(), b"payload");
    }

    #[test]
    fn chacha_detects_aad_tamper() {
        let seal = ChaChaSeal;
        let nonce = derive_nonce(&Uuid::from_u128(42), 1, NonceKind::Pub);
        let sealed = seal.seal(&kid(), &KEY, &nonce, b"headers", b"payload").unwrap();
        let mut resolve = |_: &KeyId| Ok(KEY.to_vec());
        assert_eq!(
            seal.open(&nonce, b"tampered", &sealed, &mut resolve),
            Err(WeftError::Invalid)
        );
    }

    #[test]
    fn chacha_wrong_direction_fails() {
        let seal = ChaChaSeal;
        let id = Uuid::from_u128(42);
        let pub_nonce = derive_nonce(&id, 1, NonceKind::Pub);
        let ack_nonce = derive_nonce(&id, 1, NonceKind::Ack);
        let sealed = seal.seal(&kid(), &KEY, &pub_nonce, b"h", b"p").unwrap();
        let mut resolve = |_: &KeyId| Ok(KEY.to_vec());
        assert_eq!(
            seal.open(&ack_nonce, b"h", &sealed, &mut resolve),
            Err(WeftError::Invalid)
        );
    }

    #[test]
    fn missing_key_surfaces() {
        let seal = ChaChaSeal;
        let nonce = derive_nonce(&Uuid::from_u128(42), 1, NonceKind::Pub);
        let sealed = seal.seal(&kid(), &KEY, &nonce, b"h", b"p").unwrap();
        let mut resolve = |_: &KeyId| Err(WeftError::Missing);
        assert_eq!(
            seal.open(&nonce, b"h", &sealed, &mut resolve),
            Err(WeftError::Missing)
        );
    }
}
