// src/crypto/signature.rs
use crate::crypto::hash::{hash_to_scalar, sha256};
use crate::crypto::{point_add, point_mul, scalar_add, scalar_base_mul, scalar_mul, secp};
use crate::error::{MixerError, MixerResult};
use hmac::{Hmac, Mac};
use secp256k1::ecdsa;
use secp256k1::{Message, PublicKey, SecretKey};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// RFC-6979-style deterministic nonce: HMAC-SHA256 keyed by the private
/// scalar over the message, re-keyed with a counter until the candidate is a
/// valid scalar. Same (key, message) always yields the same nonce.
pub fn deterministic_nonce(private: &SecretKey, message: &[u8]) -> MixerResult<SecretKey> {
    for counter in 0u16..256 {
        let mut mac = HmacSha256::new_from_slice(&private.secret_bytes())
            .map_err(|e| MixerError::Crypto(format!("hmac init: {e}")))?;
        mac.update(message);
        mac.update(&counter.to_be_bytes());
        let candidate: [u8; 32] = mac.finalize().into_bytes().into();
        if let Ok(nonce) = SecretKey::from_slice(&candidate) {
            return Ok(nonce);
        }
    }
    Err(MixerError::Crypto("nonce derivation exhausted".into()))
}

/// ECDSA over SHA-256(message), compact 64-byte signature.
pub fn ecdsa_sign(message: &[u8], private: &SecretKey) -> MixerResult<[u8; 64]> {
    let digest = sha256(message);
    let msg = Message::from_digest_slice(&digest)
        .map_err(|e| MixerError::Crypto(format!("message digest: {e}")))?;
    let sig = secp().sign_ecdsa(&msg, private);
    Ok(sig.serialize_compact())
}

pub fn ecdsa_verify(message: &[u8], signature: &[u8], public: &PublicKey) -> bool {
    let digest = sha256(message);
    let msg = match Message::from_digest_slice(&digest) {
        Ok(m) => m,
        Err(_) => return false,
    };
    let sig = match ecdsa::Signature::from_compact(signature) {
        Ok(s) => s,
        Err(_) => return false,
    };
    secp().verify_ecdsa(&msg, &sig, public).is_ok()
}

/// Schnorr signature (R, s) with challenge `e = H(R ‖ P ‖ m)` and response
/// `s = k + e·x mod n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchnorrSignature {
    pub r: PublicKey,
    pub s: SecretKey,
}

impl SchnorrSignature {
    /// 65-byte wire form: compressed R followed by the 32-byte scalar.
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut out = [0u8; 65];
        out[..33].copy_from_slice(&self.r.serialize());
        out[33..].copy_from_slice(&self.s.secret_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> MixerResult<Self> {
        if bytes.len() != 65 {
            return Err(MixerError::Crypto(format!(
                "schnorr signature must be 65 bytes, got {}",
                bytes.len()
            )));
        }
        let r = PublicKey::from_slice(&bytes[..33])
            .map_err(|e| MixerError::Crypto(format!("schnorr R: {e}")))?;
        let s = SecretKey::from_slice(&bytes[33..])
            .map_err(|e| MixerError::Crypto(format!("schnorr s: {e}")))?;
        Ok(Self { r, s })
    }
}

fn schnorr_challenge(r: &PublicKey, p: &PublicKey, message: &[u8]) -> MixerResult<SecretKey> {
    hash_to_scalar(&[&r.serialize(), &p.serialize(), message])
}

pub fn schnorr_sign(message: &[u8], private: &SecretKey) -> MixerResult<SchnorrSignature> {
    let public = PublicKey::from_secret_key(secp(), private);
    let k = deterministic_nonce(private, message)?;
    let r = scalar_base_mul(&k);
    let e = schnorr_challenge(&r, &public, message)?;
    // s = k + e·x
    let s = scalar_add(&k, &scalar_mul(&e, private)?)?;
    Ok(SchnorrSignature { r, s })
}

/// Checks `s·G = R + e·P`.
pub fn schnorr_verify(message: &[u8], sig: &SchnorrSignature, public: &PublicKey) -> bool {
    let e = match schnorr_challenge(&sig.r, public, message) {
        Ok(e) => e,
        Err(_) => return false,
    };
    let lhs = scalar_base_mul(&sig.s);
    let rhs = match point_mul(public, &e).and_then(|ep| point_add(&ep, &sig.r)) {
        Ok(p) => p,
        Err(_) => return false,
    };
    lhs == rhs
}
