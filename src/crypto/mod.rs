// src/crypto/mod.rs
pub mod blinding;
pub mod hash;
pub mod signature;
pub mod stealth;

pub use blinding::{
    blind_address, pedersen_commit, to_atomic_units, unblind_address, BlindedOutput, RangeProof,
};
pub use hash::{hash_to_curve, hash_to_scalar, key_image, sha256, KeyImage};
pub use signature::{
    deterministic_nonce, ecdsa_sign, ecdsa_verify, schnorr_sign, schnorr_verify, SchnorrSignature,
};
pub use stealth::{
    create_stealth_address, create_stealth_address_with_ephemeral, derive_one_time_private,
    scan_outputs, ScannableOutput, StealthAddress,
};

use crate::error::{MixerError, MixerResult};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{All, PublicKey, Scalar, Secp256k1, SecretKey};
use zeroize::Zeroize;

/// Shared secp256k1 context. All curve operations in the crate go through
/// this module; callers never touch libsecp directly.
pub fn secp() -> &'static Secp256k1<All> {
    static CTX: std::sync::OnceLock<Secp256k1<All>> = std::sync::OnceLock::new();
    CTX.get_or_init(Secp256k1::new)
}

/// A secp256k1 keypair. Private scalar is zeroized on drop.
#[derive(Debug, Clone)]
pub struct Keypair {
    pub public: PublicKey,
    pub secret: SecretKey,
}

impl Drop for Keypair {
    fn drop(&mut self) {
        let mut bytes = self.secret.secret_bytes();
        bytes.zeroize();
    }
}

/// Generates a keypair, rejecting candidate scalars outside [1, n).
pub fn generate_keypair() -> MixerResult<Keypair> {
    let mut rng = OsRng;
    // from_slice validates the scalar; a random 32-byte string is invalid
    // with probability ~2^-128, but the loop keeps the contract explicit.
    for _ in 0..8 {
        let mut candidate = [0u8; 32];
        rng.fill_bytes(&mut candidate);
        if let Ok(secret) = SecretKey::from_slice(&candidate) {
            candidate.zeroize();
            let public = PublicKey::from_secret_key(secp(), &secret);
            return Ok(Keypair { public, secret });
        }
        candidate.zeroize();
    }
    Err(MixerError::Crypto(
        "could not generate a valid private scalar".to_string(),
    ))
}

/// Random non-zero scalar.
pub fn random_scalar() -> MixerResult<SecretKey> {
    Ok(generate_keypair()?.secret)
}

/// 32-byte big-endian serialization of a scalar, left-padded by construction.
pub fn scalar_bytes(sk: &SecretKey) -> [u8; 32] {
    sk.secret_bytes()
}

/// a + b mod n
pub fn scalar_add(a: &SecretKey, b: &SecretKey) -> MixerResult<SecretKey> {
    a.clone()
        .add_tweak(&Scalar::from(b.clone()))
        .map_err(|e| MixerError::Crypto(format!("scalar add: {e}")))
}

/// a * b mod n
pub fn scalar_mul(a: &SecretKey, b: &SecretKey) -> MixerResult<SecretKey> {
    a.clone()
        .mul_tweak(&Scalar::from(b.clone()))
        .map_err(|e| MixerError::Crypto(format!("scalar mul: {e}")))
}

/// a - b mod n
pub fn scalar_sub(a: &SecretKey, b: &SecretKey) -> MixerResult<SecretKey> {
    scalar_add(a, &b.clone().negate())
}

/// s·G
pub fn scalar_base_mul(s: &SecretKey) -> PublicKey {
    PublicKey::from_secret_key(secp(), s)
}

/// s·P
pub fn point_mul(point: &PublicKey, s: &SecretKey) -> MixerResult<PublicKey> {
    point
        .clone()
        .mul_tweak(secp(), &Scalar::from(s.clone()))
        .map_err(|e| MixerError::Crypto(format!("point mul: {e}")))
}

/// P + Q
pub fn point_add(p: &PublicKey, q: &PublicKey) -> MixerResult<PublicKey> {
    p.combine(q)
        .map_err(|e| MixerError::Crypto(format!("point add: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_generation() {
        let kp = generate_keypair().unwrap();
        assert_eq!(kp.public, PublicKey::from_secret_key(secp(), &kp.secret));
        // compressed serialization
        assert_eq!(kp.public.serialize().len(), 33);
    }

    #[test]
    fn test_scalar_roundtrip_is_32_bytes() {
        let kp = generate_keypair().unwrap();
        let bytes = scalar_bytes(&kp.secret);
        assert_eq!(bytes.len(), 32);
        let restored = SecretKey::from_slice(&bytes).unwrap();
        assert_eq!(restored, kp.secret);
    }

    #[test]
    fn test_scalar_arithmetic() {
        let a = generate_keypair().unwrap().secret;
        let b = generate_keypair().unwrap().secret;

        // (a + b) - b == a
        let sum = scalar_add(&a, &b).unwrap();
        let back = scalar_sub(&sum, &b).unwrap();
        assert_eq!(back, a);

        // (a·b)·G == a·(b·G)
        let ab = scalar_mul(&a, &b).unwrap();
        let lhs = scalar_base_mul(&ab);
        let rhs = point_mul(&scalar_base_mul(&b), &a).unwrap();
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_point_addition_commutes() {
        let p = generate_keypair().unwrap().public;
        let q = generate_keypair().unwrap().public;
        assert_eq!(point_add(&p, &q).unwrap(), point_add(&q, &p).unwrap());
    }
}
