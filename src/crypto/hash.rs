// src/crypto/hash.rs
use crate::crypto::point_mul;
use crate::error::{MixerError, MixerResult};
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};

/// Try-and-increment bound. A valid x-coordinate is found in a handful of
/// attempts in practice; 256 matches the upstream contract.
const HASH_TO_CURVE_MAX_ATTEMPTS: u16 = 256;

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Concatenating SHA-256 over multiple segments.
pub fn sha256_parts(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Hashes arbitrary input to a non-zero scalar mod n. Re-hashes with a
/// counter on the negligible chance the digest falls outside [1, n).
pub fn hash_to_scalar(parts: &[&[u8]]) -> MixerResult<SecretKey> {
    let digest = sha256_parts(parts);
    for counter in 0u16..HASH_TO_CURVE_MAX_ATTEMPTS {
        let candidate = if counter == 0 {
            digest
        } else {
            sha256_parts(&[&digest, &counter.to_be_bytes()])
        };
        if let Ok(scalar) = SecretKey::from_slice(&candidate) {
            return Ok(scalar);
        }
    }
    Err(MixerError::Crypto("hash_to_scalar exhausted counter".into()))
}

/// Try-and-increment hash-to-curve: the digest is interpreted as a compressed
/// even-parity x-coordinate until a curve point is found.
pub fn hash_to_curve(input: &[u8]) -> MixerResult<PublicKey> {
    let seed = sha256_parts(&[b"hash-to-curve/v1", input]);
    for counter in 0u16..HASH_TO_CURVE_MAX_ATTEMPTS {
        let candidate = sha256_parts(&[&seed, &counter.to_be_bytes()]);
        let mut compressed = [0u8; 33];
        compressed[0] = 0x02;
        compressed[1..].copy_from_slice(&candidate);
        if let Ok(point) = PublicKey::from_slice(&compressed) {
            return Ok(point);
        }
    }
    Err(MixerError::Crypto(
        "hash_to_curve exhausted its attempt bound".into(),
    ))
}

/// A key image `x · H_p(P)`. One per private key, ever; reuse is the
/// double-spend signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyImage(pub PublicKey);

impl KeyImage {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.serialize())
    }

    pub fn from_hex(s: &str) -> MixerResult<Self> {
        let bytes = hex::decode(s).map_err(|e| MixerError::Crypto(format!("key image hex: {e}")))?;
        let point = PublicKey::from_slice(&bytes)
            .map_err(|e| MixerError::Crypto(format!("key image point: {e}")))?;
        Ok(KeyImage(point))
    }
}

impl std::fmt::Display for KeyImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// I = x · H_p(P). The caller is responsible for P = x·G.
pub fn key_image(private: &SecretKey, public: &PublicKey) -> MixerResult<KeyImage> {
    let base = hash_to_curve(&public.serialize())?;
    Ok(KeyImage(point_mul(&base, private)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    #[test]
    fn test_sha256_parts_equals_concat() {
        let whole = sha256(b"hello world");
        let parts = sha256_parts(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, parts);
    }

    #[test]
    fn test_hash_to_curve_deterministic() {
        let a = hash_to_curve(b"input").unwrap();
        let b = hash_to_curve(b"input").unwrap();
        let c = hash_to_curve(b"other").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_to_scalar_valid() {
        let s = hash_to_scalar(&[b"seed"]).unwrap();
        // must round-trip through the 32-byte fixed encoding
        assert_eq!(SecretKey::from_slice(&s.secret_bytes()).unwrap(), s);
    }

    #[test]
    fn test_key_image_deterministic_per_key() {
        let kp = generate_keypair().unwrap();
        let i1 = key_image(&kp.secret, &kp.public).unwrap();
        let i2 = key_image(&kp.secret, &kp.public).unwrap();
        assert_eq!(i1, i2);

        let other = generate_keypair().unwrap();
        let i3 = key_image(&other.secret, &other.public).unwrap();
        assert_ne!(i1, i3);
    }

    #[test]
    fn test_key_image_hex_roundtrip() {
        let kp = generate_keypair().unwrap();
        let image = key_image(&kp.secret, &kp.public).unwrap();
        let restored = KeyImage::from_hex(&image.to_hex()).unwrap();
        assert_eq!(image, restored);
    }

    #[test]
    fn test_key_image_differs_from_public_key() {
        // I = x·H_p(P) must not leak P itself
        let kp = generate_keypair().unwrap();
        let image = key_image(&kp.secret, &kp.public).unwrap();
        assert_ne!(image.0, kp.public);
    }
}
