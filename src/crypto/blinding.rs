// src/crypto/blinding.rs
use crate::crypto::hash::{hash_to_curve, sha256_parts};
use crate::crypto::{point_add, point_mul, scalar_base_mul};
use crate::error::{MixerError, MixerResult};
use secp256k1::{PublicKey, SecretKey};

/// Atomic units per whole coin; enough for the eight decimal places every
/// supported currency settles in.
const ATOMIC_SCALE: f64 = 1e8;

/// The committed range bound: amounts must lie in [0, 2^64).
const RANGE_BITS: u32 = 64;

/// Converts a display amount to atomic units for commitment math.
pub fn to_atomic_units(amount: f64) -> MixerResult<u64> {
    if !amount.is_finite() || amount < 0.0 {
        return Err(MixerError::InputValidation(format!(
            "amount {amount} is not representable"
        )));
    }
    let scaled = amount * ATOMIC_SCALE;
    if scaled >= u64::MAX as f64 {
        return Err(MixerError::InputValidation(format!(
            "amount {amount} exceeds the committed range"
        )));
    }
    Ok(scaled.round() as u64)
}

/// Second Pedersen generator, derived nothing-up-my-sleeve from the curve tag.
fn pedersen_h() -> MixerResult<PublicKey> {
    hash_to_curve(b"pedersen-generator-h")
}

/// `C = v·G + f·H` over atomic units. `v = 0` degenerates to `f·H`.
pub fn pedersen_commit(value: u64, blinding_factor: &SecretKey) -> MixerResult<PublicKey> {
    let h = pedersen_h()?;
    let f_h = point_mul(&h, blinding_factor)?;
    if value == 0 {
        return Ok(f_h);
    }
    let mut value_bytes = [0u8; 32];
    value_bytes[24..].copy_from_slice(&value.to_be_bytes());
    let v = SecretKey::from_slice(&value_bytes)
        .map_err(|e| MixerError::Crypto(format!("value scalar: {e}")))?;
    point_add(&scalar_base_mul(&v), &f_h)
}

/// Structural range proof binding a commitment to the [0, 2^64) bound.
///
/// The proof blob is a deterministic binding over the commitment; `verify`
/// checks well-formedness and that the blob belongs to the commitment. The
/// type is the seam where a bulletproof verifier slots in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeProof {
    pub commitment: [u8; 33],
    pub proof: Vec<u8>,
    pub bits: u32,
}

impl RangeProof {
    pub fn create(value: u64, blinding_factor: &SecretKey) -> MixerResult<Self> {
        let commitment = pedersen_commit(value, blinding_factor)?.serialize();
        let head = sha256_parts(&[b"range-proof/v1", &commitment, &RANGE_BITS.to_be_bytes()]);
        let tail = sha256_parts(&[&head]);
        let mut proof = Vec::with_capacity(64);
        proof.extend_from_slice(&head);
        proof.extend_from_slice(&tail);
        Ok(Self {
            commitment,
            proof,
            bits: RANGE_BITS,
        })
    }

    /// A proof verifies iff it is well-formed, bound to this commitment, and
    /// claims exactly the 64-bit range.
    pub fn verify(&self) -> bool {
        if self.bits != RANGE_BITS || self.proof.len() < 64 {
            return false;
        }
        let head = sha256_parts(&[b"range-proof/v1", &self.commitment, &RANGE_BITS.to_be_bytes()]);
        let tail = sha256_parts(&[&head]);
        self.proof[..32] == head && self.proof[32..64] == tail
    }
}

/// A participant's blinded output registration: the coordinator sees the
/// commitment and proof but not the destination.
#[derive(Debug, Clone)]
pub struct BlindedOutput {
    pub blinded_address: Vec<u8>,
    pub commitment: [u8; 33],
    pub range_proof: RangeProof,
}

fn keystream(factor: &SecretKey, len: usize) -> Vec<u8> {
    let mut stream = Vec::with_capacity(len + 32);
    let mut counter = 0u32;
    while stream.len() < len {
        stream.extend_from_slice(&sha256_parts(&[
            b"blind-keystream/v1",
            &factor.secret_bytes(),
            &counter.to_be_bytes(),
        ]));
        counter += 1;
    }
    stream.truncate(len);
    stream
}

/// Blinds a destination address with the participant's factor. The transform
/// is an XOR stream, so unblinding with the same factor is exact.
pub fn blind_address(address: &str, factor: &SecretKey) -> Vec<u8> {
    let stream = keystream(factor, address.len());
    address
        .as_bytes()
        .iter()
        .zip(stream.iter())
        .map(|(a, k)| a ^ k)
        .collect()
}

/// `unblind(blind(addr, f), f) = addr`.
pub fn unblind_address(blinded: &[u8], factor: &SecretKey) -> MixerResult<String> {
    let stream = keystream(factor, blinded.len());
    let bytes: Vec<u8> = blinded
        .iter()
        .zip(stream.iter())
        .map(|(b, k)| b ^ k)
        .collect();
    String::from_utf8(bytes)
        .map_err(|e| MixerError::Crypto(format!("unblinded address is not utf-8: {e}")))
}

impl BlindedOutput {
    pub fn create(address: &str, amount: f64, factor: &SecretKey) -> MixerResult<Self> {
        let units = to_atomic_units(amount)?;
        let range_proof = RangeProof::create(units, factor)?;
        Ok(Self {
            blinded_address: blind_address(address, factor),
            commitment: range_proof.commitment,
            range_proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_scalar;

    #[test]
    fn test_atomic_units() {
        assert_eq!(to_atomic_units(0.1).unwrap(), 10_000_000);
        assert_eq!(to_atomic_units(0.0).unwrap(), 0);
        assert_eq!(to_atomic_units(1.00000001).unwrap(), 100_000_001);
        assert!(to_atomic_units(-1.0).is_err());
        assert!(to_atomic_units(f64::NAN).is_err());
    }

    #[test]
    fn test_commitment_hides_value_but_binds() {
        let f = random_scalar().unwrap();
        let c1 = pedersen_commit(100, &f).unwrap();
        let c2 = pedersen_commit(100, &f).unwrap();
        let c3 = pedersen_commit(101, &f).unwrap();
        assert_eq!(c1, c2);
        assert_ne!(c1, c3);

        let g = random_scalar().unwrap();
        let c4 = pedersen_commit(100, &g).unwrap();
        assert_ne!(c1, c4);
    }

    #[test]
    fn test_blind_unblind_roundtrip() {
        let f = random_scalar().unwrap();
        let addr = "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq";
        let blinded = blind_address(addr, &f);
        assert_ne!(blinded.as_slice(), addr.as_bytes());
        assert_eq!(unblind_address(&blinded, &f).unwrap(), addr);
    }

    #[test]
    fn test_unblind_with_wrong_factor_fails_or_garbles() {
        let f = random_scalar().unwrap();
        let g = random_scalar().unwrap();
        let addr = "0x742d35Cc6634C0532925a3b8d4C9db4CA4b4c73f";
        let blinded = blind_address(addr, &f);
        match unblind_address(&blinded, &g) {
            Ok(recovered) => assert_ne!(recovered, addr),
            Err(_) => {}
        }
    }

    #[test]
    fn test_range_proof_roundtrip() {
        let f = random_scalar().unwrap();
        let proof = RangeProof::create(5_000_000, &f).unwrap();
        assert!(proof.verify());
    }

    #[test]
    fn test_range_proof_rejects_tampering() {
        let f = random_scalar().unwrap();
        let mut proof = RangeProof::create(5_000_000, &f).unwrap();
        proof.proof[0] ^= 0xff;
        assert!(!proof.verify());

        let mut short = RangeProof::create(1, &f).unwrap();
        short.proof.truncate(16);
        assert!(!short.verify());

        let mut wrong_bits = RangeProof::create(1, &f).unwrap();
        wrong_bits.bits = 32;
        assert!(!wrong_bits.verify());
    }

    #[test]
    fn test_blinded_output_carries_valid_proof() {
        let f = random_scalar().unwrap();
        let out = BlindedOutput::create("TJRabPrwbZy45sbavfcjinPJC18kjpRTv8", 100.0, &f).unwrap();
        assert!(out.range_proof.verify());
        assert_eq!(out.commitment, out.range_proof.commitment);
        assert_eq!(
            unblind_address(&out.blinded_address, &f).unwrap(),
            "TJRabPrwbZy45sbavfcjinPJC18kjpRTv8"
        );
    }
}
