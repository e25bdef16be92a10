// src/crypto/stealth.rs
use crate::crypto::hash::hash_to_scalar;
use crate::crypto::{point_mul, random_scalar, scalar_add, scalar_base_mul};
use crate::error::MixerResult;
use secp256k1::{PublicKey, SecretKey};

/// A derived one-time payment address. `tx_public` (R = r·G) is published
/// alongside the output so the recipient can recover the shared secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StealthAddress {
    pub one_time_public: PublicKey,
    pub tx_public: PublicKey,
}

/// A transaction output a scanner inspects: the published ephemeral key and
/// the output's one-time public key.
#[derive(Debug, Clone)]
pub struct ScannableOutput {
    pub ephemeral_key: PublicKey,
    pub one_time_public: PublicKey,
    pub output_index: usize,
}

fn shared_secret(scalar: &SecretKey, point: &PublicKey) -> MixerResult<SecretKey> {
    let ecdh_point = point_mul(point, scalar)?;
    hash_to_scalar(&[&ecdh_point.serialize()])
}

/// Derives `P' = H(r·V)·G + S` with a fresh ephemeral `r`.
pub fn create_stealth_address(
    spend_public: &PublicKey,
    view_public: &PublicKey,
) -> MixerResult<StealthAddress> {
    let r = random_scalar()?;
    create_stealth_address_with_ephemeral(spend_public, view_public, &r)
}

/// Deterministic variant used by tests and by CoinJoin unblinding, where the
/// ephemeral scalar is the participant's blinding factor.
pub fn create_stealth_address_with_ephemeral(
    spend_public: &PublicKey,
    view_public: &PublicKey,
    ephemeral: &SecretKey,
) -> MixerResult<StealthAddress> {
    let s = shared_secret(ephemeral, view_public)?;
    let one_time_public = spend_public.combine(&scalar_base_mul(&s)).map_err(|e| {
        crate::error::MixerError::Crypto(format!("stealth point combine: {e}"))
    })?;
    Ok(StealthAddress {
        one_time_public,
        tx_public: scalar_base_mul(ephemeral),
    })
}

/// Recipient-side scan: for each output computes `H(v·R)·G + S` and keeps the
/// outputs that match their own one-time key.
pub fn scan_outputs(
    outputs: &[ScannableOutput],
    view_private: &SecretKey,
    spend_public: &PublicKey,
) -> MixerResult<Vec<StealthAddress>> {
    let mut found = Vec::new();
    for output in outputs {
        let s = shared_secret(view_private, &output.ephemeral_key)?;
        let expected = match spend_public.combine(&scalar_base_mul(&s)) {
            Ok(p) => p,
            // combining to the point at infinity cannot match a real output
            Err(_) => continue,
        };
        if expected == output.one_time_public {
            found.push(StealthAddress {
                one_time_public: output.one_time_public,
                tx_public: output.ephemeral_key,
            });
        }
    }
    Ok(found)
}

/// Spends a detected output: `x' = H(v·R) + spend_private mod n`, so that
/// `x'·G = P'`.
pub fn derive_one_time_private(
    ephemeral_key: &PublicKey,
    view_private: &SecretKey,
    spend_private: &SecretKey,
) -> MixerResult<SecretKey> {
    let s = shared_secret(view_private, ephemeral_key)?;
    scalar_add(&s, spend_private)
}
