// src/ring/clsag.rs
use crate::crypto::hash::{hash_to_curve, hash_to_scalar, key_image, KeyImage};
use crate::crypto::{
    point_add, point_mul, random_scalar, scalar_base_mul, scalar_mul, scalar_sub,
};
use crate::error::{MixerError, MixerResult};
use crate::types::RingAlgorithm;
use secp256k1::{PublicKey, SecretKey};

fn domain_tag(algorithm: RingAlgorithm) -> &'static [u8] {
    match algorithm {
        RingAlgorithm::Clsag => b"ring/clsag/v1",
        RingAlgorithm::Mlsag => b"ring/mlsag/v1",
        RingAlgorithm::Borromean => b"ring/borromean/v1",
    }
}

/// A ring signature: the closing challenge, one response per ring member and
/// the signer's key image. Which member signed is not recoverable.
#[derive(Debug, Clone)]
pub struct RingSignature {
    pub algorithm: RingAlgorithm,
    pub c0: SecretKey,
    pub responses: Vec<SecretKey>,
    pub key_image: KeyImage,
}

fn challenge(
    algorithm: RingAlgorithm,
    message: &[u8],
    commitment: Option<&[u8; 33]>,
    l: &PublicKey,
    r: &PublicKey,
) -> MixerResult<SecretKey> {
    let l_bytes = l.serialize();
    let r_bytes = r.serialize();
    match commitment {
        Some(c) => hash_to_scalar(&[domain_tag(algorithm), message, c, &l_bytes, &r_bytes]),
        None => hash_to_scalar(&[domain_tag(algorithm), message, &l_bytes, &r_bytes]),
    }
}

/// Signs `message` as ring member `real_index`. The key image is
/// `x · H_p(P)`; the optional commitment is folded into every challenge so a
/// confidential transaction binds its value commitment to the signature.
pub fn ring_sign(
    algorithm: RingAlgorithm,
    message: &[u8],
    ring: &[PublicKey],
    real_index: usize,
    real_secret: &SecretKey,
    commitment: Option<&[u8; 33]>,
) -> MixerResult<RingSignature> {
    let n = ring.len();
    if n == 0 {
        return Err(MixerError::Crypto("empty ring".into()));
    }
    if real_index >= n {
        return Err(MixerError::Crypto(format!(
            "real index {real_index} outside ring of {n}"
        )));
    }
    let real_public = scalar_base_mul(real_secret);
    if ring[real_index] != real_public {
        return Err(MixerError::Crypto(
            "real key does not match the ring position".into(),
        ));
    }

    let image = key_image(real_secret, &real_public)?;

    // seed the chain at the position after the real member
    let alpha = random_scalar()?;
    let hp_real = hash_to_curve(&real_public.serialize())?;
    let l0 = scalar_base_mul(&alpha);
    let r0 = point_mul(&hp_real, &alpha)?;

    let mut c: Vec<Option<SecretKey>> = vec![None; n];
    let mut responses: Vec<Option<SecretKey>> = vec![None; n];
    c[(real_index + 1) % n] = Some(challenge(algorithm, message, commitment, &l0, &r0)?);

    let mut i = (real_index + 1) % n;
    while i != real_index {
        let s_i = random_scalar()?;
        let c_i = c[i]
            .clone()
            .ok_or_else(|| MixerError::Crypto("challenge chain gap".into()))?;

        // L = s·G + c·P, R = s·H_p(P) + c·I
        let l = point_add(&scalar_base_mul(&s_i), &point_mul(&ring[i], &c_i)?)?;
        let hp = hash_to_curve(&ring[i].serialize())?;
        let r = point_add(&point_mul(&hp, &s_i)?, &point_mul(&image.0, &c_i)?)?;

        c[(i + 1) % n] = Some(challenge(algorithm, message, commitment, &l, &r)?);
        responses[i] = Some(s_i);
        i = (i + 1) % n;
    }

    // close the ring: s_real = α − c_real·x
    let c_real = c[real_index]
        .clone()
        .ok_or_else(|| MixerError::Crypto("challenge chain incomplete".into()))?;
    responses[real_index] = Some(scalar_sub(&alpha, &scalar_mul(&c_real, real_secret)?)?);

    let c0 = c[0]
        .clone()
        .ok_or_else(|| MixerError::Crypto("missing closing challenge".into()))?;
    let responses = responses
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| MixerError::Crypto("missing ring response".into()))?;

    Ok(RingSignature {
        algorithm,
        c0,
        responses,
        key_image: image,
    })
}

/// Re-derives the whole Fiat-Shamir chain and accepts iff it closes at `c0`.
pub fn ring_verify(
    message: &[u8],
    signature: &RingSignature,
    ring: &[PublicKey],
    commitment: Option<&[u8; 33]>,
) -> bool {
    let n = ring.len();
    if n == 0 || signature.responses.len() != n {
        return false;
    }

    let mut c_i = signature.c0.clone();
    for i in 0..n {
        let s_i = &signature.responses[i];
        let l = match point_mul(&ring[i], &c_i).and_then(|cp| point_add(&scalar_base_mul(s_i), &cp))
        {
            Ok(p) => p,
            Err(_) => return false,
        };
        let r = match hash_to_curve(&ring[i].serialize()).and_then(|hp| {
            point_add(
                &point_mul(&hp, s_i)?,
                &point_mul(&signature.key_image.0, &c_i)?,
            )
        }) {
            Ok(p) => p,
            Err(_) => return false,
        };
        c_i = match challenge(signature.algorithm, message, commitment, &l, &r) {
            Ok(c) => c,
            Err(_) => return false,
        };
    }
    c_i == signature.c0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::generate_keypair;

    fn ring_with_real(size: usize, real_index: usize) -> (Vec<PublicKey>, SecretKey) {
        let mut ring = Vec::with_capacity(size);
        let mut secret = None;
        for i in 0..size {
            let kp = generate_keypair().unwrap();
            if i == real_index {
                secret = Some(kp.secret.clone());
            }
            ring.push(kp.public);
        }
        (ring, secret.unwrap())
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let (ring, secret) = ring_with_real(11, 4);
        let sig = ring_sign(RingAlgorithm::Clsag, b"msg", &ring, 4, &secret, None).unwrap();
        assert_eq!(sig.responses.len(), 11);
        assert!(ring_verify(b"msg", &sig, &ring, None));
        assert!(!ring_verify(b"other", &sig, &ring, None));
    }

    #[test]
    fn test_every_real_position_verifies() {
        for real in [0usize, 1, 6] {
            let (ring, secret) = ring_with_real(7, real);
            let sig =
                ring_sign(RingAlgorithm::Clsag, b"position", &ring, real, &secret, None).unwrap();
            assert!(ring_verify(b"position", &sig, &ring, None));
        }
    }

    #[test]
    fn test_single_member_ring() {
        let (ring, secret) = ring_with_real(1, 0);
        let sig = ring_sign(RingAlgorithm::Clsag, b"solo", &ring, 0, &secret, None).unwrap();
        assert!(ring_verify(b"solo", &sig, &ring, None));
    }

    #[test]
    fn test_wrong_ring_fails() {
        let (ring, secret) = ring_with_real(7, 2);
        let sig = ring_sign(RingAlgorithm::Clsag, b"msg", &ring, 2, &secret, None).unwrap();

        let (other_ring, _) = ring_with_real(7, 0);
        assert!(!ring_verify(b"msg", &sig, &other_ring, None));
    }

    #[test]
    fn test_tampered_response_fails() {
        let (ring, secret) = ring_with_real(7, 3);
        let mut sig = ring_sign(RingAlgorithm::Clsag, b"msg", &ring, 3, &secret, None).unwrap();
        sig.responses[0] = generate_keypair().unwrap().secret;
        assert!(!ring_verify(b"msg", &sig, &ring, None));
    }

    #[test]
    fn test_mismatched_real_key_rejected() {
        let (ring, _) = ring_with_real(7, 3);
        let stranger = generate_keypair().unwrap();
        assert!(ring_sign(
            RingAlgorithm::Clsag,
            b"msg",
            &ring,
            3,
            &stranger.secret,
            None
        )
        .is_err());
    }

    #[test]
    fn test_commitment_binds_signature() {
        let (ring, secret) = ring_with_real(7, 1);
        let commitment = [3u8; 33];
        let sig = ring_sign(
            RingAlgorithm::Clsag,
            b"msg",
            &ring,
            1,
            &secret,
            Some(&commitment),
        )
        .unwrap();
        assert!(ring_verify(b"msg", &sig, &ring, Some(&commitment)));
        assert!(!ring_verify(b"msg", &sig, &ring, None));
        let other = [4u8; 33];
        assert!(!ring_verify(b"msg", &sig, &ring, Some(&other)));
    }

    #[test]
    fn test_algorithm_tags_are_not_interchangeable() {
        let (ring, secret) = ring_with_real(7, 1);
        let mut sig = ring_sign(RingAlgorithm::Clsag, b"msg", &ring, 1, &secret, None).unwrap();
        sig.algorithm = RingAlgorithm::Mlsag;
        assert!(!ring_verify(b"msg", &sig, &ring, None));
    }

    #[test]
    fn test_key_image_is_stable_across_rings() {
        // same real key in two different rings produces the same image
        let kp = generate_keypair().unwrap();
        let mut ring_a = vec![kp.public];
        let mut ring_b = vec![kp.public];
        for _ in 0..6 {
            ring_a.push(generate_keypair().unwrap().public);
            ring_b.push(generate_keypair().unwrap().public);
        }
        let sig_a = ring_sign(RingAlgorithm::Clsag, b"a", &ring_a, 0, &kp.secret, None).unwrap();
        let sig_b = ring_sign(RingAlgorithm::Clsag, b"b", &ring_b, 0, &kp.secret, None).unwrap();
        assert_eq!(sig_a.key_image, sig_b.key_image);
    }
}
