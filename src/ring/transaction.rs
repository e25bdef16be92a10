// src/ring/transaction.rs
use crate::crypto::hash::sha256_parts;
use crate::crypto::RangeProof;
use crate::ring::clsag::RingSignature;
use crate::ring::decoy::DecoyCandidate;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One ring position: a real or decoy output. Decoys never carry private
/// keys anywhere in the system; only metadata travels.
#[derive(Debug, Clone, PartialEq)]
pub struct RingMember {
    pub public_key: PublicKey,
    pub amount: f64,
    pub block_height: u64,
}

impl From<DecoyCandidate> for RingMember {
    fn from(c: DecoyCandidate) -> Self {
        Self {
            public_key: c.public_key,
            amount: c.amount,
            block_height: c.block_height,
        }
    }
}

/// A signed transaction input: the ring and the signature over the
/// transaction message. The signer's position is not recoverable.
#[derive(Debug, Clone)]
pub struct RingTxInput {
    pub ring: Vec<RingMember>,
    pub amount: f64,
    pub signature: RingSignature,
}

/// A payout leg. Confidential outputs carry a commitment and range proof.
#[derive(Debug, Clone)]
pub struct RingTxOutput {
    pub address: String,
    pub amount: f64,
    pub commitment: Option<[u8; 33]>,
    pub range_proof: Option<RangeProof>,
}

#[derive(Debug, Clone)]
pub struct RingTransaction {
    pub id: Uuid,
    pub inputs: Vec<RingTxInput>,
    pub outputs: Vec<RingTxOutput>,
    pub fee: f64,
    pub message: [u8; 32],
    pub confidential: bool,
}

impl RingTransaction {
    /// Mock wire form used by the chain clients: digest plus every closing
    /// challenge.
    pub fn raw_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(32 + self.inputs.len() * 32);
        raw.extend_from_slice(&self.message);
        for input in &self.inputs {
            raw.extend_from_slice(&input.signature.c0.secret_bytes());
        }
        raw
    }
}

/// The digest every ring signature in the transaction commits to: every
/// input's ring and amount, then every output's (address, amount, script).
pub fn transaction_message(
    input_rings: &[(Vec<RingMember>, f64)],
    outputs: &[(String, f64)],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for (ring, amount) in input_rings {
        for member in ring {
            hasher.update(member.public_key.serialize());
        }
        hasher.update(amount.to_be_bytes());
    }
    for (address, amount) in outputs {
        hasher.update(address.as_bytes());
        hasher.update(amount.to_be_bytes());
        hasher.update(sha256_parts(&[b"script/p2out", address.as_bytes()]));
    }
    hasher.finalize().into()
}
