// src/ring/mod.rs
pub mod clsag;
pub mod decoy;
pub mod transaction;

pub use clsag::{ring_sign, ring_verify, RingSignature};
pub use decoy::{DecoyCandidate, DecoySelector};
pub use transaction::{transaction_message, RingMember, RingTransaction, RingTxInput, RingTxOutput};

use crate::crypto::hash::{key_image, KeyImage};
use crate::crypto::stealth::{self, ScannableOutput, StealthAddress};
use crate::crypto::{random_scalar, to_atomic_units, Keypair, RangeProof};
use crate::error::{MixerError, MixerResult};
use crate::registry::{InsertOutcome, KeyImageRegistry};
use crate::types::RingConfig;
use rand::rngs::OsRng;
use rand::Rng;
use secp256k1::{PublicKey, SecretKey};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Balance tolerance on the non-confidential path.
const BALANCE_TOLERANCE: f64 = 1e-6;

/// A spendable output the mixer controls: the outpoint, its keypair and the
/// height it confirmed at.
#[derive(Debug, Clone)]
pub struct SpendableInput {
    pub txid: String,
    pub output_index: u32,
    pub amount: f64,
    pub keypair: Keypair,
    pub block_height: u64,
}

/// Single-signer anonymous path: stealth addresses, decoy rings, ring
/// signatures and (optionally) confidential outputs. Used when CoinJoin
/// cannot form a quorum.
#[derive(Clone)]
pub struct RingMixer {
    config: RingConfig,
    registry: KeyImageRegistry,
    /// Historical outputs decoys are drawn from; fed by chain scanning.
    decoy_pool: Arc<RwLock<Vec<DecoyCandidate>>>,
    /// Keys barred from decoy selection (inputs of blamed participants).
    excluded: Arc<RwLock<HashSet<PublicKey>>>,
}

impl RingMixer {
    pub fn new(config: RingConfig, registry: KeyImageRegistry) -> MixerResult<Self> {
        if config.ring_size < config.min_ring_size || config.ring_size > config.max_ring_size {
            return Err(MixerError::InputValidation(format!(
                "ring size {} outside [{}, {}]",
                config.ring_size, config.min_ring_size, config.max_ring_size
            )));
        }
        Ok(Self {
            config,
            registry,
            decoy_pool: Arc::new(RwLock::new(Vec::new())),
            excluded: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub async fn add_decoy_candidates(&self, candidates: Vec<DecoyCandidate>) {
        self.decoy_pool.write().await.extend(candidates);
    }

    pub async fn exclude_key(&self, key: PublicKey) {
        self.excluded.write().await.insert(key);
    }

    pub async fn decoy_pool_size(&self) -> usize {
        self.decoy_pool.read().await.len()
    }

    /// Creates a ring signature with the real key at `real_index`. The key
    /// image is checked against the registry before signing and registered
    /// after the signature succeeds.
    pub async fn create_signature(
        &self,
        message: &[u8],
        real_secret: &SecretKey,
        ring: &[PublicKey],
        real_index: usize,
        commitment: Option<&[u8; 33]>,
    ) -> MixerResult<RingSignature> {
        let real_public = ring
            .get(real_index)
            .ok_or_else(|| MixerError::Crypto("real index outside ring".into()))?;
        let image = key_image(real_secret, real_public)?;
        if self.registry.contains(&image).await {
            return Err(MixerError::DoubleSpend(image.to_hex()));
        }

        let signature = ring_sign(
            self.config.algorithm,
            message,
            ring,
            real_index,
            real_secret,
            commitment,
        )?;

        if self.registry.try_insert(&image).await? == InsertOutcome::Duplicate {
            // lost the race against a concurrent spend of the same key
            return Err(MixerError::DoubleSpend(image.to_hex()));
        }
        Ok(signature)
    }

    /// Pure verification; no registry interaction.
    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &RingSignature,
        ring: &[PublicKey],
        commitment: Option<&[u8; 33]>,
    ) -> bool {
        ring_verify(message, signature, ring, commitment)
    }

    pub fn create_stealth_address(
        &self,
        spend_public: &PublicKey,
        view_public: &PublicKey,
    ) -> MixerResult<StealthAddress> {
        stealth::create_stealth_address(spend_public, view_public)
    }

    pub fn scan_for_incoming_payments(
        &self,
        outputs: &[ScannableOutput],
        view_private: &SecretKey,
        spend_public: &PublicKey,
    ) -> MixerResult<Vec<StealthAddress>> {
        stealth::scan_outputs(outputs, view_private, spend_public)
    }

    /// Builds a fully signed ring transaction: one ring per input with the
    /// real key at a uniformly random position, a ring signature over the
    /// transaction message, and range proofs on every output when
    /// confidential mode is on.
    ///
    /// Key images are pre-checked here and registered by `commit_key_images`
    /// once the transaction is accepted for broadcast.
    pub async fn create_ring_transaction(
        &self,
        inputs: Vec<SpendableInput>,
        outputs: Vec<(String, f64)>,
        fee: f64,
    ) -> MixerResult<RingTransaction> {
        if inputs.is_empty() || outputs.is_empty() {
            return Err(MixerError::InputValidation(
                "a ring transaction needs inputs and outputs".into(),
            ));
        }
        let in_total: f64 = inputs.iter().map(|i| i.amount).sum();
        let out_total: f64 = outputs.iter().map(|(_, a)| a).sum();
        if (in_total - out_total - fee).abs() >= BALANCE_TOLERANCE {
            return Err(MixerError::InputValidation(format!(
                "unbalanced transaction: in {in_total}, out {out_total}, fee {fee}"
            )));
        }

        // double-spend pre-check on every input before any signing work
        for input in &inputs {
            let image = key_image(&input.keypair.secret, &input.keypair.public)?;
            if self.registry.contains(&image).await {
                return Err(MixerError::DoubleSpend(image.to_hex()));
            }
        }

        let current_height = inputs.iter().map(|i| i.block_height).max().unwrap_or(0)
            + self.config.minimum_age;
        let selector = DecoySelector::new(self.config.clone());
        let pool = self.decoy_pool.read().await.clone();
        let excluded = self.excluded.read().await.clone();

        // assemble every ring first so the message covers them all
        let mut rings: Vec<(Vec<RingMember>, usize)> = Vec::with_capacity(inputs.len());
        for input in &inputs {
            let decoys = selector.select(
                &mut OsRng,
                &pool,
                &input.keypair.public,
                &excluded,
                current_height,
                self.config.ring_size - 1,
            )?;
            let mut ring: Vec<RingMember> = decoys.into_iter().map(RingMember::from).collect();
            let real_index = OsRng.gen_range(0..=ring.len());
            ring.insert(
                real_index,
                RingMember {
                    public_key: input.keypair.public,
                    amount: input.amount,
                    block_height: input.block_height,
                },
            );
            rings.push((ring, real_index));
        }

        let message = transaction_message(
            &rings
                .iter()
                .zip(inputs.iter())
                .map(|((ring, _), input)| (ring.clone(), input.amount))
                .collect::<Vec<_>>(),
            &outputs,
        );

        let mut tx_inputs = Vec::with_capacity(inputs.len());
        for ((ring, real_index), input) in rings.into_iter().zip(inputs.iter()) {
            let keys: Vec<PublicKey> = ring.iter().map(|m| m.public_key).collect();
            let signature = ring_sign(
                self.config.algorithm,
                &message,
                &keys,
                real_index,
                &input.keypair.secret,
                None,
            )?;
            tx_inputs.push(RingTxInput {
                ring,
                amount: input.amount,
                signature,
            });
        }

        let mut tx_outputs = Vec::with_capacity(outputs.len());
        for (address, amount) in outputs {
            let (commitment, range_proof) = if self.config.confidential {
                let factor = random_scalar()?;
                let proof = RangeProof::create(to_atomic_units(amount)?, &factor)?;
                (Some(proof.commitment), Some(proof))
            } else {
                (None, None)
            };
            tx_outputs.push(RingTxOutput {
                address,
                amount,
                commitment,
                range_proof,
            });
        }

        Ok(RingTransaction {
            id: Uuid::new_v4(),
            inputs: tx_inputs,
            outputs: tx_outputs,
            fee,
            message,
            confidential: self.config.confidential,
        })
    }

    /// Full verification: balance equality (replaced by range proofs in
    /// confidential mode), every ring signature, every key image against the
    /// registry, every range proof.
    pub async fn verify_ring_transaction(&self, tx: &RingTransaction) -> MixerResult<()> {
        if tx.confidential {
            for output in &tx.outputs {
                let proof = output.range_proof.as_ref().ok_or_else(|| {
                    MixerError::ProtocolViolation {
                        participant: "ring-tx".into(),
                        reason: "confidential output without range proof".into(),
                    }
                })?;
                if !proof.verify() {
                    return Err(MixerError::ProtocolViolation {
                        participant: "ring-tx".into(),
                        reason: "invalid range proof".into(),
                    });
                }
            }
        } else {
            let in_total: f64 = tx.inputs.iter().map(|i| i.amount).sum();
            let out_total: f64 = tx.outputs.iter().map(|o| o.amount).sum();
            if (in_total - out_total - tx.fee).abs() >= BALANCE_TOLERANCE {
                return Err(MixerError::ProtocolViolation {
                    participant: "ring-tx".into(),
                    reason: "inputs, outputs and fee do not balance".into(),
                });
            }
        }

        let mut seen: HashSet<KeyImage> = HashSet::new();
        for input in &tx.inputs {
            let keys: Vec<PublicKey> = input.ring.iter().map(|m| m.public_key).collect();
            if !ring_verify(&tx.message, &input.signature, &keys, None) {
                return Err(MixerError::ProtocolViolation {
                    participant: "ring-tx".into(),
                    reason: "ring signature failed verification".into(),
                });
            }
            if !seen.insert(input.signature.key_image) {
                return Err(MixerError::DoubleSpend(input.signature.key_image.to_hex()));
            }
            if self.registry.contains(&input.signature.key_image).await {
                return Err(MixerError::DoubleSpend(input.signature.key_image.to_hex()));
            }
        }
        Ok(())
    }

    /// Registers the transaction's key images once it is accepted for
    /// broadcast. Concurrent spends of the same key collapse to one winner.
    pub async fn commit_key_images(&self, tx: &RingTransaction) -> MixerResult<()> {
        for input in &tx.inputs {
            if self.registry.try_insert(&input.signature.key_image).await?
                == InsertOutcome::Duplicate
            {
                return Err(MixerError::DoubleSpend(input.signature.key_image.to_hex()));
            }
        }
        Ok(())
    }
}
