// src/coinjoin/session.rs
use crate::crypto::hash::sha256_parts;
use crate::crypto::{BlindedOutput, KeyImage};
use crate::error::{MixerError, MixerResult};
use crate::types::Currency;
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Session phases, strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Registration,
    OutputRegistration,
    Signing,
    Broadcasting,
    Completed,
    Failed,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Completed | SessionPhase::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Registration => "REGISTRATION",
            SessionPhase::OutputRegistration => "OUTPUT_REGISTRATION",
            SessionPhase::Signing => "SIGNING",
            SessionPhase::Broadcasting => "BROADCASTING",
            SessionPhase::Completed => "COMPLETED",
            SessionPhase::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParticipantStatus {
    Registered,
    Committed,
    Signed,
    Confirmed,
    Failed,
}

/// A UTXO a participant brings to the session. The private key never leaves
/// the participant; the coordinator sees the public key and the implied key
/// image.
#[derive(Debug, Clone)]
pub struct ParticipantInput {
    pub txid: String,
    pub output_index: u32,
    pub amount: f64,
    pub public_key: PublicKey,
    pub key_image: KeyImage,
}

/// Per-participant session state. The id is H(publicKey).
#[derive(Debug, Clone)]
pub struct Participant {
    pub id: String,
    pub public_key: PublicKey,
    pub inputs: Vec<ParticipantInput>,
    pub blinded_outputs: Vec<BlindedOutput>,
    pub blinding_factor: Option<SecretKey>,
    pub status: ParticipantStatus,
    pub proof_challenge: Option<[u8; 32]>,
    pub proof_verified: bool,
    pub registered_at: chrono::DateTime<chrono::Utc>,
}

pub fn participant_id(public_key: &PublicKey) -> String {
    hex::encode(Sha256::digest(public_key.serialize()))
}

/// A finalised transaction output leg.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutput {
    pub address: String,
    pub amount: f64,
    pub script: Vec<u8>,
}

impl TxOutput {
    pub fn new(address: String, amount: f64) -> Self {
        let script = sha256_parts(&[b"script/p2out", address.as_bytes()]).to_vec();
        Self {
            address,
            amount,
            script,
        }
    }
}

/// One multi-party mixing session owned by the coordinator task.
#[derive(Debug, Clone)]
pub struct CoinJoinSession {
    pub id: Uuid,
    pub coordinator_id: Uuid,
    pub currency: Currency,
    pub denomination: f64,
    pub phase: SessionPhase,
    pub participants: HashMap<String, Participant>,
    pub blame_list: Vec<String>,
    pub final_outputs: Vec<TxOutput>,
    pub unsigned_message: Option<[u8; 32]>,
    pub txid: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub phase_deadline: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CoinJoinSession {
    pub fn new(
        coordinator_id: Uuid,
        currency: Currency,
        denomination: f64,
        registration_timeout_secs: u64,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            coordinator_id,
            currency,
            denomination,
            phase: SessionPhase::Registration,
            participants: HashMap::new(),
            blame_list: Vec::new(),
            final_outputs: Vec::new(),
            unsigned_message: None,
            txid: None,
            created_at: now,
            phase_deadline: now + chrono::Duration::seconds(registration_timeout_secs as i64),
            completed_at: None,
        }
    }

    /// Participants still in good standing.
    pub fn active_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .values()
            .filter(|p| p.status != ParticipantStatus::Failed)
    }

    pub fn active_count(&self) -> usize {
        self.active_participants().count()
    }

    /// Monotonic phase move; jumping backwards is an invariant violation.
    pub fn advance_phase(
        &mut self,
        next: SessionPhase,
        timeout_secs: u64,
    ) -> MixerResult<()> {
        if next <= self.phase && !self.phase.is_terminal() {
            return Err(MixerError::InvalidStateTransition {
                from: self.phase.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        if self.phase.is_terminal() {
            return Err(MixerError::WrongPhase(self.phase.as_str().to_string()));
        }
        log::info!(
            "session {}: {} -> {}",
            self.id,
            self.phase.as_str(),
            next.as_str()
        );
        self.phase = next;
        self.phase_deadline =
            chrono::Utc::now() + chrono::Duration::seconds(timeout_secs as i64);
        if next.is_terminal() {
            self.completed_at = Some(chrono::Utc::now());
        }
        Ok(())
    }

    pub fn deadline_passed(&self) -> bool {
        !self.phase.is_terminal() && chrono::Utc::now() > self.phase_deadline
    }

    /// All inputs across active participants, in participant-id order so
    /// every party derives the same message bytes.
    pub fn ordered_inputs(&self) -> Vec<&ParticipantInput> {
        let mut ids: Vec<&String> = self
            .participants
            .values()
            .filter(|p| p.status != ParticipantStatus::Failed)
            .map(|p| &p.id)
            .collect();
        ids.sort();
        let mut inputs = Vec::new();
        for id in ids {
            if let Some(p) = self.participants.get(id) {
                inputs.extend(p.inputs.iter());
            }
        }
        inputs
    }

    /// The bytes each participant signs: SHA-256 over every input's
    /// (txid, vout, amount), then every output's (address, amount, script),
    /// in the post-shuffle order.
    pub fn build_message(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for input in self.ordered_inputs() {
            hasher.update(input.txid.as_bytes());
            hasher.update(input.output_index.to_be_bytes());
            hasher.update(input.amount.to_be_bytes());
        }
        for output in &self.final_outputs {
            hasher.update(output.address.as_bytes());
            hasher.update(output.amount.to_be_bytes());
            hasher.update(&output.script);
        }
        hasher.finalize().into()
    }

    /// Mock wire form: the signed digest followed by every signature, enough
    /// for the mock chain and for confirmation tracking.
    pub fn raw_transaction(&self, signatures: &[Vec<u8>]) -> Vec<u8> {
        let mut raw = Vec::new();
        if let Some(message) = &self.unsigned_message {
            raw.extend_from_slice(message);
        }
        for sig in signatures {
            raw.extend_from_slice(sig);
        }
        raw
    }
}

/// Cryptographic Fisher-Yates: four OsRng bytes per swap, reduced modulo the
/// running prefix length. Every participant observes the same order because
/// the shuffle happens once, coordinator-side, before signing.
pub fn crypto_shuffle<T>(items: &mut [T]) {
    let mut rng = OsRng;
    let mut buf = [0u8; 4];
    for i in (1..items.len()).rev() {
        rng.fill_bytes(&mut buf);
        let j = (u32::from_be_bytes(buf) as usize) % (i + 1);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_keypair, key_image};

    fn session() -> CoinJoinSession {
        CoinJoinSession::new(Uuid::new_v4(), Currency::Btc, 0.1, 600)
    }

    fn participant(n: u8) -> Participant {
        let kp = generate_keypair().unwrap();
        let image = key_image(&kp.secret, &kp.public).unwrap();
        Participant {
            id: participant_id(&kp.public),
            public_key: kp.public,
            inputs: vec![ParticipantInput {
                txid: format!("txid-{n}"),
                output_index: 0,
                amount: 0.1001,
                public_key: kp.public,
                key_image: image,
            }],
            blinded_outputs: Vec::new(),
            blinding_factor: None,
            status: ParticipantStatus::Registered,
            proof_challenge: None,
            proof_verified: false,
            registered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_phase_monotonicity() {
        let mut s = session();
        s.advance_phase(SessionPhase::OutputRegistration, 600).unwrap();
        s.advance_phase(SessionPhase::Signing, 120).unwrap();
        assert!(s
            .advance_phase(SessionPhase::Registration, 600)
            .is_err());
        s.advance_phase(SessionPhase::Failed, 0).unwrap();
        // terminal phases accept nothing further
        assert!(s.advance_phase(SessionPhase::Completed, 0).is_err());
        assert!(s.completed_at.is_some());
    }

    #[test]
    fn test_message_covers_inputs_and_outputs() {
        let mut s = session();
        let p = participant(1);
        s.participants.insert(p.id.clone(), p);
        s.final_outputs = vec![TxOutput::new("addr-a".into(), 0.1)];

        let m1 = s.build_message();

        // same state, same digest
        assert_eq!(m1, s.build_message());

        // output mutation changes the digest
        s.final_outputs[0].amount = 0.2;
        assert_ne!(m1, s.build_message());
    }

    #[test]
    fn test_message_stable_across_participant_map_order() {
        let mut a = session();
        let p1 = participant(1);
        let p2 = participant(2);
        let mut b = a.clone();

        a.participants.insert(p1.id.clone(), p1.clone());
        a.participants.insert(p2.id.clone(), p2.clone());
        b.participants.insert(p2.id.clone(), p2);
        b.participants.insert(p1.id.clone(), p1);

        assert_eq!(a.build_message(), b.build_message());
    }

    #[test]
    fn test_failed_participants_leave_the_message() {
        let mut s = session();
        let p1 = participant(1);
        let mut p2 = participant(2);
        s.participants.insert(p1.id.clone(), p1);
        let before = s.build_message();

        p2.status = ParticipantStatus::Failed;
        s.participants.insert(p2.id.clone(), p2);
        assert_eq!(before, s.build_message());
    }

    #[test]
    fn test_crypto_shuffle_preserves_elements() {
        let mut items: Vec<u32> = (0..64).collect();
        crypto_shuffle(&mut items);
        let mut sorted = items.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..64).collect::<Vec<u32>>());
    }

    #[test]
    fn test_crypto_shuffle_permutes() {
        // 64 elements staying fixed across 5 shuffles is ~impossible
        let original: Vec<u32> = (0..64).collect();
        let mut any_moved = false;
        for _ in 0..5 {
            let mut items = original.clone();
            crypto_shuffle(&mut items);
            if items != original {
                any_moved = true;
            }
        }
        assert!(any_moved);
    }

    #[test]
    fn test_deadline() {
        let mut s = session();
        assert!(!s.deadline_passed());
        s.phase_deadline = chrono::Utc::now() - chrono::Duration::seconds(1);
        assert!(s.deadline_passed());
        s.advance_phase(SessionPhase::Failed, 0).unwrap();
        assert!(!s.deadline_passed());
    }
}
