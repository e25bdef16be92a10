// src/coinjoin/mod.rs
pub mod session;

pub use session::{
    crypto_shuffle, participant_id, CoinJoinSession, Participant, ParticipantInput,
    ParticipantStatus, SessionPhase, TxOutput,
};

use crate::crypto::blinding::unblind_address;
use crate::crypto::{ecdsa_verify, schnorr_verify, BlindedOutput, SchnorrSignature};
use crate::error::{MixerError, MixerResult};
use crate::registry::{BanList, InsertOutcome, KeyImageRegistry};
use crate::types::{CoinJoinConfig, Currency};
use rand::rngs::OsRng;
use rand::RngCore;
use secp256k1::{PublicKey, SecretKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Session lifecycle notifications delivered to subscribers in phase order.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PhaseChanged {
        session_id: Uuid,
        phase: SessionPhase,
    },
    ParticipantBlamed {
        session_id: Uuid,
        participant_id: String,
        reason: String,
    },
    Cancelled {
        session_id: Uuid,
        reason: String,
    },
    Completed {
        session_id: Uuid,
        txid: String,
    },
}

/// A session ready for broadcast: the raw bytes and the payout legs.
#[derive(Debug, Clone)]
pub struct FinalizedSession {
    pub session_id: Uuid,
    pub raw_transaction: Vec<u8>,
    pub outputs: Vec<TxOutput>,
}

/// Multi-party CoinJoin coordinator. Each session's state is mutated only
/// behind the coordinator's lock; cross-task interaction happens through the
/// event channel.
#[derive(Clone)]
pub struct CoinJoinCoordinator {
    coordinator_id: Uuid,
    config: CoinJoinConfig,
    sessions: Arc<RwLock<HashMap<Uuid, CoinJoinSession>>>,
    /// Ids engaged in any live session; one active session per participant.
    engaged: Arc<RwLock<HashSet<String>>>,
    registry: KeyImageRegistry,
    bans: BanList,
    events: broadcast::Sender<SessionEvent>,
}

impl CoinJoinCoordinator {
    pub fn new(config: CoinJoinConfig, registry: KeyImageRegistry, bans: BanList) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            coordinator_id: Uuid::new_v4(),
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            engaged: Arc::new(RwLock::new(HashSet::new())),
            registry,
            bans,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Opens a session on the largest standard denomination that fits under
    /// `amount`.
    pub async fn create_session(&self, currency: Currency, amount: f64) -> MixerResult<Uuid> {
        let denomination = currency.best_denomination(amount).ok_or_else(|| {
            MixerError::NoMatchingDenomination {
                currency: currency.code().to_string(),
                amount,
            }
        })?;
        let session = CoinJoinSession::new(
            self.coordinator_id,
            currency,
            denomination,
            self.config.registration_timeout_secs,
        );
        let id = session.id;
        self.sessions.write().await.insert(id, session);
        log::info!("opened coinjoin session {id} ({currency}, denomination {denomination})");
        Ok(id)
    }

    pub async fn get_session(&self, session_id: Uuid) -> Option<CoinJoinSession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Registers a participant's inputs. Returns the participant id and, when
    /// proof-of-funds is enabled, the challenge to sign.
    pub async fn register(
        &self,
        session_id: Uuid,
        inputs: Vec<ParticipantInput>,
        public_key: PublicKey,
    ) -> MixerResult<(String, Option<[u8; 32]>)> {
        let id = participant_id(&public_key);

        if self.bans.is_banned(&id).await {
            return Err(MixerError::Banned(id));
        }
        if self.engaged.read().await.contains(&id) {
            return Err(MixerError::ProtocolViolation {
                participant: id,
                reason: "already engaged in an active session".into(),
            });
        }

        // pre-check images before touching session state
        for input in &inputs {
            if self.registry.contains(&input.key_image).await {
                return Err(MixerError::DoubleSpend(input.key_image.to_hex()));
            }
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or(MixerError::SessionNotFound(session_id))?;

        if session.phase != SessionPhase::Registration {
            return Err(MixerError::WrongPhase(session.phase.as_str().to_string()));
        }
        if session.participants.len() >= self.config.max_participants {
            return Err(MixerError::SessionFull);
        }

        let required =
            session.denomination + self.config.coordinator_fee + self.config.network_fee;
        let total: f64 = inputs.iter().map(|i| i.amount).sum();
        if total + 1e-9 < required {
            return Err(MixerError::InsufficientFunds {
                required,
                available: total,
            });
        }

        let challenge = if self.config.require_proof_of_funds {
            let mut c = [0u8; 32];
            OsRng.fill_bytes(&mut c);
            Some(c)
        } else {
            None
        };

        session.participants.insert(
            id.clone(),
            Participant {
                id: id.clone(),
                public_key,
                inputs,
                blinded_outputs: Vec::new(),
                blinding_factor: None,
                status: ParticipantStatus::Registered,
                proof_challenge: challenge,
                proof_verified: !self.config.require_proof_of_funds,
                registered_at: chrono::Utc::now(),
            },
        );
        self.engaged.write().await.insert(id.clone());
        log::info!(
            "session {session_id}: participant {} registered ({}/{})",
            &id[..8],
            session.participants.len(),
            self.config.max_participants
        );
        Ok((id, challenge))
    }

    /// Proof-of-funds response: an ECDSA signature over the issued challenge
    /// with the registration key.
    pub async fn prove_funds(
        &self,
        session_id: Uuid,
        participant: &str,
        signature: &[u8],
    ) -> MixerResult<()> {
        let verified = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            let p = session
                .participants
                .get(participant)
                .ok_or_else(|| MixerError::NotFound(format!("participant {participant}")))?;
            match p.proof_challenge {
                Some(challenge) => ecdsa_verify(&challenge, signature, &p.public_key),
                None => true,
            }
        };
        if verified {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(&session_id) {
                if let Some(p) = session.participants.get_mut(participant) {
                    p.proof_verified = true;
                }
            }
            Ok(())
        } else {
            self.blame(session_id, participant, "invalid proof of funds")
                .await?;
            Err(MixerError::ProtocolViolation {
                participant: participant.to_string(),
                reason: "invalid proof of funds".into(),
            })
        }
    }

    /// Blinded output registration. Every output must carry a commitment and
    /// a range proof; a proof that fails verification blames the sender.
    pub async fn register_outputs(
        &self,
        session_id: Uuid,
        participant: &str,
        blinded_outputs: Vec<BlindedOutput>,
        blinding_factor: SecretKey,
    ) -> MixerResult<()> {
        {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if session.phase != SessionPhase::OutputRegistration {
                return Err(MixerError::WrongPhase(session.phase.as_str().to_string()));
            }
            if !session.participants.contains_key(participant) {
                return Err(MixerError::NotFound(format!("participant {participant}")));
            }
            if blinded_outputs.len() != 1 {
                return Err(MixerError::ProtocolViolation {
                    participant: participant.to_string(),
                    reason: format!(
                        "expected exactly one output, got {}",
                        blinded_outputs.len()
                    ),
                });
            }
        }

        for output in &blinded_outputs {
            if output.commitment != output.range_proof.commitment
                || !output.range_proof.verify()
            {
                self.blame(session_id, participant, "invalid range proof")
                    .await?;
                return Err(MixerError::ProtocolViolation {
                    participant: participant.to_string(),
                    reason: "invalid range proof".into(),
                });
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            if let Some(p) = session.participants.get_mut(participant) {
                p.blinded_outputs = blinded_outputs;
                p.blinding_factor = Some(blinding_factor);
                p.status = ParticipantStatus::Committed;
            }
        }
        Ok(())
    }

    /// The digest to sign, available once the session reached SIGNING.
    pub async fn signing_message(&self, session_id: Uuid) -> MixerResult<[u8; 32]> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(&session_id)
            .ok_or(MixerError::SessionNotFound(session_id))?;
        session
            .unsigned_message
            .ok_or_else(|| MixerError::WrongPhase(session.phase.as_str().to_string()))
    }

    /// Per-input signatures over the session message. Schnorr or ECDSA per
    /// config; any invalid signature blames and bans the sender.
    pub async fn sign(
        &self,
        session_id: Uuid,
        participant: &str,
        signatures: Vec<Vec<u8>>,
    ) -> MixerResult<()> {
        let (message, input_keys) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if session.phase != SessionPhase::Signing {
                return Err(MixerError::WrongPhase(session.phase.as_str().to_string()));
            }
            let p = session
                .participants
                .get(participant)
                .ok_or_else(|| MixerError::NotFound(format!("participant {participant}")))?;
            let message = session
                .unsigned_message
                .ok_or_else(|| MixerError::Fatal("signing phase without a message".into()))?;
            let keys: Vec<PublicKey> = p.inputs.iter().map(|i| i.public_key).collect();
            (message, keys)
        };

        if signatures.len() != input_keys.len() {
            self.blame(session_id, participant, "signature count mismatch")
                .await?;
            return Err(MixerError::ProtocolViolation {
                participant: participant.to_string(),
                reason: "signature count mismatch".into(),
            });
        }

        for (sig, key) in signatures.iter().zip(input_keys.iter()) {
            let valid = if self.config.use_schnorr {
                SchnorrSignature::from_bytes(sig)
                    .map(|s| schnorr_verify(&message, &s, key))
                    .unwrap_or(false)
            } else {
                ecdsa_verify(&message, sig, key)
            };
            if !valid {
                self.blame(session_id, participant, "invalid signature").await?;
                return Err(MixerError::ProtocolViolation {
                    participant: participant.to_string(),
                    reason: "invalid signature".into(),
                });
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&session_id) {
            if let Some(p) = session.participants.get_mut(participant) {
                p.status = ParticipantStatus::Signed;
            }
        }
        Ok(())
    }

    /// Drives phase advancement: moves forward when every active participant
    /// reached the target state, or handles an elapsed deadline by blaming
    /// laggards and either continuing with the quorum or failing the session.
    pub async fn poll(&self, session_id: Uuid) -> MixerResult<SessionPhase> {
        enum Action {
            None,
            Advance(SessionPhase),
            BlameLaggards(Vec<String>, SessionPhase),
        }

        let action = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if session.phase.is_terminal() {
                return Ok(session.phase);
            }

            let target_reached = |p: &Participant| match session.phase {
                SessionPhase::Registration => p.proof_verified,
                SessionPhase::OutputRegistration => p.status >= ParticipantStatus::Committed,
                SessionPhase::Signing => p.status >= ParticipantStatus::Signed,
                _ => true,
            };

            let enough = session.active_count() >= self.config.min_participants;
            let all_ready = enough && session.active_participants().all(|p| target_reached(p));

            if all_ready {
                Action::Advance(match session.phase {
                    SessionPhase::Registration => SessionPhase::OutputRegistration,
                    SessionPhase::OutputRegistration => SessionPhase::Signing,
                    SessionPhase::Signing => SessionPhase::Broadcasting,
                    other => other,
                })
            } else if session.deadline_passed() {
                let laggards: Vec<String> = session
                    .active_participants()
                    .filter(|p| !target_reached(p))
                    .map(|p| p.id.clone())
                    .collect();
                Action::BlameLaggards(laggards, session.phase)
            } else {
                Action::None
            }
        };

        match action {
            Action::None => {}
            Action::Advance(next) => {
                self.advance(session_id, next).await?;
            }
            Action::BlameLaggards(laggards, phase) => {
                for id in &laggards {
                    self.blame(session_id, id, "phase timeout").await?;
                }
                let still_quorate = {
                    let sessions = self.sessions.read().await;
                    sessions
                        .get(&session_id)
                        .map(|s| {
                            !s.phase.is_terminal()
                                && s.active_count() >= self.config.min_participants
                        })
                        .unwrap_or(false)
                };
                if still_quorate {
                    let next = match phase {
                        SessionPhase::Registration => SessionPhase::OutputRegistration,
                        SessionPhase::OutputRegistration => SessionPhase::Signing,
                        SessionPhase::Signing => SessionPhase::Broadcasting,
                        other => other,
                    };
                    self.advance(session_id, next).await?;
                } else {
                    // blame() fails the session when the quorum collapses; a
                    // timeout with no quorum and nobody left to blame still
                    // has to terminate
                    self.fail_session(session_id, "phase timeout without quorum")
                        .await?;
                }
            }
        }

        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(&session_id)
            .map(|s| s.phase)
            .unwrap_or(SessionPhase::Failed))
    }

    /// Scans every live session for elapsed deadlines. Called from the
    /// timeout watcher loop.
    pub async fn poll_all(&self) -> MixerResult<()> {
        let ids: Vec<Uuid> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| !s.phase.is_terminal())
                .map(|s| s.id)
                .collect()
        };
        for id in ids {
            if let Err(e) = self.poll(id).await {
                log::error!("session {id} poll failed: {e}");
            }
        }
        Ok(())
    }

    async fn advance(&self, session_id: Uuid, next: SessionPhase) -> MixerResult<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            let timeout = match next {
                SessionPhase::OutputRegistration => self.config.output_registration_timeout_secs,
                SessionPhase::Signing => self.config.signing_timeout_secs,
                SessionPhase::Broadcasting => self.config.broadcast_timeout_secs,
                _ => 0,
            };
            session.advance_phase(next, timeout)?;

            if next == SessionPhase::Signing {
                self.prepare_signing(session)?;
            }
        }
        let _ = self.events.send(SessionEvent::PhaseChanged {
            session_id,
            phase: next,
        });
        Ok(())
    }

    /// Entering SIGNING: unblind every committed output, shuffle the legs,
    /// freeze the message every participant will sign.
    fn prepare_signing(&self, session: &mut CoinJoinSession) -> MixerResult<()> {
        let mut outputs = Vec::new();
        for p in session.participants.values() {
            if p.status == ParticipantStatus::Failed {
                continue;
            }
            let factor = p.blinding_factor.as_ref().ok_or_else(|| {
                MixerError::Fatal(format!("participant {} committed without a factor", p.id))
            })?;
            for blinded in &p.blinded_outputs {
                let address = unblind_address(&blinded.blinded_address, factor)?;
                outputs.push(TxOutput::new(address, session.denomination));
            }
        }
        crypto_shuffle(&mut outputs);
        session.final_outputs = outputs;
        session.unsigned_message = Some(session.build_message());
        Ok(())
    }

    /// Assembles the raw transaction once everyone signed. Registers every
    /// key image first; a duplicate image fails the whole session because the
    /// transaction can never be valid on chain.
    pub async fn finalize(&self, session_id: Uuid) -> MixerResult<FinalizedSession> {
        let (raw, outputs, images) = {
            let sessions = self.sessions.read().await;
            let session = sessions
                .get(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if session.phase != SessionPhase::Broadcasting {
                return Err(MixerError::WrongPhase(session.phase.as_str().to_string()));
            }
            let images: Vec<_> = session
                .ordered_inputs()
                .iter()
                .map(|i| i.key_image)
                .collect();
            // the raw form carries the digest; signatures were verified at
            // submission time
            let raw = session.raw_transaction(&[]);
            (raw, session.final_outputs.clone(), images)
        };

        for image in &images {
            if self.registry.try_insert(image).await? == InsertOutcome::Duplicate {
                self.fail_session(session_id, "double spend at finalization")
                    .await?;
                return Err(MixerError::DoubleSpend(image.to_hex()));
            }
        }

        Ok(FinalizedSession {
            session_id,
            raw_transaction: raw,
            outputs,
        })
    }

    /// Marks the broadcast done and completes the session.
    pub async fn mark_broadcast(&self, session_id: Uuid, txid: &str) -> MixerResult<()> {
        let participant_ids: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            session.txid = Some(txid.to_string());
            session.advance_phase(SessionPhase::Completed, 0)?;
            for p in session.participants.values_mut() {
                if p.status != ParticipantStatus::Failed {
                    p.status = ParticipantStatus::Confirmed;
                }
            }
            session.participants.keys().cloned().collect()
        };
        self.release(&participant_ids).await;
        let _ = self.events.send(SessionEvent::Completed {
            session_id,
            txid: txid.to_string(),
        });
        Ok(())
    }

    /// Blames a participant: blame list, ban with TTL, participant marked
    /// failed. Fails the whole session when the quorum is lost.
    pub async fn blame(
        &self,
        session_id: Uuid,
        participant: &str,
        reason: &str,
    ) -> MixerResult<()> {
        let below_quorum = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if !session.blame_list.contains(&participant.to_string()) {
                session.blame_list.push(participant.to_string());
            }
            if let Some(p) = session.participants.get_mut(participant) {
                p.status = ParticipantStatus::Failed;
            }
            session.active_count() < self.config.min_participants
        };

        log::warn!("session {session_id}: blaming {participant}: {reason}");
        self.bans.ban(participant, self.config.ban_duration).await?;
        self.engaged.write().await.remove(participant);
        let _ = self.events.send(SessionEvent::ParticipantBlamed {
            session_id,
            participant_id: participant.to_string(),
            reason: reason.to_string(),
        });

        if below_quorum {
            self.fail_session(session_id, "quorum lost").await?;
        }
        Ok(())
    }

    async fn fail_session(&self, session_id: Uuid, reason: &str) -> MixerResult<()> {
        let participant_ids: Vec<String> = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(&session_id)
                .ok_or(MixerError::SessionNotFound(session_id))?;
            if session.phase.is_terminal() {
                return Ok(());
            }
            session.advance_phase(SessionPhase::Failed, 0)?;
            session.participants.keys().cloned().collect()
        };
        self.release(&participant_ids).await;
        log::warn!("session {session_id} failed: {reason}");
        let _ = self.events.send(SessionEvent::Cancelled {
            session_id,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn release(&self, participant_ids: &[String]) {
        let mut engaged = self.engaged.write().await;
        for id in participant_ids {
            engaged.remove(id);
        }
    }

    /// Drops terminal sessions older than the retention window. Called by the
    /// janitor; returns how many were removed.
    pub async fn sweep_expired(&self, retention: chrono::Duration) -> usize {
        let cutoff = chrono::Utc::now() - retention;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| {
            !(s.phase.is_terminal() && s.completed_at.map(|t| t < cutoff).unwrap_or(false))
        });
        before - sessions.len()
    }

    pub async fn active_session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| !s.phase.is_terminal())
            .count()
    }

    /// An open registration-phase session for this currency/denomination, if
    /// one exists; the engine batches compatible requests into it.
    pub async fn find_open_session(&self, currency: Currency, denomination: f64) -> Option<Uuid> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| {
                s.phase == SessionPhase::Registration
                    && s.currency == currency
                    && (s.denomination - denomination).abs() < 1e-12
                    && s.participants.len() < self.config.max_participants
            })
            .map(|s| s.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{
        ecdsa_sign, generate_keypair, key_image, schnorr_sign, BlindedOutput, Keypair,
    };
    use crate::repository::InMemoryRepository;

    struct TestParticipant {
        keypair: Keypair,
        id: String,
        factor: SecretKey,
    }

    fn test_config() -> CoinJoinConfig {
        CoinJoinConfig {
            min_participants: 2,
            ..CoinJoinConfig::default()
        }
    }

    fn coordinator_with(config: CoinJoinConfig) -> CoinJoinCoordinator {
        let repo = Arc::new(InMemoryRepository::new());
        CoinJoinCoordinator::new(
            config,
            KeyImageRegistry::new(repo.clone()),
            BanList::new(repo),
        )
    }

    fn coordinator() -> CoinJoinCoordinator {
        coordinator_with(test_config())
    }

    fn make_input(keypair: &Keypair, amount: f64) -> ParticipantInput {
        ParticipantInput {
            txid: hex::encode(rand::random::<[u8; 8]>()),
            output_index: 0,
            amount,
            public_key: keypair.public,
            key_image: key_image(&keypair.secret, &keypair.public).unwrap(),
        }
    }

    async fn register_one(coordinator: &CoinJoinCoordinator, session: Uuid) -> TestParticipant {
        let keypair = generate_keypair().unwrap();
        let input = make_input(&keypair, 0.1001);
        let (id, _) = coordinator
            .register(session, vec![input], keypair.public)
            .await
            .unwrap();
        TestParticipant {
            keypair,
            id,
            factor: generate_keypair().unwrap().secret,
        }
    }

    fn btc_address(n: u8) -> String {
        // distinct, regex-valid P2PKH-looking strings
        format!("1A1zP1eP5QGefi2DMPTfTL5SLmv7Divf{}", (b'A' + n) as char)
    }

    async fn drive_to_signing(
        coordinator: &CoinJoinCoordinator,
        session: Uuid,
        participants: &[TestParticipant],
    ) {
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::OutputRegistration
        );
        for (n, p) in participants.iter().enumerate() {
            let blinded =
                BlindedOutput::create(&btc_address(n as u8), 0.1, &p.factor).unwrap();
            coordinator
                .register_outputs(session, &p.id, vec![blinded], p.factor.clone())
                .await
                .unwrap();
        }
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::Signing
        );
    }

    #[tokio::test]
    async fn test_denomination_selection_on_create() {
        let coordinator = coordinator();
        let id = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let session = coordinator.get_session(id).await.unwrap();
        assert!((session.denomination - 0.1).abs() < 1e-12);

        let err = coordinator.create_session(Currency::Btc, 0.0001).await;
        assert!(matches!(
            err,
            Err(MixerError::NoMatchingDenomination { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_insufficient_funds() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let keypair = generate_keypair().unwrap();
        // covers the denomination but not the fees
        let input = make_input(&keypair, 0.1);
        let err = coordinator
            .register(session, vec![input], keypair.public)
            .await;
        assert!(matches!(err, Err(MixerError::InsufficientFunds { .. })));
    }

    #[tokio::test]
    async fn test_no_participant_in_two_active_sessions() {
        let coordinator = coordinator();
        let s1 = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let s2 = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let keypair = generate_keypair().unwrap();
        coordinator
            .register(s1, vec![make_input(&keypair, 0.2)], keypair.public)
            .await
            .unwrap();
        let err = coordinator
            .register(s2, vec![make_input(&keypair, 0.2)], keypair.public)
            .await;
        assert!(matches!(err, Err(MixerError::ProtocolViolation { .. })));
    }

    #[tokio::test]
    async fn test_happy_path_three_participants() {
        let coordinator = coordinator_with(CoinJoinConfig {
            min_participants: 3,
            ..CoinJoinConfig::default()
        });
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();

        let participants = vec![
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
        ];
        drive_to_signing(&coordinator, session, &participants).await;

        let message = coordinator.signing_message(session).await.unwrap();
        for p in &participants {
            let sig = schnorr_sign(&message, &p.keypair.secret).unwrap();
            coordinator
                .sign(session, &p.id, vec![sig.to_bytes().to_vec()])
                .await
                .unwrap();
        }
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::Broadcasting
        );

        let finalized = coordinator.finalize(session).await.unwrap();
        // 3-in / 3-out, every output exactly the denomination
        assert_eq!(finalized.outputs.len(), 3);
        for output in &finalized.outputs {
            assert!((output.amount - 0.1).abs() < 1e-12);
        }

        coordinator.mark_broadcast(session, "txid-abc").await.unwrap();
        let done = coordinator.get_session(session).await.unwrap();
        assert_eq!(done.phase, SessionPhase::Completed);
        assert_eq!(done.txid.as_deref(), Some("txid-abc"));

        // signed digest matches the session's input+output blob
        assert_eq!(done.unsigned_message.unwrap(), done.build_message());
    }

    #[tokio::test]
    async fn test_invalid_signature_blames_and_continues_with_quorum() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();

        let participants = vec![
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
        ];
        drive_to_signing(&coordinator, session, &participants).await;
        let message = coordinator.signing_message(session).await.unwrap();

        // B submits 64 random bytes in place of a signature
        let bad = &participants[1];
        let err = coordinator
            .sign(session, &bad.id, vec![vec![0u8; 64]])
            .await;
        assert!(matches!(err, Err(MixerError::ProtocolViolation { .. })));
        assert!(coordinator.bans.is_banned(&bad.id).await);

        let state = coordinator.get_session(session).await.unwrap();
        assert!(state.blame_list.contains(&bad.id));
        // two remain, min_participants = 2: session continues
        assert_eq!(state.phase, SessionPhase::Signing);

        for p in [&participants[0], &participants[2]] {
            let sig = schnorr_sign(&message, &p.keypair.secret).unwrap();
            coordinator
                .sign(session, &p.id, vec![sig.to_bytes().to_vec()])
                .await
                .unwrap();
        }
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::Broadcasting
        );
    }

    #[tokio::test]
    async fn test_quorum_loss_cancels_session() {
        let coordinator = coordinator_with(CoinJoinConfig {
            min_participants: 3,
            ..CoinJoinConfig::default()
        });
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let participants = vec![
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
        ];
        let mut events = coordinator.subscribe();
        drive_to_signing(&coordinator, session, &participants).await;

        let err = coordinator
            .sign(session, &participants[0].id, vec![vec![0u8; 64]])
            .await;
        assert!(err.is_err());

        let state = coordinator.get_session(session).await.unwrap();
        assert_eq!(state.phase, SessionPhase::Failed);

        // remaining participants observe the cancellation
        let mut saw_cancelled = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SessionEvent::Cancelled { .. }) {
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn test_banned_participant_rejected() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let keypair = generate_keypair().unwrap();
        let id = participant_id(&keypair.public);
        coordinator
            .bans
            .ban(&id, chrono::Duration::hours(24))
            .await
            .unwrap();

        let err = coordinator
            .register(session, vec![make_input(&keypair, 0.2)], keypair.public)
            .await;
        assert!(matches!(err, Err(MixerError::Banned(_))));
    }

    #[tokio::test]
    async fn test_registered_key_image_rejected_at_register() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let keypair = generate_keypair().unwrap();
        let input = make_input(&keypair, 0.2);
        coordinator.registry.try_insert(&input.key_image).await.unwrap();

        let err = coordinator
            .register(session, vec![input], keypair.public)
            .await;
        assert!(matches!(err, Err(MixerError::DoubleSpend(_))));
    }

    #[tokio::test]
    async fn test_invalid_range_proof_blames() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let participants = vec![
            register_one(&coordinator, session).await,
            register_one(&coordinator, session).await,
        ];
        coordinator.poll(session).await.unwrap();

        let p = &participants[0];
        let mut blinded = BlindedOutput::create(&btc_address(0), 0.1, &p.factor).unwrap();
        blinded.range_proof.proof[0] ^= 0xff;
        let err = coordinator
            .register_outputs(session, &p.id, vec![blinded], p.factor.clone())
            .await;
        assert!(matches!(err, Err(MixerError::ProtocolViolation { .. })));
        assert!(coordinator.bans.is_banned(&p.id).await);
    }

    #[tokio::test]
    async fn test_wrong_phase_rejections() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        let p = register_one(&coordinator, session).await;

        // outputs before OUTPUT_REGISTRATION
        let blinded = BlindedOutput::create(&btc_address(0), 0.1, &p.factor).unwrap();
        let err = coordinator
            .register_outputs(session, &p.id, vec![blinded], p.factor.clone())
            .await;
        assert!(matches!(err, Err(MixerError::WrongPhase(_))));

        // signing before SIGNING
        let err = coordinator.sign(session, &p.id, vec![vec![0u8; 65]]).await;
        assert!(matches!(err, Err(MixerError::WrongPhase(_))));
    }

    #[tokio::test]
    async fn test_registration_timeout_without_quorum_fails() {
        let coordinator = coordinator_with(CoinJoinConfig {
            min_participants: 2,
            registration_timeout_secs: 0,
            ..CoinJoinConfig::default()
        });
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        register_one(&coordinator, session).await;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::Failed
        );
    }

    #[tokio::test]
    async fn test_ecdsa_mode_signing() {
        let coordinator = coordinator_with(CoinJoinConfig {
            min_participants: 2,
            use_schnorr: false,
            ..CoinJoinConfig::default()
        });
        let session = coordinator
            .create_session(Currency::Eth, 1.5)
            .await
            .unwrap();
        let keypair_a = generate_keypair().unwrap();
        let keypair_b = generate_keypair().unwrap();
        let (id_a, _) = coordinator
            .register(session, vec![make_input(&keypair_a, 1.2)], keypair_a.public)
            .await
            .unwrap();
        let (id_b, _) = coordinator
            .register(session, vec![make_input(&keypair_b, 1.2)], keypair_b.public)
            .await
            .unwrap();
        coordinator.poll(session).await.unwrap();

        let fa = generate_keypair().unwrap().secret;
        let fb = generate_keypair().unwrap().secret;
        let out_a = BlindedOutput::create(
            "0x742d35Cc6634C0532925a3b8d4C9db4CA4b4c73f",
            1.0,
            &fa,
        )
        .unwrap();
        let out_b = BlindedOutput::create(
            "0x8ba1f109551bD432803012645Ac136ddd64DBa72",
            1.0,
            &fb,
        )
        .unwrap();
        coordinator
            .register_outputs(session, &id_a, vec![out_a], fa)
            .await
            .unwrap();
        coordinator
            .register_outputs(session, &id_b, vec![out_b], fb)
            .await
            .unwrap();
        coordinator.poll(session).await.unwrap();

        let message = coordinator.signing_message(session).await.unwrap();
        let sig_a = ecdsa_sign(&message, &keypair_a.secret).unwrap();
        let sig_b = ecdsa_sign(&message, &keypair_b.secret).unwrap();
        coordinator
            .sign(session, &id_a, vec![sig_a.to_vec()])
            .await
            .unwrap();
        coordinator
            .sign(session, &id_b, vec![sig_b.to_vec()])
            .await
            .unwrap();
        assert_eq!(
            coordinator.poll(session).await.unwrap(),
            SessionPhase::Broadcasting
        );
    }

    #[tokio::test]
    async fn test_proof_of_funds_flow() {
        let coordinator = coordinator_with(CoinJoinConfig {
            min_participants: 2,
            require_proof_of_funds: true,
            ..CoinJoinConfig::default()
        });
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();

        // three registrants so one blame keeps the quorum alive
        let mut ids = Vec::new();
        let mut keys = Vec::new();
        let mut challenges = Vec::new();
        for _ in 0..3 {
            let keypair = generate_keypair().unwrap();
            let (id, challenge) = coordinator
                .register(session, vec![make_input(&keypair, 0.2)], keypair.public)
                .await
                .unwrap();
            ids.push(id);
            challenges.push(challenge.expect("challenge issued"));
            keys.push(keypair);
        }

        // wrong key fails and bans, session survives on the quorum
        let wrong = generate_keypair().unwrap();
        let bad_sig = ecdsa_sign(&challenges[0], &wrong.secret).unwrap();
        assert!(coordinator
            .prove_funds(session, &ids[0], &bad_sig)
            .await
            .is_err());
        assert!(coordinator.bans.is_banned(&ids[0]).await);
        let state = coordinator.get_session(session).await.unwrap();
        assert_eq!(state.phase, SessionPhase::Registration);

        // honest participants prove correctly
        for i in [1, 2] {
            let sig = ecdsa_sign(&challenges[i], &keys[i].secret).unwrap();
            coordinator.prove_funds(session, &ids[i], &sig).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_sweep_expired_sessions() {
        let coordinator = coordinator();
        let session = coordinator
            .create_session(Currency::Btc, 0.15)
            .await
            .unwrap();
        coordinator
            .fail_session(session, "test teardown")
            .await
            .unwrap();

        // still inside the retention window
        assert_eq!(coordinator.sweep_expired(chrono::Duration::hours(24)).await, 0);
        // zero retention drops it
        assert_eq!(coordinator.sweep_expired(chrono::Duration::zero()).await, 1);
        assert!(coordinator.get_session(session).await.is_none());
    }
}
