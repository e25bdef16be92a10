// src/engine/mod.rs
pub mod deposit;
mod pipeline;

pub use deposit::DepositAddressGenerator;

use crate::chain::BlockchainClient;
use crate::coinjoin::CoinJoinCoordinator;
use crate::crypto::Keypair;
use crate::error::{MixerError, MixerResult};
use crate::repository::{AuditEntry, AuditLevel, Repository};
use crate::ring::RingMixer;
use crate::security::{SecurityValidator, ValidationInput};
use crate::types::{
    CoinJoinConfig, Currency, EngineConfig, MixEvent, MixOutput, MixRequest, MixStatus,
    OutputTransaction, OutputTxStatus,
};
use crate::wallet::WalletManager;
use secp256k1::SecretKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// API-facing request payload.
#[derive(Debug, Clone)]
pub struct CreateMixRequest {
    pub currency: Currency,
    pub input_amount: f64,
    pub outputs: Vec<MixOutput>,
    pub user_id: Option<String>,
}

/// What the caller gets back: the persisted request plus where to deposit.
#[derive(Debug, Clone)]
pub struct CreatedMix {
    pub request: MixRequest,
    pub deposit_address: String,
    pub expected_amount: f64,
}

/// Transient-retry bookkeeping for one request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AttemptState {
    pub count: u32,
    pub next_at: chrono::DateTime<chrono::Utc>,
}

/// The engine's participation state in a CoinJoin session, one per request.
pub(crate) struct JoinState {
    pub session_id: Uuid,
    pub participant_id: String,
    pub keypair: Keypair,
    pub blinding_factor: SecretKey,
    pub denomination: f64,
}

/// Top-level per-request state machine. Owns the FSM; every transition goes
/// through `transition()` so ordering, persistence, events and audit stay
/// consistent.
#[derive(Clone)]
pub struct MixRequestEngine {
    pub(crate) config: EngineConfig,
    pub(crate) coinjoin_config: CoinJoinConfig,
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) wallets: WalletManager,
    pub(crate) validator: SecurityValidator,
    pub(crate) coinjoin: CoinJoinCoordinator,
    pub(crate) ring: RingMixer,
    pub(crate) chains: HashMap<Currency, Arc<dyn BlockchainClient>>,
    pub(crate) deposits: Arc<DepositAddressGenerator>,
    pub(crate) events: broadcast::Sender<MixEvent>,
    pub(crate) attempts: Arc<RwLock<HashMap<Uuid, AttemptState>>>,
    pub(crate) join_states: Arc<RwLock<HashMap<Uuid, JoinState>>>,
}

impl MixRequestEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        coinjoin_config: CoinJoinConfig,
        repository: Arc<dyn Repository>,
        wallets: WalletManager,
        validator: SecurityValidator,
        coinjoin: CoinJoinCoordinator,
        ring: RingMixer,
        chains: HashMap<Currency, Arc<dyn BlockchainClient>>,
        deposits: Arc<DepositAddressGenerator>,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            coinjoin_config,
            repository,
            wallets,
            validator,
            coinjoin,
            ring,
            chains,
            deposits,
            events,
            attempts: Arc::new(RwLock::new(HashMap::new())),
            join_states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MixEvent> {
        self.events.subscribe()
    }

    /// Flat per-request fee: coordinator plus network share.
    pub(crate) fn total_fee(&self) -> f64 {
        self.coinjoin_config.coordinator_fee + self.coinjoin_config.network_fee
    }

    /// Validates, persists and allocates a deposit address for a new request.
    ///
    /// Policy rejections persist the request as BLOCKED and surface an error;
    /// plain validation failures change no state at all.
    pub async fn create(&self, input: CreateMixRequest) -> MixerResult<CreatedMix> {
        let report = self
            .validator
            .validate(&ValidationInput {
                currency: input.currency,
                amount: input.input_amount,
                outputs: input.outputs.clone(),
                user_id: input.user_id.clone(),
            })
            .await?;

        let now = chrono::Utc::now();
        let mut request = MixRequest {
            id: Uuid::new_v4(),
            currency: input.currency,
            input_amount: input.input_amount,
            outputs: input.outputs,
            status: MixStatus::Pending,
            algorithm: None,
            deposit_txid: None,
            deposit_block_height: None,
            deposit_confirmed_at: None,
            completed_at: None,
            error_message: None,
            user_id: input.user_id,
            pending_review: report.requires_manual_review,
            created_at: now,
            updated_at: now,
        };

        if report.auto_reject {
            request.status = MixStatus::Blocked;
            request.error_message = Some(format!(
                "rejected by policy (score {:.0}): {}",
                report.score,
                report.errors.join("; ")
            ));
            self.repository.insert_request(&request).await?;
            self.audit(
                AuditLevel::Critical,
                "request_blocked",
                format!("score {:.0}, flags {:?}", report.score, report.flags),
                Some(request.id),
            )
            .await;
            return Err(MixerError::PolicyRejection(format!(
                "request {} blocked with risk score {:.0}",
                request.id, report.score
            )));
        }

        if report.has_errors() {
            return Err(MixerError::InputValidation(report.errors.join("; ")));
        }

        self.repository.insert_request(&request).await?;
        let deposit = match self.deposits.allocate(request.id, request.currency).await {
            Ok(d) => d,
            Err(e) => {
                self.repository.delete_request(request.id).await?;
                return Err(e);
            }
        };

        self.audit(
            AuditLevel::Info,
            "request_created",
            format!(
                "{} {} -> {} outputs, score {:.0}{}",
                request.input_amount,
                request.currency,
                request.outputs.len(),
                report.score,
                if request.pending_review {
                    ", pending review"
                } else {
                    ""
                }
            ),
            Some(request.id),
        )
        .await;

        log::info!(
            "created mix request {} ({} {})",
            request.id,
            request.input_amount,
            request.currency
        );
        Ok(CreatedMix {
            deposit_address: deposit.address,
            expected_amount: request.input_amount,
            request,
        })
    }

    pub async fn get(&self, id: Uuid) -> MixerResult<MixRequest> {
        self.repository
            .get_request(id)
            .await?
            .ok_or(MixerError::RequestNotFound(id))
    }

    /// The request's payout legs, ordered by output index.
    pub async fn output_legs(&self, id: Uuid) -> MixerResult<Vec<OutputTransaction>> {
        self.repository.list_output_txs(id).await
    }

    /// Clears the manual-review hold so the scheduler may pick the request
    /// up.
    pub async fn approve_review(&self, id: Uuid) -> MixerResult<()> {
        let mut request = self.get(id).await?;
        if request.pending_review {
            request.pending_review = false;
            request.updated_at = chrono::Utc::now();
            self.repository.update_request(&request).await?;
            self.audit(
                AuditLevel::Info,
                "review_approved",
                "manual review cleared".into(),
                Some(id),
            )
            .await;
        }
        Ok(())
    }

    /// Idempotent on (id, txid): the first call moves the request to
    /// DEPOSITED, repeats are no-ops.
    pub async fn on_deposit_confirmed(
        &self,
        id: Uuid,
        txid: &str,
        block_height: u64,
    ) -> MixerResult<()> {
        let mut request = self.get(id).await?;

        if request.deposit_txid.as_deref() == Some(txid) {
            return Ok(());
        }
        if request.status != MixStatus::Pending {
            log::warn!(
                "deposit {txid} for request {id} in state {}",
                request.status.as_str()
            );
            return Ok(());
        }

        request.deposit_txid = Some(txid.to_string());
        request.deposit_block_height = Some(block_height);
        request.deposit_confirmed_at = Some(chrono::Utc::now());
        self.transition(&mut request, MixStatus::Deposited, None)
            .await?;

        if let Some(mut address) = self.repository.get_deposit_address(id).await? {
            if !address.used {
                address.used = true;
                address.first_used_at = Some(chrono::Utc::now());
                self.repository.update_deposit_address(&address).await?;
            }
        }
        self.audit(
            AuditLevel::Info,
            "deposit_confirmed",
            format!("txid {txid} at height {block_height}"),
            Some(id),
        )
        .await;
        Ok(())
    }

    /// User cancellation. Permitted while the funds are still attributable
    /// (PENDING/DEPOSITED); a no-op on already-terminal requests.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> MixerResult<MixRequest> {
        let mut request = self.get(id).await?;

        if request.status.is_terminal() {
            return Ok(request);
        }

        match request.status {
            MixStatus::Pending => {
                self.transition(&mut request, MixStatus::Cancelled, Some(reason.to_string()))
                    .await?;
            }
            MixStatus::Deposited => {
                // refund the confirmed deposit to the first output leg
                let refund_address = request
                    .outputs
                    .first()
                    .map(|o| o.address.clone())
                    .unwrap_or_default();
                let refund = OutputTransaction {
                    id: Uuid::new_v4(),
                    mix_request_id: request.id,
                    output_index: 0,
                    address: refund_address,
                    amount: request.input_amount - self.coinjoin_config.network_fee,
                    scheduled_at: chrono::Utc::now(),
                    status: OutputTxStatus::Pending,
                    txid: None,
                    attempts: 0,
                };
                self.repository.insert_output_tx(&refund).await?;
                self.transition(&mut request, MixStatus::Cancelled, Some(reason.to_string()))
                    .await?;
            }
            _ => {
                return Err(MixerError::InputValidation(format!(
                    "request {} cannot be cancelled in state {}",
                    id,
                    request.status.as_str()
                )));
            }
        }

        self.audit(
            AuditLevel::Warning,
            "request_cancelled",
            reason.to_string(),
            Some(id),
        )
        .await;
        Ok(request)
    }

    /// The single FSM gate: rejects transitions outside the whitelist,
    /// persists, emits the lifecycle event and writes the audit trail.
    pub(crate) async fn transition(
        &self,
        request: &mut MixRequest,
        to: MixStatus,
        note: Option<String>,
    ) -> MixerResult<()> {
        let from = request.status;
        if !from.can_transition_to(to) {
            return Err(MixerError::InvalidStateTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        request.status = to;
        request.updated_at = chrono::Utc::now();
        if to == MixStatus::Completed {
            request.completed_at = Some(request.updated_at);
        }
        if matches!(to, MixStatus::Failed | MixStatus::Blocked) {
            if let Some(note) = &note {
                request.error_message = Some(note.clone());
            }
        }
        self.repository.update_request(request).await?;

        let _ = self.events.send(MixEvent {
            request_id: request.id,
            from,
            to,
            at: request.updated_at,
        });
        self.audit(
            AuditLevel::Info,
            "state_transition",
            format!("{} -> {}", from.as_str(), to.as_str()),
            Some(request.id),
        )
        .await;
        log::info!(
            "request {}: {} -> {}",
            request.id,
            from.as_str(),
            to.as_str()
        );
        Ok(())
    }

    /// Terminal failure: transition, record the message, raise a critical
    /// audit record.
    pub(crate) async fn fail_request(&self, request: &mut MixRequest, message: &str) {
        if request.status.is_terminal() {
            return;
        }
        if let Err(e) = self
            .transition(request, MixStatus::Failed, Some(message.to_string()))
            .await
        {
            log::error!("failed to fail request {}: {e}", request.id);
            return;
        }
        self.attempts.write().await.remove(&request.id);
        self.join_states.write().await.remove(&request.id);
        self.audit(
            AuditLevel::Critical,
            "request_failed",
            message.to_string(),
            Some(request.id),
        )
        .await;
    }

    /// Registers a transient failure against the request's retry budget.
    /// Returns true while the budget holds; exhaustion fails the request.
    pub(crate) async fn note_transient_failure(
        &self,
        request: &mut MixRequest,
        what: &str,
    ) -> bool {
        let (count, exhausted) = {
            let mut attempts = self.attempts.write().await;
            let state = attempts.entry(request.id).or_insert(AttemptState {
                count: 0,
                next_at: chrono::Utc::now(),
            });
            state.count += 1;
            let backoff_ms =
                self.config.retry_base_delay_ms.saturating_mul(1u64 << state.count.min(16));
            state.next_at =
                chrono::Utc::now() + chrono::Duration::milliseconds(backoff_ms as i64);
            (state.count, state.count >= self.config.max_retries)
        };
        log::warn!(
            "request {}: {what} failed (attempt {count}/{})",
            request.id,
            self.config.max_retries
        );
        if exhausted {
            self.fail_request(request, &format!("{what}: retry budget exhausted"))
                .await;
            false
        } else {
            true
        }
    }

    /// Whether the request's backoff window has elapsed.
    pub(crate) async fn retry_due(&self, id: Uuid) -> bool {
        let attempts = self.attempts.read().await;
        attempts
            .get(&id)
            .map(|s| chrono::Utc::now() >= s.next_at)
            .unwrap_or(true)
    }

    pub(crate) async fn clear_attempts(&self, id: Uuid) {
        self.attempts.write().await.remove(&id);
    }

    /// Fire-and-forget audit append; a failed append never affects control
    /// flow.
    pub(crate) async fn audit(
        &self,
        level: AuditLevel,
        action: &str,
        message: String,
        entity: Option<Uuid>,
    ) {
        let entry = AuditEntry::new(level, action, message, entity);
        if let Err(e) = self.repository.append_audit(entry).await {
            log::error!("audit append failed: {e}");
        }
    }
}
