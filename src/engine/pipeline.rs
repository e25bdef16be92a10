// src/engine/pipeline.rs
use crate::coinjoin::{ParticipantInput, ParticipantStatus, SessionPhase};
use crate::crypto::hash::key_image;
use crate::crypto::{ecdsa_sign, generate_keypair, schnorr_sign, BlindedOutput};
use crate::engine::{JoinState, MixRequestEngine};
use crate::error::{MixerError, MixerResult};
use crate::ring::SpendableInput;
use crate::types::{
    MixAlgorithm, MixRequest, MixStatus, OutputTransaction, OutputTxStatus,
};
use crate::wallet::SubtractOutcome;
use std::sync::Arc;
use uuid::Uuid;

impl MixRequestEngine {
    /// One scheduler pass: expiry, promotion, pooling, mixing, confirmation.
    /// Invoked periodically by the engine loop; every stage is safe to rerun.
    pub async fn tick(&self) -> MixerResult<()> {
        self.expire_pending().await?;
        self.promote_deposited().await?;
        self.process_pooling().await?;
        self.drive_mixing().await?;
        self.confirm_outputs().await?;
        Ok(())
    }

    /// PENDING requests whose deposit window lapsed fail with a terminal
    /// message; the deposit address record is retained unused.
    async fn expire_pending(&self) -> MixerResult<()> {
        let cutoff = chrono::Utc::now() - self.config.deposit_timeout;
        for mut request in self
            .repository
            .list_requests_by_status(MixStatus::Pending)
            .await?
        {
            if request.created_at < cutoff {
                self.fail_request(&mut request, "deposit timeout").await;
            }
        }
        Ok(())
    }

    /// DEPOSITED -> POOLING, oldest confirmations first, bounded by the
    /// concurrency budget. Requests held for manual review stay put.
    async fn promote_deposited(&self) -> MixerResult<()> {
        let in_flight = self.in_flight_count().await?;
        if in_flight >= self.config.max_concurrent_mixes {
            return Ok(());
        }
        let capacity = self.config.max_concurrent_mixes - in_flight;

        let mut deposited = self
            .repository
            .list_requests_by_status(MixStatus::Deposited)
            .await?;
        deposited.retain(|r| !r.pending_review);
        deposited.sort_by_key(|r| r.deposit_confirmed_at);

        for mut request in deposited.into_iter().take(capacity) {
            self.transition(&mut request, MixStatus::Pooling, None)
                .await?;
        }
        Ok(())
    }

    async fn in_flight_count(&self) -> MixerResult<usize> {
        let mut count = 0;
        for status in [MixStatus::Pooling, MixStatus::Mixing, MixStatus::Completing] {
            count += self.repository.list_requests_by_status(status).await?.len();
        }
        Ok(count)
    }

    /// POOLING: pick the algorithm and hand the request to its coordinator.
    async fn process_pooling(&self) -> MixerResult<()> {
        let pooling = self
            .repository
            .list_requests_by_status(MixStatus::Pooling)
            .await?;
        let denoms = pooling_denoms(&pooling, self.total_fee());

        for mut request in pooling {
            if !self.retry_due(request.id).await {
                continue;
            }
            let algorithm = self.choose_algorithm(&request, &denoms).await;
            let result = match algorithm {
                MixAlgorithm::CoinJoin => match self.enter_coinjoin(&mut request).await {
                    Err(e) if !(e.is_pool_shortage() || e.is_retryable()) => {
                        // a full or rejecting session is not fatal; the ring
                        // path can always take the request
                        log::warn!(
                            "request {}: coinjoin entry failed ({e}), using ring",
                            request.id
                        );
                        self.reserve_ring_liquidity(&mut request).await
                    }
                    other => other,
                },
                _ => self.reserve_ring_liquidity(&mut request).await,
            };
            match result {
                Ok(()) => {
                    self.clear_attempts(request.id).await;
                }
                Err(e) if e.is_pool_shortage() || e.is_retryable() => {
                    self.note_transient_failure(&mut request, "pool selection")
                        .await;
                }
                Err(e) => {
                    self.fail_request(&mut request, &format!("pooling failed: {e}"))
                        .await;
                }
            }
        }
        Ok(())
    }

    /// COINJOIN when the denomination matches a standard entry and enough
    /// compatible requests are pending; RING otherwise.
    async fn choose_algorithm(
        &self,
        request: &MixRequest,
        pool_denoms: &[(Uuid, Option<f64>)],
    ) -> MixAlgorithm {
        if request.outputs.len() != 1 {
            return MixAlgorithm::Ring;
        }
        let denom = match request
            .currency
            .best_denomination(request.input_amount - self.total_fee())
        {
            Some(d) => d,
            None => return MixAlgorithm::Ring,
        };
        let compatible = pool_denoms
            .iter()
            .filter(|(id, d)| *id != request.id && *d == Some(denom))
            .count();
        if compatible >= self.coinjoin_config.min_participants - 1 {
            MixAlgorithm::CoinJoin
        } else {
            MixAlgorithm::Ring
        }
    }

    /// Joins (or opens) a session and registers the request's deposit as the
    /// participant input.
    async fn enter_coinjoin(&self, request: &mut MixRequest) -> MixerResult<()> {
        let denom = request
            .currency
            .best_denomination(request.input_amount - self.total_fee())
            .ok_or(MixerError::NoMatchingDenomination {
                currency: request.currency.code().to_string(),
                amount: request.input_amount,
            })?;

        let session_id = match self
            .coinjoin
            .find_open_session(request.currency, denom)
            .await
        {
            Some(id) => id,
            None => {
                self.coinjoin
                    .create_session(request.currency, request.input_amount - self.total_fee())
                    .await?
            }
        };

        let keypair = generate_keypair()?;
        let deposit_txid = request
            .deposit_txid
            .clone()
            .ok_or_else(|| MixerError::Fatal("pooling request without deposit".into()))?;
        let input = ParticipantInput {
            txid: deposit_txid,
            output_index: 0,
            amount: request.input_amount,
            public_key: keypair.public,
            key_image: key_image(&keypair.secret, &keypair.public)?,
        };
        let (participant_id, challenge) = self
            .coinjoin
            .register(session_id, vec![input], keypair.public)
            .await?;
        if let Some(challenge) = challenge {
            let proof = ecdsa_sign(&challenge, &keypair.secret)?;
            self.coinjoin
                .prove_funds(session_id, &participant_id, &proof)
                .await?;
        }

        self.join_states.write().await.insert(
            request.id,
            JoinState {
                session_id,
                participant_id,
                keypair,
                blinding_factor: generate_keypair()?.secret,
                denomination: denom,
            },
        );
        request.algorithm = Some(MixAlgorithm::CoinJoin);
        self.transition(request, MixStatus::Mixing, None).await
    }

    /// Confirms the pool can cover the payout before committing to RING.
    async fn reserve_ring_liquidity(&self, request: &mut MixRequest) -> MixerResult<()> {
        let payout = request.input_amount - self.total_fee();
        let wallet = self
            .wallets
            .find_optimal_for_withdrawal(request.currency, payout)
            .await?
            .ok_or(MixerError::PoolShortage {
                currency: request.currency.code().to_string(),
                requested: payout,
            })?;
        log::debug!(
            "request {}: pool wallet {} selected for {payout}",
            request.id,
            wallet.id
        );
        request.algorithm = Some(MixAlgorithm::Ring);
        self.transition(request, MixStatus::Mixing, None).await
    }

    /// MIXING: drive each request's coordinator until signed outputs exist.
    async fn drive_mixing(&self) -> MixerResult<()> {
        for mut request in self
            .repository
            .list_requests_by_status(MixStatus::Mixing)
            .await?
        {
            if !self.retry_due(request.id).await {
                continue;
            }
            let joined = self.join_states.read().await.contains_key(&request.id);
            let result = if joined {
                self.drive_coinjoin(&mut request).await
            } else {
                self.execute_ring(&mut request).await
            };
            if let Err(e) = result {
                match e {
                    MixerError::DoubleSpend(_) | MixerError::Fatal(_) => {
                        self.fail_request(&mut request, &e.to_string()).await;
                    }
                    _ if e.is_retryable() || e.is_pool_shortage() => {
                        self.note_transient_failure(&mut request, "mixing").await;
                    }
                    _ => {
                        self.fail_request(&mut request, &e.to_string()).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Advances the engine's own participation in the session; falls back to
    /// the ring path when the session dies without us being at fault.
    async fn drive_coinjoin(&self, request: &mut MixRequest) -> MixerResult<()> {
        let (session_id, participant_id, denomination) = {
            let joins = self.join_states.read().await;
            let join = joins
                .get(&request.id)
                .ok_or_else(|| MixerError::Fatal("missing join state".into()))?;
            (join.session_id, join.participant_id.clone(), join.denomination)
        };

        let phase = self.coinjoin.poll(session_id).await?;
        let session = self
            .coinjoin
            .get_session(session_id)
            .await
            .ok_or(MixerError::SessionNotFound(session_id))?;

        match phase {
            SessionPhase::Registration => Ok(()), // waiting for quorum
            SessionPhase::OutputRegistration => {
                let our_status = session
                    .participants
                    .get(&participant_id)
                    .map(|p| p.status)
                    .ok_or_else(|| MixerError::Fatal("participant vanished".into()))?;
                if our_status == ParticipantStatus::Registered {
                    let address = request
                        .outputs
                        .first()
                        .map(|o| o.address.clone())
                        .ok_or_else(|| MixerError::Fatal("request without outputs".into()))?;
                    let factor = {
                        let joins = self.join_states.read().await;
                        joins
                            .get(&request.id)
                            .map(|j| j.blinding_factor)
                            .ok_or_else(|| MixerError::Fatal("missing join state".into()))?
                    };
                    let blinded = BlindedOutput::create(&address, denomination, &factor)?;
                    self.coinjoin
                        .register_outputs(session_id, &participant_id, vec![blinded], factor)
                        .await?;
                }
                Ok(())
            }
            SessionPhase::Signing => {
                let our_status = session
                    .participants
                    .get(&participant_id)
                    .map(|p| p.status)
                    .ok_or_else(|| MixerError::Fatal("participant vanished".into()))?;
                if our_status == ParticipantStatus::Committed {
                    let message = self.coinjoin.signing_message(session_id).await?;
                    let signature = {
                        let joins = self.join_states.read().await;
                        let join = joins
                            .get(&request.id)
                            .ok_or_else(|| MixerError::Fatal("missing join state".into()))?;
                        if self.coinjoin_config.use_schnorr {
                            schnorr_sign(&message, &join.keypair.secret)?.to_bytes().to_vec()
                        } else {
                            ecdsa_sign(&message, &join.keypair.secret)?.to_vec()
                        }
                    };
                    self.coinjoin
                        .sign(session_id, &participant_id, vec![signature])
                        .await?;
                }
                Ok(())
            }
            SessionPhase::Broadcasting => {
                // first request to observe the phase broadcasts for everyone
                let finalized = self.coinjoin.finalize(session_id).await?;
                let chain = self.chain_for(request)?;
                let txid = chain.broadcast(&finalized.raw_transaction).await?;
                self.coinjoin.mark_broadcast(session_id, &txid).await?;
                self.finish_coinjoin_leg(request, &txid, denomination).await
            }
            SessionPhase::Completed => {
                let txid = session
                    .txid
                    .ok_or_else(|| MixerError::Fatal("completed session without txid".into()))?;
                self.finish_coinjoin_leg(request, &txid, denomination).await
            }
            SessionPhase::Failed => {
                // quorum never formed; single-signer path takes over
                log::warn!(
                    "request {}: coinjoin session {session_id} failed, falling back to ring",
                    request.id
                );
                self.join_states.write().await.remove(&request.id);
                self.execute_ring(request).await
            }
        }
    }

    /// Writes the request's denomination leg (and any residual change) and
    /// moves to COMPLETING.
    async fn finish_coinjoin_leg(
        &self,
        request: &mut MixRequest,
        txid: &str,
        denomination: f64,
    ) -> MixerResult<()> {
        let address = request
            .outputs
            .first()
            .map(|o| o.address.clone())
            .ok_or_else(|| MixerError::Fatal("request without outputs".into()))?;
        let leg = OutputTransaction {
            id: Uuid::new_v4(),
            mix_request_id: request.id,
            output_index: 0,
            address: address.clone(),
            amount: denomination,
            scheduled_at: chrono::Utc::now(),
            status: OutputTxStatus::Broadcast,
            txid: Some(txid.to_string()),
            attempts: 0,
        };
        self.repository.insert_output_tx(&leg).await?;

        let residual = request.input_amount - denomination - self.total_fee();
        if residual > 1e-9 {
            // change rides a later pool payout
            let change = OutputTransaction {
                id: Uuid::new_v4(),
                mix_request_id: request.id,
                output_index: 1,
                address,
                amount: residual,
                scheduled_at: chrono::Utc::now() + chrono::Duration::minutes(5),
                status: OutputTxStatus::Pending,
                txid: None,
                attempts: 0,
            };
            self.repository.insert_output_tx(&change).await?;
        }

        self.join_states.write().await.remove(&request.id);
        self.transition(request, MixStatus::Completing, None).await
    }

    /// Single-signer path: debit the pool, build and broadcast the ring
    /// transaction, schedule one output transaction per leg.
    async fn execute_ring(&self, request: &mut MixRequest) -> MixerResult<()> {
        let payout_total = request.input_amount - self.total_fee();
        let network_fee = self.coinjoin_config.network_fee;
        let debit = payout_total + network_fee;

        let wallet = self
            .wallets
            .find_optimal_for_withdrawal(request.currency, debit)
            .await?
            .ok_or(MixerError::PoolShortage {
                currency: request.currency.code().to_string(),
                requested: debit,
            })?;

        match self.wallets.atomic_subtract(wallet.id, debit).await? {
            SubtractOutcome::Ok { .. } => {}
            SubtractOutcome::Failed(reason) => {
                return Err(MixerError::PoolShortage {
                    currency: format!("{} ({reason:?})", request.currency.code()),
                    requested: debit,
                });
            }
        }

        let legs: Vec<(String, f64)> = request
            .outputs
            .iter()
            .map(|o| (o.address.clone(), payout_total * o.percentage / 100.0))
            .collect();

        let input = SpendableInput {
            txid: request
                .deposit_txid
                .clone()
                .ok_or_else(|| MixerError::Fatal("mixing request without deposit".into()))?,
            output_index: 0,
            amount: debit,
            keypair: generate_keypair()?,
            block_height: request.deposit_block_height.unwrap_or(0),
        };

        let broadcast_result = async {
            let tx = self
                .ring
                .create_ring_transaction(vec![input], legs.clone(), network_fee)
                .await?;
            let chain = self.chain_for(request)?;
            let txid = chain.broadcast(&tx.raw_bytes()).await?;
            self.ring.commit_key_images(&tx).await?;
            MixerResult::Ok(txid)
        }
        .await;

        let txid = match broadcast_result {
            Ok(txid) => txid,
            Err(e) => {
                // return the reserved funds before surfacing the error
                let balance = self.wallets.get_balance(wallet.id).await.unwrap_or(0.0);
                if let Err(refund_err) =
                    self.wallets.update_balance(wallet.id, balance + debit).await
                {
                    log::error!(
                        "failed to refund pool wallet {} after broadcast error: {refund_err}",
                        wallet.id
                    );
                }
                return Err(e);
            }
        };

        // sweep the deposit into the pool
        let balance = self.wallets.get_balance(wallet.id).await?;
        self.wallets
            .update_balance(wallet.id, balance + request.input_amount)
            .await?;

        for (index, (address, amount)) in legs.into_iter().enumerate() {
            let leg = OutputTransaction {
                id: Uuid::new_v4(),
                mix_request_id: request.id,
                output_index: index,
                address,
                amount,
                scheduled_at: chrono::Utc::now(),
                status: OutputTxStatus::Broadcast,
                txid: Some(txid.clone()),
                attempts: 0,
            };
            self.repository.insert_output_tx(&leg).await?;
        }

        self.transition(request, MixStatus::Completing, None).await
    }

    /// COMPLETING: broadcast any still-pending legs, track confirmations,
    /// finish when every leg confirmed. Each leg retries on its own budget.
    async fn confirm_outputs(&self) -> MixerResult<()> {
        let mut candidates = self
            .repository
            .list_requests_by_status(MixStatus::Completing)
            .await?;
        // refund legs of cancelled requests ride the same machinery
        candidates.extend(
            self.repository
                .list_requests_by_status(MixStatus::Cancelled)
                .await?,
        );

        for mut request in candidates {
            let required = request.currency.required_confirmations();
            let chain = match self.chain_for(&request) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let mut all_confirmed = true;
            let mut any_failed = false;

            for mut leg in self.repository.list_output_txs(request.id).await? {
                match leg.status {
                    OutputTxStatus::Confirmed => continue,
                    OutputTxStatus::Failed => {
                        any_failed = true;
                        continue;
                    }
                    OutputTxStatus::Pending | OutputTxStatus::Signed
                        if leg.scheduled_at <= chrono::Utc::now() =>
                    {
                        let raw = format!("payout:{}:{}", leg.address, leg.amount);
                        match chain.broadcast(raw.as_bytes()).await {
                            Ok(txid) => {
                                leg.txid = Some(txid);
                                leg.status = OutputTxStatus::Broadcast;
                                self.repository.update_output_tx(&leg).await?;
                                all_confirmed = false;
                            }
                            Err(e) => {
                                leg.attempts += 1;
                                if leg.attempts >= self.config.max_retries {
                                    leg.status = OutputTxStatus::Failed;
                                    any_failed = true;
                                } else {
                                    all_confirmed = false;
                                }
                                self.repository.update_output_tx(&leg).await?;
                                log::warn!(
                                    "leg {} broadcast failed (attempt {}): {e}",
                                    leg.id,
                                    leg.attempts
                                );
                            }
                        }
                    }
                    OutputTxStatus::Broadcast => {
                        let txid = leg.txid.clone().unwrap_or_default();
                        match chain.get_confirmations(&txid).await {
                            Ok(confs) if confs >= required => {
                                leg.status = OutputTxStatus::Confirmed;
                                self.repository.update_output_tx(&leg).await?;
                            }
                            Ok(_) => all_confirmed = false,
                            Err(e) => {
                                leg.attempts += 1;
                                if leg.attempts >= self.config.max_retries {
                                    leg.status = OutputTxStatus::Failed;
                                    any_failed = true;
                                } else {
                                    all_confirmed = false;
                                }
                                self.repository.update_output_tx(&leg).await?;
                                log::warn!("confirmation poll for {txid} failed: {e}");
                            }
                        }
                    }
                    _ => all_confirmed = false,
                }
            }

            if request.status != MixStatus::Completing {
                continue; // cancelled requests only needed their refund legs driven
            }
            if any_failed {
                self.fail_request(&mut request, "output leg retry budget exhausted")
                    .await;
            } else if all_confirmed && !self.repository.list_output_txs(request.id).await?.is_empty()
            {
                self.clear_attempts(request.id).await;
                self.transition(&mut request, MixStatus::Completed, None)
                    .await?;
                self.audit(
                    crate::repository::AuditLevel::Info,
                    "request_completed",
                    format!("{} legs confirmed", request.outputs.len()),
                    Some(request.id),
                )
                .await;
            }
        }
        Ok(())
    }

    fn chain_for(
        &self,
        request: &MixRequest,
    ) -> MixerResult<Arc<dyn crate::chain::BlockchainClient>> {
        self.chains
            .get(&request.currency)
            .cloned()
            .ok_or_else(|| MixerError::Chain(format!("no client for {}", request.currency)))
    }
}

fn pooling_denoms(pooling: &[MixRequest], total_fee: f64) -> Vec<(Uuid, Option<f64>)> {
    pooling
        .iter()
        .map(|r| {
            let denom = if r.outputs.len() == 1 {
                r.currency.best_denomination(r.input_amount - total_fee)
            } else {
                None
            };
            (r.id, denom)
        })
        .collect()
}
