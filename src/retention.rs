// src/retention.rs
use crate::coinjoin::CoinJoinCoordinator;
use crate::error::MixerResult;
use crate::monitoring::MonitoringService;
use crate::registry::BanList;
use crate::repository::Repository;
use crate::types::{MixStatus, RetentionConfig};
use std::sync::Arc;
use tokio::sync::Notify;

/// Data-retention janitor. Sleeps in long intervals and deletes what the
/// retention policy allows: terminal requests past their window, expired
/// sessions and bans, resolved alerts, stale metric points. An emergency
/// signal short-circuits the sleep and forces a bounded-map cleanup.
#[derive(Clone)]
pub struct RetentionJanitor {
    config: RetentionConfig,
    repository: Arc<dyn Repository>,
    coinjoin: CoinJoinCoordinator,
    bans: BanList,
    monitoring: MonitoringService,
    emergency: Arc<Notify>,
}

impl RetentionJanitor {
    pub fn new(
        config: RetentionConfig,
        repository: Arc<dyn Repository>,
        coinjoin: CoinJoinCoordinator,
        bans: BanList,
        monitoring: MonitoringService,
    ) -> Self {
        Self {
            config,
            repository,
            coinjoin,
            bans,
            monitoring,
            emergency: Arc::new(Notify::new()),
        }
    }

    /// Wakes the janitor immediately for a bounded-map cleanup.
    pub fn signal_memory_pressure(&self) {
        self.emergency.notify_one();
    }

    /// One sweep over everything retention governs. Only terminal requests
    /// are ever deleted.
    pub async fn run_once(&self) -> MixerResult<usize> {
        let cutoff = chrono::Utc::now() - self.config.request_retention;
        let mut removed = 0;

        for status in [MixStatus::Completed, MixStatus::Cancelled] {
            for request in self.repository.list_requests_by_status(status).await? {
                let reference = request.completed_at.unwrap_or(request.updated_at);
                if reference < cutoff {
                    self.repository.delete_request(request.id).await?;
                    removed += 1;
                }
            }
        }

        let sessions = self.coinjoin.sweep_expired(self.config.session_retention).await;
        let bans = self.bans.sweep_expired().await?;
        let points = self.monitoring.prune_all().await;
        let alerts = self
            .monitoring
            .prune_resolved_alerts(self.config.request_retention)
            .await;

        if removed + sessions + bans + points + alerts > 0 {
            log::info!(
                "janitor sweep: {removed} requests, {sessions} sessions, {bans} bans, \
                 {points} metric points, {alerts} alerts"
            );
        }
        Ok(removed)
    }

    /// Long-running loop: sleeps `sweep_interval_secs` between sweeps, or
    /// wakes early on the memory-pressure signal.
    pub async fn run_loop(self) {
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        log::error!("janitor sweep failed: {e}");
                    }
                }
                _ = self.emergency.notified() => {
                    log::warn!("memory pressure signal received");
                    self.monitoring.emergency_cleanup().await;
                    if let Err(e) = self.run_once().await {
                        log::error!("emergency sweep failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::NotificationDispatcher;
    use crate::registry::KeyImageRegistry;
    use crate::repository::InMemoryRepository;
    use crate::types::{
        CoinJoinConfig, Currency, MixOutput, MixRequest, MonitoringConfig,
    };
    use uuid::Uuid;

    fn janitor(config: RetentionConfig) -> (RetentionJanitor, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let repo_dyn: Arc<dyn Repository> = repo.clone();
        let registry = KeyImageRegistry::new(repo_dyn.clone());
        let bans = BanList::new(repo_dyn.clone());
        let coinjoin = CoinJoinCoordinator::new(CoinJoinConfig::default(), registry, bans.clone());
        let monitoring = MonitoringService::new(
            MonitoringConfig::default(),
            repo_dyn.clone(),
            NotificationDispatcher::new(0),
        );
        (
            RetentionJanitor::new(config, repo_dyn, coinjoin, bans, monitoring),
            repo,
        )
    }

    fn terminal_request(status: MixStatus, age: chrono::Duration) -> MixRequest {
        let at = chrono::Utc::now() - age;
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::Btc,
            input_amount: 0.1,
            outputs: vec![MixOutput {
                address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(),
                percentage: 100.0,
            }],
            status,
            algorithm: None,
            deposit_txid: None,
            deposit_block_height: None,
            deposit_confirmed_at: None,
            completed_at: Some(at),
            error_message: None,
            user_id: None,
            pending_review: false,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_only_expired_terminal_requests_deleted() {
        let (janitor, repo) = janitor(RetentionConfig {
            request_retention: chrono::Duration::days(30),
            ..RetentionConfig::default()
        });

        let old_completed =
            terminal_request(MixStatus::Completed, chrono::Duration::days(31));
        let fresh_completed =
            terminal_request(MixStatus::Completed, chrono::Duration::days(1));
        let old_failed = terminal_request(MixStatus::Failed, chrono::Duration::days(90));
        repo.insert_request(&old_completed).await.unwrap();
        repo.insert_request(&fresh_completed).await.unwrap();
        repo.insert_request(&old_failed).await.unwrap();

        let removed = janitor.run_once().await.unwrap();
        assert_eq!(removed, 1);
        assert!(repo.get_request(old_completed.id).await.unwrap().is_none());
        assert!(repo.get_request(fresh_completed.id).await.unwrap().is_some());
        // failed requests are kept for post-mortem regardless of age
        assert!(repo.get_request(old_failed.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_cascades_to_owned_records() {
        let (janitor, repo) = janitor(RetentionConfig {
            request_retention: chrono::Duration::zero(),
            ..RetentionConfig::default()
        });
        let request = terminal_request(MixStatus::Cancelled, chrono::Duration::hours(1));
        repo.insert_request(&request).await.unwrap();
        repo.insert_deposit_address(&crate::types::DepositAddress {
            id: Uuid::new_v4(),
            mix_request_id: request.id,
            currency: Currency::Btc,
            address: "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2".into(),
            private_key_ciphertext: "ct".into(),
            derivation_path: None,
            address_index: 0,
            used: false,
            first_used_at: None,
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

        janitor.run_once().await.unwrap();
        assert!(repo.get_request(request.id).await.unwrap().is_none());
        assert!(!repo
            .exists_by_address("1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2")
            .await
            .unwrap());
    }
}
