// src/lib.rs
pub mod chain;
pub mod coinjoin;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod monitoring;
pub mod registry;
pub mod repository;
pub mod retention;
pub mod ring;
pub mod security;
pub mod types;
pub mod wallet;

pub use engine::{CreateMixRequest, CreatedMix, MixRequestEngine};
pub use error::{ErrorKind, MixerError, MixerResult};
pub use types::{CoordinatorConfig, Currency, MixRequest, MixStatus};

use crate::chain::BlockchainClient;
use crate::coinjoin::CoinJoinCoordinator;
use crate::engine::DepositAddressGenerator;
use crate::monitoring::{MonitoringService, NotificationDispatcher};
use crate::registry::{BanList, KeyImageRegistry};
use crate::repository::Repository;
use crate::retention::RetentionJanitor;
use crate::ring::RingMixer;
use crate::security::{KeyVault, SecurityValidator};
use crate::wallet::WalletManager;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The assembled mixing coordinator: engine, session coordinator, wallet
/// custody, validation, telemetry and retention, wired over one repository
/// and a chain client per currency.
pub struct MixingCoordinator {
    config: CoordinatorConfig,
    repository: Arc<dyn Repository>,
    chains: HashMap<Currency, Arc<dyn BlockchainClient>>,
    engine: MixRequestEngine,
    wallets: WalletManager,
    coinjoin: CoinJoinCoordinator,
    ring: RingMixer,
    validator: SecurityValidator,
    monitoring: MonitoringService,
    janitor: RetentionJanitor,
    vault: KeyVault,
    tasks: Vec<JoinHandle<()>>,
}

impl MixingCoordinator {
    /// Wires the subsystems and hydrates the durable invariants (key images,
    /// bans) from the repository. Call `start()` to launch the background
    /// loops.
    pub async fn new(
        config: CoordinatorConfig,
        repository: Arc<dyn Repository>,
        chains: HashMap<Currency, Arc<dyn BlockchainClient>>,
        dispatcher: NotificationDispatcher,
    ) -> MixerResult<Self> {
        let registry = KeyImageRegistry::new(repository.clone());
        registry.load().await?;
        let bans = BanList::new(repository.clone());
        bans.load().await?;

        let vault = KeyVault::new(config.security.encryption_key)?;
        let wallets = WalletManager::new(repository.clone());
        let validator = SecurityValidator::new(repository.clone(), config.security.clone());
        let coinjoin = CoinJoinCoordinator::new(
            config.coinjoin.clone(),
            registry.clone(),
            bans.clone(),
        );
        let ring = RingMixer::new(config.ring.clone(), registry.clone())?;
        let deposits = Arc::new(DepositAddressGenerator::new(
            repository.clone(),
            vault.clone(),
            config.hd_seed_phrase.as_deref(),
        )?);
        let monitoring = MonitoringService::new(
            config.monitoring.clone(),
            repository.clone(),
            dispatcher,
        );
        let janitor = RetentionJanitor::new(
            config.retention.clone(),
            repository.clone(),
            coinjoin.clone(),
            bans.clone(),
            monitoring.clone(),
        );

        let engine = MixRequestEngine::new(
            config.engine.clone(),
            config.coinjoin.clone(),
            repository.clone(),
            wallets.clone(),
            validator.clone(),
            coinjoin.clone(),
            ring.clone(),
            chains.clone(),
            deposits,
        );

        Ok(Self {
            config,
            repository,
            chains,
            engine,
            wallets,
            coinjoin,
            ring,
            validator,
            monitoring,
            janitor,
            vault,
            tasks: Vec::new(),
        })
    }

    /// Spawns the concurrent loops: engine tick, session timeout watcher,
    /// the four collectors, the two alert checkers and the janitor.
    pub fn start(&mut self) {
        let tick_period = millis(self.config.engine.tick_interval_secs);
        let engine = self.engine.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                if let Err(e) = engine.tick().await {
                    log::error!("engine tick failed: {e}");
                }
                tokio::time::sleep(tick_period).await;
            }
        }));

        let coinjoin = self.coinjoin.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let _ = coinjoin.poll_all().await;
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }));

        let cadences = [
            (self.config.monitoring.system_interval_secs, 0u8),
            (self.config.monitoring.business_interval_secs, 1),
            (self.config.monitoring.security_interval_secs, 2),
            (self.config.monitoring.performance_interval_secs, 3),
            (self.config.monitoring.system_alert_interval_secs, 4),
            (self.config.monitoring.business_alert_interval_secs, 5),
        ];
        for (secs, what) in cadences {
            let monitoring = self.monitoring.clone();
            let period = millis(secs);
            self.tasks.push(tokio::spawn(async move {
                loop {
                    match what {
                        0 => monitoring.collect_system().await,
                        1 => monitoring.collect_business().await,
                        2 => monitoring.collect_security().await,
                        3 => monitoring.collect_performance().await,
                        4 => monitoring.check_system_alerts().await,
                        _ => monitoring.check_business_alerts().await,
                    }
                    tokio::time::sleep(period).await;
                }
            }));
        }

        let janitor = self.janitor.clone();
        self.tasks.push(tokio::spawn(janitor.run_loop()));

        log::info!("mixing coordinator started ({} loops)", self.tasks.len());
    }

    pub async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        log::info!("mixing coordinator stopped");
    }

    // -- in-process API -----------------------------------------------------

    /// Creates a request and begins watching its deposit address on chain.
    pub async fn create_request(&self, input: CreateMixRequest) -> MixerResult<CreatedMix> {
        let created = self.engine.create(input).await?;
        self.watch_deposit(&created).await;
        Ok(created)
    }

    pub async fn cancel_request(&self, id: Uuid, reason: &str) -> MixerResult<MixRequest> {
        self.engine.cancel(id, reason).await
    }

    pub async fn request_status(&self, id: Uuid) -> MixerResult<MixRequest> {
        self.engine.get(id).await
    }

    pub async fn on_deposit_confirmed(
        &self,
        id: Uuid,
        txid: &str,
        block_height: u64,
    ) -> MixerResult<()> {
        self.engine.on_deposit_confirmed(id, txid, block_height).await
    }

    pub async fn approve_review(&self, id: Uuid) -> MixerResult<()> {
        self.engine.approve_review(id).await
    }

    pub fn engine(&self) -> &MixRequestEngine {
        &self.engine
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn wallets(&self) -> &WalletManager {
        &self.wallets
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    pub fn ring(&self) -> &RingMixer {
        &self.ring
    }

    pub fn monitoring(&self) -> &MonitoringService {
        &self.monitoring
    }

    pub fn janitor(&self) -> &RetentionJanitor {
        &self.janitor
    }

    /// Watches the request's deposit address and feeds the first
    /// sufficiently-confirmed deposit into the engine.
    async fn watch_deposit(&self, created: &CreatedMix) {
        let currency = created.request.currency;
        let chain = match self.chains.get(&currency) {
            Some(c) => c.clone(),
            None => {
                log::warn!("no chain client for {currency}; deposit must be reported manually");
                return;
            }
        };
        let mut rx = match chain.subscribe_address(&created.deposit_address).await {
            Ok(rx) => rx,
            Err(e) => {
                log::error!("address subscription failed: {e}");
                return;
            }
        };
        let engine = self.engine.clone();
        let request_id = created.request.id;
        let required = currency.required_confirmations();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.confirmations >= required {
                    if let Err(e) = engine
                        .on_deposit_confirmed(request_id, &event.txid, event.block_height)
                        .await
                    {
                        log::error!("deposit confirmation for {request_id} failed: {e}");
                    }
                    break;
                }
            }
        });
    }

    pub async fn health_check(&self) -> MixerResult<()> {
        self.vault.verify_integrity()?;
        self.wallets.health_check().await?;
        self.monitoring.health_check().await?;
        for (currency, chain) in &self.chains {
            chain
                .get_block_height()
                .await
                .map_err(|e| MixerError::HealthCheck(format!("{currency} client: {e}")))?;
        }
        Ok(())
    }
}

fn millis(secs: u64) -> std::time::Duration {
    // a zero-second test cadence still yields the scheduler
    std::time::Duration::from_millis((secs * 1000).max(50))
}
