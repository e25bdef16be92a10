// src/wallet/mod.rs
pub mod cache;

use crate::chain::validate_address;
use crate::error::{MixerError, MixerResult};
use crate::repository::{DebitOutcome, Repository};
use crate::types::{Currency, Wallet, WalletStatus, WalletType};
use cache::BalanceCache;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// Structured reason an atomic subtraction did not apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtractFailure {
    NotFound,
    InsufficientBalance,
    InactiveOrLocked,
}

/// Result of `atomic_subtract`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubtractOutcome {
    Ok { new_balance: f64 },
    Failed(SubtractFailure),
}

/// Emitted on every observed balance mutation.
#[derive(Debug, Clone)]
pub struct BalanceChanged {
    pub wallet_id: Uuid,
    pub old_balance: f64,
    pub new_balance: f64,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Custodian of HOT/COLD/POOL/MULTISIG wallets. All balance mutations in the
/// process go through this type; the repository's conditional update is the
/// source of truth, never in-memory arithmetic.
#[derive(Clone)]
pub struct WalletManager {
    repository: Arc<dyn Repository>,
    cache: Arc<RwLock<BalanceCache>>,
    events: broadcast::Sender<BalanceChanged>,
}

impl WalletManager {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            repository,
            cache: Arc::new(RwLock::new(BalanceCache::new(Duration::from_secs(30)))),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BalanceChanged> {
        self.events.subscribe()
    }

    /// Creates a wallet after probing address uniqueness. The probe is an
    /// EXISTS query, not a row fetch.
    pub async fn create(&self, wallet: Wallet) -> MixerResult<Uuid> {
        validate_address(wallet.currency, &wallet.address)?;
        if wallet.balance < 0.0 {
            return Err(MixerError::InputValidation(
                "wallet balance cannot be negative".into(),
            ));
        }
        if self
            .repository
            .wallet_exists_by_address(&wallet.address)
            .await?
        {
            return Err(MixerError::InputValidation(format!(
                "wallet address {} already registered",
                wallet.address
            )));
        }
        let id = wallet.id;
        self.repository.insert_wallet(&wallet).await?;
        log::info!(
            "created {:?} wallet {id} for {}",
            wallet.wallet_type,
            wallet.currency
        );
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> MixerResult<Option<Wallet>> {
        self.repository.get_wallet(id).await
    }

    /// Cached single-column balance read (TTL ≤ 30 s).
    pub async fn get_balance(&self, id: Uuid) -> MixerResult<f64> {
        if let Some(balance) = self.cache.write().await.get(id) {
            return Ok(balance);
        }
        let balance = self
            .repository
            .get_wallet_balance(id)
            .await?
            .ok_or(MixerError::WalletNotFound(id))?;
        self.cache.write().await.insert(id, balance);
        Ok(balance)
    }

    /// Overwrites the balance. Serialised per wallet by the repository's
    /// write path; emits `BalanceChanged(old, new)`.
    pub async fn update_balance(&self, id: Uuid, new_balance: f64) -> MixerResult<()> {
        if new_balance < 0.0 {
            return Err(MixerError::InputValidation(format!(
                "negative balance {new_balance}"
            )));
        }
        let mut wallet = self
            .repository
            .get_wallet(id)
            .await?
            .ok_or(MixerError::WalletNotFound(id))?;
        let old_balance = wallet.balance;
        wallet.balance = new_balance;
        wallet.last_balance_update = chrono::Utc::now();
        self.repository.update_wallet(&wallet).await?;
        self.cache.write().await.invalidate(id);
        let _ = self.events.send(BalanceChanged {
            wallet_id: id,
            old_balance,
            new_balance,
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    /// Conditional debit: succeeds only while the wallet is active, unlocked
    /// and funded. The condition and the mutation are one repository update.
    pub async fn atomic_subtract(&self, id: Uuid, amount: f64) -> MixerResult<SubtractOutcome> {
        if amount <= 0.0 {
            return Err(MixerError::InputValidation(format!(
                "subtract amount must be positive, got {amount}"
            )));
        }
        let outcome = self.repository.atomic_debit(id, amount).await?;
        match outcome {
            DebitOutcome::Applied(new_balance) => {
                self.cache.write().await.invalidate(id);
                let _ = self.events.send(BalanceChanged {
                    wallet_id: id,
                    old_balance: new_balance + amount,
                    new_balance,
                    at: chrono::Utc::now(),
                });
                Ok(SubtractOutcome::Ok { new_balance })
            }
            DebitOutcome::NotApplied => {
                // classify for the caller; the debit itself already refused
                let reason = match self.repository.get_wallet(id).await? {
                    None => SubtractFailure::NotFound,
                    Some(w) if !w.is_active || w.is_locked => SubtractFailure::InactiveOrLocked,
                    Some(_) => SubtractFailure::InsufficientBalance,
                };
                Ok(SubtractOutcome::Failed(reason))
            }
        }
    }

    /// Applies all updates in one repository transaction. Affected cache
    /// entries are invalidated before the commit so readers never observe a
    /// stale post-commit balance.
    pub async fn batch_update_balances(&self, updates: &[(Uuid, f64)]) -> MixerResult<()> {
        {
            let mut cache = self.cache.write().await;
            for (id, _) in updates {
                cache.invalidate(*id);
            }
        }
        self.repository.batch_update_balances(updates).await
    }

    /// Ordered selection: active, unlocked, ACTIVE status, HOT or POOL type,
    /// funded; preferring the largest balance, tie-broken by least recently
    /// used.
    pub async fn find_optimal_for_withdrawal(
        &self,
        currency: Currency,
        amount: f64,
    ) -> MixerResult<Option<Wallet>> {
        let mut candidates: Vec<Wallet> = self
            .repository
            .list_wallets(currency)
            .await?
            .into_iter()
            .filter(|w| {
                w.is_active
                    && !w.is_locked
                    && w.status == WalletStatus::Active
                    && matches!(w.wallet_type, WalletType::Hot | WalletType::Pool)
                    && w.balance >= amount
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.balance
                .partial_cmp(&a.balance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.last_used_at.cmp(&b.last_used_at))
        });
        Ok(candidates.into_iter().next())
    }

    /// Active HOT/POOL wallets idle longer than the rotation window.
    pub async fn find_for_rotation(&self) -> MixerResult<Vec<Wallet>> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
        let mut stale = Vec::new();
        for currency in Currency::all() {
            let wallets = self.repository.list_wallets(currency).await?;
            stale.extend(wallets.into_iter().filter(|w| {
                w.is_active
                    && matches!(w.wallet_type, WalletType::Hot | WalletType::Pool)
                    && w.last_used_at < cutoff
            }));
        }
        Ok(stale)
    }

    /// Archives wallets idle for `days` with a zero balance, in batches with
    /// a pause between them so the store is never saturated.
    pub async fn archive_inactive(&self, days: i64, batch_size: usize) -> MixerResult<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(days);
        let mut candidates = Vec::new();
        for currency in Currency::all() {
            let wallets = self.repository.list_wallets(currency).await?;
            candidates.extend(wallets.into_iter().filter(|w| {
                w.is_active && w.balance == 0.0 && w.last_used_at < cutoff
            }));
        }

        let total = candidates.len();
        for batch in candidates.chunks(batch_size.max(1)) {
            for wallet in batch {
                let mut archived = wallet.clone();
                archived.is_active = false;
                archived.status = WalletStatus::Archived;
                self.repository.update_wallet(&archived).await?;
                self.cache.write().await.invalidate(archived.id);
            }
            if batch.len() == batch_size {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        if total > 0 {
            log::info!("archived {total} inactive wallets (idle > {days} d)");
        }
        Ok(total)
    }

    pub async fn cache_stats(&self) -> (usize, u64, u64) {
        let cache = self.cache.read().await;
        let (hits, misses) = cache.stats();
        (cache.size(), hits, misses)
    }

    pub async fn health_check(&self) -> MixerResult<()> {
        let cache = self.cache.read().await;
        if cache.size() > 50_000 {
            return Err(MixerError::HealthCheck("balance cache too large".into()));
        }
        Ok(())
    }
}

/// Convenience constructor for a fresh pool wallet.
pub fn new_wallet(currency: Currency, wallet_type: WalletType, address: String, balance: f64) -> Wallet {
    let now = chrono::Utc::now();
    Wallet {
        id: Uuid::new_v4(),
        currency,
        wallet_type,
        address,
        balance,
        is_active: true,
        is_locked: false,
        status: WalletStatus::Active,
        last_used_at: now,
        last_balance_update: now,
        usage_count: 0,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRepository;

    fn manager() -> (WalletManager, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        (WalletManager::new(repo.clone()), repo)
    }

    fn btc_wallet(balance: f64) -> Wallet {
        // unique bech32-shaped body per call
        let body = format!(
            "{}{}",
            hex::encode(Uuid::new_v4().as_bytes()),
            hex::encode(Uuid::new_v4().as_bytes())
        );
        new_wallet(
            Currency::Btc,
            WalletType::Hot,
            format!("bc1q{}", &body[..39]),
            balance,
        )
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_address() {
        let (manager, _) = manager();
        let wallet = btc_wallet(1.0);
        let copy = Wallet {
            id: Uuid::new_v4(),
            ..wallet.clone()
        };
        manager.create(wallet).await.unwrap();
        assert!(manager.create(copy).await.is_err());
    }

    #[tokio::test]
    async fn test_create_rejects_malformed_address() {
        let (manager, _) = manager();
        let mut wallet = btc_wallet(1.0);
        wallet.address = "not-an-address".into();
        assert!(manager.create(wallet).await.is_err());
    }

    #[tokio::test]
    async fn test_balance_cache_roundtrip() {
        let (manager, _) = manager();
        let wallet = btc_wallet(2.5);
        let id = manager.create(wallet).await.unwrap();

        assert!((manager.get_balance(id).await.unwrap() - 2.5).abs() < 1e-9);
        // second read is served from cache
        assert!((manager.get_balance(id).await.unwrap() - 2.5).abs() < 1e-9);
        let (_, hits, _) = manager.cache_stats().await;
        assert!(hits >= 1);
    }

    #[tokio::test]
    async fn test_update_balance_emits_event() {
        let (manager, _) = manager();
        let wallet = btc_wallet(1.0);
        let id = manager.create(wallet).await.unwrap();
        let mut events = manager.subscribe();

        manager.update_balance(id, 3.0).await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.wallet_id, id);
        assert!((event.old_balance - 1.0).abs() < 1e-9);
        assert!((event.new_balance - 3.0).abs() < 1e-9);

        // cache reflects the new balance
        assert!((manager.get_balance(id).await.unwrap() - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_atomic_subtract_outcomes() {
        let (manager, _) = manager();
        let wallet = btc_wallet(1.0);
        let id = manager.create(wallet).await.unwrap();

        match manager.atomic_subtract(id, 0.7).await.unwrap() {
            SubtractOutcome::Ok { new_balance } => assert!((new_balance - 0.3).abs() < 1e-9),
            other => panic!("expected success, got {other:?}"),
        }

        assert_eq!(
            manager.atomic_subtract(id, 0.7).await.unwrap(),
            SubtractOutcome::Failed(SubtractFailure::InsufficientBalance)
        );

        assert_eq!(
            manager.atomic_subtract(Uuid::new_v4(), 0.1).await.unwrap(),
            SubtractOutcome::Failed(SubtractFailure::NotFound)
        );
    }

    #[tokio::test]
    async fn test_atomic_subtract_respects_lock() {
        let (manager, repo) = manager();
        let wallet = btc_wallet(5.0);
        let id = manager.create(wallet).await.unwrap();

        let mut locked = repo.get_wallet(id).await.unwrap().unwrap();
        locked.is_locked = true;
        repo.update_wallet(&locked).await.unwrap();

        assert_eq!(
            manager.atomic_subtract(id, 1.0).await.unwrap(),
            SubtractOutcome::Failed(SubtractFailure::InactiveOrLocked)
        );
    }

    #[tokio::test]
    async fn test_contended_subtract_single_winner() {
        let (manager, _) = manager();
        let wallet = btc_wallet(1.0);
        let id = manager.create(wallet).await.unwrap();

        let (a, b) = tokio::join!(
            manager.atomic_subtract(id, 0.7),
            manager.atomic_subtract(id, 0.7)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let wins = outcomes
            .iter()
            .filter(|o| matches!(o, SubtractOutcome::Ok { .. }))
            .count();
        assert_eq!(wins, 1);
        assert!((manager.get_balance(id).await.unwrap() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_find_optimal_ordering() {
        let (manager, repo) = manager();
        let small = btc_wallet(1.0);
        let big = btc_wallet(8.0);
        let locked = {
            let mut w = btc_wallet(9.0);
            w.is_locked = true;
            w
        };
        let cold = {
            let mut w = btc_wallet(9.5);
            w.wallet_type = WalletType::Cold;
            w
        };
        manager.create(small).await.unwrap();
        let big_id = manager.create(big).await.unwrap();
        repo.insert_wallet(&locked).await.unwrap();
        repo.insert_wallet(&cold).await.unwrap();

        let chosen = manager
            .find_optimal_for_withdrawal(Currency::Btc, 0.5)
            .await
            .unwrap()
            .expect("a wallet qualifies");
        assert_eq!(chosen.id, big_id);

        // nothing can cover this amount
        assert!(manager
            .find_optimal_for_withdrawal(Currency::Btc, 100.0)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_rotation_and_archive() {
        let (manager, repo) = manager();
        let mut stale = btc_wallet(0.0);
        stale.last_used_at = chrono::Utc::now() - chrono::Duration::days(100);
        let stale_id = stale.id;
        repo.insert_wallet(&stale).await.unwrap();

        let fresh = btc_wallet(0.0);
        repo.insert_wallet(&fresh).await.unwrap();

        let rotate = manager.find_for_rotation().await.unwrap();
        assert_eq!(rotate.len(), 1);
        assert_eq!(rotate[0].id, stale_id);

        let archived = manager.archive_inactive(90, 1000).await.unwrap();
        assert_eq!(archived, 1);
        let wallet = repo.get_wallet(stale_id).await.unwrap().unwrap();
        assert!(!wallet.is_active);
        assert_eq!(wallet.status, WalletStatus::Archived);
    }

    #[tokio::test]
    async fn test_batch_update_invalidates_cache() {
        let (manager, _) = manager();
        let wallet = btc_wallet(1.0);
        let id = manager.create(wallet).await.unwrap();
        let _ = manager.get_balance(id).await.unwrap(); // warm the cache

        manager.batch_update_balances(&[(id, 4.0)]).await.unwrap();
        assert!((manager.get_balance(id).await.unwrap() - 4.0).abs() < 1e-9);
    }
}
