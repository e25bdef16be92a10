// src/repository/memory.rs
use crate::error::{MixerError, MixerResult};
use crate::repository::{
    AuditEntry, BusinessMetrics, DebitOutcome, DurationPercentiles, Repository,
};
use crate::types::{Currency, DepositAddress, MixRequest, MixStatus, OutputTransaction, Wallet};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct OperationSample {
    operation: String,
    duration_ms: f64,
    success: bool,
    at: chrono::DateTime<chrono::Utc>,
}

#[derive(Default)]
struct Store {
    requests: HashMap<Uuid, MixRequest>,
    deposit_addresses: HashMap<Uuid, DepositAddress>,
    address_index: HashMap<String, Uuid>,
    wallets: HashMap<Uuid, Wallet>,
    output_txs: HashMap<Uuid, OutputTransaction>,
    key_images: HashSet<String>,
    bans: HashMap<String, chrono::DateTime<chrono::Utc>>,
    audit: Vec<AuditEntry>,
    operations: Vec<OperationSample>,
}

/// In-memory repository. Used by tests and the demo; the production
/// deployment swaps in the database-backed implementation behind the same
/// trait. All multi-row operations run under a single write lock, which is
/// the in-memory equivalent of one transaction.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    store: Arc<RwLock<Store>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test hook: number of audit entries recorded so far.
    pub async fn audit_len(&self) -> usize {
        self.store.read().await.audit.len()
    }

    /// Test hook: failed operation samples on record.
    pub async fn failed_operation_count(&self) -> usize {
        self.store
            .read()
            .await
            .operations
            .iter()
            .filter(|s| !s.success)
            .count()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn insert_request(&self, request: &MixRequest) -> MixerResult<()> {
        let mut store = self.store.write().await;
        if store.requests.contains_key(&request.id) {
            return Err(MixerError::Repository(format!(
                "request {} already exists",
                request.id
            )));
        }
        store.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> MixerResult<Option<MixRequest>> {
        Ok(self.store.read().await.requests.get(&id).cloned())
    }

    async fn update_request(&self, request: &MixRequest) -> MixerResult<()> {
        let mut store = self.store.write().await;
        match store.requests.get_mut(&request.id) {
            Some(existing) => {
                *existing = request.clone();
                Ok(())
            }
            None => Err(MixerError::RequestNotFound(request.id)),
        }
    }

    async fn delete_request(&self, id: Uuid) -> MixerResult<()> {
        let mut store = self.store.write().await;
        store.requests.remove(&id);
        let address_ids: Vec<Uuid> = store
            .deposit_addresses
            .values()
            .filter(|a| a.mix_request_id == id)
            .map(|a| a.id)
            .collect();
        for addr_id in address_ids {
            if let Some(addr) = store.deposit_addresses.remove(&addr_id) {
                store.address_index.remove(&addr.address);
            }
        }
        store.output_txs.retain(|_, tx| tx.mix_request_id != id);
        Ok(())
    }

    async fn list_requests_by_status(&self, status: MixStatus) -> MixerResult<Vec<MixRequest>> {
        Ok(self
            .store
            .read()
            .await
            .requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn count_user_requests_since(
        &self,
        user_id: &str,
        currency: Currency,
        since: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<u32> {
        Ok(self
            .store
            .read()
            .await
            .requests
            .values()
            .filter(|r| {
                r.user_id.as_deref() == Some(user_id)
                    && r.currency == currency
                    && r.created_at >= since
            })
            .count() as u32)
    }

    async fn list_user_requests(
        &self,
        user_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<Vec<MixRequest>> {
        let mut requests: Vec<MixRequest> = self
            .store
            .read()
            .await
            .requests
            .values()
            .filter(|r| r.user_id.as_deref() == Some(user_id) && r.created_at >= since)
            .cloned()
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    async fn insert_deposit_address(&self, address: &DepositAddress) -> MixerResult<()> {
        let mut store = self.store.write().await;
        if store.address_index.contains_key(&address.address) {
            return Err(MixerError::Repository(format!(
                "address {} already exists",
                address.address
            )));
        }
        store
            .address_index
            .insert(address.address.clone(), address.mix_request_id);
        store.deposit_addresses.insert(address.id, address.clone());
        Ok(())
    }

    async fn get_deposit_address(
        &self,
        mix_request_id: Uuid,
    ) -> MixerResult<Option<DepositAddress>> {
        Ok(self
            .store
            .read()
            .await
            .deposit_addresses
            .values()
            .find(|a| a.mix_request_id == mix_request_id)
            .cloned())
    }

    async fn exists_by_address(&self, address: &str) -> MixerResult<bool> {
        Ok(self.store.read().await.address_index.contains_key(address))
    }

    async fn find_request_by_address(&self, address: &str) -> MixerResult<Option<Uuid>> {
        Ok(self.store.read().await.address_index.get(address).copied())
    }

    async fn update_deposit_address(&self, address: &DepositAddress) -> MixerResult<()> {
        let mut store = self.store.write().await;
        match store.deposit_addresses.get_mut(&address.id) {
            Some(existing) => {
                *existing = address.clone();
                Ok(())
            }
            None => Err(MixerError::NotFound(format!(
                "deposit address {}",
                address.id
            ))),
        }
    }

    async fn insert_wallet(&self, wallet: &Wallet) -> MixerResult<()> {
        let mut store = self.store.write().await;
        if store.wallets.contains_key(&wallet.id) {
            return Err(MixerError::Repository(format!(
                "wallet {} already exists",
                wallet.id
            )));
        }
        store.wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    async fn wallet_exists_by_address(&self, address: &str) -> MixerResult<bool> {
        Ok(self
            .store
            .read()
            .await
            .wallets
            .values()
            .any(|w| w.address == address))
    }

    async fn get_wallet(&self, id: Uuid) -> MixerResult<Option<Wallet>> {
        Ok(self.store.read().await.wallets.get(&id).cloned())
    }

    async fn get_wallet_balance(&self, id: Uuid) -> MixerResult<Option<f64>> {
        Ok(self.store.read().await.wallets.get(&id).map(|w| w.balance))
    }

    async fn update_wallet(&self, wallet: &Wallet) -> MixerResult<()> {
        let mut store = self.store.write().await;
        match store.wallets.get_mut(&wallet.id) {
            Some(existing) => {
                *existing = wallet.clone();
                Ok(())
            }
            None => Err(MixerError::WalletNotFound(wallet.id)),
        }
    }

    async fn list_wallets(&self, currency: Currency) -> MixerResult<Vec<Wallet>> {
        Ok(self
            .store
            .read()
            .await
            .wallets
            .values()
            .filter(|w| w.currency == currency)
            .cloned()
            .collect())
    }

    async fn atomic_debit(&self, id: Uuid, amount: f64) -> MixerResult<DebitOutcome> {
        // one write lock == one conditional UPDATE; checks and mutation are
        // indivisible
        let mut store = self.store.write().await;
        let wallet = match store.wallets.get_mut(&id) {
            Some(w) => w,
            None => return Ok(DebitOutcome::NotApplied),
        };
        if wallet.balance >= amount && wallet.is_active && !wallet.is_locked {
            wallet.balance -= amount;
            let now = chrono::Utc::now();
            wallet.last_balance_update = now;
            wallet.last_used_at = now;
            wallet.usage_count += 1;
            Ok(DebitOutcome::Applied(wallet.balance))
        } else {
            Ok(DebitOutcome::NotApplied)
        }
    }

    async fn batch_update_balances(&self, updates: &[(Uuid, f64)]) -> MixerResult<()> {
        let mut store = self.store.write().await;
        // validate first so the batch is all-or-nothing
        for (id, balance) in updates {
            if !store.wallets.contains_key(id) {
                return Err(MixerError::WalletNotFound(*id));
            }
            if *balance < 0.0 {
                return Err(MixerError::InputValidation(format!(
                    "negative balance {balance} for wallet {id}"
                )));
            }
        }
        let now = chrono::Utc::now();
        for (id, balance) in updates {
            if let Some(wallet) = store.wallets.get_mut(id) {
                wallet.balance = *balance;
                wallet.last_balance_update = now;
            }
        }
        Ok(())
    }

    async fn insert_output_tx(&self, tx: &OutputTransaction) -> MixerResult<()> {
        self.store.write().await.output_txs.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_output_tx(&self, tx: &OutputTransaction) -> MixerResult<()> {
        let mut store = self.store.write().await;
        match store.output_txs.get_mut(&tx.id) {
            Some(existing) => {
                *existing = tx.clone();
                Ok(())
            }
            None => Err(MixerError::NotFound(format!("output tx {}", tx.id))),
        }
    }

    async fn list_output_txs(&self, mix_request_id: Uuid) -> MixerResult<Vec<OutputTransaction>> {
        let mut txs: Vec<OutputTransaction> = self
            .store
            .read()
            .await
            .output_txs
            .values()
            .filter(|tx| tx.mix_request_id == mix_request_id)
            .cloned()
            .collect();
        txs.sort_by_key(|tx| tx.output_index);
        Ok(txs)
    }

    async fn insert_key_image(&self, image_hex: &str) -> MixerResult<bool> {
        Ok(self
            .store
            .write()
            .await
            .key_images
            .insert(image_hex.to_string()))
    }

    async fn load_key_images(&self) -> MixerResult<Vec<String>> {
        Ok(self.store.read().await.key_images.iter().cloned().collect())
    }

    async fn upsert_ban(
        &self,
        participant_id: &str,
        until: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<()> {
        self.store
            .write()
            .await
            .bans
            .insert(participant_id.to_string(), until);
        Ok(())
    }

    async fn load_bans(&self) -> MixerResult<Vec<(String, chrono::DateTime<chrono::Utc>)>> {
        Ok(self
            .store
            .read()
            .await
            .bans
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect())
    }

    async fn delete_ban(&self, participant_id: &str) -> MixerResult<()> {
        self.store.write().await.bans.remove(participant_id);
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> MixerResult<()> {
        self.store.write().await.audit.push(entry);
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> MixerResult<Vec<AuditEntry>> {
        let store = self.store.read().await;
        let start = store.audit.len().saturating_sub(limit);
        Ok(store.audit[start..].to_vec())
    }

    async fn record_operation(
        &self,
        operation: &str,
        duration_ms: f64,
        success: bool,
    ) -> MixerResult<()> {
        self.store.write().await.operations.push(OperationSample {
            operation: operation.to_string(),
            duration_ms,
            success,
            at: chrono::Utc::now(),
        });
        Ok(())
    }

    async fn duration_percentiles(
        &self,
        operation: &str,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<DurationPercentiles> {
        let store = self.store.read().await;
        let mut durations: Vec<f64> = store
            .operations
            .iter()
            .filter(|s| s.operation == operation && s.at >= from && s.at < to)
            .map(|s| s.duration_ms)
            .collect();
        if durations.is_empty() {
            return Ok(DurationPercentiles::default());
        }
        durations.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let pick = |p: f64| {
            let idx = ((durations.len() as f64 - 1.0) * p).round() as usize;
            durations[idx.min(durations.len() - 1)]
        };
        Ok(DurationPercentiles {
            p50: pick(0.50),
            p90: pick(0.90),
            p99: pick(0.99),
            samples: durations.len(),
        })
    }

    async fn business_metrics(&self) -> MixerResult<BusinessMetrics> {
        let store = self.store.read().await;
        let mut metrics = BusinessMetrics::default();
        for request in store.requests.values() {
            metrics.total_requests += 1;
            match request.status {
                MixStatus::Completed => metrics.completed_requests += 1,
                MixStatus::Failed => metrics.failed_requests += 1,
                MixStatus::Blocked => metrics.blocked_requests += 1,
                MixStatus::Cancelled => {}
                _ => metrics.active_requests += 1,
            }
            *metrics
                .volume_by_currency
                .entry(request.currency)
                .or_insert(0.0) += request.input_amount;
        }
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::AuditLevel;
    use crate::types::{MixOutput, WalletStatus, WalletType};

    fn test_wallet(balance: f64) -> Wallet {
        let now = chrono::Utc::now();
        Wallet {
            id: Uuid::new_v4(),
            currency: Currency::Btc,
            wallet_type: WalletType::Hot,
            address: format!("wallet-{}", Uuid::new_v4()),
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

    fn test_request() -> MixRequest {
        let now = chrono::Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::Btc,
            input_amount: 0.5,
            outputs: vec![MixOutput {
                address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(),
                percentage: 100.0,
            }],
            status: MixStatus::Pending,
            algorithm: None,
            deposit_txid: None,
            deposit_block_height: None,
            deposit_confirmed_at: None,
            completed_at: None,
            error_message: None,
            user_id: Some("user-1".into()),
            pending_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_request_crud() {
        let repo = InMemoryRepository::new();
        let request = test_request();
        repo.insert_request(&request).await.unwrap();

        // duplicate insert rejected
        assert!(repo.insert_request(&request).await.is_err());

        let mut loaded = repo.get_request(request.id).await.unwrap().unwrap();
        loaded.status = MixStatus::Deposited;
        repo.update_request(&loaded).await.unwrap();
        assert_eq!(
            repo.get_request(request.id).await.unwrap().unwrap().status,
            MixStatus::Deposited
        );

        let deposited = repo
            .list_requests_by_status(MixStatus::Deposited)
            .await
            .unwrap();
        assert_eq!(deposited.len(), 1);
    }

    #[tokio::test]
    async fn test_exists_by_address_probe() {
        let repo = InMemoryRepository::new();
        let request = test_request();
        repo.insert_request(&request).await.unwrap();
        let addr = DepositAddress {
            id: Uuid::new_v4(),
            mix_request_id: request.id,
            currency: Currency::Btc,
            address: "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq".into(),
            private_key_ciphertext: "ct".into(),
            derivation_path: Some("m/44'/0'/0'/0/0".into()),
            address_index: 0,
            used: false,
            first_used_at: None,
            created_at: chrono::Utc::now(),
        };
        repo.insert_deposit_address(&addr).await.unwrap();

        assert!(repo
            .exists_by_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq")
            .await
            .unwrap());
        assert!(!repo.exists_by_address("missing").await.unwrap());
        assert_eq!(
            repo.find_request_by_address("bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq")
                .await
                .unwrap(),
            Some(request.id)
        );
    }

    #[tokio::test]
    async fn test_atomic_debit_conditions() {
        let repo = InMemoryRepository::new();
        let wallet = test_wallet(1.0);
        repo.insert_wallet(&wallet).await.unwrap();

        match repo.atomic_debit(wallet.id, 0.4).await.unwrap() {
            DebitOutcome::Applied(balance) => assert!((balance - 0.6).abs() < 1e-9),
            DebitOutcome::NotApplied => panic!("debit should apply"),
        }

        // insufficient balance
        assert_eq!(
            repo.atomic_debit(wallet.id, 10.0).await.unwrap(),
            DebitOutcome::NotApplied
        );

        // locked wallet never debits
        let mut locked = repo.get_wallet(wallet.id).await.unwrap().unwrap();
        locked.is_locked = true;
        repo.update_wallet(&locked).await.unwrap();
        assert_eq!(
            repo.atomic_debit(wallet.id, 0.1).await.unwrap(),
            DebitOutcome::NotApplied
        );

        // unknown wallet is a no-row match, not an error
        assert_eq!(
            repo.atomic_debit(Uuid::new_v4(), 0.1).await.unwrap(),
            DebitOutcome::NotApplied
        );
    }

    #[tokio::test]
    async fn test_atomic_debit_under_contention() {
        let repo = InMemoryRepository::new();
        let wallet = test_wallet(1.0);
        repo.insert_wallet(&wallet).await.unwrap();

        let (a, b) = tokio::join!(
            repo.atomic_debit(wallet.id, 0.7),
            repo.atomic_debit(wallet.id, 0.7)
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, DebitOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1);

        let balance = repo.get_wallet_balance(wallet.id).await.unwrap().unwrap();
        assert!((balance - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_batch_update_is_all_or_nothing() {
        let repo = InMemoryRepository::new();
        let w1 = test_wallet(1.0);
        let w2 = test_wallet(2.0);
        repo.insert_wallet(&w1).await.unwrap();
        repo.insert_wallet(&w2).await.unwrap();

        // one bad id fails the whole batch
        let bad = vec![(w1.id, 5.0), (Uuid::new_v4(), 1.0)];
        assert!(repo.batch_update_balances(&bad).await.is_err());
        assert_eq!(
            repo.get_wallet_balance(w1.id).await.unwrap().unwrap(),
            1.0
        );

        let good = vec![(w1.id, 5.0), (w2.id, 6.0)];
        repo.batch_update_balances(&good).await.unwrap();
        assert_eq!(
            repo.get_wallet_balance(w1.id).await.unwrap().unwrap(),
            5.0
        );
        assert_eq!(
            repo.get_wallet_balance(w2.id).await.unwrap().unwrap(),
            6.0
        );
    }

    #[tokio::test]
    async fn test_key_image_insert_if_absent() {
        let repo = InMemoryRepository::new();
        assert!(repo.insert_key_image("aabb").await.unwrap());
        assert!(!repo.insert_key_image("aabb").await.unwrap());
        assert_eq!(repo.load_key_images().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duration_percentiles_window() {
        let repo = InMemoryRepository::new();
        for ms in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0] {
            repo.record_operation("sign", ms, true).await.unwrap();
        }
        repo.record_operation("broadcast", 500.0, false).await.unwrap();
        assert_eq!(repo.failed_operation_count().await, 1);

        let now = chrono::Utc::now();
        let stats = repo
            .duration_percentiles(
                "sign",
                now - chrono::Duration::minutes(1),
                now + chrono::Duration::minutes(1),
            )
            .await
            .unwrap();
        assert_eq!(stats.samples, 10);
        assert!(stats.p50 >= 50.0 && stats.p50 <= 60.0);
        assert!(stats.p99 >= 90.0);

        // half-open window excludes everything in the past
        let empty = repo
            .duration_percentiles(
                "sign",
                now - chrono::Duration::hours(2),
                now - chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(empty.samples, 0);
    }

    #[tokio::test]
    async fn test_business_metrics_aggregation() {
        let repo = InMemoryRepository::new();
        let mut completed = test_request();
        completed.status = MixStatus::Completed;
        let pending = test_request();
        repo.insert_request(&completed).await.unwrap();
        repo.insert_request(&pending).await.unwrap();

        let metrics = repo.business_metrics().await.unwrap();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.completed_requests, 1);
        assert_eq!(metrics.active_requests, 1);
        assert!(
            (metrics.volume_by_currency.get(&Currency::Btc).unwrap() - 1.0).abs() < 1e-9
        );
    }

    #[tokio::test]
    async fn test_audit_append_and_recent() {
        let repo = InMemoryRepository::new();
        for i in 0..5 {
            repo.append_audit(AuditEntry::new(
                AuditLevel::Info,
                "test",
                format!("entry {i}"),
                None,
            ))
            .await
            .unwrap();
        }
        let recent = repo.recent_audit(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].message, "entry 4");
    }
}
