// src/repository/mod.rs
pub mod memory;

pub use memory::InMemoryRepository;

use crate::error::MixerResult;
use crate::types::{
    Currency, DepositAddress, MixRequest, MixStatus, OutputTransaction, Wallet,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Severity of an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuditLevel {
    Info,
    Warning,
    Critical,
}

/// Immutable audit record. Appended fire-and-forget; a failed append never
/// fails the operation that produced it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub level: AuditLevel,
    pub action: String,
    pub message: String,
    pub entity_id: Option<Uuid>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AuditEntry {
    pub fn new(level: AuditLevel, action: &str, message: String, entity_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            level,
            action: action.to_string(),
            message,
            entity_id,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Duration percentiles over a half-open time window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationPercentiles {
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub samples: usize,
}

/// Aggregate business counters consumed by the monitoring collectors.
#[derive(Debug, Clone, Default)]
pub struct BusinessMetrics {
    pub total_requests: usize,
    pub active_requests: usize,
    pub completed_requests: usize,
    pub failed_requests: usize,
    pub blocked_requests: usize,
    pub volume_by_currency: std::collections::HashMap<Currency, f64>,
}

/// Result of the conditional atomic debit. Mirrors the single-row update:
/// zero or one rows touched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DebitOutcome {
    /// Row matched and was updated; carries the new balance.
    Applied(f64),
    /// No row matched the debit condition.
    NotApplied,
}

/// Durable projection consumed by the core. Implementations must provide
/// transactional batch updates and the two specialised queries (existence
/// probe, conditional debit); everything else is plain CRUD.
#[async_trait]
pub trait Repository: Send + Sync {
    // -- mix requests -------------------------------------------------------

    async fn insert_request(&self, request: &MixRequest) -> MixerResult<()>;

    async fn get_request(&self, id: Uuid) -> MixerResult<Option<MixRequest>>;

    async fn update_request(&self, request: &MixRequest) -> MixerResult<()>;

    async fn delete_request(&self, id: Uuid) -> MixerResult<()>;

    async fn list_requests_by_status(&self, status: MixStatus) -> MixerResult<Vec<MixRequest>>;

    /// Count of requests a user created for a currency since the given
    /// instant; backs the daily-cap check.
    async fn count_user_requests_since(
        &self,
        user_id: &str,
        currency: Currency,
        since: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<u32>;

    /// Requests a user created since the instant, newest first; feeds the
    /// behavioural pattern analysis.
    async fn list_user_requests(
        &self,
        user_id: &str,
        since: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<Vec<MixRequest>>;

    // -- deposit addresses --------------------------------------------------

    async fn insert_deposit_address(&self, address: &DepositAddress) -> MixerResult<()>;

    async fn get_deposit_address(&self, mix_request_id: Uuid)
        -> MixerResult<Option<DepositAddress>>;

    /// EXISTS probe; must not materialise the row.
    async fn exists_by_address(&self, address: &str) -> MixerResult<bool>;

    /// Weak reverse lookup from a watched address to its owning request.
    async fn find_request_by_address(&self, address: &str) -> MixerResult<Option<Uuid>>;

    async fn update_deposit_address(&self, address: &DepositAddress) -> MixerResult<()>;

    // -- wallets ------------------------------------------------------------

    async fn insert_wallet(&self, wallet: &Wallet) -> MixerResult<()>;

    /// EXISTS probe on the wallet address column.
    async fn wallet_exists_by_address(&self, address: &str) -> MixerResult<bool>;

    async fn get_wallet(&self, id: Uuid) -> MixerResult<Option<Wallet>>;

    /// Single-column balance read backing the wallet cache.
    async fn get_wallet_balance(&self, id: Uuid) -> MixerResult<Option<f64>>;

    async fn update_wallet(&self, wallet: &Wallet) -> MixerResult<()>;

    async fn list_wallets(&self, currency: Currency) -> MixerResult<Vec<Wallet>>;

    /// Conditional update: debit succeeds only while
    /// `balance >= amount AND is_active AND NOT is_locked`.
    async fn atomic_debit(&self, id: Uuid, amount: f64) -> MixerResult<DebitOutcome>;

    /// CASE-style set-based update applied in a single transaction.
    async fn batch_update_balances(&self, updates: &[(Uuid, f64)]) -> MixerResult<()>;

    // -- output transactions ------------------------------------------------

    async fn insert_output_tx(&self, tx: &OutputTransaction) -> MixerResult<()>;

    async fn update_output_tx(&self, tx: &OutputTransaction) -> MixerResult<()>;

    async fn list_output_txs(&self, mix_request_id: Uuid) -> MixerResult<Vec<OutputTransaction>>;

    // -- key images & bans --------------------------------------------------

    /// Insert-if-absent; returns true when this call inserted the image.
    async fn insert_key_image(&self, image_hex: &str) -> MixerResult<bool>;

    async fn load_key_images(&self) -> MixerResult<Vec<String>>;

    async fn upsert_ban(
        &self,
        participant_id: &str,
        until: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<()>;

    async fn load_bans(&self) -> MixerResult<Vec<(String, chrono::DateTime<chrono::Utc>)>>;

    async fn delete_ban(&self, participant_id: &str) -> MixerResult<()>;

    // -- audit & operation logs ---------------------------------------------

    async fn append_audit(&self, entry: AuditEntry) -> MixerResult<()>;

    async fn recent_audit(&self, limit: usize) -> MixerResult<Vec<AuditEntry>>;

    async fn record_operation(&self, operation: &str, duration_ms: f64, success: bool)
        -> MixerResult<()>;

    /// p50/p90/p99 of operation durations within `[from, to)`.
    async fn duration_percentiles(
        &self,
        operation: &str,
        from: chrono::DateTime<chrono::Utc>,
        to: chrono::DateTime<chrono::Utc>,
    ) -> MixerResult<DurationPercentiles>;

    // -- aggregations -------------------------------------------------------

    async fn business_metrics(&self) -> MixerResult<BusinessMetrics>;
}
