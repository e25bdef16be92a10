// src/types.rs
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported currencies. USDT is tracked per network because the address
/// space and limits differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Btc,
    Eth,
    UsdtErc20,
    UsdtTrc20,
    Sol,
}

impl Currency {
    pub fn all() -> [Currency; 5] {
        [
            Currency::Btc,
            Currency::Eth,
            Currency::UsdtErc20,
            Currency::UsdtTrc20,
            Currency::Sol,
        ]
    }

    pub fn code(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Eth => "ETH",
            Currency::UsdtErc20 => "USDT_ERC20",
            Currency::UsdtTrc20 => "USDT_TRC20",
            Currency::Sol => "SOL",
        }
    }

    /// Per-transaction limits (min, max).
    pub fn transaction_limits(&self) -> (f64, f64) {
        match self {
            Currency::Btc => (0.001, 10.0),
            Currency::Eth => (0.01, 100.0),
            Currency::UsdtErc20 | Currency::UsdtTrc20 => (10.0, 100_000.0),
            Currency::Sol => (0.1, 1000.0),
        }
    }

    /// Maximum mix requests per user per day.
    pub fn daily_limit(&self) -> u32 {
        match self {
            Currency::Btc => 5,
            Currency::Eth => 10,
            Currency::UsdtErc20 | Currency::UsdtTrc20 => 20,
            Currency::Sol => 15,
        }
    }

    /// Standard CoinJoin denominations, ascending.
    pub fn denominations(&self) -> &'static [f64] {
        match self {
            Currency::Btc => &[0.001, 0.01, 0.1, 1.0, 10.0],
            Currency::Eth => &[0.1, 1.0, 10.0, 100.0],
            Currency::UsdtErc20 | Currency::UsdtTrc20 => {
                &[100.0, 1000.0, 10_000.0, 100_000.0]
            }
            Currency::Sol => &[1.0, 10.0, 100.0, 1000.0],
        }
    }

    /// Largest standard denomination that fits under `amount`, if any.
    pub fn best_denomination(&self, amount: f64) -> Option<f64> {
        self.denominations()
            .iter()
            .rev()
            .copied()
            .find(|d| *d <= amount)
    }

    /// Confirmations required before a deposit is credited.
    pub fn required_confirmations(&self) -> u64 {
        match self {
            Currency::Btc => 3,
            Currency::Eth | Currency::UsdtErc20 => 12,
            Currency::UsdtTrc20 => 19,
            Currency::Sol => 32,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Mix request lifecycle states. Terminal: Completed, Cancelled, Failed,
/// Blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MixStatus {
    Pending,
    Deposited,
    Pooling,
    Mixing,
    Completing,
    Completed,
    Cancelled,
    Failed,
    Blocked,
}

impl MixStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MixStatus::Completed | MixStatus::Cancelled | MixStatus::Failed | MixStatus::Blocked
        )
    }

    /// Whitelist of valid transitions. Everything else is an invariant
    /// violation.
    pub fn can_transition_to(&self, next: MixStatus) -> bool {
        use MixStatus::*;
        match (self, next) {
            (Pending, Deposited) => true,
            (Pending, Cancelled) => true,
            (Pending, Failed) => true,
            (Pending, Blocked) => true,
            (Deposited, Pooling) => true,
            (Deposited, Cancelled) => true,
            (Pooling, Mixing) => true,
            (Mixing, Completing) => true,
            (Completing, Completed) => true,
            (Mixing, Failed) => true,
            // retry budget exhaustion can fail any live state
            (Deposited, Failed) | (Pooling, Failed) | (Completing, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MixStatus::Pending => "PENDING",
            MixStatus::Deposited => "DEPOSITED",
            MixStatus::Pooling => "POOLING",
            MixStatus::Mixing => "MIXING",
            MixStatus::Completing => "COMPLETING",
            MixStatus::Completed => "COMPLETED",
            MixStatus::Cancelled => "CANCELLED",
            MixStatus::Failed => "FAILED",
            MixStatus::Blocked => "BLOCKED",
        }
    }
}

/// Mixing algorithm assigned when a request leaves the deposit pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixAlgorithm {
    CoinJoin,
    Ring,
    Stealth,
}

/// One user-supplied output leg: destination plus the share of the deposit it
/// receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixOutput {
    pub address: String,
    pub percentage: f64,
}

/// A mixing request. Owns its deposit address and output transactions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: Uuid,
    pub currency: Currency,
    pub input_amount: f64,
    pub outputs: Vec<MixOutput>,
    pub status: MixStatus,
    pub algorithm: Option<MixAlgorithm>,
    pub deposit_txid: Option<String>,
    pub deposit_block_height: Option<u64>,
    pub deposit_confirmed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub error_message: Option<String>,
    pub user_id: Option<String>,
    pub pending_review: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl MixRequest {
    /// Sum of output percentages; the engine requires this to be exactly 100.
    pub fn percentage_total(&self) -> f64 {
        self.outputs.iter().map(|o| o.percentage).sum()
    }
}

/// Deposit address generated for a single mix request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    pub id: Uuid,
    pub mix_request_id: Uuid,
    pub currency: Currency,
    pub address: String,
    /// AES-256-GCM ciphertext of the hex private key, base64-encoded together
    /// with its nonce.
    pub private_key_ciphertext: String,
    pub derivation_path: Option<String>,
    pub address_index: u32,
    pub used: bool,
    pub first_used_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WalletType {
    Hot,
    Cold,
    Pool,
    Multisig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletStatus {
    Active,
    Archived,
    Locked,
}

/// A custodied wallet. Balance mutations go through WalletManager only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub currency: Currency,
    pub wallet_type: WalletType,
    pub address: String,
    pub balance: f64,
    pub is_active: bool,
    pub is_locked: bool,
    pub status: WalletStatus,
    pub last_used_at: chrono::DateTime<chrono::Utc>,
    pub last_balance_update: chrono::DateTime<chrono::Utc>,
    pub usage_count: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTxStatus {
    Pending,
    Signed,
    Broadcast,
    Confirmed,
    Failed,
}

/// One scheduled payout leg of a mix request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTransaction {
    pub id: Uuid,
    pub mix_request_id: Uuid,
    pub output_index: usize,
    pub address: String,
    pub amount: f64,
    pub scheduled_at: chrono::DateTime<chrono::Utc>,
    pub status: OutputTxStatus,
    pub txid: Option<String>,
    pub attempts: u32,
}

/// Event emitted on every request state transition, in lifecycle order.
#[derive(Debug, Clone)]
pub struct MixEvent {
    pub request_id: Uuid,
    pub from: MixStatus,
    pub to: MixStatus,
    pub at: chrono::DateTime<chrono::Utc>,
}

// ---------------------------------------------------------------------------
// Configuration records. These replace the dynamic config objects of the
// upstream service with explicit, typed records.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on POOLING -> MIXING transitions in flight.
    pub max_concurrent_mixes: usize,
    /// How long a PENDING request waits for its deposit.
    pub deposit_timeout: chrono::Duration,
    /// Retry budget per external interaction.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt.
    pub retry_base_delay_ms: u64,
    /// How often the scheduler scans for work.
    pub tick_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_mixes: 10,
            deposit_timeout: chrono::Duration::hours(24),
            max_retries: 5,
            retry_base_delay_ms: 500,
            tick_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoinJoinConfig {
    pub min_participants: usize,
    pub max_participants: usize,
    pub registration_timeout_secs: u64,
    pub output_registration_timeout_secs: u64,
    pub signing_timeout_secs: u64,
    pub broadcast_timeout_secs: u64,
    pub coordinator_fee: f64,
    pub network_fee: f64,
    /// Schnorr per-input signatures when true, ECDSA otherwise.
    pub use_schnorr: bool,
    /// Require a signed challenge proving control of registered inputs.
    pub require_proof_of_funds: bool,
    pub ban_duration: chrono::Duration,
}

impl Default for CoinJoinConfig {
    fn default() -> Self {
        Self {
            min_participants: 3,
            max_participants: 20,
            registration_timeout_secs: 600,
            output_registration_timeout_secs: 600,
            signing_timeout_secs: 120,
            broadcast_timeout_secs: 60,
            coordinator_fee: 0.00005,
            network_fee: 0.00005,
            use_schnorr: true,
            require_proof_of_funds: false,
            ban_duration: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingAlgorithm {
    Mlsag,
    Clsag,
    Borromean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoyDistribution {
    Uniform,
    Triangular,
    Gamma,
}

#[derive(Debug, Clone)]
pub struct RingConfig {
    pub ring_size: usize,
    pub min_ring_size: usize,
    pub max_ring_size: usize,
    pub algorithm: RingAlgorithm,
    pub decoy_distribution: DecoyDistribution,
    /// Decoy age window in blocks.
    pub minimum_age: u64,
    pub maximum_age: u64,
    /// Attach range proofs and skip plaintext balance checks.
    pub confidential: bool,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_size: 11,
            min_ring_size: 7,
            max_ring_size: 64,
            algorithm: RingAlgorithm::Clsag,
            decoy_distribution: DecoyDistribution::Gamma,
            minimum_age: 10,
            maximum_age: 1000,
            confidential: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub risk_score_threshold: f64,
    pub require_manual_review: f64,
    pub auto_reject_threshold: f64,
    /// AES-256 key protecting deposit-address private keys at rest.
    pub encryption_key: [u8; 32],
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            risk_score_threshold: 75.0,
            require_manual_review: 85.0,
            auto_reject_threshold: 95.0,
            encryption_key: [0u8; 32],
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub system_interval_secs: u64,
    pub business_interval_secs: u64,
    pub security_interval_secs: u64,
    pub performance_interval_secs: u64,
    pub system_alert_interval_secs: u64,
    pub business_alert_interval_secs: u64,
    /// Capacity of the performance channel; 24 h at the 5 s cadence.
    pub performance_capacity: usize,
    pub series_ttl: chrono::Duration,
    pub notification_max_retries: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            system_interval_secs: 30,
            business_interval_secs: 60,
            security_interval_secs: 15,
            performance_interval_secs: 5,
            system_alert_interval_secs: 30,
            business_alert_interval_secs: 60,
            performance_capacity: 17_280,
            series_ttl: chrono::Duration::hours(24),
            notification_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Completed/cancelled requests older than this are deleted.
    pub request_retention: chrono::Duration,
    /// Terminal sessions are kept this long for audit.
    pub session_retention: chrono::Duration,
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            request_retention: chrono::Duration::days(30),
            session_retention: chrono::Duration::hours(24),
            sweep_interval_secs: 6 * 3600,
        }
    }
}

/// Top-level configuration handed to `MixingCoordinator::new`.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub engine: EngineConfig,
    pub coinjoin: CoinJoinConfig,
    pub ring: RingConfig,
    pub security: SecurityConfig,
    pub monitoring: MonitoringConfig,
    pub retention: RetentionConfig,
    pub hd_seed_phrase: Option<String>,
}
