// src/chain.rs
use crate::error::{MixerError, MixerResult};
use crate::types::Currency;
use async_trait::async_trait;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use tokio::sync::{mpsc, RwLock};

/// Observed deposit to a watched address.
#[derive(Debug, Clone)]
pub struct DepositEvent {
    pub address: String,
    pub txid: String,
    pub amount: f64,
    pub confirmations: u64,
    pub block_height: u64,
}

/// On-chain transaction view, as much of it as the coordinator needs.
#[derive(Debug, Clone)]
pub struct ChainTransaction {
    pub txid: String,
    pub confirmations: u64,
    pub block_height: Option<u64>,
    pub raw: Vec<u8>,
}

/// Abstract per-currency node client. Implementations wrap the real RPC
/// endpoints; tests use `MockChainClient`.
#[async_trait]
pub trait BlockchainClient: Send + Sync {
    fn currency(&self) -> Currency;

    async fn broadcast(&self, raw_tx: &[u8]) -> MixerResult<String>;

    async fn get_transaction(&self, txid: &str) -> MixerResult<Option<ChainTransaction>>;

    async fn get_confirmations(&self, txid: &str) -> MixerResult<u64>;

    async fn get_block_height(&self) -> MixerResult<u64>;

    /// Streams (txid, amount, confirmations) for the address. The receiver
    /// side is owned by the engine's deposit watcher.
    async fn subscribe_address(&self, address: &str) -> MixerResult<mpsc::Receiver<DepositEvent>>;
}

// ---------------------------------------------------------------------------
// Address validation
// ---------------------------------------------------------------------------

fn btc_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[13][a-km-zA-HJ-NP-Z1-9]{25,34}$|^bc1[a-z0-9]{39,59}$")
            .unwrap_or_else(|e| panic!("btc address regex: {e}"))
    })
}

fn eth_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^0x[a-fA-F0-9]{40}$").unwrap_or_else(|e| panic!("eth address regex: {e}"))
    })
}

fn trc20_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^T[A-Za-z1-9]{33}$").unwrap_or_else(|e| panic!("trc20 address regex: {e}"))
    })
}

fn sol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{32,44}$")
            .unwrap_or_else(|e| panic!("sol address regex: {e}"))
    })
}

fn derivation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^m(/\d+'?)*$").unwrap_or_else(|e| panic!("derivation path regex: {e}"))
    })
}

/// Exact per-currency address format check.
pub fn is_valid_address(currency: Currency, address: &str) -> bool {
    match currency {
        Currency::Btc => btc_regex().is_match(address),
        Currency::Eth | Currency::UsdtErc20 => eth_regex().is_match(address),
        Currency::UsdtTrc20 => trc20_regex().is_match(address),
        Currency::Sol => sol_regex().is_match(address),
    }
}

pub fn validate_address(currency: Currency, address: &str) -> MixerResult<()> {
    if is_valid_address(currency, address) {
        Ok(())
    } else {
        Err(MixerError::InvalidAddress {
            currency: currency.code().to_string(),
            address: address.to_string(),
        })
    }
}

pub fn validate_derivation_path(path: &str) -> MixerResult<()> {
    if derivation_regex().is_match(path) {
        Ok(())
    } else {
        Err(MixerError::InvalidDerivationPath(path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockChainState {
    height: u64,
    transactions: HashMap<String, ChainTransaction>,
    subscribers: HashMap<String, Vec<mpsc::Sender<DepositEvent>>>,
    broadcast_failures: u32,
}

/// Scriptable chain client used by tests and the demo. Deposits are injected
/// with `confirm_deposit`; broadcast failures with `fail_next_broadcasts`.
#[derive(Clone)]
pub struct MockChainClient {
    currency: Currency,
    state: Arc<RwLock<MockChainState>>,
}

impl MockChainClient {
    pub fn new(currency: Currency) -> Self {
        Self {
            currency,
            state: Arc::new(RwLock::new(MockChainState {
                height: 800_000,
                ..Default::default()
            })),
        }
    }

    pub async fn set_height(&self, height: u64) {
        self.state.write().await.height = height;
    }

    /// Makes the next `n` broadcast calls fail with a transient error.
    pub async fn fail_next_broadcasts(&self, n: u32) {
        self.state.write().await.broadcast_failures = n;
    }

    /// Injects a confirmed deposit and notifies any address subscriber.
    pub async fn confirm_deposit(&self, address: &str, txid: &str, amount: f64, confirmations: u64) {
        let mut state = self.state.write().await;
        let height = state.height;
        state.transactions.insert(
            txid.to_string(),
            ChainTransaction {
                txid: txid.to_string(),
                confirmations,
                block_height: Some(height),
                raw: Vec::new(),
            },
        );
        let event = DepositEvent {
            address: address.to_string(),
            txid: txid.to_string(),
            amount,
            confirmations,
            block_height: height,
        };
        if let Some(senders) = state.subscribers.get(address) {
            for tx in senders {
                let _ = tx.try_send(event.clone());
            }
        }
    }

    /// Bumps the confirmation count of an existing transaction.
    pub async fn advance_confirmations(&self, txid: &str, confirmations: u64) {
        let mut state = self.state.write().await;
        if let Some(tx) = state.transactions.get_mut(txid) {
            tx.confirmations = confirmations;
        }
    }
}

#[async_trait]
impl BlockchainClient for MockChainClient {
    fn currency(&self) -> Currency {
        self.currency
    }

    async fn broadcast(&self, raw_tx: &[u8]) -> MixerResult<String> {
        let mut state = self.state.write().await;
        if state.broadcast_failures > 0 {
            state.broadcast_failures -= 1;
            return Err(MixerError::Chain("broadcast rejected by node".to_string()));
        }
        let txid = hex::encode(Sha256::digest(raw_tx));
        let height = state.height;
        state.transactions.insert(
            txid.clone(),
            ChainTransaction {
                txid: txid.clone(),
                confirmations: 1,
                block_height: Some(height),
                raw: raw_tx.to_vec(),
            },
        );
        Ok(txid)
    }

    async fn get_transaction(&self, txid: &str) -> MixerResult<Option<ChainTransaction>> {
        Ok(self.state.read().await.transactions.get(txid).cloned())
    }

    async fn get_confirmations(&self, txid: &str) -> MixerResult<u64> {
        Ok(self
            .state
            .read()
            .await
            .transactions
            .get(txid)
            .map(|t| t.confirmations)
            .unwrap_or(0))
    }

    async fn get_block_height(&self) -> MixerResult<u64> {
        Ok(self.state.read().await.height)
    }

    async fn subscribe_address(&self, address: &str) -> MixerResult<mpsc::Receiver<DepositEvent>> {
        let (tx, rx) = mpsc::channel(64);
        self.state
            .write()
            .await
            .subscribers
            .entry(address.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_btc_addresses() {
        assert!(is_valid_address(
            Currency::Btc,
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"
        ));
        assert!(is_valid_address(
            Currency::Btc,
            "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"
        ));
        assert!(is_valid_address(
            Currency::Btc,
            "bc1qar0srrr7xfkvy5l643lydnw9re59gtzzwf5mdq"
        ));
        // 'l' is excluded from base58
        assert!(!is_valid_address(
            Currency::Btc,
            "1A1zP1eP5QGefi2DMPTfTl5SLmv7DivfNa"
        ));
        assert!(!is_valid_address(Currency::Btc, "bc2qqqqq"));
    }

    #[test]
    fn test_eth_addresses() {
        assert!(is_valid_address(
            Currency::Eth,
            "0x742d35Cc6634C0532925a3b8d4C9db4CA4b4c73f"
        ));
        assert!(is_valid_address(
            Currency::UsdtErc20,
            "0x742d35Cc6634C0532925a3b8d4C9db4CA4b4c73f"
        ));
        assert!(!is_valid_address(Currency::Eth, "0x742d35Cc"));
        assert!(!is_valid_address(
            Currency::Eth,
            "742d35Cc6634C0532925a3b8d4C9db4CA4b4c73f"
        ));
    }

    #[test]
    fn test_trc20_and_sol_addresses() {
        assert!(is_valid_address(
            Currency::UsdtTrc20,
            "TJRabPrwbZy45sbavfcjinPJC18kjpRTv8"
        ));
        assert!(!is_valid_address(
            Currency::UsdtTrc20,
            "JRabPrwbZy45sbavfcjinPJC18kjpRTv8"
        ));
        assert!(is_valid_address(
            Currency::Sol,
            "4Nd1mYdtUes3i3HWLJsfhhAfdqEqYCVtGBvrmyGGsTDh"
        ));
        assert!(!is_valid_address(Currency::Sol, "short"));
    }

    #[test]
    fn test_derivation_paths() {
        assert!(validate_derivation_path("m").is_ok());
        assert!(validate_derivation_path("m/44'/0'/0'/0/5").is_ok());
        assert!(validate_derivation_path("m/0/1/2").is_ok());
        assert!(validate_derivation_path("n/44'").is_err());
        assert!(validate_derivation_path("m/44''").is_err());
    }

    #[tokio::test]
    async fn test_mock_broadcast_and_lookup() {
        let chain = MockChainClient::new(Currency::Btc);
        let txid = chain.broadcast(b"rawtx").await.unwrap();
        let tx = chain.get_transaction(&txid).await.unwrap().unwrap();
        assert_eq!(tx.confirmations, 1);

        chain.advance_confirmations(&txid, 6).await;
        assert_eq!(chain.get_confirmations(&txid).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn test_mock_subscription() {
        let chain = MockChainClient::new(Currency::Eth);
        let mut rx = chain.subscribe_address("0xabc").await.unwrap();
        chain.confirm_deposit("0xabc", "tx1", 1.5, 12).await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.txid, "tx1");
        assert_eq!(event.confirmations, 12);
        assert!((event.amount - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_mock_broadcast_failure_injection() {
        let chain = MockChainClient::new(Currency::Btc);
        chain.fail_next_broadcasts(1).await;
        assert!(chain.broadcast(b"tx").await.is_err());
        assert!(chain.broadcast(b"tx").await.is_ok());
    }
}
