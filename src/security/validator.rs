// src/security/validator.rs
use crate::chain::is_valid_address;
use crate::error::MixerResult;
use crate::repository::Repository;
use crate::types::{Currency, MixOutput, SecurityConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Flags attached to a validation report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RiskFlag {
    Blacklisted,
    Sanctions,
    ExchangeAddress,
    HighVelocity,
    AmountPattern,
    TimingPattern,
    AddressReuse,
    RoundAmount,
    Structuring,
    DailyLimitExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    fn from_score(score: f64) -> Self {
        if score >= 75.0 {
            RiskLevel::Critical
        } else if score >= 50.0 {
            RiskLevel::High
        } else if score >= 25.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Outcome of the pre-flight pipeline. Score is bounded to [0, 100].
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub score: f64,
    pub risk_level: RiskLevel,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub flags: Vec<RiskFlag>,
    pub flagged: bool,
    pub requires_manual_review: bool,
    pub auto_reject: bool,
}

impl ValidationReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_flag(&self, flag: RiskFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// The request view the validator scores; built before the request row
/// exists.
#[derive(Debug, Clone)]
pub struct ValidationInput {
    pub currency: Currency,
    pub amount: f64,
    pub outputs: Vec<MixOutput>,
    pub user_id: Option<String>,
}

/// Pre-flight risk scoring. Stages run in a fixed order: basic parameters,
/// transaction limits, address reputation, behavioural patterns, KYT
/// baseline, AML heuristics. Each hard error contributes +25, each warning
/// +10, on top of the KYT base and reputation adjustments.
#[derive(Clone)]
pub struct SecurityValidator {
    repository: Arc<dyn Repository>,
    config: SecurityConfig,
    blacklist: Arc<RwLock<HashSet<String>>>,
    whitelist: Arc<RwLock<HashSet<String>>>,
    sanctions: Arc<RwLock<HashSet<String>>>,
    exchanges: Arc<RwLock<HashSet<String>>>,
}

struct Tally {
    score: f64,
    errors: Vec<String>,
    warnings: Vec<String>,
    flags: Vec<RiskFlag>,
    /// Blacklist/sanctions force the score to the ceiling regardless of
    /// other adjustments.
    pinned_to_max: bool,
    minimum_level: RiskLevel,
}

impl Tally {
    fn new() -> Self {
        Self {
            score: 0.0,
            errors: Vec::new(),
            warnings: Vec::new(),
            flags: Vec::new(),
            pinned_to_max: false,
            minimum_level: RiskLevel::Low,
        }
    }

    fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    fn warning(&mut self, message: String, flag: Option<RiskFlag>) {
        self.warnings.push(message);
        if let Some(flag) = flag {
            self.flag(flag);
        }
    }

    fn flag(&mut self, flag: RiskFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }
}

impl SecurityValidator {
    pub fn new(repository: Arc<dyn Repository>, config: SecurityConfig) -> Self {
        Self {
            repository,
            config,
            blacklist: Arc::new(RwLock::new(HashSet::new())),
            whitelist: Arc::new(RwLock::new(HashSet::new())),
            sanctions: Arc::new(RwLock::new(HashSet::new())),
            exchanges: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub async fn add_blacklisted(&self, address: &str) {
        self.blacklist.write().await.insert(address.to_string());
    }

    pub async fn add_whitelisted(&self, address: &str) {
        self.whitelist.write().await.insert(address.to_string());
    }

    pub async fn add_sanctioned(&self, address: &str) {
        self.sanctions.write().await.insert(address.to_string());
    }

    pub async fn add_exchange(&self, address: &str) {
        self.exchanges.write().await.insert(address.to_string());
    }

    pub async fn validate(&self, input: &ValidationInput) -> MixerResult<ValidationReport> {
        let mut tally = Tally::new();

        self.check_basic(input, &mut tally);
        self.check_limits(input, &mut tally).await?;
        self.check_reputation(input, &mut tally).await;
        self.check_patterns(input, &mut tally).await?;
        self.apply_kyt_baseline(input, &mut tally);
        self.check_aml(input, &mut tally);

        let mut score = tally.score
            + 25.0 * tally.errors.len() as f64
            + 10.0 * tally.warnings.len() as f64;
        score = score.clamp(0.0, 100.0);
        if tally.pinned_to_max {
            score = 100.0;
        }

        let mut risk_level = RiskLevel::from_score(score);
        if risk_level < tally.minimum_level {
            risk_level = tally.minimum_level;
        }

        let report = ValidationReport {
            score,
            risk_level,
            flagged: score >= self.config.risk_score_threshold,
            requires_manual_review: score >= self.config.require_manual_review,
            auto_reject: score >= self.config.auto_reject_threshold,
            errors: tally.errors,
            warnings: tally.warnings,
            flags: tally.flags,
        };
        if report.flagged {
            log::warn!(
                "request flagged: score={:.1} flags={:?}",
                report.score,
                report.flags
            );
        }
        Ok(report)
    }

    fn check_basic(&self, input: &ValidationInput, tally: &mut Tally) {
        if !input.amount.is_finite() || input.amount <= 0.0 {
            tally.error(format!("amount must be positive, got {}", input.amount));
        }
        if input.outputs.is_empty() {
            tally.error("at least one output is required".into());
        }
        if input.outputs.len() > 10 {
            tally.error(format!("too many outputs: {}", input.outputs.len()));
        }
        let total: f64 = input.outputs.iter().map(|o| o.percentage).sum();
        if (total - 100.0).abs() > 1e-9 {
            tally.error(format!("output percentages sum to {total}, expected 100"));
        }
        for output in &input.outputs {
            if output.percentage <= 0.0 {
                tally.error(format!(
                    "output {} has non-positive percentage",
                    output.address
                ));
            }
            if !is_valid_address(input.currency, &output.address) {
                tally.error(format!(
                    "address {} is not a valid {} address",
                    output.address, input.currency
                ));
            }
        }
        let unique: HashSet<&str> = input.outputs.iter().map(|o| o.address.as_str()).collect();
        if unique.len() != input.outputs.len() {
            tally.warning("duplicate output addresses".into(), None);
        }
    }

    async fn check_limits(&self, input: &ValidationInput, tally: &mut Tally) -> MixerResult<()> {
        let (min, max) = input.currency.transaction_limits();
        if input.amount < min || input.amount > max {
            tally.error(format!(
                "amount {} outside limits [{min}, {max}] for {}",
                input.amount, input.currency
            ));
        }
        if let Some(user_id) = &input.user_id {
            let since = chrono::Utc::now() - chrono::Duration::hours(24);
            let count = self
                .repository
                .count_user_requests_since(user_id, input.currency, since)
                .await?;
            if count >= input.currency.daily_limit() {
                tally.error(format!(
                    "daily limit of {} {} requests reached",
                    input.currency.daily_limit(),
                    input.currency
                ));
                tally.flag(RiskFlag::DailyLimitExceeded);
            }
        }
        Ok(())
    }

    async fn check_reputation(&self, input: &ValidationInput, tally: &mut Tally) {
        let blacklist = self.blacklist.read().await;
        let whitelist = self.whitelist.read().await;
        let sanctions = self.sanctions.read().await;
        let exchanges = self.exchanges.read().await;

        for output in &input.outputs {
            if sanctions.contains(&output.address) {
                tally.flag(RiskFlag::Sanctions);
                tally.pinned_to_max = true;
                tally.error(format!("address {} is sanctioned", output.address));
            }
            if blacklist.contains(&output.address) {
                tally.flag(RiskFlag::Blacklisted);
                tally.pinned_to_max = true;
                tally.error(format!("address {} is blacklisted", output.address));
            }
            if exchanges.contains(&output.address) {
                tally.flag(RiskFlag::ExchangeAddress);
                tally.score += 30.0;
                if tally.minimum_level < RiskLevel::Medium {
                    tally.minimum_level = RiskLevel::Medium;
                }
            }
            if whitelist.contains(&output.address) {
                // floor-clamped later by the [0, 100] bound
                tally.score -= 50.0;
            }
        }
    }

    async fn check_patterns(&self, input: &ValidationInput, tally: &mut Tally) -> MixerResult<()> {
        let user_id = match &input.user_id {
            Some(id) => id,
            None => return Ok(()),
        };
        let since = chrono::Utc::now() - chrono::Duration::hours(24);
        let history = self.repository.list_user_requests(user_id, since).await?;
        if history.is_empty() {
            return Ok(());
        }

        let hour_ago = chrono::Utc::now() - chrono::Duration::hours(1);
        let last_hour = history.iter().filter(|r| r.created_at >= hour_ago).count();
        if last_hour >= 5 {
            tally.warning(
                format!("{last_hour} requests in the last hour"),
                Some(RiskFlag::HighVelocity),
            );
        }

        let repeats = history
            .iter()
            .filter(|r| (r.input_amount - input.amount).abs() < 1e-9)
            .count();
        if repeats >= 3 {
            tally.warning(
                format!("amount {} repeated {repeats} times today", input.amount),
                Some(RiskFlag::AmountPattern),
            );
        }

        // near-constant inter-arrival gaps look scripted
        if history.len() >= 4 {
            let mut gaps: Vec<f64> = history
                .windows(2)
                .map(|w| (w[0].created_at - w[1].created_at).num_seconds().abs() as f64)
                .collect();
            gaps.retain(|g| *g > 0.0);
            if gaps.len() >= 3 {
                let mean = gaps.iter().sum::<f64>() / gaps.len() as f64;
                let variance =
                    gaps.iter().map(|g| (g - mean).powi(2)).sum::<f64>() / gaps.len() as f64;
                if mean > 0.0 && variance.sqrt() / mean < 0.1 {
                    tally.warning(
                        "timing regularity across recent requests".into(),
                        Some(RiskFlag::TimingPattern),
                    );
                }
            }
        }

        let prior_addresses: HashSet<&str> = history
            .iter()
            .flat_map(|r| r.outputs.iter().map(|o| o.address.as_str()))
            .collect();
        if input
            .outputs
            .iter()
            .any(|o| prior_addresses.contains(o.address.as_str()))
        {
            tally.warning(
                "output address reused from an earlier request".into(),
                Some(RiskFlag::AddressReuse),
            );
        }
        Ok(())
    }

    /// Currency-weighted baseline plus an amount-proportional term.
    fn apply_kyt_baseline(&self, input: &ValidationInput, tally: &mut Tally) {
        let baseline = match input.currency {
            Currency::Btc => 10.0,
            Currency::Eth => 8.0,
            Currency::UsdtErc20 => 12.0,
            Currency::UsdtTrc20 => 15.0,
            Currency::Sol => 5.0,
        };
        let (_, max) = input.currency.transaction_limits();
        let proportional = (input.amount / max).clamp(0.0, 1.0) * 20.0;
        tally.score += baseline + proportional;
    }

    fn check_aml(&self, input: &ValidationInput, tally: &mut Tally) {
        // conspicuously round amounts
        if input.amount >= 1.0 && input.amount.fract().abs() < 1e-9 {
            tally.warning(
                format!("round amount {}", input.amount),
                Some(RiskFlag::RoundAmount),
            );
        }

        // structuring: riding just below the per-transaction ceiling
        let (_, max) = input.currency.transaction_limits();
        if input.amount >= max * 0.9 && input.amount < max {
            tally.warning(
                format!("amount {} within 10% of the {} ceiling", input.amount, max),
                Some(RiskFlag::Structuring),
            );
        }
    }
}
