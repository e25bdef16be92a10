// src/monitoring/mod.rs
pub mod alerts;
pub mod notify;
pub mod series;

pub use alerts::{Alert, AlertManager, AlertSeverity, AlertStatus};
pub use notify::{
    ChannelStats, EmailProvider, NotificationDispatcher, NotificationProvider, SlackProvider,
    TelegramProvider, WebhookProvider,
};
pub use series::{BoundedSeries, MetricPoint};

use crate::error::MixerResult;
use crate::repository::{AuditLevel, Repository};
use crate::types::MonitoringConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Soft watermark on total stored points before the memory-pressure alert
/// fires.
const SERIES_SOFT_WATERMARK: usize = 100_000;
/// Points kept per series after an emergency cleanup.
const EMERGENCY_FLOOR: usize = 32;

/// Bounded-memory telemetry: four channels sampled at their own cadences,
/// alert checks, and notification fan-out. Collector loops live in the
/// coordinator facade; this type owns the state they feed.
#[derive(Clone)]
pub struct MonitoringService {
    config: MonitoringConfig,
    repository: Arc<dyn Repository>,
    system: Arc<RwLock<BoundedSeries>>,
    business: Arc<RwLock<BoundedSeries>>,
    security: Arc<RwLock<BoundedSeries>>,
    performance: Arc<RwLock<BoundedSeries>>,
    alerts: Arc<RwLock<AlertManager>>,
    dispatcher: Arc<NotificationDispatcher>,
    started: Instant,
}

impl MonitoringService {
    pub fn new(
        config: MonitoringConfig,
        repository: Arc<dyn Repository>,
        dispatcher: NotificationDispatcher,
    ) -> Self {
        let ttl = config.series_ttl;
        // system/business/security run slower cadences and need less room
        let small = 8_192;
        Self {
            system: Arc::new(RwLock::new(BoundedSeries::new(small, ttl))),
            business: Arc::new(RwLock::new(BoundedSeries::new(small, ttl))),
            security: Arc::new(RwLock::new(BoundedSeries::new(small, ttl))),
            performance: Arc::new(RwLock::new(BoundedSeries::new(
                config.performance_capacity,
                ttl,
            ))),
            alerts: Arc::new(RwLock::new(AlertManager::new())),
            dispatcher: Arc::new(dispatcher),
            config,
            repository,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    // -- collectors ---------------------------------------------------------

    pub async fn collect_system(&self) {
        let uptime = self.started.elapsed().as_secs_f64();
        let stored_points = self.total_points().await as f64;
        let active_alerts = self.alerts.read().await.active_count() as f64;

        let mut system = self.system.write().await;
        system.record("uptime_secs", uptime);
        system.record("stored_metric_points", stored_points);
        system.record("active_alerts", active_alerts);
    }

    pub async fn collect_business(&self) {
        let metrics = match self.repository.business_metrics().await {
            Ok(m) => m,
            Err(e) => {
                log::warn!("business collector: {e}");
                return;
            }
        };
        let mut business = self.business.write().await;
        business.record("requests_total", metrics.total_requests as f64);
        business.record("requests_active", metrics.active_requests as f64);
        business.record("requests_completed", metrics.completed_requests as f64);
        business.record("requests_failed", metrics.failed_requests as f64);
        business.record("requests_blocked", metrics.blocked_requests as f64);
        for (currency, volume) in &metrics.volume_by_currency {
            business.record(&format!("volume_{}", currency.code()), *volume);
        }
    }

    pub async fn collect_security(&self) {
        let entries = match self.repository.recent_audit(200).await {
            Ok(e) => e,
            Err(e) => {
                log::warn!("security collector: {e}");
                return;
            }
        };
        let window = chrono::Utc::now() - chrono::Duration::minutes(15);
        let critical = entries
            .iter()
            .filter(|e| e.level == AuditLevel::Critical && e.timestamp >= window)
            .count() as f64;
        let warnings = entries
            .iter()
            .filter(|e| e.level == AuditLevel::Warning && e.timestamp >= window)
            .count() as f64;

        let mut security = self.security.write().await;
        security.record("critical_events_15m", critical);
        security.record("warning_events_15m", warnings);
    }

    pub async fn collect_performance(&self) {
        let now = chrono::Utc::now();
        let from = now - chrono::Duration::minutes(5);
        for operation in ["create", "sign", "broadcast", "mix"] {
            match self
                .repository
                .duration_percentiles(operation, from, now)
                .await
            {
                Ok(stats) if stats.samples > 0 => {
                    let mut performance = self.performance.write().await;
                    performance.record(&format!("{operation}_p50_ms"), stats.p50);
                    performance.record(&format!("{operation}_p90_ms"), stats.p90);
                    performance.record(&format!("{operation}_p99_ms"), stats.p99);
                }
                Ok(_) => {}
                Err(e) => log::warn!("performance collector ({operation}): {e}"),
            }
        }
    }

    // -- alert checks -------------------------------------------------------

    pub async fn check_system_alerts(&self) {
        let stored = self.total_points().await;
        if stored > SERIES_SOFT_WATERMARK {
            self.raise(
                "metric_memory_watermark",
                "monitoring",
                AlertSeverity::Warning,
                format!("{stored} stored points exceed the soft watermark"),
            )
            .await;
            self.prune_all().await;
        }
    }

    pub async fn check_business_alerts(&self) {
        let metrics = match self.repository.business_metrics().await {
            Ok(m) => m,
            Err(_) => return,
        };
        let finished = metrics.completed_requests + metrics.failed_requests;
        if finished >= 10 {
            let failure_rate = metrics.failed_requests as f64 / finished as f64;
            if failure_rate > 0.25 {
                self.raise(
                    "failure_rate",
                    "engine",
                    AlertSeverity::High,
                    format!("failure rate {:.0}%", failure_rate * 100.0),
                )
                .await;
            }
        }
    }

    /// Raises and fans out an alert, honouring duplicate suppression.
    pub async fn raise(
        &self,
        alert_type: &str,
        source: &str,
        severity: AlertSeverity,
        message: String,
    ) -> Option<Uuid> {
        let raised = self
            .alerts
            .write()
            .await
            .trigger(alert_type, source, severity, message);
        if let Some(id) = raised {
            let alert = self.alerts.read().await.get(id).cloned();
            if let Some(alert) = alert {
                self.dispatcher.dispatch(&alert).await;
            }
        }
        raised
    }

    pub async fn acknowledge(&self, id: Uuid) -> bool {
        self.alerts.write().await.acknowledge(id)
    }

    pub async fn resolve(&self, id: Uuid) -> bool {
        self.alerts.write().await.resolve(id)
    }

    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.alerts
            .read()
            .await
            .active()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn notification_stats(&self) -> std::collections::HashMap<String, ChannelStats> {
        self.dispatcher.stats().await
    }

    // -- maintenance --------------------------------------------------------

    pub async fn total_points(&self) -> usize {
        self.system.read().await.len()
            + self.business.read().await.len()
            + self.security.read().await.len()
            + self.performance.read().await.len()
    }

    pub async fn prune_all(&self) -> usize {
        self.system.write().await.prune_expired()
            + self.business.write().await.prune_expired()
            + self.security.write().await.prune_expired()
            + self.performance.write().await.prune_expired()
    }

    /// Memory-pressure response: drop every series to a small floor at once.
    pub async fn emergency_cleanup(&self) -> usize {
        let dropped = self.system.write().await.emergency_cleanup(EMERGENCY_FLOOR)
            + self.business.write().await.emergency_cleanup(EMERGENCY_FLOOR)
            + self.security.write().await.emergency_cleanup(EMERGENCY_FLOOR)
            + self
                .performance
                .write()
                .await
                .emergency_cleanup(EMERGENCY_FLOOR);
        if dropped > 0 {
            log::warn!("emergency cleanup dropped {dropped} metric points");
        }
        dropped
    }

    pub async fn prune_resolved_alerts(&self, retention: chrono::Duration) -> usize {
        self.alerts.write().await.prune_resolved(retention)
    }

    pub async fn latest(&self, channel: &str, metric: &str) -> Option<MetricPoint> {
        let series = match channel {
            "system" => &self.system,
            "business" => &self.business,
            "security" => &self.security,
            "performance" => &self.performance,
            _ => return None,
        };
        series.read().await.latest(metric)
    }

    pub async fn health_check(&self) -> MixerResult<()> {
        if self.total_points().await > SERIES_SOFT_WATERMARK * 2 {
            return Err(crate::error::MixerError::HealthCheck(
                "metric storage above hard watermark".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{AuditEntry, InMemoryRepository};
    use crate::types::{Currency, MixOutput, MixRequest, MixStatus};

    fn service() -> (MonitoringService, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let service = MonitoringService::new(
            MonitoringConfig::default(),
            repo.clone(),
            NotificationDispatcher::new(0),
        );
        (service, repo)
    }

    fn request_with_status(status: MixStatus) -> MixRequest {
        let now = chrono::Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::Btc,
            input_amount: 0.5,
            outputs: vec![MixOutput {
                address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa".into(),
                percentage: 100.0,
            }],
            status,
            algorithm: None,
            deposit_txid: None,
            deposit_block_height: None,
            deposit_confirmed_at: None,
            completed_at: None,
            error_message: None,
            user_id: None,
            pending_review: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_business_collector_records_counts() {
        let (service, repo) = service();
        repo.insert_request(&request_with_status(MixStatus::Completed))
            .await
            .unwrap();
        repo.insert_request(&request_with_status(MixStatus::Pending))
            .await
            .unwrap();

        service.collect_business().await;
        assert_eq!(
            service.latest("business", "requests_total").await.unwrap().value,
            2.0
        );
        assert_eq!(
            service
                .latest("business", "requests_completed")
                .await
                .unwrap()
                .value,
            1.0
        );
        assert!(service.latest("business", "volume_BTC").await.is_some());
    }

    #[tokio::test]
    async fn test_security_collector_counts_recent_criticals() {
        let (service, repo) = service();
        repo.append_audit(AuditEntry::new(
            AuditLevel::Critical,
            "request_failed",
            "boom".into(),
            None,
        ))
        .await
        .unwrap();

        service.collect_security().await;
        assert_eq!(
            service
                .latest("security", "critical_events_15m")
                .await
                .unwrap()
                .value,
            1.0
        );
    }

    #[tokio::test]
    async fn test_performance_collector_uses_percentiles() {
        let (service, repo) = service();
        for ms in [5.0, 10.0, 15.0, 20.0] {
            repo.record_operation("sign", ms, true).await.unwrap();
        }
        service.collect_performance().await;
        let p50 = service.latest("performance", "sign_p50_ms").await.unwrap();
        assert!(p50.value >= 5.0 && p50.value <= 20.0);
    }

    #[tokio::test]
    async fn test_failure_rate_alert() {
        let (service, repo) = service();
        for _ in 0..5 {
            repo.insert_request(&request_with_status(MixStatus::Failed))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            repo.insert_request(&request_with_status(MixStatus::Completed))
                .await
                .unwrap();
        }

        service.check_business_alerts().await;
        let active = service.active_alerts().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].alert_type, "failure_rate");

        // duplicate run inside the suppression window raises nothing new
        service.check_business_alerts().await;
        assert_eq!(service.active_alerts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_alert_lifecycle_through_service() {
        let (service, _) = service();
        let id = service
            .raise("test", "unit", AlertSeverity::Info, "m".into())
            .await
            .unwrap();
        assert!(service.acknowledge(id).await);
        assert!(service.resolve(id).await);
        assert!(service.active_alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_cleanup_bounds_memory() {
        let (service, _) = service();
        for _ in 0..1000 {
            service.collect_system().await;
        }
        assert!(service.total_points().await > EMERGENCY_FLOOR * 3);
        service.emergency_cleanup().await;
        assert!(service.total_points().await <= EMERGENCY_FLOOR * 3);
    }
}
