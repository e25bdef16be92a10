// src/monitoring/alerts.rs
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: String,
    pub source: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub status: AlertStatus,
    pub triggered_at: chrono::DateTime<chrono::Utc>,
    pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.status != AlertStatus::Resolved
    }
}

/// Window inside which an identical (type, source) active alert suppresses a
/// new one.
const SUPPRESSION_WINDOW_MINUTES: i64 = 5;

/// Alert book-keeping: TRIGGERED -> (ACKNOWLEDGED)? -> RESOLVED, with
/// duplicate collapse.
pub struct AlertManager {
    alerts: HashMap<Uuid, Alert>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self {
            alerts: HashMap::new(),
        }
    }

    /// Raises an alert unless an identical active one fired within the
    /// suppression window. Returns the alert id when one was raised.
    pub fn trigger(
        &mut self,
        alert_type: &str,
        source: &str,
        severity: AlertSeverity,
        message: String,
    ) -> Option<Uuid> {
        let window = chrono::Utc::now() - chrono::Duration::minutes(SUPPRESSION_WINDOW_MINUTES);
        let duplicate = self.alerts.values().any(|a| {
            a.alert_type == alert_type
                && a.source == source
                && a.is_active()
                && a.triggered_at >= window
        });
        if duplicate {
            log::debug!("suppressed duplicate alert {alert_type}/{source}");
            return None;
        }

        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type: alert_type.to_string(),
            source: source.to_string(),
            severity,
            message,
            status: AlertStatus::Triggered,
            triggered_at: chrono::Utc::now(),
            acknowledged_at: None,
            resolved_at: None,
        };
        let id = alert.id;
        log::warn!(
            "alert raised [{severity:?}] {alert_type}/{source}: {}",
            alert.message
        );
        self.alerts.insert(id, alert);
        Some(id)
    }

    pub fn acknowledge(&mut self, id: Uuid) -> bool {
        match self.alerts.get_mut(&id) {
            Some(alert) if alert.status == AlertStatus::Triggered => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(chrono::Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn resolve(&mut self, id: Uuid) -> bool {
        match self.alerts.get_mut(&id) {
            Some(alert) if alert.is_active() => {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(chrono::Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: Uuid) -> Option<&Alert> {
        self.alerts.get(&id)
    }

    pub fn active(&self) -> Vec<&Alert> {
        let mut active: Vec<&Alert> = self.alerts.values().filter(|a| a.is_active()).collect();
        active.sort_by(|a, b| b.severity.cmp(&a.severity).then(a.triggered_at.cmp(&b.triggered_at)));
        active
    }

    pub fn active_count(&self) -> usize {
        self.alerts.values().filter(|a| a.is_active()).count()
    }

    /// Drops resolved alerts older than the retention window.
    pub fn prune_resolved(&mut self, retention: chrono::Duration) -> usize {
        let cutoff = chrono::Utc::now() - retention;
        let before = self.alerts.len();
        self.alerts.retain(|_, a| {
            a.is_active() || a.resolved_at.map(|t| t >= cutoff).unwrap_or(true)
        });
        before - self.alerts.len()
    }
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new()
    }
}
