// src/monitoring/series.rs
use std::collections::{HashMap, VecDeque};

/// One sampled value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricPoint {
    pub at: chrono::DateTime<chrono::Utc>,
    pub value: f64,
}

/// TTL-and-capacity-bounded time series map. Boundedness is a correctness
/// property here, not an optimisation: collectors run forever and the process
/// must not grow without limit. On the capacity watermark the oldest points
/// are pruned; the emergency path drops each series to a small floor.
pub struct BoundedSeries {
    series: HashMap<String, VecDeque<MetricPoint>>,
    capacity_per_metric: usize,
    ttl: chrono::Duration,
}

impl BoundedSeries {
    pub fn new(capacity_per_metric: usize, ttl: chrono::Duration) -> Self {
        Self {
            series: HashMap::new(),
            capacity_per_metric: capacity_per_metric.max(1),
            ttl,
        }
    }

    pub fn record(&mut self, metric: &str, value: f64) {
        self.record_at(metric, value, chrono::Utc::now());
    }

    pub fn record_at(&mut self, metric: &str, value: f64, at: chrono::DateTime<chrono::Utc>) {
        let points = self
            .series
            .entry(metric.to_string())
            .or_insert_with(VecDeque::new);
        if points.len() >= self.capacity_per_metric {
            points.pop_front();
        }
        points.push_back(MetricPoint { at, value });
    }

    pub fn latest(&self, metric: &str) -> Option<MetricPoint> {
        self.series.get(metric).and_then(|p| p.back()).copied()
    }

    /// Points at or after `from`, oldest first.
    pub fn since(&self, metric: &str, from: chrono::DateTime<chrono::Utc>) -> Vec<MetricPoint> {
        self.series
            .get(metric)
            .map(|points| points.iter().filter(|p| p.at >= from).copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.series.values().map(|p| p.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops points older than the TTL.
    pub fn prune_expired(&mut self) -> usize {
        let cutoff = chrono::Utc::now() - self.ttl;
        let mut dropped = 0;
        for points in self.series.values_mut() {
            while points.front().map(|p| p.at < cutoff).unwrap_or(false) {
                points.pop_front();
                dropped += 1;
            }
        }
        self.series.retain(|_, p| !p.is_empty());
        dropped
    }

    /// Memory-pressure response: keep only the newest few points of every
    /// series.
    pub fn emergency_cleanup(&mut self, floor: usize) -> usize {
        let mut dropped = 0;
        for points in self.series.values_mut() {
            while points.len() > floor {
                points.pop_front();
                dropped += 1;
            }
        }
        dropped
    }
}
