//! Gateway selection strategies.
//!
//! Strategies are pure: they look at an ordered snapshot of gateway health
//! (`GatewayView`, registration order preserved) and return a gateway name,
//! or `None` when the healthy set is empty - never a panic. Health mutation
//! happens elsewhere; the supervisor and orchestrator feed fresh snapshots
//! in for every selection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::GatewayError;
use crate::metrics::GatewayStats;

/// Snapshot of one gateway as the router sees it. Built in registration
/// order; `is_primary` reflects the *elected* primary, not the configured
/// flag.
#[derive(Debug, Clone)]
pub struct GatewayView {
    pub name: String,
    pub healthy: bool,
    pub is_primary: bool,
    pub priority: u32,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    ActiveActive,
    ActiveStandby,
    LoadBalance,
    Failover,
}

impl FromStr for RouteKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "active-active" => Ok(RouteKind::ActiveActive),
            "active-standby" => Ok(RouteKind::ActiveStandby),
            "load-balance" | "round-robin" => Ok(RouteKind::LoadBalance),
            "failover" => Ok(RouteKind::Failover),
            other => Err(GatewayError::ConfigurationError(format!(
                "unknown routing strategy '{}'",
                other
            ))),
        }
    }
}

pub trait RouteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, views: &[GatewayView]) -> Option<String>;
}

/// Build the stock strategy for a kind.
pub fn strategy_for(kind: RouteKind) -> Arc<dyn RouteStrategy> {
    match kind {
        RouteKind::ActiveActive => Arc::new(ActiveActive),
        RouteKind::ActiveStandby => Arc::new(ActiveStandby),
        RouteKind::LoadBalance => Arc::new(LoadBalance::new()),
        RouteKind::Failover => Arc::new(Failover),
    }
}

fn elected_primary(views: &[GatewayView]) -> Option<&GatewayView> {
    views.iter().find(|v| v.is_primary && v.healthy)
}

/// Healthy gateways ordered by (priority desc, weight desc, registration
/// order). The sort is stable, so registration order is the final tie-break.
fn by_preference(views: &[GatewayView]) -> Vec<&GatewayView> {
    let mut healthy: Vec<&GatewayView> = views.iter().filter(|v| v.healthy).collect();
    healthy.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.weight.cmp(&a.weight)));
    healthy
}

/// Primary if healthy, else the first healthy gateway in registration order.
pub struct ActiveActive;

impl RouteStrategy for ActiveActive {
    fn name(&self) -> &'static str {
        "active-active"
    }

    fn select(&self, views: &[GatewayView]) -> Option<String> {
        if let Some(primary) = elected_primary(views) {
            return Some(primary.name.clone());
        }
        views.iter().find(|v| v.healthy).map(|v| v.name.clone())
    }
}

/// Primary only; no fallback.
pub struct ActiveStandby;

impl RouteStrategy for ActiveStandby {
    fn name(&self) -> &'static str {
        "active-standby"
    }

    fn select(&self, views: &[GatewayView]) -> Option<String> {
        elected_primary(views).map(|v| v.name.clone())
    }
}

/// Round-robin over the currently healthy set. The cursor is persistent and
/// taken modulo the healthy-set size at each call, so a shrinking or growing
/// set never indexes out of range.
pub struct LoadBalance {
    cursor: AtomicUsize,
}

impl LoadBalance {
    pub fn new() -> Self {
        Self {
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for LoadBalance {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteStrategy for LoadBalance {
    fn name(&self) -> &'static str {
        "load-balance"
    }

    fn select(&self, views: &[GatewayView]) -> Option<String> {
        let healthy: Vec<&GatewayView> = views.iter().filter(|v| v.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Some(healthy[idx].name.clone())
    }
}

/// Primary if healthy, else the most preferred healthy gateway by
/// (priority, weight, registration order).
pub struct Failover;

impl RouteStrategy for Failover {
    fn name(&self) -> &'static str {
        "failover"
    }

    fn select(&self, views: &[GatewayView]) -> Option<String> {
        if let Some(primary) = elected_primary(views) {
            return Some(primary.name.clone());
        }
        by_preference(views).first().map(|v| v.name.clone())
    }
}

/// Supplement strategy: pick the healthy gateway with the lowest average
/// latency in the metrics window; gateways without latency samples sort
/// last, ties resolved by registration order.
pub struct LowestLatency {
    stats: Arc<dyn Fn() -> HashMap<String, GatewayStats> + Send + Sync>,
}

impl LowestLatency {
    pub fn new(stats: Arc<dyn Fn() -> HashMap<String, GatewayStats> + Send + Sync>) -> Self {
        Self { stats }
    }
}

impl RouteStrategy for LowestLatency {
    fn name(&self) -> &'static str {
        "lowest-latency"
    }

    fn select(&self, views: &[GatewayView]) -> Option<String> {
        let stats = (self.stats)();
        let mut healthy: Vec<(usize, &GatewayView, f64)> = views
            .iter()
            .enumerate()
            .filter(|(_, v)| v.healthy)
            .map(|(idx, v)| {
                let avg = stats
                    .get(&v.name)
                    .filter(|s| s.latency_samples > 0)
                    .map(|s| s.avg_latency_ms)
                    .unwrap_or(f64::MAX);
                (idx, v, avg)
            })
            .collect();
        healthy.sort_by(|a, b| {
            a.2.partial_cmp(&b.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        healthy.first().map(|(_, v, _)| v.name.clone())
    }
}

/// Tracks which gateway currently holds the primary role.
///
/// The configured primary keeps the role while healthy and reclaims it
/// automatically when it recovers. While it is down the role moves to the
/// most preferred healthy gateway; with no healthy gateway the role is
/// unset.
pub struct PrimaryElector {
    configured: RwLock<Option<String>>,
    current: RwLock<Option<String>>,
}

impl PrimaryElector {
    pub fn new() -> Self {
        Self {
            configured: RwLock::new(None),
            current: RwLock::new(None),
        }
    }

    pub fn set_configured(&self, name: Option<String>) {
        *self.configured.write().expect("elector lock poisoned") = name;
    }

    pub fn current(&self) -> Option<String> {
        self.current.read().expect("elector lock poisoned").clone()
    }

    /// Re-evaluate the primary role against a fresh health snapshot and
    /// return the holder, if any.
    pub fn evaluate(&self, views: &[GatewayView]) -> Option<String> {
        let healthy = |name: &str| views.iter().any(|v| v.name == name && v.healthy);

        let configured = self.configured.read().expect("elector lock poisoned").clone();
        let mut current = self.current.write().expect("elector lock poisoned");

        // Original primary reclaims the role as soon as it is healthy again.
        if let Some(cfg) = configured {
            if healthy(&cfg) {
                if current.as_deref() != Some(cfg.as_str()) {
                    log::info!("👑 Primary role returns to configured gateway '{}'", cfg);
                }
                *current = Some(cfg.clone());
                return Some(cfg);
            }
        }

        if let Some(cur) = current.clone() {
            if healthy(&cur) {
                return Some(cur);
            }
        }

        let elected = by_preference(views).first().map(|v| v.name.clone());
        if elected != *current {
            match &elected {
                Some(name) => log::info!("👑 Re-elected primary gateway '{}'", name),
                None => log::warn!("⚠️ No healthy gateway left to hold the primary role"),
            }
        }
        *current = elected.clone();
        elected
    }
}

impl Default for PrimaryElector {
    fn default() -> Self {
        Self::new()
    }
}
