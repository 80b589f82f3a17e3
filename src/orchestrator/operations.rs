//! Routed and fan-out operations on the orchestrator: order submission and
//! cancellation, market-data subscription, account/position queries, status
//! snapshots and gateway resets.

use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::timeout;

use crate::error::{GatewayError, Result};
use crate::events::{Event, EventKind};
use crate::gateway::{AccountSnapshot, GatewayStatus, OrderSpec, PositionSnapshot};
use crate::orchestrator::core::{GatewayEntry, GatewayOrchestrator};
use crate::routing::GatewayView;

impl GatewayOrchestrator {
    /// Health snapshot of every gateway in registration order, with the
    /// elected primary marked. This is the input every routing decision
    /// sees.
    pub async fn gateway_views(&self) -> Vec<GatewayView> {
        let mut views = Vec::new();
        for name in self.registration_order() {
            if let Some(entry) = self.entry(&name) {
                let connected = entry.status.read().await.connected;
                views.push(GatewayView {
                    name,
                    healthy: connected,
                    is_primary: false,
                    priority: entry.descriptor.priority,
                    weight: entry.descriptor.weight,
                });
            }
        }
        if let Some(primary) = self.elector.evaluate(&views) {
            for view in views.iter_mut() {
                view.is_primary = view.name == primary;
            }
        }
        views
    }

    /// Resolve the target for an addressed or routed operation.
    async fn resolve_target(&self, gateway: Option<&str>) -> Result<String> {
        match gateway {
            Some(name) => {
                let entry = self.entry(name).ok_or_else(|| {
                    GatewayError::GatewayUnavailable(format!("unknown gateway '{}'", name))
                })?;
                if entry.status.read().await.connected {
                    Ok(name.to_string())
                } else {
                    Err(GatewayError::GatewayUnavailable(format!(
                        "gateway '{}' is not active",
                        name
                    )))
                }
            }
            None => {
                let views = self.gateway_views().await;
                self.strategy.select(&views).ok_or_else(|| {
                    GatewayError::GatewayUnavailable("no healthy gateway available".to_string())
                })
            }
        }
    }

    /// Submit an order to the named gateway, or let the routing strategy
    /// pick one. No implicit retry: a failure or timeout is recorded and
    /// propagated to the caller.
    pub async fn submit_order(&self, spec: &OrderSpec, gateway: Option<&str>) -> Result<String> {
        let name = self.resolve_target(gateway).await?;
        let entry = self.entry(&name).ok_or_else(|| {
            GatewayError::GatewayUnavailable(format!("unknown gateway '{}'", name))
        })?;

        let started = Instant::now();
        let outcome: Result<String> =
            match timeout(self.settings.order_timeout(), entry.handle.submit_order(spec)).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::OperationTimeout(format!(
                    "submit_order on '{}' exceeded {:?}",
                    name,
                    self.settings.order_timeout()
                ))),
            };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(order_id) => {
                self.collector.record_latency(&name, latency_ms);
                self.collector.record_order_result(&name, true);
                let avg = self.collector.stats(&name).avg_latency_ms;
                {
                    let mut status = entry.status.write().await;
                    status.orders_count += 1;
                    status.successful_orders += 1;
                    status.avg_latency_ms = avg;
                }
                let _ = self.bus.publish(Event::new(
                    EventKind::Order,
                    name.clone(),
                    json!({
                        "order_id": order_id,
                        "symbol": spec.symbol,
                        "latency_ms": latency_ms,
                    }),
                ));
                debug!(
                    "Order {} accepted by '{}' in {:.1}ms",
                    order_id, name, latency_ms
                );
                Ok(order_id)
            }
            Err(e) => {
                self.collector.record_order_result(&name, false);
                self.collector.record_error(&name, e.metric_kind(), e.to_string());
                {
                    let mut status = entry.status.write().await;
                    status.orders_count += 1;
                    status.failed_orders += 1;
                    status.last_error = Some(e.to_string());
                }
                let _ = self.bus.publish(Event::new(
                    EventKind::Error,
                    name.clone(),
                    json!({ "operation": "submit_order", "error": e.to_string() }),
                ));
                warn!("⚠️ Order on '{}' failed: {}", name, e);
                Err(e)
            }
        }
    }

    /// Cancel an order. With no gateway named, the owning gateway is
    /// resolved through the order-table collaborator; an unresolvable id is
    /// `OrderNotFound`.
    pub async fn cancel_order(&self, order_id: &str, gateway: Option<&str>) -> Result<bool> {
        let name = match gateway {
            Some(name) => self.resolve_target(Some(name)).await?,
            None => {
                let owner = self
                    .order_table
                    .as_ref()
                    .and_then(|table| table.owner_of(order_id));
                match owner {
                    Some(owner) => self.resolve_target(Some(owner.as_str())).await?,
                    None => {
                        return Err(GatewayError::OrderNotFound(format!(
                            "no gateway owns order '{}'",
                            order_id
                        )))
                    }
                }
            }
        };

        let entry = self.entry(&name).ok_or_else(|| {
            GatewayError::GatewayUnavailable(format!("unknown gateway '{}'", name))
        })?;

        let started = Instant::now();
        let outcome: Result<bool> = match timeout(
            self.settings.order_timeout(),
            entry.handle.cancel_order(order_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::OperationTimeout(format!(
                "cancel_order on '{}' exceeded {:?}",
                name,
                self.settings.order_timeout()
            ))),
        };

        match outcome {
            Ok(cancelled) => {
                self.collector
                    .record_latency(&name, started.elapsed().as_secs_f64() * 1000.0);
                let _ = self.bus.publish(Event::new(
                    EventKind::Order,
                    name.clone(),
                    json!({ "order_id": order_id, "cancelled": cancelled }),
                ));
                Ok(cancelled)
            }
            Err(e) => {
                self.collector.record_error(&name, e.metric_kind(), e.to_string());
                warn!("⚠️ Cancel of '{}' on '{}' failed: {}", order_id, name, e);
                Err(e)
            }
        }
    }

    /// Targets for a fan-out call: the named subset (unknown names are
    /// logged and skipped) or all gateways, filtered to the active set.
    async fn fanout_targets(&self, gateways: Option<&[String]>) -> Vec<GatewayEntry> {
        let names: Vec<String> = match gateways {
            Some(names) => names.to_vec(),
            None => self.registration_order(),
        };

        let mut targets = Vec::new();
        for name in names {
            match self.entry(&name) {
                Some(entry) => {
                    if entry.status.read().await.connected {
                        targets.push(entry);
                    } else {
                        debug!("Skipping inactive gateway '{}' in fan-out", name);
                    }
                }
                None => warn!("⚠️ Unknown gateway '{}' in fan-out request", name),
            }
        }
        targets
    }

    /// Subscribe symbols on all active gateways (or a named subset).
    /// Returns the per-gateway acknowledgements; a failing gateway is
    /// recorded and omitted, never failing the whole call.
    pub async fn subscribe_market_data(
        &self,
        symbols: &[String],
        gateways: Option<&[String]>,
    ) -> HashMap<String, bool> {
        let targets = self.fanout_targets(gateways).await;
        let symbols: Arc<Vec<String>> = Arc::new(symbols.to_vec());

        let mut tasks = Vec::new();
        for entry in targets {
            let symbols = Arc::clone(&symbols);
            let collector = self.metrics();
            let semaphore = Arc::clone(&self.fanout);
            let query_timeout = self.settings.query_timeout();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let name = entry.descriptor.name.clone();
                let outcome: Result<bool> =
                    match timeout(query_timeout, entry.handle.subscribe_market_data(&symbols)).await
                    {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::OperationTimeout(format!(
                            "subscribe_market_data on '{}' exceeded {:?}",
                            name, query_timeout
                        ))),
                    };
                match outcome {
                    Ok(acknowledged) => Some((name, acknowledged)),
                    Err(e) => {
                        collector.record_error(&name, e.metric_kind(), e.to_string());
                        warn!("⚠️ Subscription on '{}' failed: {}", name, e);
                        None
                    }
                }
            }));
        }

        let mut results = HashMap::new();
        for joined in futures::future::join_all(tasks).await {
            if let Ok(Some((name, acknowledged))) = joined {
                results.insert(name, acknowledged);
            }
        }
        results
    }

    /// Query account state on all active gateways (or a named subset).
    pub async fn query_all_accounts(
        &self,
        gateways: Option<&[String]>,
    ) -> HashMap<String, AccountSnapshot> {
        let targets = self.fanout_targets(gateways).await;

        let mut tasks = Vec::new();
        for entry in targets {
            let collector = self.metrics();
            let semaphore = Arc::clone(&self.fanout);
            let query_timeout = self.settings.query_timeout();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let name = entry.descriptor.name.clone();
                let started = Instant::now();
                let outcome: Result<AccountSnapshot> =
                    match timeout(query_timeout, entry.handle.query_account()).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::OperationTimeout(format!(
                            "query_account on '{}' exceeded {:?}",
                            name, query_timeout
                        ))),
                    };
                match outcome {
                    Ok(snapshot) => {
                        collector.record_latency(&name, started.elapsed().as_secs_f64() * 1000.0);
                        Some((name, snapshot))
                    }
                    Err(e) => {
                        collector.record_error(&name, e.metric_kind(), e.to_string());
                        warn!("⚠️ Account query on '{}' failed: {}", name, e);
                        None
                    }
                }
            }));
        }

        let mut results = HashMap::new();
        for joined in futures::future::join_all(tasks).await {
            if let Ok(Some((name, snapshot))) = joined {
                results.insert(name, snapshot);
            }
        }
        results
    }

    /// Query open positions on all active gateways (or a named subset).
    pub async fn query_all_positions(
        &self,
        gateways: Option<&[String]>,
    ) -> HashMap<String, Vec<PositionSnapshot>> {
        let targets = self.fanout_targets(gateways).await;

        let mut tasks = Vec::new();
        for entry in targets {
            let collector = self.metrics();
            let semaphore = Arc::clone(&self.fanout);
            let query_timeout = self.settings.query_timeout();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let name = entry.descriptor.name.clone();
                let started = Instant::now();
                let outcome: Result<Vec<PositionSnapshot>> =
                    match timeout(query_timeout, entry.handle.query_positions()).await {
                        Ok(result) => result,
                        Err(_) => Err(GatewayError::OperationTimeout(format!(
                            "query_positions on '{}' exceeded {:?}",
                            name, query_timeout
                        ))),
                    };
                match outcome {
                    Ok(positions) => {
                        collector.record_latency(&name, started.elapsed().as_secs_f64() * 1000.0);
                        Some((name, positions))
                    }
                    Err(e) => {
                        collector.record_error(&name, e.metric_kind(), e.to_string());
                        warn!("⚠️ Position query on '{}' failed: {}", name, e);
                        None
                    }
                }
            }));
        }

        let mut results = HashMap::new();
        for joined in futures::future::join_all(tasks).await {
            if let Ok(Some((name, positions))) = joined {
                results.insert(name, positions);
            }
        }
        results
    }

    /// Re-arm a gateway that went terminal: zero the error count so the
    /// supervisor resumes reconnect attempts on its next tick.
    pub async fn reset_gateway(&self, name: &str) -> Result<()> {
        let entry = self.entry(name).ok_or_else(|| {
            GatewayError::GatewayUnavailable(format!("unknown gateway '{}'", name))
        })?;
        {
            let mut status = entry.status.write().await;
            status.error_count = 0;
            status.last_error = None;
        }
        info!("🔄 Gateway '{}' reset; reconnect attempts re-armed", name);
        Ok(())
    }

    pub async fn gateway_status(&self, name: &str) -> Option<GatewayStatus> {
        match self.entry(name) {
            Some(entry) => Some(entry.status.read().await.clone()),
            None => None,
        }
    }

    pub async fn all_statuses(&self) -> HashMap<String, GatewayStatus> {
        let mut statuses = HashMap::new();
        for name in self.registration_order() {
            if let Some(entry) = self.entry(&name) {
                statuses.insert(name, entry.status.read().await.clone());
            }
        }
        statuses
    }

    /// Names of gateways currently in the active set, registration order.
    pub async fn active_gateways(&self) -> Vec<String> {
        let mut active = Vec::new();
        for name in self.registration_order() {
            if let Some(entry) = self.entry(&name) {
                if entry.status.read().await.connected {
                    active.push(name);
                }
            }
        }
        active
    }

    /// One-line operational summary.
    pub async fn summary(&self) -> String {
        let total = self.registration_order().len();
        let active = self.active_gateways().await.len();
        let unresolved = self.alerts.active_alerts().len();
        let primary = self
            .elector
            .current()
            .unwrap_or_else(|| "none".to_string());
        format!(
            "{}/{} gateways active | primary: {} | strategy: {} | unresolved alerts: {}",
            active,
            total,
            primary,
            self.strategy.name(),
            unresolved
        )
    }
}
