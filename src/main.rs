//! Demo wiring: two mock gateways under the failover strategy, default
//! alert rules, alert notifications logged, clean shutdown on ctrl-c.

use log::{info, warn};
use std::sync::Arc;

use gatehub::{
    default_rules, BackendKind, GatewayDescriptor, GatewayFactory, GatewayOrchestrator, OrderSide,
    OrderSpec, RouteKind, Settings,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    gatehub::utils::setup_logging();

    let settings = Settings::from_env();
    settings.validate_and_log();

    let strategy = gatehub::strategy_for(
        std::env::var("ROUTING_STRATEGY")
            .ok()
            .and_then(|s| s.parse::<RouteKind>().ok())
            .unwrap_or(RouteKind::Failover),
    );

    let orchestrator = Arc::new(GatewayOrchestrator::new(
        settings,
        strategy,
        GatewayFactory::with_defaults(),
        None,
    ));

    let descriptors = vec![
        GatewayDescriptor::new("sim-main", BackendKind::Mock)
            .with_priority(2)
            .with_weight(3)
            .primary(),
        GatewayDescriptor::new("sim-backup", BackendKind::Mock)
            .with_priority(1)
            .with_weight(1),
    ];
    orchestrator.initialize(descriptors, default_rules())?;

    // Route alert notifications to the log; a real deployment hangs
    // email/webhook senders here.
    orchestrator.alerts().subscribe(
        "log-notifier",
        Arc::new(|alert: &gatehub::Alert| {
            if alert.resolved {
                log::info!("✅ resolved: {}", alert.message);
            } else {
                log::warn!("🚨 {}", alert.message);
            }
        }),
    );

    let results = orchestrator.connect_all().await;
    let failed: Vec<&String> = results.iter().filter(|(_, ok)| !**ok).map(|(n, _)| n).collect();
    if !failed.is_empty() {
        warn!("⚠️ Gateways not connected at startup: {:?}", failed);
    }
    info!("{}", orchestrator.summary().await);

    // Exercise the routed path once so the demo shows an end-to-end order.
    let spec = OrderSpec::market("EUR/USD", OrderSide::Buy, 100_000.0);
    match orchestrator.submit_order(&spec, None).await {
        Ok(order_id) => info!("Demo order accepted: {}", order_id),
        Err(e) => warn!("Demo order failed: {}", e),
    }

    info!("Running until ctrl-c...");
    tokio::signal::ctrl_c().await?;

    orchestrator.shutdown().await;
    Ok(())
}
