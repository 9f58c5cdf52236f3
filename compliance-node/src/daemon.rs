//! Engine assembly and the long-running service loop

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use compliance_engine::reconciler::EVENT_CURSOR;
use compliance_engine::{
    ChainWatcher, ComplianceCalculator, ContributionLedgerReconciler, ContributionStore,
    ContributionWriteCoordinator, PaymentScheduler, PriceOracle, RpcLedgerClient, SqliteStore,
};

use crate::config::Config;

/// Every engine component, wired against the configured ledger and store.
pub struct Engine {
    pub store: Arc<dyn ContributionStore>,
    pub ledger: Arc<RpcLedgerClient>,
    pub calculator: Arc<ComplianceCalculator>,
    pub coordinator: Arc<ContributionWriteCoordinator>,
    pub reconciler: Arc<ContributionLedgerReconciler>,
    pub scheduler: Arc<PaymentScheduler>,
}

impl Engine {
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn ContributionStore> = Arc::new(
            SqliteStore::open(&config.node.data_dir)
                .with_context(|| format!("opening store in {}", config.node.data_dir.display()))?,
        );

        let ledger = Arc::new(RpcLedgerClient::new(&config.ledger).context("creating ledger client")?);
        ledger
            .connect()
            .await
            .with_context(|| format!("connecting to ledger at {}", config.ledger.rpc_url))?;

        let oracle = Arc::new(PriceOracle::new(
            ledger.clone(),
            config.ledger.fallback_price,
            config.retry.clone(),
        )?);
        let calculator = Arc::new(ComplianceCalculator::new(
            store.clone(),
            ledger.clone(),
            oracle.clone(),
            config.compliance.clone(),
            config.retry.clone(),
        ));
        let coordinator = Arc::new(ContributionWriteCoordinator::new(
            store.clone(),
            ledger.clone(),
            oracle.clone(),
            calculator.clone(),
            &config.ledger,
            config.retry.clone(),
        ));
        let reconciler = Arc::new(ContributionLedgerReconciler::new(
            store.clone(),
            ledger.clone(),
            oracle,
            config.compliance.clone(),
            config.reconciler.clone(),
            config.retry.clone(),
        ));
        let scheduler = Arc::new(PaymentScheduler::new(
            store.clone(),
            coordinator.clone(),
            calculator.clone(),
        ));

        Ok(Self {
            store,
            ledger,
            calculator,
            coordinator,
            reconciler,
            scheduler,
        })
    }
}

/// Backfill, then watch the chain, reconcile and issue scheduled payments
/// until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let engine = Engine::open(&config).await?;

    let report = engine.reconciler.backfill().await.context("initial backfill")?;
    info!(
        from = report.from_block,
        to = report.to_block,
        stored = report.events_stored,
        "Initial backfill complete"
    );

    let start = match engine.store.sync_cursor(EVENT_CURSOR)? {
        Some(cursor) => cursor + 1,
        None => config.reconciler.start_block,
    };
    let watcher = ChainWatcher::new(
        engine.ledger.clone(),
        start,
        Duration::from_millis(config.reconciler.poll_interval_ms),
        config.reconciler.reorg_window,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (event_tx, event_rx) = mpsc::channel(config.node.event_buffer.max(1));

    let mut tasks = vec![
        tokio::spawn(watcher.run(event_tx, shutdown_rx.clone())),
        tokio::spawn(engine.reconciler.clone().run(event_rx, shutdown_rx.clone())),
    ];
    if config.scheduler.enabled {
        let interval = Duration::from_secs(config.scheduler.interval_secs.max(1));
        tasks.push(tokio::spawn(engine.scheduler.clone().run(interval, shutdown_rx.clone())));
    } else {
        info!("Payment scheduler is disabled");
    }

    info!(data_dir = %config.node.data_dir.display(), from_block = start, "compliance-node running");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("Shutdown requested");
    if shutdown_tx.send(true).is_err() {
        warn!("All tasks already stopped");
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task ended abnormally");
        }
    }
    info!("compliance-node stopped");
    Ok(())
}
