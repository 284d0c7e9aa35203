//! Waypoint application binary - composition root.
//!
//! 1. Parse CLI arguments and load configuration from TOML
//! 2. Initialize tracing
//! 3. Wire the action library, handlers and shared engine services
//! 4. Run the demonstration pipeline, possibly several runs at once
//! 5. Log run reports, breaker states and learned statistics

mod cli;
mod demo;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use waypoint_core::{EventBus, WaypointConfig, WorldState};
use waypoint_engine::{Orchestrator, RunReport};

use crate::cli::CliArgs;

/// Log every telemetry event at debug level until the bus closes.
async fn log_events(events: EventBus) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => tracing::debug!(event = event.event_name(), ?event, "Telemetry"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Telemetry subscriber lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_report(report: &RunReport) {
    tracing::info!(
        run_id = %report.run_id,
        outcome = ?report.outcome,
        executed = ?report.executed(),
        final_state = %report.final_state,
        planning_invocations = report.planning_invocations,
        replans = report.replans,
        "Run report"
    );
}

fn log_services(orchestrator: &Orchestrator) {
    for snapshot in orchestrator.breakers().snapshot() {
        tracing::info!(
            action = %snapshot.action,
            state = %snapshot.state,
            consecutive_failures = snapshot.consecutive_failures,
            "Circuit breaker"
        );
    }
    for action in orchestrator.library().iter() {
        if let Some(stats) = orchestrator.learning().stats(&action.name) {
            tracing::info!(
                action = %stats.action,
                success_rate = stats.success_rate,
                confidence = stats.confidence,
                mean_duration_ms = stats.mean_duration_ms,
                "Learned statistics"
            );
        }
        if let Some(metrics) = orchestrator.monitor().metrics(&action.name) {
            tracing::debug!(
                action = %action.name,
                count = metrics.count,
                failures = metrics.failures,
                avg_ms = metrics.avg_duration().as_millis() as u64,
                "Execution metrics"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config.
    let config_file = args.resolve_config_path();
    let mut config = WaypointConfig::load_or_default(&config_file);
    config.engine.parallel_batches |= args.parallel;

    // Tracing. RUST_LOG wins over --log-level and the config file.
    let level = args.resolve_log_level(&config.general.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&level)),
        )
        .init();

    tracing::info!("Starting Waypoint v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        path = %config_file.display(),
        parallel_batches = config.engine.parallel_batches,
        "Configuration loaded"
    );

    // Engine.
    let library = demo::library()?;
    let handlers = demo::handlers(Duration::from_millis(50), args.flaky);
    tracing::info!(actions = library.len(), handlers = handlers.len(), "Action library ready");

    let events = EventBus::default();
    tokio::spawn(log_events(events.clone()));
    let orchestrator = Arc::new(
        Orchestrator::builder(config, Arc::new(library), Arc::new(handlers))
            .events(events)
            .build(),
    );

    // Cancel all runs on Ctrl-C.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, cancelling runs");
                cancel.cancel();
            }
        });
    }

    let runs = args.runs.max(1);
    let handles: Vec<_> = (0..runs)
        .map(|_| orchestrator.spawn_run(WorldState::new(), demo::goal(), cancel.child_token()))
        .collect();

    let mut failed = 0usize;
    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(Ok(report)) => log_report(&report),
            Ok(Err(failure)) => {
                failed += 1;
                tracing::error!(
                    run_id = %failure.run_id,
                    error = %failure.error,
                    steps = failure.steps.len(),
                    "Run failed"
                );
            }
            Err(e) => {
                failed += 1;
                tracing::error!(error = %e, "Run task panicked");
            }
        }
    }

    log_services(&orchestrator);
    tracing::info!(runs, failed, "Waypoint finished");

    if failed > 0 {
        return Err(format!("{failed} of {runs} runs failed").into());
    }
    Ok(())
}
