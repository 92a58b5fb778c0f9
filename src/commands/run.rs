//! Run Command
//!
//! Drives the monitor loop against the paper collaborators:
//! - Quotes and the volatility index come from a JSON file re-read every call
//! - Orders fill immediately in an in-memory account seeded from JSON
//! - The strategy agent is the HTTP agent when an API key is configured
//!
//! State survives restarts through the SQLite state manager; Ctrl+C stops
//! the loop after the current tick.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use portfolio_monitor::agent::{AgentRequest, AgentResponse, HttpStrategyAgent, StrategyAgent};
use portfolio_monitor::audit::{AuditSink, BufferedAuditSink, JsonlAuditLog};
use portfolio_monitor::config::{ConfigSource, FileConfigSource};
use portfolio_monitor::market::MarketData;
use portfolio_monitor::paper::{FileMarketFeed, PaperBroker};
use portfolio_monitor::state_manager::create_state_manager;
use portfolio_monitor::{AgentError, Collaborators, Scheduler};

const ALERT_BUFFER: usize = 1024;

/// Stand-in when no API key is configured; every escalation goes to fallback.
struct UnconfiguredAgent;

#[async_trait]
impl StrategyAgent for UnconfiguredAgent {
    async fn invoke(&self, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        Err(AgentError::Transport("no agent API key configured".to_string()))
    }
}

pub fn run(
    config_path: String,
    state_dir: Option<String>,
    feed_path: String,
    portfolio_path: String,
    once: bool,
) -> Result<()> {
    dotenv::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run_async(
        config_path,
        state_dir,
        feed_path,
        portfolio_path,
        once,
    ))
}

async fn run_async(
    config_path: String,
    state_dir: Option<String>,
    feed_path: String,
    portfolio_path: String,
    once: bool,
) -> Result<()> {
    let source = Arc::new(FileConfigSource::new(&config_path));
    let loaded = source
        .load()
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let config = loaded.config;
    for warning in &loaded.warnings {
        warn!("Config: {}", warning);
    }

    let state_dir = state_dir.unwrap_or_else(|| config.monitor.state_dir.clone());

    info!("╔═══════════════════════════════════════════════════════════════╗");
    info!("║               PORTFOLIO MONITOR - PAPER MODE                  ║");
    info!("╠═══════════════════════════════════════════════════════════════╣");
    info!("║ Config: {:<53} ║", config_path);
    info!("║ State dir: {:<50} ║", state_dir);
    info!("║ Session: {} {}-{:<34} ║", config.session.timezone, config.session.open, config.session.close);
    info!("║ Active interval: {} seconds{:<29} ║", config.monitor.active_interval_secs, "");
    info!("║ Agent model: {:<48} ║", config.agent.model);
    info!("╚═══════════════════════════════════════════════════════════════╝");

    let feed: Arc<dyn MarketData> = Arc::new(FileMarketFeed::new(&feed_path));
    let broker = Arc::new(
        PaperBroker::from_file(&portfolio_path)
            .with_context(|| format!("Failed to seed paper account from {}", portfolio_path))?
            .with_prices(feed.clone()),
    );

    let agent: Arc<dyn StrategyAgent> = match HttpStrategyAgent::new(&config.agent) {
        Ok(agent) => {
            info!("Strategy agent: {}", agent.model());
            Arc::new(agent)
        }
        Err(e) => {
            warn!("{:#}; escalations will fall back to deterministic rules", e);
            Arc::new(UnconfiguredAgent)
        }
    };

    let state_manager =
        Arc::new(create_state_manager(&state_dir).context("Failed to open state store")?);

    let alerts = match &config.monitor.alert_log {
        Some(path) => {
            let log = JsonlAuditLog::open(path)
                .with_context(|| format!("Failed to open alert log {}", path))?;
            info!("Alert log: {}", path);
            Some(Arc::new(BufferedAuditSink::spawn(Arc::new(log), ALERT_BUFFER)))
        }
        None => None,
    };

    let collaborators = Collaborators {
        market: feed,
        broker: broker.clone(),
        agent,
    };
    let mut scheduler = Scheduler::new(source, collaborators, state_manager.clone())?;
    if let Some(alerts) = &alerts {
        scheduler = scheduler.with_audit_sink(alerts.clone() as Arc<dyn AuditSink>);
    }

    if once {
        let report = scheduler.tick(Utc::now()).await?;
        info!(
            "Tick complete: state={}, regime={}, triggers={}, orders={}",
            report.state,
            report
                .regime
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            report.triggers.len(),
            report.orders_submitted
        );
        for trigger in &report.triggers {
            info!("  Trigger: {}", trigger.kind.describe());
        }
        state_manager.export_json()?;
    } else {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, initiating shutdown...");
                    let _ = shutdown_tx.send(()).await;
                }
                Err(e) => {
                    error!("Error setting up signal handler: {}", e);
                }
            }
        });

        scheduler.run(shutdown_rx).await?;
    }

    drop(scheduler);
    if let Some(alerts) = alerts {
        match Arc::try_unwrap(alerts) {
            Ok(sink) => {
                let dropped = sink.dropped();
                sink.close().await;
                if dropped > 0 {
                    warn!("{} alert records were dropped under backpressure", dropped);
                }
            }
            Err(_) => warn!("Alert log still shared at shutdown; pending records may be lost"),
        }
    }

    let account = broker.snapshot();
    info!(
        "Paper account at exit: equity ${:.2}, cash ${}, {} positions",
        account.equity(),
        broker.cash(),
        account.positions.len()
    );
    info!("Monitor session ended.");
    Ok(())
}
