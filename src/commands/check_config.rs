//! Check-config command implementation

use anyhow::{Context, Result};
use tracing::{info, warn};

use portfolio_monitor::session::MarketSession;
use portfolio_monitor::Config;

pub fn run(config_path: String) -> Result<()> {
    let loaded = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let config = &loaded.config;

    info!("Loaded configuration from: {}", config_path);
    let breakpoints = config.regime.breakpoints().values();
    info!(
        "Regime breakpoints: CALM < {} <= NORMAL < {} <= ELEVATED < {} <= HIGH",
        breakpoints[0], breakpoints[1], breakpoints[2]
    );
    info!(
        "Default stop-loss: {:.0}%, regime overrides: {}, symbol overrides: {}, profit floors: {}",
        config.thresholds.default_stop_loss * 100.0,
        config.thresholds.regime_stop_losses.len(),
        config.thresholds.position_stop_losses.len(),
        config.thresholds.profit_protection.len()
    );
    info!(
        "Agent: {} retries, backoff {:?}s, timeout {}s",
        config.agent.max_retries, config.agent.backoff_secs, config.agent.timeout_secs
    );

    let session = MarketSession::from_config(&config.session);
    info!(
        "Session: {} {}-{} ({})",
        config.session.timezone,
        config.session.open,
        config.session.close,
        session.timezone()
    );

    if loaded.warnings.is_empty() {
        info!("Configuration is valid");
    } else {
        for warning in &loaded.warnings {
            warn!("{}", warning);
        }
        warn!(
            "{} value(s) replaced by safe defaults",
            loaded.warnings.len()
        );
    }
    Ok(())
}
