//! Status command implementation

use anyhow::{Context, Result};
use tracing::info;

use portfolio_monitor::state_manager::create_state_manager;

pub fn run(state_dir: String, limit: usize) -> Result<()> {
    let manager = create_state_manager(&state_dir)
        .with_context(|| format!("Failed to open state store in {}", state_dir))?;

    let Some(state) = manager.load_state()? else {
        info!("No monitor state recorded in {}", state_dir);
        return Ok(());
    };

    info!("{}", "=".repeat(60));
    info!("MONITOR STATUS");
    info!("{}", "=".repeat(60));
    info!("State:                {}", state.monitor_state);
    info!("Cycles:               {}", state.cycle_count);
    info!(
        "Regime:               {}",
        state
            .last_regime
            .map(|r| r.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );
    if let Some(vix) = state.last_volatility_index {
        info!("Volatility index:     {:.2}", vix);
    }
    info!("Agent failures:       {}", state.consecutive_failures);
    if let Some(at) = state.last_success {
        info!("Last agent success:   {}", at.to_rfc3339());
    }
    if let Some(date) = state.last_session_date {
        info!("Last session:         {}", date);
    }
    if let Some(equity) = state.session_start_equity {
        info!("Session start equity: ${:.2}", equity);
    }
    if let Some(at) = state.updated_at {
        info!("Updated:              {}", at.to_rfc3339());
    }

    info!("{}", "-".repeat(60));
    info!(
        "Audit log: {} entries ({} triggers, {} fallback actions)",
        manager.audit_count(None)?,
        manager.audit_count(Some("trigger"))?,
        manager.audit_count(Some("fallback_action"))?
    );
    for entry in manager.recent_audit(limit)?.iter().rev() {
        info!(
            "{} {:<22} {:<6} {}",
            entry.timestamp,
            entry.kind,
            entry.symbol.as_deref().unwrap_or("-"),
            entry.message
        );
    }
    Ok(())
}
