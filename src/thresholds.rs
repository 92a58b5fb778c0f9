//! Threshold resolution
//!
//! The effective stop-loss and profit-protection floor for a symbol are a
//! pure function of the loaded configuration and the current regime. Nothing
//! is cached here: the scheduler reloads the configuration every tick and
//! passes it in, so edits take effect on the next cycle.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ThresholdConfig;
use crate::regime::Regime;
use crate::types::{Position, PositionSide, Symbol, TriggerKind};

/// Where the effective stop-loss came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdSource {
    SymbolOverride,
    Regime(Regime),
    Default,
}

impl std::fmt::Display for ThresholdSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThresholdSource::SymbolOverride => write!(f, "symbol override"),
            ThresholdSource::Regime(r) => write!(f, "{} regime", r),
            ThresholdSource::Default => write!(f, "global default"),
        }
    }
}

/// Thresholds in effect for one symbol right now
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    /// Maximum tolerated loss as a fraction of entry
    pub stop_loss: f64,
    pub stop_source: ThresholdSource,
    /// Price a winning position must not retrace below
    pub profit_floor: Option<f64>,
}

impl ThresholdSet {
    /// Stop-loss breach: unrealized P&L at or beyond the stop.
    pub fn stop_loss_breached(&self, position: &Position) -> bool {
        position.unrealized_pnl_pct <= -self.stop_loss * 100.0
    }

    /// Profit-protection breach: a long trading below its floor.
    pub fn floor_breached(&self, position: &Position) -> bool {
        match self.profit_floor {
            Some(floor) => {
                position.side() == PositionSide::Long && position.current_price < floor
            }
            None => false,
        }
    }

    /// Every trigger the position currently breaches, floor first.
    pub fn breaches(&self, position: &Position) -> Vec<TriggerKind> {
        let mut triggers = Vec::new();
        if let Some(floor) = self.profit_floor {
            if self.floor_breached(position) {
                triggers.push(TriggerKind::ProfitProtection {
                    symbol: position.symbol.clone(),
                    price: position.current_price,
                    floor,
                });
            }
        }
        if self.stop_loss_breached(position) {
            triggers.push(TriggerKind::StopLoss {
                symbol: position.symbol.clone(),
                pnl_pct: position.unrealized_pnl_pct,
                stop_loss: self.stop_loss,
            });
        }
        triggers
    }
}

fn usable_fraction(value: f64) -> bool {
    value.is_finite() && (0.0..1.0).contains(&value)
}

/// Resolve the thresholds for `symbol` under `regime`.
///
/// Precedence, highest first: the symbol's profit floor, the symbol's
/// stop-loss override, the regime replacement of the default, the default.
/// Out-of-range values that slipped past validation are ignored in favour
/// of the next source down.
pub fn resolve(symbol: &Symbol, regime: Regime, cfg: &ThresholdConfig) -> ThresholdSet {
    let key = symbol.as_str();

    let profit_floor = cfg
        .profit_protection
        .get(key)
        .map(|f| f.min_price)
        .filter(|p| p.is_finite() && *p > 0.0);

    let default_stop = if usable_fraction(cfg.default_stop_loss) {
        cfg.default_stop_loss
    } else {
        warn!(
            "Default stop-loss {} invalid, using 0.20",
            cfg.default_stop_loss
        );
        0.20
    };

    if let Some(stop) = cfg.position_stop_losses.get(key) {
        if usable_fraction(stop.threshold) {
            return ThresholdSet {
                stop_loss: stop.threshold,
                stop_source: ThresholdSource::SymbolOverride,
                profit_floor,
            };
        }
        warn!(
            "{}: stop-loss {} rejected, falling back to default",
            symbol, stop.threshold
        );
    }

    let (stop_loss, stop_source) = match cfg.regime_stop_losses.get(&regime) {
        Some(v) if usable_fraction(*v) => (*v, ThresholdSource::Regime(regime)),
        _ => (default_stop, ThresholdSource::Default),
    };

    ThresholdSet {
        stop_loss,
        stop_source,
        profit_floor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SymbolStop;

    fn cfg() -> ThresholdConfig {
        ThresholdConfig::default()
            .with_symbol_stop("SOFI", 0.12)
            .with_profit_floor("AAPL", 180.0)
    }

    #[test]
    fn test_precedence() {
        let cfg = cfg();

        let sofi = resolve(&Symbol::new("SOFI"), Regime::High, &cfg);
        assert_eq!(sofi.stop_loss, 0.12);
        assert_eq!(sofi.stop_source, ThresholdSource::SymbolOverride);
        assert_eq!(sofi.profit_floor, None);

        let aapl = resolve(&Symbol::new("AAPL"), Regime::Normal, &cfg);
        assert_eq!(aapl.profit_floor, Some(180.0));
        assert_eq!(aapl.stop_loss, 0.20);
        assert_eq!(aapl.stop_source, ThresholdSource::Default);

        let nvda = resolve(&Symbol::new("NVDA"), Regime::Elevated, &cfg);
        assert_eq!(nvda.stop_loss, 0.15);
        assert_eq!(nvda.stop_source, ThresholdSource::Regime(Regime::Elevated));

        let nvda_high = resolve(&Symbol::new("NVDA"), Regime::High, &cfg);
        assert_eq!(nvda_high.stop_loss, 0.10);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let cfg = cfg();
        let symbol = Symbol::new("SOFI");
        for regime in Regime::ALL {
            assert_eq!(resolve(&symbol, regime, &cfg), resolve(&symbol, regime, &cfg));
        }
    }

    #[test]
    fn test_override_change_only_affects_that_symbol() {
        let before = cfg();
        let mut after = before.clone();
        after
            .position_stop_losses
            .insert("SOFI".to_string(), SymbolStop { threshold: 0.05 });

        let sofi = Symbol::new("SOFI");
        let nvda = Symbol::new("NVDA");
        assert_ne!(
            resolve(&sofi, Regime::Calm, &before),
            resolve(&sofi, Regime::Calm, &after)
        );
        assert_eq!(
            resolve(&nvda, Regime::Calm, &before),
            resolve(&nvda, Regime::Calm, &after)
        );
    }

    #[test]
    fn test_unvalidated_override_falls_back() {
        let mut cfg = ThresholdConfig::default();
        cfg.position_stop_losses
            .insert("NVDA".to_string(), SymbolStop { threshold: 1.2 });
        let set = resolve(&Symbol::new("NVDA"), Regime::Calm, &cfg);
        assert_eq!(set.stop_loss, 0.20);
        assert_eq!(set.stop_source, ThresholdSource::Default);
    }

    #[test]
    fn test_breaches() {
        let cfg = ThresholdConfig::default().with_profit_floor("AAPL", 180.0);

        let losing = Position::new("NVDA", 10.0, 100.0, 79.0);
        let set = resolve(&losing.symbol, Regime::Calm, &cfg);
        let triggers = set.breaches(&losing);
        assert_eq!(triggers.len(), 1);
        assert!(matches!(triggers[0], TriggerKind::StopLoss { .. }));

        let holding = Position::new("NVDA", 10.0, 100.0, 81.0);
        assert!(set.breaches(&holding).is_empty());

        let retracing = Position::new("AAPL", 10.0, 150.0, 175.0);
        let set = resolve(&retracing.symbol, Regime::Calm, &cfg);
        assert!(matches!(
            set.breaches(&retracing)[..],
            [TriggerKind::ProfitProtection { floor, .. }] if floor == 180.0
        ));

        // Floors protect longs only
        let short = Position::new("AAPL", -10.0, 200.0, 175.0);
        assert!(!set.floor_breached(&short));
    }
}
