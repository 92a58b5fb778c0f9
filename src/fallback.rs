//! Deterministic fallback rules
//!
//! Used only when the strategy agent is exhausted. Rules run in a fixed
//! priority order and the first rule to select a symbol claims it; later
//! rules skip claimed symbols. Every rule returns [`FallbackAction`]s, which
//! can only shrink an existing position.
//!
//! Positions with unusable broker data are invisible here: they are neither
//! trimmed nor counted towards equity.

use std::collections::{BTreeSet, HashMap};

use crate::config::{FallbackConfig, OverboughtRule};
use crate::thresholds::ThresholdSet;
use crate::types::{
    FallbackAction, FallbackRuleName, PortfolioSnapshot, Position, PositionSide, Symbol,
    TechnicalSignal, TrimFraction,
};

type Signals = HashMap<Symbol, TechnicalSignal>;

/// Thresholds resolved for each symbol this tick
pub type Thresholds = HashMap<Symbol, ThresholdSet>;

/// Positions eligible for evaluation, in symbol order so output never
/// depends on broker ordering.
fn candidates(portfolio: &PortfolioSnapshot) -> Vec<&Position> {
    let mut positions: Vec<&Position> = portfolio.valid_positions().collect();
    positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    positions
}

fn stop_loss_exit(
    portfolio: &PortfolioSnapshot,
    thresholds: &Thresholds,
) -> Vec<FallbackAction> {
    let Some(full) = TrimFraction::new(1.0) else {
        return Vec::new();
    };

    candidates(portfolio)
        .into_iter()
        .filter_map(|p| {
            let set = thresholds.get(&p.symbol)?;
            if !set.stop_loss_breached(p) {
                return None;
            }
            let rationale = format!(
                "Stop-loss breached ({:+.1}% <= -{:.0}%, {}); closing position",
                p.unrealized_pnl_pct,
                set.stop_loss * 100.0,
                set.stop_source
            );
            FallbackAction::trim(p, full, FallbackRuleName::StopLossExit, rationale)
        })
        .collect()
}

fn overbought(
    portfolio: &PortfolioSnapshot,
    signals: &Signals,
    rule: &OverboughtRule,
    name: FallbackRuleName,
    label: &str,
    claimed: &BTreeSet<Symbol>,
) -> Vec<FallbackAction> {
    let Some(trim) = TrimFraction::new(rule.trim_fraction) else {
        return Vec::new();
    };

    candidates(portfolio)
        .into_iter()
        .filter(|p| !claimed.contains(&p.symbol) && p.side() == PositionSide::Long)
        .filter_map(|p| {
            let signal = signals.get(&p.symbol)?;
            if signal.strength < rule.min_strength || p.unrealized_pnl_pct <= rule.min_gain_pct {
                return None;
            }
            let rationale = format!(
                "{} overbought ({}{}) with {:+.1}% gain > {:.0}%; taking {:.0}% off",
                label,
                signal.strength,
                signal
                    .rsi
                    .map(|r| format!(", RSI {:.1}", r))
                    .unwrap_or_default(),
                p.unrealized_pnl_pct,
                rule.min_gain_pct,
                trim.percent()
            );
            FallbackAction::trim(p, trim, name, rationale)
        })
        .collect()
}

fn concentration(
    portfolio: &PortfolioSnapshot,
    cfg: &FallbackConfig,
    claimed: &BTreeSet<Symbol>,
) -> Vec<FallbackAction> {
    let Some(equity) = portfolio.valid_equity() else {
        return Vec::new();
    };

    candidates(portfolio)
        .into_iter()
        .filter(|p| !claimed.contains(&p.symbol))
        .filter_map(|p| {
            let fraction = p.exposure() / equity;
            if fraction <= cfg.max_position_fraction {
                return None;
            }
            let trim = TrimFraction::new(1.0 - cfg.max_position_fraction / fraction)?;
            let rationale = format!(
                "Concentration {:.1}% of equity exceeds {:.0}% limit; trimming {:.1}%",
                fraction * 100.0,
                cfg.max_position_fraction * 100.0,
                trim.percent()
            );
            FallbackAction::trim(p, trim, FallbackRuleName::ConcentrationLimit, rationale)
        })
        .collect()
}

fn cash_reserve(
    portfolio: &PortfolioSnapshot,
    cfg: &FallbackConfig,
    claimed: &BTreeSet<Symbol>,
) -> Vec<FallbackAction> {
    let (Some(equity), Some(cash_ratio)) = (portfolio.valid_equity(), portfolio.cash_ratio())
    else {
        return Vec::new();
    };
    if cash_ratio >= cfg.min_cash_ratio {
        return Vec::new();
    }

    // Best unclaimed long performer; ties go to the lower symbol
    let best = candidates(portfolio)
        .into_iter()
        .filter(|p| {
            !claimed.contains(&p.symbol)
                && p.side() == PositionSide::Long
                && p.unrealized_pnl_pct >= cfg.deep_profit_pct
        })
        .fold(None::<&Position>, |best, p| match best {
            Some(b) if b.unrealized_pnl_pct >= p.unrealized_pnl_pct => Some(b),
            _ => Some(p),
        });

    let Some(position) = best else {
        return Vec::new();
    };

    let needed = (cfg.min_cash_ratio - cash_ratio) * equity;
    if !needed.is_finite() || needed <= 0.0 {
        return Vec::new();
    }
    let fraction = (needed / position.exposure()).min(cfg.max_cash_trim_fraction);
    let Some(trim) = TrimFraction::new(fraction) else {
        return Vec::new();
    };
    let rationale = format!(
        "Cash {:.1}% below {:.0}% reserve; trimming {:.1}% of best performer ({:+.1}%)",
        cash_ratio * 100.0,
        cfg.min_cash_ratio * 100.0,
        trim.percent(),
        position.unrealized_pnl_pct
    );
    FallbackAction::trim(position, trim, FallbackRuleName::CashReserveFloor, rationale)
        .into_iter()
        .collect()
}

/// Evaluate all rules in priority order.
///
/// Pure: identical inputs always produce the identical list. A position
/// past its stop in `thresholds` is closed outright; symbols without a
/// signal are otherwise only considered by the concentration and cash rules.
pub fn evaluate(
    portfolio: &PortfolioSnapshot,
    signals: &Signals,
    thresholds: &Thresholds,
    cfg: &FallbackConfig,
) -> Vec<FallbackAction> {
    let mut claimed = BTreeSet::new();
    let mut actions = Vec::new();

    let mut take = |batch: Vec<FallbackAction>, claimed: &mut BTreeSet<Symbol>| {
        for action in batch {
            if claimed.insert(action.symbol().clone()) {
                actions.push(action);
            }
        }
    };

    take(stop_loss_exit(portfolio, thresholds), &mut claimed);

    let batch = overbought(
        portfolio,
        signals,
        &cfg.extreme_overbought,
        FallbackRuleName::ExtremeOverbought,
        "Extremely",
        &claimed,
    );
    take(batch, &mut claimed);

    let batch = overbought(
        portfolio,
        signals,
        &cfg.moderate_overbought,
        FallbackRuleName::ModerateOverbought,
        "Moderately",
        &claimed,
    );
    take(batch, &mut claimed);

    let batch = concentration(portfolio, cfg, &claimed);
    take(batch, &mut claimed);

    let batch = cash_reserve(portfolio, cfg, &claimed);
    take(batch, &mut claimed);

    actions
}
