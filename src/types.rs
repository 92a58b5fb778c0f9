//! Core data types used across the monitor

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PositionError;

/// Ticker symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// Direction of a standing position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

/// Open position as reported by the broker.
///
/// `quantity` is signed: positive is long, negative is short.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: f64,
    pub entry_price: f64,
    pub current_price: f64,
    /// Unrealized P&L in percent (e.g. -21.0 for a 21% loss)
    pub unrealized_pnl_pct: f64,
    #[serde(default = "default_beta")]
    pub beta: f64,
}

fn default_beta() -> f64 {
    1.0
}

impl Position {
    pub fn new(symbol: impl Into<Symbol>, quantity: f64, entry_price: f64, current_price: f64) -> Self {
        let mut position = Position {
            symbol: symbol.into(),
            quantity,
            entry_price,
            current_price,
            unrealized_pnl_pct: 0.0,
            beta: 1.0,
        };
        position.unrealized_pnl_pct = position.pnl_pct_at(current_price);
        position
    }

    pub fn with_beta(mut self, beta: f64) -> Self {
        self.beta = beta;
        self
    }

    pub fn side(&self) -> PositionSide {
        if self.quantity < 0.0 {
            PositionSide::Short
        } else {
            PositionSide::Long
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }

    /// Signed market value (negative for shorts)
    pub fn market_value(&self) -> f64 {
        self.quantity * self.current_price
    }

    /// Absolute exposure
    pub fn exposure(&self) -> f64 {
        self.market_value().abs()
    }

    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        let raw = (price - self.entry_price) / self.entry_price * 100.0;
        match self.side() {
            PositionSide::Long => raw,
            PositionSide::Short => -raw,
        }
    }

    /// Apply a fresh quote and recompute unrealized P&L
    pub fn mark(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl_pct = self.pnl_pct_at(price);
    }

    /// Reject data that cannot describe a real position.
    pub fn validate(&self) -> Result<(), PositionError> {
        if !self.quantity.is_finite() {
            return Err(PositionError::InvalidQuantity {
                symbol: self.symbol.clone(),
                quantity: self.quantity,
            });
        }
        if !self.entry_price.is_finite() || self.entry_price <= 0.0 {
            return Err(PositionError::InvalidPrice {
                symbol: self.symbol.clone(),
                field: "entry_price",
                value: self.entry_price,
            });
        }
        if !self.current_price.is_finite() || self.current_price <= 0.0 {
            return Err(PositionError::InvalidPrice {
                symbol: self.symbol.clone(),
                field: "current_price",
                value: self.current_price,
            });
        }
        Ok(())
    }
}

/// Broker view of the account
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub positions: Vec<Position>,
    pub cash: f64,
}

impl PortfolioSnapshot {
    pub fn new(positions: Vec<Position>, cash: f64) -> Self {
        PortfolioSnapshot { positions, cash }
    }

    /// Net liquidation value: cash plus signed position values
    pub fn equity(&self) -> f64 {
        self.cash + self.positions.iter().map(Position::market_value).sum::<f64>()
    }

    /// Open positions whose broker data passes validation
    pub fn valid_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(|p| !p.is_flat() && p.validate().is_ok())
    }

    /// Equity over valid positions only; `None` unless positive and finite.
    pub fn valid_equity(&self) -> Option<f64> {
        let equity = self.cash + self.valid_positions().map(Position::market_value).sum::<f64>();
        (equity.is_finite() && equity > 0.0).then_some(equity)
    }

    pub fn cash_ratio(&self) -> Option<f64> {
        self.valid_equity().map(|equity| self.cash / equity)
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.iter().find(|p| &p.symbol == symbol)
    }
}

/// Overbought strength reported by the technical-signal collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStrength {
    None,
    Weak,
    Moderate,
    Strong,
    VeryStrong,
}

impl std::fmt::Display for SignalStrength {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalStrength::None => "none",
            SignalStrength::Weak => "weak",
            SignalStrength::Moderate => "moderate",
            SignalStrength::Strong => "strong",
            SignalStrength::VeryStrong => "very strong",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSignal {
    pub strength: SignalStrength,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsi: Option<f64>,
}

impl TechnicalSignal {
    pub fn new(strength: SignalStrength) -> Self {
        TechnicalSignal { strength, rsi: None }
    }

    /// Map an RSI reading to overbought strength.
    pub fn from_rsi(rsi: f64) -> Self {
        let strength = if rsi >= 85.0 {
            SignalStrength::VeryStrong
        } else if rsi >= 80.0 {
            SignalStrength::Strong
        } else if rsi >= 70.0 {
            SignalStrength::Moderate
        } else if rsi >= 60.0 {
            SignalStrength::Weak
        } else {
            SignalStrength::None
        };
        TechnicalSignal {
            strength,
            rsi: Some(rsi),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
}

/// Order handed to the broker. Quantity is signed: negative sells, positive buys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub signed_quantity: f64,
    pub order_type: OrderType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub filled_quantity: f64,
    /// Position size after the fill, when the broker reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_quantity: Option<f64>,
}

/// Order proposed by the strategy agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub symbol: Symbol,
    pub signed_quantity: f64,
    pub rationale: String,
}

/// Control loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    #[default]
    Sleeping,
    Active,
    Escalating,
    Degraded,
}

impl MonitorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorState::Sleeping => "sleeping",
            MonitorState::Active => "active",
            MonitorState::Escalating => "escalating",
            MonitorState::Degraded => "degraded",
        }
    }

    pub fn parse(s: &str) -> Option<MonitorState> {
        match s {
            "sleeping" => Some(MonitorState::Sleeping),
            "active" => Some(MonitorState::Active),
            "escalating" => Some(MonitorState::Escalating),
            "degraded" => Some(MonitorState::Degraded),
            _ => None,
        }
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the loop escalated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerKind {
    StopLoss {
        symbol: Symbol,
        pnl_pct: f64,
        stop_loss: f64,
    },
    ProfitProtection {
        symbol: Symbol,
        price: f64,
        floor: f64,
    },
    ScheduledReview {
        hours_since_last: Option<f64>,
    },
    RegimeTransition {
        from: crate::regime::Regime,
        to: crate::regime::Regime,
        direction: crate::regime::Direction,
        volatility_index: f64,
    },
    DailyLossLimit {
        loss_pct: f64,
        limit_pct: f64,
    },
    AgentFailureThreshold {
        consecutive_failures: u32,
    },
}

impl TriggerKind {
    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            TriggerKind::StopLoss { symbol, .. } | TriggerKind::ProfitProtection { symbol, .. } => {
                Some(symbol)
            }
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TriggerKind::StopLoss {
                symbol,
                pnl_pct,
                stop_loss,
            } => format!(
                "{} hit stop-loss ({:+.2}% <= -{:.0}%)",
                symbol,
                pnl_pct,
                stop_loss * 100.0
            ),
            TriggerKind::ProfitProtection {
                symbol,
                price,
                floor,
            } => format!(
                "{} below profit protection (${:.2} < ${:.2})",
                symbol, price, floor
            ),
            TriggerKind::ScheduledReview { hours_since_last } => match hours_since_last {
                Some(h) => format!("Scheduled review due ({:.1}h since last review)", h),
                None => "Scheduled review due (no previous review)".to_string(),
            },
            TriggerKind::RegimeTransition {
                from,
                to,
                direction,
                volatility_index,
            } => format!(
                "Volatility regime change: {} -> {} ({}, index {:.2})",
                from, to, direction, volatility_index
            ),
            TriggerKind::DailyLossLimit {
                loss_pct,
                limit_pct,
            } => format!(
                "Daily loss {:.2}% exceeds limit {:.2}%",
                loss_pct, limit_pct
            ),
            TriggerKind::AgentFailureThreshold {
                consecutive_failures,
            } => format!(
                "Strategy agent unavailable after {} consecutive failures",
                consecutive_failures
            ),
        }
    }
}

/// Immutable, timestamped escalation record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TriggerKind,
}

impl TriggerEvent {
    pub fn new(at: DateTime<Utc>, kind: TriggerKind) -> Self {
        TriggerEvent { at, kind }
    }
}

/// Fraction of a position to remove, always in (0, 1].
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct TrimFraction(f64);

impl TrimFraction {
    pub fn new(fraction: f64) -> Option<Self> {
        if fraction.is_finite() && fraction > 0.0 && fraction <= 1.0 {
            Some(TrimFraction(fraction))
        } else {
            None
        }
    }

    pub fn get(self) -> f64 {
        self.0
    }

    pub fn percent(self) -> f64 {
        self.0 * 100.0
    }
}

impl TryFrom<f64> for TrimFraction {
    type Error = String;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        TrimFraction::new(value).ok_or_else(|| format!("trim fraction {} outside (0, 1]", value))
    }
}

impl From<TrimFraction> for f64 {
    fn from(value: TrimFraction) -> Self {
        value.0
    }
}

/// Names of the fallback rules, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackRuleName {
    StopLossExit,
    ExtremeOverbought,
    ModerateOverbought,
    ConcentrationLimit,
    CashReserveFloor,
}

impl std::fmt::Display for FallbackRuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FallbackRuleName::StopLossExit => "stop_loss_exit",
            FallbackRuleName::ExtremeOverbought => "extreme_overbought",
            FallbackRuleName::ModerateOverbought => "moderate_overbought",
            FallbackRuleName::ConcentrationLimit => "concentration_limit",
            FallbackRuleName::CashReserveFloor => "cash_reserve_floor",
        };
        f.write_str(s)
    }
}

/// A risk-reducing trim proposed while the strategy agent is unavailable.
///
/// Fields are private: the only constructor derives the reduction from an
/// existing position, so an action can never open, grow, or flip a position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackAction {
    symbol: Symbol,
    side: PositionSide,
    trim: TrimFraction,
    reduce_by: f64,
    rule: FallbackRuleName,
    rationale: String,
}

impl FallbackAction {
    pub fn trim(
        position: &Position,
        trim: TrimFraction,
        rule: FallbackRuleName,
        rationale: impl Into<String>,
    ) -> Option<Self> {
        if position.is_flat() || !position.quantity.is_finite() {
            return None;
        }
        Some(FallbackAction {
            symbol: position.symbol.clone(),
            side: position.side(),
            trim,
            reduce_by: position.quantity.abs() * trim.get(),
            rule,
            rationale: rationale.into(),
        })
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn trim_fraction(&self) -> TrimFraction {
        self.trim
    }

    pub fn rule(&self) -> FallbackRuleName {
        self.rule
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    /// Shares removed from the position (always positive)
    pub fn reduce_by(&self) -> f64 {
        self.reduce_by
    }

    /// Change in absolute exposure; never positive.
    pub fn exposure_delta(&self) -> f64 {
        -self.reduce_by
    }

    /// Signed broker quantity: sells a long, buys back a short.
    pub fn order_quantity(&self) -> f64 {
        match self.side {
            PositionSide::Long => -self.reduce_by,
            PositionSide::Short => self.reduce_by,
        }
    }

    pub fn to_order(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            signed_quantity: self.order_quantity(),
            order_type: OrderType::Market,
        }
    }
}

// ============================================================================
// Money: exact cash arithmetic
// ============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// Cash amount held as a decimal so long runs of fills do not drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Money(Decimal);

impl Money {
    /// `None` for NaN, infinities and values outside the decimal range
    pub fn from_f64(value: f64) -> Option<Self> {
        Decimal::try_from(value).ok().map(Money)
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Signed value of `quantity` units at `price`
    pub fn notional(quantity: f64, price: f64) -> Option<Self> {
        let quantity = Decimal::try_from(quantity).ok()?;
        let price = Decimal::try_from(price).ok()?;
        quantity.checked_mul(price).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Self> {
        self.0.checked_sub(other.0).map(Money)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.round_dp(2))
    }
}
