//! Strategy agent contract
//!
//! The agent is an opaque decision-maker: it receives a review prompt built
//! from the portfolio and the reasons for escalating, and answers in free
//! text. Actionable lines under its RECOMMENDATIONS heading are parsed into
//! [`OrderIntent`]s.

pub mod http;
pub mod invoker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

pub use http::HttpStrategyAgent;
pub use invoker::{AgentInvoker, InvokeSuccess, RetryPolicy, RetryState};

use crate::error::AgentError;
use crate::regime::Regime;
use crate::types::{OrderIntent, PortfolioSnapshot, Symbol, TriggerEvent};

#[async_trait]
pub trait StrategyAgent: Send + Sync {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentResponse, AgentError>;
}

/// Token usage and cost of one call
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgentUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl AgentUsage {
    /// Price usage at USD per million tokens
    pub fn priced(
        input_tokens: u64,
        output_tokens: u64,
        input_per_mtok: f64,
        output_per_mtok: f64,
    ) -> Self {
        let cost_usd = input_tokens as f64 / 1_000_000.0 * input_per_mtok
            + output_tokens as f64 / 1_000_000.0 * output_per_mtok;
        AgentUsage {
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }
}

/// Everything the agent sees when escalated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub at: DateTime<Utc>,
    pub triggers: Vec<TriggerEvent>,
    pub portfolio: PortfolioSnapshot,
    pub regime: Option<Regime>,
    pub volatility_index: Option<f64>,
    /// Equity at the first tick of the session
    pub session_start_equity: Option<f64>,
}

impl AgentRequest {
    pub fn reason(&self) -> String {
        if self.triggers.is_empty() {
            return "Manual review".to_string();
        }
        self.triggers
            .iter()
            .map(|t| t.kind.describe())
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Strategic review prompt
    pub fn prompt(&self) -> String {
        let reason = self.reason();
        let equity = self.portfolio.equity();
        let mut prompt = String::new();

        let _ = writeln!(prompt, "STRATEGIC REVIEW TRIGGERED: {}\n", reason);
        let _ = writeln!(prompt, "**Current Portfolio Status:**");
        let _ = writeln!(prompt, "- Total Value: ${:.2}", equity);
        let _ = writeln!(prompt, "- Cash: ${:.2}", self.portfolio.cash);
        if let Some(start) = self.session_start_equity.filter(|s| *s > 0.0) {
            let _ = writeln!(
                prompt,
                "- Today's P&L: ${:.2} ({:+.2}%)",
                equity - start,
                (equity - start) / start * 100.0
            );
        }
        match (self.regime, self.volatility_index) {
            (Some(regime), Some(vix)) => {
                let _ = writeln!(prompt, "- Volatility Regime: {} (index {:.2})", regime, vix);
            }
            (Some(regime), None) => {
                let _ = writeln!(prompt, "- Volatility Regime: {}", regime);
            }
            _ => {}
        }

        let _ = writeln!(prompt, "\n**Positions:**");
        if self.portfolio.positions.is_empty() {
            let _ = writeln!(prompt, "  (none)");
        }
        for pos in &self.portfolio.positions {
            let _ = writeln!(
                prompt,
                "  - {}: {:.4} shares @ ${:.2} (current: ${:.2}, P&L: {:+.2}%)",
                pos.symbol, pos.quantity, pos.entry_price, pos.current_price, pos.unrealized_pnl_pct
            );
        }

        let _ = write!(
            prompt,
            "\n**Review Request:**\n\
             Please conduct a strategic review of the current portfolio given the trigger: {}\n\n\
             Provide specific, actionable recommendations:\n\
             \x20  - Should any positions be reduced or closed?\n\
             \x20  - Should we increase cash reserves?\n\
             \x20  - Are stop-losses appropriate for current volatility?\n\n\
             Format your response with clear sections:\n\
             - ANALYSIS\n\
             - KEY FINDINGS\n\
             - RECOMMENDATIONS (numbered list; state trades as `SELL <qty> <SYMBOL>` or `BUY <qty> <SYMBOL>`)\n",
            reason
        );
        prompt
    }
}

/// Free-form answer from the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<AgentUsage>,
}

impl AgentResponse {
    pub fn new(text: impl Into<String>) -> Self {
        AgentResponse {
            text: text.into(),
            usage: None,
        }
    }

    pub fn with_usage(mut self, usage: AgentUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Numbered or bulleted lines of the RECOMMENDATIONS section
    pub fn recommendations(&self) -> Vec<String> {
        let Some((_, section)) = self.text.split_once("RECOMMENDATIONS") else {
            return Vec::new();
        };
        let section = section.split("RECOMMENDATIONS").next().unwrap_or(section);

        section
            .lines()
            .map(str::trim)
            .filter(|line| {
                line.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '*')
            })
            .map(|line| {
                line.trim_start_matches(|c: char| c.is_ascii_digit() || ".-*) ".contains(c))
                    .to_string()
            })
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn order_intents(&self) -> Vec<OrderIntent> {
        self.recommendations()
            .iter()
            .filter_map(|line| parse_order_intent(line))
            .collect()
    }
}

fn clean_token(token: &str) -> String {
    token
        .trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.')
        .trim_end_matches('.')
        .to_ascii_uppercase()
}

fn looks_like_symbol(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 6
        && token.chars().all(|c| c.is_ascii_uppercase() || c == '.')
        && token.chars().any(|c| c.is_ascii_uppercase())
}

/// Parse `SELL 10 NVDA`, `Buy 5 shares of AAPL` and similar.
pub fn parse_order_intent(line: &str) -> Option<OrderIntent> {
    let raw: Vec<&str> = line.split_whitespace().collect();
    let tokens: Vec<String> = raw.iter().map(|t| clean_token(t)).collect();
    let verb_at = tokens.iter().position(|t| t == "SELL" || t == "BUY")?;
    let sign = if tokens[verb_at] == "SELL" { -1.0 } else { 1.0 };

    // Signs are carried by the verb, never by the quantity
    if raw.get(verb_at + 1)?.trim_start_matches('*').starts_with('-') {
        return None;
    }
    let mut rest = tokens[verb_at + 1..].iter();
    let quantity: f64 = rest.next()?.replace(',', "").parse().ok()?;
    if !quantity.is_finite() || quantity <= 0.0 {
        return None;
    }
    let symbol = rest.find(|t| !matches!(t.as_str(), "SHARES" | "SHARE" | "OF"))?;
    if !looks_like_symbol(symbol) {
        return None;
    }

    Some(OrderIntent {
        symbol: Symbol::new(symbol.as_str()),
        signed_quantity: sign * quantity,
        rationale: line.to_string(),
    })
}
