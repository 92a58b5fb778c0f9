//! Error types for the monitor core

use std::time::Duration;

use thiserror::Error;

use crate::types::Symbol;

/// Failure reported by a single strategy-agent call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    #[error("agent call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("agent overloaded: {0}")]
    Overloaded(String),

    #[error("agent service error (HTTP {status}): {message}")]
    Service { status: u16, message: String },

    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unparseable agent response: {0}")]
    Parse(String),
}

impl AgentError {
    /// Map an HTTP status code onto the retry taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => AgentError::Auth(message),
            429 | 529 => AgentError::Overloaded(message),
            400..=499 => AgentError::BadRequest(message),
            _ => AgentError::Service { status, message },
        }
    }

    /// Only retriable errors consume a retry slot.
    pub fn is_retriable(&self) -> bool {
        match self {
            AgentError::Timeout(_) | AgentError::Transport(_) | AgentError::Overloaded(_) => true,
            AgentError::Service { status, .. } => *status >= 500,
            AgentError::BadRequest(_) | AgentError::Auth(_) | AgentError::Parse(_) => false,
        }
    }
}

/// Outcome of a failed `AgentInvoker::invoke`
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("strategy agent exhausted after {attempts} attempt(s) ({consecutive_failures} consecutive failures)")]
    Exhausted {
        attempts: u32,
        consecutive_failures: u32,
    },

    #[error("strategy agent rejected request: {0}")]
    NonRetriable(AgentError),
}

/// Market data or broker call failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("{what} unavailable: {reason}")]
    Unavailable { what: String, reason: String },

    #[error("order for {symbol} rejected: {reason}")]
    OrderRejected { symbol: Symbol, reason: String },
}

impl DataError {
    pub fn unavailable(what: impl Into<String>, reason: impl Into<String>) -> Self {
        DataError::Unavailable {
            what: what.into(),
            reason: reason.into(),
        }
    }
}

/// Position state that cannot be acted on
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("{symbol}: invalid quantity {quantity}")]
    InvalidQuantity { symbol: Symbol, quantity: f64 },

    #[error("{symbol}: invalid {field} {value}")]
    InvalidPrice {
        symbol: Symbol,
        field: &'static str,
        value: f64,
    },

    #[error("{symbol}: fill crossed zero (before {before}, after {after})")]
    CrossedZero {
        symbol: Symbol,
        before: f64,
        after: f64,
    },
}

impl PositionError {
    pub fn symbol(&self) -> &Symbol {
        match self {
            PositionError::InvalidQuantity { symbol, .. }
            | PositionError::InvalidPrice { symbol, .. }
            | PositionError::CrossedZero { symbol, .. } => symbol,
        }
    }
}

/// Invalid configuration value, resolved to a safe default at load time
#[derive(Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ConfigWarning {
    #[error("stop-loss for {symbol} is {value}; must be in [0, 1), using global default")]
    SymbolStopLoss { symbol: String, value: f64 },

    #[error("default stop-loss {value} invalid; using {fallback}")]
    DefaultStopLoss { value: f64, fallback: f64 },

    #[error("stop-loss for regime {regime} is {value}; must be in [0, 1), ignoring")]
    RegimeStopLoss { regime: String, value: f64 },

    #[error("profit-protection floor for {symbol} is {value}; must be positive, ignoring")]
    ProfitFloor { symbol: String, value: f64 },

    #[error("regime breakpoints {values:?} are not strictly increasing; using defaults")]
    Breakpoints { values: Vec<f64> },

    #[error("agent backoff delays {values:?} must be non-decreasing; using defaults")]
    Backoff { values: Vec<u64> },

    #[error("{field} is {value}; {reason}")]
    Field {
        field: String,
        value: f64,
        reason: String,
    },

    #[error("unknown timezone '{0}'; using America/New_York")]
    Timezone(String),
}
