//! Portfolio Monitor
//!
//! A continuous supervisory loop over a brokerage portfolio. It watches
//! volatility regimes and per-position thresholds, escalates to an external
//! strategy agent when something needs a decision, and falls back to a small
//! set of deterministic trim rules when the agent cannot be reached.

pub mod agent;
pub mod audit;
pub mod config;
pub mod error;
pub mod fallback;
pub mod market;
pub mod paper;
pub mod regime;
pub mod scheduler;
pub mod session;
pub mod state_manager;
pub mod thresholds;
pub mod types;

pub use config::{Config, ConfigSource, FileConfigSource, LoadedConfig, StaticConfigSource};
pub use error::{AgentError, ConfigWarning, DataError, InvokeError, PositionError};
pub use regime::{Direction, Regime, RegimeBreakpoints};
pub use scheduler::{Collaborators, Escalation, Scheduler, TickReport};
pub use types::*;
