//! Configuration management
//!
//! Loads the monitor's JSON configuration, pulls credentials from the
//! environment and validates every numeric field at load time. Invalid
//! values never abort a load: they are replaced by safe defaults and reported
//! as [`ConfigWarning`]s so the control loop can audit them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::error::ConfigWarning;
use crate::regime::{Regime, RegimeBreakpoints};

/// Environment variables checked (in order) for the strategy agent API key
pub const AGENT_API_KEY_VARS: [&str; 2] = ["MONITOR_AGENT_API_KEY", "ANTHROPIC_API_KEY"];

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub review: ReviewConfig,
}

impl Config {
    /// Load configuration from a JSON file and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<LoadedConfig> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // Load API credentials from environment if not set
        if config.agent.api_key.is_none() {
            config.agent.api_key = AGENT_API_KEY_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok())
                .filter(|key| !key.is_empty());
        }

        let warnings = config.validate();
        Ok(LoadedConfig { config, warnings })
    }

    /// Replace every invalid value with its safe default.
    ///
    /// Returns one warning per replaced value. Calling it again on the
    /// returned config yields no warnings.
    pub fn validate(&mut self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        self.thresholds.validate(&mut warnings);
        self.regime.validate(&mut warnings);
        self.agent.validate(&mut warnings);
        self.fallback.validate(&mut warnings);
        self.monitor.validate(&mut warnings);
        self.session.validate(&mut warnings);
        self.review.validate(&mut warnings);
        warnings
    }
}

/// A validated configuration and the warnings produced while validating it
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: Config,
    pub warnings: Vec<ConfigWarning>,
}

/// Source of configuration, re-read by the scheduler on every tick.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<LoadedConfig>;
}

/// Reads a JSON file on every call so edits take effect within one tick
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> Result<LoadedConfig> {
        Config::from_file(&self.path)
    }
}

/// In-memory source; `replace` simulates an external edit.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    config: Mutex<Config>,
}

impl StaticConfigSource {
    pub fn new(config: Config) -> Self {
        StaticConfigSource {
            config: Mutex::new(config),
        }
    }

    pub fn replace(&self, config: Config) {
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
    }
}

impl ConfigSource for StaticConfigSource {
    fn load(&self) -> Result<LoadedConfig> {
        let mut config = self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let warnings = config.validate();
        Ok(LoadedConfig { config, warnings })
    }
}

fn valid_stop_fraction(value: f64) -> bool {
    value.is_finite() && (0.0..1.0).contains(&value)
}

/// Control-loop cadence and storage locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between ticks while the session is open
    pub active_interval_secs: u64,
    /// Seconds between wake-ups while the session is closed
    pub sleeping_interval_secs: u64,
    /// Deadline for each price / signal / portfolio fetch
    pub data_timeout_secs: u64,
    /// Deadline for each broker order
    pub order_timeout_secs: u64,
    pub state_dir: String,
    /// Optional JSON-lines alert log mirrored from the audit trail
    pub alert_log: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            active_interval_secs: 300,
            sleeping_interval_secs: 900,
            data_timeout_secs: 30,
            order_timeout_secs: 30,
            state_dir: "state".to_string(),
            alert_log: Some("state/alerts.jsonl".to_string()),
        }
    }
}

impl MonitorConfig {
    pub fn active_interval(&self) -> Duration {
        Duration::from_secs(self.active_interval_secs)
    }

    pub fn sleeping_interval(&self) -> Duration {
        Duration::from_secs(self.sleeping_interval_secs)
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(self.data_timeout_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let defaults = MonitorConfig::default();
        let fields: [(&str, &mut u64, u64); 4] = [
            (
                "monitor.active_interval_secs",
                &mut self.active_interval_secs,
                defaults.active_interval_secs,
            ),
            (
                "monitor.sleeping_interval_secs",
                &mut self.sleeping_interval_secs,
                defaults.sleeping_interval_secs,
            ),
            (
                "monitor.data_timeout_secs",
                &mut self.data_timeout_secs,
                defaults.data_timeout_secs,
            ),
            (
                "monitor.order_timeout_secs",
                &mut self.order_timeout_secs,
                defaults.order_timeout_secs,
            ),
        ];
        for (field, value, default) in fields {
            if *value == 0 {
                warnings.push(ConfigWarning::Field {
                    field: field.to_string(),
                    value: 0.0,
                    reason: format!("must be positive, using {}", default),
                });
                *value = default;
            }
        }
    }
}

/// Regular trading session, in the exchange's local time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// IANA timezone name
    pub timezone: String,
    /// Session open, "HH:MM"
    pub open: String,
    /// Session close, "HH:MM"
    pub close: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            timezone: "America/New_York".to_string(),
            open: "09:30".to_string(),
            close: "16:00".to_string(),
        }
    }
}

impl SessionConfig {
    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            warnings.push(ConfigWarning::Timezone(self.timezone.clone()));
            self.timezone = SessionConfig::default().timezone;
        }

        let open = chrono::NaiveTime::parse_from_str(&self.open, "%H:%M");
        let close = chrono::NaiveTime::parse_from_str(&self.close, "%H:%M");
        let valid = matches!((open, close), (Ok(o), Ok(c)) if o < c);
        if !valid {
            warnings.push(ConfigWarning::Field {
                field: "session.open/close".to_string(),
                value: 0.0,
                reason: format!(
                    "'{}'-'{}' is not a valid HH:MM range, using 09:30-16:00",
                    self.open, self.close
                ),
            });
            let defaults = SessionConfig::default();
            self.open = defaults.open;
            self.close = defaults.close;
        }
    }
}

/// Volatility regime breakpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Lower bounds of NORMAL, ELEVATED and HIGH
    pub breakpoints: Vec<f64>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        RegimeConfig {
            breakpoints: RegimeBreakpoints::default().values().to_vec(),
        }
    }
}

impl RegimeConfig {
    pub fn breakpoints(&self) -> RegimeBreakpoints {
        RegimeBreakpoints::try_from(self.breakpoints.clone()).unwrap_or_default()
    }

    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        if RegimeBreakpoints::try_from(self.breakpoints.clone()).is_err() {
            warnings.push(ConfigWarning::Breakpoints {
                values: self.breakpoints.clone(),
            });
            *self = RegimeConfig::default();
        }
    }
}

/// Per-symbol stop-loss override
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SymbolStop {
    /// Maximum tolerated loss as a fraction (0.15 = 15%)
    pub threshold: f64,
}

/// Price below which a winning position must not retrace
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitFloor {
    pub min_price: f64,
}

/// Stop-loss and profit-protection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Global stop-loss fraction
    pub default_stop_loss: f64,
    /// Regime replacements for the global default
    pub regime_stop_losses: BTreeMap<Regime, f64>,
    /// Per-symbol stop-loss overrides
    pub position_stop_losses: BTreeMap<String, SymbolStop>,
    /// Per-symbol profit-protection floors
    pub profit_protection: BTreeMap<String, ProfitFloor>,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        ThresholdConfig {
            default_stop_loss: 0.20,
            regime_stop_losses: BTreeMap::from([(Regime::Elevated, 0.15), (Regime::High, 0.10)]),
            position_stop_losses: BTreeMap::new(),
            profit_protection: BTreeMap::new(),
        }
    }
}

impl ThresholdConfig {
    pub fn with_symbol_stop(mut self, symbol: &str, threshold: f64) -> Self {
        self.position_stop_losses
            .insert(symbol.to_uppercase(), SymbolStop { threshold });
        self
    }

    pub fn with_profit_floor(mut self, symbol: &str, min_price: f64) -> Self {
        self.profit_protection
            .insert(symbol.to_uppercase(), ProfitFloor { min_price });
        self
    }

    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let fallback = ThresholdConfig::default().default_stop_loss;
        if !valid_stop_fraction(self.default_stop_loss) {
            warnings.push(ConfigWarning::DefaultStopLoss {
                value: self.default_stop_loss,
                fallback,
            });
            self.default_stop_loss = fallback;
        }

        self.regime_stop_losses.retain(|regime, value| {
            let ok = valid_stop_fraction(*value);
            if !ok {
                warnings.push(ConfigWarning::RegimeStopLoss {
                    regime: regime.to_string(),
                    value: *value,
                });
            }
            ok
        });

        // Symbols are matched case-insensitively
        let stops = std::mem::take(&mut self.position_stop_losses);
        for (symbol, stop) in stops {
            if valid_stop_fraction(stop.threshold) {
                self.position_stop_losses.insert(symbol.to_uppercase(), stop);
            } else {
                warnings.push(ConfigWarning::SymbolStopLoss {
                    symbol: symbol.to_uppercase(),
                    value: stop.threshold,
                });
            }
        }

        let floors = std::mem::take(&mut self.profit_protection);
        for (symbol, floor) in floors {
            if floor.min_price.is_finite() && floor.min_price > 0.0 {
                self.profit_protection.insert(symbol.to_uppercase(), floor);
            } else {
                warnings.push(ConfigWarning::ProfitFloor {
                    symbol: symbol.to_uppercase(),
                    value: floor.min_price,
                });
            }
        }
    }
}

/// Strategy agent endpoint and retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Attempts per escalation before the agent is considered exhausted
    pub max_retries: u32,
    /// Delay before each retry, in seconds; the last entry repeats
    pub backoff_secs: Vec<u64>,
    /// Deadline for one agent call
    pub timeout_secs: u64,
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    /// USD per million input tokens
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens
    pub output_cost_per_mtok: f64,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            max_retries: 3,
            backoff_secs: vec![5, 15, 45],
            timeout_secs: 120,
            endpoint: "https://api.anthropic.com/v1/messages".to_string(),
            model: "claude-sonnet-4-5".to_string(),
            max_tokens: 4096,
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
            api_key: None,
        }
    }
}

impl AgentSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Vec<Duration> {
        self.backoff_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }

    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let defaults = AgentSettings::default();
        if self.max_retries == 0 {
            warnings.push(ConfigWarning::Field {
                field: "agent.max_retries".to_string(),
                value: 0.0,
                reason: format!("must be at least 1, using {}", defaults.max_retries),
            });
            self.max_retries = defaults.max_retries;
        }
        let non_decreasing = self.backoff_secs.windows(2).all(|w| w[0] <= w[1]);
        if self.backoff_secs.is_empty() || !non_decreasing {
            warnings.push(ConfigWarning::Backoff {
                values: self.backoff_secs.clone(),
            });
            self.backoff_secs = defaults.backoff_secs;
        }
        if self.timeout_secs == 0 {
            warnings.push(ConfigWarning::Field {
                field: "agent.timeout_secs".to_string(),
                value: 0.0,
                reason: format!("must be positive, using {}", defaults.timeout_secs),
            });
            self.timeout_secs = defaults.timeout_secs;
        }
    }
}

/// One overbought profit-taking rule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverboughtRule {
    /// Minimum signal strength (inclusive)
    pub min_strength: crate::types::SignalStrength,
    /// Unrealized gain the position must exceed, in percent
    pub min_gain_pct: f64,
    /// Fraction of the position to trim
    pub trim_fraction: f64,
}

/// Thresholds for the deterministic fallback rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub extreme_overbought: OverboughtRule,
    pub moderate_overbought: OverboughtRule,
    /// Largest share of equity a single position may hold
    pub max_position_fraction: f64,
    /// Cash share of equity below which the reserve rule fires
    pub min_cash_ratio: f64,
    /// Gain (percent) that marks a position as deeply profitable
    pub deep_profit_pct: f64,
    /// Cap on the reserve rule's trim
    pub max_cash_trim_fraction: f64,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        use crate::types::SignalStrength;
        FallbackConfig {
            extreme_overbought: OverboughtRule {
                min_strength: SignalStrength::Strong,
                min_gain_pct: 30.0,
                trim_fraction: 0.30,
            },
            moderate_overbought: OverboughtRule {
                min_strength: SignalStrength::Moderate,
                min_gain_pct: 15.0,
                trim_fraction: 0.15,
            },
            max_position_fraction: 0.25,
            min_cash_ratio: 0.15,
            deep_profit_pct: 25.0,
            max_cash_trim_fraction: 0.25,
        }
    }
}

impl FallbackConfig {
    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let defaults = FallbackConfig::default();

        for (name, rule, default) in [
            (
                "fallback.extreme_overbought.trim_fraction",
                &mut self.extreme_overbought,
                defaults.extreme_overbought,
            ),
            (
                "fallback.moderate_overbought.trim_fraction",
                &mut self.moderate_overbought,
                defaults.moderate_overbought,
            ),
        ] {
            if crate::types::TrimFraction::new(rule.trim_fraction).is_none() {
                warnings.push(ConfigWarning::Field {
                    field: name.to_string(),
                    value: rule.trim_fraction,
                    reason: format!("must be in (0, 1], using {}", default.trim_fraction),
                });
                rule.trim_fraction = default.trim_fraction;
            }
        }

        let fractions: [(&str, &mut f64, f64); 3] = [
            (
                "fallback.max_position_fraction",
                &mut self.max_position_fraction,
                defaults.max_position_fraction,
            ),
            (
                "fallback.min_cash_ratio",
                &mut self.min_cash_ratio,
                defaults.min_cash_ratio,
            ),
            (
                "fallback.max_cash_trim_fraction",
                &mut self.max_cash_trim_fraction,
                defaults.max_cash_trim_fraction,
            ),
        ];
        for (field, value, default) in fractions {
            if !(value.is_finite() && *value > 0.0 && *value <= 1.0) {
                warnings.push(ConfigWarning::Field {
                    field: field.to_string(),
                    value: *value,
                    reason: format!("must be in (0, 1], using {}", default),
                });
                *value = default;
            }
        }
    }
}

/// Scheduled reviews and the daily loss circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Hours between scheduled reviews; 0 disables them
    pub scheduled_review_hours: f64,
    /// Intraday equity drop (fraction) that escalates; 0 disables it
    pub daily_loss_limit: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        ReviewConfig {
            scheduled_review_hours: 4.0,
            daily_loss_limit: 0.02,
        }
    }
}

impl ReviewConfig {
    fn validate(&mut self, warnings: &mut Vec<ConfigWarning>) {
        let defaults = ReviewConfig::default();
        if !(self.scheduled_review_hours.is_finite() && self.scheduled_review_hours >= 0.0) {
            warnings.push(ConfigWarning::Field {
                field: "review.scheduled_review_hours".to_string(),
                value: self.scheduled_review_hours,
                reason: format!("must be non-negative, using {}", defaults.scheduled_review_hours),
            });
            self.scheduled_review_hours = defaults.scheduled_review_hours;
        }
        if !valid_stop_fraction(self.daily_loss_limit) {
            warnings.push(ConfigWarning::Field {
                field: "review.daily_loss_limit".to_string(),
                value: self.daily_loss_limit,
                reason: format!("must be in [0, 1), using {}", defaults.daily_loss_limit),
            });
            self.daily_loss_limit = defaults.daily_loss_limit;
        }
    }
}
