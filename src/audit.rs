//! Alert / audit trail
//!
//! Every trigger, agent attempt, fallback action and order lands here as an
//! [`AuditRecord`]. Sinks are append-only. `append` must return quickly:
//! slow backends go behind [`BufferedAuditSink`], which never blocks the
//! control loop and drops (and counts) records when its buffer is full.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::agent::AgentUsage;
use crate::error::ConfigWarning;
use crate::types::{FallbackAction, FallbackRuleName, MonitorState, Symbol, TriggerEvent};

/// Who proposed an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    Agent,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    Trigger {
        trigger: TriggerEvent,
    },
    AgentAttempt {
        attempt: u32,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        latency_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<AgentUsage>,
    },
    AgentSucceeded {
        attempts: u32,
        recommendations: Vec<String>,
    },
    AgentExhausted {
        attempts: u32,
        consecutive_failures: u32,
    },
    AgentRejected {
        error: String,
    },
    FallbackAction {
        symbol: Symbol,
        rule: FallbackRuleName,
        trim_pct: f64,
        quantity: f64,
        rationale: String,
    },
    OrderSubmitted {
        symbol: Symbol,
        signed_quantity: f64,
        order_id: String,
        source: OrderSource,
    },
    OrderFailed {
        symbol: Symbol,
        signed_quantity: f64,
        source: OrderSource,
        reason: String,
    },
    ConfigWarning {
        warning: ConfigWarning,
    },
    ConfigReloadFailed {
        reason: String,
    },
    StateTransition {
        from: MonitorState,
        to: MonitorState,
    },
    SessionOpened {
        date: NaiveDate,
    },
    SessionClosed {
        date: NaiveDate,
    },
    DataUnavailable {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        symbol: Option<Symbol>,
        reason: String,
    },
    InconsistentPosition {
        symbol: Symbol,
        reason: String,
    },
    PositionRecovered {
        symbol: Symbol,
    },
}

impl AuditEvent {
    pub fn fallback(action: &FallbackAction) -> Self {
        AuditEvent::FallbackAction {
            symbol: action.symbol().clone(),
            rule: action.rule(),
            trim_pct: action.trim_fraction().percent(),
            quantity: action.order_quantity(),
            rationale: action.rationale().to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Trigger { .. } => "trigger",
            AuditEvent::AgentAttempt { .. } => "agent_attempt",
            AuditEvent::AgentSucceeded { .. } => "agent_succeeded",
            AuditEvent::AgentExhausted { .. } => "agent_exhausted",
            AuditEvent::AgentRejected { .. } => "agent_rejected",
            AuditEvent::FallbackAction { .. } => "fallback_action",
            AuditEvent::OrderSubmitted { .. } => "order_submitted",
            AuditEvent::OrderFailed { .. } => "order_failed",
            AuditEvent::ConfigWarning { .. } => "config_warning",
            AuditEvent::ConfigReloadFailed { .. } => "config_reload_failed",
            AuditEvent::StateTransition { .. } => "state_transition",
            AuditEvent::SessionOpened { .. } => "session_opened",
            AuditEvent::SessionClosed { .. } => "session_closed",
            AuditEvent::DataUnavailable { .. } => "data_unavailable",
            AuditEvent::InconsistentPosition { .. } => "inconsistent_position",
            AuditEvent::PositionRecovered { .. } => "position_recovered",
        }
    }

    pub fn symbol(&self) -> Option<&Symbol> {
        match self {
            AuditEvent::Trigger { trigger } => trigger.kind.symbol(),
            AuditEvent::FallbackAction { symbol, .. }
            | AuditEvent::OrderSubmitted { symbol, .. }
            | AuditEvent::OrderFailed { symbol, .. }
            | AuditEvent::InconsistentPosition { symbol, .. }
            | AuditEvent::PositionRecovered { symbol } => Some(symbol),
            AuditEvent::DataUnavailable { symbol, .. } => symbol.as_ref(),
            _ => None,
        }
    }

    /// One-line human-readable summary
    pub fn message(&self) -> String {
        match self {
            AuditEvent::Trigger { trigger } => format!("ESCALATION: {}", trigger.kind.describe()),
            AuditEvent::AgentAttempt {
                attempt,
                success,
                error,
                latency_ms,
                usage,
            } => {
                let mut msg = if *success {
                    format!("Agent attempt {} succeeded in {}ms", attempt, latency_ms)
                } else {
                    format!(
                        "Agent attempt {} failed after {}ms: {}",
                        attempt,
                        latency_ms,
                        error.as_deref().unwrap_or("unknown error")
                    )
                };
                if let Some(u) = usage {
                    msg.push_str(&format!(
                        " ({} in / {} out tokens, ${:.4})",
                        u.input_tokens, u.output_tokens, u.cost_usd
                    ));
                }
                msg
            }
            AuditEvent::AgentSucceeded {
                attempts,
                recommendations,
            } => format!(
                "Strategy agent responded after {} attempt(s) with {} recommendation(s)",
                attempts,
                recommendations.len()
            ),
            AuditEvent::AgentExhausted {
                attempts,
                consecutive_failures,
            } => format!(
                "Strategy agent exhausted after {} attempt(s); {} consecutive failures, fallback rules in control",
                attempts, consecutive_failures
            ),
            AuditEvent::AgentRejected { error } => {
                format!("Strategy agent rejected the request: {}", error)
            }
            AuditEvent::FallbackAction {
                symbol,
                rule,
                trim_pct,
                quantity,
                rationale,
            } => format!(
                "FALLBACK [{}] trim {:.1}% of {} ({:+.4} shares): {}",
                rule, trim_pct, symbol, quantity, rationale
            ),
            AuditEvent::OrderSubmitted {
                symbol,
                signed_quantity,
                order_id,
                source,
            } => format!(
                "Order {} submitted for {} {:+.4} ({:?})",
                order_id, symbol, signed_quantity, source
            ),
            AuditEvent::OrderFailed {
                symbol,
                signed_quantity,
                source,
                reason,
            } => format!(
                "Order for {} {:+.4} ({:?}) failed: {}",
                symbol, signed_quantity, source, reason
            ),
            AuditEvent::ConfigWarning { warning } => format!("Config warning: {}", warning),
            AuditEvent::ConfigReloadFailed { reason } => {
                format!("Config reload failed, keeping previous config: {}", reason)
            }
            AuditEvent::StateTransition { from, to } => format!("State {} -> {}", from, to),
            AuditEvent::SessionOpened { date } => format!("Session {} opened", date),
            AuditEvent::SessionClosed { date } => format!("Session {} closed", date),
            AuditEvent::DataUnavailable { symbol, reason } => match symbol {
                Some(s) => format!("{} skipped this tick: {}", s, reason),
                None => format!("Data unavailable: {}", reason),
            },
            AuditEvent::InconsistentPosition { symbol, reason } => {
                format!("{} quarantined, refusing to act: {}", symbol, reason)
            }
            AuditEvent::PositionRecovered { symbol } => {
                format!("{} consistent again, quarantine lifted", symbol)
            }
        }
    }
}

/// Timestamped audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(timestamp: DateTime<Utc>, event: AuditEvent) -> Self {
        AuditRecord { timestamp, event }
    }

    pub fn now(event: AuditEvent) -> Self {
        Self::new(Utc::now(), event)
    }

    /// Mirror the record into the tracing output
    pub fn trace(&self) {
        let msg = self.event.message();
        match &self.event {
            AuditEvent::InconsistentPosition { .. } | AuditEvent::AgentExhausted { .. } => {
                error!("{}", msg)
            }
            AuditEvent::Trigger { .. }
            | AuditEvent::FallbackAction { .. }
            | AuditEvent::OrderFailed { .. }
            | AuditEvent::ConfigWarning { .. }
            | AuditEvent::ConfigReloadFailed { .. }
            | AuditEvent::DataUnavailable { .. }
            | AuditEvent::AgentRejected { .. } => warn!("{}", msg),
            AuditEvent::AgentAttempt { success: false, .. } => warn!("{}", msg),
            _ => info!("{}", msg),
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.event.kind() == kind)
            .count()
    }

    /// Remove and return everything recorded so far
    pub fn drain(&self) -> Vec<AuditRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Append-only JSON-lines alert file
pub struct JsonlAuditLog {
    file: Mutex<File>,
}

impl JsonlAuditLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open alert log: {}", path.display()))?;
        Ok(JsonlAuditLog {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonlAuditLog {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

/// Non-blocking front for a slow sink.
///
/// `append` only enqueues; a worker on the blocking pool forwards records
/// to the inner sink, so synchronous file writes never stall the runtime.
/// Must be created inside a tokio runtime.
pub struct BufferedAuditSink {
    tx: mpsc::Sender<AuditRecord>,
    dropped: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl BufferedAuditSink {
    pub fn spawn(inner: Arc<dyn AuditSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(capacity.max(1));
        let worker = tokio::task::spawn_blocking(move || {
            while let Some(record) = rx.blocking_recv() {
                if let Err(e) = inner.append(&record) {
                    warn!("Audit sink write failed: {}", e);
                }
            }
        });
        BufferedAuditSink {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            worker,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting records and wait for the backlog to drain
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            warn!("Audit worker ended abnormally: {}", e);
        }
    }
}

impl AuditSink for BufferedAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        if let Err(e) = self.tx.try_send(record.clone()) {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!("Audit buffer rejected record ({} dropped so far): {}", dropped, e);
        }
        Ok(())
    }
}

/// Records produced during one tick.
///
/// They stay in memory until the state manager has committed them; only
/// then does [`TickJournal::publish`] hand them to the external sink.
pub struct TickJournal {
    buffer: MemoryAuditSink,
    forward: Option<Arc<dyn AuditSink>>,
}

impl TickJournal {
    pub fn new(forward: Option<Arc<dyn AuditSink>>) -> Self {
        TickJournal {
            buffer: MemoryAuditSink::new(),
            forward,
        }
    }

    pub fn record(&self, event: AuditEvent) {
        let record = AuditRecord::now(event);
        if let Err(e) = self.append(&record) {
            warn!("Failed to record audit event: {}", e);
        }
    }

    pub fn take(&self) -> Vec<AuditRecord> {
        self.buffer.drain()
    }

    /// Forward committed records to the external sink
    pub fn publish(&self, records: &[AuditRecord]) {
        let Some(forward) = &self.forward else {
            return;
        };
        for record in records {
            if let Err(e) = forward.append(record) {
                warn!("External audit sink failed: {}", e);
            }
        }
    }
}

impl AuditSink for TickJournal {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        record.trace();
        self.buffer.append(record)
    }
}
