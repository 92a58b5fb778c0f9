// State Manager for the monitor loop
// SQLite-based persistence with JSON backup
//
// Holds the single record the scheduler needs to resume mid-session and the
// append-only audit trail. Each tick commits both in one transaction.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::audit::AuditRecord;
use crate::regime::Regime;
use crate::types::MonitorState;

// =============================================================================
// Data Models
// =============================================================================

/// Everything the scheduler needs to resume after a restart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    pub last_regime: Option<Regime>,
    pub last_volatility_index: Option<f64>,
    pub consecutive_failures: u32,
    pub last_success: Option<DateTime<Utc>>,
    /// Exchange-local date of the last session whose open was processed
    pub last_session_date: Option<NaiveDate>,
    pub last_review_at: Option<DateTime<Utc>>,
    pub session_start_equity: Option<f64>,
    pub monitor_state: MonitorState,
    pub cycle_count: i64,
    pub config_hash: String,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Audit row as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredAuditEntry {
    pub id: i64,
    pub timestamp: String,
    pub kind: String,
    pub symbol: Option<String>,
    pub message: String,
    pub payload: String,
}

impl StoredAuditEntry {
    pub fn record(&self) -> Option<AuditRecord> {
        serde_json::from_str(&self.payload).ok()
    }
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// =============================================================================
// State Manager Implementation
// =============================================================================

pub struct SqliteStateManager {
    conn: Arc<Mutex<Connection>>,
    json_backup_path: Option<PathBuf>,
}

impl SqliteStateManager {
    pub fn new<P: AsRef<Path>>(db_path: P, json_backup_path: Option<P>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let json_backup_path = json_backup_path.map(|p| p.as_ref().to_path_buf());

        // Create parent directories
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = json_backup_path.as_ref().and_then(|p| p.parent()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

        // Enable WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path,
        };

        manager.create_tables()?;
        info!("SQLite state manager initialized");

        Ok(manager)
    }

    /// Non-durable store for tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let manager = Self {
            conn: Arc::new(Mutex::new(conn)),
            json_backup_path: None,
        };
        manager.create_tables()?;
        Ok(manager)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("State database lock poisoned"))
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS monitor_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                last_regime TEXT,
                last_volatility_index REAL,
                consecutive_failures INTEGER NOT NULL DEFAULT 0,
                last_success TEXT,
                last_session_date TEXT,
                last_review_at TEXT,
                session_start_equity REAL,
                monitor_state TEXT NOT NULL DEFAULT 'sleeping',
                cycle_count INTEGER NOT NULL DEFAULT 0,
                config_hash TEXT,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                kind TEXT NOT NULL,
                symbol TEXT,
                message TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_audit_kind ON audit_log(kind)",
            [],
        )?;

        debug!("Database schema created/verified");
        Ok(())
    }

    fn write_state(conn: &Connection, state: &PersistedState) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO monitor_state
             (id, last_regime, last_volatility_index, consecutive_failures, last_success,
              last_session_date, last_review_at, session_start_equity, monitor_state,
              cycle_count, config_hash, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                state.last_regime.map(|r| r.as_str()),
                state.last_volatility_index,
                state.consecutive_failures,
                state.last_success.map(|t| t.to_rfc3339()),
                state.last_session_date.map(|d| d.format("%Y-%m-%d").to_string()),
                state.last_review_at.map(|t| t.to_rfc3339()),
                state.session_start_equity,
                state.monitor_state.as_str(),
                state.cycle_count,
                state.config_hash,
                state
                    .updated_at
                    .unwrap_or_else(Utc::now)
                    .to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn write_audit(conn: &Connection, record: &AuditRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        conn.execute(
            "INSERT INTO audit_log (timestamp, kind, symbol, message, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.timestamp.to_rfc3339(),
                record.event.kind(),
                record.event.symbol().map(|s| s.as_str().to_string()),
                record.event.message(),
                payload,
            ],
        )?;
        Ok(())
    }

    pub fn save_state(&self, state: &PersistedState) -> Result<()> {
        {
            let conn = self.conn()?;
            Self::write_state(&conn, state)?;
        }
        debug!(
            "State saved: cycle={}, state={}, failures={}",
            state.cycle_count, state.monitor_state, state.consecutive_failures
        );
        self.backup();
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<PersistedState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT last_regime, last_volatility_index, consecutive_failures, last_success,
                        last_session_date, last_review_at, session_start_equity, monitor_state,
                        cycle_count, config_hash, updated_at
                 FROM monitor_state WHERE id = 1",
                [],
                |row| {
                    Ok(PersistedState {
                        last_regime: row
                            .get::<_, Option<String>>(0)?
                            .and_then(|s| Regime::parse(&s)),
                        last_volatility_index: row.get(1)?,
                        consecutive_failures: row.get(2)?,
                        last_success: parse_time(row.get(3)?),
                        last_session_date: row
                            .get::<_, Option<String>>(4)?
                            .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok()),
                        last_review_at: parse_time(row.get(5)?),
                        session_start_equity: row.get(6)?,
                        monitor_state: MonitorState::parse(&row.get::<_, String>(7)?)
                            .unwrap_or_default(),
                        cycle_count: row.get(8)?,
                        config_hash: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                        updated_at: parse_time(row.get(10)?),
                    })
                },
            )
            .optional()?;

        match &state {
            Some(s) => info!(
                "Loaded state: cycle={}, state={}, regime={:?}, failures={}",
                s.cycle_count, s.monitor_state, s.last_regime, s.consecutive_failures
            ),
            None => debug!("No saved state found"),
        }
        Ok(state)
    }

    /// Persist a finished tick: state and its audit records, all or nothing.
    pub fn commit_tick(&self, state: &PersistedState, records: &[AuditRecord]) -> Result<()> {
        {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            Self::write_state(&tx, state)?;
            for record in records {
                Self::write_audit(&tx, record)?;
            }
            tx.commit().context("Failed to commit tick")?;
        }
        debug!(
            "Tick {} committed with {} audit record(s)",
            state.cycle_count,
            records.len()
        );
        self.backup();
        Ok(())
    }

    /// Most recent audit entries, newest first
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<StoredAuditEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, timestamp, kind, symbol, message, payload
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit as i64], |row| {
                Ok(StoredAuditEntry {
                    id: row.get(0)?,
                    timestamp: row.get(1)?,
                    kind: row.get(2)?,
                    symbol: row.get(3)?,
                    message: row.get(4)?,
                    payload: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn audit_count(&self, kind: Option<&str>) -> Result<i64> {
        let conn = self.conn()?;
        let count = match kind {
            Some(kind) => conn.query_row(
                "SELECT COUNT(*) FROM audit_log WHERE kind = ?1",
                params![kind],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    fn backup(&self) {
        if self.json_backup_path.is_some() {
            if let Err(e) = self.export_json() {
                warn!("State backup failed: {}", e);
            }
        }
    }

    pub fn export_json(&self) -> Result<()> {
        let Some(path) = &self.json_backup_path else {
            return Ok(());
        };
        let state = self.load_state()?;
        let recent = self.recent_audit(50)?;

        let backup = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "state": state,
            "recent_audit": recent,
        });

        std::fs::write(path, serde_json::to_string_pretty(&backup)?)?;
        debug!("State exported to: {}", path.display());
        Ok(())
    }
}

// =============================================================================
// Factory Function
// =============================================================================

pub fn create_state_manager<P: AsRef<Path>>(state_dir: P) -> Result<SqliteStateManager> {
    let state_dir = state_dir.as_ref();
    std::fs::create_dir_all(state_dir)?;

    let db_path = state_dir.join("monitor_state.db");
    let json_path = state_dir.join("monitor_state.json");

    SqliteStateManager::new(db_path, Some(json_path))
}
