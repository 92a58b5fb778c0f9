//! Scheduler / control loop
//!
//! One tick at a time: reload configuration, handle session boundaries,
//! classify the volatility regime, mark positions and look for breaches,
//! then escalate to the strategy agent or, once it is exhausted, hand the
//! portfolio to the fallback rules. The tick's state and audit records are
//! committed together at the end; a tick that fails before the commit leaves
//! no trace and is simply redone on the next wake-up.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInvoker, AgentRequest, RetryPolicy, RetryState, StrategyAgent};
use crate::audit::{AuditEvent, AuditSink, OrderSource, TickJournal};
use crate::config::{Config, ConfigSource, LoadedConfig};
use crate::error::{AgentError, InvokeError, PositionError};
use crate::fallback::{self, Thresholds};
use crate::market::{with_deadline, Broker, MarketData};
use crate::regime::{Regime, RegimeTracker};
use crate::session::MarketSession;
use crate::state_manager::{PersistedState, SqliteStateManager};
use crate::thresholds::resolve;
use crate::types::{
    FallbackAction, MonitorState, OrderRequest, OrderType, PortfolioSnapshot, Symbol,
    TriggerEvent, TriggerKind,
};

/// External capabilities the loop drives
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketData>,
    pub broker: Arc<dyn Broker>,
    pub agent: Arc<dyn StrategyAgent>,
}

/// How an escalation ended
#[derive(Debug, Clone, PartialEq)]
pub enum Escalation {
    Succeeded { attempts: u32, intents: usize },
    Exhausted { attempts: u32, consecutive_failures: u32 },
    Rejected(AgentError),
}

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub state: MonitorState,
    pub regime: Option<Regime>,
    pub triggers: Vec<TriggerEvent>,
    pub escalation: Option<Escalation>,
    /// Present when the fallback rules were evaluated this tick
    pub fallback: Option<Vec<FallbackAction>>,
    pub orders_submitted: usize,
}

#[derive(Debug, Clone)]
struct Quarantine {
    reason: String,
    /// Cleared only by an operator restart once the account is reconciled
    sticky: bool,
}

/// Breach identity for edge-triggering
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BreachKey {
    StopLoss(Symbol),
    ProfitFloor(Symbol),
    DailyLoss,
}

impl BreachKey {
    fn of(kind: &TriggerKind) -> Option<Self> {
        match kind {
            TriggerKind::StopLoss { symbol, .. } => Some(BreachKey::StopLoss(symbol.clone())),
            TriggerKind::ProfitProtection { symbol, .. } => {
                Some(BreachKey::ProfitFloor(symbol.clone()))
            }
            TriggerKind::DailyLossLimit { .. } => Some(BreachKey::DailyLoss),
            _ => None,
        }
    }

    fn symbol(&self) -> Option<&Symbol> {
        match self {
            BreachKey::StopLoss(s) | BreachKey::ProfitFloor(s) => Some(s),
            BreachKey::DailyLoss => None,
        }
    }
}

fn config_hash(loaded: &LoadedConfig) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    serde_json::to_string(&(&loaded.config, &loaded.warnings))
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

pub struct Scheduler {
    config_source: Arc<dyn ConfigSource>,
    config: Config,
    config_hash: String,
    reload_failing: bool,
    collaborators: Collaborators,
    state_manager: Arc<SqliteStateManager>,
    external_audit: Option<Arc<dyn AuditSink>>,

    monitor_state: MonitorState,
    tracker: RegimeTracker,
    last_volatility_index: Option<f64>,
    retry: RetryState,
    last_session_date: Option<NaiveDate>,
    last_review_at: Option<DateTime<Utc>>,
    session_start_equity: Option<f64>,
    breached: HashSet<BreachKey>,
    quarantined: BTreeMap<Symbol, Quarantine>,
    cycle_count: i64,
}

impl Scheduler {
    /// Build the loop and resume from whatever state was persisted.
    pub fn new(
        config_source: Arc<dyn ConfigSource>,
        collaborators: Collaborators,
        state_manager: Arc<SqliteStateManager>,
    ) -> Result<Self> {
        let loaded = config_source
            .load()
            .context("Failed to load initial configuration")?;
        let persisted = state_manager
            .load_state()
            .context("Failed to load persisted monitor state")?;
        let current_hash = config_hash(&loaded);

        let mut scheduler = Scheduler {
            config_source,
            config: loaded.config,
            config_hash: String::new(),
            reload_failing: false,
            collaborators,
            state_manager,
            external_audit: None,
            monitor_state: MonitorState::Sleeping,
            tracker: RegimeTracker::new(),
            last_volatility_index: None,
            retry: RetryState::new(),
            last_session_date: None,
            last_review_at: None,
            session_start_equity: None,
            breached: HashSet::new(),
            quarantined: BTreeMap::new(),
            cycle_count: 0,
        };

        if let Some(state) = persisted {
            scheduler.recover(state, &current_hash);
        } else {
            info!("No previous monitor state found, starting fresh");
        }
        Ok(scheduler)
    }

    /// Mirror every audit record to an additional sink
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.external_audit = Some(sink);
        self
    }

    fn recover(&mut self, state: PersistedState, current_hash: &str) {
        info!(
            "Recovering monitor state: cycle={}, state={}, regime={:?}, failures={}, session={:?}",
            state.cycle_count,
            state.monitor_state,
            state.last_regime,
            state.consecutive_failures,
            state.last_session_date
        );

        self.tracker = RegimeTracker::resume(state.last_regime);
        self.last_volatility_index = state.last_volatility_index;
        self.retry = RetryState::resume(state.consecutive_failures, state.last_success);
        self.last_session_date = state.last_session_date;
        self.last_review_at = state.last_review_at;
        self.session_start_equity = state.session_start_equity;
        self.cycle_count = state.cycle_count;
        self.monitor_state = match state.monitor_state {
            MonitorState::Sleeping => MonitorState::Sleeping,
            // An escalation interrupted by a crash is not resumed
            _ => self.awake_state(),
        };

        if !state.config_hash.is_empty() && state.config_hash != current_hash {
            warn!("Configuration has changed since last run");
        }
    }

    pub fn state(&self) -> MonitorState {
        self.monitor_state
    }

    pub fn regime(&self) -> Option<Regime> {
        self.tracker.current()
    }

    pub fn retry_state(&self) -> &RetryState {
        &self.retry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_quarantined(&self, symbol: &Symbol) -> bool {
        self.quarantined.contains_key(symbol)
    }

    fn policy(&self) -> RetryPolicy {
        RetryPolicy::from_settings(&self.config.agent)
    }

    /// Active unless the agent is already known to be exhausted
    fn awake_state(&self) -> MonitorState {
        if self.retry.is_exhausted(&self.policy()) {
            MonitorState::Degraded
        } else {
            MonitorState::Active
        }
    }

    fn session(&self) -> MarketSession {
        MarketSession::from_config(&self.config.session)
    }

    fn transition(&mut self, to: MonitorState, journal: &TickJournal) {
        if self.monitor_state != to {
            journal.record(AuditEvent::StateTransition {
                from: self.monitor_state,
                to,
            });
            self.monitor_state = to;
        }
    }

    fn quarantine(&mut self, err: &PositionError, sticky: bool, journal: &TickJournal) {
        let symbol = err.symbol().clone();
        if !self.quarantined.contains_key(&symbol) {
            journal.record(AuditEvent::InconsistentPosition {
                symbol: symbol.clone(),
                reason: err.to_string(),
            });
        }
        let entry = self.quarantined.entry(symbol).or_insert(Quarantine {
            reason: err.to_string(),
            sticky,
        });
        entry.sticky |= sticky;
    }

    fn release(&mut self, symbol: &Symbol, journal: &TickJournal) {
        if let Some(q) = self.quarantined.get(symbol) {
            if !q.sticky {
                debug!("{} released from quarantine ({})", symbol, q.reason);
                self.quarantined.remove(symbol);
                journal.record(AuditEvent::PositionRecovered {
                    symbol: symbol.clone(),
                });
            }
        }
    }

    fn reload_config(&mut self, journal: &TickJournal) {
        match self.config_source.load() {
            Ok(loaded) => {
                self.reload_failing = false;
                let hash = config_hash(&loaded);
                if hash != self.config_hash {
                    if !self.config_hash.is_empty() {
                        info!("Configuration change detected, applying");
                    }
                    for warning in &loaded.warnings {
                        journal.record(AuditEvent::ConfigWarning {
                            warning: warning.clone(),
                        });
                    }
                    self.config_hash = hash;
                }
                self.config = loaded.config;
            }
            Err(e) => {
                if !self.reload_failing {
                    journal.record(AuditEvent::ConfigReloadFailed {
                        reason: format!("{:#}", e),
                    });
                }
                self.reload_failing = true;
            }
        }
    }

    /// Handle open/close; returns whether the session is open.
    fn handle_session(&mut self, now: DateTime<Utc>, journal: &TickJournal) -> bool {
        let session = self.session();
        let date = session.session_date(now);

        if session.is_open(now) {
            if self.last_session_date != Some(date) {
                journal.record(AuditEvent::SessionOpened { date });
                self.last_session_date = Some(date);
                self.session_start_equity = None;
                self.breached.clear();
            }
            if self.monitor_state == MonitorState::Sleeping {
                let awake = self.awake_state();
                self.transition(awake, journal);
            }
            true
        } else {
            if self.monitor_state != MonitorState::Sleeping {
                if let Some(date) = self.last_session_date {
                    journal.record(AuditEvent::SessionClosed { date });
                }
                self.transition(MonitorState::Sleeping, journal);
            }
            false
        }
    }

    fn persisted_state(&self, now: DateTime<Utc>) -> PersistedState {
        PersistedState {
            last_regime: self.tracker.current(),
            last_volatility_index: self.last_volatility_index,
            consecutive_failures: self.retry.consecutive_failures(),
            last_success: self.retry.last_success(),
            last_session_date: self.last_session_date,
            last_review_at: self.last_review_at,
            session_start_equity: self.session_start_equity,
            monitor_state: self.monitor_state,
            cycle_count: self.cycle_count,
            config_hash: self.config_hash.clone(),
            updated_at: Some(now),
        }
    }

    /// Persist the tick, then mirror its records to the external sink
    fn commit(&self, now: DateTime<Utc>, journal: &TickJournal) -> Result<()> {
        let records = journal.take();
        self.state_manager
            .commit_tick(&self.persisted_state(now), &records)?;
        journal.publish(&records);
        Ok(())
    }

    /// Run one full evaluate-and-act cycle at `now`.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickReport> {
        let journal = TickJournal::new(self.external_audit.clone());
        self.cycle_count += 1;
        self.reload_config(&journal);

        let mut report = TickReport::default();

        if !self.handle_session(now, &journal) {
            report.state = self.monitor_state;
            report.regime = self.tracker.current();
            self.commit(now, &journal)?;
            return Ok(report);
        }

        let cfg = self.config.clone();
        let data_timeout = cfg.monitor.data_timeout();
        let market = self.collaborators.market.clone();
        let broker = self.collaborators.broker.clone();
        let mut triggers: Vec<TriggerKind> = Vec::new();

        // Volatility regime
        match with_deadline("volatility index", data_timeout, market.get_volatility_index()).await
        {
            Ok(vix) => {
                self.last_volatility_index = Some(vix);
                if let Some(change) = self.tracker.observe(&cfg.regime.breakpoints(), vix) {
                    triggers.push(TriggerKind::RegimeTransition {
                        from: change.from,
                        to: change.to,
                        direction: change.direction,
                        volatility_index: change.volatility_index,
                    });
                }
            }
            Err(e) => journal.record(AuditEvent::DataUnavailable {
                symbol: None,
                reason: e.to_string(),
            }),
        }
        let regime = self.tracker.current().unwrap_or(Regime::Normal);
        report.regime = self.tracker.current();

        // Portfolio; without it nothing else can be evaluated
        let mut portfolio =
            match with_deadline("portfolio", data_timeout, broker.get_portfolio()).await {
                Ok(p) => p,
                Err(e) => {
                    journal.record(AuditEvent::DataUnavailable {
                        symbol: None,
                        reason: e.to_string(),
                    });
                    report.state = self.monitor_state;
                    self.commit(now, &journal)?;
                    return Ok(report);
                }
            };

        // Positions
        let mut priced: HashSet<Symbol> = HashSet::new();
        let mut thresholds_by_symbol = Thresholds::new();
        let mut current_breaches: HashSet<BreachKey> = HashSet::new();
        for position in portfolio.positions.iter_mut() {
            if position.is_flat() {
                continue;
            }
            let symbol = position.symbol.clone();
            if self.quarantined.get(&symbol).is_some_and(|q| q.sticky) {
                continue;
            }
            if let Err(e) = position.validate() {
                self.quarantine(&e, false, &journal);
                continue;
            }

            match with_deadline(
                &format!("price for {}", symbol),
                data_timeout,
                market.get_price(&symbol),
            )
            .await
            {
                Ok(price) => position.mark(price),
                Err(e) => {
                    journal.record(AuditEvent::DataUnavailable {
                        symbol: Some(symbol.clone()),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }
            if let Err(e) = position.validate() {
                self.quarantine(&e, false, &journal);
                continue;
            }
            self.release(&symbol, &journal);
            priced.insert(symbol.clone());

            let thresholds = resolve(&symbol, regime, &cfg.thresholds);
            for kind in thresholds.breaches(position) {
                if let Some(key) = BreachKey::of(&kind) {
                    current_breaches.insert(key.clone());
                    if self.breached.insert(key) {
                        triggers.push(kind);
                    }
                }
            }
            thresholds_by_symbol.insert(symbol, thresholds);
        }
        // Re-arm breaches that cleared; keep those we could not re-check
        self.breached.retain(|key| match key.symbol() {
            Some(symbol) => current_breaches.contains(key) || !priced.contains(symbol),
            None => true,
        });

        // Daily loss circuit; skipped while any position value is unusable
        let equity = portfolio.equity();
        let limit = cfg.review.daily_loss_limit;
        if !equity.is_finite() {
            debug!("Portfolio equity not finite, daily loss check skipped");
        } else {
            let start_equity = *self.session_start_equity.get_or_insert(equity);
            if limit > 0.0 && start_equity > 0.0 {
                let loss = (start_equity - equity) / start_equity;
                if loss >= limit {
                    if self.breached.insert(BreachKey::DailyLoss) {
                        triggers.push(TriggerKind::DailyLossLimit {
                            loss_pct: loss * 100.0,
                            limit_pct: limit * 100.0,
                        });
                    }
                } else {
                    self.breached.remove(&BreachKey::DailyLoss);
                }
            }
        }

        // Scheduled review
        let review_hours = cfg.review.scheduled_review_hours;
        match self.last_review_at {
            None => self.last_review_at = Some(now),
            Some(last) if review_hours > 0.0 => {
                let hours = (now - last).num_seconds() as f64 / 3600.0;
                if hours >= review_hours {
                    triggers.push(TriggerKind::ScheduledReview {
                        hours_since_last: Some(hours),
                    });
                }
            }
            Some(_) => {}
        }

        if !triggers.is_empty() {
            let events: Vec<TriggerEvent> = triggers
                .into_iter()
                .map(|kind| TriggerEvent::new(now, kind))
                .collect();
            for event in &events {
                journal.record(AuditEvent::Trigger {
                    trigger: event.clone(),
                });
            }
            report.triggers = events.clone();
            self.last_review_at = Some(now);
            self.escalate(
                now,
                events,
                &portfolio,
                &priced,
                &thresholds_by_symbol,
                &journal,
                &mut report,
            )
            .await;
        }

        report.state = self.monitor_state;
        self.commit(now, &journal)?;
        Ok(report)
    }

    async fn escalate(
        &mut self,
        now: DateTime<Utc>,
        events: Vec<TriggerEvent>,
        portfolio: &PortfolioSnapshot,
        priced: &HashSet<Symbol>,
        thresholds: &Thresholds,
        journal: &TickJournal,
        report: &mut TickReport,
    ) {
        let previous = self.monitor_state;
        self.transition(MonitorState::Escalating, journal);

        let request = AgentRequest {
            at: now,
            triggers: events,
            portfolio: portfolio.clone(),
            regime: self.tracker.current(),
            volatility_index: self.last_volatility_index,
            session_start_equity: self.session_start_equity,
        };
        let invoker = AgentInvoker::new(self.policy());
        let agent = self.collaborators.agent.clone();

        match invoker
            .invoke(agent.as_ref(), &request, &mut self.retry, journal)
            .await
        {
            Ok(success) => {
                let recommendations = success.response.recommendations();
                let intents = success.response.order_intents();
                journal.record(AuditEvent::AgentSucceeded {
                    attempts: success.attempts,
                    recommendations,
                });
                report.escalation = Some(Escalation::Succeeded {
                    attempts: success.attempts,
                    intents: intents.len(),
                });
                self.transition(MonitorState::Active, journal);

                for intent in intents {
                    if self.is_quarantined(&intent.symbol) {
                        warn!("Ignoring agent order for quarantined {}", intent.symbol);
                        continue;
                    }
                    let before = portfolio.position(&intent.symbol).map(|p| p.quantity);
                    let order = OrderRequest {
                        symbol: intent.symbol.clone(),
                        signed_quantity: intent.signed_quantity,
                        order_type: OrderType::Market,
                    };
                    if self.submit(order, OrderSource::Agent, before, journal).await {
                        report.orders_submitted += 1;
                    }
                }
            }
            Err(InvokeError::Exhausted {
                attempts,
                consecutive_failures,
            }) => {
                journal.record(AuditEvent::AgentExhausted {
                    attempts,
                    consecutive_failures,
                });
                journal.record(AuditEvent::Trigger {
                    trigger: TriggerEvent::new(
                        now,
                        TriggerKind::AgentFailureThreshold {
                            consecutive_failures,
                        },
                    ),
                });
                report.escalation = Some(Escalation::Exhausted {
                    attempts,
                    consecutive_failures,
                });
                self.transition(MonitorState::Degraded, journal);

                let actions = self
                    .run_fallback(portfolio, priced, thresholds, journal)
                    .await;
                for action in &actions {
                    let before = portfolio.position(action.symbol()).map(|p| p.quantity);
                    if self
                        .submit(action.to_order(), OrderSource::Fallback, before, journal)
                        .await
                    {
                        report.orders_submitted += 1;
                    }
                }
                report.fallback = Some(actions);
            }
            Err(InvokeError::NonRetriable(e)) => {
                journal.record(AuditEvent::AgentRejected {
                    error: e.to_string(),
                });
                report.escalation = Some(Escalation::Rejected(e));
                self.transition(previous, journal);
            }
        }
    }

    async fn run_fallback(
        &mut self,
        portfolio: &PortfolioSnapshot,
        priced: &HashSet<Symbol>,
        thresholds: &Thresholds,
        journal: &TickJournal,
    ) -> Vec<FallbackAction> {
        let market = self.collaborators.market.clone();
        let data_timeout = self.config.monitor.data_timeout();

        let mut signals = HashMap::new();
        for position in &portfolio.positions {
            if !priced.contains(&position.symbol) {
                continue;
            }
            match with_deadline(
                &format!("signal for {}", position.symbol),
                data_timeout,
                market.get_technical_signal(&position.symbol),
            )
            .await
            {
                Ok(signal) => {
                    signals.insert(position.symbol.clone(), signal);
                }
                Err(e) => journal.record(AuditEvent::DataUnavailable {
                    symbol: Some(position.symbol.clone()),
                    reason: e.to_string(),
                }),
            }
        }

        let actions: Vec<FallbackAction> =
            fallback::evaluate(portfolio, &signals, thresholds, &self.config.fallback)
                .into_iter()
                .filter(|a| priced.contains(a.symbol()) && !self.is_quarantined(a.symbol()))
                .collect();

        if actions.is_empty() {
            info!("Fallback rules found nothing to trim");
        }
        for action in &actions {
            journal.record(AuditEvent::fallback(action));
        }
        actions
    }

    /// Submit one order; returns whether the broker accepted it.
    async fn submit(
        &mut self,
        order: OrderRequest,
        source: OrderSource,
        before: Option<f64>,
        journal: &TickJournal,
    ) -> bool {
        let broker = self.collaborators.broker.clone();
        let timeout = self.config.monitor.order_timeout();

        match with_deadline("order", timeout, broker.submit_order(&order)).await {
            Ok(result) => {
                journal.record(AuditEvent::OrderSubmitted {
                    symbol: order.symbol.clone(),
                    signed_quantity: order.signed_quantity,
                    order_id: result.order_id.clone(),
                    source,
                });
                if let (Some(before), Some(after)) = (before, result.remaining_quantity) {
                    if before * after < 0.0 {
                        let err = PositionError::CrossedZero {
                            symbol: order.symbol.clone(),
                            before,
                            after,
                        };
                        error!("{}", err);
                        self.quarantine(&err, true, journal);
                    }
                }
                true
            }
            Err(e) => {
                journal.record(AuditEvent::OrderFailed {
                    symbol: order.symbol.clone(),
                    signed_quantity: order.signed_quantity,
                    source,
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    /// Time to sleep before the next tick
    pub fn next_wake(&self, now: DateTime<Utc>) -> Duration {
        let interval = match self.monitor_state {
            MonitorState::Sleeping => self.config.monitor.sleeping_interval(),
            _ => self.config.monitor.active_interval(),
        };
        match self.session().time_until_boundary(now) {
            Some(until) => interval.min(until + Duration::from_secs(1)),
            None => interval,
        }
    }

    /// Tick until a shutdown message arrives.
    pub async fn run(&mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        info!("Starting monitor loop in {} state...", self.monitor_state);

        loop {
            match self.tick(Utc::now()).await {
                Ok(report) => debug!(
                    "Tick {} done: state={}, triggers={}, orders={}",
                    self.cycle_count,
                    report.state,
                    report.triggers.len(),
                    report.orders_submitted
                ),
                Err(e) => error!("Monitor tick failed: {:#}", e),
            }

            let wait = self.next_wake(Utc::now());
            debug!("Sleeping {}s until next tick", wait.as_secs());
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.state_manager.export_json()?;
        info!("Monitor stopped after {} cycles", self.cycle_count);
        Ok(())
    }
}
