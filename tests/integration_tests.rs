//! Integration tests for the portfolio monitor
//!
//! These drive the full scheduler tick against in-memory collaborators and
//! an in-memory state store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use portfolio_monitor::agent::{AgentRequest, AgentResponse, StrategyAgent};
use portfolio_monitor::audit::{AuditEvent, MemoryAuditSink, OrderSource};
use portfolio_monitor::market::{Broker, MarketData};
use portfolio_monitor::state_manager::{PersistedState, SqliteStateManager};
use portfolio_monitor::{
    AgentError, Collaborators, Config, ConfigSource, DataError, Direction, Escalation,
    FallbackRuleName, LoadedConfig, MonitorState, OrderRequest, OrderResult, PortfolioSnapshot,
    Position, Regime, Scheduler, SignalStrength, StaticConfigSource, Symbol, TechnicalSignal,
    TriggerKind,
};

// =============================================================================
// Test Utilities
// =============================================================================

/// Wednesday 2026-10-14, 11:00 New York time, plus `minutes`
fn session_time(minutes: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 14, 15, 0, 0).unwrap() + Duration::minutes(minutes)
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.agent.backoff_secs = vec![0];
    config.agent.timeout_secs = 5;
    config.monitor.alert_log = None;
    config.review.scheduled_review_hours = 0.0;
    config.review.daily_loss_limit = 0.0;
    config
}

#[derive(Default)]
struct MockMarket {
    vix: Mutex<Option<f64>>,
    prices: Mutex<HashMap<Symbol, f64>>,
    signals: Mutex<HashMap<Symbol, TechnicalSignal>>,
    vix_calls: AtomicU32,
}

impl MockMarket {
    fn set_vix(&self, value: Option<f64>) {
        *self.vix.lock().unwrap() = value;
    }

    fn set_price(&self, symbol: &str, price: f64) {
        self.prices.lock().unwrap().insert(Symbol::new(symbol), price);
    }

    fn set_signal(&self, symbol: &str, strength: SignalStrength) {
        self.signals
            .lock()
            .unwrap()
            .insert(Symbol::new(symbol), TechnicalSignal::new(strength));
    }
}

#[async_trait]
impl MarketData for MockMarket {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, DataError> {
        self.prices
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| DataError::unavailable(format!("price for {}", symbol), "no quote"))
    }

    async fn get_volatility_index(&self) -> Result<f64, DataError> {
        self.vix_calls.fetch_add(1, Ordering::SeqCst);
        self.vix
            .lock()
            .unwrap()
            .ok_or_else(|| DataError::unavailable("volatility index", "feed down"))
    }

    async fn get_technical_signal(&self, symbol: &Symbol) -> Result<TechnicalSignal, DataError> {
        self.signals
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .ok_or_else(|| DataError::unavailable(format!("signal for {}", symbol), "no signal"))
    }
}

#[derive(Default)]
struct MockBroker {
    portfolio: Mutex<PortfolioSnapshot>,
    orders: Mutex<Vec<OrderRequest>>,
    /// Forces the reported post-fill quantity
    remaining_override: Mutex<Option<f64>>,
}

impl MockBroker {
    fn new(portfolio: PortfolioSnapshot) -> Self {
        MockBroker {
            portfolio: Mutex::new(portfolio),
            ..MockBroker::default()
        }
    }

    fn set_portfolio(&self, portfolio: PortfolioSnapshot) {
        *self.portfolio.lock().unwrap() = portfolio;
    }

    fn orders(&self) -> Vec<OrderRequest> {
        self.orders.lock().unwrap().clone()
    }

    fn quantity(&self, symbol: &str) -> Option<f64> {
        self.portfolio
            .lock()
            .unwrap()
            .position(&Symbol::new(symbol))
            .map(|p| p.quantity)
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResult, DataError> {
        let mut orders = self.orders.lock().unwrap();
        orders.push(order.clone());

        let forced = *self.remaining_override.lock().unwrap();
        let mut portfolio = self.portfolio.lock().unwrap();
        let remaining = match portfolio
            .positions
            .iter_mut()
            .find(|p| p.symbol == order.symbol)
        {
            Some(position) => {
                position.quantity = forced.unwrap_or(position.quantity + order.signed_quantity);
                position.quantity
            }
            None => forced.unwrap_or(order.signed_quantity),
        };

        Ok(OrderResult {
            order_id: format!("T-{}", orders.len()),
            filled_quantity: order.signed_quantity,
            remaining_quantity: Some(remaining),
        })
    }

    async fn get_portfolio(&self) -> Result<PortfolioSnapshot, DataError> {
        Ok(self.portfolio.lock().unwrap().clone())
    }
}

/// Replays scripted results; the last one repeats
struct ScriptedAgent {
    script: Mutex<VecDeque<Result<AgentResponse, AgentError>>>,
    calls: AtomicU32,
}

impl ScriptedAgent {
    fn new(script: Vec<Result<AgentResponse, AgentError>>) -> Self {
        ScriptedAgent {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        }
    }

    fn always(result: Result<AgentResponse, AgentError>) -> Self {
        Self::new(vec![result])
    }

    fn ok(text: &str) -> Self {
        Self::always(Ok(AgentResponse::new(text)))
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StrategyAgent for ScriptedAgent {
    async fn invoke(&self, _request: &AgentRequest) -> Result<AgentResponse, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        let next = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        next.unwrap_or_else(|| Ok(AgentResponse::new("ANALYSIS\nNothing to do")))
    }
}

fn unreachable_agent() -> ScriptedAgent {
    ScriptedAgent::always(Err(AgentError::Transport("connection refused".to_string())))
}

struct Harness {
    market: Arc<MockMarket>,
    broker: Arc<MockBroker>,
    agent: Arc<ScriptedAgent>,
    config: Arc<StaticConfigSource>,
    state: Arc<SqliteStateManager>,
    audit: Arc<MemoryAuditSink>,
}

impl Harness {
    fn new(config: Config, portfolio: PortfolioSnapshot, agent: ScriptedAgent) -> Self {
        let market = MockMarket::default();
        market.set_vix(Some(17.0));
        for position in &portfolio.positions {
            market.set_price(position.symbol.as_str(), position.current_price);
        }
        Harness {
            market: Arc::new(market),
            broker: Arc::new(MockBroker::new(portfolio)),
            agent: Arc::new(agent),
            config: Arc::new(StaticConfigSource::new(config)),
            state: Arc::new(SqliteStateManager::in_memory().unwrap()),
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }

    fn scheduler(&self) -> Scheduler {
        self.scheduler_with(self.config.clone())
    }

    fn scheduler_with(&self, source: Arc<dyn ConfigSource>) -> Scheduler {
        let collaborators = Collaborators {
            market: self.market.clone(),
            broker: self.broker.clone(),
            agent: self.agent.clone(),
        };
        Scheduler::new(source, collaborators, self.state.clone())
            .unwrap()
            .with_audit_sink(self.audit.clone())
    }
}

/// Static source that can be switched to fail like an unreadable file
struct FlakyConfigSource {
    inner: StaticConfigSource,
    failing: AtomicBool,
}

impl FlakyConfigSource {
    fn new(config: Config) -> Self {
        FlakyConfigSource {
            inner: StaticConfigSource::new(config),
            failing: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ConfigSource for FlakyConfigSource {
    fn load(&self) -> anyhow::Result<LoadedConfig> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("monitor.json: EOF while parsing an object at line 12");
        }
        self.inner.load()
    }
}

fn losing_nvda() -> PortfolioSnapshot {
    // 10 @ 100 marked at 79: -21%
    PortfolioSnapshot::new(vec![Position::new("NVDA", 10.0, 100.0, 79.0)], 100_000.0)
}

// =============================================================================
// End-to-end scenarios
// =============================================================================

#[tokio::test]
async fn test_regime_sequence_reports_single_transition() {
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(vec![], 100_000.0),
        ScriptedAgent::ok("ANALYSIS\nVolatility rising, hold."),
    );
    let mut scheduler = harness.scheduler();

    let mut regimes = Vec::new();
    let mut transitions = Vec::new();
    for (i, vix) in [12.0, 14.0, 22.0, 25.0].into_iter().enumerate() {
        harness.market.set_vix(Some(vix));
        let report = scheduler.tick(session_time(i as i64 * 5)).await.unwrap();
        regimes.push(report.regime.unwrap());
        for trigger in report.triggers {
            transitions.push((i, trigger.kind));
        }
    }

    assert_eq!(
        regimes,
        vec![Regime::Calm, Regime::Calm, Regime::Elevated, Regime::Elevated]
    );
    assert_eq!(transitions.len(), 1);
    let (at, kind) = &transitions[0];
    assert_eq!(*at, 2);
    assert!(matches!(
        kind,
        TriggerKind::RegimeTransition {
            from: Regime::Calm,
            to: Regime::Elevated,
            direction: Direction::Rising,
            ..
        }
    ));
    assert_eq!(harness.agent.calls(), 1);
}

#[tokio::test]
async fn test_stop_loss_escalates_once_and_falls_back_once() {
    let harness = Harness::new(test_config(), losing_nvda(), unreachable_agent());
    let mut scheduler = harness.scheduler();

    let first = scheduler.tick(session_time(0)).await.unwrap();
    assert_eq!(first.triggers.len(), 1);
    assert!(matches!(
        first.triggers[0].kind,
        TriggerKind::StopLoss { ref symbol, .. } if symbol.as_str() == "NVDA"
    ));
    assert_eq!(
        first.escalation,
        Some(Escalation::Exhausted {
            attempts: 3,
            consecutive_failures: 3
        })
    );
    assert_eq!(first.state, MonitorState::Degraded);

    // Fallback closes the breached position
    let actions = first.fallback.expect("fallback evaluated");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].symbol(), &Symbol::new("NVDA"));
    assert_eq!(actions[0].rule(), FallbackRuleName::StopLossExit);
    let orders = harness.broker.orders();
    assert_eq!(orders.len(), 1);
    assert!((orders[0].signed_quantity + 10.0).abs() < 1e-9);
    assert_eq!(harness.broker.quantity("NVDA"), Some(0.0));

    // Still breached: no new trigger, no new escalation
    let second = scheduler.tick(session_time(5)).await.unwrap();
    assert!(second.triggers.is_empty());
    assert!(second.escalation.is_none());
    assert!(second.fallback.is_none());
    assert_eq!(second.state, MonitorState::Degraded);
    assert_eq!(harness.broker.orders().len(), 1);

    assert_eq!(harness.agent.calls(), 3);
    assert_eq!(harness.audit.count("agent_exhausted"), 1);
    assert_eq!(harness.audit.count("agent_attempt"), 3);
    assert_eq!(harness.state.audit_count(Some("agent_exhausted")).unwrap(), 1);
}

#[tokio::test]
async fn test_fallback_trims_only_overbought_symbol() {
    let portfolio = PortfolioSnapshot::new(
        vec![
            Position::new("NVDA", 10.0, 100.0, 132.0),
            Position::new("AAPL", 10.0, 100.0, 105.0),
            Position::new("INTC", 10.0, 100.0, 95.0),
        ],
        100_000.0,
    );
    let mut config = test_config();
    config.thresholds = config.thresholds.with_profit_floor("AAPL", 110.0);
    let harness = Harness::new(config, portfolio, unreachable_agent());
    harness.market.set_signal("NVDA", SignalStrength::VeryStrong);
    harness.market.set_signal("AAPL", SignalStrength::Weak);
    harness.market.set_signal("INTC", SignalStrength::None);
    let mut scheduler = harness.scheduler();

    // AAPL under its profit floor forces the escalation
    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(matches!(
        report.triggers[0].kind,
        TriggerKind::ProfitProtection { ref symbol, .. } if symbol.as_str() == "AAPL"
    ));
    let actions = report.fallback.expect("fallback evaluated");
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].symbol(), &Symbol::new("NVDA"));
    assert_eq!(actions[0].rule(), FallbackRuleName::ExtremeOverbought);
    assert!((actions[0].trim_fraction().get() - 0.30).abs() < 1e-12);

    let orders = harness.broker.orders();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].symbol, Symbol::new("NVDA"));
    assert!((orders[0].signed_quantity + 3.0).abs() < 1e-9);
    assert!((harness.broker.quantity("NVDA").unwrap() - 7.0).abs() < 1e-9);
    assert_eq!(harness.broker.quantity("AAPL"), Some(10.0));
    assert_eq!(harness.broker.quantity("INTC"), Some(10.0));

    let submitted: Vec<_> = harness
        .audit
        .records()
        .into_iter()
        .filter_map(|r| match r.event {
            AuditEvent::OrderSubmitted { source, .. } => Some(source),
            _ => None,
        })
        .collect();
    assert_eq!(submitted, vec![OrderSource::Fallback]);
}

#[tokio::test]
async fn test_restart_resumes_failure_counter() {
    let harness = Harness::new(test_config(), losing_nvda(), unreachable_agent());
    harness
        .state
        .save_state(&PersistedState {
            consecutive_failures: 2,
            monitor_state: MonitorState::Active,
            last_session_date: Some(session_time(0).date_naive()),
            cycle_count: 40,
            ..PersistedState::default()
        })
        .unwrap();

    let mut scheduler = harness.scheduler();
    assert_eq!(scheduler.state(), MonitorState::Active);
    assert_eq!(scheduler.retry_state().consecutive_failures(), 2);

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert_eq!(
        report.escalation,
        Some(Escalation::Exhausted {
            attempts: 1,
            consecutive_failures: 3
        })
    );
    assert_eq!(report.state, MonitorState::Degraded);
    assert_eq!(harness.agent.calls(), 1);

    let persisted = harness.state.load_state().unwrap().unwrap();
    assert_eq!(persisted.consecutive_failures, 3);
    assert_eq!(persisted.monitor_state, MonitorState::Degraded);
    assert_eq!(persisted.cycle_count, 41);
}

// =============================================================================
// Agent outcomes
// =============================================================================

#[tokio::test]
async fn test_agent_orders_are_submitted() {
    let harness = Harness::new(
        test_config(),
        losing_nvda(),
        ScriptedAgent::ok("ANALYSIS\nStop hit.\n\nRECOMMENDATIONS\n1. SELL 4 NVDA to cut risk\n"),
    );
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert_eq!(
        report.escalation,
        Some(Escalation::Succeeded {
            attempts: 1,
            intents: 1
        })
    );
    assert_eq!(report.orders_submitted, 1);
    assert_eq!(report.state, MonitorState::Active);
    assert_eq!(harness.broker.quantity("NVDA"), Some(6.0));

    let transitions: Vec<_> = harness
        .audit
        .records()
        .into_iter()
        .filter_map(|r| match r.event {
            AuditEvent::StateTransition { from, to } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (MonitorState::Sleeping, MonitorState::Active),
            (MonitorState::Active, MonitorState::Escalating),
            (MonitorState::Escalating, MonitorState::Active),
        ]
    );
}

#[tokio::test]
async fn test_non_retriable_failure_leaves_counter_and_skips_fallback() {
    let harness = Harness::new(
        test_config(),
        losing_nvda(),
        ScriptedAgent::always(Err(AgentError::Auth("invalid x-api-key".to_string()))),
    );
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(matches!(
        report.escalation,
        Some(Escalation::Rejected(AgentError::Auth(_)))
    ));
    assert!(report.fallback.is_none());
    assert_eq!(report.state, MonitorState::Active);
    assert_eq!(scheduler.retry_state().consecutive_failures(), 0);
    assert_eq!(harness.agent.calls(), 1);
    assert_eq!(harness.audit.count("agent_rejected"), 1);
}

#[tokio::test]
async fn test_recovery_after_degraded() {
    let harness = Harness::new(
        test_config(),
        losing_nvda(),
        ScriptedAgent::new(vec![
            Err(AgentError::Overloaded("529".to_string())),
            Err(AgentError::Overloaded("529".to_string())),
            Err(AgentError::Overloaded("529".to_string())),
            Ok(AgentResponse::new("ANALYSIS\nBack online.")),
        ]),
    );
    let mut scheduler = harness.scheduler();

    let first = scheduler.tick(session_time(0)).await.unwrap();
    assert_eq!(first.state, MonitorState::Degraded);
    // Reinstate the position the fallback closed so the stop can clear and recur
    harness.broker.set_portfolio(losing_nvda());

    // Clear then re-breach to raise a fresh trigger
    harness.market.set_price("NVDA", 95.0);
    scheduler.tick(session_time(5)).await.unwrap();
    harness.market.set_price("NVDA", 78.0);
    let third = scheduler.tick(session_time(10)).await.unwrap();

    assert_eq!(third.triggers.len(), 1);
    assert!(matches!(
        third.escalation,
        Some(Escalation::Succeeded { attempts: 1, .. })
    ));
    assert_eq!(third.state, MonitorState::Active);
    assert_eq!(scheduler.retry_state().consecutive_failures(), 0);
    assert!(scheduler.retry_state().last_success().is_some());
}

// =============================================================================
// Configuration
// =============================================================================

#[tokio::test]
async fn test_config_changes_apply_next_tick() {
    let portfolio =
        PortfolioSnapshot::new(vec![Position::new("NVDA", 10.0, 100.0, 88.0)], 100_000.0);
    let harness = Harness::new(test_config(), portfolio, ScriptedAgent::ok("ANALYSIS\nok"));
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(report.triggers.is_empty());

    let mut tighter = test_config();
    tighter.thresholds.default_stop_loss = 0.10;
    harness.config.replace(tighter);
    let report = scheduler.tick(session_time(5)).await.unwrap();
    assert_eq!(report.triggers.len(), 1);
    assert!(matches!(
        report.triggers[0].kind,
        TriggerKind::StopLoss { stop_loss, .. } if (stop_loss - 0.10).abs() < 1e-12
    ));

    // Invalid value: warning recorded, safe default (20%) applied
    let mut invalid = test_config();
    invalid.thresholds.default_stop_loss = 1.5;
    harness.config.replace(invalid);
    let report = scheduler.tick(session_time(10)).await.unwrap();
    assert!(report.triggers.is_empty());
    assert_eq!(harness.audit.count("config_warning"), 1);
    assert!((scheduler.config().thresholds.default_stop_loss - 0.20).abs() < 1e-12);

    // Same invalid config again: no repeated warning
    scheduler.tick(session_time(15)).await.unwrap();
    assert_eq!(harness.audit.count("config_warning"), 1);
}

#[tokio::test]
async fn test_config_reload_failure_keeps_last_good_config() {
    let mut tight = test_config();
    tight.thresholds.default_stop_loss = 0.10;
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(vec![Position::new("NVDA", 10.0, 100.0, 95.0)], 100_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let source = Arc::new(FlakyConfigSource::new(tight));
    let mut scheduler = harness.scheduler_with(source.clone());

    assert!(scheduler.tick(session_time(0)).await.unwrap().triggers.is_empty());

    source.set_failing(true);
    scheduler.tick(session_time(5)).await.unwrap();
    assert!((scheduler.config().thresholds.default_stop_loss - 0.10).abs() < 1e-12);

    // Last good stop still enforced while the file is unreadable
    harness.market.set_price("NVDA", 88.0);
    let report = scheduler.tick(session_time(10)).await.unwrap();
    assert_eq!(report.triggers.len(), 1);
    assert!(matches!(
        report.triggers[0].kind,
        TriggerKind::StopLoss { stop_loss, .. } if (stop_loss - 0.10).abs() < 1e-12
    ));
    assert_eq!(harness.audit.count("config_reload_failed"), 1);

    // A good load re-arms the alert for the next failure
    source.set_failing(false);
    scheduler.tick(session_time(15)).await.unwrap();
    assert_eq!(harness.audit.count("config_reload_failed"), 1);
    source.set_failing(true);
    scheduler.tick(session_time(20)).await.unwrap();
    assert_eq!(harness.audit.count("config_reload_failed"), 2);
    assert_eq!(
        harness.state.audit_count(Some("config_reload_failed")).unwrap(),
        2
    );
}

#[tokio::test]
async fn test_symbol_override_and_regime_stop() {
    let portfolio = PortfolioSnapshot::new(
        vec![
            Position::new("TSLA", 10.0, 100.0, 84.0),
            Position::new("KO", 10.0, 100.0, 88.0),
        ],
        100_000.0,
    );
    let mut config = test_config();
    config.thresholds = config.thresholds.with_symbol_stop("TSLA", 0.25);
    let harness = Harness::new(config, portfolio, ScriptedAgent::ok("ANALYSIS\nok"));
    let mut scheduler = harness.scheduler();

    // NORMAL: default 20% applies to KO, 25% override to TSLA
    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(report.triggers.is_empty());

    // HIGH: KO moves to 10%, TSLA keeps its override
    harness.market.set_vix(Some(35.0));
    let report = scheduler.tick(session_time(5)).await.unwrap();
    let symbols: Vec<_> = report
        .triggers
        .iter()
        .filter_map(|t| t.kind.symbol().map(|s| s.as_str().to_string()))
        .collect();
    assert_eq!(symbols, vec!["KO".to_string()]);
    assert!(report
        .triggers
        .iter()
        .any(|t| matches!(t.kind, TriggerKind::RegimeTransition { to: Regime::High, .. })));
}

// =============================================================================
// Sessions and persistence
// =============================================================================

#[tokio::test]
async fn test_sleeps_outside_session() {
    let harness = Harness::new(test_config(), losing_nvda(), unreachable_agent());
    let mut scheduler = harness.scheduler();

    // Saturday
    let saturday = Utc.with_ymd_and_hms(2026, 10, 17, 15, 0, 0).unwrap();
    let report = scheduler.tick(saturday).await.unwrap();
    assert_eq!(report.state, MonitorState::Sleeping);
    assert!(report.triggers.is_empty());
    assert_eq!(harness.market.vix_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.agent.calls(), 0);
    assert!(scheduler.next_wake(saturday) <= std::time::Duration::from_secs(900));
}

#[tokio::test]
async fn test_session_open_and_close_are_idempotent() {
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(vec![], 50_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let mut scheduler = harness.scheduler();

    scheduler.tick(session_time(0)).await.unwrap();
    scheduler.tick(session_time(5)).await.unwrap();
    assert_eq!(harness.audit.count("session_opened"), 1);
    assert_eq!(scheduler.state(), MonitorState::Active);

    // 17:00 New York
    let closed = scheduler.tick(session_time(360)).await.unwrap();
    assert_eq!(closed.state, MonitorState::Sleeping);
    scheduler.tick(session_time(365)).await.unwrap();
    assert_eq!(harness.audit.count("session_closed"), 1);

    // A restart later the same evening does not reopen the session
    drop(scheduler);
    let mut restarted = harness.scheduler();
    assert_eq!(restarted.state(), MonitorState::Sleeping);
    restarted.tick(session_time(370)).await.unwrap();
    assert_eq!(harness.audit.count("session_opened"), 1);
    assert_eq!(harness.audit.count("session_closed"), 1);
}

#[tokio::test]
async fn test_restart_mid_session_keeps_regime() {
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(vec![], 50_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    harness.market.set_vix(Some(12.0));
    let mut scheduler = harness.scheduler();
    scheduler.tick(session_time(0)).await.unwrap();
    drop(scheduler);

    let mut restarted = harness.scheduler();
    assert_eq!(restarted.regime(), Some(Regime::Calm));
    assert_eq!(restarted.state(), MonitorState::Active);

    // Regime moved while we were down: reported against the persisted one
    harness.market.set_vix(Some(22.0));
    let report = restarted.tick(session_time(5)).await.unwrap();
    assert_eq!(report.triggers.len(), 1);
    assert_eq!(harness.audit.count("session_opened"), 1);
}

#[tokio::test]
async fn test_wakes_at_session_close() {
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(vec![], 50_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let mut scheduler = harness.scheduler();

    // 15:58 New York: two minutes to the close
    let now = session_time(298);
    scheduler.tick(now).await.unwrap();
    assert_eq!(scheduler.next_wake(now), std::time::Duration::from_secs(121));
    assert_eq!(
        scheduler.next_wake(session_time(0)),
        std::time::Duration::from_secs(300)
    );
}

// =============================================================================
// Degraded data
// =============================================================================

#[tokio::test]
async fn test_missing_volatility_index_keeps_monitoring() {
    let harness = Harness::new(test_config(), losing_nvda(), ScriptedAgent::ok("ANALYSIS\nok"));
    harness.market.set_vix(None);
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(report.regime.is_none());
    assert_eq!(report.triggers.len(), 1);
    assert_eq!(harness.audit.count("data_unavailable"), 1);
}

#[tokio::test]
async fn test_inconsistent_position_is_quarantined_until_fixed() {
    let harness = Harness::new(
        test_config(),
        PortfolioSnapshot::new(
            vec![
                Position::new("BAD", 10.0, 0.0, 50.0),
                Position::new("NVDA", 10.0, 100.0, 79.0),
            ],
            100_000.0,
        ),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(scheduler.is_quarantined(&Symbol::new("BAD")));
    assert_eq!(report.triggers.len(), 1);
    assert_eq!(harness.audit.count("inconsistent_position"), 1);

    harness.broker.set_portfolio(PortfolioSnapshot::new(
        vec![
            Position::new("BAD", 10.0, 40.0, 50.0),
            Position::new("NVDA", 10.0, 100.0, 79.0),
        ],
        100_000.0,
    ));
    scheduler.tick(session_time(5)).await.unwrap();
    assert!(!scheduler.is_quarantined(&Symbol::new("BAD")));
    assert_eq!(harness.audit.count("position_recovered"), 1);
}

#[tokio::test]
async fn test_unusable_neighbour_does_not_drive_fallback() {
    let mut config = test_config();
    config.review.daily_loss_limit = 0.02;
    let mut bad = Position::new("BAD", 10.0, 50.0, 50.0);
    bad.current_price = f64::NAN;
    let harness = Harness::new(
        config,
        PortfolioSnapshot::new(
            vec![
                Position::new("AAPL", 10.0, 100.0, 140.0),
                bad,
                Position::new("NVDA", 10.0, 100.0, 79.0),
            ],
            1_000_000.0,
        ),
        unreachable_agent(),
    );
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(scheduler.is_quarantined(&Symbol::new("BAD")));
    let actions = report.fallback.expect("fallback evaluated");
    let rules: Vec<_> = actions
        .iter()
        .map(|a| (a.symbol().as_str().to_string(), a.rule()))
        .collect();
    // Nearly all cash: the healthy winner is left alone
    assert_eq!(
        rules,
        vec![("NVDA".to_string(), FallbackRuleName::StopLossExit)]
    );
    assert_eq!(harness.broker.quantity("AAPL"), Some(10.0));

    // No session baseline from an unusable valuation
    let persisted = harness.state.load_state().unwrap().unwrap();
    assert_eq!(persisted.session_start_equity, None);

    harness.market.set_price("BAD", 50.0);
    harness.broker.set_portfolio(PortfolioSnapshot::new(
        vec![
            Position::new("AAPL", 10.0, 100.0, 140.0),
            Position::new("BAD", 10.0, 50.0, 50.0),
        ],
        1_000_000.0,
    ));
    scheduler.tick(session_time(5)).await.unwrap();
    assert!(!scheduler.is_quarantined(&Symbol::new("BAD")));
    let persisted = harness.state.load_state().unwrap().unwrap();
    assert_eq!(persisted.session_start_equity, Some(1_001_900.0));
}

#[tokio::test]
async fn test_fill_crossing_zero_quarantines_symbol() {
    let harness = Harness::new(
        test_config(),
        losing_nvda(),
        ScriptedAgent::ok("ANALYSIS\nStop hit.\n\nRECOMMENDATIONS\n1. SELL 10 NVDA\n"),
    );
    *harness.broker.remaining_override.lock().unwrap() = Some(-5.0);
    let mut scheduler = harness.scheduler();

    scheduler.tick(session_time(0)).await.unwrap();
    assert!(scheduler.is_quarantined(&Symbol::new("NVDA")));
    assert_eq!(harness.audit.count("inconsistent_position"), 1);

    // Valid (short) data does not lift a crossed-zero quarantine
    let report = scheduler.tick(session_time(5)).await.unwrap();
    assert!(report.triggers.is_empty());
    assert!(scheduler.is_quarantined(&Symbol::new("NVDA")));
    assert_eq!(harness.audit.count("position_recovered"), 0);
}

#[tokio::test]
async fn test_daily_loss_limit_fires_once() {
    let mut config = test_config();
    config.review.daily_loss_limit = 0.02;
    let harness = Harness::new(
        config,
        PortfolioSnapshot::new(vec![Position::new("NVDA", 100.0, 100.0, 100.0)], 10_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let mut scheduler = harness.scheduler();

    let report = scheduler.tick(session_time(0)).await.unwrap();
    assert!(report.triggers.is_empty());

    // Equity 20,000 -> 19,500: 2.5% down
    harness.market.set_price("NVDA", 95.0);
    let report = scheduler.tick(session_time(5)).await.unwrap();
    assert_eq!(report.triggers.len(), 1);
    assert!(matches!(
        report.triggers[0].kind,
        TriggerKind::DailyLossLimit { loss_pct, .. } if (loss_pct - 2.5).abs() < 1e-9
    ));

    let report = scheduler.tick(session_time(10)).await.unwrap();
    assert!(report.triggers.is_empty());
}

#[tokio::test]
async fn test_scheduled_review() {
    let mut config = test_config();
    config.review.scheduled_review_hours = 1.0;
    let harness = Harness::new(
        config,
        PortfolioSnapshot::new(vec![], 50_000.0),
        ScriptedAgent::ok("ANALYSIS\nok"),
    );
    let mut scheduler = harness.scheduler();

    assert!(scheduler.tick(session_time(0)).await.unwrap().triggers.is_empty());
    assert!(scheduler.tick(session_time(30)).await.unwrap().triggers.is_empty());
    let report = scheduler.tick(session_time(60)).await.unwrap();
    assert_eq!(report.triggers.len(), 1);
    assert!(matches!(
        report.triggers[0].kind,
        TriggerKind::ScheduledReview { .. }
    ));
    assert!(scheduler.tick(session_time(65)).await.unwrap().triggers.is_empty());
}
