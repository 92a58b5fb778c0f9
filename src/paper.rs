//! Paper-trading collaborators
//!
//! `FileMarketFeed` re-reads a JSON quote file on every call so an operator
//! (or a script) can move prices and the volatility index while the monitor
//! runs. `PaperBroker` keeps an in-memory account seeded from a JSON file and
//! fills market orders immediately at the feed's price.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::error::DataError;
use crate::market::{Broker, MarketData};
use crate::types::{
    Money, OrderRequest, OrderResult, PortfolioSnapshot, Position, Symbol, TechnicalSignal,
};

/// Quote file layout
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuoteFile {
    #[serde(default)]
    pub volatility_index: Option<f64>,
    #[serde(default)]
    pub prices: HashMap<String, f64>,
    /// RSI per symbol, mapped to signal strength
    #[serde(default)]
    pub rsi: HashMap<String, f64>,
    /// Explicit signals, taking precedence over RSI
    #[serde(default)]
    pub signals: HashMap<String, TechnicalSignal>,
}

impl QuoteFile {
    fn lookup<'a, T>(map: &'a HashMap<String, T>, symbol: &Symbol) -> Option<&'a T> {
        map.get(symbol.as_str()).or_else(|| {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(symbol.as_str()))
                .map(|(_, v)| v)
        })
    }
}

pub struct FileMarketFeed {
    path: PathBuf,
}

impl FileMarketFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileMarketFeed { path: path.into() }
    }

    fn read(&self) -> Result<QuoteFile, DataError> {
        let contents = std::fs::read_to_string(&self.path).map_err(|e| {
            DataError::unavailable(format!("quote file {}", self.path.display()), e.to_string())
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            DataError::unavailable(format!("quote file {}", self.path.display()), e.to_string())
        })
    }
}

#[async_trait]
impl MarketData for FileMarketFeed {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, DataError> {
        let quotes = self.read()?;
        QuoteFile::lookup(&quotes.prices, symbol)
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)
            .ok_or_else(|| DataError::unavailable(format!("price for {}", symbol), "no quote"))
    }

    async fn get_volatility_index(&self) -> Result<f64, DataError> {
        self.read()?
            .volatility_index
            .filter(|v| v.is_finite())
            .ok_or_else(|| DataError::unavailable("volatility index", "no reading"))
    }

    async fn get_technical_signal(&self, symbol: &Symbol) -> Result<TechnicalSignal, DataError> {
        let quotes = self.read()?;
        if let Some(signal) = QuoteFile::lookup(&quotes.signals, symbol) {
            return Ok(*signal);
        }
        QuoteFile::lookup(&quotes.rsi, symbol)
            .map(|rsi| TechnicalSignal::from_rsi(*rsi))
            .ok_or_else(|| DataError::unavailable(format!("signal for {}", symbol), "no RSI"))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SeedPosition {
    symbol: String,
    quantity: f64,
    entry_price: f64,
    #[serde(default)]
    current_price: Option<f64>,
    #[serde(default)]
    beta: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedPortfolio {
    cash: f64,
    #[serde(default)]
    positions: Vec<SeedPosition>,
}

struct PaperAccount {
    positions: Vec<Position>,
    cash: Money,
}

pub struct PaperBroker {
    account: Mutex<PaperAccount>,
    prices: Option<Arc<dyn MarketData>>,
    next_order: AtomicU64,
}

impl PaperBroker {
    pub fn new(portfolio: PortfolioSnapshot) -> Result<Self> {
        let cash = Money::from_f64(portfolio.cash)
            .ok_or_else(|| anyhow!("Invalid starting cash: {}", portfolio.cash))?;
        Ok(PaperBroker {
            account: Mutex::new(PaperAccount {
                positions: portfolio.positions,
                cash,
            }),
            prices: None,
            next_order: AtomicU64::new(1),
        })
    }

    /// Load the starting account from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read portfolio file: {}", path.display()))?;
        let seed: SeedPortfolio =
            serde_json::from_str(&contents).context("Failed to parse portfolio JSON")?;

        let positions = seed
            .positions
            .into_iter()
            .map(|p| {
                let current = p.current_price.unwrap_or(p.entry_price);
                Position::new(p.symbol.as_str(), p.quantity, p.entry_price, current)
                    .with_beta(p.beta.unwrap_or(1.0))
            })
            .collect::<Vec<_>>();

        info!(
            "Paper account loaded: {} positions, cash ${:.2}",
            positions.len(),
            seed.cash
        );
        Self::new(PortfolioSnapshot::new(positions, seed.cash))
    }

    /// Price fills from `prices` instead of the last known mark
    pub fn with_prices(mut self, prices: Arc<dyn MarketData>) -> Self {
        self.prices = Some(prices);
        self
    }

    pub fn snapshot(&self) -> PortfolioSnapshot {
        let account = self.account.lock().unwrap_or_else(PoisonError::into_inner);
        PortfolioSnapshot::new(account.positions.clone(), account.cash.to_f64())
    }

    pub fn cash(&self) -> Money {
        self.account
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cash
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResult, DataError> {
        if !order.signed_quantity.is_finite() || order.signed_quantity == 0.0 {
            return Err(DataError::OrderRejected {
                symbol: order.symbol.clone(),
                reason: format!("invalid quantity {}", order.signed_quantity),
            });
        }

        let quoted = match &self.prices {
            Some(feed) => Some(feed.get_price(&order.symbol).await?),
            None => None,
        };

        let mut account = self.account.lock().unwrap_or_else(PoisonError::into_inner);
        let idx = account.positions.iter().position(|p| p.symbol == order.symbol);
        let price = match (quoted, idx) {
            (Some(price), _) => price,
            (None, Some(i)) => account.positions[i].current_price,
            (None, None) => {
                return Err(DataError::OrderRejected {
                    symbol: order.symbol.clone(),
                    reason: "no price for new position".to_string(),
                })
            }
        };

        let cash = Money::notional(order.signed_quantity, price)
            .and_then(|notional| account.cash.checked_sub(notional))
            .ok_or_else(|| DataError::OrderRejected {
                symbol: order.symbol.clone(),
                reason: format!("cannot value {} @ {}", order.signed_quantity, price),
            })?;
        account.cash = cash;
        let remaining = match idx {
            Some(i) => {
                let position = &mut account.positions[i];
                position.quantity += order.signed_quantity;
                position.mark(price);
                let remaining = position.quantity;
                if remaining.abs() < 1e-9 {
                    account.positions.remove(i);
                    0.0
                } else {
                    remaining
                }
            }
            None => {
                account.positions.push(Position::new(
                    order.symbol.clone(),
                    order.signed_quantity,
                    price,
                    price,
                ));
                order.signed_quantity
            }
        };

        let order_id = format!("PAPER-{}", self.next_order.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Paper fill {}: {} {:+.4} @ {:.2}, remaining {:.4}",
            order_id, order.symbol, order.signed_quantity, price, remaining
        );
        Ok(OrderResult {
            order_id,
            filled_quantity: order.signed_quantity,
            remaining_quantity: Some(remaining),
        })
    }

    async fn get_portfolio(&self) -> Result<PortfolioSnapshot, DataError> {
        Ok(self.snapshot())
    }
}
