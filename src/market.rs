//! Market data and broker collaborators
//!
//! The monitor only talks to the outside world through these traits. The
//! scheduler wraps every call in a deadline, so implementations may block on
//! the network without bounding themselves.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::DataError;
use crate::types::{OrderRequest, OrderResult, PortfolioSnapshot, Symbol, TechnicalSignal};

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn get_price(&self, symbol: &Symbol) -> Result<f64, DataError>;

    async fn get_volatility_index(&self) -> Result<f64, DataError>;

    async fn get_technical_signal(&self, symbol: &Symbol) -> Result<TechnicalSignal, DataError>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit_order(&self, order: &OrderRequest) -> Result<OrderResult, DataError>;

    async fn get_portfolio(&self) -> Result<PortfolioSnapshot, DataError>;
}

/// Run `fut` under a deadline, mapping expiry to `DataError::Timeout`.
pub async fn with_deadline<T, F>(what: &str, after: Duration, fut: F) -> Result<T, DataError>
where
    F: Future<Output = Result<T, DataError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(DataError::Timeout {
            what: what.to_string(),
            after,
        }),
    }
}
