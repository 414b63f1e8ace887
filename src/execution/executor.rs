//! Order executor: the one place that talks to a venue on behalf of the
//! lifecycle engine. Centralizes retry with backoff, per-venue pacing,
//! call timeouts, and idempotent resubmission by client key.

use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::domain::{OrderIntent, OrderResult, OrderStatus};
use crate::error::{ExecutionError, Result, SigtradeError};
use crate::exchange::ExchangeAdapter;

use super::rate_limit::VenueRateLimiter;

pub struct OrderExecutor {
    adapter: Arc<dyn ExchangeAdapter>,
    limiter: Arc<VenueRateLimiter>,
    config: ExecutionConfig,
}

impl OrderExecutor {
    pub fn new(
        adapter: Arc<dyn ExchangeAdapter>,
        limiter: Arc<VenueRateLimiter>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            adapter,
            limiter,
            config,
        }
    }

    pub fn adapter(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.adapter
    }

    /// Place an order. Retries with exponential backoff on rate-limit and
    /// transient failures only; before every resubmission the venue is
    /// queried by client key, so an order that actually landed during an
    /// ambiguous failure is returned instead of duplicated.
    #[instrument(skip(self, intent), fields(client_key = %intent.client_key, symbol = %intent.symbol))]
    pub async fn submit(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let intent = self.rounded(intent).await?;

        if self.config.dry_run {
            info!("dry run, simulating accepted order");
            return Ok(simulated_accept(&intent));
        }

        let mut attempts: u32 = 0;
        let mut last_error = String::new();
        loop {
            if attempts > 0 {
                // The previous attempt may have landed on the venue even
                // though we saw an error; trust the venue's answer. If the
                // venue cannot be asked, resubmitting blind risks a
                // duplicate, so the retry budget is treated as spent.
                match self.query_status(&intent.symbol, &intent.client_key).await {
                    Ok(Some(existing)) => {
                        debug!("resubmission found existing order, returning venue state");
                        return Ok(existing);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        return Err(ExecutionError::MaxRetriesExceeded {
                            attempts,
                            last_error: e.to_string(),
                        }
                        .into());
                    }
                }
            }
            if attempts > self.config.max_retries {
                return Err(ExecutionError::MaxRetriesExceeded {
                    attempts,
                    last_error,
                }
                .into());
            }

            self.limiter.acquire().await;
            match self.call(self.adapter.place_order(&intent)).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    last_error = e.to_string();
                    attempts += 1;
                    let delay = self.backoff_delay(attempts);
                    warn!(error = %e, attempt = attempts, delay_ms = delay.as_millis() as u64, "retrying order submission");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Best-effort cancel. "Already filled or canceled" is reported as
    /// `Ok(false)`, not an error.
    #[instrument(skip(self))]
    pub async fn cancel(&self, symbol: &str, client_key: &str) -> Result<bool> {
        if self.config.dry_run {
            return Ok(true);
        }
        let mut attempts: u32 = 0;
        loop {
            self.limiter.acquire().await;
            match self.call(self.adapter.cancel_order(symbol, client_key)).await {
                Ok(canceled) => return Ok(canceled),
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    attempts += 1;
                    tokio::time::sleep(self.backoff_delay(attempts)).await;
                }
                Err(e) => {
                    return Err(ExecutionError::CancelFailed {
                        order_id: client_key.to_string(),
                        reason: e.to_string(),
                    }
                    .into())
                }
            }
        }
    }

    /// Venue-authoritative order lookup by client key.
    pub async fn status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        self.query_status(symbol, client_key).await
    }

    async fn query_status(&self, symbol: &str, client_key: &str) -> Result<Option<OrderResult>> {
        let mut attempts: u32 = 0;
        loop {
            self.limiter.acquire().await;
            match self.call(self.adapter.order_status(symbol, client_key)).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_retryable() && attempts < self.config.max_retries => {
                    attempts += 1;
                    tokio::time::sleep(self.backoff_delay(attempts)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Bound a venue call with the configured timeout; a timeout counts
    /// as transient.
    async fn call<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout(Duration::from_millis(self.config.call_timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(SigtradeError::transient(format!(
                "venue call timed out after {}ms",
                self.config.call_timeout_ms
            ))),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.base_backoff_ms.saturating_mul(1 << attempt.min(8));
        let jitter = rand::thread_rng().gen_range(0..=self.config.base_backoff_ms / 2 + 1);
        Duration::from_millis(exp + jitter)
    }

    /// Round the intent's quantity and prices to the symbol's steps and
    /// check venue minimums before anything is sent.
    async fn rounded(&self, intent: &OrderIntent) -> Result<OrderIntent> {
        let filters = self.adapter.symbol_filters(&intent.symbol).await?;
        let mut rounded = intent.clone();
        rounded.quantity = filters.round_qty(intent.quantity);
        rounded.price = intent.price.map(|p| filters.round_price(p));
        rounded.trigger_price = intent.trigger_price.map(|p| filters.round_price(p));

        let reference = rounded.price.or(rounded.trigger_price);
        filters.validate(rounded.quantity, reference)?;
        Ok(rounded)
    }
}

fn simulated_accept(intent: &OrderIntent) -> OrderResult {
    OrderResult {
        client_key: intent.client_key.clone(),
        venue_order_id: Some(format!("dry-{}", intent.client_key)),
        venue: intent.venue,
        symbol: intent.symbol.clone(),
        status: OrderStatus::Accepted,
        filled_quantity: Decimal::ZERO,
        avg_fill_price: None,
        error: None,
        timestamp: chrono::Utc::now(),
    }
}
