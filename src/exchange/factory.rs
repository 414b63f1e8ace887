use rust_decimal_macros::dec;
use std::sync::Arc;

use crate::config::VenuesConfig;
use crate::domain::{ExchangeKind, MarginMode};
use crate::error::{Result, SigtradeError};

use super::binance::BinanceFutures;
use super::okx::OkxSwap;
use super::paper::PaperExchange;
use super::traits::ExchangeAdapter;

/// Construct the adapter for a venue from configured credentials. The
/// paper venue needs none.
pub fn build_adapter(
    kind: ExchangeKind,
    venues: &VenuesConfig,
) -> Result<Arc<dyn ExchangeAdapter>> {
    match kind {
        ExchangeKind::Binance => {
            let creds = venues.binance.as_ref().ok_or_else(|| {
                SigtradeError::Auth("binance credentials not configured".to_string())
            })?;
            Ok(Arc::new(BinanceFutures::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                creds.base_url.as_deref(),
            )?))
        }
        ExchangeKind::Okx => {
            let creds = venues.okx.as_ref().ok_or_else(|| {
                SigtradeError::Auth("okx credentials not configured".to_string())
            })?;
            let passphrase = creds.passphrase.clone().ok_or_else(|| {
                SigtradeError::Auth("okx requires a passphrase".to_string())
            })?;
            Ok(Arc::new(OkxSwap::new(
                creds.api_key.clone(),
                creds.api_secret.clone(),
                passphrase,
                MarginMode::Cross,
                creds.base_url.as_deref(),
            )?))
        }
        ExchangeKind::Paper => Ok(Arc::new(PaperExchange::new(dec!(100000)))),
    }
}
