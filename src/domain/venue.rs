use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SigtradeError;

/// Supported venues. Adding one means writing a new adapter; nothing in
/// the lifecycle engine changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Binance,
    Okx,
    /// In-process simulated venue for tests and dry runs.
    Paper,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Binance => "binance",
            Self::Okx => "okx",
            Self::Paper => "paper",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = SigtradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "binance" => Ok(Self::Binance),
            "okx" => Ok(Self::Okx),
            "paper" => Ok(Self::Paper),
            other => Err(SigtradeError::validation(format!(
                "unknown exchange: {}",
                other
            ))),
        }
    }
}
