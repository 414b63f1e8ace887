use config::{Config, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

use crate::error::Result;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub policy: PolicyConfig,
    pub venues: VenuesConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Knobs for the order executor: retry budget, backoff base, and the
/// timeout applied to every venue call.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_backoff_ms() -> u64 {
    100
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_risk_interval_secs")]
    pub check_interval_secs: u64,
    /// Ceiling on summed notional exposure across open positions (quote currency).
    pub max_total_exposure: Decimal,
    /// Floor on summed unrealized PnL; breaching it forces closes.
    pub max_unrealized_loss: Decimal,
}

fn default_risk_interval_secs() -> u64 {
    30
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_risk_interval_secs(),
            max_total_exposure: dec!(100000),
            max_unrealized_loss: dec!(1000),
        }
    }
}

/// Lifecycle policy for positions. Signals may omit levels; defaults here
/// fill them in, and the stop-loss handling after the first take-profit is
/// selectable rather than baked into the state machine.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_true")]
    pub break_even_after_tp1: bool,
    /// Move the stop halfway toward each later take-profit as it fills.
    #[serde(default)]
    pub trail_after_tp: bool,
    #[serde(default = "default_sl_distance_pct")]
    pub default_sl_distance_pct: Decimal,
    #[serde(default = "default_min_risk_reward")]
    pub min_risk_reward: Decimal,
    #[serde(default = "default_leverage")]
    pub default_leverage: u32,
}

fn default_true() -> bool {
    true
}

fn default_sl_distance_pct() -> Decimal {
    dec!(0.02)
}

fn default_min_risk_reward() -> Decimal {
    dec!(1.5)
}

fn default_leverage() -> u32 {
    10
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            break_even_after_tp1: true,
            trail_after_tp: false,
            default_sl_distance_pct: default_sl_distance_pct(),
            min_risk_reward: default_min_risk_reward(),
            default_leverage: default_leverage(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VenuesConfig {
    #[serde(default)]
    pub binance: Option<VenueCredentials>,
    #[serde(default)]
    pub okx: Option<VenueCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VenueCredentials {
    pub api_key: String,
    pub api_secret: String,
    /// Required by OKX, unused by Binance.
    #[serde(default)]
    pub passphrase: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
}

fn default_min_request_interval_ms() -> u64 {
    50
}

impl AppConfig {
    /// Load configuration from `<config_dir>/default.toml` overlaid with
    /// `SIGTRADE__` environment variables.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let cfg = Config::builder()
            .set_default("database.url", "postgres://localhost/sigtrade")?
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("execution.max_retries", 4i64)?
            .set_default("execution.base_backoff_ms", 100i64)?
            .set_default("execution.call_timeout_ms", 10_000i64)?
            .set_default("execution.dry_run", false)?
            .set_default("risk.check_interval_secs", 30i64)?
            .set_default("risk.max_total_exposure", "100000")?
            .set_default("risk.max_unrealized_loss", "1000")?
            .set_default("policy.break_even_after_tp1", true)?
            .set_default("policy.trail_after_tp", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(
                Environment::with_prefix("SIGTRADE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(cfg.try_deserialize()?)
    }

    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.database.url.is_empty() {
            errors.push("database.url must not be empty".to_string());
        }
        if self.execution.max_retries == 0 {
            errors.push("execution.max_retries must be at least 1".to_string());
        }
        if self.execution.call_timeout_ms == 0 {
            errors.push("execution.call_timeout_ms must be positive".to_string());
        }
        if self.risk.max_total_exposure <= Decimal::ZERO {
            errors.push("risk.max_total_exposure must be positive".to_string());
        }
        if self.risk.max_unrealized_loss <= Decimal::ZERO {
            errors.push("risk.max_unrealized_loss must be positive".to_string());
        }
        if self.policy.default_sl_distance_pct <= Decimal::ZERO
            || self.policy.default_sl_distance_pct >= Decimal::ONE
        {
            errors.push("policy.default_sl_distance_pct must be in (0, 1)".to_string());
        }
        if self.policy.default_leverage == 0 {
            errors.push("policy.default_leverage must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Baseline config used by tests and dry runs.
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                url: "postgres://localhost/sigtrade".to_string(),
                max_connections: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            policy: PolicyConfig::default(),
            venues: VenuesConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AppConfig::default_config();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_catches_bad_values() {
        let mut cfg = AppConfig::default_config();
        cfg.execution.max_retries = 0;
        cfg.risk.max_total_exposure = dec!(-1);
        let errors = cfg.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_policy_defaults() {
        let policy = PolicyConfig::default();
        assert!(policy.break_even_after_tp1);
        assert!(!policy.trail_after_tp);
        assert_eq!(policy.default_sl_distance_pct, dec!(0.02));
        assert_eq!(policy.min_risk_reward, dec!(1.5));
    }
}
