pub mod config;
pub mod coordinator;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod notify;
pub mod persistence;
pub mod risk;

pub use config::AppConfig;
pub use coordinator::TradeCoordinator;
pub use domain::{
    ExchangeKind, OrderIntent, OrderResult, OrderStatus, Position, PositionState, Side,
    TradePlan, TradeSignal,
};
pub use engine::PositionStateMachine;
pub use error::{Result, SigtradeError};
pub use exchange::{build_adapter, ExchangeAdapter, PaperExchange};
pub use execution::{OrderExecutor, VenueRateLimiter};
pub use notify::{Notifier, PositionNotification};
pub use persistence::{InMemoryStore, PositionStore, PostgresStore};
pub use risk::RiskMonitor;
