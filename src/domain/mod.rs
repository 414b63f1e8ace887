pub mod order;
pub mod plan;
pub mod position;
pub mod signal;
pub mod venue;

pub use order::{OrderIntent, OrderPurpose, OrderResult, OrderSide, OrderStatus, OrderType, Side};
pub use plan::{EntryZone, TakeProfitTarget, TradePlan};
pub use position::{Position, PositionState, StateTransition, StopLossRef, TpFill, WorkingOrder};
pub use signal::{MarginMode, TradeSignal};
pub use venue::ExchangeKind;
