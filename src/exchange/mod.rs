pub mod binance;
pub mod factory;
pub mod filters;
pub mod okx;
pub mod paper;
pub mod traits;

pub use factory::build_adapter;
pub use filters::SymbolFilters;
pub use paper::PaperExchange;
pub use traits::{Balance, ExchangeAdapter, FillStream, VenuePosition};
