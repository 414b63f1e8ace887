pub mod executor;
pub mod rate_limit;

pub use executor::OrderExecutor;
pub use rate_limit::VenueRateLimiter;
