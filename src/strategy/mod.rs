//! Request interception: pick a strategy, then run it.

mod executor;
mod selector;

pub use executor::Executor;
pub use selector::{Strategy, StrategyRules, DEFAULT_CACHE_FIRST, DEFAULT_NETWORK_FIRST};
