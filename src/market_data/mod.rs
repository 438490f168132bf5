pub mod feed;
pub mod hub;

pub use feed::{ConnState, FeedConnection, RawTick};
pub use hub::{MarketDataHub, UpdateHandler};
