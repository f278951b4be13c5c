pub mod odds;
pub mod ratings;

pub use odds::{MarketQuote, MarketType, OddsApiEvent, OddsFeed, Period};
pub use ratings::{RatingsFeed, TeamRatingRow};
