pub mod kamino;
pub mod oracle;

pub use oracle::{FixedPriceOracle, PriceOracle, ReserveCachedPrice};
