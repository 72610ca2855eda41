use async_trait::async_trait;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;

use crate::core::types::PriceQuote;
use crate::math::fraction::sf_to_decimal;
use crate::protocol::kamino::Reserve;

/// Current price for a reserve. Multi-feed aggregation lives behind this.
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn get_price(&self, address: &Pubkey, reserve: &Reserve) -> anyhow::Result<PriceQuote>;
}

/// Uses the price the reserve cached at its last refresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReserveCachedPrice;

#[async_trait]
impl PriceOracle for ReserveCachedPrice {
    async fn get_price(&self, _address: &Pubkey, reserve: &Reserve) -> anyhow::Result<PriceQuote> {
        let price = sf_to_decimal(reserve.liquidity.market_price_sf)?;
        Ok(PriceQuote {
            price,
            valid: reserve.last_update.price_status != 0 || price > Decimal::ZERO,
        })
    }
}

/// Prices keyed by liquidity mint. Unknown mints fall back to the cached price.
#[derive(Debug, Default, Clone)]
pub struct FixedPriceOracle {
    prices: HashMap<Pubkey, Decimal>,
}

impl FixedPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, mint: Pubkey, price: Decimal) -> Self {
        self.prices.insert(mint, price);
        self
    }
}

#[async_trait]
impl PriceOracle for FixedPriceOracle {
    async fn get_price(&self, address: &Pubkey, reserve: &Reserve) -> anyhow::Result<PriceQuote> {
        match self.prices.get(&reserve.liquidity.mint_pubkey) {
            Some(price) => Ok(PriceQuote::new(*price)),
            None => ReserveCachedPrice.get_price(address, reserve).await,
        }
    }
}
