use anyhow::Context;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;

use crate::blockchain::rpc_client::LedgerReader;
use crate::core::error::{Error, Result};
use crate::engine::reserve::KaminoReserve;
use crate::math::fraction::sf_to_decimal;
use crate::protocol::kamino::accounts::derive_lending_market_authority;
use crate::protocol::kamino::types::{ElevationGroup, KaminoAccount, LendingMarket, Reserve};
use crate::protocol::oracle::PriceOracle;

/// An elevation group together with the reserves that participate in it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElevationGroupDescription {
    pub elevation_group: u8,
    /// Insertion ordered, no duplicates.
    pub collateral_reserves: Vec<Pubkey>,
    pub collateral_liquidity_mints: Vec<Pubkey>,
    pub debt_reserve: Pubkey,
    /// `None` until a loaded reserve claims the debt side.
    pub debt_liquidity_mint: Option<Pubkey>,
    pub max_reserves_as_collateral: u8,
}

/// LTV limits for borrowing `debt` against `coll`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairRiskParams {
    pub max_ltv: Decimal,
    pub liquidation_ltv: Decimal,
    pub borrow_factor: Decimal,
}

/// A lending market and the reserves loaded with it.
#[derive(Debug, Clone)]
pub struct KaminoMarket {
    pub address: Pubkey,
    pub state: LendingMarket,
    pub program_id: Pubkey,
    reserves: Vec<KaminoReserve>,
    recent_slot_duration_ms: u64,
}

impl KaminoMarket {
    pub fn new(
        address: Pubkey,
        state: LendingMarket,
        reserves: Vec<KaminoReserve>,
        program_id: Pubkey,
        recent_slot_duration_ms: u64,
    ) -> Self {
        KaminoMarket {
            address,
            state,
            program_id,
            reserves,
            recent_slot_duration_ms,
        }
    }

    /// Loads the market account and the given reserves. Reserves belonging to
    /// another market are rejected.
    pub async fn load(
        ledger: &dyn LedgerReader,
        oracle: &dyn PriceOracle,
        address: Pubkey,
        reserve_addresses: &[Pubkey],
        program_id: Pubkey,
        recent_slot_duration_ms: u64,
    ) -> anyhow::Result<Self> {
        let data = ledger
            .get_account(&address)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Lending market {} not found", address))?;
        let state = LendingMarket::from_account_data(&data)
            .with_context(|| format!("Failed to decode lending market {}", address))?;

        let reserves =
            Self::load_reserves(ledger, oracle, &address, reserve_addresses, recent_slot_duration_ms).await?;

        log::info!(
            "KaminoMarket: loaded {} ({}) with {} reserves",
            address,
            state.name(),
            reserves.len()
        );

        Ok(KaminoMarket::new(address, state, reserves, program_id, recent_slot_duration_ms))
    }

    async fn load_reserves(
        ledger: &dyn LedgerReader,
        oracle: &dyn PriceOracle,
        market: &Pubkey,
        reserve_addresses: &[Pubkey],
        recent_slot_duration_ms: u64,
    ) -> anyhow::Result<Vec<KaminoReserve>> {
        let accounts = ledger.get_multiple_accounts(reserve_addresses).await?;

        let mut states: Vec<(Pubkey, Reserve)> = Vec::with_capacity(reserve_addresses.len());
        for (address, account) in reserve_addresses.iter().zip(accounts) {
            let data = account.ok_or_else(|| anyhow::anyhow!("Reserve {} not found", address))?;
            let state = Reserve::from_account_data(&data)
                .with_context(|| format!("Failed to decode reserve {}", address))?;
            if state.lending_market != *market {
                return Err(Error::validation(format!(
                    "Reserve {} belongs to market {}, not {}",
                    address, state.lending_market, market
                ))
                .into());
            }
            states.push((*address, state));
        }

        let prices = join_all(states.iter().map(|(address, state)| oracle.get_price(address, state))).await;

        let mut reserves = Vec::with_capacity(states.len());
        for ((address, state), price) in states.into_iter().zip(prices) {
            let price = price.with_context(|| format!("Failed to price reserve {}", address))?;
            if !price.valid {
                log::warn!("KaminoMarket: price for reserve {} is stale or invalid", address);
            }
            reserves.push(KaminoReserve::new(address, state, price, recent_slot_duration_ms)?);
        }
        Ok(reserves)
    }

    /// Re-reads every reserve from the ledger, keeping load order.
    pub async fn reload_reserves(&mut self, ledger: &dyn LedgerReader, oracle: &dyn PriceOracle) -> anyhow::Result<()> {
        let addresses: Vec<Pubkey> = self.reserves.iter().map(|r| r.address).collect();
        self.reserves =
            Self::load_reserves(ledger, oracle, &self.address, &addresses, self.recent_slot_duration_ms).await?;
        Ok(())
    }

    pub fn recent_slot_duration_ms(&self) -> u64 {
        self.recent_slot_duration_ms
    }

    pub fn name(&self) -> String {
        self.state.name()
    }

    pub fn referral_fee_bps(&self) -> u16 {
        self.state.referral_fee_bps
    }

    pub fn min_net_value_obligation(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.min_net_value_in_obligation_sf)
    }

    pub fn lending_market_authority(&self) -> anyhow::Result<Pubkey> {
        derive_lending_market_authority(&self.address, &self.program_id)
    }

    // --- reserves ----------------------------------------------------------

    pub fn reserves(&self) -> &[KaminoReserve] {
        &self.reserves
    }

    pub fn reserve(&self, address: &Pubkey) -> Option<&KaminoReserve> {
        self.reserves.iter().find(|r| r.address == *address)
    }

    pub fn existing_reserve(&self, address: &Pubkey) -> Result<&KaminoReserve> {
        self.reserve(address)
            .ok_or_else(|| Error::validation(format!("Reserve {} not found in market {}", address, self.address)))
    }

    pub fn reserve_by_mint(&self, mint: &Pubkey) -> Option<&KaminoReserve> {
        self.reserves.iter().find(|r| r.liquidity_mint() == *mint)
    }

    pub fn existing_reserve_by_mint(&self, mint: &Pubkey) -> Result<&KaminoReserve> {
        self.reserve_by_mint(mint)
            .ok_or_else(|| Error::validation(format!("No reserve for mint {} in market {}", mint, self.address)))
    }

    pub fn reserve_by_symbol(&self, symbol: &str) -> Option<&KaminoReserve> {
        self.reserves.iter().find(|r| r.symbol().eq_ignore_ascii_case(symbol))
    }

    pub fn total_deposit_tvl(&self) -> Decimal {
        self.reserves.iter().map(|r| r.deposit_tvl()).sum()
    }

    pub fn total_borrow_tvl(&self) -> Decimal {
        self.reserves.iter().map(|r| r.borrow_tvl()).sum()
    }

    pub fn cumulative_borrow_rates_by_reserve(&self, slot: u64) -> Result<HashMap<Pubkey, Decimal>> {
        self.reserves
            .iter()
            .map(|r| Ok((r.address, r.estimated_cumulative_borrow_rate(slot, self.referral_fee_bps())?)))
            .collect()
    }

    pub fn collateral_exchange_rates_by_reserve(&self, slot: u64) -> Result<HashMap<Pubkey, Decimal>> {
        self.reserves
            .iter()
            .map(|r| Ok((r.address, r.estimated_collateral_exchange_rate(slot, self.referral_fee_bps())?)))
            .collect()
    }

    // --- elevation groups --------------------------------------------------

    /// Group `id`, or `None` for the default group 0 and unused slots.
    pub fn elevation_group(&self, id: u8) -> Option<&ElevationGroup> {
        let index = (id as usize).checked_sub(1)?;
        self.state.elevation_groups.get(index).filter(|g| g.id != 0)
    }

    pub fn elevation_groups(&self) -> impl Iterator<Item = &ElevationGroup> {
        self.state.elevation_groups.iter().filter(|g| g.id != 0)
    }

    /// Among `candidates`, the group with the highest LTV; the first one found
    /// wins a tie.
    pub fn highest_ltv_group(&self, candidates: &[u8]) -> Option<u8> {
        let mut best: Option<&ElevationGroup> = None;
        for id in candidates {
            let Some(group) = self.elevation_group(*id) else {
                continue;
            };
            if best.map_or(true, |b| group.ltv_pct > b.ltv_pct) {
                best = Some(group);
            }
        }
        best.map(|g| g.id)
    }

    pub fn elevation_group_descriptions(&self) -> Result<Vec<ElevationGroupDescription>> {
        let mut descriptions: Vec<ElevationGroupDescription> = self
            .elevation_groups()
            .map(|g| ElevationGroupDescription {
                elevation_group: g.id,
                collateral_reserves: Vec::new(),
                collateral_liquidity_mints: Vec::new(),
                debt_reserve: g.debt_reserve,
                debt_liquidity_mint: None,
                max_reserves_as_collateral: g.max_reserves_as_collateral,
            })
            .collect();

        for reserve in &self.reserves {
            for id in reserve.elevation_groups() {
                let description = descriptions
                    .iter_mut()
                    .find(|d| d.elevation_group == id)
                    .ok_or_else(|| {
                        Error::validation(format!("Invalid elevation group id {} at reserve {}", id, reserve.address))
                    })?;
                if reserve.address == description.debt_reserve {
                    description.debt_liquidity_mint = Some(reserve.liquidity_mint());
                } else {
                    push_unique(&mut description.collateral_reserves, reserve.address);
                    push_unique(&mut description.collateral_liquidity_mints, reserve.liquidity_mint());
                }
            }
        }

        Ok(descriptions)
    }

    /// `None` for the default group, an error for a group the market lacks.
    pub fn existing_elevation_group(&self, id: u8) -> Result<Option<ElevationGroupDescription>> {
        if id == 0 {
            return Ok(None);
        }
        self.elevation_group_descriptions()?
            .into_iter()
            .find(|d| d.elevation_group == id)
            .map(Some)
            .ok_or_else(|| Error::validation(format!("Elevation group {} not found", id)))
    }

    /// Groups (other than 0) that accept every one of `coll_reserves` and,
    /// when given, `debt_reserve` as the debt side.
    pub fn elevation_groups_for_reserves_combination(
        &self,
        coll_reserves: &[Pubkey],
        debt_reserve: Option<&Pubkey>,
    ) -> Result<Vec<ElevationGroupDescription>> {
        Ok(self
            .elevation_group_descriptions()?
            .into_iter()
            .filter(|d| coll_reserves.iter().all(|r| d.collateral_reserves.contains(r)))
            .filter(|d| debt_reserve.map_or(true, |debt| *debt == d.debt_reserve))
            .collect())
    }

    pub fn elevation_groups_for_mints_combination(
        &self,
        coll_mints: &[Pubkey],
        debt_mint: Option<&Pubkey>,
    ) -> Result<Vec<ElevationGroupDescription>> {
        Ok(self
            .elevation_group_descriptions()?
            .into_iter()
            .filter(|d| coll_mints.iter().all(|m| d.collateral_liquidity_mints.contains(m)))
            .filter(|d| debt_mint.map_or(true, |debt| d.debt_liquidity_mint == Some(*debt)))
            .collect())
    }

    /// Groups open to new loans that list both reserves, use `debt` as their
    /// debt reserve and allow some debt against `coll`.
    pub fn common_elevation_groups_for_pair(&self, coll: &KaminoReserve, debt: &KaminoReserve) -> Vec<u8> {
        coll.elevation_groups()
            .filter(|id| debt.is_in_elevation_group(*id))
            .filter(|id| {
                self.elevation_group(*id).map_or(false, |g| {
                    g.allow_new_loans != 0
                        && g.debt_reserve == debt.address
                        && coll.borrow_limit_against_collateral_in_elevation_group(*id) > Decimal::ZERO
                })
            })
            .collect()
    }

    pub fn max_and_liquidation_ltv_and_borrow_factor_for_pair(
        &self,
        coll_mint: &Pubkey,
        debt_mint: &Pubkey,
    ) -> Result<PairRiskParams> {
        let coll = self.existing_reserve_by_mint(coll_mint)?;
        let debt = self.existing_reserve_by_mint(debt_mint)?;
        let common = self.common_elevation_groups_for_pair(coll, debt);

        if common.is_empty() {
            return Ok(PairRiskParams {
                max_ltv: coll.stats.loan_to_value,
                liquidation_ltv: coll.stats.liquidation_threshold,
                borrow_factor: debt.borrow_factor(),
            });
        }

        let groups: Vec<&ElevationGroup> = common.iter().filter_map(|id| self.elevation_group(*id)).collect();
        let max_ltv_pct = groups.iter().map(|g| g.ltv_pct).max().unwrap_or(0);
        let liquidation_pct = groups.iter().map(|g| g.liquidation_threshold_pct).max().unwrap_or(0);

        Ok(PairRiskParams {
            max_ltv: Decimal::from(max_ltv_pct) / Decimal::ONE_HUNDRED,
            liquidation_ltv: Decimal::from(liquidation_pct) / Decimal::ONE_HUNDRED,
            borrow_factor: Decimal::ONE,
        })
    }

    /// `1 / (1 - maxLtv / borrowFactor)`.
    pub fn max_leverage_for_pair(&self, coll_mint: &Pubkey, debt_mint: &Pubkey) -> Result<Decimal> {
        let params = self.max_and_liquidation_ltv_and_borrow_factor_for_pair(coll_mint, debt_mint)?;
        let denominator = Decimal::ONE - params.max_ltv / params.borrow_factor;
        if denominator <= Decimal::ZERO {
            return Err(Error::arithmetic(format!(
                "Unbounded leverage for LTV {} and borrow factor {}",
                params.max_ltv, params.borrow_factor
            )));
        }
        Ok(Decimal::ONE / denominator)
    }

    /// Group an obligation currently in `current` should switch to before
    /// borrowing `debt` against `coll`. `None` means stay.
    pub fn best_group_for_switch(&self, current: u8, coll: &KaminoReserve, debt: &KaminoReserve) -> Option<u8> {
        let common = self.common_elevation_groups_for_pair(coll, debt);
        if common.is_empty() {
            log::debug!(
                "KaminoMarket: no common elevation group for {} / {}",
                coll.symbol(),
                debt.symbol()
            );
            return None;
        }
        self.highest_ltv_group(&common).filter(|group| *group != current)
    }
}

fn push_unique(items: &mut Vec<Pubkey>, item: Pubkey) {
    if !items.contains(&item) {
        items.push(item);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::core::types::PriceQuote;
    use crate::engine::reserve::fixtures::reserve_state;

    pub fn market_state() -> LendingMarket {
        let mut state = LendingMarket::zeroed().unwrap();
        state.referral_fee_bps = 0;
        state
    }

    pub fn set_group(state: &mut LendingMarket, id: u8, ltv_pct: u8, threshold_pct: u8, debt_reserve: Pubkey) {
        let group = &mut state.elevation_groups[(id - 1) as usize];
        group.id = id;
        group.ltv_pct = ltv_pct;
        group.liquidation_threshold_pct = threshold_pct;
        group.allow_new_loans = 1;
        group.max_reserves_as_collateral = 4;
        group.debt_reserve = debt_reserve;
    }

    /// Reserve joined to `groups` with a non-zero debt allowance in each.
    pub fn grouped_reserve(market: Pubkey, address: Pubkey, groups: &[u8], price: Decimal) -> KaminoReserve {
        let mut state = reserve_state(Pubkey::new_unique(), 1_000_000_000, 0, 0);
        state.lending_market = market;
        for (i, g) in groups.iter().enumerate() {
            state.config.elevation_groups[i] = *g;
            state.config.borrow_limit_against_this_collateral_in_elevation_group[(*g - 1) as usize] = u64::MAX;
        }
        KaminoReserve::new(address, state, PriceQuote::new(price), 500).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::blockchain::rpc_client::InMemoryLedger;
    use crate::core::registry::ProgramIds;
    use crate::engine::reserve::fixtures::reserve_state;
    use crate::protocol::oracle::ReserveCachedPrice;

    fn market_with_groups() -> (KaminoMarket, Pubkey, Pubkey, Pubkey) {
        let market = Pubkey::new_unique();
        let sol = Pubkey::new_unique();
        let jito = Pubkey::new_unique();
        let usdc = Pubkey::new_unique();

        let mut state = market_state();
        set_group(&mut state, 1, 80, 85, sol);
        set_group(&mut state, 2, 90, 92, sol);
        set_group(&mut state, 3, 90, 93, sol);

        let reserves = vec![
            grouped_reserve(market, sol, &[1, 2, 3], Decimal::from(150)),
            grouped_reserve(market, jito, &[1, 2, 3], Decimal::from(160)),
            grouped_reserve(market, usdc, &[], Decimal::ONE),
        ];
        let program = ProgramIds::klend().unwrap();
        (KaminoMarket::new(market, state, reserves, program, 500), sol, jito, usdc)
    }

    #[test]
    fn test_best_group_prefers_highest_ltv_first_found() {
        let (market, sol, jito, _) = market_with_groups();
        let coll = market.reserve(&jito).unwrap();
        let debt = market.reserve(&sol).unwrap();

        assert_eq!(market.common_elevation_groups_for_pair(coll, debt), vec![1, 2, 3]);
        assert_eq!(market.best_group_for_switch(0, coll, debt), Some(2));
        assert_eq!(market.best_group_for_switch(2, coll, debt), None, "already in the best group");
    }

    #[test]
    fn test_no_common_group_means_no_switch() {
        let (market, sol, _, usdc) = market_with_groups();
        let coll = market.reserve(&usdc).unwrap();
        let debt = market.reserve(&sol).unwrap();
        assert_eq!(market.best_group_for_switch(0, coll, debt), None);
    }

    #[test]
    fn test_group_descriptions_split_debt_and_collateral() {
        let (market, sol, jito, _) = market_with_groups();
        let descriptions = market.elevation_group_descriptions().unwrap();
        assert_eq!(descriptions.len(), 3);
        assert_eq!(descriptions[0].collateral_reserves, vec![jito]);
        assert_eq!(descriptions[0].debt_reserve, sol);
        assert!(descriptions[0].debt_liquidity_mint.is_some());

        let for_jito = market.elevation_groups_for_reserves_combination(&[jito], Some(&sol)).unwrap();
        assert_eq!(for_jito.len(), 3);
        assert!(market.existing_elevation_group(7).is_err());
        assert!(market.existing_elevation_group(0).unwrap().is_none());
    }

    #[test]
    fn test_pair_params_use_group_overrides() {
        let (market, sol, jito, usdc) = market_with_groups();
        let sol_mint = market.reserve(&sol).unwrap().liquidity_mint();
        let jito_mint = market.reserve(&jito).unwrap().liquidity_mint();
        let usdc_mint = market.reserve(&usdc).unwrap().liquidity_mint();

        let grouped = market.max_and_liquidation_ltv_and_borrow_factor_for_pair(&jito_mint, &sol_mint).unwrap();
        assert_eq!(grouped.max_ltv, Decimal::new(9, 1));
        assert_eq!(grouped.liquidation_ltv, Decimal::new(93, 2));
        assert_eq!(grouped.borrow_factor, Decimal::ONE);

        let plain = market.max_and_liquidation_ltv_and_borrow_factor_for_pair(&usdc_mint, &sol_mint).unwrap();
        assert_eq!(plain.max_ltv, Decimal::new(7, 1));
        assert_eq!(market.max_leverage_for_pair(&jito_mint, &sol_mint).unwrap(), Decimal::from(10));
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_reserve() {
        let ledger = InMemoryLedger::new(100);
        let market = Pubkey::new_unique();
        let own = Pubkey::new_unique();
        let foreign = Pubkey::new_unique();

        ledger.set_account(market, market_state().to_account_data().unwrap()).await;
        let mut own_state = reserve_state(Pubkey::new_unique(), 1_000, 0, 100);
        own_state.lending_market = market;
        ledger.set_account(own, own_state.to_account_data().unwrap()).await;
        let foreign_state = reserve_state(Pubkey::new_unique(), 1_000, 0, 100);
        ledger.set_account(foreign, foreign_state.to_account_data().unwrap()).await;

        let program = ProgramIds::klend().unwrap();
        let loaded = KaminoMarket::load(&ledger, &ReserveCachedPrice, market, &[own], program, 500)
            .await
            .unwrap();
        assert_eq!(loaded.reserves().len(), 1);
        assert_eq!(loaded.reserve(&own).unwrap().oracle_market_price(), Decimal::ONE);

        let err = KaminoMarket::load(&ledger, &ReserveCachedPrice, market, &[own, foreign], program, 500)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))), "{}", err);
    }
}
