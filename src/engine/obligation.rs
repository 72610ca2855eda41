//! Obligation valuation: positions, health stats, borrow and withdraw limits,
//! and what-if simulations over a copy of the slot arrays.

use anyhow::Context;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;

use crate::blockchain::rpc_client::LedgerReader;
use crate::core::error::{Error, Result};
use crate::core::registry::constants::U64_MAX;
use crate::core::types::{positive_or_zero, value_or_zero, ActionKind, ObligationStats, Position};
use crate::engine::market::{ElevationGroupDescription, KaminoMarket};
use crate::engine::obligation_order::ObligationOrder;
use crate::engine::reserve::KaminoReserve;
use crate::math::fraction::{fraction_from_decimal, sf_to_decimal, BigFraction};
use crate::protocol::kamino::types::{KaminoAccount, Obligation, ObligationCollateral, ObligationLiquidity};

/// Keeps withdrawals just under max LTV.
const MAX_WITHDRAW_SAFETY_FACTOR: Decimal = Decimal::from_parts(999, 0, 0, false, 3);

/// Signed change to one reserve's deposit or borrow, in liquidity lamports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionChange {
    pub reserve_address: Pubkey,
    pub amount_change: Decimal,
}

/// Exchange rates and cumulative borrow rates projected to a slot.
#[derive(Debug, Clone, Default)]
pub struct ObligationRates {
    pub collateral_exchange_rates: HashMap<Pubkey, Decimal>,
    pub cumulative_borrow_rates: HashMap<Pubkey, Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReserveLtv {
    pub max_ltv: Decimal,
    pub liquidation_ltv: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct DepositStats {
    pub deposits: Vec<Position>,
    pub user_total_deposit: Decimal,
    pub user_total_collateral_deposit: Decimal,
    pub user_total_liquidatable_deposit: Decimal,
    pub borrow_limit: Decimal,
    pub liquidation_ltv: Decimal,
    pub borrow_liquidation_limit: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct BorrowStats {
    pub borrows: Vec<Position>,
    pub user_total_borrow: Decimal,
    pub user_total_borrow_borrow_factor_adjusted: Decimal,
    pub positions: usize,
}

#[derive(Debug, Clone)]
pub struct PositionsAndStats {
    pub deposits: Vec<Position>,
    pub borrows: Vec<Position>,
    pub stats: ObligationStats,
}

/// Inputs of [`KaminoObligation::simulated_obligation_stats`].
#[derive(Debug, Clone, Copy)]
pub struct SimulationParams {
    pub action: ActionKind,
    pub amount_collateral: Option<Decimal>,
    pub amount_debt: Option<Decimal>,
    pub mint_collateral: Option<Pubkey>,
    pub mint_debt: Option<Pubkey>,
    pub slot: u64,
    pub elevation_group_override: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct KaminoObligation {
    pub address: Pubkey,
    pub state: Obligation,
    /// Non-empty deposit slots, in slot order.
    pub deposits: Vec<Position>,
    /// Non-empty borrow slots, in slot order.
    pub borrows: Vec<Position>,
    pub refreshed_stats: ObligationStats,
    pub tag: u64,
}

impl KaminoObligation {
    pub fn new(market: &KaminoMarket, address: Pubkey, state: Obligation, rates: &ObligationRates) -> Result<Self> {
        let computed = Self::calculate_positions(
            market,
            &state.deposits,
            &state.borrows,
            state.elevation_group,
            Some(&rates.collateral_exchange_rates),
            Some(&rates.cumulative_borrow_rates),
        )?;

        Ok(KaminoObligation {
            address,
            tag: state.tag,
            state,
            deposits: computed.deposits,
            borrows: computed.borrows,
            refreshed_stats: computed.stats,
        })
    }

    /// `None` when the account does not exist.
    pub async fn load(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        address: &Pubkey,
    ) -> anyhow::Result<Option<Self>> {
        let Some(data) = ledger.get_account(address).await? else {
            return Ok(None);
        };
        let slot = ledger.get_slot().await?;
        let state = Obligation::from_account_data(&data)
            .with_context(|| format!("Failed to decode obligation {}", address))?;
        Self::from_state(market, *address, state, slot).map(Some)
    }

    pub async fn load_all(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        addresses: &[Pubkey],
        slot: Option<u64>,
    ) -> anyhow::Result<Vec<Option<Self>>> {
        let slot = match slot {
            Some(slot) => slot,
            None => ledger.get_slot().await?,
        };
        let accounts = ledger.get_multiple_accounts(addresses).await?;

        let mut out = Vec::with_capacity(addresses.len());
        for (address, account) in addresses.iter().zip(accounts) {
            let Some(data) = account else {
                out.push(None);
                continue;
            };
            let state = Obligation::from_account_data(&data)
                .with_context(|| format!("Failed to decode obligation {}", address))?;
            out.push(Some(Self::from_state(market, *address, state, slot)?));
        }
        Ok(out)
    }

    fn from_state(market: &KaminoMarket, address: Pubkey, state: Obligation, slot: u64) -> anyhow::Result<Self> {
        if state.lending_market != market.address {
            return Err(Error::validation(format!(
                "Obligation {} belongs to market {}, not {}",
                address, state.lending_market, market.address
            ))
            .into());
        }
        let rates = Self::rates_for_obligation(market, &state, slot, &[])?;
        Ok(Self::new(market, address, state, &rates)?)
    }

    /// Rates for every reserve the obligation uses plus `additional_reserves`.
    pub fn rates_for_obligation(
        market: &KaminoMarket,
        state: &Obligation,
        slot: u64,
        additional_reserves: &[Pubkey],
    ) -> Result<ObligationRates> {
        let referral_fee_bps = market.referral_fee_bps();
        let mut rates = ObligationRates::default();

        let deposit_reserves = state
            .deposits
            .iter()
            .map(|d| d.deposit_reserve)
            .chain(additional_reserves.iter().copied())
            .filter(|r| *r != Pubkey::default());
        for address in deposit_reserves {
            if rates.collateral_exchange_rates.contains_key(&address) {
                continue;
            }
            let reserve = market.existing_reserve(&address)?;
            let rate = reserve.estimated_collateral_exchange_rate(slot, referral_fee_bps)?;
            rates.collateral_exchange_rates.insert(address, rate);
        }

        let borrow_reserves = state
            .borrows
            .iter()
            .map(|b| b.borrow_reserve)
            .chain(additional_reserves.iter().copied())
            .filter(|r| *r != Pubkey::default());
        for address in borrow_reserves {
            if rates.cumulative_borrow_rates.contains_key(&address) {
                continue;
            }
            let reserve = market.existing_reserve(&address)?;
            let rate = reserve.estimated_cumulative_borrow_rate(slot, referral_fee_bps)?;
            rates.cumulative_borrow_rates.insert(address, rate);
        }

        Ok(rates)
    }

    // --- positions ---------------------------------------------------------

    pub fn deposit_by_reserve(&self, reserve: &Pubkey) -> Option<&Position> {
        self.deposits.iter().find(|p| p.reserve_address == *reserve)
    }

    pub fn borrow_by_reserve(&self, reserve: &Pubkey) -> Option<&Position> {
        self.borrows.iter().find(|p| p.reserve_address == *reserve)
    }

    pub fn deposit_by_mint(&self, mint: &Pubkey) -> Option<&Position> {
        self.deposits.iter().find(|p| p.mint_address == *mint)
    }

    pub fn borrow_by_mint(&self, mint: &Pubkey) -> Option<&Position> {
        self.borrows.iter().find(|p| p.mint_address == *mint)
    }

    /// Borrowed amount in whole tokens.
    pub fn borrow_amount_by_reserve(&self, reserve: &KaminoReserve) -> Decimal {
        self.borrow_by_mint(&reserve.liquidity_mint())
            .map(|p| p.amount / reserve.mint_factor())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn deposit_amount_by_reserve(&self, reserve: &KaminoReserve) -> Decimal {
        self.deposit_by_mint(&reserve.liquidity_mint())
            .map(|p| p.amount / reserve.mint_factor())
            .unwrap_or(Decimal::ZERO)
    }

    pub fn deposit_reserves(&self) -> Vec<Pubkey> {
        self.deposits.iter().map(|p| p.reserve_address).collect()
    }

    pub fn borrow_reserves(&self) -> Vec<Pubkey> {
        self.borrows.iter().map(|p| p.reserve_address).collect()
    }

    pub fn number_of_positions(&self) -> usize {
        self.deposits.len() + self.borrows.len()
    }

    pub fn referrer(&self) -> Option<Pubkey> {
        self.state.referrer()
    }

    pub fn elevation_group(&self) -> u8 {
        self.state.elevation_group
    }

    pub fn obligation_liquidity_by_reserve(&self, reserve: &Pubkey) -> Result<&ObligationLiquidity> {
        self.state
            .borrows
            .iter()
            .find(|b| b.borrow_reserve == *reserve)
            .ok_or_else(|| Error::state(format!("Obligation liquidity not found for reserve {}", reserve)))
    }

    /// Slot-order orders, `None` for an empty slot.
    pub fn orders(&self) -> Result<Vec<Option<ObligationOrder>>> {
        self.state.orders.iter().map(ObligationOrder::from_state).collect()
    }

    pub fn active_orders(&self) -> Result<Vec<ObligationOrder>> {
        Ok(self.orders()?.into_iter().flatten().collect())
    }

    // --- values cached on chain at the last refresh ------------------------

    pub fn deposited_value(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.deposited_value_sf)
    }

    pub fn borrowed_market_value(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.borrowed_assets_market_value_sf)
    }

    pub fn borrowed_market_value_bf_adjusted(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.borrow_factor_adjusted_debt_value_sf)
    }

    pub fn max_allowed_borrow_value(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.allowed_borrow_value_sf)
    }

    pub fn unhealthy_borrow_value(&self) -> Result<Decimal> {
        sf_to_decimal(self.state.unhealthy_borrow_value_sf)
    }

    // --- health ------------------------------------------------------------

    /// BF-adjusted debt over *all* deposits, as the program computes it.
    /// `refreshed_stats.loan_to_value` divides by collateral-eligible deposits only.
    pub fn loan_to_value(&self) -> Decimal {
        value_or_zero(
            self.refreshed_stats.user_total_borrow_borrow_factor_adjusted,
            self.refreshed_stats.user_total_deposit,
        )
    }

    pub fn liquidation_ltv(&self) -> Decimal {
        value_or_zero(self.refreshed_stats.borrow_liquidation_limit, self.refreshed_stats.user_total_deposit)
    }

    pub fn no_bf_loan_to_value(&self) -> Decimal {
        value_or_zero(self.refreshed_stats.user_total_borrow, self.refreshed_stats.user_total_deposit)
    }

    pub fn net_account_value(&self) -> Decimal {
        self.refreshed_stats.net_account_value
    }

    pub fn borrow_utilization(&self) -> Decimal {
        self.refreshed_stats.borrow_utilization
    }

    pub fn leverage(&self) -> Decimal {
        self.refreshed_stats.leverage
    }

    pub fn borrow_amount(borrow: &ObligationLiquidity) -> Result<Decimal> {
        sf_to_decimal(borrow.borrowed_amount_sf)
    }

    pub fn cumulative_borrow_rate(borrow: &ObligationLiquidity) -> Result<Decimal> {
        BigFraction::from_limbs(borrow.cumulative_borrow_rate_bsf.value).to_decimal()
    }

    /// 1 inside an elevation group the reserve belongs to, else the reserve's factor.
    pub fn borrow_factor_for_reserve(reserve: &KaminoReserve, elevation_group: u8) -> Decimal {
        if reserve.is_in_elevation_group(elevation_group) {
            Decimal::ONE
        } else {
            reserve.borrow_factor()
        }
    }

    /// Collateral LTVs, overridden by the group when the reserve belongs to it.
    pub fn ltv_for_reserve(market: &KaminoMarket, reserve: &KaminoReserve, elevation_group: u8) -> Result<ReserveLtv> {
        if !reserve.is_in_elevation_group(elevation_group) {
            return Ok(ReserveLtv {
                max_ltv: reserve.stats.loan_to_value,
                liquidation_ltv: reserve.stats.liquidation_threshold,
            });
        }
        let group = market.elevation_group(elevation_group).ok_or_else(|| {
            Error::validation(format!(
                "Reserve {} lists elevation group {} the market does not define",
                reserve.address, elevation_group
            ))
        })?;
        Ok(ReserveLtv {
            max_ltv: Decimal::from(group.ltv_pct) / Decimal::ONE_HUNDRED,
            liquidation_ltv: Decimal::from(group.liquidation_threshold_pct) / Decimal::ONE_HUNDRED,
        })
    }

    pub fn ltv_for_reserve_address(&self, market: &KaminoMarket, reserve: &Pubkey) -> Result<ReserveLtv> {
        Self::ltv_for_reserve(market, market.existing_reserve(reserve)?, self.state.elevation_group)
    }

    // --- valuation ---------------------------------------------------------

    pub fn calculate_positions(
        market: &KaminoMarket,
        deposits: &[ObligationCollateral],
        borrows: &[ObligationLiquidity],
        elevation_group: u8,
        collateral_exchange_rates: Option<&HashMap<Pubkey, Decimal>>,
        cumulative_borrow_rates: Option<&HashMap<Pubkey, Decimal>>,
    ) -> Result<PositionsAndStats> {
        let deposit_stats =
            Self::calculate_obligation_deposits(market, deposits, collateral_exchange_rates, elevation_group)?;
        let borrow_stats =
            Self::calculate_obligation_borrows(market, borrows, cumulative_borrow_rates, elevation_group)?;

        let net_account_value = deposit_stats.user_total_deposit - borrow_stats.user_total_borrow;
        let stats = ObligationStats {
            user_total_deposit: deposit_stats.user_total_deposit,
            user_total_collateral_deposit: deposit_stats.user_total_collateral_deposit,
            user_total_liquidatable_deposit: deposit_stats.user_total_liquidatable_deposit,
            user_total_borrow: borrow_stats.user_total_borrow,
            user_total_borrow_borrow_factor_adjusted: borrow_stats.user_total_borrow_borrow_factor_adjusted,
            borrow_limit: deposit_stats.borrow_limit,
            borrow_liquidation_limit: deposit_stats.borrow_liquidation_limit,
            borrow_utilization: value_or_zero(
                borrow_stats.user_total_borrow_borrow_factor_adjusted,
                deposit_stats.borrow_limit,
            ),
            net_account_value,
            loan_to_value: value_or_zero(
                borrow_stats.user_total_borrow_borrow_factor_adjusted,
                deposit_stats.user_total_collateral_deposit,
            ),
            liquidation_ltv: deposit_stats.liquidation_ltv,
            leverage: value_or_zero(deposit_stats.user_total_deposit, net_account_value),
            potential_elevation_group_update: 0,
            positions: deposit_stats.deposits.len() + borrow_stats.positions,
        };

        Ok(PositionsAndStats {
            deposits: deposit_stats.deposits,
            borrows: borrow_stats.borrows,
            stats,
        })
    }

    /// Values non-empty deposit slots. Missing rates fall back to the reserve's
    /// stale exchange rate.
    pub fn calculate_obligation_deposits(
        market: &KaminoMarket,
        deposits: &[ObligationCollateral],
        collateral_exchange_rates: Option<&HashMap<Pubkey, Decimal>>,
        elevation_group: u8,
    ) -> Result<DepositStats> {
        let mut stats = DepositStats::default();

        for deposit in deposits.iter().filter(|d| d.deposit_reserve != Pubkey::default()) {
            let reserve = market.reserve(&deposit.deposit_reserve).ok_or_else(|| {
                Error::validation(format!(
                    "Obligation deposit of {} belongs to reserve {} which is not loaded in the market",
                    deposit.deposited_amount, deposit.deposit_reserve
                ))
            })?;
            let ltv = Self::ltv_for_reserve(market, reserve, elevation_group)?;

            let exchange_rate = collateral_exchange_rates
                .and_then(|rates| rates.get(&reserve.address).copied())
                .unwrap_or_else(|| reserve.collateral_exchange_rate());

            let supply_amount = Decimal::from(deposit.deposited_amount) / exchange_rate;
            let value = supply_amount * reserve.oracle_market_price() / reserve.mint_factor();

            stats.user_total_deposit += value;
            if !ltv.max_ltv.is_zero() {
                stats.user_total_collateral_deposit += value;
            }
            if !ltv.liquidation_ltv.is_zero() {
                stats.user_total_liquidatable_deposit += value;
            }
            stats.borrow_limit += value * ltv.max_ltv;
            stats.borrow_liquidation_limit += value * ltv.liquidation_ltv;

            stats.deposits.push(Position {
                reserve_address: reserve.address,
                mint_address: reserve.liquidity_mint(),
                mint_factor: reserve.mint_factor(),
                amount: supply_amount,
                market_value_refreshed: value,
            });
        }

        stats.liquidation_ltv = value_or_zero(stats.borrow_liquidation_limit, stats.user_total_liquidatable_deposit);
        Ok(stats)
    }

    /// Values non-empty borrow slots, accruing each by the reserve's rate
    /// growth since the obligation last refreshed.
    pub fn calculate_obligation_borrows(
        market: &KaminoMarket,
        borrows: &[ObligationLiquidity],
        cumulative_borrow_rates: Option<&HashMap<Pubkey, Decimal>>,
        elevation_group: u8,
    ) -> Result<BorrowStats> {
        let mut stats = BorrowStats::default();

        for borrow in borrows.iter().filter(|b| b.borrow_reserve != Pubkey::default()) {
            let reserve = market.reserve(&borrow.borrow_reserve).ok_or_else(|| {
                Error::validation(format!(
                    "Obligation borrow belongs to reserve {} which is not loaded in the market",
                    borrow.borrow_reserve
                ))
            })?;

            let obligation_rate = Self::cumulative_borrow_rate(borrow)?;
            if obligation_rate.is_zero() {
                return Err(Error::state(format!(
                    "Borrow of reserve {} has a zero cumulative borrow rate",
                    reserve.address
                )));
            }
            let reserve_rate = cumulative_borrow_rates
                .and_then(|rates| rates.get(&reserve.address).copied())
                .unwrap_or_else(|| reserve.cumulative_borrow_rate());

            let amount = Self::borrow_amount(borrow)? * reserve_rate / obligation_rate;
            let value = amount * reserve.oracle_market_price() / reserve.mint_factor();
            let borrow_factor = Self::borrow_factor_for_reserve(reserve, elevation_group);

            if !amount.is_zero() {
                stats.positions += 1;
            }
            stats.user_total_borrow += value;
            stats.user_total_borrow_borrow_factor_adjusted += value * borrow_factor;

            stats.borrows.push(Position {
                reserve_address: reserve.address,
                mint_address: reserve.liquidity_mint(),
                mint_factor: reserve.mint_factor(),
                amount,
                market_value_refreshed: value,
            });
        }

        Ok(stats)
    }

    /// Max and liquidation LTV of the current deposits if the obligation
    /// were in `elevation_group`.
    pub fn max_loan_ltv_and_liquidation_ltv_given_elevation_group(
        &self,
        market: &KaminoMarket,
        elevation_group: u8,
        slot: u64,
    ) -> Result<ReserveLtv> {
        let rates = Self::rates_for_obligation(market, &self.state, slot, &[])?;
        let deposits = Self::calculate_obligation_deposits(
            market,
            &self.state.deposits,
            Some(&rates.collateral_exchange_rates),
            elevation_group,
        )?;
        Ok(ReserveLtv {
            max_ltv: value_or_zero(deposits.borrow_limit, deposits.user_total_collateral_deposit),
            liquidation_ltv: value_or_zero(deposits.borrow_liquidation_limit, deposits.user_total_collateral_deposit),
        })
    }

    // --- simulation --------------------------------------------------------

    /// Applies `change` to a copy of the deposit slots. An existing slot for
    /// the reserve is updated; otherwise the first empty slot is taken.
    pub fn simulate_deposit_change(
        deposits: &[ObligationCollateral],
        change: &PositionChange,
        collateral_exchange_rates: &HashMap<Pubkey, Decimal>,
    ) -> Result<Vec<ObligationCollateral>> {
        let exchange_rate = collateral_exchange_rates.get(&change.reserve_address).copied().ok_or_else(|| {
            Error::validation(format!("No exchange rate for reserve {}", change.reserve_address))
        })?;
        let collateral_change = (change.amount_change * exchange_rate)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);

        let mut new_deposits = deposits.to_vec();
        let index = match new_deposits.iter().position(|d| d.deposit_reserve == change.reserve_address) {
            Some(index) => index,
            None => {
                let index = new_deposits
                    .iter()
                    .position(|d| d.deposit_reserve == Pubkey::default())
                    .ok_or_else(|| Error::state("No available deposit slot to modify"))?;
                new_deposits[index].deposit_reserve = change.reserve_address;
                new_deposits[index].deposited_amount = 0;
                index
            }
        };

        let updated = positive_or_zero(Decimal::from(new_deposits[index].deposited_amount) + collateral_change);
        new_deposits[index].deposited_amount = updated
            .to_u64()
            .ok_or_else(|| Error::arithmetic(format!("Deposit amount {} does not fit u64", updated)))?;
        Ok(new_deposits)
    }

    /// Applies `change` to a copy of the borrow slots. A new slot starts at
    /// `cumulative_borrow_rate`.
    pub fn simulate_borrow_change(
        borrows: &[ObligationLiquidity],
        change: &PositionChange,
        cumulative_borrow_rate: Decimal,
    ) -> Result<Vec<ObligationLiquidity>> {
        let mut new_borrows = borrows.to_vec();
        let index = match new_borrows.iter().position(|b| b.borrow_reserve == change.reserve_address) {
            Some(index) => index,
            None => {
                let index = new_borrows
                    .iter()
                    .position(|b| b.borrow_reserve == Pubkey::default())
                    .ok_or_else(|| Error::state("No available borrow slot to modify"))?;
                new_borrows[index].borrow_reserve = change.reserve_address;
                new_borrows[index].borrowed_amount_sf = 0;
                new_borrows[index].cumulative_borrow_rate_bsf.value =
                    BigFraction::from_decimal(cumulative_borrow_rate)?.to_limbs();
                index
            }
        };

        let updated = positive_or_zero(Self::borrow_amount(&new_borrows[index])? + change.amount_change);
        new_borrows[index].borrowed_amount_sf = fraction_from_decimal(updated)?.to_bits();
        Ok(new_borrows)
    }

    /// Stats after a hypothetical action. Positions are recomputed wholesale
    /// because a group change moves every LTV and borrow factor.
    pub fn simulated_obligation_stats(
        &self,
        market: &KaminoMarket,
        params: &SimulationParams,
    ) -> Result<PositionsAndStats> {
        let collateral_reserve = params
            .mint_collateral
            .map(|mint| market.existing_reserve_by_mint(&mint))
            .transpose()?;
        let debt_reserve = params.mint_debt.map(|mint| market.existing_reserve_by_mint(&mint)).transpose()?;

        let additional: Vec<Pubkey> = collateral_reserve
            .iter()
            .chain(debt_reserve.iter())
            .map(|r| r.address)
            .collect();
        let rates = Self::rates_for_obligation(market, &self.state, params.slot, &additional)?;
        let elevation_group = params.elevation_group_override.unwrap_or(self.state.elevation_group);

        let collateral_change = |negate: bool| -> Result<PositionChange> {
            match (collateral_reserve, params.amount_collateral) {
                (Some(reserve), Some(amount)) => Ok(PositionChange {
                    reserve_address: reserve.address,
                    amount_change: if negate { -amount } else { amount },
                }),
                _ => Err(Error::validation(format!(
                    "Collateral amount and mint are required for {}",
                    params.action
                ))),
            }
        };
        let debt_change = |negate: bool| -> Result<(PositionChange, Decimal)> {
            match (debt_reserve, params.amount_debt) {
                (Some(reserve), Some(amount)) => Ok((
                    PositionChange {
                        reserve_address: reserve.address,
                        amount_change: if negate { -amount } else { amount },
                    },
                    reserve.cumulative_borrow_rate(),
                )),
                _ => Err(Error::validation(format!(
                    "Debt amount and mint are required for {}",
                    params.action
                ))),
            }
        };

        let (deposit_change, borrow_change) = match params.action {
            ActionKind::Deposit => (Some(collateral_change(false)?), None),
            ActionKind::Withdraw => (Some(collateral_change(true)?), None),
            ActionKind::Borrow => (None, Some(debt_change(false)?)),
            ActionKind::Repay => (None, Some(debt_change(true)?)),
            ActionKind::DepositAndBorrow => (Some(collateral_change(false)?), Some(debt_change(false)?)),
            ActionKind::RepayAndWithdraw => (Some(collateral_change(true)?), Some(debt_change(true)?)),
            other => {
                return Err(Error::validation(format!(
                    "Invalid action type {} for simulated obligation stats",
                    other
                )))
            }
        };

        let deposits = match deposit_change {
            Some(change) => Self::simulate_deposit_change(&self.state.deposits, &change, &rates.collateral_exchange_rates)?,
            None => self.state.deposits.to_vec(),
        };
        let borrows = match borrow_change {
            Some((change, rate)) => Self::simulate_borrow_change(&self.state.borrows, &change, rate)?,
            None => self.state.borrows.to_vec(),
        };

        Self::calculate_positions(
            market,
            &deposits,
            &borrows,
            elevation_group,
            Some(&rates.collateral_exchange_rates),
            None,
        )
    }

    /// Stats after swapping one collateral for another, optionally moving
    /// to `new_elevation_group`.
    pub fn post_swap_collateral_stats(
        &self,
        market: &KaminoMarket,
        withdraw: PositionChange,
        deposit: PositionChange,
        new_elevation_group: u8,
        slot: u64,
    ) -> Result<ObligationStats> {
        let additional: Vec<Pubkey> = [withdraw.reserve_address, deposit.reserve_address]
            .into_iter()
            .filter(|r| self.deposit_by_reserve(r).is_none() && self.borrow_by_reserve(r).is_none())
            .collect();
        let rates = Self::rates_for_obligation(market, &self.state, slot, &additional)?;

        let withdraw = PositionChange {
            reserve_address: withdraw.reserve_address,
            amount_change: -withdraw.amount_change.abs(),
        };
        let deposits = Self::simulate_deposit_change(&self.state.deposits, &withdraw, &rates.collateral_exchange_rates)?;
        let deposits = Self::simulate_deposit_change(&deposits, &deposit, &rates.collateral_exchange_rates)?;

        Ok(Self::calculate_positions(
            market,
            &deposits,
            &self.state.borrows,
            new_elevation_group,
            Some(&rates.collateral_exchange_rates),
            None,
        )?
        .stats)
    }

    /// A copy of this obligation with the changes applied, valued at `slot`.
    pub fn with_position_changes(
        &self,
        market: &KaminoMarket,
        slot: u64,
        deposit_changes: &[PositionChange],
        borrow_changes: &[PositionChange],
    ) -> Result<Self> {
        let touched: Vec<Pubkey> = deposit_changes
            .iter()
            .chain(borrow_changes.iter())
            .map(|c| c.reserve_address)
            .collect();
        let rates = Self::rates_for_obligation(market, &self.state, slot, &touched)?;

        let mut deposits = self.state.deposits.to_vec();
        for change in deposit_changes {
            deposits = Self::simulate_deposit_change(&deposits, change, &rates.collateral_exchange_rates)?;
        }
        let mut borrows = self.state.borrows.to_vec();
        for change in borrow_changes {
            let reserve = market.existing_reserve(&change.reserve_address)?;
            borrows = Self::simulate_borrow_change(&borrows, change, reserve.cumulative_borrow_rate())?;
        }

        let mut state = self.state.clone();
        for (slot_state, deposit) in state.deposits.iter_mut().zip(deposits) {
            *slot_state = deposit;
        }
        for (slot_state, borrow) in state.borrows.iter_mut().zip(borrows) {
            *slot_state = borrow;
        }

        Self::new(market, self.address, state, &rates)
    }

    /// Growth factor of a borrow's debt since the obligation last refreshed,
    /// 0 when the reserve index has not moved.
    pub fn estimate_obligation_interest_rate(
        market: &KaminoMarket,
        reserve: &KaminoReserve,
        borrow: &ObligationLiquidity,
        slot: u64,
    ) -> Result<Decimal> {
        let new_rate = reserve.estimated_cumulative_borrow_rate(slot, market.referral_fee_bps())?;
        let former_rate = Self::cumulative_borrow_rate(borrow)?;
        if new_rate > former_rate && !former_rate.is_zero() {
            Ok(new_rate / former_rate)
        } else {
            Ok(Decimal::ZERO)
        }
    }

    // --- borrow / withdraw limits ------------------------------------------

    fn disabled_outside_group(&self, market: &KaminoMarket, group_activated: bool) -> Result<bool> {
        if group_activated {
            return Ok(false);
        }
        for deposit in &self.deposits {
            let reserve = market.existing_reserve(&deposit.reserve_address)?;
            if reserve.state().config.disable_usage_as_coll_outside_emode != 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// LTV headroom converted to lamports of `reserve`, before fees and caps.
    fn raw_borrow_power(
        &self,
        market: &KaminoMarket,
        reserve: &KaminoReserve,
        slot: u64,
        elevation_group: u8,
    ) -> Result<Decimal> {
        let rates = Self::rates_for_obligation(market, &self.state, slot, &[])?;
        let deposits = Self::calculate_obligation_deposits(
            market,
            &self.state.deposits,
            Some(&rates.collateral_exchange_rates),
            elevation_group,
        )?;
        let borrows = Self::calculate_obligation_borrows(
            market,
            &self.state.borrows,
            Some(&rates.cumulative_borrow_rates),
            elevation_group,
        )?;

        let price = reserve.oracle_market_price();
        if price.is_zero() {
            return Err(Error::validation(format!("Reserve {} has no price", reserve.address)));
        }
        let borrow_factor = Self::borrow_factor_for_reserve(reserve, elevation_group);
        let headroom = deposits.borrow_limit - borrows.user_total_borrow_borrow_factor_adjusted;
        let power = headroom
            .checked_div(borrow_factor)
            .and_then(|v| v.checked_div(price))
            .and_then(|v| v.checked_mul(reserve.mint_factor()))
            .ok_or_else(|| {
                Error::arithmetic(format!(
                    "Borrow power for reserve {} overflows (borrow factor {})",
                    reserve.address, borrow_factor
                ))
            })?;
        Ok(power)
    }

    /// Extra lamports of `liquidity_mint` borrowable before max LTV, ignoring
    /// reserve liquidity and caps. The origination fee is taken out.
    pub fn borrow_power(
        &self,
        market: &KaminoMarket,
        liquidity_mint: &Pubkey,
        slot: u64,
        elevation_group: Option<u8>,
    ) -> Result<Decimal> {
        let reserve = market.existing_reserve_by_mint(liquidity_mint)?;
        let group = elevation_group.unwrap_or(self.state.elevation_group);
        let power = self.raw_borrow_power(market, reserve, slot, group)?;

        if self.disabled_outside_group(market, reserve.is_in_elevation_group(group))? {
            return Ok(Decimal::ZERO);
        }

        let fee_factor = reserve.borrow_fee() / (reserve.borrow_fee() + Decimal::ONE);
        Ok(positive_or_zero(power - power * fee_factor))
    }

    /// Borrow power clamped by what the reserve can lend in `elevation_group`.
    pub fn max_borrow_amount_v2(
        &self,
        market: &KaminoMarket,
        liquidity_mint: &Pubkey,
        slot: u64,
        elevation_group: Option<u8>,
    ) -> Result<Decimal> {
        let reserve = market.existing_reserve_by_mint(liquidity_mint)?;
        let group = elevation_group.unwrap_or(self.state.elevation_group);

        let available = reserve
            .liquidity_available_for_debt_reserve_given_caps(market, &[group], &self.deposit_reserves())?
            .first()
            .copied()
            .unwrap_or(Decimal::ZERO);
        let power = self.borrow_power(market, liquidity_mint, slot, Some(group))?;

        if group == self.state.elevation_group {
            return Ok(power.min(available));
        }
        let existing_debt = self
            .borrow_by_reserve(&reserve.address)
            .map(|p| p.amount)
            .unwrap_or(Decimal::ZERO);
        Ok(power.min(positive_or_zero(available - existing_debt)))
    }

    pub fn max_borrow_amount_v2_with_deposit(
        &self,
        market: &KaminoMarket,
        liquidity_mint: &Pubkey,
        slot: u64,
        elevation_group: Option<u8>,
        deposit: PositionChange,
    ) -> Result<Decimal> {
        self.with_position_changes(market, slot, &[deposit], &[])?
            .max_borrow_amount_v2(market, liquidity_mint, slot, elevation_group)
    }

    /// Lamports of `liquidity_mint` borrowable now: LTV headroom, then reserve
    /// liquidity and global cap, daily debt cap, origination fee, utilization
    /// block, and the group or outside-group debt limit.
    pub fn max_borrow_amount(
        &self,
        market: &KaminoMarket,
        liquidity_mint: &Pubkey,
        slot: u64,
        request_elevation_group: bool,
    ) -> Result<Decimal> {
        let reserve = market.existing_reserve_by_mint(liquidity_mint)?;

        let mut common: Vec<u8> = reserve
            .elevation_groups()
            .filter(|g| market.elevation_group(*g).map_or(false, |eg| eg.debt_reserve == reserve.address))
            .collect();
        for deposit in &self.deposits {
            let deposit_reserve = market.existing_reserve(&deposit.reserve_address)?;
            common.retain(|g| deposit_reserve.is_in_elevation_group(*g));
        }

        let mut group = self.state.elevation_group;
        if request_elevation_group {
            if let Some(best) = market.highest_ltv_group(&common) {
                group = best;
            }
        }
        let group_activated = reserve.is_in_elevation_group(group);

        let power = self.raw_borrow_power(market, reserve, slot, group)?;
        let mut borrow_cap_remaining = reserve.stats.borrow_limit - reserve.borrowed_amount();
        if self.disabled_outside_group(market, group_activated)? {
            borrow_cap_remaining = Decimal::ZERO;
        }

        let mut max_borrow = power
            .min(reserve.liquidity_available_amount())
            .min(borrow_cap_remaining);

        if reserve.debt_withdrawal_cap_capacity() > Decimal::ZERO {
            max_borrow = max_borrow
                .min(reserve.debt_withdrawal_cap_capacity() - reserve.debt_withdrawal_cap_current(slot));
        }

        let fee_factor = reserve.borrow_fee() / (reserve.borrow_fee() + Decimal::ONE);
        max_borrow -= max_borrow * fee_factor;

        let utilization_limit = reserve.utilization_limit_block_borrowing_above();
        let utilization = reserve.utilization_ratio();
        if utilization_limit > Decimal::ZERO {
            if utilization > utilization_limit {
                return Ok(Decimal::ZERO);
            }
            if utilization < utilization_limit {
                max_borrow = max_borrow.min((utilization_limit - utilization) * reserve.total_supply());
            }
        }

        let group_limit = if !group_activated {
            reserve.borrow_limit_outside_elevation_group() - reserve.borrowed_amount_outside_elevation_group()
        } else {
            let mut limit = Decimal::from(U64_MAX);
            for deposit in &self.deposits {
                let deposit_reserve = market.existing_reserve(&deposit.reserve_address)?;
                let allowed = deposit_reserve.borrow_limit_against_collateral_in_elevation_group(group)
                    - deposit_reserve.borrowed_amount_against_collateral_in_elevation_group(group);
                limit = positive_or_zero(allowed.min(limit));
            }
            limit
        };

        Ok(positive_or_zero(max_borrow.min(group_limit)))
    }

    /// Lamports of `token_mint` withdrawable before max LTV, bounded by the
    /// deposit, reserve liquidity and the daily withdrawal cap.
    pub fn max_withdraw_amount(&self, market: &KaminoMarket, token_mint: &Pubkey, slot: u64) -> Result<Decimal> {
        let reserve = market.existing_reserve_by_mint(token_mint)?;

        let withdrawal_cap_remaining =
            reserve.deposit_withdrawal_cap_capacity() - reserve.deposit_withdrawal_cap_current(slot);
        let reserve_withdrawal_limit = withdrawal_cap_remaining.min(reserve.liquidity_available_amount());

        let deposit_amount = self
            .deposit_by_reserve(&reserve.address)
            .map(|p| p.amount)
            .ok_or_else(|| Error::state(format!("No deposit in reserve {}", reserve.address)))?;

        let stats = &self.refreshed_stats;
        if stats.user_total_borrow_borrow_factor_adjusted.is_zero() {
            return Ok(positive_or_zero(deposit_amount.min(reserve_withdrawal_limit)));
        }
        if stats.user_total_borrow_borrow_factor_adjusted >= stats.borrow_limit {
            return Ok(Decimal::ZERO);
        }

        let ltv = Self::ltv_for_reserve(market, reserve, self.state.elevation_group)?;
        let max_withdraw_value = if ltv.max_ltv.is_zero() {
            deposit_amount
        } else {
            (stats.borrow_limit - stats.user_total_borrow_borrow_factor_adjusted) / ltv.max_ltv
                * MAX_WITHDRAW_SAFETY_FACTOR
        };

        let max_withdraw_amount = value_or_zero(max_withdraw_value, reserve.oracle_market_price()) * reserve.mint_factor();
        Ok(positive_or_zero(
            deposit_amount.min(max_withdraw_amount).min(reserve_withdrawal_limit),
        ))
    }

    /// [`Self::max_withdraw_amount`] after first repaying `repay_amount`
    /// (`U64_MAX` repays the whole borrow).
    pub fn max_withdraw_amount_with_repay(
        &self,
        market: &KaminoMarket,
        token_mint: &Pubkey,
        slot: u64,
        repay_amount: Decimal,
        repay_reserve: &Pubkey,
    ) -> Result<Decimal> {
        let reserve = market.existing_reserve(repay_reserve)?;
        let repay_amount = if repay_amount == Decimal::from(U64_MAX) {
            self.borrow_by_reserve(&reserve.address)
                .map(|p| p.amount)
                .unwrap_or(Decimal::ZERO)
        } else {
            repay_amount
        };
        let repay = PositionChange {
            reserve_address: *repay_reserve,
            amount_change: -repay_amount,
        };
        self.with_position_changes(market, slot, &[], &[repay])?
            .max_withdraw_amount(market, token_mint, slot)
    }

    // --- elevation groups --------------------------------------------------

    /// Groups shared by every reserve the obligation uses.
    pub fn elevation_groups(&self, market: &KaminoMarket) -> Result<Vec<u8>> {
        let mut reserves: Vec<Pubkey> = Vec::new();
        for address in self.deposit_reserves().into_iter().chain(self.borrow_reserves()) {
            if !reserves.contains(&address) {
                reserves.push(address);
            }
        }
        let reserves = reserves
            .iter()
            .map(|r| market.existing_reserve(r))
            .collect::<Result<Vec<_>>>()?;

        let Some(first) = reserves.first() else {
            return Ok(Vec::new());
        };
        Ok(first
            .elevation_groups()
            .filter(|g| reserves.iter().all(|r| r.is_in_elevation_group(*g)))
            .collect())
    }

    /// Groups whose reserve sets cover this obligation. Multi-debt
    /// obligations have none.
    pub fn elevation_groups_for_obligation(&self, market: &KaminoMarket) -> Result<Vec<ElevationGroupDescription>> {
        if self.borrows.len() > 1 {
            return Ok(Vec::new());
        }
        let colls = self.deposit_reserves();
        let debt = self.borrows.first().map(|b| b.reserve_address);
        market.elevation_groups_for_reserves_combination(&colls, debt.as_ref())
    }

    /// Groups the loan could move to right now: reserve membership as above,
    /// then the group's borrow limit against the current debt.
    pub fn eligible_elevation_groups(
        &self,
        market: &KaminoMarket,
        slot: u64,
    ) -> Result<Vec<ElevationGroupDescription>> {
        let mut eligible = Vec::new();
        for group in self.elevation_groups_for_obligation(market)? {
            if self.is_loan_eligible_for_elevation_group(market, slot, group.elevation_group)? {
                eligible.push(group);
            }
        }
        Ok(eligible)
    }

    /// Whether the loan could move to `elevation_group` (0 included): reserve
    /// membership first, then BF-adjusted debt against the group's borrow limit.
    pub fn is_loan_eligible_for_elevation_group(
        &self,
        market: &KaminoMarket,
        slot: u64,
        elevation_group: u8,
    ) -> Result<bool> {
        if self.borrows.len() > 1 {
            return Ok(false);
        }

        if elevation_group > 0 {
            let Some(description) = market.existing_elevation_group(elevation_group)? else {
                return Ok(false);
            };
            let all_colls = self
                .deposits
                .iter()
                .all(|d| description.collateral_reserves.contains(&d.reserve_address));
            let all_debts = self
                .borrows
                .first()
                .map_or(true, |b| b.reserve_address == description.debt_reserve);
            if !all_colls || !all_debts {
                return Ok(false);
            }
        }

        let rates = Self::rates_for_obligation(market, &self.state, slot, &[])?;
        let deposits = Self::calculate_obligation_deposits(
            market,
            &self.state.deposits,
            Some(&rates.collateral_exchange_rates),
            elevation_group,
        )?;
        Ok(self.refreshed_stats.user_total_borrow_borrow_factor_adjusted <= deposits.borrow_limit)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::math::fraction::FRACTION_ONE_SCALED;

    pub fn obligation_state(market: Pubkey, owner: Pubkey) -> Obligation {
        let mut state = Obligation::zeroed().unwrap();
        state.lending_market = market;
        state.owner = owner;
        state
    }

    pub fn add_deposit(state: &mut Obligation, reserve: Pubkey, amount: u64) {
        let slot = state
            .deposits
            .iter_mut()
            .find(|d| d.deposit_reserve == Pubkey::default())
            .unwrap();
        slot.deposit_reserve = reserve;
        slot.deposited_amount = amount;
    }

    pub fn add_borrow(state: &mut Obligation, reserve: Pubkey, amount: u64) {
        let slot = state
            .borrows
            .iter_mut()
            .find(|b| b.borrow_reserve == Pubkey::default())
            .unwrap();
        slot.borrow_reserve = reserve;
        slot.borrowed_amount_sf = u128::from(amount) << 60;
        slot.cumulative_borrow_rate_bsf.value = [FRACTION_ONE_SCALED as u64, 0, 0, 0];
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::core::registry::ProgramIds;
    use crate::core::types::PriceQuote;
    use crate::engine::market::fixtures::{market_state, set_group};
    use crate::engine::reserve::fixtures::reserve_state;

    const SLOT: u64 = 1_000;

    struct Setup {
        market: KaminoMarket,
        coll: Pubkey,
        debt: Pubkey,
    }

    /// Collateral priced at 10, debt at 1, both with 6 decimals. Group 1 puts
    /// the pair at 90% LTV.
    fn setup(with_group: bool) -> Setup {
        let market_address = Pubkey::new_unique();
        let coll = Pubkey::new_unique();
        let debt = Pubkey::new_unique();

        let mut state = market_state();
        if with_group {
            set_group(&mut state, 1, 90, 95, debt);
        }

        let mut coll_state = reserve_state(Pubkey::new_unique(), 1_000_000_000, 0, SLOT);
        coll_state.lending_market = market_address;
        let mut debt_state = reserve_state(Pubkey::new_unique(), 1_000_000_000, 0, SLOT);
        debt_state.lending_market = market_address;
        debt_state.config.borrow_factor_pct = 125;
        if with_group {
            coll_state.config.elevation_groups[0] = 1;
            coll_state.config.borrow_limit_against_this_collateral_in_elevation_group[0] = u64::MAX;
            debt_state.config.elevation_groups[0] = 1;
        }

        let reserves = vec![
            KaminoReserve::new(coll, coll_state, PriceQuote::new(Decimal::from(10)), 500).unwrap(),
            KaminoReserve::new(debt, debt_state, PriceQuote::new(Decimal::ONE), 500).unwrap(),
        ];
        let market = KaminoMarket::new(market_address, state, reserves, ProgramIds::klend().unwrap(), 500);
        Setup { market, coll, debt }
    }

    fn obligation(setup: &Setup, deposit: u64, borrow: u64, group: u8) -> KaminoObligation {
        let mut state = obligation_state(setup.market.address, Pubkey::new_unique());
        add_deposit(&mut state, setup.coll, deposit);
        if borrow > 0 {
            add_borrow(&mut state, setup.debt, borrow);
        }
        state.elevation_group = group;
        let rates = KaminoObligation::rates_for_obligation(&setup.market, &state, SLOT, &[]).unwrap();
        KaminoObligation::new(&setup.market, Pubkey::new_unique(), state, &rates).unwrap()
    }

    #[test]
    fn test_positions_and_stats() {
        let s = setup(false);
        // 10 tokens at $10, 20 tokens borrowed at $1 with BF 1.25
        let o = obligation(&s, 10_000_000, 20_000_000, 0);
        let stats = &o.refreshed_stats;

        assert_eq!(stats.user_total_deposit, Decimal::from(100));
        assert_eq!(stats.user_total_borrow, Decimal::from(20));
        assert_eq!(stats.user_total_borrow_borrow_factor_adjusted, Decimal::from(25));
        assert_eq!(stats.borrow_limit, Decimal::from(70));
        assert_eq!(stats.borrow_liquidation_limit, Decimal::from(75));
        assert_eq!(stats.net_account_value, Decimal::from(80));
        assert_eq!(o.loan_to_value(), Decimal::new(25, 2));
        assert_eq!(o.deposits[0].amount, Decimal::from(10_000_000));
        assert_eq!(stats.positions, 2);
    }

    #[test]
    fn test_group_overrides_ltv_and_borrow_factor() {
        let s = setup(true);
        let o = obligation(&s, 10_000_000, 20_000_000, 1);
        assert_eq!(o.refreshed_stats.borrow_limit, Decimal::from(90));
        assert_eq!(o.refreshed_stats.user_total_borrow_borrow_factor_adjusted, Decimal::from(20));
    }

    #[test]
    fn test_borrow_power_inverts_ltv() {
        let s = setup(false);
        let o = obligation(&s, 10_000_000, 0, 0);
        let debt_mint = s.market.reserve(&s.debt).unwrap().liquidity_mint();
        // (70 - 0) / 1.25 / $1 * 1e6
        assert_eq!(o.borrow_power(&s.market, &debt_mint, SLOT, None).unwrap(), Decimal::from(56_000_000));
        assert_eq!(o.max_borrow_amount(&s.market, &debt_mint, SLOT, false).unwrap(), Decimal::from(56_000_000));
    }

    #[test]
    fn test_max_borrow_requests_best_group() {
        let s = setup(true);
        let o = obligation(&s, 10_000_000, 0, 0);
        let debt_mint = s.market.reserve(&s.debt).unwrap().liquidity_mint();
        assert_eq!(o.max_borrow_amount(&s.market, &debt_mint, SLOT, true).unwrap(), Decimal::from(90_000_000));
        assert!(o.is_loan_eligible_for_elevation_group(&s.market, SLOT, 1).unwrap());
    }

    #[test]
    fn test_eligible_groups_respect_group_borrow_limit() {
        let s = setup(true);

        // $100 of collateral, $80 of debt: 100 adjusted outside the group, past the 90 limit.
        let over = obligation(&s, 10_000_000, 80_000_000, 0);
        let members: Vec<u8> = over
            .elevation_groups_for_obligation(&s.market)
            .unwrap()
            .iter()
            .map(|g| g.elevation_group)
            .collect();
        assert_eq!(members, vec![1]);
        assert!(!over.is_loan_eligible_for_elevation_group(&s.market, SLOT, 1).unwrap());
        assert!(over.eligible_elevation_groups(&s.market, SLOT).unwrap().is_empty());

        let healthy = obligation(&s, 10_000_000, 20_000_000, 0);
        let eligible = healthy.eligible_elevation_groups(&s.market, SLOT).unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].elevation_group, 1);
    }

    #[test]
    fn test_zero_borrow_factor_is_arithmetic_error() {
        let mut s = setup(false);
        let mut state = s.market.reserve(&s.debt).unwrap().state().clone();
        state.config.borrow_factor_pct = 0;
        let quote = PriceQuote::new(Decimal::ONE);
        let debt_reserve = KaminoReserve::new(s.debt, state, quote, 500).unwrap();
        let coll_reserve = s.market.reserve(&s.coll).unwrap().clone();
        s.market = KaminoMarket::new(
            s.market.address,
            s.market.state.clone(),
            vec![coll_reserve, debt_reserve],
            ProgramIds::klend().unwrap(),
            500,
        );

        let o = obligation(&s, 10_000_000, 0, 0);
        let debt_mint = s.market.reserve(&s.debt).unwrap().liquidity_mint();
        let err = o.borrow_power(&s.market, &debt_mint, SLOT, None).unwrap_err();
        assert!(matches!(err, Error::Arithmetic(_)), "got {:?}", err);
    }

    #[test]
    fn test_past_limit_returns_zero_not_negative() {
        let s = setup(false);
        let o = obligation(&s, 10_000_000, 60_000_000, 0);
        let debt_mint = s.market.reserve(&s.debt).unwrap().liquidity_mint();
        let coll_mint = s.market.reserve(&s.coll).unwrap().liquidity_mint();
        assert_eq!(o.max_borrow_amount(&s.market, &debt_mint, SLOT, false).unwrap(), Decimal::ZERO);
        assert_eq!(o.max_withdraw_amount(&s.market, &coll_mint, SLOT).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_max_withdraw_without_debt_is_whole_deposit() {
        let s = setup(false);
        let o = obligation(&s, 10_000_000, 0, 0);
        let coll_mint = s.market.reserve(&s.coll).unwrap().liquidity_mint();
        assert_eq!(o.max_withdraw_amount(&s.market, &coll_mint, SLOT).unwrap(), Decimal::from(10_000_000));
    }

    #[test]
    fn test_simulated_deposit_takes_first_free_slot() {
        let s = setup(false);
        let o = obligation(&s, 10_000_000, 0, 0);
        let debt_mint = s.market.reserve(&s.debt).unwrap().liquidity_mint();

        let simulated = o
            .simulated_obligation_stats(
                &s.market,
                &SimulationParams {
                    action: ActionKind::Deposit,
                    amount_collateral: Some(Decimal::from(5_000_000)),
                    amount_debt: None,
                    mint_collateral: Some(debt_mint),
                    mint_debt: None,
                    slot: SLOT,
                    elevation_group_override: None,
                },
            )
            .unwrap();
        assert_eq!(simulated.deposits.len(), 2);
        assert_eq!(simulated.deposits[1].reserve_address, s.debt);
        assert_eq!(simulated.stats.user_total_deposit, Decimal::from(105));
        // the loaded obligation is untouched
        assert_eq!(o.deposits.len(), 1);
    }

    #[test]
    fn test_simulation_fails_when_slots_are_full() {
        let mut deposits = obligation_state(Pubkey::new_unique(), Pubkey::new_unique()).deposits;
        for slot in deposits.iter_mut() {
            slot.deposit_reserve = Pubkey::new_unique();
        }
        let change = PositionChange {
            reserve_address: Pubkey::new_unique(),
            amount_change: Decimal::ONE,
        };
        let rates = HashMap::from([(change.reserve_address, Decimal::ONE)]);
        let err = KaminoObligation::simulate_deposit_change(&deposits, &change, &rates).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn test_repay_all_simulation_clears_debt() {
        let s = setup(false);
        let o = obligation(&s, 10_000_000, 20_000_000, 0);
        let coll_mint = s.market.reserve(&s.coll).unwrap().liquidity_mint();
        let full = o
            .max_withdraw_amount_with_repay(&s.market, &coll_mint, SLOT, Decimal::from(U64_MAX), &s.debt)
            .unwrap();
        assert_eq!(full, Decimal::from(10_000_000));
    }
}
