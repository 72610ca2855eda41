//! Reserve snapshot and its interest model.
//!
//! Every projection here is pure: estimating a reserve at a later slot never
//! mutates the decoded account.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::core::error::{Error, Result};
use crate::core::registry::constants::{
    INITIAL_COLLATERAL_RATE, ONE_HUNDRED_PCT_IN_BPS, SLOTS_PER_DAY, SLOTS_PER_SECOND, SLOTS_PER_YEAR, U64_MAX,
};
use crate::core::types::{positive_or_zero, value_or_zero, ActionKind, PriceQuote, ReserveFarmKind};
use crate::engine::market::KaminoMarket;
use crate::math::fraction::{sf_to_decimal, BigFraction};
use crate::protocol::kamino::types::{CurvePoint, Reserve};

/// Whether a fee is carved out of the amount or charged on top of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeCalculation {
    Inclusive,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fees {
    pub protocol_fees: Decimal,
    pub referrer_fees: Decimal,
}

/// Result of compounding the reserve's debt over a number of slots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompoundedInterest {
    pub new_debt: Decimal,
    pub net_new_debt: Decimal,
    pub variable_protocol_fee: Decimal,
    pub fixed_host_fee: Decimal,
    pub absolute_referral_fee: Decimal,
    pub max_referral_fees: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtocolFeeEstimate {
    pub accumulated_protocol_fees: Decimal,
    pub compounded_variable_protocol_fee: Decimal,
    pub compounded_fixed_host_fee: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DebtAgainstCollateralCap {
    pub collateral_reserve: Pubkey,
    pub elevation_group: u8,
    pub max_debt: Decimal,
    pub current_value: Decimal,
}

/// Every limit that bounds new borrowing from a debt reserve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowCapsAndCounters {
    pub utilization_cap: Decimal,
    pub utilization_current_value: Decimal,
    pub net_withdrawal_cap: Decimal,
    pub net_withdrawal_current_value: Decimal,
    pub net_withdrawal_last_update_ts: Decimal,
    pub net_withdrawal_interval_duration_seconds: Decimal,
    pub global_debt_cap: Decimal,
    pub global_total_borrowed: Decimal,
    pub debt_outside_emode_cap: Decimal,
    pub borrowed_outside_emode: Decimal,
    pub debt_against_collateral_reserve_caps: Vec<DebtAgainstCollateralCap>,
}

/// Config values of a reserve in human units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveStats {
    pub symbol: String,
    pub decimals: u32,
    pub status: u8,
    pub loan_to_value: Decimal,
    pub liquidation_threshold: Decimal,
    pub min_liquidation_bonus: Decimal,
    pub max_liquidation_bonus: Decimal,
    pub protocol_take_rate: Decimal,
    pub borrow_factor: Decimal,
    pub deposit_limit: Decimal,
    pub borrow_limit: Decimal,
    pub host_fixed_interest_rate: Decimal,
}

impl ReserveStats {
    fn from_state(state: &Reserve) -> Self {
        let config = &state.config;
        let pct = |v: u64| Decimal::from(v) / Decimal::ONE_HUNDRED;
        let bps = |v: u64| Decimal::from(v) / Decimal::from(ONE_HUNDRED_PCT_IN_BPS);

        ReserveStats {
            symbol: parse_token_symbol(&config.token_info.name),
            decimals: state.mint_decimals(),
            status: config.status,
            loan_to_value: pct(u64::from(config.loan_to_value_pct)),
            liquidation_threshold: pct(u64::from(config.liquidation_threshold_pct)),
            min_liquidation_bonus: bps(u64::from(config.min_liquidation_bonus_bps)),
            max_liquidation_bonus: bps(u64::from(config.max_liquidation_bonus_bps)),
            protocol_take_rate: pct(u64::from(config.protocol_take_rate_pct)),
            borrow_factor: pct(config.borrow_factor_pct),
            deposit_limit: Decimal::from(config.deposit_limit),
            borrow_limit: Decimal::from(config.borrow_limit),
            host_fixed_interest_rate: bps(u64::from(config.host_fixed_interest_rate_bps)),
        }
    }
}

fn parse_token_symbol(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).to_string()
}

/// A loaded reserve: address, decoded account, oracle price and the scaled
/// fields decoded once at construction.
#[derive(Debug, Clone)]
pub struct KaminoReserve {
    pub address: Pubkey,
    pub price: PriceQuote,
    pub stats: ReserveStats,
    state: Reserve,
    recent_slot_duration_ms: u64,
    borrowed_amount: Decimal,
    accumulated_protocol_fees: Decimal,
    accumulated_referrer_fees: Decimal,
    pending_referrer_fees: Decimal,
    cumulative_borrow_rate: Decimal,
    borrow_fee: Decimal,
    flash_loan_fee: Decimal,
    reserve_market_price: Decimal,
}

impl KaminoReserve {
    pub fn new(address: Pubkey, state: Reserve, price: PriceQuote, recent_slot_duration_ms: u64) -> Result<Self> {
        if recent_slot_duration_ms == 0 {
            return Err(Error::validation("Recent slot duration must be greater than 0"));
        }

        let liquidity = &state.liquidity;
        let flash_loan_fee = if state.config.fees.flash_loan_fee_sf == u64::MAX {
            Decimal::ZERO
        } else {
            sf_to_decimal(u128::from(state.config.fees.flash_loan_fee_sf))?
        };

        Ok(KaminoReserve {
            address,
            price,
            stats: ReserveStats::from_state(&state),
            recent_slot_duration_ms,
            borrowed_amount: sf_to_decimal(liquidity.borrowed_amount_sf)?,
            accumulated_protocol_fees: sf_to_decimal(liquidity.accumulated_protocol_fees_sf)?,
            accumulated_referrer_fees: sf_to_decimal(liquidity.accumulated_referrer_fees_sf)?,
            pending_referrer_fees: sf_to_decimal(liquidity.pending_referrer_fees_sf)?,
            cumulative_borrow_rate: BigFraction::from_limbs(liquidity.cumulative_borrow_rate_bsf.value).to_decimal()?,
            borrow_fee: sf_to_decimal(u128::from(state.config.fees.borrow_fee_sf))?,
            flash_loan_fee,
            reserve_market_price: sf_to_decimal(liquidity.market_price_sf)?,
            state,
        })
    }

    pub fn state(&self) -> &Reserve {
        &self.state
    }

    pub fn symbol(&self) -> &str {
        &self.stats.symbol
    }

    pub fn liquidity_mint(&self) -> Pubkey {
        self.state.mint_pubkey()
    }

    pub fn collateral_mint(&self) -> Pubkey {
        self.state.collateral_mint_pubkey()
    }

    pub fn liquidity_token_program(&self) -> Pubkey {
        self.state.liquidity_token_program()
    }

    pub fn farm(&self, kind: ReserveFarmKind) -> Option<Pubkey> {
        self.state.farm(kind)
    }

    pub fn elevation_groups(&self) -> impl Iterator<Item = u8> + '_ {
        self.state.config.elevation_groups.iter().copied().filter(|g| *g != 0)
    }

    pub fn is_in_elevation_group(&self, group: u8) -> bool {
        group != 0 && self.state.config.elevation_groups.contains(&group)
    }

    pub fn last_update_slot(&self) -> u64 {
        self.state.last_update.slot
    }

    fn slots_elapsed(&self, slot: u64) -> u64 {
        slot.saturating_sub(self.state.last_update.slot)
    }

    // --- amounts -----------------------------------------------------------

    pub fn liquidity_available_amount(&self) -> Decimal {
        Decimal::from(self.state.liquidity.available_amount)
    }

    pub fn borrowed_amount(&self) -> Decimal {
        self.borrowed_amount
    }

    pub fn borrowed_amount_outside_elevation_group(&self) -> Decimal {
        Decimal::from(self.state.borrowed_amount_outside_elevation_group)
    }

    pub fn accumulated_protocol_fees(&self) -> Decimal {
        self.accumulated_protocol_fees
    }

    pub fn accumulated_referrer_fees(&self) -> Decimal {
        self.accumulated_referrer_fees
    }

    pub fn pending_referrer_fees(&self) -> Decimal {
        self.pending_referrer_fees
    }

    /// Liquidity owned by depositors: available + borrowed minus every fee
    /// bucket the protocol has not paid out yet.
    pub fn total_supply(&self) -> Decimal {
        self.liquidity_available_amount() + self.borrowed_amount
            - self.accumulated_protocol_fees
            - self.accumulated_referrer_fees
            - self.pending_referrer_fees
    }

    pub fn estimated_total_supply(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        Ok(self.estimated_debt_and_supply(slot, referral_fee_bps)?.1)
    }

    pub fn reserve_market_price(&self) -> Decimal {
        self.reserve_market_price
    }

    pub fn oracle_market_price(&self) -> Decimal {
        self.price.price
    }

    /// `10^decimals` of the liquidity mint.
    pub fn mint_factor(&self) -> Decimal {
        Decimal::from(10u64.pow(self.stats.decimals.min(19)))
    }

    pub fn deposit_tvl(&self) -> Decimal {
        self.total_supply() * self.oracle_market_price() / self.mint_factor()
    }

    pub fn borrow_tvl(&self) -> Decimal {
        self.borrowed_amount * self.oracle_market_price() / self.mint_factor()
    }

    pub fn deposit_limit_crossed(&self) -> bool {
        self.total_supply() > self.stats.deposit_limit
    }

    pub fn borrow_limit_crossed(&self) -> bool {
        self.borrowed_amount > self.stats.borrow_limit
    }

    // --- fees --------------------------------------------------------------

    pub fn borrow_fee(&self) -> Decimal {
        self.borrow_fee
    }

    /// Zero when flash loans are disabled (`u64::MAX` fee).
    pub fn flash_loan_fee(&self) -> Decimal {
        self.flash_loan_fee
    }

    pub fn borrow_factor(&self) -> Decimal {
        self.stats.borrow_factor
    }

    pub fn fixed_host_interest_rate(&self) -> Decimal {
        self.stats.host_fixed_interest_rate
    }

    pub fn protocol_take_rate(&self) -> Decimal {
        self.stats.protocol_take_rate
    }

    /// Origination fee split between the protocol and an optional referrer.
    /// A minimum fee of one lamport applies; amounts the fee would consume
    /// entirely are rejected.
    pub fn calculate_fees(
        &self,
        amount: Decimal,
        fee_rate: Decimal,
        calculation: FeeCalculation,
        referral_fee_bps: u16,
        has_referrer: bool,
    ) -> Result<Fees> {
        let referral_fee_rate = Decimal::from(referral_fee_bps) / Decimal::from(ONE_HUNDRED_PCT_IN_BPS);
        if fee_rate <= Decimal::ZERO || amount <= Decimal::ZERO {
            return Ok(Fees::default());
        }

        let fee_amount = match calculation {
            FeeCalculation::Exclusive => amount * fee_rate,
            FeeCalculation::Inclusive => amount * (fee_rate / (fee_rate + Decimal::ONE)),
        };
        let fee = fee_amount.max(Decimal::ONE);
        if fee >= amount {
            return Err(Error::validation(
                "Borrow amount is too small to receive liquidity after fees",
            ));
        }

        let referrer_fees = if has_referrer && referral_fee_rate > Decimal::ZERO {
            if referral_fee_rate == Decimal::ONE {
                fee
            } else {
                (fee * referral_fee_rate).floor()
            }
        } else {
            Decimal::ZERO
        };

        Ok(Fees {
            protocol_fees: fee - referrer_fees,
            referrer_fees,
        })
    }

    pub fn calculate_borrow_fees(&self, amount: Decimal, referral_fee_bps: u16, has_referrer: bool) -> Result<Fees> {
        self.calculate_fees(amount, self.borrow_fee, FeeCalculation::Inclusive, referral_fee_bps, has_referrer)
    }

    pub fn calculate_flash_loan_fees(&self, amount: Decimal, referral_fee_bps: u16, has_referrer: bool) -> Result<Fees> {
        self.calculate_fees(amount, self.flash_loan_fee, FeeCalculation::Exclusive, referral_fee_bps, has_referrer)
    }

    // --- rates -------------------------------------------------------------

    /// Scales curve rates by how far recent slots drift from the nominal
    /// slot time.
    pub fn slot_adjustment_factor(&self) -> Decimal {
        Decimal::from(1000u64) / Decimal::from(SLOTS_PER_SECOND) / Decimal::from(self.recent_slot_duration_ms)
    }

    pub fn borrow_rate_curve(&self) -> Vec<(Decimal, Decimal)> {
        truncate_borrow_curve(&self.state.config.borrow_rate_curve.points)
    }

    pub fn utilization_ratio(&self) -> Decimal {
        value_or_zero(self.borrowed_amount, self.total_supply())
    }

    pub fn estimated_utilization_ratio(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        let (debt, supply) = self.estimated_debt_and_supply(slot, referral_fee_bps)?;
        Ok(value_or_zero(debt, supply))
    }

    /// Borrow rate at the last refreshed utilization.
    pub fn current_borrow_rate(&self) -> Result<Decimal> {
        Ok(get_borrow_rate(self.utilization_ratio(), &self.borrow_rate_curve())? * self.slot_adjustment_factor())
    }

    pub fn estimated_borrow_rate(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        let utilization = self.estimated_utilization_ratio(slot, referral_fee_bps)?;
        Ok(get_borrow_rate(utilization, &self.borrow_rate_curve())? * self.slot_adjustment_factor())
    }

    pub fn borrow_apr(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        Ok(self.estimated_borrow_rate(slot, referral_fee_bps)? + self.fixed_host_interest_rate())
    }

    pub fn supply_apr(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        let utilization = self.estimated_utilization_ratio(slot, referral_fee_bps)?;
        let borrow_rate = self.estimated_borrow_rate(slot, referral_fee_bps)?;
        Ok(utilization * borrow_rate * (Decimal::ONE - self.protocol_take_rate()))
    }

    pub fn total_supply_apy(&self, slot: u64) -> Result<Decimal> {
        calculate_apy_from_apr(self.supply_apr(slot, 0)?)
    }

    pub fn total_borrow_apy(&self, slot: u64) -> Result<Decimal> {
        calculate_apy_from_apr(self.borrow_apr(slot, 0)?)
    }

    /// Projects debt growth over `slots_elapsed` slots and splits the new
    /// interest into host, protocol and referral shares.
    pub fn compound_interest(&self, slots_elapsed: u64, referral_fee_bps: u16) -> Result<CompoundedInterest> {
        let current_borrow_rate = self.current_borrow_rate()?;
        let protocol_take_rate = self.protocol_take_rate();
        let referral_rate = Decimal::from(referral_fee_bps) / Decimal::from(ONE_HUNDRED_PCT_IN_BPS);
        let host_fixed = self.fixed_host_interest_rate();

        let compounded_interest_rate =
            approximate_compounded_interest(current_borrow_rate + host_fixed, slots_elapsed);
        let compounded_fixed_rate = approximate_compounded_interest(host_fixed, slots_elapsed);

        let previous_debt = self.borrowed_amount;
        let new_debt = previous_debt * compounded_interest_rate;
        let fixed_host_fee = previous_debt * compounded_fixed_rate - previous_debt;
        let net_new_debt = new_debt - previous_debt - fixed_host_fee;
        let variable_protocol_fee = net_new_debt * protocol_take_rate;
        let absolute_referral_fee = protocol_take_rate * referral_rate;
        let max_referral_fees = net_new_debt * absolute_referral_fee;

        Ok(CompoundedInterest {
            new_debt,
            net_new_debt,
            variable_protocol_fee,
            fixed_host_fee,
            absolute_referral_fee,
            max_referral_fees,
        })
    }

    /// `(debt, supply)` as they will be once the reserve is refreshed at `slot`.
    pub fn estimated_debt_and_supply(&self, slot: u64, referral_fee_bps: u16) -> Result<(Decimal, Decimal)> {
        let slots_elapsed = self.slots_elapsed(slot);
        if slots_elapsed == 0 {
            return Ok((self.borrowed_amount, self.total_supply()));
        }

        let interest = self.compound_interest(slots_elapsed, referral_fee_bps)?;
        let new_acc_protocol_fees = interest.variable_protocol_fee + interest.fixed_host_fee
            - interest.max_referral_fees
            + self.accumulated_protocol_fees;
        let new_pending_referral_fees = self.pending_referrer_fees + interest.max_referral_fees;

        let new_supply = self.liquidity_available_amount() + interest.new_debt
            - new_acc_protocol_fees
            - self.accumulated_referrer_fees
            - new_pending_referral_fees;

        Ok((interest.new_debt, new_supply))
    }

    pub fn estimated_accumulated_protocol_fees(&self, slot: u64, referral_fee_bps: u16) -> Result<ProtocolFeeEstimate> {
        let slots_elapsed = self.slots_elapsed(slot);
        if slots_elapsed == 0 {
            return Ok(ProtocolFeeEstimate {
                accumulated_protocol_fees: self.accumulated_protocol_fees,
                compounded_variable_protocol_fee: Decimal::ZERO,
                compounded_fixed_host_fee: Decimal::ZERO,
            });
        }

        let interest = self.compound_interest(slots_elapsed, referral_fee_bps)?;
        Ok(ProtocolFeeEstimate {
            accumulated_protocol_fees: interest.variable_protocol_fee + interest.fixed_host_fee
                - interest.max_referral_fees
                + self.accumulated_protocol_fees,
            compounded_variable_protocol_fee: interest.variable_protocol_fee,
            compounded_fixed_host_fee: interest.fixed_host_fee,
        })
    }

    /// Stale index from the last refresh.
    pub fn cumulative_borrow_rate(&self) -> Decimal {
        self.cumulative_borrow_rate
    }

    pub fn estimated_cumulative_borrow_rate(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        let rate = self.borrow_apr(slot, referral_fee_bps)?;
        let compounded = approximate_compounded_interest(rate, self.slots_elapsed(slot));
        Ok(self.cumulative_borrow_rate * compounded)
    }

    /// cTokens per unit of liquidity at the last refresh.
    pub fn collateral_exchange_rate(&self) -> Decimal {
        exchange_rate(self.state.collateral.mint_total_supply, self.total_supply())
    }

    pub fn estimated_collateral_exchange_rate(&self, slot: u64, referral_fee_bps: u16) -> Result<Decimal> {
        let supply = self.estimated_total_supply(slot, referral_fee_bps)?;
        Ok(exchange_rate(self.state.collateral.mint_total_supply, supply))
    }

    /// Liquidity amount to cToken amount at `slot`, rounded up. The withdraw-all
    /// sentinel passes through unchanged.
    pub fn liquidity_to_collateral(&self, amount: u64, slot: u64, referral_fee_bps: u16) -> Result<u64> {
        if amount == U64_MAX {
            return Ok(U64_MAX);
        }
        let rate = self.estimated_collateral_exchange_rate(slot, referral_fee_bps)?;
        let collateral = (Decimal::from(amount) * rate).ceil();
        collateral
            .to_u64()
            .ok_or_else(|| Error::arithmetic(format!("Collateral amount {} does not fit u64", collateral)))
    }

    /// cToken amount to liquidity amount at `slot`, rounded down.
    pub fn collateral_to_liquidity(&self, collateral: u64, slot: u64, referral_fee_bps: u16) -> Result<u64> {
        if collateral == U64_MAX {
            return Ok(U64_MAX);
        }
        let rate = self.estimated_collateral_exchange_rate(slot, referral_fee_bps)?;
        let liquidity = (Decimal::from(collateral) / rate).floor();
        liquidity
            .to_u64()
            .ok_or_else(|| Error::arithmetic(format!("Liquidity amount {} does not fit u64", liquidity)))
    }

    // --- simulation --------------------------------------------------------

    /// Utilization after a hypothetical action on this reserve.
    pub fn simulated_utilization_ratio(
        &self,
        amount: Decimal,
        action: ActionKind,
        slot: u64,
        referral_fee_bps: u16,
        outflow_amount: Option<Decimal>,
    ) -> Result<Decimal> {
        let (borrowed, supply) = self.estimated_debt_and_supply(slot, referral_fee_bps)?;
        let outflow = || {
            outflow_amount.ok_or_else(|| Error::validation(format!("Outflow amount is required for {}", action)))
        };

        let utilization = match action {
            ActionKind::Deposit | ActionKind::Mint => value_or_zero(borrowed, supply + amount),
            ActionKind::Withdraw | ActionKind::Redeem => value_or_zero(borrowed, supply - amount),
            ActionKind::Borrow => value_or_zero(borrowed + amount, supply),
            ActionKind::Repay => value_or_zero(borrowed - amount, supply),
            ActionKind::DepositAndBorrow => value_or_zero(borrowed + outflow()?, supply + amount),
            ActionKind::RepayAndWithdraw => value_or_zero(borrowed - amount, supply - outflow()?),
            other => {
                return Err(Error::validation(format!(
                    "Invalid action type {} for simulated utilization ratio",
                    other
                )))
            }
        };
        Ok(utilization)
    }

    pub fn simulated_borrow_rate(
        &self,
        amount: Decimal,
        action: ActionKind,
        slot: u64,
        referral_fee_bps: u16,
        outflow_amount: Option<Decimal>,
    ) -> Result<Decimal> {
        let utilization = self.simulated_utilization_ratio(amount, action, slot, referral_fee_bps, outflow_amount)?;
        Ok(get_borrow_rate(utilization, &self.borrow_rate_curve())? * self.slot_adjustment_factor())
    }

    pub fn simulated_borrow_apr(
        &self,
        amount: Decimal,
        action: ActionKind,
        slot: u64,
        referral_fee_bps: u16,
        outflow_amount: Option<Decimal>,
    ) -> Result<Decimal> {
        Ok(self.simulated_borrow_rate(amount, action, slot, referral_fee_bps, outflow_amount)?
            + self.fixed_host_interest_rate())
    }

    pub fn simulated_supply_apr(
        &self,
        amount: Decimal,
        action: ActionKind,
        slot: u64,
        referral_fee_bps: u16,
        outflow_amount: Option<Decimal>,
    ) -> Result<Decimal> {
        let utilization = self.simulated_utilization_ratio(amount, action, slot, referral_fee_bps, outflow_amount)?;
        let borrow_rate = self.simulated_borrow_rate(amount, action, slot, referral_fee_bps, outflow_amount)?;
        Ok(utilization * borrow_rate * (Decimal::ONE - self.protocol_take_rate()))
    }

    // --- caps --------------------------------------------------------------

    pub fn deposit_withdrawal_cap_capacity(&self) -> Decimal {
        Decimal::from(self.state.config.deposit_withdrawal_cap.config_capacity)
    }

    /// Current window usage; a window idle for more than a day of slots is reset.
    pub fn deposit_withdrawal_cap_current(&self, slot: u64) -> Decimal {
        if self.slots_elapsed(slot) > SLOTS_PER_DAY {
            Decimal::ZERO
        } else {
            Decimal::from(self.state.config.deposit_withdrawal_cap.current_total)
        }
    }

    pub fn debt_withdrawal_cap_capacity(&self) -> Decimal {
        Decimal::from(self.state.config.debt_withdrawal_cap.config_capacity)
    }

    pub fn debt_withdrawal_cap_current(&self, slot: u64) -> Decimal {
        if self.slots_elapsed(slot) > SLOTS_PER_DAY {
            Decimal::ZERO
        } else {
            Decimal::from(self.state.config.debt_withdrawal_cap.current_total)
        }
    }

    pub fn borrow_limit_outside_elevation_group(&self) -> Decimal {
        Decimal::from(self.state.config.borrow_limit_outside_elevation_group)
    }

    /// Debt limit other reserves may take against this collateral in group
    /// `group` (1-based).
    pub fn borrow_limit_against_collateral_in_elevation_group(&self, group: u8) -> Decimal {
        group_slot(group)
            .and_then(|i| self.state.config.borrow_limit_against_this_collateral_in_elevation_group.get(i))
            .map(|v| Decimal::from(*v))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn borrowed_amount_against_collateral_in_elevation_group(&self, group: u8) -> Decimal {
        group_slot(group)
            .and_then(|i| self.state.borrowed_amounts_against_this_reserve_in_elevation_groups.get(i))
            .map(|v| Decimal::from(*v))
            .unwrap_or(Decimal::ZERO)
    }

    pub fn utilization_limit_block_borrowing_above(&self) -> Decimal {
        Decimal::from(self.state.config.utilization_limit_block_borrowing_above_pct) / Decimal::ONE_HUNDRED
    }

    /// Max amount of this reserve's liquidity borrowable against `coll_reserve`,
    /// using the highest-LTV group the pair shares (if any).
    pub fn max_borrow_amount_with_coll_reserve(
        &self,
        market: &KaminoMarket,
        coll_reserve: &KaminoReserve,
        slot: u64,
    ) -> Decimal {
        let candidates: Vec<u8> = coll_reserve
            .elevation_groups()
            .filter(|g| self.is_in_elevation_group(*g))
            .filter(|g| market.elevation_group(*g).map_or(false, |eg| eg.debt_reserve == self.address))
            .collect();
        let group = market.highest_ltv_group(&candidates).unwrap_or(0);

        let reserve_borrow_cap_remaining = self.stats.borrow_limit - self.borrowed_amount;
        let mut max_borrow = self.liquidity_available_amount().min(reserve_borrow_cap_remaining);

        if self.debt_withdrawal_cap_capacity() > Decimal::ZERO {
            let remaining = self.debt_withdrawal_cap_capacity() - self.debt_withdrawal_cap_current(slot);
            max_borrow = max_borrow.min(remaining);
        }

        let fee_factor = self.borrow_fee / (self.borrow_fee + Decimal::ONE);
        max_borrow -= max_borrow * fee_factor;

        let utilization_limit = self.utilization_limit_block_borrowing_above();
        let utilization = self.utilization_ratio();
        if utilization_limit > Decimal::ZERO {
            if utilization > utilization_limit {
                return Decimal::ZERO;
            }
            if utilization < utilization_limit {
                max_borrow = max_borrow.min((utilization_limit - utilization) * self.total_supply());
            }
        }

        let group_limit = if group == 0 {
            self.borrow_limit_outside_elevation_group() - self.borrowed_amount_outside_elevation_group()
        } else {
            let allowed = coll_reserve.borrow_limit_against_collateral_in_elevation_group(group)
                - coll_reserve.borrowed_amount_against_collateral_in_elevation_group(group);
            positive_or_zero(allowed.min(Decimal::from(U64_MAX)))
        };

        positive_or_zero(max_borrow.min(group_limit))
    }

    pub fn borrow_caps(&self, market: &KaminoMarket) -> Result<BorrowCapsAndCounters> {
        let config = &self.state.config;
        let mut debt_against_collateral_reserve_caps = Vec::new();
        for description in market.elevation_group_descriptions()? {
            if description.debt_reserve != self.address {
                continue;
            }
            for coll_address in &description.collateral_reserves {
                let coll = market.existing_reserve(coll_address)?;
                debt_against_collateral_reserve_caps.push(DebtAgainstCollateralCap {
                    collateral_reserve: coll.address,
                    elevation_group: description.elevation_group,
                    max_debt: coll.borrow_limit_against_collateral_in_elevation_group(description.elevation_group),
                    current_value: coll
                        .borrowed_amount_against_collateral_in_elevation_group(description.elevation_group),
                });
            }
        }

        let utilization_cap = if config.utilization_limit_block_borrowing_above_pct > 0 {
            self.utilization_limit_block_borrowing_above()
        } else {
            Decimal::ONE
        };

        Ok(BorrowCapsAndCounters {
            utilization_cap,
            utilization_current_value: self.utilization_ratio(),
            net_withdrawal_cap: Decimal::from(config.debt_withdrawal_cap.config_capacity),
            net_withdrawal_current_value: Decimal::from(config.debt_withdrawal_cap.current_total),
            net_withdrawal_last_update_ts: Decimal::from(config.debt_withdrawal_cap.last_interval_start_timestamp),
            net_withdrawal_interval_duration_seconds: Decimal::from(
                config.debt_withdrawal_cap.config_interval_length_seconds,
            ),
            global_debt_cap: Decimal::from(config.borrow_limit),
            global_total_borrowed: self.borrowed_amount,
            debt_outside_emode_cap: self.borrow_limit_outside_elevation_group(),
            borrowed_outside_emode: self.borrowed_amount_outside_elevation_group(),
            debt_against_collateral_reserve_caps,
        })
    }

    /// Liquidity still borrowable from this reserve for each of `groups`,
    /// given the collateral reserves backing the loan.
    pub fn liquidity_available_for_debt_reserve_given_caps(
        &self,
        market: &KaminoMarket,
        groups: &[u8],
        collateral_reserves: &[Pubkey],
    ) -> Result<Vec<Decimal>> {
        let caps = self.borrow_caps(market)?;
        let liquidity_available = self.liquidity_available_amount();
        let liquidity_given_utilization_cap =
            self.total_supply() * (caps.utilization_cap - caps.utilization_current_value);
        let remaining_daily_cap = if caps.net_withdrawal_interval_duration_seconds.is_zero() {
            Decimal::from(U64_MAX)
        } else {
            caps.net_withdrawal_cap - caps.net_withdrawal_current_value
        };
        let remaining_global_cap = caps.global_debt_cap - caps.global_total_borrowed;
        let remaining_outside_emode_cap = caps.debt_outside_emode_cap - caps.borrowed_outside_emode;

        let available = groups
            .iter()
            .map(|group| {
                let group_cap = if *group == 0 {
                    remaining_outside_emode_cap
                } else {
                    caps.debt_against_collateral_reserve_caps
                        .iter()
                        .filter(|cap| cap.elevation_group == *group)
                        .map(|cap| {
                            if collateral_reserves.contains(&cap.collateral_reserve) {
                                cap.max_debt - cap.current_value
                            } else {
                                Decimal::from(U64_MAX)
                            }
                        })
                        .min()
                        .unwrap_or(Decimal::ZERO)
                };

                [
                    liquidity_available,
                    group_cap,
                    remaining_daily_cap,
                    remaining_global_cap,
                    liquidity_given_utilization_cap,
                ]
                .into_iter()
                .map(positive_or_zero)
                .min()
                .unwrap_or(Decimal::ZERO)
            })
            .collect();

        Ok(available)
    }
}

fn group_slot(group: u8) -> Option<usize> {
    (group as usize).checked_sub(1)
}

fn exchange_rate(mint_total_supply: u64, total_supply: Decimal) -> Decimal {
    if mint_total_supply == 0 || total_supply.is_zero() {
        Decimal::from(INITIAL_COLLATERAL_RATE)
    } else {
        Decimal::from(mint_total_supply) / total_supply
    }
}

/// Curve points as `(utilization, rate)` fractions, up to and including the
/// first point at 100% utilization. Unused trailing slots are dropped.
pub fn truncate_borrow_curve(points: &[CurvePoint]) -> Vec<(Decimal, Decimal)> {
    let scale = Decimal::from(ONE_HUNDRED_PCT_IN_BPS);
    let mut curve = Vec::with_capacity(points.len());
    for point in points {
        curve.push((
            Decimal::from(point.utilization_rate_bps) / scale,
            Decimal::from(point.borrow_rate_bps) / scale,
        ));
        if u64::from(point.utilization_rate_bps) == ONE_HUNDRED_PCT_IN_BPS {
            break;
        }
    }
    curve
}

/// Piecewise-linear borrow rate. Utilization above 1 is clamped; a point hit
/// exactly returns that point's rate with no interpolation.
pub fn get_borrow_rate(utilization: Decimal, curve: &[(Decimal, Decimal)]) -> Result<Decimal> {
    if curve.len() < 2 {
        return Err(Error::validation("Borrow rate curve must have at least 2 points"));
    }
    for pair in curve.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if x0 >= x1 || y0 > y1 {
            return Err(Error::validation(format!(
                "Borrow rate curve is not monotonic between ({}, {}) and ({}, {})",
                x0, y0, x1, y1
            )));
        }
    }

    let utilization = utilization.min(Decimal::ONE);
    for i in 1..curve.len() {
        let (point_utilization, point_rate) = curve[i];
        if point_utilization == utilization {
            return Ok(point_rate);
        }
        if utilization <= point_utilization {
            let (x0, y0) = curve[i - 1];
            return Ok(interpolate(utilization, x0, point_utilization, y0, point_rate));
        }
    }

    Err(Error::validation(format!(
        "Utilization {} is outside the borrow rate curve",
        utilization
    )))
}

fn interpolate(x: Decimal, x0: Decimal, x1: Decimal, y0: Decimal, y1: Decimal) -> Decimal {
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}

/// `(1 + rate / SLOTS_PER_YEAR)^slots`, exact up to 4 slots and a third-order
/// binomial expansion beyond. The protocol accrues with the same polynomial.
pub fn approximate_compounded_interest(rate: Decimal, elapsed_slots: u64) -> Decimal {
    let base = rate / Decimal::from(SLOTS_PER_YEAR);
    let one_plus = Decimal::ONE + base;
    match elapsed_slots {
        0 => Decimal::ONE,
        1 => one_plus,
        2 => one_plus * one_plus,
        3 => one_plus * one_plus * one_plus,
        4 => {
            let squared = one_plus * one_plus;
            squared * squared
        }
        _ => {
            let n = Decimal::from(elapsed_slots);
            let n_minus_one = n - Decimal::ONE;
            let n_minus_two = n - Decimal::TWO;
            let base_squared = base * base;
            let base_cubed = base_squared * base;

            let first_term = base * n;
            let second_term = base_squared * n * n_minus_one / Decimal::TWO;
            let third_term = base_cubed * n * n_minus_one * n_minus_two / Decimal::from(6u64);
            Decimal::ONE + first_term + second_term + third_term
        }
    }
}

/// APY of a per-slot compounded APR.
pub fn calculate_apy_from_apr(apr: Decimal) -> Result<Decimal> {
    let per_slot = Decimal::ONE + apr / Decimal::from(SLOTS_PER_YEAR);
    per_slot
        .checked_powu(SLOTS_PER_YEAR)
        .map(|compounded| compounded - Decimal::ONE)
        .ok_or_else(|| Error::arithmetic(format!("APY of {} overflows", apr)))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::math::fraction::{fraction_from_decimal, FRACTION_ONE_SCALED};
    use crate::protocol::kamino::types::KaminoAccount;

    /// A reserve with a two-segment curve: 0% → 10% at 80% utilization,
    /// → 100% at full utilization.
    pub fn reserve_state(mint: Pubkey, available: u64, borrowed: u64, slot: u64) -> Reserve {
        let mut state = Reserve::zeroed().unwrap();
        state.last_update.slot = slot;
        state.liquidity.mint_pubkey = mint;
        state.liquidity.mint_decimals = 6;
        state.liquidity.available_amount = available;
        state.liquidity.borrowed_amount_sf = u128::from(borrowed) << 60;
        state.liquidity.market_price_sf = FRACTION_ONE_SCALED;
        state.liquidity.cumulative_borrow_rate_bsf.value = [FRACTION_ONE_SCALED as u64, 0, 0, 0];
        state.collateral.mint_pubkey = Pubkey::new_unique();
        state.collateral.mint_total_supply = available + borrowed;
        state.config.status = 0;
        state.config.loan_to_value_pct = 70;
        state.config.liquidation_threshold_pct = 75;
        state.config.borrow_factor_pct = 100;
        state.config.protocol_take_rate_pct = 10;
        state.config.deposit_limit = u64::MAX;
        state.config.borrow_limit = u64::MAX;
        state.config.borrow_limit_outside_elevation_group = u64::MAX;
        state.config.deposit_withdrawal_cap.config_capacity = i64::MAX;
        let points = &mut state.config.borrow_rate_curve.points;
        points[0] = CurvePoint { utilization_rate_bps: 0, borrow_rate_bps: 0 };
        points[1] = CurvePoint { utilization_rate_bps: 8_000, borrow_rate_bps: 1_000 };
        for point in points.iter_mut().skip(2) {
            *point = CurvePoint { utilization_rate_bps: 10_000, borrow_rate_bps: 10_000 };
        }
        state
    }

    pub fn reserve(available: u64, borrowed: u64, slot: u64) -> KaminoReserve {
        let state = reserve_state(Pubkey::new_unique(), available, borrowed, slot);
        KaminoReserve::new(Pubkey::new_unique(), state, PriceQuote::new(Decimal::ONE), 500).unwrap()
    }

    pub fn with_borrow_fee(mut state: Reserve, fee: Decimal) -> Reserve {
        state.config.fees.borrow_fee_sf = fraction_from_decimal(fee).unwrap().to_bits() as u64;
        state
    }
}
