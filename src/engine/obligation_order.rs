//! Standing orders (stop-loss / take-profit) attached to an obligation.
//!
//! An order pairs a condition on the obligation's health with an opportunity
//! offered to an executor once the condition holds. The executor repays debt
//! and withdraws collateral worth the repaid value plus a bonus.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::core::error::{Error, Result};
use crate::core::registry::constants::ONE_HUNDRED_PCT_IN_BPS;
use crate::core::types::{value_or_zero, Position};
use crate::engine::market::KaminoMarket;
use crate::engine::obligation::KaminoObligation;
use crate::math::fraction::{fraction_from_decimal, sf_to_decimal};
use crate::protocol::kamino::types::ObligationOrderState;

/// Raw parameter of `DeleverageAllDebt`, the largest scaled value.
pub const DELEVERAGE_ALL_DEBT_PARAMETER_SF: u128 = u128::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderCondition {
    /// Met while the obligation's LTV is strictly above the threshold.
    UserLtvAbove(Decimal),
    /// Met while the obligation's LTV is strictly below the threshold.
    UserLtvBelow(Decimal),
    /// Debt price in collateral units strictly above the threshold. Single
    /// collateral, single debt only.
    DebtCollPriceRatioAbove(Decimal),
    DebtCollPriceRatioBelow(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderOpportunity {
    /// Repay up to this many lamports of the single debt.
    DeleverageSingleDebtAmount(Decimal),
    /// Repay the whole highest-valued debt.
    DeleverageAllDebt,
}

/// How far past its threshold a condition is, in `[0, 1]`: 0 exactly at the
/// threshold, 1 at the liquidation point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConditionHit {
    pub normalized_distance_from_threshold: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenAmount {
    pub mint: Pubkey,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AvailableOrderExecution {
    pub repay: TokenAmount,
    /// Includes the bonus; the protocol's execution fee is not deducted.
    pub withdraw: TokenAmount,
    pub repay_reserve: Pubkey,
    pub withdraw_reserve: Pubkey,
    pub bonus_rate: Decimal,
}

impl OrderCondition {
    pub fn type_id(&self) -> u8 {
        match self {
            OrderCondition::UserLtvAbove(_) => 1,
            OrderCondition::UserLtvBelow(_) => 2,
            OrderCondition::DebtCollPriceRatioAbove(_) => 3,
            OrderCondition::DebtCollPriceRatioBelow(_) => 4,
        }
    }

    fn from_type_id(type_id: u8, threshold: Decimal) -> Result<Self> {
        match type_id {
            1 => Ok(OrderCondition::UserLtvAbove(threshold)),
            2 => Ok(OrderCondition::UserLtvBelow(threshold)),
            3 => Ok(OrderCondition::DebtCollPriceRatioAbove(threshold)),
            4 => Ok(OrderCondition::DebtCollPriceRatioBelow(threshold)),
            other => Err(Error::validation(format!("Unknown condition type {}", other))),
        }
    }

    pub fn threshold(&self) -> Decimal {
        match self {
            OrderCondition::UserLtvAbove(t)
            | OrderCondition::UserLtvBelow(t)
            | OrderCondition::DebtCollPriceRatioAbove(t)
            | OrderCondition::DebtCollPriceRatioBelow(t) => *t,
        }
    }

    /// `None` when the condition does not hold. LTVs come from the same
    /// formulas the program uses, not from the refreshed stats.
    pub fn evaluate(&self, obligation: &KaminoObligation) -> Result<Option<ConditionHit>> {
        match *self {
            OrderCondition::UserLtvAbove(threshold) => Ok(evaluate_stop_loss(
                obligation.loan_to_value(),
                threshold,
                obligation.liquidation_ltv(),
            )),
            OrderCondition::UserLtvBelow(threshold) => Ok(evaluate_take_profit(obligation.loan_to_value(), threshold)),
            OrderCondition::DebtCollPriceRatioAbove(threshold) => {
                let ratio = debt_coll_price_ratio(obligation)?;
                // Single pair: the ratio scales with LTV, so the liquidation
                // ratio is the current one scaled by unhealthy / current debt.
                let stats = &obligation.refreshed_stats;
                let liquidation_ratio = value_or_zero(
                    ratio * stats.borrow_liquidation_limit,
                    stats.user_total_borrow_borrow_factor_adjusted,
                );
                Ok(evaluate_stop_loss(ratio, threshold, liquidation_ratio))
            }
            OrderCondition::DebtCollPriceRatioBelow(threshold) => {
                Ok(evaluate_take_profit(debt_coll_price_ratio(obligation)?, threshold))
            }
        }
    }
}

impl OrderOpportunity {
    pub fn type_id(&self) -> u8 {
        match self {
            OrderOpportunity::DeleverageSingleDebtAmount(_) => 0,
            OrderOpportunity::DeleverageAllDebt => 1,
        }
    }

    fn from_state(type_id: u8, parameter_sf: u128) -> Result<Self> {
        match type_id {
            0 => Ok(OrderOpportunity::DeleverageSingleDebtAmount(sf_to_decimal(parameter_sf)?)),
            1 if parameter_sf == DELEVERAGE_ALL_DEBT_PARAMETER_SF => Ok(OrderOpportunity::DeleverageAllDebt),
            1 => Err(Error::validation(format!(
                "Invalid DeleverageAllDebt parameter {}, must be the maximum fraction",
                parameter_sf
            ))),
            other => Err(Error::validation(format!("Unknown opportunity type {}", other))),
        }
    }

    pub fn parameter_sf(&self) -> Result<u128> {
        match self {
            OrderOpportunity::DeleverageSingleDebtAmount(amount) => Ok(fraction_from_decimal(*amount)?.to_bits()),
            OrderOpportunity::DeleverageAllDebt => Ok(DELEVERAGE_ALL_DEBT_PARAMETER_SF),
        }
    }

    /// The highest-valued amount this opportunity lets an executor repay.
    pub fn max_repay(&self, borrows: &[Position]) -> Result<TokenAmount> {
        match self {
            OrderOpportunity::DeleverageSingleDebtAmount(amount) => {
                let borrow = single_element(borrows, "borrow")?;
                Ok(TokenAmount {
                    mint: borrow.mint_address,
                    amount: borrow.amount.min(*amount),
                })
            }
            OrderOpportunity::DeleverageAllDebt => {
                let borrow = borrows
                    .iter()
                    .max_by(|a, b| a.market_value_refreshed.cmp(&b.market_value_refreshed))
                    .ok_or_else(|| Error::validation("Opportunity type not valid on obligation with no borrows"))?;
                Ok(TokenAmount {
                    mint: borrow.mint_address,
                    amount: borrow.amount,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObligationOrder {
    pub condition: OrderCondition,
    pub opportunity: OrderOpportunity,
    /// Bonus paid when the threshold is barely crossed, e.g. `0.01`.
    pub min_execution_bonus_rate: Decimal,
    /// Bonus paid at the liquidation point.
    pub max_execution_bonus_rate: Decimal,
}

impl ObligationOrder {
    /// `max_execution_bonus_rate` defaults to the min rate.
    pub fn new(
        condition: OrderCondition,
        opportunity: OrderOpportunity,
        min_execution_bonus_rate: Decimal,
        max_execution_bonus_rate: Option<Decimal>,
    ) -> Self {
        ObligationOrder {
            condition,
            opportunity,
            min_execution_bonus_rate,
            max_execution_bonus_rate: max_execution_bonus_rate.unwrap_or(min_execution_bonus_rate),
        }
    }

    /// `None` for an empty slot (condition type 0).
    pub fn from_state(state: &ObligationOrderState) -> Result<Option<Self>> {
        if state.condition_type == 0 {
            return Ok(None);
        }
        let condition = OrderCondition::from_type_id(state.condition_type, sf_to_decimal(state.condition_threshold_sf)?)?;
        let opportunity = OrderOpportunity::from_state(state.opportunity_type, state.opportunity_parameter_sf)?;
        Ok(Some(ObligationOrder {
            condition,
            opportunity,
            min_execution_bonus_rate: Decimal::from(state.min_execution_bonus_bps) / Decimal::from(ONE_HUNDRED_PCT_IN_BPS),
            max_execution_bonus_rate: Decimal::from(state.max_execution_bonus_bps) / Decimal::from(ONE_HUNDRED_PCT_IN_BPS),
        }))
    }

    pub fn to_state(&self) -> Result<ObligationOrderState> {
        Ok(ObligationOrderState {
            condition_type: self.condition.type_id(),
            condition_threshold_sf: fraction_from_decimal(self.condition.threshold())?.to_bits(),
            opportunity_type: self.opportunity.type_id(),
            opportunity_parameter_sf: self.opportunity.parameter_sf()?,
            min_execution_bonus_bps: rate_to_bps(self.min_execution_bonus_rate)?,
            max_execution_bonus_bps: rate_to_bps(self.max_execution_bonus_rate)?,
            ..ObligationOrderState::empty()
        })
    }

    pub fn at_index(self, index: u8) -> ObligationOrderAtIndex {
        ObligationOrderAtIndex {
            index,
            order: Some(self),
        }
    }

    /// The largest execution currently offered, or `None` while the condition
    /// does not hold.
    pub fn find_max_available_execution(
        &self,
        market: &KaminoMarket,
        obligation: &KaminoObligation,
    ) -> Result<Option<AvailableOrderExecution>> {
        let Some(hit) = self.condition.evaluate(obligation)? else {
            return Ok(None);
        };

        let max_repay = self.opportunity.max_repay(&obligation.borrows)?;
        let repay_borrow = obligation
            .borrow_by_mint(&max_repay.mint)
            .ok_or_else(|| Error::state(format!("No borrow of mint {}", max_repay.mint)))?;
        let max_repay_value = token_amount_to_value(&max_repay, repay_borrow);

        let bonus_rate = self.execution_bonus_rate(&hit, obligation);
        let bonus_factor = Decimal::ONE + bonus_rate;
        let max_withdraw_value = max_repay_value * bonus_factor;

        // Only the lowest-liquidation-LTV deposit may be taken; zero-LTV
        // deposits are never liquidatable.
        let mut candidates: Vec<(Decimal, &Position)> = Vec::new();
        for deposit in &obligation.deposits {
            let ltv = obligation.ltv_for_reserve_address(market, &deposit.reserve_address)?;
            if ltv.liquidation_ltv > Decimal::ZERO {
                candidates.push((ltv.liquidation_ltv, deposit));
            }
        }
        let min_liquidation_ltv = candidates
            .iter()
            .map(|(ltv, _)| *ltv)
            .min()
            .ok_or_else(|| Error::validation("Obligation has no liquidatable deposit"))?;

        let (withdraw_value, withdraw_deposit) = candidates
            .into_iter()
            .filter(|(ltv, _)| *ltv == min_liquidation_ltv)
            .map(|(_, deposit)| (deposit.market_value_refreshed.min(max_withdraw_value), deposit))
            .min_by(|(left_value, left), (right_value, right)| {
                right_value
                    .cmp(left_value)
                    .then_with(|| left.mint_address.to_string().cmp(&right.mint_address.to_string()))
            })
            .ok_or_else(|| Error::validation("Obligation has no liquidatable deposit"))?;

        let repay_value = withdraw_value / bonus_factor;
        Ok(Some(AvailableOrderExecution {
            repay: value_to_token_amount(repay_value, repay_borrow),
            withdraw: value_to_token_amount(withdraw_value, withdraw_deposit),
            repay_reserve: repay_borrow.reserve_address,
            withdraw_reserve: withdraw_deposit.reserve_address,
            bonus_rate,
        }))
    }

    /// Interpolated between the configured min and max bonus, then capped at
    /// `1 - no_bf_ltv` so execution always improves LTV.
    fn execution_bonus_rate(&self, hit: &ConditionHit, obligation: &KaminoObligation) -> Decimal {
        let distance = hit.normalized_distance_from_threshold.clamp(Decimal::ZERO, Decimal::ONE);
        let interpolated = self.min_execution_bonus_rate
            + distance * (self.max_execution_bonus_rate - self.min_execution_bonus_rate);
        let diff_to_bad_debt = Decimal::ONE - obligation.no_bf_loan_to_value();
        interpolated.min(diff_to_bad_debt)
    }
}

/// One slot of an obligation's order array; `None` cancels the slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObligationOrderAtIndex {
    pub index: u8,
    pub order: Option<ObligationOrder>,
}

impl ObligationOrderAtIndex {
    pub fn empty(index: u8) -> Self {
        ObligationOrderAtIndex { index, order: None }
    }

    pub fn order_state(&self) -> Result<ObligationOrderState> {
        match &self.order {
            Some(order) => order.to_state(),
            None => Ok(ObligationOrderState::empty()),
        }
    }
}

fn rate_to_bps(rate: Decimal) -> Result<u16> {
    (rate * Decimal::from(ONE_HUNDRED_PCT_IN_BPS))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u16()
        .ok_or_else(|| Error::arithmetic(format!("Bonus rate {} out of bps range", rate)))
}

fn evaluate_stop_loss(current: Decimal, threshold: Decimal, liquidation_threshold: Decimal) -> Option<ConditionHit> {
    if current <= threshold {
        return None;
    }
    let normalized_distance_from_threshold = if threshold >= liquidation_threshold {
        // Past liquidation; treat as maximum distance.
        Decimal::ONE
    } else {
        (current - threshold) / (liquidation_threshold - threshold)
    };
    Some(ConditionHit {
        normalized_distance_from_threshold,
    })
}

fn evaluate_take_profit(current: Decimal, threshold: Decimal) -> Option<ConditionHit> {
    if current >= threshold {
        return None;
    }
    Some(ConditionHit {
        normalized_distance_from_threshold: (threshold - current) / threshold,
    })
}

fn debt_coll_price_ratio(obligation: &KaminoObligation) -> Result<Decimal> {
    let borrow = single_element(&obligation.borrows, "borrow")?;
    let deposit = single_element(&obligation.deposits, "deposit")?;
    Ok(value_or_zero(token_price(borrow), token_price(deposit)))
}

fn token_price(position: &Position) -> Decimal {
    value_or_zero(position.market_value_refreshed * position.mint_factor, position.amount)
}

fn token_amount_to_value(amount: &TokenAmount, position: &Position) -> Decimal {
    value_or_zero(amount.amount * position.market_value_refreshed, position.amount)
}

fn value_to_token_amount(value: Decimal, position: &Position) -> TokenAmount {
    TokenAmount {
        mint: position.mint_address,
        amount: value_or_zero(value * position.amount, position.market_value_refreshed)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero),
    }
}

fn single_element<'a>(positions: &'a [Position], what: &str) -> Result<&'a Position> {
    match positions {
        [single] => Ok(single),
        _ => Err(Error::validation(format!(
            "Expected exactly one {}, found {}",
            what,
            positions.len()
        ))),
    }
}
