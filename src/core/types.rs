use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

/// A derived deposit or borrow position. Never mutated; recomputed wholesale
/// whenever obligation stats are refreshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub reserve_address: Pubkey,
    pub mint_address: Pubkey,
    /// `10^decimals` of the underlying mint.
    #[serde(with = "rust_decimal::serde::str")]
    pub mint_factor: Decimal,
    /// Amount in underlying token units (lamports).
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// USD value at the last refreshed price.
    #[serde(with = "rust_decimal::serde::str")]
    pub market_value_refreshed: Decimal,
}

impl Position {
    pub fn empty(reserve_address: Pubkey, mint_address: Pubkey, mint_factor: Decimal) -> Self {
        Position {
            reserve_address,
            mint_address,
            mint_factor,
            amount: Decimal::ZERO,
            market_value_refreshed: Decimal::ZERO,
        }
    }
}

/// Aggregate health of an obligation. Pure function of positions, prices,
/// rates and the active elevation group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObligationStats {
    #[serde(with = "rust_decimal::serde::str")]
    pub user_total_deposit: Decimal,
    /// Deposits whose reserve has a nonzero max LTV.
    #[serde(with = "rust_decimal::serde::str")]
    pub user_total_collateral_deposit: Decimal,
    /// Deposits whose reserve has a nonzero liquidation threshold.
    #[serde(with = "rust_decimal::serde::str")]
    pub user_total_liquidatable_deposit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub user_total_borrow: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub user_total_borrow_borrow_factor_adjusted: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_limit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_liquidation_limit: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_utilization: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub net_account_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub loan_to_value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_ltv: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub leverage: Decimal,
    /// Group a pending plan will switch to before borrowing, 0 if none.
    pub potential_elevation_group_update: u8,
    pub positions: usize,
}

/// Oracle answer for one reserve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    pub valid: bool,
}

impl PriceQuote {
    pub fn new(price: Decimal) -> Self {
        PriceQuote { price, valid: true }
    }
}

/// Reward farm side attached to a reserve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReserveFarmKind {
    Collateral,
    Debt,
}

impl ReserveFarmKind {
    pub fn discriminator(self) -> u8 {
        match self {
            ReserveFarmKind::Collateral => 0,
            ReserveFarmKind::Debt => 1,
        }
    }
}

impl std::fmt::Display for ReserveFarmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReserveFarmKind::Collateral => write!(f, "Collateral"),
            ReserveFarmKind::Debt => write!(f, "Debt"),
        }
    }
}

/// High-level intent handed to the plan builder and to rate simulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Deposit,
    Borrow,
    Withdraw,
    Repay,
    DepositAndBorrow,
    RepayAndWithdraw,
    Liquidate,
    RefreshObligation,
    RequestElevationGroup,
    WithdrawReferrerFees,
    /// Deposit reserve liquidity for cTokens, no obligation involved.
    Mint,
    /// Redeem cTokens for reserve liquidity.
    Redeem,
    /// Deposit cTokens the wallet already holds into the obligation.
    DepositCollateral,
}

impl ActionKind {
    pub fn is_two_legged(self) -> bool {
        matches!(self, ActionKind::DepositAndBorrow | ActionKind::RepayAndWithdraw)
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ActionKind::Deposit => "deposit",
            ActionKind::Borrow => "borrow",
            ActionKind::Withdraw => "withdraw",
            ActionKind::Repay => "repay",
            ActionKind::DepositAndBorrow => "depositAndBorrow",
            ActionKind::RepayAndWithdraw => "repayAndWithdraw",
            ActionKind::Liquidate => "liquidate",
            ActionKind::RefreshObligation => "refreshObligation",
            ActionKind::RequestElevationGroup => "requestElevationGroup",
            ActionKind::WithdrawReferrerFees => "withdrawReferrerFees",
            ActionKind::Mint => "mint",
            ActionKind::Redeem => "redeem",
            ActionKind::DepositCollateral => "depositCollateral",
        };
        write!(f, "{}", name)
    }
}

/// Divide, or 0 when the divisor is 0.
pub fn value_or_zero(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

pub fn positive_or_zero(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO)
}
