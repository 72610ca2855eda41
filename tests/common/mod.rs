//! Account fixtures shared by the integration tests. Everything is built from
//! zeroed on-chain layouts, the same way a freshly decoded account looks.

#![allow(dead_code)]

use klend_engine::blockchain::rpc_client::InMemoryLedger;
use klend_engine::core::registry::ProgramIds;
use klend_engine::core::types::PriceQuote;
use klend_engine::engine::market::KaminoMarket;
use klend_engine::engine::obligation::KaminoObligation;
use klend_engine::engine::reserve::KaminoReserve;
use klend_engine::math::fraction::FRACTION_ONE_SCALED;
use klend_engine::protocol::kamino::types::{CurvePoint, KaminoAccount, LendingMarket, Obligation, Reserve};
use klend_engine::ActionOptions;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;

pub const SLOT: u64 = 100;

/// Reserve with 6 decimals, a 70/75 LTV, borrow factor 100% and a
/// two-segment curve (0% → 10% at 80% utilization → 100% at full).
pub fn reserve_state(market: Pubkey, mint: Pubkey, name: &str, available: u64, borrowed: u64) -> Reserve {
    let mut state = Reserve::zeroed().unwrap();
    state.lending_market = market;
    state.last_update.slot = SLOT;
    state.liquidity.mint_pubkey = mint;
    state.liquidity.mint_decimals = 6;
    state.liquidity.available_amount = available;
    state.liquidity.borrowed_amount_sf = u128::from(borrowed) << 60;
    state.liquidity.market_price_sf = FRACTION_ONE_SCALED;
    state.liquidity.cumulative_borrow_rate_bsf.value = [FRACTION_ONE_SCALED as u64, 0, 0, 0];
    state.collateral.mint_pubkey = Pubkey::new_unique();
    state.collateral.mint_total_supply = available + borrowed;
    state.config.loan_to_value_pct = 70;
    state.config.liquidation_threshold_pct = 75;
    state.config.borrow_factor_pct = 100;
    state.config.protocol_take_rate_pct = 10;
    state.config.deposit_limit = u64::MAX;
    state.config.borrow_limit = u64::MAX;
    state.config.borrow_limit_outside_elevation_group = u64::MAX;
    state.config.deposit_withdrawal_cap.config_capacity = i64::MAX;
    state.config.token_info.name[..name.len()].copy_from_slice(name.as_bytes());
    let points = &mut state.config.borrow_rate_curve.points;
    points[0] = CurvePoint { utilization_rate_bps: 0, borrow_rate_bps: 0 };
    points[1] = CurvePoint { utilization_rate_bps: 8_000, borrow_rate_bps: 1_000 };
    for point in points.iter_mut().skip(2) {
        *point = CurvePoint { utilization_rate_bps: 10_000, borrow_rate_bps: 10_000 };
    }
    state
}

pub fn join_group(state: &mut Reserve, groups: &[u8]) {
    for (i, g) in groups.iter().enumerate() {
        state.config.elevation_groups[i] = *g;
        state.config.borrow_limit_against_this_collateral_in_elevation_group[(*g - 1) as usize] = u64::MAX;
    }
}

pub fn market_state() -> LendingMarket {
    LendingMarket::zeroed().unwrap()
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

pub fn reserve(address: Pubkey, state: Reserve, price: Decimal) -> KaminoReserve {
    KaminoReserve::new(address, state, PriceQuote::new(price), 500).unwrap()
}

pub fn market(address: Pubkey, state: LendingMarket, reserves: Vec<KaminoReserve>) -> KaminoMarket {
    KaminoMarket::new(address, state, reserves, ProgramIds::klend().unwrap(), 500)
}

pub fn obligation_state(market: Pubkey, owner: Pubkey, deposits: &[(Pubkey, u64)], borrows: &[(Pubkey, u64)]) -> Obligation {
    let mut state = Obligation::zeroed().unwrap();
    state.lending_market = market;
    state.owner = owner;
    for (slot, (reserve, amount)) in state.deposits.iter_mut().zip(deposits) {
        slot.deposit_reserve = *reserve;
        slot.deposited_amount = *amount;
    }
    for (slot, (reserve, amount)) in state.borrows.iter_mut().zip(borrows) {
        slot.borrow_reserve = *reserve;
        slot.borrowed_amount_sf = u128::from(*amount) << 60;
        slot.cumulative_borrow_rate_bsf.value = [FRACTION_ONE_SCALED as u64, 0, 0, 0];
    }
    state
}

pub fn obligation(market: &KaminoMarket, state: Obligation) -> KaminoObligation {
    let rates = KaminoObligation::rates_for_obligation(market, &state, SLOT, &[]).unwrap();
    KaminoObligation::new(market, Pubkey::new_unique(), state, &rates).unwrap()
}

/// Options for plans checked by label: no ATA ops, no compute budget op,
/// pinned slot.
pub fn options() -> ActionOptions {
    ActionOptions {
        include_ata_ops: false,
        extra_compute_budget: 0,
        ..ActionOptions::default()
    }
    .at_slot(SLOT)
}

pub fn ledger() -> InMemoryLedger {
    InMemoryLedger::new(SLOT)
}
