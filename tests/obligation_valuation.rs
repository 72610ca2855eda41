//! Valuation of obligations against a market loaded through the ledger.

mod common;

use common::*;
use klend_engine::engine::market::KaminoMarket;
use klend_engine::engine::obligation::KaminoObligation;
use klend_engine::protocol::kamino::types::KaminoAccount;
use klend_engine::protocol::oracle::ReserveCachedPrice;
use klend_engine::registry::ProgramIds;
use rust_decimal::Decimal;
use solana_sdk::pubkey::Pubkey;

struct Pair {
    market: KaminoMarket,
    coll: Pubkey,
    debt: Pubkey,
    debt_mint: Pubkey,
}

/// Collateral A (70% LTV, 75% threshold) and debt B, both at $1.
fn pair(with_group: bool) -> Pair {
    let address = Pubkey::new_unique();
    let coll = Pubkey::new_unique();
    let debt = Pubkey::new_unique();
    let debt_mint = Pubkey::new_unique();

    let mut state = market_state();
    let mut coll_state = reserve_state(address, Pubkey::new_unique(), "A", 1_000_000_000_000, 0);
    let mut debt_state = reserve_state(address, debt_mint, "B", 1_000_000_000_000, 0);
    if with_group {
        set_group(&mut state, 1, 90, 93, debt);
        join_group(&mut coll_state, &[1]);
        join_group(&mut debt_state, &[1]);
    }

    let market = market(
        address,
        state,
        vec![
            reserve(coll, coll_state, Decimal::ONE),
            reserve(debt, debt_state, Decimal::ONE),
        ],
    );
    Pair {
        market,
        coll,
        debt,
        debt_mint,
    }
}

#[test]
fn test_max_borrow_against_hundred_dollars_at_seventy_percent() {
    let p = pair(false);
    // 100 tokens of A at $1
    let state = obligation_state(p.market.address, Pubkey::new_unique(), &[(p.coll, 100_000_000)], &[]);
    let o = obligation(&p.market, state);

    assert_eq!(o.refreshed_stats.user_total_deposit, Decimal::from(100));
    assert_eq!(o.refreshed_stats.borrow_limit, Decimal::from(70));

    let max = o.max_borrow_amount(&p.market, &p.debt_mint, SLOT, false).unwrap();
    assert_eq!(max, Decimal::from(70_000_000), "70 tokens of B, in lamports");
}

#[test]
fn test_existing_debt_reduces_headroom_and_sets_ltv() {
    let p = pair(false);
    let state = obligation_state(
        p.market.address,
        Pubkey::new_unique(),
        &[(p.coll, 100_000_000)],
        &[(p.debt, 30_000_000)],
    );
    let o = obligation(&p.market, state);

    assert_eq!(o.refreshed_stats.user_total_borrow, Decimal::from(30));
    assert_eq!(o.loan_to_value(), Decimal::new(3, 1));
    assert_eq!(o.net_account_value(), Decimal::from(70));
    assert_eq!(
        o.max_borrow_amount(&p.market, &p.debt_mint, SLOT, false).unwrap(),
        Decimal::from(40_000_000)
    );
}

#[test]
fn test_elevation_group_raises_borrow_power_when_requested() {
    let p = pair(true);
    let state = obligation_state(p.market.address, Pubkey::new_unique(), &[(p.coll, 100_000_000)], &[]);
    let o = obligation(&p.market, state);

    let plain = o.max_borrow_amount(&p.market, &p.debt_mint, SLOT, false).unwrap();
    let grouped = o.max_borrow_amount(&p.market, &p.debt_mint, SLOT, true).unwrap();
    assert_eq!(plain, Decimal::from(70_000_000));
    assert_eq!(grouped, Decimal::from(90_000_000), "Group 1 lifts LTV to 90%");

    let coll = p.market.reserve(&p.coll).unwrap();
    let debt = p.market.reserve(&p.debt).unwrap();
    assert_eq!(p.market.best_group_for_switch(0, coll, debt), Some(1));
    assert_eq!(p.market.best_group_for_switch(1, coll, debt), None, "Already in the best group");
}

#[test]
fn test_interest_accrues_only_with_elapsed_slots() {
    let address = Pubkey::new_unique();
    // 50% utilization
    let state = reserve_state(address, Pubkey::new_unique(), "B", 500_000_000, 500_000_000);
    let r = reserve(Pubkey::new_unique(), state, Decimal::ONE);

    let now = r.estimated_cumulative_borrow_rate(SLOT, 0).unwrap();
    let later = r.estimated_cumulative_borrow_rate(SLOT + 1_000_000, 0).unwrap();
    assert_eq!(now, Decimal::ONE);
    assert!(later > now, "Rate index grows with time: {} <= {}", later, now);

    let (debt_now, _) = r.estimated_debt_and_supply(SLOT, 0).unwrap();
    let (debt_later, _) = r.estimated_debt_and_supply(SLOT + 1_000_000, 0).unwrap();
    assert_eq!(debt_now, Decimal::from(500_000_000));
    assert!(debt_later > debt_now);
}

#[tokio::test]
async fn test_market_and_obligation_load_from_ledger() {
    let ledger = ledger();
    let address = Pubkey::new_unique();
    let coll = Pubkey::new_unique();
    let debt = Pubkey::new_unique();
    let obligation_address = Pubkey::new_unique();
    let owner = Pubkey::new_unique();

    let coll_state = reserve_state(address, Pubkey::new_unique(), "A", 1_000_000_000_000, 0);
    let debt_state = reserve_state(address, Pubkey::new_unique(), "B", 1_000_000_000_000, 0);
    let ob_state = obligation_state(address, owner, &[(coll, 100_000_000)], &[(debt, 20_000_000)]);

    ledger.set_account(address, market_state().to_account_data().unwrap()).await;
    ledger.set_account(coll, coll_state.to_account_data().unwrap()).await;
    ledger.set_account(debt, debt_state.to_account_data().unwrap()).await;
    ledger.set_account(obligation_address, ob_state.to_account_data().unwrap()).await;

    let market = KaminoMarket::load(
        &ledger,
        &ReserveCachedPrice,
        address,
        &[coll, debt],
        ProgramIds::klend().unwrap(),
        500,
    )
    .await
    .unwrap();
    assert_eq!(market.reserves().len(), 2);
    assert_eq!(market.reserve(&coll).unwrap().symbol(), "A");

    let o = KaminoObligation::load(&ledger, &market, &obligation_address)
        .await
        .unwrap()
        .expect("Obligation is on the ledger");
    assert_eq!(o.state.owner, owner);
    assert_eq!(o.refreshed_stats.user_total_deposit, Decimal::from(100));
    assert_eq!(o.refreshed_stats.user_total_borrow, Decimal::from(20));
    assert_eq!(o.deposit_reserves(), vec![coll]);
    assert_eq!(o.borrow_reserves(), vec![debt]);

    let missing = KaminoObligation::load(&ledger, &market, &Pubkey::new_unique()).await.unwrap();
    assert!(missing.is_none());
}
