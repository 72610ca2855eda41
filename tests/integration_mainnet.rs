//! Mainnet checks against live accounts.
//!
//! All tests are ignored by default and need network access:
//!   cargo test --test integration_mainnet -- --ignored --nocapture
//!
//! Environment:
//!   - RPC_HTTP_URL: RPC endpoint (defaults to mainnet)
//!   - TEST_OBLIGATION_ADDRESS: an obligation on the main market

use anyhow::{Context, Result};
use klend_engine::blockchain::rpc_client::{LedgerReader, RpcClient};
use klend_engine::engine::market::KaminoMarket;
use klend_engine::engine::obligation::KaminoObligation;
use klend_engine::protocol::kamino::types::{KaminoAccount, Obligation};
use klend_engine::protocol::oracle::ReserveCachedPrice;
use klend_engine::registry::ProgramIds;
use klend_engine::{ActionOptions, ActionPlan};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::time::Duration;

fn rpc_client() -> RpcClient {
    let url = std::env::var("RPC_HTTP_URL").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());
    RpcClient::new(url, Duration::from_secs(30)).expect("Failed to create RPC client")
}

fn pubkey_from_env(var_name: &str) -> Result<Pubkey> {
    let value = std::env::var(var_name).with_context(|| format!("{} environment variable must be set", var_name))?;
    Pubkey::from_str(&value).with_context(|| format!("Invalid {} format: {}", var_name, value))
}

async fn load(rpc: &RpcClient, address: &Pubkey) -> Result<(KaminoMarket, KaminoObligation)> {
    let data = rpc.get_account(address).await?.context("Obligation not found")?;
    let state = Obligation::from_account_data(&data)?;
    let mut reserves: Vec<Pubkey> = state
        .deposits
        .iter()
        .map(|d| d.deposit_reserve)
        .chain(state.borrows.iter().map(|b| b.borrow_reserve))
        .filter(|r| *r != Pubkey::default())
        .collect();
    reserves.sort();
    reserves.dedup();

    let market = KaminoMarket::load(
        rpc,
        &ReserveCachedPrice,
        state.lending_market,
        &reserves,
        ProgramIds::klend()?,
        450,
    )
    .await?;
    let obligation = KaminoObligation::load(rpc, &market, address)
        .await?
        .context("Obligation disappeared")?;
    Ok((market, obligation))
}

#[tokio::test]
#[ignore]
async fn test_real_obligation_valuation() {
    let address = match pubkey_from_env("TEST_OBLIGATION_ADDRESS") {
        Ok(address) => address,
        Err(e) => {
            println!("Skipping: {}", e);
            return;
        }
    };
    let rpc = rpc_client();
    let (_, obligation) = load(&rpc, &address).await.expect("Failed to load obligation");

    let stats = &obligation.refreshed_stats;
    println!("deposited ${} borrowed ${} LTV {}", stats.user_total_deposit, stats.user_total_borrow, stats.loan_to_value);
    assert!(stats.user_total_deposit >= stats.user_total_collateral_deposit);
    assert!(
        stats.borrow_liquidation_limit >= stats.borrow_limit,
        "Liquidation limit {} below borrow limit {}",
        stats.borrow_liquidation_limit,
        stats.borrow_limit
    );
}

#[tokio::test]
#[ignore]
async fn test_real_obligation_refresh_plan() {
    let address = match pubkey_from_env("TEST_OBLIGATION_ADDRESS") {
        Ok(address) => address,
        Err(e) => {
            println!("Skipping: {}", e);
            return;
        }
    };
    let rpc = rpc_client();
    let (market, obligation) = load(&rpc, &address).await.expect("Failed to load obligation");
    let owner = obligation.state.owner;
    let positions = obligation.number_of_positions();

    let slot = rpc.get_slot().await.expect("Failed to read slot");
    let plan = ActionPlan::refresh_obligation(&rpc, &market, owner, obligation, ActionOptions::default().at_slot(slot))
        .await
        .expect("Failed to build refresh plan");

    for op in plan.operations() {
        println!("{:<12} {}", op.phase.to_string(), op.label);
    }
    assert_eq!(plan.labels().last(), Some(&"refreshObligation"));
    assert!(plan.len() >= positions + 1);
}
