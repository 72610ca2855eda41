use anyhow::{Context, Result};
use dotenv::dotenv;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

use klend_engine::blockchain::rpc_client::{LedgerReader, RpcClient};
use klend_engine::core::config::Config;
use klend_engine::core::registry::LendingMarketAddresses;
use klend_engine::engine::action::{ActionOptions, ActionPlan};
use klend_engine::engine::market::KaminoMarket;
use klend_engine::engine::obligation::KaminoObligation;
use klend_engine::protocol::kamino::types::{KaminoAccount, Obligation};
use klend_engine::protocol::oracle::ReserveCachedPrice;

/// Read-only inspector: loads one obligation and prints its health and the
/// operations a refresh of it would need. Never signs or sends.
#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let obligation_address = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OBLIGATION").ok())
        .context("Usage: klend-inspect <obligation address> (or set OBLIGATION)")?;
    let obligation_address =
        Pubkey::from_str(&obligation_address).context("Obligation address is not a valid pubkey")?;

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate()?;
    let rpc = RpcClient::from_config(&config)?;
    let program_id = config.klend_program_id()?;

    // Reserves come from the obligation itself, so decode it raw first.
    let raw = rpc
        .get_account(&obligation_address)
        .await?
        .with_context(|| format!("Obligation {} not found", obligation_address))?;
    let state = Obligation::from_account_data(&raw).context("Failed to decode obligation")?;

    let market_address = match config.lending_market()? {
        Some(market) => market,
        None if state.lending_market != Pubkey::default() => state.lending_market,
        None => LendingMarketAddresses::main()?,
    };

    let mut reserves: Vec<Pubkey> = Vec::new();
    let used = state
        .deposits
        .iter()
        .map(|d| d.deposit_reserve)
        .chain(state.borrows.iter().map(|b| b.borrow_reserve));
    for reserve in used {
        if reserve != Pubkey::default() && !reserves.contains(&reserve) {
            reserves.push(reserve);
        }
    }

    let market = KaminoMarket::load(
        &rpc,
        &ReserveCachedPrice,
        market_address,
        &reserves,
        program_id,
        config.recent_slot_duration_ms,
    )
    .await?;

    let obligation = KaminoObligation::load(&rpc, &market, &obligation_address)
        .await?
        .with_context(|| format!("Obligation {} disappeared while loading", obligation_address))?;

    log::info!("Obligation {} (owner {})", obligation.address, obligation.state.owner);
    log::info!("  elevation group: {}", obligation.elevation_group());
    for deposit in &obligation.deposits {
        let symbol = market.reserve(&deposit.reserve_address).map_or("?", |r| r.symbol());
        log::info!(
            "  deposit {:>10} amount={} value=${}",
            symbol,
            deposit.amount.round_dp(0),
            deposit.market_value_refreshed.round_dp(2)
        );
    }
    for borrow in &obligation.borrows {
        let symbol = market.reserve(&borrow.reserve_address).map_or("?", |r| r.symbol());
        log::info!(
            "  borrow  {:>10} amount={} value=${}",
            symbol,
            borrow.amount.round_dp(0),
            borrow.market_value_refreshed.round_dp(2)
        );
    }
    let stats = &obligation.refreshed_stats;
    log::info!("  deposited value: ${}", stats.user_total_deposit.round_dp(2));
    log::info!("  borrowed value:  ${}", stats.user_total_borrow.round_dp(2));
    log::info!("  borrow limit:    ${}", stats.borrow_limit.round_dp(2));
    log::info!("  LTV:             {}", stats.loan_to_value.round_dp(4));
    log::info!("  liquidation LTV: {}", stats.liquidation_ltv.round_dp(4));
    log::info!("  net value:       ${}", stats.net_account_value.round_dp(2));

    let owner = obligation.state.owner;
    let options = ActionOptions::from_config(&config)?.at_slot(rpc.get_slot().await?);
    let plan = ActionPlan::refresh_obligation(&rpc, &market, owner, obligation, options).await?;
    log::info!("Refresh plan ({} operations):", plan.len());
    for (i, op) in plan.operations().iter().enumerate() {
        log::info!("  #{:<2} {:<14} {}", i, op.phase.to_string(), op.label);
    }

    Ok(())
}
