//! klend instruction encoders.
//!
//! Each encoder lays out the account list in program order and prefixes the
//! borsh-encoded arguments with the Anchor discriminator
//! `sha256("global:<name>")[..8]`. Optional accounts that are absent are
//! replaced by the program id, read-only.

use anyhow::Result;
use sha2::{Digest, Sha256};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program, sysvar,
};

use crate::protocol::kamino::types::ObligationOrderState;

pub fn get_instruction_discriminator(name: &str) -> [u8; 8] {
    let mut hasher = Sha256::new();
    hasher.update(format!("global:{}", name).as_bytes());
    let hash = hasher.finalize();
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&hash[..8]);
    discriminator
}

fn instruction_data(name: &str, args: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + args.len());
    data.extend_from_slice(&get_instruction_discriminator(name));
    data.extend_from_slice(args);
    data
}

fn optional_readonly(account: Option<Pubkey>, program_id: &Pubkey) -> AccountMeta {
    AccountMeta::new_readonly(account.unwrap_or(*program_id), false)
}

fn optional_writable(account: Option<Pubkey>, program_id: &Pubkey) -> AccountMeta {
    match account {
        Some(key) => AccountMeta::new(key, false),
        None => AccountMeta::new_readonly(*program_id, false),
    }
}

// =============================================================================
// ACCOUNT SETUP
// =============================================================================

pub struct InitObligationAccounts {
    pub obligation_owner: Pubkey,
    pub fee_payer: Pubkey,
    pub obligation: Pubkey,
    pub lending_market: Pubkey,
    pub seed1: Pubkey,
    pub seed2: Pubkey,
    pub owner_user_metadata: Pubkey,
}

pub fn init_obligation(
    accounts: &InitObligationAccounts,
    tag: u8,
    id: u8,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(accounts.obligation_owner, true),
            AccountMeta::new(accounts.fee_payer, true),
            AccountMeta::new(accounts.obligation, false),
            AccountMeta::new_readonly(accounts.lending_market, false),
            AccountMeta::new_readonly(accounts.seed1, false),
            AccountMeta::new_readonly(accounts.seed2, false),
            AccountMeta::new_readonly(accounts.owner_user_metadata, false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data("init_obligation", &[tag, id]),
    }
}

pub fn init_user_metadata(
    owner: &Pubkey,
    fee_payer: &Pubkey,
    user_metadata: &Pubkey,
    referrer_user_metadata: Option<Pubkey>,
    user_lookup_table: &Pubkey,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new(*user_metadata, false),
            optional_readonly(referrer_user_metadata, program_id),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data("init_user_metadata", user_lookup_table.as_ref()),
    }
}

pub fn init_referrer_token_state(
    payer: &Pubkey,
    lending_market: &Pubkey,
    reserve: &Pubkey,
    referrer: &Pubkey,
    referrer_token_state: &Pubkey,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new_readonly(*reserve, false),
            AccountMeta::new_readonly(*referrer, false),
            AccountMeta::new(*referrer_token_state, false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data("init_referrer_token_state", &[]),
    }
}

// =============================================================================
// REFRESH
// =============================================================================

pub struct RefreshReserveAccounts {
    pub reserve: Pubkey,
    pub lending_market: Pubkey,
    pub pyth_oracle: Option<Pubkey>,
    pub switchboard_price_oracle: Option<Pubkey>,
    pub switchboard_twap_oracle: Option<Pubkey>,
    pub scope_prices: Option<Pubkey>,
}

pub fn refresh_reserve(accounts: &RefreshReserveAccounts, program_id: &Pubkey) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(accounts.reserve, false),
            AccountMeta::new_readonly(accounts.lending_market, false),
            optional_readonly(accounts.pyth_oracle, program_id),
            optional_readonly(accounts.switchboard_price_oracle, program_id),
            optional_readonly(accounts.switchboard_twap_oracle, program_id),
            optional_readonly(accounts.scope_prices, program_id),
        ],
        data: instruction_data("refresh_reserve", &[]),
    }
}

/// `remaining` carries deposit reserves, borrow reserves and referrer token
/// states in that order.
pub fn refresh_obligation(
    lending_market: &Pubkey,
    obligation: &Pubkey,
    remaining: Vec<AccountMeta>,
    program_id: &Pubkey,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new_readonly(*lending_market, false),
        AccountMeta::new(*obligation, false),
    ];
    accounts.extend(remaining);
    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_data("refresh_obligation", &[]),
    }
}

pub fn request_elevation_group(
    owner: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    elevation_group: u8,
    remaining: Vec<AccountMeta>,
    program_id: &Pubkey,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new_readonly(*owner, true),
        AccountMeta::new(*obligation, false),
        AccountMeta::new_readonly(*lending_market, false),
    ];
    accounts.extend(remaining);
    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_data("request_elevation_group", &[elevation_group]),
    }
}

// =============================================================================
// LENDING
// =============================================================================

/// Reserve-side accounts shared by every lending instruction.
#[derive(Debug, Clone, Copy)]
pub struct ReserveAccounts {
    pub reserve: Pubkey,
    pub liquidity_mint: Pubkey,
    pub liquidity_supply: Pubkey,
    pub fee_vault: Pubkey,
    pub collateral_mint: Pubkey,
    pub collateral_supply: Pubkey,
    pub liquidity_token_program: Pubkey,
}

#[derive(Debug, Clone, Copy)]
pub struct MarketAccounts {
    pub lending_market: Pubkey,
    pub lending_market_authority: Pubkey,
}

pub fn deposit_reserve_liquidity_and_obligation_collateral(
    owner: &Pubkey,
    obligation: &Pubkey,
    market: &MarketAccounts,
    reserve: &ReserveAccounts,
    user_source_liquidity: &Pubkey,
    liquidity_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*owner, true),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(market.lending_market, false),
            AccountMeta::new_readonly(market.lending_market_authority, false),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new_readonly(reserve.liquidity_mint, false),
            AccountMeta::new(reserve.liquidity_supply, false),
            AccountMeta::new(reserve.collateral_mint, false),
            AccountMeta::new(reserve.collateral_supply, false),
            AccountMeta::new(*user_source_liquidity, false),
            AccountMeta::new_readonly(*program_id, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(reserve.liquidity_token_program, false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data(
            "deposit_reserve_liquidity_and_obligation_collateral",
            &liquidity_amount.to_le_bytes(),
        ),
    }
}

pub fn deposit_reserve_liquidity(
    owner: &Pubkey,
    market: &MarketAccounts,
    reserve: &ReserveAccounts,
    user_source_liquidity: &Pubkey,
    user_destination_collateral: &Pubkey,
    liquidity_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new_readonly(market.lending_market, false),
            AccountMeta::new_readonly(market.lending_market_authority, false),
            AccountMeta::new_readonly(reserve.liquidity_mint, false),
            AccountMeta::new(reserve.liquidity_supply, false),
            AccountMeta::new(reserve.collateral_mint, false),
            AccountMeta::new(*user_source_liquidity, false),
            AccountMeta::new(*user_destination_collateral, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(reserve.liquidity_token_program, false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data("deposit_reserve_liquidity", &liquidity_amount.to_le_bytes()),
    }
}

pub fn redeem_reserve_collateral(
    owner: &Pubkey,
    market: &MarketAccounts,
    reserve: &ReserveAccounts,
    user_source_collateral: &Pubkey,
    user_destination_liquidity: &Pubkey,
    collateral_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new_readonly(market.lending_market, false),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new_readonly(market.lending_market_authority, false),
            AccountMeta::new_readonly(reserve.liquidity_mint, false),
            AccountMeta::new(reserve.collateral_mint, false),
            AccountMeta::new(reserve.liquidity_supply, false),
            AccountMeta::new(*user_source_collateral, false),
            AccountMeta::new(*user_destination_liquidity, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(reserve.liquidity_token_program, false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data("redeem_reserve_collateral", &collateral_amount.to_le_bytes()),
    }
}

pub fn deposit_obligation_collateral(
    owner: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    reserve: &ReserveAccounts,
    user_source_collateral: &Pubkey,
    collateral_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new(reserve.collateral_supply, false),
            AccountMeta::new(*user_source_collateral, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data("deposit_obligation_collateral", &collateral_amount.to_le_bytes()),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn borrow_obligation_liquidity(
    owner: &Pubkey,
    obligation: &Pubkey,
    market: &MarketAccounts,
    reserve: &ReserveAccounts,
    user_destination_liquidity: &Pubkey,
    referrer_token_state: Option<Pubkey>,
    deposit_reserves: &[Pubkey],
    liquidity_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new_readonly(*owner, true),
        AccountMeta::new(*obligation, false),
        AccountMeta::new_readonly(market.lending_market, false),
        AccountMeta::new_readonly(market.lending_market_authority, false),
        AccountMeta::new(reserve.reserve, false),
        AccountMeta::new_readonly(reserve.liquidity_mint, false),
        AccountMeta::new(reserve.liquidity_supply, false),
        AccountMeta::new(reserve.fee_vault, false),
        AccountMeta::new(*user_destination_liquidity, false),
        optional_writable(referrer_token_state, program_id),
        AccountMeta::new_readonly(reserve.liquidity_token_program, false),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
    ];
    accounts.extend(deposit_reserves.iter().map(|r| AccountMeta::new(*r, false)));
    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_data("borrow_obligation_liquidity", &liquidity_amount.to_le_bytes()),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn repay_obligation_liquidity(
    payer: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    reserve: &ReserveAccounts,
    user_source_liquidity: &Pubkey,
    deposit_reserves: &[Pubkey],
    liquidity_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    let mut accounts = vec![
        AccountMeta::new_readonly(*payer, true),
        AccountMeta::new(*obligation, false),
        AccountMeta::new_readonly(*lending_market, false),
        AccountMeta::new(reserve.reserve, false),
        AccountMeta::new_readonly(reserve.liquidity_mint, false),
        AccountMeta::new(reserve.liquidity_supply, false),
        AccountMeta::new(*user_source_liquidity, false),
        AccountMeta::new_readonly(reserve.liquidity_token_program, false),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
    ];
    accounts.extend(deposit_reserves.iter().map(|r| AccountMeta::new(*r, false)));
    Instruction {
        program_id: *program_id,
        accounts,
        data: instruction_data("repay_obligation_liquidity", &liquidity_amount.to_le_bytes()),
    }
}

pub fn withdraw_obligation_collateral_and_redeem_reserve_collateral(
    owner: &Pubkey,
    obligation: &Pubkey,
    market: &MarketAccounts,
    reserve: &ReserveAccounts,
    user_destination_liquidity: &Pubkey,
    collateral_amount: u64,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*owner, true),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(market.lending_market, false),
            AccountMeta::new_readonly(market.lending_market_authority, false),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new_readonly(reserve.liquidity_mint, false),
            AccountMeta::new(reserve.collateral_supply, false),
            AccountMeta::new(reserve.collateral_mint, false),
            AccountMeta::new(reserve.liquidity_supply, false),
            AccountMeta::new(*user_destination_liquidity, false),
            AccountMeta::new_readonly(*program_id, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(reserve.liquidity_token_program, false),
            AccountMeta::new_readonly(sysvar::instructions::id(), false),
        ],
        data: instruction_data(
            "withdraw_obligation_collateral_and_redeem_reserve_collateral",
            &collateral_amount.to_le_bytes(),
        ),
    }
}

pub struct LiquidateAccounts {
    pub liquidator: Pubkey,
    pub obligation: Pubkey,
    pub market: MarketAccounts,
    pub repay_reserve: ReserveAccounts,
    pub withdraw_reserve: ReserveAccounts,
    pub user_source_liquidity: Pubkey,
    pub user_destination_collateral: Pubkey,
    pub user_destination_liquidity: Pubkey,
}

pub fn liquidate_obligation_and_redeem_reserve_collateral(
    accounts: &LiquidateAccounts,
    deposit_reserves: &[Pubkey],
    liquidity_amount: u64,
    min_acceptable_received_liquidity_amount: u64,
    max_allowed_ltv_override_percent: u64,
    program_id: &Pubkey,
) -> Instruction {
    let mut metas = vec![
        AccountMeta::new_readonly(accounts.liquidator, true),
        AccountMeta::new(accounts.obligation, false),
        AccountMeta::new_readonly(accounts.market.lending_market, false),
        AccountMeta::new_readonly(accounts.market.lending_market_authority, false),
        AccountMeta::new(accounts.repay_reserve.reserve, false),
        AccountMeta::new_readonly(accounts.repay_reserve.liquidity_mint, false),
        AccountMeta::new(accounts.repay_reserve.liquidity_supply, false),
        AccountMeta::new(accounts.withdraw_reserve.reserve, false),
        AccountMeta::new_readonly(accounts.withdraw_reserve.liquidity_mint, false),
        AccountMeta::new(accounts.withdraw_reserve.collateral_mint, false),
        AccountMeta::new(accounts.withdraw_reserve.collateral_supply, false),
        AccountMeta::new(accounts.withdraw_reserve.liquidity_supply, false),
        AccountMeta::new(accounts.withdraw_reserve.fee_vault, false),
        AccountMeta::new(accounts.user_source_liquidity, false),
        AccountMeta::new(accounts.user_destination_collateral, false),
        AccountMeta::new(accounts.user_destination_liquidity, false),
        AccountMeta::new_readonly(spl_token::id(), false),
        AccountMeta::new_readonly(accounts.repay_reserve.liquidity_token_program, false),
        AccountMeta::new_readonly(accounts.withdraw_reserve.liquidity_token_program, false),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
    ];
    metas.extend(deposit_reserves.iter().map(|r| AccountMeta::new(*r, false)));

    let mut args = Vec::with_capacity(24);
    args.extend_from_slice(&liquidity_amount.to_le_bytes());
    args.extend_from_slice(&min_acceptable_received_liquidity_amount.to_le_bytes());
    args.extend_from_slice(&max_allowed_ltv_override_percent.to_le_bytes());

    Instruction {
        program_id: *program_id,
        accounts: metas,
        data: instruction_data("liquidate_obligation_and_redeem_reserve_collateral", &args),
    }
}

pub fn withdraw_referrer_fees(
    referrer: &Pubkey,
    referrer_token_state: &Pubkey,
    reserve: &ReserveAccounts,
    referrer_token_account: &Pubkey,
    market: &MarketAccounts,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*referrer, true),
            AccountMeta::new(*referrer_token_state, false),
            AccountMeta::new(reserve.reserve, false),
            AccountMeta::new_readonly(reserve.liquidity_mint, false),
            AccountMeta::new(reserve.liquidity_supply, false),
            AccountMeta::new(*referrer_token_account, false),
            AccountMeta::new_readonly(market.lending_market, false),
            AccountMeta::new_readonly(market.lending_market_authority, false),
            AccountMeta::new_readonly(reserve.liquidity_token_program, false),
        ],
        data: instruction_data("withdraw_referrer_fees", &[]),
    }
}

// =============================================================================
// FARMS
// =============================================================================

pub struct ObligationFarmAccounts {
    pub obligation: Pubkey,
    pub lending_market_authority: Pubkey,
    pub reserve: Pubkey,
    pub reserve_farm_state: Pubkey,
    pub obligation_farm_user_state: Pubkey,
    pub lending_market: Pubkey,
    pub farms_program: Pubkey,
}

pub fn init_obligation_farms_for_reserve(
    payer: &Pubkey,
    owner: &Pubkey,
    accounts: &ObligationFarmAccounts,
    mode: u8,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new(*payer, true),
            AccountMeta::new_readonly(*owner, false),
            AccountMeta::new(accounts.obligation, false),
            AccountMeta::new_readonly(accounts.lending_market_authority, false),
            AccountMeta::new(accounts.reserve, false),
            AccountMeta::new(accounts.reserve_farm_state, false),
            AccountMeta::new(accounts.obligation_farm_user_state, false),
            AccountMeta::new_readonly(accounts.lending_market, false),
            AccountMeta::new_readonly(accounts.farms_program, false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data("init_obligation_farms_for_reserve", &[mode]),
    }
}

pub fn refresh_obligation_farms_for_reserve(
    crank: &Pubkey,
    accounts: &ObligationFarmAccounts,
    mode: u8,
    program_id: &Pubkey,
) -> Instruction {
    Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*crank, true),
            AccountMeta::new_readonly(accounts.obligation, false),
            AccountMeta::new_readonly(accounts.lending_market_authority, false),
            AccountMeta::new_readonly(accounts.reserve, false),
            AccountMeta::new(accounts.reserve_farm_state, false),
            AccountMeta::new(accounts.obligation_farm_user_state, false),
            AccountMeta::new_readonly(accounts.lending_market, false),
            AccountMeta::new_readonly(accounts.farms_program, false),
            AccountMeta::new_readonly(sysvar::rent::id(), false),
            AccountMeta::new_readonly(system_program::id(), false),
        ],
        data: instruction_data("refresh_obligation_farms_for_reserve", &[mode]),
    }
}

// =============================================================================
// ORDERS
// =============================================================================

pub fn set_obligation_order(
    owner: &Pubkey,
    obligation: &Pubkey,
    lending_market: &Pubkey,
    index: u8,
    order: &ObligationOrderState,
    program_id: &Pubkey,
) -> Result<Instruction> {
    let mut args = vec![index];
    args.extend_from_slice(
        &borsh::to_vec(order)
            .map_err(|e| anyhow::anyhow!("Failed to encode obligation order: {}", e))?,
    );
    Ok(Instruction {
        program_id: *program_id,
        accounts: vec![
            AccountMeta::new_readonly(*owner, true),
            AccountMeta::new(*obligation, false),
            AccountMeta::new_readonly(*lending_market, false),
        ],
        data: instruction_data("set_obligation_order", &args),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_discriminators() {
        assert_eq!(
            get_instruction_discriminator("refresh_reserve"),
            [2, 218, 138, 235, 79, 201, 25, 102]
        );
        assert_eq!(
            get_instruction_discriminator("deposit_reserve_liquidity_and_obligation_collateral"),
            [129, 199, 4, 2, 222, 39, 26, 46]
        );
    }

    #[test]
    fn test_refresh_reserve_optional_oracles_fall_back_to_program() {
        let program_id = Pubkey::new_unique();
        let pyth = Pubkey::new_unique();
        let ix = refresh_reserve(
            &RefreshReserveAccounts {
                reserve: Pubkey::new_unique(),
                lending_market: Pubkey::new_unique(),
                pyth_oracle: Some(pyth),
                switchboard_price_oracle: None,
                switchboard_twap_oracle: None,
                scope_prices: None,
            },
            &program_id,
        );
        assert_eq!(ix.accounts.len(), 6);
        assert!(ix.accounts[0].is_writable);
        assert_eq!(ix.accounts[2].pubkey, pyth);
        assert_eq!(ix.accounts[3].pubkey, program_id);
        assert!(!ix.accounts[3].is_writable);
    }

    #[test]
    fn test_borrow_appends_deposit_reserves() {
        let program_id = Pubkey::new_unique();
        let reserve = ReserveAccounts {
            reserve: Pubkey::new_unique(),
            liquidity_mint: Pubkey::new_unique(),
            liquidity_supply: Pubkey::new_unique(),
            fee_vault: Pubkey::new_unique(),
            collateral_mint: Pubkey::new_unique(),
            collateral_supply: Pubkey::new_unique(),
            liquidity_token_program: spl_token::id(),
        };
        let market = MarketAccounts {
            lending_market: Pubkey::new_unique(),
            lending_market_authority: Pubkey::new_unique(),
        };
        let deposit = Pubkey::new_unique();
        let ix = borrow_obligation_liquidity(
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &market,
            &reserve,
            &Pubkey::new_unique(),
            None,
            &[deposit],
            500,
            &program_id,
        );
        assert_eq!(ix.accounts.len(), 13);
        assert_eq!(ix.accounts[12].pubkey, deposit);
        assert_eq!(ix.accounts[9].pubkey, program_id, "Missing referrer falls back to program id");
        assert_eq!(&ix.data[8..], &500u64.to_le_bytes());
    }

    #[test]
    fn test_set_obligation_order_payload() {
        let ix = set_obligation_order(
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            &Pubkey::new_unique(),
            1,
            &ObligationOrderState::empty(),
            &Pubkey::new_unique(),
        )
        .unwrap();
        assert_eq!(ix.data[8], 1);
        assert_eq!(ix.data.len(), 8 + 1 + 128);
    }
}
