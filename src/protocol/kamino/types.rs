// Kamino Lend (klend) account layouts
// Program ID (mainnet): KLend2g3cP87fffoy8q1mQqGKjrxjC8boSyAYavgmjD

use anyhow::Result;
use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};
use solana_sdk::pubkey::Pubkey;

use crate::math::fraction::BigFraction;

/// Anchor discriminator size
pub const DISCRIMINATOR_SIZE: usize = 8;

/// Upper bound on any klend account, used to build blank layouts.
const MAX_ACCOUNT_SIZE: usize = 10_240;

// =============================================================================
// BASIC TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct LastUpdate {
    pub slot: u64,
    pub stale: u8,
    pub price_status: u8,
    pub placeholder: [u8; 6],
}

/// 256-bit fraction as stored on chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BigFractionBytes {
    pub value: [u64; 4],
    pub padding: [u64; 2],
}

impl From<BigFractionBytes> for BigFraction {
    fn from(bytes: BigFractionBytes) -> Self {
        BigFraction::from_limbs(bytes.value)
    }
}

impl From<BigFraction> for BigFractionBytes {
    fn from(value: BigFraction) -> Self {
        BigFractionBytes {
            value: value.to_limbs(),
            padding: [0; 2],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CurvePoint {
    pub utilization_rate_bps: u32,
    pub borrow_rate_bps: u32,
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct BorrowRateCurve {
    pub points: [CurvePoint; 11],
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct PriceHeuristic {
    pub lower: u64,
    pub upper: u64,
    pub exp: u64,
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ScopeConfiguration {
    pub price_feed: Pubkey,
    pub price_chain: [u16; 4],
    pub twap_chain: [u16; 4],
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct SwitchboardConfiguration {
    pub price_aggregator: Pubkey,
    pub twap_aggregator: Pubkey,
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct PythConfiguration {
    pub price: Pubkey,
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct TokenInfo {
    pub name: [u8; 32],
    pub heuristic: PriceHeuristic,
    pub max_twap_divergence_bps: u64,
    pub max_age_price_seconds: u64,
    pub max_age_twap_seconds: u64,
    pub scope_configuration: ScopeConfiguration,
    pub switchboard_configuration: SwitchboardConfiguration,
    pub pyth_configuration: PythConfiguration,
    pub block_price_usage: u8,
    pub reserved: [u8; 7],
    pub padding: [u64; 19],
}

/// Time-windowed net outflow limit. A capacity of 0 disables the cap.
#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct WithdrawalCaps {
    pub config_capacity: i64,
    pub current_total: i64,
    pub last_interval_start_timestamp: u64,
    pub config_interval_length_seconds: u64,
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ReserveFees {
    pub borrow_fee_sf: u64,
    pub flash_loan_fee_sf: u64,
    pub padding: [u8; 8],
}

/// Risk tier stored on the lending market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ElevationGroup {
    pub max_liquidation_bonus_bps: u16,
    pub id: u8,
    pub ltv_pct: u8,
    pub liquidation_threshold_pct: u8,
    pub allow_new_loans: u8,
    pub max_reserves_as_collateral: u8,
    pub padding0: u8,
    pub debt_reserve: Pubkey,
    pub padding1: [u64; 4],
}

// =============================================================================
// RESERVE NESTED STRUCTS
// =============================================================================

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ReserveLiquidity {
    pub mint_pubkey: Pubkey,
    pub supply_vault: Pubkey,
    pub fee_vault: Pubkey,
    pub available_amount: u64,
    pub borrowed_amount_sf: u128,
    pub market_price_sf: u128,
    pub market_price_last_updated_ts: u64,
    pub mint_decimals: u64,
    pub deposit_limit_crossed_timestamp: u64,
    pub borrow_limit_crossed_timestamp: u64,
    pub cumulative_borrow_rate_bsf: BigFractionBytes,
    pub accumulated_protocol_fees_sf: u128,
    pub accumulated_referrer_fees_sf: u128,
    pub pending_referrer_fees_sf: u128,
    pub absolute_referral_rate_sf: u128,
    pub token_program: Pubkey,
    pub padding2: [u64; 51],
    pub padding3: [u128; 32],
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ReserveCollateral {
    pub mint_pubkey: Pubkey,
    pub mint_total_supply: u64,
    pub supply_vault: Pubkey,
    pub padding1: [u128; 32],
    pub padding2: [u128; 32],
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ReserveConfig {
    pub status: u8,
    pub asset_tier: u8,
    pub host_fixed_interest_rate_bps: u16,
    pub reserved2: [u8; 9],
    pub protocol_order_execution_fee_pct: u8,
    pub protocol_take_rate_pct: u8,
    pub protocol_liquidation_fee_pct: u8,
    pub loan_to_value_pct: u8,
    pub liquidation_threshold_pct: u8,
    pub min_liquidation_bonus_bps: u16,
    pub max_liquidation_bonus_bps: u16,
    pub bad_debt_liquidation_bonus_bps: u16,
    pub deleveraging_margin_call_period_secs: u64,
    pub deleveraging_threshold_decrease_bps_per_day: u64,
    pub fees: ReserveFees,
    pub borrow_rate_curve: BorrowRateCurve,
    pub borrow_factor_pct: u64,
    pub deposit_limit: u64,
    pub borrow_limit: u64,
    pub token_info: TokenInfo,
    pub deposit_withdrawal_cap: WithdrawalCaps,
    pub debt_withdrawal_cap: WithdrawalCaps,
    pub elevation_groups: [u8; 20],
    pub disable_usage_as_coll_outside_emode: u8,
    pub utilization_limit_block_borrowing_above_pct: u8,
    pub autodeleverage_enabled: u8,
    pub reserved1: [u8; 1],
    pub borrow_limit_outside_elevation_group: u64,
    pub borrow_limit_against_this_collateral_in_elevation_group: [u64; 32],
    pub deleveraging_bonus_increase_bps_per_day: u64,
}

// =============================================================================
// OBLIGATION NESTED STRUCTS
// =============================================================================

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ObligationCollateral {
    pub deposit_reserve: Pubkey,
    /// In collateral (cToken) units.
    pub deposited_amount: u64,
    pub market_value_sf: u128,
    pub borrowed_amount_against_this_collateral_in_elevation_group: u64,
    pub padding: [u64; 9],
}

#[derive(Debug, Clone, Copy, BorshDeserialize, BorshSerialize)]
pub struct ObligationLiquidity {
    pub borrow_reserve: Pubkey,
    pub cumulative_borrow_rate_bsf: BigFractionBytes,
    pub padding: u64,
    pub borrowed_amount_sf: u128,
    pub market_value_sf: u128,
    pub borrow_factor_adjusted_market_value_sf: u128,
    pub borrowed_amount_outside_elevation_groups: u64,
    pub padding2: [u64; 7],
}

/// Raw standing order slot. `condition_type == 0` marks an empty slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ObligationOrderState {
    pub condition_threshold_sf: u128,
    pub opportunity_parameter_sf: u128,
    pub min_execution_bonus_bps: u16,
    pub max_execution_bonus_bps: u16,
    pub condition_type: u8,
    pub opportunity_type: u8,
    pub padding1: [u8; 10],
    pub padding2: [u128; 5],
}

impl ObligationOrderState {
    pub fn empty() -> Self {
        ObligationOrderState {
            condition_threshold_sf: 0,
            opportunity_parameter_sf: 0,
            min_execution_bonus_bps: 0,
            max_execution_bonus_bps: 0,
            condition_type: 0,
            opportunity_type: 0,
            padding1: [0; 10],
            padding2: [0; 5],
        }
    }
}

// =============================================================================
// MAIN ACCOUNT STRUCTS
// =============================================================================

#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct LendingMarket {
    pub version: u64,
    pub bump_seed: u64,
    pub lending_market_owner: Pubkey,
    pub lending_market_owner_cached: Pubkey,
    pub quote_currency: [u8; 32],
    pub referral_fee_bps: u16,
    pub emergency_mode: u8,
    pub autodeleverage_enabled: u8,
    pub borrow_disabled: u8,
    pub price_refresh_trigger_to_max_age_pct: u8,
    pub liquidation_max_debt_close_factor_pct: u8,
    pub insolvency_risk_unhealthy_ltv_pct: u8,
    pub min_full_liquidation_value_threshold: u64,
    pub max_liquidatable_debt_market_value_at_once: u64,
    pub reserved0: [u8; 8],
    pub global_allowed_borrow_value: u64,
    pub risk_council: Pubkey,
    pub reserved1: [u8; 8],
    pub elevation_groups: [ElevationGroup; 32],
    pub elevation_group_padding: [u64; 90],
    pub min_net_value_in_obligation_sf: u128,
    pub min_value_skip_liquidation_ltv_checks: u64,
    pub name: [u8; 32],
    pub min_value_skip_liquidation_bf_checks: u64,
    pub individual_autodeleverage_margin_call_period_secs: u64,
    pub min_initial_deposit_amount: u64,
    pub obligation_order_execution_enabled: u8,
    pub immutable: u8,
    pub obligation_order_creation_enabled: u8,
    pub padding2: [u8; 5],
    pub padding1: [u64; 169],
}

#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct Reserve {
    pub version: u64,
    pub last_update: LastUpdate,
    pub lending_market: Pubkey,
    pub farm_collateral: Pubkey,
    pub farm_debt: Pubkey,
    pub liquidity: ReserveLiquidity,
    pub reserve_liquidity_padding: [u64; 150],
    pub collateral: ReserveCollateral,
    pub reserve_collateral_padding: [u64; 150],
    pub config: ReserveConfig,
    pub config_padding: [u64; 116],
    pub borrowed_amount_outside_elevation_group: u64,
    pub borrowed_amounts_against_this_reserve_in_elevation_groups: [u64; 32],
    pub padding: [u64; 207],
}

#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct Obligation {
    pub tag: u64,
    pub last_update: LastUpdate,
    pub lending_market: Pubkey,
    pub owner: Pubkey,
    pub deposits: [ObligationCollateral; 8],
    pub lowest_reserve_deposit_liquidation_ltv: u64,
    pub deposited_value_sf: u128,
    pub borrows: [ObligationLiquidity; 5],
    pub borrow_factor_adjusted_debt_value_sf: u128,
    pub borrowed_assets_market_value_sf: u128,
    pub allowed_borrow_value_sf: u128,
    pub unhealthy_borrow_value_sf: u128,
    pub deposits_asset_tiers: [u8; 8],
    pub borrows_asset_tiers: [u8; 5],
    pub elevation_group: u8,
    pub num_of_obsolete_deposit_reserves: u8,
    pub has_debt: u8,
    pub referrer: Pubkey,
    pub borrowing_disabled: u8,
    pub autodeleverage_target_ltv_pct: u8,
    pub lowest_reserve_deposit_max_ltv_pct: u8,
    pub num_of_obsolete_borrow_reserves: u8,
    pub reserved: [u8; 4],
    pub highest_borrow_factor_pct: u64,
    pub autodeleverage_margin_call_started_timestamp: u64,
    pub orders: [ObligationOrderState; 2],
    pub padding3: [u64; 93],
}

/// Per-owner profile account holding the referrer and lookup table.
#[derive(Debug, Clone, BorshDeserialize, BorshSerialize)]
pub struct UserMetadata {
    pub referrer: Pubkey,
    pub bump: u64,
    pub user_lookup_table: Pubkey,
    pub owner: Pubkey,
    pub padding1: [u64; 51],
    pub padding2: [u64; 64],
}

// =============================================================================
// ACCOUNT TYPE DETECTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KaminoAccountType {
    Obligation,
    Reserve,
    LendingMarket,
    UserMetadata,
    Unknown,
}

/// First 8 bytes of sha256("account:<AccountName>")
pub mod discriminators {
    pub const OBLIGATION: [u8; 8] = [168, 206, 141, 106, 88, 76, 172, 167];
    pub const RESERVE: [u8; 8] = [43, 242, 204, 202, 26, 247, 59, 127];
    pub const LENDING_MARKET: [u8; 8] = [246, 114, 50, 98, 72, 157, 22, 138];
}

pub fn account_discriminator(name: &str) -> [u8; 8] {
    let hash = Sha256::digest(format!("account:{}", name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

pub fn detect_account_type(data: &[u8]) -> KaminoAccountType {
    if data.len() < DISCRIMINATOR_SIZE {
        return KaminoAccountType::Unknown;
    }

    let disc = &data[0..8];

    if disc == discriminators::OBLIGATION {
        KaminoAccountType::Obligation
    } else if disc == discriminators::RESERVE {
        KaminoAccountType::Reserve
    } else if disc == discriminators::LENDING_MARKET {
        KaminoAccountType::LendingMarket
    } else if disc == account_discriminator("UserMetadata") {
        KaminoAccountType::UserMetadata
    } else {
        KaminoAccountType::Unknown
    }
}

/// Anchor account codec: discriminator check, then borsh body.
pub trait KaminoAccount: BorshDeserialize + BorshSerialize + Sized {
    const NAME: &'static str;

    fn discriminator() -> [u8; 8] {
        account_discriminator(Self::NAME)
    }

    fn from_account_data(data: &[u8]) -> Result<Self> {
        if data.len() < DISCRIMINATOR_SIZE {
            return Err(anyhow::anyhow!("Data too short for Kamino {}", Self::NAME));
        }

        if data[0..8] != Self::discriminator() {
            return Err(anyhow::anyhow!(
                "Invalid Kamino {} discriminator: {:?}",
                Self::NAME,
                &data[0..8]
            ));
        }

        let mut body = &data[DISCRIMINATOR_SIZE..];
        Self::deserialize(&mut body)
            .map_err(|e| anyhow::anyhow!("Failed to parse Kamino {}: {}", Self::NAME, e))
    }

    fn to_account_data(&self) -> Result<Vec<u8>> {
        let mut data = Self::discriminator().to_vec();
        let body = borsh::to_vec(self)
            .map_err(|e| anyhow::anyhow!("Failed to encode Kamino {}: {}", Self::NAME, e))?;
        data.extend_from_slice(&body);
        Ok(data)
    }

    /// All-zero layout, the starting point for fixtures and new accounts.
    fn zeroed() -> Result<Self> {
        let buf = vec![0u8; MAX_ACCOUNT_SIZE];
        let mut body = buf.as_slice();
        Self::deserialize(&mut body)
            .map_err(|e| anyhow::anyhow!("Failed to build blank Kamino {}: {}", Self::NAME, e))
    }
}

impl KaminoAccount for Obligation {
    const NAME: &'static str = "Obligation";

    fn discriminator() -> [u8; 8] {
        discriminators::OBLIGATION
    }
}

impl KaminoAccount for Reserve {
    const NAME: &'static str = "Reserve";

    fn discriminator() -> [u8; 8] {
        discriminators::RESERVE
    }
}

impl KaminoAccount for LendingMarket {
    const NAME: &'static str = "LendingMarket";

    fn discriminator() -> [u8; 8] {
        discriminators::LENDING_MARKET
    }
}

impl KaminoAccount for UserMetadata {
    const NAME: &'static str = "UserMetadata";
}

impl Obligation {
    pub fn is_stale(&self) -> bool {
        self.last_update.stale != 0
    }

    pub fn active_deposit_count(&self) -> usize {
        self.deposits
            .iter()
            .filter(|d| d.deposit_reserve != Pubkey::default())
            .count()
    }

    pub fn active_borrow_count(&self) -> usize {
        self.borrows
            .iter()
            .filter(|b| b.borrow_reserve != Pubkey::default())
            .count()
    }

    /// Referrer as an option; the default key means none.
    pub fn referrer(&self) -> Option<Pubkey> {
        if self.referrer == Pubkey::default() {
            None
        } else {
            Some(self.referrer)
        }
    }
}

impl Reserve {
    pub fn mint_pubkey(&self) -> Pubkey {
        self.liquidity.mint_pubkey
    }

    pub fn collateral_mint_pubkey(&self) -> Pubkey {
        self.collateral.mint_pubkey
    }

    pub fn mint_decimals(&self) -> u32 {
        self.liquidity.mint_decimals as u32
    }

    pub fn is_active(&self) -> bool {
        self.config.status == 0
    }

    pub fn farm(&self, kind: crate::core::types::ReserveFarmKind) -> Option<Pubkey> {
        let farm = match kind {
            crate::core::types::ReserveFarmKind::Collateral => self.farm_collateral,
            crate::core::types::ReserveFarmKind::Debt => self.farm_debt,
        };
        if farm == Pubkey::default() {
            None
        } else {
            Some(farm)
        }
    }

    pub fn liquidity_token_program(&self) -> Pubkey {
        if self.liquidity.token_program == Pubkey::default() {
            spl_token::id()
        } else {
            self.liquidity.token_program
        }
    }
}

impl LendingMarket {
    pub fn is_emergency_mode(&self) -> bool {
        self.emergency_mode != 0
    }

    pub fn is_borrow_disabled(&self) -> bool {
        self.borrow_disabled != 0
    }

    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.name)
            .trim_matches('\0')
            .to_string()
    }
}
