//! Central registry of well-known addresses and protocol constants.
//!
//! Program ids, mints and sysvars live here once so the rest of the crate never
//! hardcodes a base58 string.

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// Program ID registry
pub struct ProgramIds;

impl ProgramIds {
    /// Kamino Lend program (mainnet)
    pub const KLEND: &'static str = "KLend2g3cP87fffoy8q1mQqGKjrxjC8boSyAYavgmjD";

    /// Kamino Farms program (mainnet)
    pub const FARMS: &'static str = "FarmsPZpWu9i7Kky8tPN37rs2TpmMrAZrC7S7vJa91Hr";

    /// Associated Token Program ID
    pub const ASSOCIATED_TOKEN: &'static str = "ATokenGPvbdGVxr1b2hvZbsiqW5xWH25efTNsLJA8knL";

    /// Standard SPL Token Program ID
    pub const TOKEN: &'static str = "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA";

    /// Token-2022 Program ID (Token Extensions)
    pub const TOKEN_2022: &'static str = "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb";

    pub fn klend() -> Result<Pubkey> { Self::parse(Self::KLEND, "Kamino Lend program ID") }
    pub fn farms() -> Result<Pubkey> { Self::parse(Self::FARMS, "Kamino Farms program ID") }
    pub fn associated_token() -> Result<Pubkey> { Self::parse(Self::ASSOCIATED_TOKEN, "Associated Token program ID") }
    pub fn token() -> Result<Pubkey> { Self::parse(Self::TOKEN, "Token program ID") }
    pub fn token_2022() -> Result<Pubkey> { Self::parse(Self::TOKEN_2022, "Token-2022 program ID") }

    fn parse(addr: &str, name: &str) -> Result<Pubkey> {
        Pubkey::from_str(addr).with_context(|| format!("Failed to parse {}", name))
    }
}

/// Mint registry
pub struct MintAddresses;

impl MintAddresses {
    /// Wrapped SOL
    pub const WSOL: &'static str = "So11111111111111111111111111111111111111112";

    /// USDC Mint (Mainnet)
    pub const USDC: &'static str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    pub fn wsol() -> Result<Pubkey> { Self::parse(Self::WSOL, "wSOL mint") }
    pub fn usdc() -> Result<Pubkey> { Self::parse(Self::USDC, "USDC mint") }

    fn parse(addr: &str, name: &str) -> Result<Pubkey> {
        Pubkey::from_str(addr).with_context(|| format!("Failed to parse {}", name))
    }
}

/// Lending market registry
pub struct LendingMarketAddresses;

impl LendingMarketAddresses {
    /// Kamino main market (Mainnet)
    pub const MAIN: &'static str = "7u3HeHxYDLhnCoErrtycNokbQYbWGzLs6JSDqGAv5PfF";

    pub fn main() -> Result<Pubkey> {
        Pubkey::from_str(Self::MAIN).context("Failed to parse main lending market address")
    }
}

/// Wrapped SOL mint, parsed once.
pub static WSOL_MINT: Lazy<Pubkey> = Lazy::new(|| spl_token::native_mint::id());

pub fn is_wsol_mint(mint: &Pubkey) -> bool {
    *mint == *WSOL_MINT
}

/// Protocol constants shared by the valuation and assembly engines.
pub mod constants {
    /// "Everything" sentinel for withdraw/repay amounts.
    pub const U64_MAX: u64 = u64::MAX;
    pub const ONE_HUNDRED_PCT_IN_BPS: u64 = 10_000;

    pub const SLOTS_PER_SECOND: u64 = 2;
    pub const SLOTS_PER_MINUTE: u64 = SLOTS_PER_SECOND * 60;
    pub const SLOTS_PER_HOUR: u64 = SLOTS_PER_MINUTE * 60;
    pub const SLOTS_PER_DAY: u64 = SLOTS_PER_HOUR * 24;
    pub const SLOTS_PER_YEAR: u64 = SLOTS_PER_DAY * 365;

    pub const DEFAULT_RECENT_SLOT_DURATION_MS: u64 = 500;

    pub const MAX_OBLIGATION_DEPOSITS: usize = 8;
    pub const MAX_OBLIGATION_BORROWS: usize = 5;
    pub const POSITION_LIMIT: usize = 10;

    pub const MIN_INITIAL_DEPOSIT: u64 = 100_000;
    /// Extra lamports wrapped when repaying a whole SOL debt, covering interest
    /// accrued between simulation and execution.
    pub const SOL_PADDING_FOR_INTEREST: u64 = 1_000_000;
    pub const INITIAL_COLLATERAL_RATE: u64 = 1;

    pub const DEFAULT_EXTRA_COMPUTE_BUDGET: u32 = 1_000_000;
    /// Rent-exempt minimum for a 165-byte token account.
    pub const DEFAULT_TOKEN_ACCOUNT_RENT_LAMPORTS: u64 = 2_039_280;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_ids_parse() {
        assert!(ProgramIds::klend().is_ok());
        assert!(ProgramIds::farms().is_ok());
        assert_eq!(ProgramIds::token().unwrap(), spl_token::id());
    }

    #[test]
    fn test_wsol_mint_matches_native_mint() {
        assert_eq!(MintAddresses::wsol().unwrap(), *WSOL_MINT);
        assert!(is_wsol_mint(&spl_token::native_mint::id()));
        assert!(!is_wsol_mint(&Pubkey::new_unique()));
    }

    #[test]
    fn test_slot_constants() {
        assert_eq!(constants::SLOTS_PER_DAY, 172_800);
        assert_eq!(constants::SLOTS_PER_YEAR, 63_072_000);
    }
}
