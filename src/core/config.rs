use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::env;
use std::str::FromStr;

use crate::core::registry::{constants, ProgramIds};

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub rpc_timeout_seconds: u64,
    pub klend_program_id: String,
    pub farms_program_id: String,
    pub lending_market: Option<String>,
    /// Observed slot duration; scales curve rates to the real slot cadence.
    pub recent_slot_duration_ms: u64,
    /// Compute units requested for a plan. 0 disables the compute budget op.
    pub extra_compute_budget: u32,
    pub wsol_rent_exempt_lamports: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Config {
            rpc_http_url: env::var("RPC_HTTP_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),
            rpc_timeout_seconds: env::var("RPC_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid RPC_TIMEOUT_SECONDS value")?,
            klend_program_id: env::var("KLEND_PROGRAM_ID")
                .unwrap_or_else(|_| ProgramIds::KLEND.to_string()),
            farms_program_id: env::var("FARMS_PROGRAM_ID")
                .unwrap_or_else(|_| ProgramIds::FARMS.to_string()),
            lending_market: env::var("LENDING_MARKET").ok(),
            recent_slot_duration_ms: env::var("RECENT_SLOT_DURATION_MS")
                .unwrap_or_else(|_| constants::DEFAULT_RECENT_SLOT_DURATION_MS.to_string())
                .parse()
                .context("Invalid RECENT_SLOT_DURATION_MS value")?,
            extra_compute_budget: env::var("EXTRA_COMPUTE_BUDGET")
                .unwrap_or_else(|_| constants::DEFAULT_EXTRA_COMPUTE_BUDGET.to_string())
                .parse()
                .context("Invalid EXTRA_COMPUTE_BUDGET value")?,
            wsol_rent_exempt_lamports: env::var("WSOL_RENT_EXEMPT_LAMPORTS")
                .unwrap_or_else(|_| constants::DEFAULT_TOKEN_ACCOUNT_RENT_LAMPORTS.to_string())
                .parse()
                .context("Invalid WSOL_RENT_EXEMPT_LAMPORTS value")?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.rpc_http_url.starts_with("http://") && !self.rpc_http_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "RPC_HTTP_URL must start with http:// or https://"
            ));
        }

        if self.recent_slot_duration_ms == 0 {
            return Err(anyhow::anyhow!("RECENT_SLOT_DURATION_MS must be greater than 0"));
        }

        if self.rpc_timeout_seconds > 30 {
            log::warn!(
                "RPC_TIMEOUT_SECONDS={} is very high (>30s), loads may block for a long time",
                self.rpc_timeout_seconds
            );
        }

        self.klend_program_id()?;
        self.farms_program_id()?;
        self.lending_market()?;

        Ok(())
    }

    pub fn klend_program_id(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.klend_program_id).context("Invalid KLEND_PROGRAM_ID")
    }

    pub fn farms_program_id(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.farms_program_id).context("Invalid FARMS_PROGRAM_ID")
    }

    pub fn lending_market(&self) -> Result<Option<Pubkey>> {
        self.lending_market
            .as_deref()
            .map(|s| Pubkey::from_str(s).context("Invalid LENDING_MARKET"))
            .transpose()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_http_url: "https://api.mainnet-beta.solana.com".to_string(),
            rpc_timeout_seconds: 10,
            klend_program_id: ProgramIds::KLEND.to_string(),
            farms_program_id: ProgramIds::FARMS.to_string(),
            lending_market: None,
            recent_slot_duration_ms: constants::DEFAULT_RECENT_SLOT_DURATION_MS,
            extra_compute_budget: constants::DEFAULT_EXTRA_COMPUTE_BUDGET,
            wsol_rent_exempt_lamports: constants::DEFAULT_TOKEN_ACCOUNT_RENT_LAMPORTS,
        }
    }
}
