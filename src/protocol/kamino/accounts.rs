use anyhow::Result;
use solana_sdk::pubkey::Pubkey;

pub mod seeds {
    pub const LENDING_MARKET_AUTH: &[u8] = b"lma";
    pub const USER_METADATA: &[u8] = b"user_meta";
    pub const REFERRER_TOKEN_STATE: &[u8] = b"referrer_acc";
    pub const FARM_USER_STATE: &[u8] = b"user";
}

fn find(seeds: &[&[u8]], program_id: &Pubkey, what: &str) -> Result<Pubkey> {
    Pubkey::try_find_program_address(seeds, program_id)
        .map(|(pubkey, _)| pubkey)
        .ok_or_else(|| anyhow::anyhow!("Failed to derive {}", what))
}

/// Obligation PDA: `[tag, id, owner, market, seed1, seed2]`.
pub fn derive_obligation_address(
    tag: u8,
    id: u8,
    owner: &Pubkey,
    lending_market: &Pubkey,
    seed1: &Pubkey,
    seed2: &Pubkey,
    program_id: &Pubkey,
) -> Result<Pubkey> {
    let tag_seed = [tag];
    let id_seed = [id];
    let seeds: &[&[u8]] = &[
        &tag_seed,
        &id_seed,
        owner.as_ref(),
        lending_market.as_ref(),
        seed1.as_ref(),
        seed2.as_ref(),
    ];
    find(seeds, program_id, "obligation address")
}

pub fn derive_lending_market_authority(
    lending_market: &Pubkey,
    program_id: &Pubkey,
) -> Result<Pubkey> {
    find(
        &[seeds::LENDING_MARKET_AUTH, lending_market.as_ref()],
        program_id,
        "lending market authority",
    )
}

pub fn derive_user_metadata_address(owner: &Pubkey, program_id: &Pubkey) -> Result<Pubkey> {
    find(
        &[seeds::USER_METADATA, owner.as_ref()],
        program_id,
        "user metadata address",
    )
}

pub fn derive_referrer_token_state(
    referrer: &Pubkey,
    reserve: &Pubkey,
    program_id: &Pubkey,
) -> Result<Pubkey> {
    find(
        &[seeds::REFERRER_TOKEN_STATE, referrer.as_ref(), reserve.as_ref()],
        program_id,
        "referrer token state",
    )
}

/// Per-obligation user state inside a reserve's reward farm.
pub fn derive_obligation_farm_state(
    farm_state: &Pubkey,
    obligation: &Pubkey,
    farms_program_id: &Pubkey,
) -> Result<Pubkey> {
    find(
        &[seeds::FARM_USER_STATE, farm_state.as_ref(), obligation.as_ref()],
        farms_program_id,
        "obligation farm state",
    )
}

pub fn get_associated_token_address(
    wallet: &Pubkey,
    mint: &Pubkey,
    token_program: &Pubkey,
) -> Pubkey {
    spl_associated_token_account::get_associated_token_address_with_program_id(
        wallet,
        mint,
        token_program,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ProgramIds;

    #[test]
    fn test_obligation_pda_is_deterministic() {
        let program = ProgramIds::klend().unwrap();
        let owner = Pubkey::new_unique();
        let market = Pubkey::new_unique();
        let zero = Pubkey::default();

        let a = derive_obligation_address(0, 0, &owner, &market, &zero, &zero, &program).unwrap();
        let b = derive_obligation_address(0, 0, &owner, &market, &zero, &zero, &program).unwrap();
        let c = derive_obligation_address(0, 1, &owner, &market, &zero, &zero, &program).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c, "Obligation id must change the address");
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let program = ProgramIds::klend().unwrap();
        let key = Pubkey::new_unique();
        let lma = derive_lending_market_authority(&key, &program).unwrap();
        let meta = derive_user_metadata_address(&key, &program).unwrap();
        assert_ne!(lma, meta);
    }

    #[test]
    fn test_ata_matches_spl_helper() {
        let wallet = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        assert_eq!(
            get_associated_token_address(&wallet, &mint, &spl_token::id()),
            spl_associated_token_account::get_associated_token_address(&wallet, &mint)
        );
    }
}
