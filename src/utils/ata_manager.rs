//! Token accounts around a lending instruction: idempotent associated token
//! account creation and native SOL wrapping.

use anyhow::{Context, Result};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey, system_instruction};
use spl_token::solana_program::program_pack::Pack;
use spl_associated_token_account::instruction::create_associated_token_account_idempotent;

use crate::blockchain::rpc_client::LedgerReader;
use crate::core::registry::MintAddresses;
use crate::protocol::kamino::accounts::get_associated_token_address;

/// An associated token account the plan may have to create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtaRequest {
    pub owner: Pubkey,
    pub mint: Pubkey,
    pub token_program: Pubkey,
}

impl AtaRequest {
    pub fn new(owner: Pubkey, mint: Pubkey, token_program: Pubkey) -> Self {
        AtaRequest {
            owner,
            mint,
            token_program,
        }
    }

    pub fn address(&self) -> Pubkey {
        get_associated_token_address(&self.owner, &self.mint, &self.token_program)
    }
}

pub fn create_ata_idempotent(payer: &Pubkey, request: &AtaRequest) -> (Pubkey, Instruction) {
    let ix = create_associated_token_account_idempotent(payer, &request.owner, &request.mint, &request.token_program);
    (request.address(), ix)
}

/// Token amount of an SPL token account; `None` when the data is not one.
/// Token-2022 extensions past the base layout are ignored.
pub fn token_account_amount(data: &[u8]) -> Option<u64> {
    if data.len() < spl_token::state::Account::LEN {
        return None;
    }
    spl_token::state::Account::unpack_from_slice(&data[..spl_token::state::Account::LEN])
        .ok()
        .map(|account| account.amount)
}

/// Creation ops for every requested account the ledger does not hold yet.
/// Duplicate requests produce one op.
pub async fn missing_ata_instructions(
    ledger: &dyn LedgerReader,
    payer: &Pubkey,
    requests: &[AtaRequest],
) -> Result<Vec<(Instruction, String)>> {
    let mut unique: Vec<AtaRequest> = Vec::with_capacity(requests.len());
    for request in requests {
        if !unique.iter().any(|r| r.address() == request.address()) {
            unique.push(*request);
        }
    }
    if unique.is_empty() {
        return Ok(Vec::new());
    }

    let addresses: Vec<Pubkey> = unique.iter().map(AtaRequest::address).collect();
    let accounts = ledger
        .get_multiple_accounts(&addresses)
        .await
        .context("Failed to check associated token accounts")?;

    let mut instructions = Vec::new();
    for (request, account) in unique.iter().zip(accounts) {
        if account.is_some() {
            log::debug!("ATA {} for mint {} already exists", request.address(), request.mint);
            continue;
        }
        let (ata, ix) = create_ata_idempotent(payer, request);
        instructions.push((ix, format!("createAta[{}]", ata)));
    }
    Ok(instructions)
}

/// Wrap ops that bracket the lending instructions.
#[derive(Debug, Default, Clone)]
pub struct WsolWrap {
    pub pre: Vec<(Instruction, String)>,
    pub post: Vec<(Instruction, String)>,
}

impl WsolWrap {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.post.is_empty()
    }
}

/// Plans native SOL wrapping for `owner`.
///
/// `send_amount` lamports are moved into the wrapped account before the
/// action; `receiving` marks that the action pays wrapped SOL out to it.
/// A missing account is funded with rent plus the amount, created, synced
/// and closed afterwards. An existing account is topped up only by what it
/// lacks, and closed afterwards only when the action pays into it.
pub async fn wsol_wrap(
    ledger: &dyn LedgerReader,
    owner: &Pubkey,
    send_amount: u64,
    receiving: bool,
    rent_exempt_lamports: u64,
) -> Result<WsolWrap> {
    let wsol_mint = MintAddresses::wsol()?;
    let token_program = spl_token::id();
    let ata = get_associated_token_address(owner, &wsol_mint, &token_program);
    let existing = ledger
        .get_account(&ata)
        .await
        .with_context(|| format!("Failed to read wSOL account {}", ata))?;

    let mut wrap = WsolWrap::default();
    match existing {
        None => {
            let lamports = rent_exempt_lamports.saturating_add(send_amount);
            if lamports > 0 {
                wrap.pre.push((
                    system_instruction::transfer(owner, &ata, lamports),
                    format!("wrapSol[{}]", lamports),
                ));
            }
            let (_, create) = create_ata_idempotent(owner, &AtaRequest::new(*owner, wsol_mint, token_program));
            wrap.pre.push((create, format!("createAta[{}]", ata)));
            wrap.pre.push((spl_token::instruction::sync_native(&token_program, &ata)?, "syncNative".to_string()));
            wrap.post.push((close_wsol(owner, &ata)?, "unwrapSol".to_string()));
        }
        Some(data) => {
            if send_amount > 0 {
                let balance = token_account_amount(&data).unwrap_or(0);
                if balance >= send_amount {
                    log::info!(
                        "wSOL account {} already holds {} lamports (need {}), skipping wrap",
                        ata,
                        balance,
                        send_amount
                    );
                } else {
                    let shortfall = send_amount - balance;
                    wrap.pre.push((
                        system_instruction::transfer(owner, &ata, shortfall),
                        format!("wrapSol[{}]", shortfall),
                    ));
                    wrap.pre.push((spl_token::instruction::sync_native(&token_program, &ata)?, "syncNative".to_string()));
                }
            }
            if receiving {
                wrap.post.push((close_wsol(owner, &ata)?, "unwrapSol".to_string()));
            }
        }
    }
    Ok(wrap)
}

fn close_wsol(owner: &Pubkey, ata: &Pubkey) -> Result<Instruction> {
    spl_token::instruction::close_account(&spl_token::id(), ata, owner, owner, &[])
        .context("Failed to build wSOL close instruction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::rpc_client::InMemoryLedger;

    fn token_account_data(mint: Pubkey, owner: Pubkey, amount: u64) -> Vec<u8> {
        let account = spl_token::state::Account {
            mint,
            owner,
            amount,
            state: spl_token::state::AccountState::Initialized,
            ..Default::default()
        };
        let mut data = vec![0u8; spl_token::state::Account::LEN];
        account.pack_into_slice(&mut data);
        data
    }

    #[test]
    fn test_token_account_amount_rejects_short_data() {
        assert_eq!(token_account_amount(&[0u8; 10]), None);
        let data = token_account_data(Pubkey::new_unique(), Pubkey::new_unique(), 42);
        assert_eq!(token_account_amount(&data), Some(42));
    }

    #[tokio::test]
    async fn test_missing_atas_skips_existing_and_duplicates() {
        let ledger = InMemoryLedger::new(1);
        let owner = Pubkey::new_unique();
        let present = AtaRequest::new(owner, Pubkey::new_unique(), spl_token::id());
        let missing = AtaRequest::new(owner, Pubkey::new_unique(), spl_token::id());
        ledger.set_account(present.address(), vec![0u8; 165]).await;

        let ops = missing_ata_instructions(&ledger, &owner, &[present, missing, missing]).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert!(ops[0].1.contains(&missing.address().to_string()));
    }

    #[tokio::test]
    async fn test_wrap_for_missing_account_funds_rent_and_closes() {
        let ledger = InMemoryLedger::new(1);
        let owner = Pubkey::new_unique();
        let wrap = wsol_wrap(&ledger, &owner, 5_000, false, 2_039_280).await.unwrap();
        let labels: Vec<&str> = wrap.pre.iter().map(|(_, l)| l.as_str()).collect();
        assert_eq!(labels.len(), 3);
        assert_eq!(labels[0], "wrapSol[2044280]");
        assert_eq!(labels[2], "syncNative");
        assert_eq!(wrap.post.len(), 1);
    }

    #[tokio::test]
    async fn test_wrap_skipped_when_balance_suffices() {
        let ledger = InMemoryLedger::new(1);
        let owner = Pubkey::new_unique();
        let wsol = MintAddresses::wsol().unwrap();
        let ata = get_associated_token_address(&owner, &wsol, &spl_token::id());
        ledger.set_account(ata, token_account_data(wsol, owner, 10_000)).await;

        let wrap = wsol_wrap(&ledger, &owner, 5_000, false, 2_039_280).await.unwrap();
        assert!(wrap.is_empty(), "Existing balance covers the send");

        let wrap = wsol_wrap(&ledger, &owner, 15_000, true, 2_039_280).await.unwrap();
        assert_eq!(wrap.pre[0].1, "wrapSol[5000]");
        assert_eq!(wrap.post.len(), 1);
    }
}
