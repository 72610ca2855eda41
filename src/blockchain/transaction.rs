use anyhow::Result;
use solana_sdk::{
    hash::Hash,
    instruction::Instruction,
    pubkey::Pubkey,
    signature::{Keypair, Signature, Signer},
    transaction::Transaction,
};

use crate::engine::action::{ActionPlan, Phase};

pub struct TransactionBuilder {
    instructions: Vec<Instruction>,
    payer: Pubkey,
}

impl TransactionBuilder {
    pub fn new(payer: Pubkey) -> Self {
        TransactionBuilder {
            instructions: Vec::new(),
            payer,
        }
    }

    /// Every operation of the plan, in plan order.
    pub fn from_plan(payer: Pubkey, plan: &ActionPlan) -> Self {
        TransactionBuilder {
            instructions: plan.instructions(),
            payer,
        }
    }

    pub fn add_instruction(&mut self, ix: Instruction) -> &mut Self {
        self.instructions.push(ix);
        self
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Unsigned transaction; sign it once with `sign_transaction`.
    pub fn build(&self, blockhash: Hash) -> Transaction {
        let mut tx = Transaction::new_with_payer(&self.instructions, Some(&self.payer));
        tx.message.recent_blockhash = blockhash;
        tx
    }
}

/// Splits a plan into ordered batches of at most `max_instructions`
/// instructions. The compute budget op, when present, opens every batch and
/// does not count towards the limit.
pub fn split_plan(plan: &ActionPlan, max_instructions: usize) -> Vec<Vec<Instruction>> {
    let budget: Vec<Instruction> = plan.in_phase(Phase::ComputeBudget).map(|op| op.instruction.clone()).collect();
    let body: Vec<Instruction> = plan
        .operations()
        .iter()
        .filter(|op| op.phase != Phase::ComputeBudget)
        .map(|op| op.instruction.clone())
        .collect();

    body.chunks(max_instructions.max(1))
        .map(|chunk| budget.iter().cloned().chain(chunk.iter().cloned()).collect())
        .collect()
}

/// Signs an unsigned transaction. A signer slot that already carries a
/// signature is an error rather than a silent re-sign.
pub fn sign_transaction(tx: &mut Transaction, keypair: &Keypair) -> Result<()> {
    let signer = keypair.pubkey();
    if let Some(index) = tx.message.account_keys.iter().position(|key| *key == signer) {
        if tx.signatures.get(index).map_or(false, |sig| *sig != Signature::default()) {
            return Err(anyhow::anyhow!(
                "Transaction already signed by {} at index {}",
                signer,
                index
            ));
        }
    }
    tx.try_sign(&[keypair], tx.message.recent_blockhash)?;
    Ok(())
}
