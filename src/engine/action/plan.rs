use solana_sdk::{instruction::Instruction, pubkey::Pubkey};

use crate::core::config::Config;
use crate::core::registry::constants;
use crate::core::types::ActionKind;
use crate::engine::obligation::KaminoObligation;
use crate::protocol::kamino::accounts::derive_obligation_address;

/// Where an operation sits in the flattened plan.
///
/// Flattening order: compute budget, setup, first lending op, in-between,
/// second lending op, cleanup. In-between operations only appear when a
/// plan carries two lending operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    ComputeBudget,
    Setup,
    Lending,
    InBetween,
    Cleanup,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::ComputeBudget => "compute-budget",
            Phase::Setup => "setup",
            Phase::Lending => "lending",
            Phase::InBetween => "in-between",
            Phase::Cleanup => "cleanup",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannedOperation {
    pub phase: Phase,
    pub instruction: Instruction,
    pub label: String,
}

/// Seeds of a not-yet-created obligation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationType {
    Vanilla { id: u8 },
    Multiply { collateral_mint: Pubkey, debt_mint: Pubkey, id: u8 },
    /// Always id 0; the token is used for both seeds.
    Lending { token_mint: Pubkey },
    Leverage { collateral_mint: Pubkey, debt_mint: Pubkey, id: u8 },
}

impl ObligationType {
    pub fn vanilla() -> Self {
        ObligationType::Vanilla { id: 0 }
    }

    pub fn tag(&self) -> u8 {
        match self {
            ObligationType::Vanilla { .. } => 0,
            ObligationType::Multiply { .. } => 1,
            ObligationType::Lending { .. } => 2,
            ObligationType::Leverage { .. } => 3,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            ObligationType::Vanilla { id }
            | ObligationType::Multiply { id, .. }
            | ObligationType::Leverage { id, .. } => *id,
            ObligationType::Lending { .. } => 0,
        }
    }

    /// `(seed1, seed2)`; the default key stands in for "no seed".
    pub fn seeds(&self) -> (Pubkey, Pubkey) {
        match self {
            ObligationType::Vanilla { .. } => (Pubkey::default(), Pubkey::default()),
            ObligationType::Multiply { collateral_mint, debt_mint, .. }
            | ObligationType::Leverage { collateral_mint, debt_mint, .. } => (*collateral_mint, *debt_mint),
            ObligationType::Lending { token_mint } => (*token_mint, *token_mint),
        }
    }

    pub fn address(&self, lending_market: &Pubkey, owner: &Pubkey, program_id: &Pubkey) -> anyhow::Result<Pubkey> {
        let (seed1, seed2) = self.seeds();
        derive_obligation_address(self.tag(), self.id(), owner, lending_market, &seed1, &seed2, program_id)
    }
}

/// The obligation a plan acts on: one already loaded, or the seeds of one
/// that may still have to be created.
#[derive(Debug, Clone)]
pub enum ObligationSource {
    Loaded(Box<KaminoObligation>),
    ToCreate(ObligationType),
}

impl From<KaminoObligation> for ObligationSource {
    fn from(obligation: KaminoObligation) -> Self {
        ObligationSource::Loaded(Box::new(obligation))
    }
}

impl From<ObligationType> for ObligationSource {
    fn from(obligation_type: ObligationType) -> Self {
        ObligationSource::ToCreate(obligation_type)
    }
}

/// A mint and an amount in its lamports. `U64_MAX` means "all".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLeg {
    pub mint: Pubkey,
    pub amount: u64,
}

impl TokenLeg {
    pub fn new(mint: Pubkey, amount: u64) -> Self {
        TokenLeg { mint, amount }
    }

    pub fn all(mint: Pubkey) -> Self {
        TokenLeg { mint, amount: constants::U64_MAX }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOptions {
    /// Compute unit limit; 0 leaves the compute budget op out.
    pub extra_compute_budget: u32,
    /// Emit token-account creation and native SOL wrapping ops.
    pub include_ata_ops: bool,
    pub request_elevation_group: bool,
    /// Group to request instead of the best one found.
    pub elevation_group_override: Option<u8>,
    pub skip_user_metadata_init: bool,
    /// Lookup table recorded in a newly created user profile.
    pub user_lookup_table: Pubkey,
    pub referrer: Option<Pubkey>,
    /// Pays for created accounts and cranks farm refreshes; the owner when unset.
    pub payer: Option<Pubkey>,
    pub max_allowed_ltv_override_pct: u64,
    /// Slot at which exchange and borrow rates are projected.
    pub slot: u64,
    pub wsol_rent_exempt_lamports: u64,
    pub farms_program_id: Option<Pubkey>,
}

impl Default for ActionOptions {
    fn default() -> Self {
        ActionOptions {
            extra_compute_budget: constants::DEFAULT_EXTRA_COMPUTE_BUDGET,
            include_ata_ops: true,
            request_elevation_group: false,
            elevation_group_override: None,
            skip_user_metadata_init: false,
            user_lookup_table: Pubkey::default(),
            referrer: None,
            payer: None,
            max_allowed_ltv_override_pct: 0,
            slot: 0,
            wsol_rent_exempt_lamports: constants::DEFAULT_TOKEN_ACCOUNT_RENT_LAMPORTS,
            farms_program_id: None,
        }
    }
}

impl ActionOptions {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(ActionOptions {
            extra_compute_budget: config.extra_compute_budget,
            wsol_rent_exempt_lamports: config.wsol_rent_exempt_lamports,
            farms_program_id: Some(config.farms_program_id()?),
            ..ActionOptions::default()
        })
    }

    pub fn at_slot(mut self, slot: u64) -> Self {
        self.slot = slot;
        self
    }
}

/// Ordered operations for one logical action. Everything here belongs in a
/// single atomic batch; callers may split it across transactions only if they
/// keep the order.
#[derive(Debug, Clone)]
pub struct ActionPlan {
    pub kind: ActionKind,
    pub owner: Pubkey,
    pub obligation: Pubkey,
    operations: Vec<PlannedOperation>,
}

impl ActionPlan {
    pub fn operations(&self) -> &[PlannedOperation] {
        &self.operations
    }

    pub fn instructions(&self) -> Vec<Instruction> {
        self.operations.iter().map(|op| op.instruction.clone()).collect()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.label.as_str()).collect()
    }

    pub fn in_phase(&self, phase: Phase) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(move |op| op.phase == phase)
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn into_instructions(self) -> Vec<Instruction> {
        self.operations.into_iter().map(|op| op.instruction).collect()
    }
}

/// Single accumulator of `(phase, instruction, label)` triples, partitioned by
/// phase when the plan is finished.
#[derive(Debug, Default)]
pub(crate) struct OperationLog {
    entries: Vec<PlannedOperation>,
    /// Farm post-refreshes spliced in front of the cleanup phase.
    held_for_cleanup: Vec<PlannedOperation>,
}

impl OperationLog {
    pub fn push(&mut self, phase: Phase, instruction: Instruction, label: impl Into<String>) {
        self.entries.push(PlannedOperation {
            phase,
            instruction,
            label: label.into(),
        });
    }

    /// Puts `ops` ahead of every setup operation emitted so far, keeping their
    /// relative order.
    pub fn prepend_setup(&mut self, ops: Vec<(Instruction, String)>) {
        let front = ops.into_iter().map(|(instruction, label)| PlannedOperation {
            phase: Phase::Setup,
            instruction,
            label,
        });
        self.entries.splice(0..0, front);
    }

    pub fn hold_for_cleanup(&mut self, instruction: Instruction, label: impl Into<String>) {
        self.held_for_cleanup.push(PlannedOperation {
            phase: Phase::Cleanup,
            instruction,
            label: label.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.held_for_cleanup.is_empty()
    }

    pub fn finish(self, kind: ActionKind, owner: Pubkey, obligation: Pubkey) -> ActionPlan {
        let mut compute_budget = Vec::new();
        let mut setup = Vec::new();
        let mut lending = Vec::new();
        let mut in_between = Vec::new();
        let mut cleanup = self.held_for_cleanup;

        for entry in self.entries {
            match entry.phase {
                Phase::ComputeBudget => compute_budget.push(entry),
                Phase::Setup => setup.push(entry),
                Phase::Lending => lending.push(entry),
                Phase::InBetween => in_between.push(entry),
                Phase::Cleanup => cleanup.push(entry),
            }
        }

        let mut operations = compute_budget;
        operations.append(&mut setup);
        let last = lending.len().saturating_sub(1);
        for (i, op) in lending.into_iter().enumerate() {
            operations.push(op);
            if i != last {
                operations.extend(in_between.iter().cloned());
            }
        }
        operations.append(&mut cleanup);

        for (i, op) in operations.iter().enumerate() {
            log::debug!("ActionPlan[{}] #{} ({}) {}", kind, i, op.phase, op.label);
        }

        ActionPlan {
            kind,
            owner,
            obligation,
            operations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ProgramIds;

    fn ix(tag: u8) -> Instruction {
        Instruction {
            program_id: Pubkey::default(),
            accounts: vec![],
            data: vec![tag],
        }
    }

    #[test]
    fn test_finish_orders_phases_and_brackets_in_between() {
        let mut log = OperationLog::default();
        log.push(Phase::Lending, ix(1), "first");
        log.push(Phase::InBetween, ix(2), "between");
        log.push(Phase::Setup, ix(3), "setup");
        log.push(Phase::Cleanup, ix(4), "cleanup");
        log.push(Phase::Lending, ix(5), "second");
        log.push(Phase::ComputeBudget, ix(6), "budget");
        log.hold_for_cleanup(ix(7), "held");
        log.prepend_setup(vec![(ix(8), "ata".to_string())]);

        let plan = log.finish(ActionKind::DepositAndBorrow, Pubkey::new_unique(), Pubkey::new_unique());
        assert_eq!(
            plan.labels(),
            vec!["budget", "ata", "setup", "first", "between", "second", "held", "cleanup"]
        );
    }

    #[test]
    fn test_in_between_dropped_without_second_lending_op() {
        let mut log = OperationLog::default();
        log.push(Phase::Lending, ix(1), "only");
        log.push(Phase::InBetween, ix(2), "between");
        let plan = log.finish(ActionKind::Deposit, Pubkey::new_unique(), Pubkey::new_unique());
        assert_eq!(plan.labels(), vec!["only"]);
    }

    #[test]
    fn test_obligation_type_seeds_and_tags() {
        let coll = Pubkey::new_unique();
        let debt = Pubkey::new_unique();
        let token = Pubkey::new_unique();

        assert_eq!(ObligationType::vanilla().tag(), 0);
        assert_eq!(ObligationType::vanilla().seeds(), (Pubkey::default(), Pubkey::default()));

        let multiply = ObligationType::Multiply { collateral_mint: coll, debt_mint: debt, id: 2 };
        assert_eq!((multiply.tag(), multiply.id()), (1, 2));
        assert_eq!(multiply.seeds(), (coll, debt));

        let lending = ObligationType::Lending { token_mint: token };
        assert_eq!((lending.tag(), lending.id()), (2, 0));
        assert_eq!(lending.seeds(), (token, token));

        let leverage = ObligationType::Leverage { collateral_mint: coll, debt_mint: debt, id: 0 };
        assert_eq!(leverage.tag(), 3);

        let program = ProgramIds::klend().unwrap();
        let market = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        assert_ne!(
            multiply.address(&market, &owner, &program).unwrap(),
            leverage.address(&market, &owner, &program).unwrap(),
            "Tag is part of the seeds"
        );
    }
}
