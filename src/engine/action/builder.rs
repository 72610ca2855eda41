use anyhow::Result;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use solana_sdk::{compute_budget::ComputeBudgetInstruction, instruction::Instruction, pubkey::Pubkey};

use super::plan::{ActionOptions, ActionPlan, ObligationSource, ObligationType, OperationLog, Phase, TokenLeg};
use super::support::reserve_accounts;
use crate::blockchain::rpc_client::LedgerReader;
use crate::core::error::Error;
use crate::core::registry::{constants, is_wsol_mint, ProgramIds};
use crate::core::types::{ActionKind, ReserveFarmKind};
use crate::engine::market::KaminoMarket;
use crate::engine::obligation::KaminoObligation;
use crate::engine::obligation_order::ObligationOrderAtIndex;
use crate::engine::reserve::KaminoReserve;
use crate::protocol::kamino::accounts::{derive_referrer_token_state, derive_user_metadata_address};
use crate::protocol::kamino::instructions::{self, LiquidateAccounts};
use crate::protocol::kamino::types::{KaminoAccount, UserMetadata};
use crate::utils::ata_manager::{missing_ata_instructions, wsol_wrap, AtaRequest};

/// Working state while one plan is assembled. Consumed by `finish`.
pub(crate) struct ActionBuilder<'a> {
    pub(super) ledger: &'a dyn LedgerReader,
    pub(super) market: &'a KaminoMarket,
    pub(super) kind: ActionKind,
    /// Signer of the lending instructions.
    pub(super) owner: Pubkey,
    /// Owner recorded in the obligation; differs from `owner` when liquidating.
    pub(super) obligation_owner: Pubkey,
    pub(super) payer: Pubkey,
    pub(super) obligation_address: Pubkey,
    pub(super) obligation: Option<KaminoObligation>,
    pub(super) obligation_type: ObligationType,
    pub(super) user_metadata: Pubkey,
    pub(super) user_metadata_exists: bool,
    pub(super) referrer: Option<Pubkey>,
    pub(super) options: ActionOptions,
    pub(super) slot: u64,
    pub(super) farms_program: Pubkey,
    pub(super) referrer_inits: Vec<(Instruction, String)>,
    pub(super) log: OperationLog,
    ata_requests: Vec<AtaRequest>,
    wsol_send: u64,
    wsol_receive: bool,
}

/// Explicit referrer, else the obligation's, else the one recorded in the
/// owner's user profile.
fn resolve_referrer(
    explicit: Option<Pubkey>,
    obligation: Option<&KaminoObligation>,
    user_metadata: Option<&UserMetadata>,
) -> Option<Pubkey> {
    explicit
        .filter(|r| *r != Pubkey::default())
        .or_else(|| obligation.and_then(|o| o.referrer()))
        .or_else(|| user_metadata.map(|m| m.referrer).filter(|r| *r != Pubkey::default()))
}

fn push_unique(items: &mut Vec<Pubkey>, item: Pubkey) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl<'a> ActionBuilder<'a> {
    async fn new(
        ledger: &'a dyn LedgerReader,
        market: &'a KaminoMarket,
        kind: ActionKind,
        owner: Pubkey,
        source: Option<ObligationSource>,
        options: ActionOptions,
    ) -> Result<Self> {
        let program_id = market.program_id;
        let slot = if options.slot > 0 { options.slot } else { ledger.get_slot().await? };

        let (obligation_address, obligation, obligation_type) = match source {
            None => (Pubkey::default(), None, ObligationType::vanilla()),
            Some(ObligationSource::Loaded(loaded)) => (loaded.address, Some(*loaded), ObligationType::vanilla()),
            Some(ObligationSource::ToCreate(obligation_type)) => {
                let address = obligation_type.address(&market.address, &owner, &program_id)?;
                let loaded = KaminoObligation::load(ledger, market, &address).await?;
                if loaded.is_none() {
                    log::debug!("ActionPlan: obligation {} does not exist yet, will be created", address);
                }
                (address, loaded, obligation_type)
            }
        };

        let user_metadata = derive_user_metadata_address(&owner, &program_id)?;
        let metadata_state = match ledger.get_account(&user_metadata).await? {
            Some(data) => Some(UserMetadata::from_account_data(&data)?),
            None => None,
        };
        let referrer = resolve_referrer(options.referrer, obligation.as_ref(), metadata_state.as_ref());
        let farms_program = match options.farms_program_id {
            Some(id) => id,
            None => ProgramIds::farms()?,
        };

        Ok(ActionBuilder {
            ledger,
            market,
            kind,
            owner,
            obligation_owner: obligation.as_ref().map_or(owner, |o| o.state.owner),
            payer: options.payer.unwrap_or(owner),
            obligation_address,
            obligation,
            obligation_type,
            user_metadata,
            user_metadata_exists: metadata_state.is_some(),
            referrer,
            options,
            slot,
            farms_program,
            referrer_inits: Vec::new(),
            log: OperationLog::default(),
            ata_requests: Vec::new(),
            wsol_send: 0,
            wsol_receive: false,
        })
    }

    fn require_obligation(&self) -> Result<&KaminoObligation> {
        self.obligation.as_ref().ok_or_else(|| {
            Error::state(format!(
                "Obligation {} not found, {} needs an existing obligation",
                self.obligation_address, self.kind
            ))
            .into()
        })
    }

    /// Distinct reserves touched by the obligation after this action must
    /// stay within the protocol limits. A reserve held on both sides counts
    /// once towards the overall limit.
    fn check_position_limit(&self, new_deposits: &[Pubkey], new_borrows: &[Pubkey]) -> Result<()> {
        let mut deposits = self.obligation.as_ref().map(|o| o.deposit_reserves()).unwrap_or_default();
        let mut borrows = self.obligation.as_ref().map(|o| o.borrow_reserves()).unwrap_or_default();
        for reserve in new_deposits {
            push_unique(&mut deposits, *reserve);
        }
        for reserve in new_borrows {
            push_unique(&mut borrows, *reserve);
        }

        let mut reserves = deposits.clone();
        for reserve in &borrows {
            push_unique(&mut reserves, *reserve);
        }
        if reserves.len() > constants::POSITION_LIMIT {
            return Err(Error::validation(format!(
                "Position limit exceeded: obligation {} would touch {} reserves, limit is {}",
                self.obligation_address,
                reserves.len(),
                constants::POSITION_LIMIT
            ))
            .into());
        }
        if deposits.len() > constants::MAX_OBLIGATION_DEPOSITS {
            return Err(Error::validation(format!(
                "Position limit exceeded: {} deposit reserves, limit is {}",
                deposits.len(),
                constants::MAX_OBLIGATION_DEPOSITS
            ))
            .into());
        }
        if borrows.len() > constants::MAX_OBLIGATION_BORROWS {
            return Err(Error::validation(format!(
                "Position limit exceeded: {} borrow reserves, limit is {}",
                borrows.len(),
                constants::MAX_OBLIGATION_BORROWS
            ))
            .into());
        }
        Ok(())
    }

    fn referral_fee_bps(&self) -> u16 {
        self.market.referral_fee_bps()
    }

    /// Wallet account for `reserve`'s liquidity. Native SOL legs are wrapped
    /// instead of getting a plain token account.
    fn liquidity_leg(&mut self, reserve: &KaminoReserve, send: Option<u64>) -> Pubkey {
        let mint = reserve.liquidity_mint();
        let request = AtaRequest::new(self.owner, mint, reserve.liquidity_token_program());
        if is_wsol_mint(&mint) {
            match send {
                Some(amount) => self.wsol_send = self.wsol_send.saturating_add(amount),
                None => self.wsol_receive = true,
            }
        } else {
            self.ata_requests.push(request);
        }
        request.address()
    }

    fn collateral_account(&mut self, reserve: &KaminoReserve, create: bool) -> Pubkey {
        let request = AtaRequest::new(self.owner, reserve.collateral_mint(), spl_token::id());
        if create {
            self.ata_requests.push(request);
        }
        request.address()
    }

    /// Lamports to wrap when repaying `amount` of `reserve`. "All" becomes the
    /// debt projected to the plan slot plus a padding for interest accrued
    /// before execution.
    fn repay_send_amount(&self, reserve: &KaminoReserve, amount: u64) -> Result<u64> {
        if amount != constants::U64_MAX {
            return Ok(amount);
        }
        let obligation = self.require_obligation()?;
        let liquidity = obligation.obligation_liquidity_by_reserve(&reserve.address)?;
        let borrowed = KaminoObligation::borrow_amount(liquidity)?;
        let obligation_rate = KaminoObligation::cumulative_borrow_rate(liquidity)?;
        let reserve_rate = reserve.estimated_cumulative_borrow_rate(self.slot, self.referral_fee_bps())?;
        let projected = if obligation_rate.is_zero() {
            borrowed
        } else {
            borrowed * reserve_rate / obligation_rate
        };
        let lamports = projected
            .floor()
            .to_u64()
            .ok_or_else(|| Error::arithmetic(format!("Projected debt {} does not fit in u64", projected)))?;
        Ok(lamports.saturating_add(constants::SOL_PADDING_FOR_INTEREST))
    }

    fn is_full_repay(&self, reserve: &KaminoReserve, amount: u64) -> Result<bool> {
        let borrow = self
            .require_obligation()?
            .borrow_by_reserve(&reserve.address)
            .ok_or_else(|| {
                Error::state(format!(
                    "Could not find debt reserve {} in obligation {}",
                    reserve.address, self.obligation_address
                ))
            })?;
        Ok(borrow.amount <= Decimal::from(amount))
    }

    fn deposit_reserves(&self) -> Vec<Pubkey> {
        self.obligation.as_ref().map(|o| o.deposit_reserves()).unwrap_or_default()
    }

    fn potential_elevation_group_update(&self) -> u8 {
        self.obligation
            .as_ref()
            .map_or(0, |o| o.refreshed_stats.potential_elevation_group_update)
    }

    /// Group to request before borrowing `debt` against `coll`, if any.
    fn borrow_group_target(&self, coll: &KaminoReserve, debt: &KaminoReserve) -> Option<u8> {
        let current = self.current_elevation_group();
        self.options
            .elevation_group_override
            .or_else(|| self.market.best_group_for_switch(current, coll, debt))
            .filter(|group| *group != current)
    }

    fn record_group_update(&mut self, group: u8) {
        if let Some(obligation) = self.obligation.as_mut() {
            obligation.refreshed_stats.potential_elevation_group_update = group;
        }
    }

    // ---------------------------------------------------------------------
    // Primary operations
    // ---------------------------------------------------------------------

    fn push_deposit(&mut self, reserve: &KaminoReserve, amount: u64) -> Result<()> {
        let source = self.liquidity_leg(reserve, Some(amount));
        let ix = instructions::deposit_reserve_liquidity_and_obligation_collateral(
            &self.owner,
            &self.obligation_address,
            &self.market_accounts()?,
            &reserve_accounts(reserve),
            &source,
            amount,
            &self.market.program_id,
        );
        self.log
            .push(Phase::Lending, ix, format!("deposit[{}:{}]", reserve.symbol(), amount));
        Ok(())
    }

    fn push_borrow(&mut self, reserve: &KaminoReserve, amount: u64, deposit_reserves: &[Pubkey]) -> Result<()> {
        let destination = self.liquidity_leg(reserve, None);
        let referrer_state = self.referrer_token_state(&reserve.address)?;
        let ix = instructions::borrow_obligation_liquidity(
            &self.owner,
            &self.obligation_address,
            &self.market_accounts()?,
            &reserve_accounts(reserve),
            &destination,
            referrer_state,
            deposit_reserves,
            amount,
            &self.market.program_id,
        );
        self.log
            .push(Phase::Lending, ix, format!("borrow[{}:{}]", reserve.symbol(), amount));
        Ok(())
    }

    fn push_repay(&mut self, reserve: &KaminoReserve, amount: u64, deposit_reserves: &[Pubkey]) -> Result<()> {
        let send = self.repay_send_amount(reserve, amount)?;
        let source = self.liquidity_leg(reserve, Some(send));
        let ix = instructions::repay_obligation_liquidity(
            &self.owner,
            &self.obligation_address,
            &self.market.address,
            &reserve_accounts(reserve),
            &source,
            deposit_reserves,
            amount,
            &self.market.program_id,
        );
        self.log
            .push(Phase::Lending, ix, format!("repay[{}:{}]", reserve.symbol(), amount));
        Ok(())
    }

    fn push_withdraw(&mut self, reserve: &KaminoReserve, amount: u64) -> Result<()> {
        let collateral_amount = reserve.liquidity_to_collateral(amount, self.slot, self.referral_fee_bps())?;
        let destination = self.liquidity_leg(reserve, None);
        let ix = instructions::withdraw_obligation_collateral_and_redeem_reserve_collateral(
            &self.owner,
            &self.obligation_address,
            &self.market_accounts()?,
            &reserve_accounts(reserve),
            &destination,
            collateral_amount,
            &self.market.program_id,
        );
        self.log
            .push(Phase::Lending, ix, format!("withdraw[{}:{}]", reserve.symbol(), collateral_amount));
        Ok(())
    }

    async fn finish(mut self) -> Result<ActionPlan> {
        if self.options.extra_compute_budget > 0 {
            let units = self.options.extra_compute_budget;
            self.log.push(
                Phase::ComputeBudget,
                ComputeBudgetInstruction::set_compute_unit_limit(units),
                format!("computeBudget[{}]", units),
            );
        }

        let referrer_inits = std::mem::take(&mut self.referrer_inits);
        if !referrer_inits.is_empty() {
            self.log.prepend_setup(referrer_inits);
        }

        if self.options.include_ata_ops {
            let mut front = missing_ata_instructions(self.ledger, &self.payer, &self.ata_requests).await?;
            if self.wsol_send > 0 || self.wsol_receive {
                let wrap = wsol_wrap(
                    self.ledger,
                    &self.owner,
                    self.wsol_send,
                    self.wsol_receive,
                    self.options.wsol_rent_exempt_lamports,
                )
                .await?;
                front.extend(wrap.pre);
                for (ix, label) in wrap.post {
                    self.log.push(Phase::Cleanup, ix, label);
                }
            }
            if !front.is_empty() {
                self.log.prepend_setup(front);
            }
        }

        let plan = self.log.finish(self.kind, self.owner, self.obligation_address);
        log::info!(
            "ActionPlan: built {} with {} operations for obligation {}",
            plan.kind,
            plan.len(),
            plan.obligation
        );
        Ok(plan)
    }
}

impl ActionPlan {
    /// Deposit liquidity into an obligation, creating it if needed.
    pub async fn deposit(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Deposit, owner, Some(obligation.into()), options).await?;
        b.check_position_limit(&[reserve.address], &[])?;
        b.push_bootstrap()?;

        let touched = [reserve.address];
        b.push_support_pass(Phase::Setup, &touched, &[], &[(reserve, ReserveFarmKind::Collateral)], &[])
            .await?;
        if let Some(group) = b.options.elevation_group_override {
            if group != b.current_elevation_group() {
                b.push_request_elevation_group(Phase::Setup, group, &[], &[])?;
                b.push_refresh_after_switch(Phase::Setup, &touched, &[])?;
            }
        }
        b.push_farm_refresh(Phase::Setup, None, reserve, ReserveFarmKind::Collateral)?;

        b.push_deposit(reserve, leg.amount)?;
        b.finish().await
    }

    /// Deposit cTokens already held by the owner.
    pub async fn deposit_collateral(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b =
            ActionBuilder::new(ledger, market, ActionKind::DepositCollateral, owner, Some(obligation.into()), options)
                .await?;
        b.check_position_limit(&[reserve.address], &[])?;
        b.push_bootstrap()?;
        b.push_support_pass(Phase::Setup, &[reserve.address], &[], &[(reserve, ReserveFarmKind::Collateral)], &[])
            .await?;
        b.push_farm_refresh(Phase::Setup, None, reserve, ReserveFarmKind::Collateral)?;

        let source = b.collateral_account(reserve, false);
        let ix = instructions::deposit_obligation_collateral(
            &b.owner,
            &b.obligation_address,
            &market.address,
            &reserve_accounts(reserve),
            &source,
            leg.amount,
            &market.program_id,
        );
        b.log
            .push(Phase::Lending, ix, format!("depositCollateral[{}:{}]", reserve.symbol(), leg.amount));
        b.finish().await
    }

    pub async fn borrow(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Borrow, owner, Some(obligation.into()), options).await?;
        b.require_obligation()?;
        b.check_position_limit(&[], &[reserve.address])?;
        b.push_bootstrap()?;

        let touched = [reserve.address];
        b.push_support_pass(Phase::Setup, &touched, &[], &[(reserve, ReserveFarmKind::Debt)], &[])
            .await?;
        if b.wants_elevation_group() {
            let target = match b.options.elevation_group_override {
                Some(group) => Some(group).filter(|g| *g != b.current_elevation_group()),
                None => {
                    let coll_address = b
                        .require_obligation()?
                        .deposits
                        .first()
                        .map(|p| p.reserve_address)
                        .ok_or_else(|| Error::validation("No deposit reserve found in obligation, cannot borrow against it"))?;
                    let coll = market.existing_reserve(&coll_address)?;
                    b.borrow_group_target(coll, reserve)
                }
            };
            if let Some(group) = target {
                b.push_request_elevation_group(Phase::Setup, group, &[], &[])?;
                b.push_refresh_after_switch(Phase::Setup, &touched, &[])?;
                b.record_group_update(group);
            }
        }
        b.queue_referrer_state_init(reserve).await?;
        b.push_farm_refresh(Phase::Setup, None, reserve, ReserveFarmKind::Debt)?;

        let deposit_reserves = if b.current_elevation_group() > 0 || b.potential_elevation_group_update() > 0 {
            b.deposit_reserves()
        } else {
            Vec::new()
        };
        b.push_borrow(reserve, leg.amount, &deposit_reserves)?;
        b.finish().await
    }

    /// `leg.amount` is in liquidity units; `U64_MAX` withdraws everything.
    pub async fn withdraw(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Withdraw, owner, Some(obligation.into()), options).await?;
        b.require_obligation()?;
        b.check_position_limit(&[], &[])?;
        b.push_bootstrap()?;

        b.push_support_pass(Phase::Setup, &[reserve.address], &[], &[(reserve, ReserveFarmKind::Collateral)], &[])
            .await?;
        b.push_farm_refresh(Phase::Setup, None, reserve, ReserveFarmKind::Collateral)?;

        b.push_withdraw(reserve, leg.amount)?;

        // Closing the position: the reserve is gone from the obligation by then.
        if let Some(group) = b.options.elevation_group_override {
            let skip = if leg.amount == constants::U64_MAX { vec![reserve.address] } else { Vec::new() };
            b.push_refresh_obligation(Phase::Cleanup, &[], &skip)?;
            b.push_request_elevation_group(Phase::Cleanup, group, &[], &skip)?;
        }
        b.finish().await
    }

    /// `U64_MAX` repays the whole borrow.
    pub async fn repay(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Repay, owner, Some(obligation.into()), options).await?;
        b.require_obligation()?;
        b.check_position_limit(&[], &[])?;
        let full_repay = b.is_full_repay(reserve, leg.amount)?;
        b.push_bootstrap()?;

        let touched = [reserve.address];
        b.push_support_pass(Phase::Setup, &touched, &[], &[(reserve, ReserveFarmKind::Debt)], &[])
            .await?;

        // Repaying the only debt of a grouped obligation: leave the group once
        // the borrow is gone.
        let single_borrow = b.obligation.as_ref().map_or(false, |o| o.borrows.len() == 1);
        if b.wants_elevation_group() && full_repay && single_borrow && b.current_elevation_group() != 0 {
            let untouched = b.untouched_reserves(&touched, &[]);
            b.push_refresh_reserves(Phase::Cleanup, &untouched)?;
            b.push_refresh_obligation(Phase::Cleanup, &[], &touched)?;
            let group = b.options.elevation_group_override.unwrap_or(0);
            b.push_request_elevation_group(Phase::Cleanup, group, &[], &touched)?;
        }
        b.push_farm_refresh(Phase::Setup, None, reserve, ReserveFarmKind::Debt)?;

        let deposit_reserves = if b.current_elevation_group() > 0 {
            b.deposit_reserves()
        } else {
            Vec::new()
        };
        b.push_repay(reserve, leg.amount, &deposit_reserves)?;
        b.finish().await
    }

    /// Deposit `deposit`, then borrow `borrow` against it in the same batch.
    pub async fn deposit_and_borrow(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        deposit: TokenLeg,
        borrow: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let coll = market.existing_reserve_by_mint(&deposit.mint)?;
        let debt = market.existing_reserve_by_mint(&borrow.mint)?;
        let mut b =
            ActionBuilder::new(ledger, market, ActionKind::DepositAndBorrow, owner, Some(obligation.into()), options)
                .await?;
        b.check_position_limit(&[coll.address], &[debt.address])?;
        b.push_bootstrap()?;

        b.push_support_pass(Phase::Setup, &[coll.address], &[], &[(coll, ReserveFarmKind::Collateral)], &[])
            .await?;
        b.push_farm_refresh(Phase::Setup, Some(Phase::InBetween), coll, ReserveFarmKind::Collateral)?;
        b.push_deposit(coll, deposit.amount)?;

        let already_deposited = b.obligation.as_ref().map_or(false, |o| o.deposit_by_reserve(&coll.address).is_some());
        let preloaded = if already_deposited { Vec::new() } else { vec![coll.address] };
        let touched = [debt.address];
        b.push_support_pass(Phase::InBetween, &touched, &preloaded, &[(debt, ReserveFarmKind::Debt)], &[])
            .await?;
        if b.wants_elevation_group() {
            if let Some(group) = b.borrow_group_target(coll, debt) {
                b.push_request_elevation_group(Phase::InBetween, group, &preloaded, &[])?;
                b.push_refresh_after_switch(Phase::InBetween, &touched, &preloaded)?;
                b.record_group_update(group);
            }
        }
        b.queue_referrer_state_init(debt).await?;
        b.push_farm_refresh(Phase::InBetween, None, debt, ReserveFarmKind::Debt)?;

        let mut deposit_reserves = b.deposit_reserves();
        for reserve in &preloaded {
            push_unique(&mut deposit_reserves, *reserve);
        }
        b.push_borrow(debt, borrow.amount, &deposit_reserves)?;
        b.finish().await
    }

    /// Repay `repay`, then withdraw `withdraw` (liquidity units) in the same
    /// batch.
    pub async fn repay_and_withdraw(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        repay: TokenLeg,
        withdraw: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let debt = market.existing_reserve_by_mint(&repay.mint)?;
        let coll = market.existing_reserve_by_mint(&withdraw.mint)?;
        let mut b =
            ActionBuilder::new(ledger, market, ActionKind::RepayAndWithdraw, owner, Some(obligation.into()), options)
                .await?;
        b.require_obligation()?;
        b.check_position_limit(&[], &[])?;
        let full_repay = b.is_full_repay(debt, repay.amount)?;
        b.push_bootstrap()?;

        b.push_support_pass(Phase::Setup, &[debt.address], &[], &[(debt, ReserveFarmKind::Debt)], &[])
            .await?;
        b.push_farm_refresh(Phase::Setup, Some(Phase::InBetween), debt, ReserveFarmKind::Debt)?;
        let deposit_reserves = b.deposit_reserves();
        b.push_repay(debt, repay.amount, &deposit_reserves)?;

        let repaid = if full_repay { vec![debt.address] } else { Vec::new() };
        b.push_support_pass(Phase::InBetween, &[coll.address], &[], &[(coll, ReserveFarmKind::Collateral)], &repaid)
            .await?;
        b.push_farm_refresh(Phase::InBetween, None, coll, ReserveFarmKind::Collateral)?;
        b.push_withdraw(coll, withdraw.amount)?;
        b.finish().await
    }

    /// Repay `repay` of someone else's debt and seize collateral from the
    /// `withdraw_mint` reserve, receiving at least `min_received`.
    #[allow(clippy::too_many_arguments)]
    pub async fn liquidate(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        liquidator: Pubkey,
        obligation: &KaminoObligation,
        repay: TokenLeg,
        withdraw_mint: Pubkey,
        min_received: u64,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let debt = market.existing_reserve_by_mint(&repay.mint)?;
        let coll = market.existing_reserve_by_mint(&withdraw_mint)?;
        let source = ObligationSource::Loaded(Box::new(obligation.clone()));
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Liquidate, liquidator, Some(source), options).await?;

        let touched = if coll.address != debt.address {
            vec![coll.address, debt.address]
        } else {
            vec![debt.address]
        };
        b.push_support_pass(
            Phase::Setup,
            &touched,
            &[],
            &[(debt, ReserveFarmKind::Debt), (coll, ReserveFarmKind::Collateral)],
            &[],
        )
        .await?;
        b.push_farm_refresh(Phase::Setup, None, coll, ReserveFarmKind::Collateral)?;
        b.push_farm_refresh(Phase::Setup, None, debt, ReserveFarmKind::Debt)?;

        let send = b.repay_send_amount(debt, repay.amount)?;
        let user_source_liquidity = b.liquidity_leg(debt, Some(send));
        let user_destination_collateral = b.collateral_account(coll, true);
        let user_destination_liquidity = b.liquidity_leg(coll, None);
        let accounts = LiquidateAccounts {
            liquidator,
            obligation: b.obligation_address,
            market: b.market_accounts()?,
            repay_reserve: reserve_accounts(debt),
            withdraw_reserve: reserve_accounts(coll),
            user_source_liquidity,
            user_destination_collateral,
            user_destination_liquidity,
        };
        let deposit_reserves = if b.current_elevation_group() > 0 {
            b.deposit_reserves()
        } else {
            Vec::new()
        };
        let ix = instructions::liquidate_obligation_and_redeem_reserve_collateral(
            &accounts,
            &deposit_reserves,
            repay.amount,
            min_received,
            b.options.max_allowed_ltv_override_pct,
            &market.program_id,
        );
        b.log.push(
            Phase::Lending,
            ix,
            format!("liquidate[{}->{}:{}]", debt.symbol(), coll.symbol(), repay.amount),
        );
        b.finish().await
    }

    /// Refresh every reserve of the obligation, its farms, then the
    /// obligation itself. No lending operation.
    pub async fn refresh_obligation(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let mut b =
            ActionBuilder::new(ledger, market, ActionKind::RefreshObligation, owner, Some(obligation.into()), options)
                .await?;
        b.push_full_refresh()?;
        b.finish().await
    }

    pub async fn request_elevation_group(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        obligation: impl Into<ObligationSource>,
        group: u8,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let mut b = ActionBuilder::new(
            ledger,
            market,
            ActionKind::RequestElevationGroup,
            owner,
            Some(obligation.into()),
            options,
        )
        .await?;
        b.push_full_refresh()?;
        b.push_request_elevation_group(Phase::Setup, group, &[], &[])?;
        b.finish().await
    }

    /// Sweep the referral fees `owner` earned on the `mint` reserve.
    pub async fn withdraw_referrer_fees(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        mint: Pubkey,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::WithdrawReferrerFees, owner, None, options).await?;
        b.push_refresh_reserves(Phase::Setup, &[reserve.address])?;

        let referrer_state = derive_referrer_token_state(&owner, &reserve.address, &market.program_id)?;
        let destination = b.liquidity_leg(reserve, None);
        let ix = instructions::withdraw_referrer_fees(
            &owner,
            &referrer_state,
            &reserve_accounts(reserve),
            &destination,
            &b.market_accounts()?,
            &market.program_id,
        );
        b.log
            .push(Phase::Lending, ix, format!("withdrawReferrerFees[{}]", reserve.symbol()));
        b.finish().await
    }

    /// Deposit reserve liquidity for cTokens, outside any obligation.
    pub async fn mint(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Mint, owner, None, options).await?;
        b.push_refresh_reserves(Phase::Setup, &[reserve.address])?;

        let source = b.liquidity_leg(reserve, Some(leg.amount));
        let destination = b.collateral_account(reserve, true);
        let ix = instructions::deposit_reserve_liquidity(
            &owner,
            &b.market_accounts()?,
            &reserve_accounts(reserve),
            &source,
            &destination,
            leg.amount,
            &market.program_id,
        );
        b.log
            .push(Phase::Lending, ix, format!("mint[{}:{}]", reserve.symbol(), leg.amount));
        b.finish().await
    }

    /// Redeem `leg.amount` cTokens of the `leg.mint` reserve for liquidity.
    pub async fn redeem(
        ledger: &dyn LedgerReader,
        market: &KaminoMarket,
        owner: Pubkey,
        leg: TokenLeg,
        options: ActionOptions,
    ) -> Result<ActionPlan> {
        let reserve = market.existing_reserve_by_mint(&leg.mint)?;
        let mut b = ActionBuilder::new(ledger, market, ActionKind::Redeem, owner, None, options).await?;
        b.push_refresh_reserves(Phase::Setup, &[reserve.address])?;

        let source = b.collateral_account(reserve, false);
        let destination = b.liquidity_leg(reserve, None);
        let ix = instructions::redeem_reserve_collateral(
            &owner,
            &b.market_accounts()?,
            &reserve_accounts(reserve),
            &source,
            &destination,
            leg.amount,
            &market.program_id,
        );
        b.log
            .push(Phase::Lending, ix, format!("redeem[{}:{}]", reserve.symbol(), leg.amount));
        b.finish().await
    }
}

impl<'a> ActionBuilder<'a> {
    /// Every obligation reserve, the farms they carry, then the obligation.
    fn push_full_refresh(&mut self) -> Result<()> {
        let obligation = self.require_obligation()?;
        let deposits = obligation.deposit_reserves();
        let borrows = obligation.borrow_reserves();

        let all = self.untouched_reserves(&[], &[]);
        self.push_refresh_reserves(Phase::Setup, &all)?;

        let market = self.market;
        let sides = deposits
            .iter()
            .map(|r| (r, ReserveFarmKind::Collateral))
            .chain(borrows.iter().map(|r| (r, ReserveFarmKind::Debt)));
        for (address, kind) in sides {
            let reserve = market.existing_reserve(address)?;
            if let Some((ix, label)) = self.farm_refresh(reserve, kind)? {
                self.log.push(Phase::Setup, ix, label);
            }
        }
        self.push_refresh_obligation(Phase::Setup, &[], &[])
    }
}

/// Update instruction for one standing-order slot; an empty slot clears it.
pub fn set_obligation_order_ix(
    owner: &Pubkey,
    market: &KaminoMarket,
    obligation: &KaminoObligation,
    order: &ObligationOrderAtIndex,
) -> Result<Instruction> {
    let state = order.order_state()?;
    instructions::set_obligation_order(
        owner,
        &obligation.address,
        &market.address,
        order.index,
        &state,
        &market.program_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::rpc_client::InMemoryLedger;
    use crate::core::registry::MintAddresses;
    use crate::core::types::PriceQuote;
    use crate::engine::market::fixtures::{market_state, set_group};
    use crate::engine::obligation::fixtures::{add_borrow, add_deposit, obligation_state};
    use crate::engine::reserve::fixtures::reserve_state;

    struct Fixture {
        market: KaminoMarket,
        owner: Pubkey,
        sol: KaminoReserve,
        usdc: KaminoReserve,
        jitosol: KaminoReserve,
    }

    fn named_reserve(market: Pubkey, mint: Pubkey, name: &str, groups: &[u8]) -> KaminoReserve {
        let mut state = reserve_state(mint, 1_000_000_000_000, 0, 100);
        state.lending_market = market;
        state.config.token_info.name[..name.len()].copy_from_slice(name.as_bytes());
        for (i, g) in groups.iter().enumerate() {
            state.config.elevation_groups[i] = *g;
            state.config.borrow_limit_against_this_collateral_in_elevation_group[(*g - 1) as usize] = u64::MAX;
        }
        KaminoReserve::new(Pubkey::new_unique(), state, PriceQuote::new(Decimal::ONE), 500).unwrap()
    }

    fn fixture() -> Fixture {
        let address = Pubkey::new_unique();
        let sol = named_reserve(address, MintAddresses::wsol().unwrap(), "SOL", &[1]);
        let usdc = named_reserve(address, Pubkey::new_unique(), "USDC", &[]);
        let jitosol = named_reserve(address, Pubkey::new_unique(), "JITOSOL", &[1]);
        let mut state = market_state();
        set_group(&mut state, 1, 90, 92, sol.address);
        let market = KaminoMarket::new(
            address,
            state,
            vec![sol.clone(), usdc.clone(), jitosol.clone()],
            ProgramIds::klend().unwrap(),
            500,
        );
        Fixture {
            market,
            owner: Pubkey::new_unique(),
            sol,
            usdc,
            jitosol,
        }
    }

    fn obligation(f: &Fixture, deposits: &[(Pubkey, u64)], borrows: &[(Pubkey, u64)], group: u8) -> KaminoObligation {
        let mut state = obligation_state(f.market.address, f.owner);
        state.elevation_group = group;
        for (reserve, amount) in deposits {
            add_deposit(&mut state, *reserve, *amount);
        }
        for (reserve, amount) in borrows {
            add_borrow(&mut state, *reserve, *amount);
        }
        let rates = KaminoObligation::rates_for_obligation(&f.market, &state, 100, &[]).unwrap();
        KaminoObligation::new(&f.market, Pubkey::new_unique(), state, &rates).unwrap()
    }

    fn options() -> ActionOptions {
        ActionOptions {
            include_ata_ops: false,
            extra_compute_budget: 0,
            ..ActionOptions::default()
        }
        .at_slot(100)
    }

    #[tokio::test]
    async fn test_deposit_on_new_obligation_bootstraps_accounts() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let plan = ActionPlan::deposit(
            &ledger,
            &f.market,
            f.owner,
            ObligationType::vanilla(),
            TokenLeg::new(f.usdc.liquidity_mint(), 1_000),
            options(),
        )
        .await
        .unwrap();

        let labels = plan.labels();
        assert_eq!(labels[0], "initUserMetadata");
        assert!(labels[1].starts_with("initObligation"));
        assert_eq!(labels[2], "refreshReserve[USDC]");
        assert_eq!(labels[3], "refreshObligation");
        assert_eq!(labels[4], "deposit[USDC:1000]");
        assert_eq!(plan.len(), 5);
    }

    #[tokio::test]
    async fn test_borrow_requires_existing_obligation() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let err = ActionPlan::borrow(
            &ledger,
            &f.market,
            f.owner,
            ObligationType::vanilla(),
            TokenLeg::new(f.usdc.liquidity_mint(), 1_000),
            options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::State(_))));
    }

    #[tokio::test]
    async fn test_borrow_switches_to_best_group_and_passes_deposits() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.jitosol.address, 1_000_000)], &[], 0);
        let mut opts = options();
        opts.request_elevation_group = true;

        let plan = ActionPlan::borrow(&ledger, &f.market, f.owner, o, TokenLeg::new(f.sol.liquidity_mint(), 500), opts)
            .await
            .unwrap();

        let labels = plan.labels();
        let request = labels.iter().position(|l| *l == "requestElevationGroup[1]").unwrap();
        assert!(labels[request + 1..].contains(&"refreshObligation"), "Freshness re-established after the switch");

        let borrow = plan.in_phase(Phase::Lending).next().unwrap();
        assert!(
            borrow.instruction.accounts.iter().any(|a| a.pubkey == f.jitosol.address),
            "Deposit reserves ride along once a group is pending"
        );
    }

    #[tokio::test]
    async fn test_position_limit_counts_shared_reserves_once() {
        let address = Pubkey::new_unique();
        let reserves: Vec<KaminoReserve> = (0..11)
            .map(|i| named_reserve(address, Pubkey::new_unique(), &format!("R{}", i), &[]))
            .collect();
        let market = KaminoMarket::new(address, market_state(), reserves.clone(), ProgramIds::klend().unwrap(), 500);
        let owner = Pubkey::new_unique();

        let mut state = obligation_state(address, owner);
        for reserve in &reserves[..8] {
            add_deposit(&mut state, reserve.address, 1_000_000);
        }
        add_borrow(&mut state, reserves[0].address, 1_000);
        add_borrow(&mut state, reserves[8].address, 1_000);
        let rates = KaminoObligation::rates_for_obligation(&market, &state, 100, &[]).unwrap();
        let o = KaminoObligation::new(&market, Pubkey::new_unique(), state, &rates).unwrap();

        let ledger = InMemoryLedger::new(100);
        let b = ActionBuilder::new(&ledger, &market, ActionKind::Borrow, owner, Some(o.into()), options())
            .await
            .unwrap();

        // R0..R9 is ten distinct reserves even though the flat count is eleven.
        b.check_position_limit(&[], &[reserves[9].address]).unwrap();

        let err = b.check_position_limit(&[], &[reserves[9].address, reserves[10].address]).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_withdraw_all_passes_sentinel() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.usdc.address, 1_000)], &[], 0);
        let plan = ActionPlan::withdraw(&ledger, &f.market, f.owner, o, TokenLeg::all(f.usdc.liquidity_mint()), options())
            .await
            .unwrap();
        let withdraw = plan.in_phase(Phase::Lending).next().unwrap();
        assert_eq!(withdraw.label, format!("withdraw[USDC:{}]", u64::MAX));
        assert_eq!(&withdraw.instruction.data[8..16], &u64::MAX.to_le_bytes());
    }

    #[tokio::test]
    async fn test_full_repay_of_single_grouped_borrow_leaves_group_in_cleanup() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.jitosol.address, 1_000_000)], &[(f.sol.address, 500)], 1);
        let mut opts = options();
        opts.request_elevation_group = true;

        let plan = ActionPlan::repay(&ledger, &f.market, f.owner, o, TokenLeg::all(f.sol.liquidity_mint()), opts)
            .await
            .unwrap();

        let cleanup: Vec<&str> = plan.in_phase(Phase::Cleanup).map(|op| op.label.as_str()).collect();
        assert_eq!(
            cleanup,
            vec!["refreshReserve[JITOSOL]", "refreshObligation", "requestElevationGroup[0]"]
        );
        let refresh = plan.in_phase(Phase::Cleanup).nth(1).unwrap();
        assert!(
            !refresh.instruction.accounts.iter().any(|a| a.pubkey == f.sol.address),
            "Repaid reserve is skipped"
        );
    }

    #[tokio::test]
    async fn test_repay_unknown_borrow_is_state_error() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.jitosol.address, 1_000_000)], &[], 0);
        let err = ActionPlan::repay(&ledger, &f.market, f.owner, o, TokenLeg::new(f.usdc.liquidity_mint(), 10), options())
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::State(_))));
    }

    #[tokio::test]
    async fn test_repay_all_wraps_projected_debt_plus_padding() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.usdc.address, 1_000_000)], &[(f.sol.address, 500)], 0);
        let mut opts = options();
        opts.include_ata_ops = true;

        let plan = ActionPlan::repay(&ledger, &f.market, f.owner, o, TokenLeg::all(f.sol.liquidity_mint()), opts)
            .await
            .unwrap();
        let expected = format!(
            "wrapSol[{}]",
            constants::DEFAULT_TOKEN_ACCOUNT_RENT_LAMPORTS + 500 + constants::SOL_PADDING_FOR_INTEREST
        );
        assert!(plan.labels().contains(&expected.as_str()), "labels: {:?}", plan.labels());
        assert_eq!(plan.labels().last(), Some(&"unwrapSol"));
    }

    #[tokio::test]
    async fn test_refresh_obligation_refreshes_all_then_obligation() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let o = obligation(&f, &[(f.jitosol.address, 1_000), (f.usdc.address, 1_000)], &[(f.sol.address, 10)], 0);
        let plan = ActionPlan::refresh_obligation(&ledger, &f.market, f.owner, o, options())
            .await
            .unwrap();
        assert_eq!(
            plan.labels(),
            vec![
                "refreshReserve[JITOSOL]",
                "refreshReserve[USDC]",
                "refreshReserve[SOL]",
                "refreshObligation"
            ]
        );
    }

    #[tokio::test]
    async fn test_compute_budget_leads_plan() {
        let f = fixture();
        let ledger = InMemoryLedger::new(100);
        let mut opts = options();
        opts.extra_compute_budget = 400_000;
        let plan = ActionPlan::mint(&ledger, &f.market, f.owner, TokenLeg::new(f.usdc.liquidity_mint(), 5), opts)
            .await
            .unwrap();
        assert_eq!(plan.labels(), vec!["computeBudget[400000]", "refreshReserve[USDC]", "mint[USDC:5]"]);
        assert_eq!(plan.obligation, Pubkey::default());
    }

    #[test]
    fn test_referrer_resolution_order() {
        let explicit = Pubkey::new_unique();
        let mut metadata = UserMetadata::zeroed().unwrap();
        metadata.referrer = Pubkey::new_unique();

        assert_eq!(resolve_referrer(Some(explicit), None, Some(&metadata)), Some(explicit));
        assert_eq!(resolve_referrer(Some(Pubkey::default()), None, Some(&metadata)), Some(metadata.referrer));
        assert_eq!(resolve_referrer(None, None, None), None);
    }
}
