//! Support operations around the lending instructions: account bootstrap,
//! reserve and obligation freshness, elevation group requests and farm
//! accounting.

use anyhow::Result;
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};

use super::builder::ActionBuilder;
use super::plan::Phase;
use crate::core::types::ReserveFarmKind;
use crate::engine::reserve::KaminoReserve;
use crate::protocol::kamino::accounts::{
    derive_obligation_farm_state, derive_referrer_token_state, derive_user_metadata_address,
};
use crate::protocol::kamino::instructions::{
    self, InitObligationAccounts, MarketAccounts, ObligationFarmAccounts, RefreshReserveAccounts, ReserveAccounts,
};

pub fn reserve_accounts(reserve: &KaminoReserve) -> ReserveAccounts {
    let state = reserve.state();
    ReserveAccounts {
        reserve: reserve.address,
        liquidity_mint: state.liquidity.mint_pubkey,
        liquidity_supply: state.liquidity.supply_vault,
        fee_vault: state.liquidity.fee_vault,
        collateral_mint: state.collateral.mint_pubkey,
        collateral_supply: state.collateral.supply_vault,
        liquidity_token_program: reserve.liquidity_token_program(),
    }
}

fn configured(key: Pubkey) -> Option<Pubkey> {
    if key == Pubkey::default() {
        None
    } else {
        Some(key)
    }
}

/// Oracle accounts come from the reserve's token info; unset ones are
/// replaced by the program id in the encoder.
pub fn refresh_reserve_accounts(reserve: &KaminoReserve) -> RefreshReserveAccounts {
    let state = reserve.state();
    let token_info = &state.config.token_info;
    RefreshReserveAccounts {
        reserve: reserve.address,
        lending_market: state.lending_market,
        pyth_oracle: configured(token_info.pyth_configuration.price),
        switchboard_price_oracle: configured(token_info.switchboard_configuration.price_aggregator),
        switchboard_twap_oracle: configured(token_info.switchboard_configuration.twap_aggregator),
        scope_prices: configured(token_info.scope_configuration.price_feed),
    }
}

fn push_unique(items: &mut Vec<Pubkey>, item: Pubkey) {
    if !items.contains(&item) {
        items.push(item);
    }
}

impl<'a> ActionBuilder<'a> {
    pub(super) fn market_accounts(&self) -> Result<MarketAccounts> {
        Ok(MarketAccounts {
            lending_market: self.market.address,
            lending_market_authority: self.market.lending_market_authority()?,
        })
    }

    fn program_id(&self) -> Pubkey {
        self.market.program_id
    }

    // ---------------------------------------------------------------------
    // Account bootstrap
    // ---------------------------------------------------------------------

    /// User profile and obligation creation, each only when missing.
    pub(super) fn push_bootstrap(&mut self) -> Result<()> {
        let program_id = self.program_id();
        if !self.user_metadata_exists && !self.options.skip_user_metadata_init {
            let referrer_metadata = match self.referrer {
                Some(referrer) => Some(derive_user_metadata_address(&referrer, &program_id)?),
                None => None,
            };
            let ix = instructions::init_user_metadata(
                &self.owner,
                &self.payer,
                &self.user_metadata,
                referrer_metadata,
                &self.options.user_lookup_table,
                &program_id,
            );
            self.log.push(Phase::Setup, ix, "initUserMetadata");
        }

        if self.obligation.is_none() {
            let (seed1, seed2) = self.obligation_type.seeds();
            let accounts = InitObligationAccounts {
                obligation_owner: self.owner,
                fee_payer: self.payer,
                obligation: self.obligation_address,
                lending_market: self.market.address,
                seed1,
                seed2,
                owner_user_metadata: self.user_metadata,
            };
            let ix = instructions::init_obligation(
                &accounts,
                self.obligation_type.tag(),
                self.obligation_type.id(),
                &program_id,
            );
            self.log
                .push(Phase::Setup, ix, format!("initObligation[{}]", self.obligation_address));
        }
        Ok(())
    }

    pub(super) fn referrer_token_state(&self, reserve: &Pubkey) -> Result<Option<Pubkey>> {
        match self.referrer {
            Some(referrer) => Ok(Some(derive_referrer_token_state(&referrer, reserve, &self.program_id())?)),
            None => Ok(None),
        }
    }

    /// Queues creation of the referrer's fee account for `reserve` when a
    /// referrer is set and the account is missing. Lands ahead of setup.
    pub(super) async fn queue_referrer_state_init(&mut self, reserve: &KaminoReserve) -> Result<()> {
        let (Some(referrer), Some(state)) = (self.referrer, self.referrer_token_state(&reserve.address)?) else {
            return Ok(());
        };
        if self.ledger.account_exists(&state).await? {
            return Ok(());
        }
        let ix = instructions::init_referrer_token_state(
            &self.payer,
            &self.market.address,
            &reserve.address,
            &referrer,
            &state,
            &self.program_id(),
        );
        self.referrer_inits
            .push((ix, format!("initReferrerTokenState[{}]", reserve.symbol())));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Freshness
    // ---------------------------------------------------------------------

    /// Reserves the obligation references (plus deposits made earlier in this
    /// plan), minus `touched`, in deposit-then-borrow order.
    pub(super) fn untouched_reserves(&self, touched: &[Pubkey], preloaded_deposits: &[Pubkey]) -> Vec<Pubkey> {
        let mut all = Vec::new();
        if let Some(obligation) = &self.obligation {
            for reserve in obligation.deposit_reserves() {
                push_unique(&mut all, reserve);
            }
        }
        for reserve in preloaded_deposits {
            push_unique(&mut all, *reserve);
        }
        if let Some(obligation) = &self.obligation {
            for reserve in obligation.borrow_reserves() {
                push_unique(&mut all, reserve);
            }
        }
        all.retain(|r| !touched.contains(r));
        all
    }

    pub(super) fn push_refresh_reserves(&mut self, phase: Phase, reserves: &[Pubkey]) -> Result<()> {
        let program_id = self.program_id();
        let market = self.market;
        for address in reserves {
            let reserve = market.existing_reserve(address)?;
            let ix = instructions::refresh_reserve(&refresh_reserve_accounts(reserve), &program_id);
            self.log.push(phase, ix, format!("refreshReserve[{}]", reserve.symbol()));
        }
        Ok(())
    }

    /// Remaining accounts for obligation refresh and group requests: deposit
    /// reserves and borrow reserves not in `skip`, then the referrer token
    /// states of those borrows.
    fn obligation_remaining_accounts(
        &self,
        preloaded_deposits: &[Pubkey],
        skip: &[Pubkey],
        referrer_states_writable: bool,
    ) -> Result<Vec<AccountMeta>> {
        let mut deposits = Vec::new();
        let mut borrows = Vec::new();
        if let Some(obligation) = &self.obligation {
            for reserve in obligation.deposit_reserves() {
                push_unique(&mut deposits, reserve);
            }
            for reserve in obligation.borrow_reserves() {
                push_unique(&mut borrows, reserve);
            }
        }
        for reserve in preloaded_deposits {
            push_unique(&mut deposits, *reserve);
        }
        deposits.retain(|r| !skip.contains(r));
        borrows.retain(|r| !skip.contains(r));

        let mut remaining: Vec<AccountMeta> = deposits
            .iter()
            .chain(borrows.iter())
            .map(|key| AccountMeta::new(*key, false))
            .collect();
        for reserve in &borrows {
            if let Some(state) = self.referrer_token_state(reserve)? {
                remaining.push(if referrer_states_writable {
                    AccountMeta::new(state, false)
                } else {
                    AccountMeta::new_readonly(state, false)
                });
            }
        }
        Ok(remaining)
    }

    pub(super) fn push_refresh_obligation(
        &mut self,
        phase: Phase,
        preloaded_deposits: &[Pubkey],
        skip: &[Pubkey],
    ) -> Result<()> {
        let remaining = self.obligation_remaining_accounts(preloaded_deposits, skip, true)?;
        let ix = instructions::refresh_obligation(
            &self.market.address,
            &self.obligation_address,
            remaining,
            &self.program_id(),
        );
        self.log.push(phase, ix, "refreshObligation");
        Ok(())
    }

    /// Untouched reserves, touched reserves, farm participation for this leg,
    /// then the obligation.
    pub(super) async fn push_support_pass(
        &mut self,
        phase: Phase,
        touched: &[Pubkey],
        preloaded_deposits: &[Pubkey],
        farms: &[(&'a KaminoReserve, ReserveFarmKind)],
        skip: &[Pubkey],
    ) -> Result<()> {
        let untouched = self.untouched_reserves(touched, preloaded_deposits);
        self.push_refresh_reserves(phase, &untouched)?;
        self.push_refresh_reserves(phase, touched)?;
        for (reserve, kind) in farms {
            self.push_init_farm(phase, reserve, *kind).await?;
        }
        self.push_refresh_obligation(phase, preloaded_deposits, skip)
    }

    /// Re-establishes freshness after a group switch.
    pub(super) fn push_refresh_after_switch(
        &mut self,
        phase: Phase,
        touched: &[Pubkey],
        preloaded_deposits: &[Pubkey],
    ) -> Result<()> {
        let untouched = self.untouched_reserves(touched, preloaded_deposits);
        self.push_refresh_reserves(phase, &untouched)?;
        self.push_refresh_reserves(phase, touched)?;
        self.push_refresh_obligation(phase, preloaded_deposits, &[])
    }

    // ---------------------------------------------------------------------
    // Elevation groups
    // ---------------------------------------------------------------------

    pub(super) fn wants_elevation_group(&self) -> bool {
        self.options.request_elevation_group || self.options.elevation_group_override.is_some()
    }

    pub(super) fn current_elevation_group(&self) -> u8 {
        self.obligation.as_ref().map_or(0, |o| o.elevation_group())
    }

    pub(super) fn push_request_elevation_group(
        &mut self,
        phase: Phase,
        group: u8,
        preloaded_deposits: &[Pubkey],
        skip: &[Pubkey],
    ) -> Result<()> {
        log::info!(
            "ActionPlan: obligation {} requests elevation group {} (currently {})",
            self.obligation_address,
            group,
            self.current_elevation_group()
        );
        let remaining = self.obligation_remaining_accounts(preloaded_deposits, skip, false)?;
        let ix = instructions::request_elevation_group(
            &self.owner,
            &self.obligation_address,
            &self.market.address,
            group,
            remaining,
            &self.program_id(),
        );
        self.log.push(phase, ix, format!("requestElevationGroup[{}]", group));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Farms
    // ---------------------------------------------------------------------

    fn farm_accounts(&self, reserve: &KaminoReserve, kind: ReserveFarmKind) -> Result<Option<ObligationFarmAccounts>> {
        let Some(farm) = reserve.farm(kind) else {
            return Ok(None);
        };
        Ok(Some(ObligationFarmAccounts {
            obligation: self.obligation_address,
            lending_market_authority: self.market.lending_market_authority()?,
            reserve: reserve.address,
            reserve_farm_state: farm,
            obligation_farm_user_state: derive_obligation_farm_state(&farm, &self.obligation_address, &self.farms_program)?,
            lending_market: self.market.address,
            farms_program: self.farms_program,
        }))
    }

    /// Farm participation for the obligation on `reserve`, only when the
    /// reserve has a farm of that kind and the user state does not exist.
    pub(super) async fn push_init_farm(
        &mut self,
        phase: Phase,
        reserve: &KaminoReserve,
        kind: ReserveFarmKind,
    ) -> Result<()> {
        let Some(accounts) = self.farm_accounts(reserve, kind)? else {
            return Ok(());
        };
        if self.ledger.account_exists(&accounts.obligation_farm_user_state).await? {
            return Ok(());
        }
        let ix = instructions::init_obligation_farms_for_reserve(
            &self.payer,
            &self.obligation_owner,
            &accounts,
            kind.discriminator(),
            &self.program_id(),
        );
        self.log
            .push(phase, ix, format!("initObligationFarm[{}:{}]", reserve.symbol(), kind));
        Ok(())
    }

    pub(super) fn farm_refresh(
        &self,
        reserve: &KaminoReserve,
        kind: ReserveFarmKind,
    ) -> Result<Option<(Instruction, String)>> {
        let Some(accounts) = self.farm_accounts(reserve, kind)? else {
            return Ok(None);
        };
        let ix = instructions::refresh_obligation_farms_for_reserve(
            &self.payer,
            &accounts,
            kind.discriminator(),
            &self.program_id(),
        );
        Ok(Some((ix, format!("refreshObligationFarm[{}:{}]", reserve.symbol(), kind))))
    }

    /// Pre-refresh in `phase`; the post copy goes to `post`, or is held for
    /// the start of cleanup when `post` is `None`.
    pub(super) fn push_farm_refresh(
        &mut self,
        phase: Phase,
        post: Option<Phase>,
        reserve: &KaminoReserve,
        kind: ReserveFarmKind,
    ) -> Result<()> {
        let Some((ix, label)) = self.farm_refresh(reserve, kind)? else {
            return Ok(());
        };
        self.log.push(phase, ix.clone(), label.clone());
        match post {
            Some(post_phase) => self.log.push(post_phase, ix, label),
            None => self.log.hold_for_cleanup(ix, label),
        }
        Ok(())
    }
}
