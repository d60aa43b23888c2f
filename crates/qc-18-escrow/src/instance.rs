//! # Contract Instance
//!
//! One running contract: its seats, exit rules, invitations and events.
//!
//! ## Surfaces
//!
//! - users: `offer`, `exit`, `current_allocation`, `proposal` and the
//!   `UserSeat` returned by an offer
//! - contract logic: `ContractFacet`, the only way to reallocate, mint
//!   invitations or force exits
//!
//! ## Failure policy
//!
//! Validation and safety errors leave the ledger unchanged and are
//! recoverable. A violation found by the post-commit audit halts the
//! instance: reallocations are refused from then on, exits still pay out.
//! A failing or panicking offer handler exits only its own seat.

use crate::algorithms::{self, clean_proposal, SupplyDelta};
use crate::config::EscrowConfig;
use crate::domain::{
    Allocation, Brand, EscrowError, ExitCause, InstanceId, Proposal, SeatId, TimerRef,
};
use crate::events::{EscrowEvent, EscrowStats};
use crate::exit::{ExitRuleStateMachine, Wakeup};
use crate::invitations::{
    InvitationDetails, InvitationHandle, OfferHandler, OfferHandlerRegistry, RedeemedInvitation,
};
use crate::ledger::{LedgerSnapshot, PayoutReceiver, SeatLedger};
use crate::ports::outbound::{AssetSink, TimerService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Secret proving the caller holds a seat.
pub struct ExitKey {
    token: Uuid,
}

impl ExitKey {
    pub(crate) fn token(&self) -> Uuid {
        self.token
    }
}

impl fmt::Debug for ExitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ExitKey(..)")
    }
}

/// The offering party's view of its seat.
#[derive(Debug)]
pub struct UserSeat {
    id: SeatId,
    key: ExitKey,
    payout: PayoutReceiver,
    offer_result: Result<Value, EscrowError>,
}

impl UserSeat {
    /// Seat id.
    pub fn id(&self) -> SeatId {
        self.id
    }

    /// Key for `exit()`.
    pub fn exit_key(&self) -> &ExitKey {
        &self.key
    }

    /// Value returned by the offer handler, or why it failed.
    pub fn offer_result(&self) -> &Result<Value, EscrowError> {
        &self.offer_result
    }

    /// Check if the seat has exited.
    pub fn has_exited(&self) -> bool {
        self.payout.borrow().is_some()
    }

    /// Payout, if the seat has exited.
    pub fn try_payout(&self) -> Option<Allocation> {
        self.payout.borrow().clone()
    }

    /// Wait for the seat to exit and return its payout.
    pub async fn payouts(&mut self) -> Result<Allocation, EscrowError> {
        let payout = self
            .payout
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EscrowError::ExecutorClosed)?;
        Ok((*payout).clone().unwrap_or_default())
    }
}

/// Capability to mint and burn specific brands during a reallocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MintAuthority {
    instance: InstanceId,
    brands: BTreeSet<Brand>,
}

impl MintAuthority {
    /// Brands this authority covers.
    pub fn brands(&self) -> &BTreeSet<Brand> {
        &self.brands
    }

    fn check(&self, instance: InstanceId, delta: &SupplyDelta) -> Result<(), EscrowError> {
        for brand in delta.brands() {
            if self.instance != instance || !self.brands.contains(&brand) {
                return Err(EscrowError::MintNotAuthorized(brand));
            }
        }
        Ok(())
    }
}

/// Persistent state of an instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    /// Instance identity.
    pub instance: InstanceId,
    /// Seats and supply.
    pub ledger: LedgerSnapshot,
    /// Exit key of each seat.
    pub exit_keys: Vec<(SeatId, Uuid)>,
    /// Halt reason, if halted.
    pub halted: Option<String>,
    /// Descriptions of unredeemed invitations. Their handlers are not
    /// persisted; the contract mints them again after a restart.
    pub pending_invitations: Vec<String>,
}

/// A contract instance.
pub struct ContractInstance {
    id: InstanceId,
    config: EscrowConfig,
    sink: Arc<dyn AssetSink>,
    ledger: SeatLedger,
    exits: ExitRuleStateMachine,
    wakeups: Option<mpsc::UnboundedReceiver<Wakeup>>,
    invitations: OfferHandlerRegistry,
    exit_keys: HashMap<SeatId, Uuid>,
    halted: Option<String>,
    events: broadcast::Sender<EscrowEvent>,
    stats: EscrowStats,
}

impl ContractInstance {
    /// Create an instance with no seats.
    pub fn new(config: EscrowConfig, sink: Arc<dyn AssetSink>) -> Self {
        Self::assemble(InstanceId::new(), config, sink, SeatLedger::new())
    }

    fn assemble(
        id: InstanceId,
        config: EscrowConfig,
        sink: Arc<dyn AssetSink>,
        ledger: SeatLedger,
    ) -> Self {
        let (exits, wakeups) = ExitRuleStateMachine::new();
        let (events, _) = broadcast::channel(config.event_channel_capacity.max(1));
        info!(instance = %id, "[qc-18] Contract instance created");
        Self {
            id,
            config,
            sink,
            ledger,
            exits,
            wakeups: Some(wakeups),
            invitations: OfferHandlerRegistry::new(id),
            exit_keys: HashMap::new(),
            halted: None,
            events,
            stats: EscrowStats::default(),
        }
    }

    /// Rebuild an instance from a snapshot.
    ///
    /// Deadlines of Active seats are armed again; one already past fires on
    /// the next turn.
    pub fn restore(
        config: EscrowConfig,
        sink: Arc<dyn AssetSink>,
        snapshot: InstanceSnapshot,
        timers: impl IntoIterator<Item = (TimerRef, Arc<dyn TimerService>)>,
    ) -> Result<Self, EscrowError> {
        let ledger = SeatLedger::from_snapshot(snapshot.ledger);
        let mut instance = Self::assemble(snapshot.instance, config, sink, ledger);
        for (name, timer) in timers {
            instance.register_timer(name, timer);
        }
        for id in instance.ledger.active_seats() {
            let rule = instance.ledger.seat(id)?.proposal.exit.clone();
            instance.exits.arm(id, &rule)?;
        }
        instance.exit_keys = snapshot.exit_keys.into_iter().collect();
        instance.halted = snapshot.halted;
        info!(
            instance = %instance.id,
            seats = instance.ledger.len(),
            "[qc-18] Contract instance restored"
        );
        Ok(instance)
    }

    /// Capture the state that must survive a restart.
    pub fn snapshot(&self) -> InstanceSnapshot {
        let mut exit_keys: Vec<_> = self.exit_keys.iter().map(|(s, k)| (*s, *k)).collect();
        exit_keys.sort();
        InstanceSnapshot {
            instance: self.id,
            ledger: self.ledger.snapshot(),
            exit_keys,
            halted: self.halted.clone(),
            pending_invitations: self.invitations.descriptions(),
        }
    }

    /// Builder-style `register_timer`.
    pub fn with_timer(mut self, name: TimerRef, timer: Arc<dyn TimerService>) -> Self {
        self.register_timer(name, timer);
        self
    }

    /// Make a timer available to `afterDeadline` proposals.
    pub fn register_timer(&mut self, name: TimerRef, timer: Arc<dyn TimerService>) {
        self.exits.register_timer(name, timer);
    }

    /// Instance id.
    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Instance configuration.
    pub fn config(&self) -> &EscrowConfig {
        &self.config
    }

    /// Current statistics.
    pub fn stats(&self) -> EscrowStats {
        self.stats.clone()
    }

    /// Subscribe to instance events.
    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }

    /// Check if the instance was halted by a violation.
    pub fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// Reason the instance halted.
    pub fn halt_reason(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Contract-logic view of this instance.
    pub fn contract_facet(&mut self) -> ContractFacet<'_> {
        ContractFacet { instance: self }
    }

    /// Describe an invitation without redeeming it.
    pub fn invitation_details(
        &self,
        handle: &InvitationHandle,
    ) -> Result<InvitationDetails, EscrowError> {
        self.invitations.details(handle)
    }

    pub(crate) fn invitation_details_for(
        &self,
        token: Uuid,
    ) -> Result<InvitationDetails, EscrowError> {
        self.invitations.details_for(token)
    }

    /// Redeem an invitation, consuming it.
    pub fn redeem_invitation(
        &mut self,
        handle: InvitationHandle,
    ) -> Result<RedeemedInvitation, EscrowError> {
        let redeemed = self.invitations.redeem(handle)?;
        self.stats.invitations_redeemed += 1;
        debug!(
            instance = %self.id,
            description = %redeemed.details.description,
            "[qc-18] Invitation redeemed"
        );
        Ok(redeemed)
    }

    /// Create a seat from a raw proposal and the assets escrowed for it.
    ///
    /// Proposal errors are raised before anything is escrowed.
    #[instrument(skip_all, fields(instance = %self.id))]
    pub fn make_seat(&mut self, raw: &Value, escrow: Allocation) -> Result<UserSeat, EscrowError> {
        let (id, key, payout) = self.create_seat(raw, escrow)?;
        Ok(UserSeat {
            id,
            key,
            payout,
            offer_result: Ok(Value::Null),
        })
    }

    fn create_seat(
        &mut self,
        raw: &Value,
        escrow: Allocation,
    ) -> Result<(SeatId, ExitKey, PayoutReceiver), EscrowError> {
        let sink = self.sink.clone();
        let mut proposal = clean_proposal(raw, |brand| sink.asset_kind(brand))?;
        if raw.get("multiples").is_none() {
            proposal.multiples = self.config.default_multiples;
        }
        self.exits.validate(&proposal.exit)?;

        let rule = proposal.exit.clone();
        let (id, payout) = self.ledger.add_seat(sink.as_ref(), proposal, escrow)?;
        self.exits.arm(id, &rule)?;

        let key = ExitKey {
            token: Uuid::new_v4(),
        };
        self.exit_keys.insert(id, key.token);
        self.stats.seats_created += 1;

        info!(seat = %id, exit = rule.name(), "[qc-18] Seat created");
        self.emit(EscrowEvent::SeatCreated {
            instance: self.id,
            seat: id,
        });
        Ok((id, key, payout))
    }

    /// Redeem an invitation, escrow the offer and run the contract's handler.
    ///
    /// The handler's outcome is the seat's `offer_result`; a handler error
    /// or panic exits the seat and is not an error of `offer` itself.
    #[instrument(skip_all, fields(instance = %self.id))]
    pub fn offer(
        &mut self,
        handle: InvitationHandle,
        raw: &Value,
        escrow: Allocation,
    ) -> Result<UserSeat, EscrowError> {
        let RedeemedInvitation { handler, details } = self.redeem_invitation(handle)?;
        let (id, key, payout) = self.create_seat(raw, escrow)?;
        self.stats.offers_made += 1;
        info!(seat = %id, invitation = %details.description, "[qc-18] Offer accepted");

        let offer_result = self.run_handler(handler, id);
        Ok(UserSeat {
            id,
            key,
            payout,
            offer_result,
        })
    }

    fn run_handler(&mut self, handler: Box<dyn OfferHandler>, seat: SeatId) -> Result<Value, EscrowError> {
        let outcome = {
            let mut facet = self.contract_facet();
            panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&mut facet, seat)))
        };

        let reason = match outcome {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };

        self.stats.handler_failures += 1;
        warn!(seat = %seat, reason = %reason, "[qc-18] Offer handler failed, exiting seat");
        if let Err(err) = self.force_exit(
            seat,
            ExitCause::Failed {
                reason: reason.clone(),
            },
        ) {
            error!(seat = %seat, error = %err, "[qc-18] Could not exit seat of failed offer");
        }
        Err(EscrowError::HandlerFailed(reason))
    }

    /// Current allocation of a seat (its payout once exited).
    pub fn current_allocation(&self, seat: SeatId) -> Result<Allocation, EscrowError> {
        self.ledger.current_allocation(seat)
    }

    /// Cleaned proposal of a seat.
    pub fn proposal(&self, seat: SeatId) -> Result<Proposal, EscrowError> {
        self.ledger.seat(seat).map(|s| s.proposal.clone())
    }

    /// Check if a seat has exited.
    pub fn has_exited(&self, seat: SeatId) -> Result<bool, EscrowError> {
        self.ledger.seat(seat).map(|s| !s.is_active())
    }

    /// Holder-requested exit. Returns the payout.
    ///
    /// Allowed only for `onDemand` seats. Exiting an exited seat returns its
    /// payout again.
    pub fn exit(&mut self, seat: SeatId, key: &ExitKey) -> Result<Allocation, EscrowError> {
        self.exit_with_token(seat, key.token())
    }

    #[instrument(skip(self, token), fields(instance = %self.id))]
    pub(crate) fn exit_with_token(
        &mut self,
        seat: SeatId,
        token: Uuid,
    ) -> Result<Allocation, EscrowError> {
        let expected = self
            .exit_keys
            .get(&seat)
            .ok_or(EscrowError::SeatNotFound(seat))?;
        if *expected != token {
            warn!(seat = %seat, "[qc-18] Exit attempted without the seat's key");
            return Err(EscrowError::NotSeatHolder(seat));
        }

        let record = self.ledger.seat(seat)?;
        if !record.is_active() {
            return Ok(record.allocation.clone());
        }
        self.exits.check_holder_exit(record)?;

        self.force_exit(seat, ExitCause::Voluntary)?;
        self.ledger.current_allocation(seat)
    }

    /// Apply every queued deadline wakeup. Returns how many were applied.
    ///
    /// The executor drains the queue itself; this is for instances driven
    /// directly.
    pub fn process_wakeups(&mut self) -> usize {
        let mut pending = Vec::new();
        if let Some(queue) = self.wakeups.as_mut() {
            while let Ok(wakeup) = queue.try_recv() {
                pending.push(wakeup);
            }
        }
        let applied = pending.len();
        for wakeup in pending {
            self.handle_wakeup(wakeup);
        }
        applied
    }

    /// Apply one deadline wakeup.
    pub fn handle_wakeup(&mut self, wakeup: Wakeup) {
        let cause = match self.ledger.seat(wakeup.seat) {
            Ok(seat) => self.exits.on_wakeup(wakeup, seat),
            Err(_) => {
                warn!(seat = %wakeup.seat, "[qc-18] Wakeup for unknown seat");
                None
            }
        };
        if let Some(cause) = cause {
            if let Err(err) = self.force_exit(wakeup.seat, cause) {
                error!(seat = %wakeup.seat, error = %err, "[qc-18] Deadline exit failed");
            }
        }
    }

    pub(crate) fn take_wakeups(&mut self) -> Option<mpsc::UnboundedReceiver<Wakeup>> {
        self.wakeups.take()
    }

    fn force_exit(
        &mut self,
        seat: SeatId,
        cause: ExitCause,
    ) -> Result<Option<Allocation>, EscrowError> {
        let payout = match self.ledger.exit_seat(self.sink.as_ref(), seat, cause.clone()) {
            Ok(payout) => payout,
            Err(EscrowError::InvariantViolation(reason)) => {
                self.exits.disarm(seat);
                self.halt(reason.clone());
                return Err(EscrowError::InvariantViolation(reason));
            }
            Err(err) => return Err(err),
        };

        if let Some(payout) = &payout {
            self.exits.disarm(seat);
            self.stats.seats_exited += 1;
            info!(seat = %seat, cause = ?cause, "[qc-18] Seat exited");
            self.emit(EscrowEvent::SeatExited {
                instance: self.id,
                seat,
                cause,
                payout: payout.clone(),
            });
        }
        Ok(payout)
    }

    #[instrument(skip_all, fields(instance = %self.id, seats = seats.len()))]
    fn reallocate(
        &mut self,
        seats: &[SeatId],
        allocations: Vec<Allocation>,
        delta: &SupplyDelta,
    ) -> Result<(), EscrowError> {
        if let Some(reason) = &self.halted {
            return Err(EscrowError::InstanceHalted(reason.clone()));
        }

        let committed = allocations.clone();
        if let Err(err) = self.ledger.reallocate(
            self.sink.as_ref(),
            seats,
            allocations,
            delta,
            self.config.max_batch_size,
        ) {
            self.stats.reallocations_rejected += 1;
            warn!(error = %err, "[qc-18] Reallocation rejected");
            self.emit(EscrowEvent::ReallocationRejected {
                instance: self.id,
                reason: err.to_string(),
            });
            return Err(err);
        }

        self.stats.reallocations_committed += 1;
        for (seat, allocation) in seats.iter().zip(committed) {
            self.emit(EscrowEvent::AllocationChanged {
                instance: self.id,
                seat: *seat,
                allocation,
            });
        }

        if self.config.audit_after_commit {
            if let Err(err) = self.ledger.audit(self.sink.as_ref(), seats) {
                let reason = err.to_string();
                self.halt(reason.clone());
                return Err(EscrowError::InvariantViolation(reason));
            }
        }
        Ok(())
    }

    fn halt(&mut self, reason: String) {
        if self.halted.is_some() {
            return;
        }
        error!(instance = %self.id, reason = %reason, "[qc-18] Instance halted");
        self.halted = Some(reason.clone());
        self.emit(EscrowEvent::InstanceHalted {
            instance: self.id,
            reason,
        });
    }

    pub(crate) fn event_sender(&self) -> broadcast::Sender<EscrowEvent> {
        self.events.clone()
    }

    fn emit(&self, event: EscrowEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// Contract logic's access to its instance.
///
/// Every reallocation goes through the coordinator's checks; there is no
/// way to write an allocation directly.
pub struct ContractFacet<'a> {
    instance: &'a mut ContractInstance,
}

impl<'a> ContractFacet<'a> {
    /// Instance id.
    pub fn instance_id(&self) -> InstanceId {
        self.instance.id
    }

    /// Amount arithmetic of the instance.
    pub fn asset_sink(&self) -> &dyn AssetSink {
        self.instance.sink.as_ref()
    }

    /// Atomically replace the allocations of `seats`.
    pub fn reallocate(
        &mut self,
        seats: &[SeatId],
        allocations: Vec<Allocation>,
    ) -> Result<(), EscrowError> {
        self.instance
            .reallocate(seats, allocations, &SupplyDelta::default())
    }

    /// Reallocate while minting and burning under `authority`.
    ///
    /// Totals must change by exactly the declared delta.
    pub fn reallocate_with_mint(
        &mut self,
        authority: &MintAuthority,
        seats: &[SeatId],
        allocations: Vec<Allocation>,
        delta: SupplyDelta,
    ) -> Result<(), EscrowError> {
        authority.check(self.instance.id, &delta)?;
        self.instance.reallocate(seats, allocations, &delta)
    }

    /// Grant mint/burn authority over `brands`.
    pub fn make_mint_authority(
        &mut self,
        brands: impl IntoIterator<Item = Brand>,
    ) -> Result<MintAuthority, EscrowError> {
        let brands: BTreeSet<Brand> = brands.into_iter().collect();
        if let Some(unknown) = brands
            .iter()
            .find(|b| self.instance.sink.asset_kind(b).is_none())
        {
            return Err(EscrowError::UnknownBrand(unknown.clone()));
        }
        Ok(MintAuthority {
            instance: self.instance.id,
            brands,
        })
    }

    /// Issue an invitation whose offers run `handler`.
    pub fn mint_invitation<F>(&mut self, description: impl Into<String>, handler: F) -> InvitationHandle
    where
        F: FnOnce(&mut ContractFacet<'_>, SeatId) -> anyhow::Result<Value> + Send + 'static,
    {
        let description = description.into();
        let handle = self
            .instance
            .invitations
            .mint(description.clone(), Box::new(handler));
        self.instance.stats.invitations_minted += 1;
        self.instance.emit(EscrowEvent::InvitationMinted {
            instance: self.instance.id,
            description,
        });
        handle
    }

    /// Create a seat on the contract's own behalf.
    pub fn make_seat(&mut self, raw: &Value, escrow: Allocation) -> Result<UserSeat, EscrowError> {
        self.instance.make_seat(raw, escrow)
    }

    /// Force a seat out. Returns its payout.
    pub fn exit_seat(&mut self, seat: SeatId) -> Result<Allocation, EscrowError> {
        self.instance.force_exit(seat, ExitCause::ContractForced)?;
        self.instance.current_allocation(seat)
    }

    /// Exit a seat reporting a failure. Returns its payout.
    pub fn fail_seat(
        &mut self,
        seat: SeatId,
        reason: impl Into<String>,
    ) -> Result<Allocation, EscrowError> {
        let reason = reason.into();
        self.instance
            .force_exit(seat, ExitCause::Failed { reason })?;
        self.instance.current_allocation(seat)
    }

    /// Current allocation of a seat.
    pub fn current_allocation(&self, seat: SeatId) -> Result<Allocation, EscrowError> {
        self.instance.current_allocation(seat)
    }

    /// Cleaned proposal of a seat.
    pub fn proposal(&self, seat: SeatId) -> Result<Proposal, EscrowError> {
        self.instance.proposal(seat)
    }

    /// Check if `allocation` gives the seat what it wants.
    pub fn satisfies_want(&self, seat: SeatId, allocation: &Allocation) -> Result<bool, EscrowError> {
        let proposal = &self.instance.ledger.seat(seat)?.proposal;
        Ok(algorithms::satisfies_want(
            self.instance.sink.as_ref(),
            proposal,
            allocation,
        ))
    }

    /// Active seats.
    pub fn active_seats(&self) -> Vec<SeatId> {
        self.instance.ledger.active_seats()
    }
}
