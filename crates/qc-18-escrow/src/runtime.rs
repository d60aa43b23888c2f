//! # Instance Executor
//!
//! Runs one contract instance as a single task. Every mutation is a
//! run-to-completion turn on that task, so commands apply in the order they
//! were sent.
//!
//! ## Channels
//!
//! - commands: bounded `mpsc`, each carrying a `oneshot` for its reply
//! - wakeups: unbounded `mpsc` fed by timer callbacks, polled first
//!
//! A wakeup never interrupts a turn. If a reallocation commits before the
//! wakeup is taken, the deadline exit pays out the reallocated allocation;
//! otherwise the reallocation finds the seat exited.
//!
//! ## Handles
//!
//! - `EscrowHandle` implements `EscrowApi` for parties
//! - `ContractHandle` runs contract logic against a `ContractFacet`

use crate::domain::{Allocation, EscrowError, InstanceId, Proposal, SeatId};
use crate::events::{EscrowEvent, EscrowStats};
use crate::exit::Wakeup;
use crate::instance::{panic_message, ContractFacet, ContractInstance, InstanceSnapshot, UserSeat};
use crate::invitations::{InvitationDetails, InvitationHandle};
use crate::ports::inbound::EscrowApi;
use async_trait::async_trait;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

type Reply<T> = oneshot::Sender<Result<T, EscrowError>>;
type Job = Box<dyn FnOnce(&mut ContractFacet<'_>) + Send>;

enum Command {
    Offer {
        invitation: InvitationHandle,
        proposal: Value,
        escrow: Allocation,
        reply: Reply<UserSeat>,
    },
    InvitationDetails {
        token: Uuid,
        reply: Reply<InvitationDetails>,
    },
    CurrentAllocation {
        seat: SeatId,
        reply: Reply<Allocation>,
    },
    Proposal {
        seat: SeatId,
        reply: Reply<Proposal>,
    },
    Exit {
        seat: SeatId,
        token: Uuid,
        reply: Reply<Allocation>,
    },
    Stats {
        reply: Reply<EscrowStats>,
    },
    Snapshot {
        reply: Reply<InstanceSnapshot>,
    },
    Contract(Job),
}

/// Spawn the executor for `instance`.
///
/// The task ends once every handle is dropped and returns the instance.
pub fn spawn_instance(
    mut instance: ContractInstance,
) -> (EscrowHandle, ContractHandle, JoinHandle<ContractInstance>) {
    let (commands, receiver) = mpsc::channel(instance.config().command_channel_capacity.max(1));
    let wakeups = instance.take_wakeups();
    let id = instance.id();
    let events = instance.event_sender();

    let task = tokio::spawn(run(instance, receiver, wakeups));

    let escrow = EscrowHandle {
        instance: id,
        commands: commands.clone(),
        events,
    };
    let contract = ContractHandle {
        instance: id,
        commands,
    };
    (escrow, contract, task)
}

#[instrument(skip_all, fields(instance = %instance.id()))]
async fn run(
    mut instance: ContractInstance,
    mut commands: mpsc::Receiver<Command>,
    mut wakeups: Option<mpsc::UnboundedReceiver<Wakeup>>,
) -> ContractInstance {
    info!("[qc-18] Instance executor started");
    loop {
        tokio::select! {
            biased;
            Some(wakeup) = next_wakeup(&mut wakeups) => instance.handle_wakeup(wakeup),
            command = commands.recv() => match command {
                Some(command) => apply(&mut instance, command),
                None => break,
            },
        }
    }
    // Deadlines that fired before shutdown still pay out.
    if let Some(queue) = wakeups.as_mut() {
        while let Ok(wakeup) = queue.try_recv() {
            instance.handle_wakeup(wakeup);
        }
    }
    info!("[qc-18] Instance executor stopped");
    instance
}

async fn next_wakeup(wakeups: &mut Option<mpsc::UnboundedReceiver<Wakeup>>) -> Option<Wakeup> {
    match wakeups {
        Some(queue) => queue.recv().await,
        None => std::future::pending().await,
    }
}

fn apply(instance: &mut ContractInstance, command: Command) {
    match command {
        Command::Offer {
            invitation,
            proposal,
            escrow,
            reply,
        } => {
            let _ = reply.send(instance.offer(invitation, &proposal, escrow));
        }
        Command::InvitationDetails { token, reply } => {
            let _ = reply.send(instance.invitation_details_for(token));
        }
        Command::CurrentAllocation { seat, reply } => {
            let _ = reply.send(instance.current_allocation(seat));
        }
        Command::Proposal { seat, reply } => {
            let _ = reply.send(instance.proposal(seat));
        }
        Command::Exit { seat, token, reply } => {
            let _ = reply.send(instance.exit_with_token(seat, token));
        }
        Command::Stats { reply } => {
            let _ = reply.send(Ok(instance.stats()));
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Ok(instance.snapshot()));
        }
        Command::Contract(job) => {
            debug!("[qc-18] Running contract job");
            job(&mut instance.contract_facet());
        }
    }
}

async fn request<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(Reply<T>) -> Command,
) -> Result<T, EscrowError> {
    let (reply, response) = oneshot::channel();
    commands
        .send(build(reply))
        .await
        .map_err(|_| EscrowError::ExecutorClosed)?;
    response.await.map_err(|_| EscrowError::ExecutorClosed)?
}

/// Party-facing handle to a running instance.
#[derive(Clone)]
pub struct EscrowHandle {
    instance: InstanceId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<EscrowEvent>,
}

impl EscrowHandle {
    /// Instance id.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Subscribe to instance events.
    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl EscrowApi for EscrowHandle {
    async fn offer(
        &self,
        invitation: InvitationHandle,
        proposal: Value,
        escrow: Allocation,
    ) -> Result<UserSeat, EscrowError> {
        request(&self.commands, |reply| Command::Offer {
            invitation,
            proposal,
            escrow,
            reply,
        })
        .await
    }

    async fn invitation_details(
        &self,
        invitation: &InvitationHandle,
    ) -> Result<InvitationDetails, EscrowError> {
        let token = invitation.token();
        request(&self.commands, |reply| Command::InvitationDetails { token, reply }).await
    }

    async fn current_allocation(&self, seat: SeatId) -> Result<Allocation, EscrowError> {
        request(&self.commands, |reply| Command::CurrentAllocation { seat, reply }).await
    }

    async fn proposal(&self, seat: SeatId) -> Result<Proposal, EscrowError> {
        request(&self.commands, |reply| Command::Proposal { seat, reply }).await
    }

    async fn exit(&self, seat: &UserSeat) -> Result<Allocation, EscrowError> {
        let (id, token) = (seat.id(), seat.exit_key().token());
        request(&self.commands, |reply| Command::Exit {
            seat: id,
            token,
            reply,
        })
        .await
    }

    async fn stats(&self) -> Result<EscrowStats, EscrowError> {
        request(&self.commands, |reply| Command::Stats { reply }).await
    }
}

/// Contract-logic handle to a running instance.
#[derive(Clone)]
pub struct ContractHandle {
    instance: InstanceId,
    commands: mpsc::Sender<Command>,
}

impl ContractHandle {
    /// Instance id.
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Run `f` as one turn of the instance.
    ///
    /// A panic in `f` is reported as `HandlerFailed`; the instance keeps
    /// running.
    pub async fn run<R, F>(&self, f: F) -> Result<R, EscrowError>
    where
        F: FnOnce(&mut ContractFacet<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let job: Job = Box::new(move |facet: &mut ContractFacet<'_>| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(facet)))
                .map_err(|payload| EscrowError::HandlerFailed(panic_message(payload.as_ref())));
            let _ = reply.send(outcome);
        });
        self.commands
            .send(Command::Contract(job))
            .await
            .map_err(|_| EscrowError::ExecutorClosed)?;
        response.await.map_err(|_| EscrowError::ExecutorClosed)?
    }

    /// Issue an invitation whose offers run `handler`.
    pub async fn mint_invitation<F>(
        &self,
        description: impl Into<String>,
        handler: F,
    ) -> Result<InvitationHandle, EscrowError>
    where
        F: FnOnce(&mut ContractFacet<'_>, SeatId) -> anyhow::Result<Value> + Send + 'static,
    {
        let description = description.into();
        self.run(move |facet| facet.mint_invitation(description, handler))
            .await
    }

    /// Capture the instance state.
    pub async fn snapshot(&self) -> Result<InstanceSnapshot, EscrowError> {
        request(&self.commands, |reply| Command::Snapshot { reply }).await
    }
}
