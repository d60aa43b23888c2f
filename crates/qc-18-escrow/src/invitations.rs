//! # Invitations
//!
//! Single-use capabilities to make an offer, and the handlers they unlock.
//!
//! An `InvitationHandle` is an opaque random token. It cannot be cloned or
//! built outside this crate, and redeeming it consumes it. The registry
//! keeps the only mapping from token to handler; a token minted by another
//! instance is unknown here.

use crate::domain::{EscrowError, InstanceId, SeatId};
use crate::instance::ContractFacet;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

/// Unforgeable, single-use invitation.
pub struct InvitationHandle {
    token: Uuid,
}

impl InvitationHandle {
    fn mint() -> Self {
        Self {
            token: Uuid::new_v4(),
        }
    }

    pub(crate) fn token(&self) -> Uuid {
        self.token
    }
}

impl fmt::Debug for InvitationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InvitationHandle(..)")
    }
}

/// Public description of an invitation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvitationDetails {
    /// What the invitation is for
    pub description: String,
    /// Instance that minted it
    pub instance: InstanceId,
}

/// Contract logic run when an invitation is redeemed by an offer.
pub trait OfferHandler: Send {
    /// Handle the offer that created `seat`. The returned value is the
    /// offer result.
    fn handle(self: Box<Self>, facet: &mut ContractFacet<'_>, seat: SeatId) -> anyhow::Result<Value>;
}

impl<F> OfferHandler for F
where
    F: FnOnce(&mut ContractFacet<'_>, SeatId) -> anyhow::Result<Value> + Send,
{
    fn handle(self: Box<Self>, facet: &mut ContractFacet<'_>, seat: SeatId) -> anyhow::Result<Value> {
        (*self)(facet, seat)
    }
}

/// Result of redeeming an invitation.
pub struct RedeemedInvitation {
    /// Handler bound to the invitation
    pub handler: Box<dyn OfferHandler>,
    /// Invitation description
    pub details: InvitationDetails,
}

impl fmt::Debug for RedeemedInvitation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeemedInvitation")
            .field("details", &self.details)
            .finish_non_exhaustive()
    }
}

struct Entry {
    description: String,
    handler: Box<dyn OfferHandler>,
}

/// Per-instance invitation -> handler store.
pub struct OfferHandlerRegistry {
    instance: InstanceId,
    entries: HashMap<Uuid, Entry>,
}

impl OfferHandlerRegistry {
    /// Create an empty registry for `instance`.
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            entries: HashMap::new(),
        }
    }

    /// Issue a new invitation bound to `handler`.
    pub fn mint(
        &mut self,
        description: impl Into<String>,
        handler: Box<dyn OfferHandler>,
    ) -> InvitationHandle {
        let handle = InvitationHandle::mint();
        let description = description.into();
        debug!(instance = %self.instance, description = %description, "[qc-18] Invitation minted");
        self.entries.insert(
            handle.token,
            Entry {
                description,
                handler,
            },
        );
        handle
    }

    /// Redeem an invitation, removing it.
    pub fn redeem(&mut self, handle: InvitationHandle) -> Result<RedeemedInvitation, EscrowError> {
        self.redeem_token(handle.token)
    }

    fn redeem_token(&mut self, token: Uuid) -> Result<RedeemedInvitation, EscrowError> {
        let entry = self
            .entries
            .remove(&token)
            .ok_or(EscrowError::InvitationNotFound)?;
        Ok(RedeemedInvitation {
            handler: entry.handler,
            details: InvitationDetails {
                description: entry.description,
                instance: self.instance,
            },
        })
    }

    /// Describe an invitation without redeeming it.
    pub fn details(&self, handle: &InvitationHandle) -> Result<InvitationDetails, EscrowError> {
        self.details_for(handle.token)
    }

    pub(crate) fn details_for(&self, token: Uuid) -> Result<InvitationDetails, EscrowError> {
        self.entries
            .get(&token)
            .map(|entry| InvitationDetails {
                description: entry.description.clone(),
                instance: self.instance,
            })
            .ok_or(EscrowError::InvitationNotFound)
    }

    /// Invitations minted and not yet redeemed.
    pub fn outstanding(&self) -> usize {
        self.entries.len()
    }

    /// Descriptions of outstanding invitations, sorted.
    pub fn descriptions(&self) -> Vec<String> {
        let mut descriptions: Vec<String> = self
            .entries
            .values()
            .map(|entry| entry.description.clone())
            .collect();
        descriptions.sort();
        descriptions
    }
}
