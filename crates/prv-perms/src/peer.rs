//! Peer trust records and handshake transitions.
//!
//! A peer binding is created Pending by an invitation (ours or theirs) and
//! settled once, to Trusted or Rejected. Only an explicit re-invitation of a
//! rejected peer replaces a settled record, as a new generation.

use serde::{Deserialize, Serialize};

use prv_core::{ChatId, PeerId};

use crate::error::{PermsError, Result};

/// Trust state of a peer binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustState {
    Pending,
    Trusted,
    Rejected,
}

impl TrustState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrustState::Pending => "pending",
            TrustState::Trusted => "trusted",
            TrustState::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TrustState::Pending),
            "trusted" => Some(TrustState::Trusted),
            "rejected" => Some(TrustState::Rejected),
            _ => None,
        }
    }
}

/// Who started the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// We invited them.
    Outbound,
    /// They invited us.
    Inbound,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "outbound" => Some(Direction::Outbound),
            "inbound" => Some(Direction::Inbound),
            _ => None,
        }
    }
}

/// A peer binding within one chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub chat_id: ChatId,
    pub peer_id: PeerId,

    /// The id the invitation was issued under. Differs from `peer_id` when
    /// the responder identified itself with another id.
    pub invitation_id: PeerId,

    pub name: String,
    pub email: Option<String>,
    pub trust: TrustState,
    pub direction: Direction,

    /// Reason given with a rejection.
    pub reason: Option<String>,

    /// Bumped each time a rejected binding is re-invited.
    pub generation: u32,

    pub created_at: i64,
    pub resolved_at: Option<i64>,
}

impl PeerRecord {
    pub fn is_trusted(&self) -> bool {
        self.trust == TrustState::Trusted
    }
}

/// Fields of a new invitation.
#[derive(Debug, Clone)]
pub struct Invitation {
    pub chat_id: ChatId,
    pub peer_id: PeerId,
    pub name: String,
    pub email: Option<String>,
    pub direction: Direction,
}

/// Record an invitation.
///
/// A pending record is returned as-is with refreshed contact details; a
/// rejected one is replaced by the next generation; a trusted one stays.
pub fn invite(current: Option<&PeerRecord>, invitation: Invitation, now: i64) -> Result<PeerRecord> {
    let fresh = |generation: u32| PeerRecord {
        chat_id: invitation.chat_id.clone(),
        peer_id: invitation.peer_id.clone(),
        invitation_id: invitation.peer_id.clone(),
        name: invitation.name.clone(),
        email: invitation.email.clone(),
        trust: TrustState::Pending,
        direction: invitation.direction,
        reason: None,
        generation,
        created_at: now,
        resolved_at: None,
    };

    match current {
        None => Ok(fresh(1)),
        Some(c) => match c.trust {
            TrustState::Pending => {
                let mut next = c.clone();
                next.name = invitation.name.clone();
                next.email = invitation.email.clone();
                Ok(next)
            }
            TrustState::Rejected => Ok(fresh(c.generation + 1)),
            TrustState::Trusted => Err(PermsError::PeerAlreadyResolved(TrustState::Trusted)),
        },
    }
}

/// Outcome of settling a peer binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record: PeerRecord,

    /// True when the record was already settled the same way.
    pub replayed: bool,
}

/// Settle a pending binding.
pub fn resolve(
    record: &PeerRecord,
    accepted: bool,
    reason: Option<&str>,
    now: i64,
) -> Result<Resolution> {
    let target = if accepted {
        TrustState::Trusted
    } else {
        TrustState::Rejected
    };

    match record.trust {
        TrustState::Pending => {
            let mut next = record.clone();
            next.trust = target;
            next.reason = if accepted {
                None
            } else {
                reason.map(str::to_string)
            };
            next.resolved_at = Some(now);
            Ok(Resolution {
                record: next,
                replayed: false,
            })
        }
        settled if settled == target => Ok(Resolution {
            record: record.clone(),
            replayed: true,
        }),
        settled => Err(PermsError::PeerAlreadyResolved(settled)),
    }
}
