//! Grant state transitions.
//!
//! Pure functions from the current record (if any) to the next one. Nothing
//! here touches storage; the engine commits the returned [`Transition`]
//! atomically.
//!
//! ```text
//! None ──request──▶ Requested ──grant──▶ Granted ──revoke──▶ Revoked
//!   │                   │
//!   └──────grant────────┼──────────────▶ Granted
//!                       └──deny───▶ Denied
//! ```
//!
//! Denied and Revoked are terminal within a lifecycle. A new request over a
//! terminal or expired grant opens lifecycle `n + 1` and archives the old
//! record.

use prv_core::{ChatId, GrantTerms};

use crate::error::{PermsError, Result};
use crate::grant::{compute_expiry, AccessGrant, GrantKey, GrantRole, GrantState, Permissions};
use crate::keyshare::WrappedKey;

/// The outcome of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// The record to store.
    pub next: AccessGrant,

    /// The previous lifecycle, to be moved to history.
    pub archived: Option<AccessGrant>,

    /// False when the transition was a no-op.
    pub changed: bool,
}

impl Transition {
    fn changed(next: AccessGrant) -> Self {
        Self {
            next,
            archived: None,
            changed: true,
        }
    }

    fn unchanged(current: &AccessGrant) -> Self {
        Self {
            next: current.clone(),
            archived: None,
            changed: false,
        }
    }

    fn new_lifecycle(next: AccessGrant, old: &AccessGrant) -> Self {
        Self {
            next,
            archived: Some(old.clone()),
            changed: true,
        }
    }
}

fn blank(key: &GrantKey, chat_id: &ChatId, role: GrantRole, lifecycle: u32) -> AccessGrant {
    AccessGrant {
        file_id: key.file_id,
        chat_id: chat_id.clone(),
        peer_id: key.peer_id.clone(),
        role,
        state: GrantState::Requested,
        permissions: Permissions::default(),
        lifecycle,
        requested_at: None,
        granted_at: None,
        expires_at: None,
        resolved_at: None,
        reason: None,
        wrapped_key: None,
    }
}

fn invalid(current: Option<&AccessGrant>, to: GrantState) -> PermsError {
    PermsError::InvalidTransition {
        from: current.map(|g| g.state),
        to,
    }
}

/// Reject messages addressed to an older lifecycle.
pub fn check_lifecycle(current: &AccessGrant, incoming: u32) -> Result<()> {
    if incoming < current.lifecycle {
        return Err(PermsError::StaleLifecycle {
            current: current.lifecycle,
            got: incoming,
        });
    }
    Ok(())
}

fn out_of_range(current: &AccessGrant, got: u32) -> PermsError {
    PermsError::LifecycleOutOfRange {
        current: current.lifecycle,
        got,
    }
}

/// The lifecycle that follows `current`.
fn renewed(current: &AccessGrant) -> Result<u32> {
    current
        .lifecycle
        .checked_add(1)
        .ok_or(PermsError::LifecycleExhausted(current.lifecycle))
}

/// Open (or re-open) a request.
///
/// `min_lifecycle` lets the owner adopt the lifecycle number the requester
/// announced, so both views agree. Over an existing record it may be at most
/// the next lifecycle.
pub fn request(
    current: Option<&AccessGrant>,
    key: &GrantKey,
    chat_id: &ChatId,
    role: GrantRole,
    min_lifecycle: u32,
    now: i64,
) -> Result<Transition> {
    let reopen = |lifecycle: u32| {
        let mut next = blank(key, chat_id, role, lifecycle.max(min_lifecycle));
        next.requested_at = Some(now);
        next
    };

    match current {
        None => Ok(Transition::changed(reopen(1))),
        Some(c) => match c.state {
            GrantState::Requested if min_lifecycle > c.lifecycle => {
                Err(out_of_range(c, min_lifecycle))
            }
            GrantState::Requested => Ok(Transition::unchanged(c)),
            GrantState::Granted if c.is_active(now) => Err(invalid(current, GrantState::Requested)),
            GrantState::Granted | GrantState::Denied | GrantState::Revoked => {
                let next = renewed(c)?;
                if min_lifecycle > next {
                    return Err(out_of_range(c, min_lifecycle));
                }
                Ok(Transition::new_lifecycle(reopen(next), c))
            }
        },
    }
}

/// Owner grants access, either directly or in answer to a request.
pub fn grant(
    current: Option<&AccessGrant>,
    key: &GrantKey,
    chat_id: &ChatId,
    permissions: Permissions,
    wrapped_key: WrappedKey,
    now: i64,
) -> Result<Transition> {
    let mut next = match current {
        None => blank(key, chat_id, GrantRole::Owner, 1),
        Some(c) if c.state == GrantState::Requested => c.clone(),
        Some(_) => return Err(invalid(current, GrantState::Granted)),
    };

    next.state = GrantState::Granted;
    next.permissions = permissions;
    next.granted_at = Some(now);
    next.expires_at = compute_expiry(now, permissions.access_time);
    next.reason = None;
    next.wrapped_key = Some(wrapped_key);
    Ok(Transition::changed(next))
}

/// Grantee records access announced by the owner.
///
/// The owner's terms are authoritative. A grant for the current lifecycle
/// that is already Granted refreshes the key; a newer lifecycle replaces
/// whatever we had.
pub fn adopt_grant(
    current: Option<&AccessGrant>,
    key: &GrantKey,
    chat_id: &ChatId,
    terms: &GrantTerms,
    wrapped_key: WrappedKey,
) -> Result<Transition> {
    let build = |base: AccessGrant| {
        let mut next = base;
        next.state = GrantState::Granted;
        next.permissions =
            Permissions::new(terms.allow_download, terms.allow_forward, terms.access_time);
        next.lifecycle = terms.lifecycle;
        next.granted_at = Some(terms.granted_at);
        next.expires_at = terms.expires_at;
        next.resolved_at = None;
        next.reason = None;
        next.wrapped_key = Some(wrapped_key.clone());
        next
    };

    let c = match current {
        None => {
            let base = blank(key, chat_id, GrantRole::Grantee, terms.lifecycle);
            return Ok(Transition::changed(build(base)));
        }
        Some(c) => c,
    };

    check_lifecycle(c, terms.lifecycle)?;
    if terms.lifecycle - c.lifecycle > 1 {
        return Err(out_of_range(c, terms.lifecycle));
    }

    if terms.lifecycle > c.lifecycle {
        let base = blank(key, chat_id, GrantRole::Grantee, terms.lifecycle);
        return Ok(Transition::new_lifecycle(build(base), c));
    }

    match c.state {
        GrantState::Requested => Ok(Transition::changed(build(c.clone()))),
        GrantState::Granted => {
            let next = build(c.clone());
            if &next == c {
                Ok(Transition::unchanged(c))
            } else {
                Ok(Transition::changed(next))
            }
        }
        GrantState::Denied | GrantState::Revoked => Err(invalid(current, GrantState::Granted)),
    }
}

/// Refuse a pending request.
pub fn deny(current: Option<&AccessGrant>, reason: &str, now: i64) -> Result<Transition> {
    match current {
        Some(c) if c.state == GrantState::Requested => {
            let mut next = c.clone();
            next.state = GrantState::Denied;
            next.reason = Some(reason.to_string());
            next.resolved_at = Some(now);
            Ok(Transition::changed(next))
        }
        _ => Err(invalid(current, GrantState::Denied)),
    }
}

/// Grantee records a refusal announced by the owner.
///
/// A refusal for the next lifecycle archives our record and stores the
/// denial under the new number.
pub fn adopt_denial(
    current: Option<&AccessGrant>,
    key: &GrantKey,
    chat_id: &ChatId,
    lifecycle: u32,
    reason: &str,
    now: i64,
) -> Result<Transition> {
    let c = match current {
        Some(c) if lifecycle > c.lifecycle => c,
        Some(c) => {
            check_lifecycle(c, lifecycle)?;
            return deny(current, reason, now);
        }
        None => return Err(invalid(None, GrantState::Denied)),
    };

    if lifecycle - c.lifecycle > 1 {
        return Err(out_of_range(c, lifecycle));
    }
    if c.is_active(now) {
        return Err(invalid(current, GrantState::Denied));
    }

    let mut next = blank(key, chat_id, c.role, lifecycle);
    next.state = GrantState::Denied;
    next.reason = Some(reason.to_string());
    next.resolved_at = Some(now);
    Ok(Transition::new_lifecycle(next, c))
}

/// Withdraw granted access. The wrapped key leaves the live record.
pub fn revoke(current: Option<&AccessGrant>, reason: &str, now: i64) -> Result<Transition> {
    match current {
        Some(c) if c.state == GrantState::Granted => {
            let mut next = c.clone();
            next.state = GrantState::Revoked;
            next.reason = Some(reason.to_string());
            next.resolved_at = Some(now);
            next.wrapped_key = None;
            Ok(Transition::changed(next))
        }
        _ => Err(invalid(current, GrantState::Revoked)),
    }
}

/// Settle a live grant when its chat goes away.
///
/// Granted becomes Revoked, Requested becomes Denied, settled grants are
/// left alone (`None`).
pub fn close(current: &AccessGrant, reason: &str, now: i64) -> Option<Transition> {
    match current.state {
        GrantState::Granted => revoke(Some(current), reason, now).ok(),
        GrantState::Requested => deny(Some(current), reason, now).ok(),
        GrantState::Denied | GrantState::Revoked => None,
    }
}
