//! Access grant records and access evaluation.
//!
//! A grant is keyed by `(file_id, peer_id)`. Each side of a share keeps its
//! own view: the owner tracks what it granted, the grantee tracks what it
//! was granted. Expiry is data-driven and evaluated lazily against `now`.

use serde::{Deserialize, Serialize};

use prv_core::{ChatId, FileId, GrantTerms, PeerId};

use crate::keyshare::WrappedKey;

/// Lifecycle state of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantState {
    Requested,
    Granted,
    Denied,
    Revoked,
}

impl GrantState {
    /// Denied and Revoked only move again through a new lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, GrantState::Denied | GrantState::Revoked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GrantState::Requested => "requested",
            GrantState::Granted => "granted",
            GrantState::Denied => "denied",
            GrantState::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requested" => Some(GrantState::Requested),
            "granted" => Some(GrantState::Granted),
            "denied" => Some(GrantState::Denied),
            "revoked" => Some(GrantState::Revoked),
            _ => None,
        }
    }
}

/// Which side of the share a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GrantRole {
    /// We own the file; the record describes a peer's access.
    Owner,
    /// We were granted access to someone else's file.
    Grantee,
}

impl GrantRole {
    pub fn as_str(self) -> &'static str {
        match self {
            GrantRole::Owner => "owner",
            GrantRole::Grantee => "grantee",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "owner" => Some(GrantRole::Owner),
            "grantee" => Some(GrantRole::Grantee),
            _ => None,
        }
    }
}

/// Permission flags chosen by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub allow_download: bool,
    pub allow_forward: bool,

    /// Access duration in seconds; `<= 0` means no expiry.
    pub access_time: i64,
}

impl Permissions {
    pub fn new(allow_download: bool, allow_forward: bool, access_time: i64) -> Self {
        Self {
            allow_download,
            allow_forward,
            access_time,
        }
    }
}

/// Compute when access granted at `granted_at` stops.
pub fn compute_expiry(granted_at: i64, access_time: i64) -> Option<i64> {
    if access_time > 0 {
        Some(granted_at.saturating_add(access_time.saturating_mul(1000)))
    } else {
        None
    }
}

/// Identity of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GrantKey {
    pub file_id: FileId,
    pub peer_id: PeerId,
}

impl GrantKey {
    pub fn new(file_id: FileId, peer_id: PeerId) -> Self {
        Self { file_id, peer_id }
    }
}

/// One lifecycle of access for `(file_id, peer_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub file_id: FileId,
    pub chat_id: ChatId,

    /// The grantee.
    pub peer_id: PeerId,

    pub role: GrantRole,
    pub state: GrantState,
    pub permissions: Permissions,

    /// Incremented every time a fresh request starts over a settled grant.
    pub lifecycle: u32,

    pub requested_at: Option<i64>,
    pub granted_at: Option<i64>,
    pub expires_at: Option<i64>,

    /// When the grant reached Denied or Revoked.
    pub resolved_at: Option<i64>,

    /// Reason given for a denial or revocation.
    pub reason: Option<String>,

    /// The file key sealed for the grantee, present only while Granted.
    pub wrapped_key: Option<WrappedKey>,
}

impl AccessGrant {
    pub fn key(&self) -> GrantKey {
        GrantKey::new(self.file_id, self.peer_id.clone())
    }

    /// Granted and past its expiry.
    pub fn is_expired(&self, now: i64) -> bool {
        self.state == GrantState::Granted && self.expires_at.map_or(false, |at| now >= at)
    }

    /// Granted and not expired.
    pub fn is_active(&self, now: i64) -> bool {
        self.state == GrantState::Granted && !self.is_expired(now)
    }

    /// Wire form of the terms.
    pub fn terms(&self) -> GrantTerms {
        GrantTerms {
            allow_download: self.permissions.allow_download,
            allow_forward: self.permissions.allow_forward,
            access_time: self.permissions.access_time,
            granted_at: self.granted_at.unwrap_or_default(),
            expires_at: self.expires_at,
            lifecycle: self.lifecycle,
        }
    }
}

/// What a caller wants to do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Decrypt,
    Download,
    Forward,
}

/// Why access was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DenyReason {
    NoGrant,
    Pending,
    Denied(Option<String>),
    Revoked(Option<String>),
    Expired { at: i64 },
    DownloadNotAllowed,
    ForwardNotAllowed,
    KeyUnavailable,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::NoGrant => f.write_str("no grant"),
            DenyReason::Pending => f.write_str("request pending"),
            DenyReason::Denied(Some(r)) => write!(f, "denied: {r}"),
            DenyReason::Denied(None) => f.write_str("denied"),
            DenyReason::Revoked(Some(r)) => write!(f, "revoked: {r}"),
            DenyReason::Revoked(None) => f.write_str("revoked"),
            DenyReason::Expired { at } => write!(f, "expired at {at}"),
            DenyReason::DownloadNotAllowed => f.write_str("download not allowed"),
            DenyReason::ForwardNotAllowed => f.write_str("forward not allowed"),
            DenyReason::KeyUnavailable => f.write_str("key unavailable"),
        }
    }
}

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessDecision {
    Allowed,
    Denied(DenyReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

/// Evaluate a grant for `op` at `now`.
///
/// `needs_key` is set on the grantee side, where a Granted record is useless
/// without the wrapped key.
pub fn check_access(
    grant: Option<&AccessGrant>,
    now: i64,
    op: Operation,
    needs_key: bool,
) -> AccessDecision {
    let grant = match grant {
        Some(g) => g,
        None => return AccessDecision::Denied(DenyReason::NoGrant),
    };

    match grant.state {
        GrantState::Requested => return AccessDecision::Denied(DenyReason::Pending),
        GrantState::Denied => {
            return AccessDecision::Denied(DenyReason::Denied(grant.reason.clone()))
        }
        GrantState::Revoked => {
            return AccessDecision::Denied(DenyReason::Revoked(grant.reason.clone()))
        }
        GrantState::Granted => {}
    }

    if let Some(at) = grant.expires_at {
        if now >= at {
            return AccessDecision::Denied(DenyReason::Expired { at });
        }
    }

    match op {
        Operation::Download if !grant.permissions.allow_download => {
            return AccessDecision::Denied(DenyReason::DownloadNotAllowed)
        }
        Operation::Forward if !grant.permissions.allow_forward => {
            return AccessDecision::Denied(DenyReason::ForwardNotAllowed)
        }
        _ => {}
    }

    if needs_key && grant.wrapped_key.is_none() {
        return AccessDecision::Denied(DenyReason::KeyUnavailable);
    }

    AccessDecision::Allowed
}
