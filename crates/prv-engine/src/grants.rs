//! Access grant operations.
//!
//! The owner moves grants with `accept`, `deny` and `revoke`; each returns
//! the PDU that tells the grantee. The grantee mirrors those moves when the
//! PDUs arrive through the router. Both views are serialized per
//! `(file_id, peer_id)` and committed with the wrapped key in one write.

use prv_core::{
    codec, validation, AccessDeniedNotice, AccessGrantAccept, AccessGrantReject,
    AccessGrantRequest, AccessRevokeRequest, ChatId, FileDecryptRequest, FileId, GrantTerms, Pdu,
    PduBody, PeerId, SealedKey,
};
use prv_perms::{
    check_access, state, AccessDecision, AccessGrant, GrantKey, GrantRole, GrantState, Operation,
    Permissions, WrappedKey,
};
use prv_store::{FileRecord, Store, StoreExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::router::{Dispatch, Outcome};

/// Reason sent to peers that ask about a file before the handshake
/// completed.
pub const UNTRUSTED_PEER_REASON: &str = "peer not trusted";

/// Reason recorded on grants closed by [`Engine::delete_chat`].
pub const CHAT_DELETED_REASON: &str = "chat deleted";

/// The grant after an owner-side move, and the PDU for the grantee.
#[derive(Debug, Clone)]
pub struct GrantOutcome {
    pub grant: AccessGrant,
    pub reply: Pdu,
}

impl GrantOutcome {
    /// The reply in transport form.
    pub fn encoded_reply(&self) -> String {
        codec::encode(&self.reply)
    }
}

/// What the acting profile sees for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessStatus {
    /// Usable now. Always the case for the owner with no open request.
    Active,
    /// We asked for access and have no answer yet.
    Requested,
    /// We own the file and a peer is waiting for our decision.
    WaitingOwnerAction,
    Denied,
    Revoked,
    Expired,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAccessStatus {
    pub status: AccessStatus,
    pub expires_at: Option<i64>,
    pub reason: Option<String>,
}

impl FileAccessStatus {
    fn of(status: AccessStatus) -> Self {
        Self {
            status,
            expires_at: None,
            reason: None,
        }
    }
}

/// Grants closed by [`Engine::delete_chat`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChatDeletion {
    pub revoked: usize,
    pub denied: usize,
}

impl<S: Store> Engine<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Grantee operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask the owner for access to a file we know of.
    pub async fn request_grant(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
    ) -> Result<GrantOutcome> {
        self.ensure_initialized()?;
        let file = self.require_file_in(chat_id, file_id).await?;
        if file.owner == ctx.profile {
            return Err(EngineError::invalid("cannot request access to our own file"));
        }

        let key = GrantKey::new(*file_id, ctx.profile.clone());
        let _guard = self.grant_locks.lock((key.file_id, key.peer_id.clone())).await;
        let current = self.store.get_grant(&key.file_id, &key.peer_id).await?;
        let t = state::request(
            current.as_ref(),
            &key,
            chat_id,
            GrantRole::Grantee,
            0,
            self.now(),
        )?;
        self.store.commit_transition(&t).await?;

        info!(
            chat = %chat_id,
            file = %file_id,
            lifecycle = t.next.lifecycle,
            "access requested"
        );

        let reply = Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            AccessGrantRequest {
                file_id: *file_id,
                lifecycle: t.next.lifecycle,
            },
        );
        Ok(GrantOutcome {
            grant: t.next,
            reply,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Owner operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Grant a trusted peer access to one of our files.
    ///
    /// Answers a pending request, or grants directly when there is none.
    /// The file key is wrapped for the peer before anything is written.
    pub async fn accept(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
        peer_id: &PeerId,
        permissions: Permissions,
    ) -> Result<GrantOutcome> {
        self.ensure_initialized()?;
        let file = self.require_owned_file_in(ctx, chat_id, file_id).await?;
        if peer_id == &ctx.profile {
            return Err(EngineError::invalid("the owner needs no grant"));
        }
        self.require_trusted_peer(chat_id, peer_id).await?;

        let key = GrantKey::new(*file_id, peer_id.clone());
        let _guard = self.grant_locks.lock((key.file_id, key.peer_id.clone())).await;
        let current = self.store.get_grant(&key.file_id, &key.peer_id).await?;

        let wrapped = self.wrap_for_peer(ctx, &file, peer_id).await?;
        let t = state::grant(
            current.as_ref(),
            &key,
            chat_id,
            permissions,
            wrapped.clone(),
            self.now(),
        )?;
        self.store.commit_transition(&t).await?;

        info!(
            chat = %chat_id,
            file = %file_id,
            peer = %peer_id,
            lifecycle = t.next.lifecycle,
            expires_at = ?t.next.expires_at,
            "access granted"
        );

        let reply = Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            AccessGrantAccept {
                file_id: *file_id,
                grantee: peer_id.clone(),
                terms: t.next.terms(),
                wrapped_key: wrapped.to_sealed(),
            },
        );
        Ok(GrantOutcome {
            grant: t.next,
            reply,
        })
    }

    /// Refuse a pending request.
    pub async fn deny(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
        peer_id: &PeerId,
        reason: &str,
    ) -> Result<GrantOutcome> {
        self.ensure_initialized()?;
        validation::validate_reason(reason).map_err(EngineError::argument)?;
        self.require_owned_file_in(ctx, chat_id, file_id).await?;

        let _guard = self.grant_locks.lock((*file_id, peer_id.clone())).await;
        let current = self.store.get_grant(file_id, peer_id).await?;
        let t = state::deny(current.as_ref(), reason, self.now())?;
        self.store.commit_transition(&t).await?;

        info!(chat = %chat_id, file = %file_id, peer = %peer_id, "access denied");

        let reply = Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            AccessGrantReject {
                file_id: *file_id,
                grantee: peer_id.clone(),
                reason: reason.to_string(),
                lifecycle: t.next.lifecycle,
            },
        );
        Ok(GrantOutcome {
            grant: t.next,
            reply,
        })
    }

    /// Withdraw granted access. The wrapped key leaves the live record.
    pub async fn revoke(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
        peer_id: &PeerId,
        reason: &str,
    ) -> Result<GrantOutcome> {
        self.ensure_initialized()?;
        validation::validate_reason(reason).map_err(EngineError::argument)?;
        self.require_owned_file_in(ctx, chat_id, file_id).await?;

        let _guard = self.grant_locks.lock((*file_id, peer_id.clone())).await;
        let current = self.store.get_grant(file_id, peer_id).await?;
        let t = state::revoke(current.as_ref(), reason, self.now())?;
        self.store.commit_transition(&t).await?;

        info!(chat = %chat_id, file = %file_id, peer = %peer_id, "access revoked");

        let reply = Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            AccessRevokeRequest {
                file_id: *file_id,
                grantee: peer_id.clone(),
                reason: reason.to_string(),
                lifecycle: t.next.lifecycle,
            },
        );
        Ok(GrantOutcome {
            grant: t.next,
            reply,
        })
    }

    /// Settle every open grant of a chat that is going away.
    ///
    /// Granted becomes Revoked and Requested becomes Denied, both with
    /// [`CHAT_DELETED_REASON`]. Files and history stay on record.
    pub async fn delete_chat(&self, ctx: &SessionContext, chat_id: &ChatId) -> Result<ChatDeletion> {
        self.ensure_initialized()?;
        let mut deletion = ChatDeletion::default();

        for listed in self.store.list_grants_for_chat(chat_id).await? {
            let _guard = self
                .grant_locks
                .lock((listed.file_id, listed.peer_id.clone()))
                .await;
            let Some(current) = self.store.get_grant(&listed.file_id, &listed.peer_id).await? else {
                continue;
            };
            let Some(t) = state::close(&current, CHAT_DELETED_REASON, self.now()) else {
                continue;
            };
            self.store.commit_transition(&t).await?;
            match t.next.state {
                GrantState::Revoked => deletion.revoked += 1,
                GrantState::Denied => deletion.denied += 1,
                _ => {}
            }
        }

        info!(
            chat = %chat_id,
            profile = %ctx.profile,
            revoked = deletion.revoked,
            denied = deletion.denied,
            "chat grants closed"
        );
        Ok(deletion)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Whether `peer_id` may perform `op` on a file, evaluated now.
    ///
    /// The owner always may. When `peer_id` is the acting profile the
    /// wrapped key must also be present.
    pub async fn check_access(
        &self,
        ctx: &SessionContext,
        file_id: &FileId,
        peer_id: &PeerId,
        op: Operation,
    ) -> Result<AccessDecision> {
        self.ensure_initialized()?;
        let file = self.require_file(file_id).await?;
        if peer_id == &file.owner {
            return Ok(AccessDecision::Allowed);
        }

        let grant = self.store.get_grant(file_id, peer_id).await?;
        let decision = check_access(grant.as_ref(), self.now(), op, peer_id == &ctx.profile);
        if let AccessDecision::Denied(reason) = &decision {
            debug!(file = %file_id, peer = %peer_id, ?op, %reason, "access check denied");
        }
        Ok(decision)
    }

    /// The acting profile's view of a file, for display.
    pub async fn file_access_status(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
    ) -> Result<FileAccessStatus> {
        self.ensure_initialized()?;
        let file = match self.store.get_file(file_id).await? {
            Some(f) if &f.chat_id == chat_id => f,
            _ => return Ok(FileAccessStatus::of(AccessStatus::NotFound)),
        };

        if file.owner == ctx.profile {
            let grants = self.store.list_grants_for_file(file_id).await?;
            let waiting = grants.iter().any(|g| g.state == GrantState::Requested);
            return Ok(FileAccessStatus::of(if waiting {
                AccessStatus::WaitingOwnerAction
            } else {
                AccessStatus::Active
            }));
        }

        let Some(grant) = self.store.get_grant(file_id, &ctx.profile).await? else {
            return Ok(FileAccessStatus::of(AccessStatus::NotFound));
        };
        let status = match grant.state {
            GrantState::Requested => AccessStatus::Requested,
            GrantState::Granted if grant.is_expired(self.now()) => AccessStatus::Expired,
            GrantState::Granted => AccessStatus::Active,
            GrantState::Denied => AccessStatus::Denied,
            GrantState::Revoked => AccessStatus::Revoked,
        };
        Ok(FileAccessStatus {
            status,
            expires_at: grant.expires_at,
            reason: grant.reason,
        })
    }

    /// The live grant for `(file_id, peer_id)`.
    pub async fn grant(&self, file_id: &FileId, peer_id: &PeerId) -> Result<Option<AccessGrant>> {
        self.ensure_initialized()?;
        Ok(self.store.get_grant(file_id, peer_id).await?)
    }

    pub async fn grants_for_file(&self, file_id: &FileId) -> Result<Vec<AccessGrant>> {
        self.ensure_initialized()?;
        Ok(self.store.list_grants_for_file(file_id).await?)
    }

    /// Settled lifecycles of `(file_id, peer_id)`, oldest first.
    pub async fn grant_history(
        &self,
        file_id: &FileId,
        peer_id: &PeerId,
    ) -> Result<Vec<AccessGrant>> {
        self.ensure_initialized()?;
        Ok(self.store.grant_history(file_id, peer_id).await?)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Owner side of inbound PDUs
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn handle_grant_request(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &AccessGrantRequest,
    ) -> Result<Dispatch> {
        let chat_id = &pdu.chat_id;
        let sender = &pdu.sender;
        self.require_owned_file_in(ctx, chat_id, &body.file_id).await?;

        if !self.is_trusted(chat_id, sender).await? {
            return Ok(self.refuse(ctx, pdu, body.file_id, UNTRUSTED_PEER_REASON));
        }

        let key = GrantKey::new(body.file_id, sender.clone());
        let _guard = self.grant_locks.lock((key.file_id, key.peer_id.clone())).await;
        let current = self.store.get_grant(&key.file_id, &key.peer_id).await?;
        let t = state::request(
            current.as_ref(),
            &key,
            chat_id,
            GrantRole::Owner,
            body.lifecycle,
            self.now(),
        )?;
        self.store.commit_transition(&t).await?;

        info!(
            chat = %chat_id,
            file = %body.file_id,
            peer = %sender,
            lifecycle = t.next.lifecycle,
            "access request waiting for owner"
        );
        Ok(Dispatch {
            outcome: Outcome::GrantRequested { grant: t.next },
            reply: None,
        })
    }

    /// Key re-delivery: answer with the current wrapped key while the grant
    /// is usable.
    pub(crate) async fn handle_decrypt_request(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &FileDecryptRequest,
    ) -> Result<Dispatch> {
        let chat_id = &pdu.chat_id;
        let sender = &pdu.sender;
        self.require_owned_file_in(ctx, chat_id, &body.file_id).await?;

        if !self.is_trusted(chat_id, sender).await? {
            return Ok(self.refuse(ctx, pdu, body.file_id, UNTRUSTED_PEER_REASON));
        }

        let grant = self.store.get_grant(&body.file_id, sender).await?;
        let decision = check_access(grant.as_ref(), self.now(), Operation::Decrypt, true);

        let reply: PduBody = match (&decision, grant) {
            (AccessDecision::Allowed, Some(grant)) => match &grant.wrapped_key {
                Some(wrapped) => AccessGrantAccept {
                    file_id: body.file_id,
                    grantee: sender.clone(),
                    terms: grant.terms(),
                    wrapped_key: wrapped.to_sealed(),
                }
                .into(),
                None => return Err(EngineError::CryptoFailure("granted record has no key".into())),
            },
            (AccessDecision::Denied(reason), _) => AccessDeniedNotice {
                file_id: body.file_id,
                grantee: sender.clone(),
                reason: reason.to_string(),
            }
            .into(),
            (AccessDecision::Allowed, None) => {
                return Err(EngineError::UnknownFile(body.file_id.to_hex()))
            }
        };

        debug!(
            file = %body.file_id,
            peer = %sender,
            allowed = decision.is_allowed(),
            "key re-delivery answered"
        );

        Ok(Dispatch {
            outcome: Outcome::KeyRequest {
                file_id: body.file_id,
                peer_id: sender.clone(),
                decision,
            },
            reply: Some(Pdu::new(ctx.profile.clone(), chat_id.clone(), reply)),
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Grantee side of inbound PDUs
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn handle_grant_accept(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &AccessGrantAccept,
    ) -> Result<Dispatch> {
        self.require_grantee_file(ctx, pdu, &body.grantee, &body.file_id)
            .await?;
        let grant = self
            .adopt(ctx, pdu, body.file_id, &body.terms, &body.wrapped_key)
            .await?;
        Ok(Dispatch {
            outcome: Outcome::GrantUpdated { grant },
            reply: None,
        })
    }

    pub(crate) async fn handle_grant_reject(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &AccessGrantReject,
    ) -> Result<Dispatch> {
        self.require_grantee_file(ctx, pdu, &body.grantee, &body.file_id)
            .await?;

        let key = GrantKey::new(body.file_id, ctx.profile.clone());
        let _guard = self.grant_locks.lock((key.file_id, key.peer_id.clone())).await;
        let current = self.store.get_grant(&key.file_id, &key.peer_id).await?;
        let t = state::adopt_denial(
            current.as_ref(),
            &key,
            &pdu.chat_id,
            body.lifecycle,
            &body.reason,
            self.now(),
        )?;
        self.store.commit_transition(&t).await?;

        info!(
            file = %body.file_id,
            owner = %pdu.sender,
            lifecycle = t.next.lifecycle,
            "access request denied by owner"
        );
        Ok(Dispatch {
            outcome: Outcome::GrantUpdated { grant: t.next },
            reply: None,
        })
    }

    pub(crate) async fn handle_revoke(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &AccessRevokeRequest,
    ) -> Result<Dispatch> {
        self.require_grantee_file(ctx, pdu, &body.grantee, &body.file_id)
            .await?;

        let _guard = self.grant_locks.lock((body.file_id, ctx.profile.clone())).await;
        let current = self.store.get_grant(&body.file_id, &ctx.profile).await?;
        if let Some(c) = &current {
            state::check_lifecycle(c, body.lifecycle)?;
        }
        let t = state::revoke(current.as_ref(), &body.reason, self.now())?;
        self.store.commit_transition(&t).await?;

        info!(file = %body.file_id, owner = %pdu.sender, "access revoked by owner");
        Ok(Dispatch {
            outcome: Outcome::GrantUpdated { grant: t.next },
            reply: None,
        })
    }

    pub(crate) async fn handle_denied_notice(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &AccessDeniedNotice,
    ) -> Result<Dispatch> {
        if body.grantee != ctx.profile {
            return Err(not_addressed(&body.grantee));
        }
        if let Some(file) = self.store.get_file(&body.file_id).await? {
            if file.owner != pdu.sender {
                return Err(not_owner(&pdu.sender));
            }
        }

        let _guard = self.grant_locks.lock((body.file_id, ctx.profile.clone())).await;
        let current = self.store.get_grant(&body.file_id, &ctx.profile).await?;
        let outcome = match current {
            Some(c) if c.state == GrantState::Requested => {
                let t = state::deny(Some(&c), &body.reason, self.now())?;
                self.store.commit_transition(&t).await?;
                info!(file = %body.file_id, reason = %body.reason, "access request refused");
                Outcome::GrantUpdated { grant: t.next }
            }
            _ => {
                debug!(file = %body.file_id, reason = %body.reason, "access notice noted");
                Outcome::Noted {
                    file_id: body.file_id,
                    reason: body.reason.clone(),
                }
            }
        };
        Ok(Dispatch {
            outcome,
            reply: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Record access announced by the owner, after checking that the key
    /// actually opens for us.
    pub(crate) async fn adopt(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        file_id: FileId,
        terms: &GrantTerms,
        sealed: &SealedKey,
    ) -> Result<AccessGrant> {
        let wrapped = WrappedKey::from_sealed(file_id, ctx.profile.clone(), sealed);
        self.keys.unwrap(&ctx.profile, &wrapped)?;

        let key = GrantKey::new(file_id, ctx.profile.clone());
        let _guard = self.grant_locks.lock((key.file_id, key.peer_id.clone())).await;
        let current = self.store.get_grant(&key.file_id, &key.peer_id).await?;
        let t = state::adopt_grant(current.as_ref(), &key, &pdu.chat_id, terms, wrapped)?;
        self.store.commit_transition(&t).await?;

        if t.changed {
            info!(
                file = %file_id,
                owner = %pdu.sender,
                lifecycle = t.next.lifecycle,
                expires_at = ?t.next.expires_at,
                "access granted by owner"
            );
        }
        Ok(t.next)
    }

    /// Wrap a file's key for a trusted peer's credential.
    pub(crate) async fn wrap_for_peer(
        &self,
        ctx: &SessionContext,
        file: &FileRecord,
        peer_id: &PeerId,
    ) -> Result<WrappedKey> {
        let credential = self
            .keys
            .peer_credential(&file.chat_id, peer_id)?
            .ok_or_else(|| EngineError::UnknownPeer(format!("no credential for {peer_id}")))?;
        let owner_key = file
            .owner_key
            .as_ref()
            .ok_or_else(|| EngineError::CryptoFailure("file key not held".into()))?;
        let file_key = self.keys.unwrap(&ctx.profile, owner_key)?;
        Ok(WrappedKey::seal(
            file.file_id,
            peer_id.clone(),
            &file_key,
            &credential,
        )?)
    }

    async fn require_file_in(&self, chat_id: &ChatId, file_id: &FileId) -> Result<FileRecord> {
        let file = self.require_file(file_id).await?;
        if &file.chat_id != chat_id {
            return Err(EngineError::UnknownFile(file_id.to_hex()));
        }
        Ok(file)
    }

    async fn require_owned_file_in(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
    ) -> Result<FileRecord> {
        let file = self.require_owned_file(ctx, file_id).await?;
        if &file.chat_id != chat_id {
            return Err(EngineError::UnknownFile(file_id.to_hex()));
        }
        Ok(file)
    }

    /// Preconditions for PDUs the owner sends to a grantee.
    async fn require_grantee_file(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        grantee: &PeerId,
        file_id: &FileId,
    ) -> Result<FileRecord> {
        if grantee != &ctx.profile {
            return Err(not_addressed(grantee));
        }
        let file = self.require_file_in(&pdu.chat_id, file_id).await?;
        if file.owner != pdu.sender {
            return Err(not_owner(&pdu.sender));
        }
        Ok(file)
    }

    async fn is_trusted(&self, chat_id: &ChatId, peer_id: &PeerId) -> Result<bool> {
        Ok(self
            .store
            .get_peer(chat_id, peer_id)
            .await?
            .map_or(false, |p| p.is_trusted()))
    }

    fn refuse(&self, ctx: &SessionContext, pdu: &Pdu, file_id: FileId, reason: &str) -> Dispatch {
        warn!(
            chat = %pdu.chat_id,
            file = %file_id,
            peer = %pdu.sender,
            kind = pdu.kind().name(),
            "request from untrusted peer refused"
        );
        Dispatch {
            outcome: Outcome::Refused {
                file_id,
                peer_id: pdu.sender.clone(),
                reason: reason.to_string(),
            },
            reply: Some(Pdu::new(
                ctx.profile.clone(),
                pdu.chat_id.clone(),
                AccessDeniedNotice {
                    file_id,
                    grantee: pdu.sender.clone(),
                    reason: reason.to_string(),
                },
            )),
        }
    }
}

pub(crate) fn not_addressed(grantee: &PeerId) -> EngineError {
    EngineError::invalid(format!("message is addressed to {grantee}"))
}

pub(crate) fn not_owner(sender: &PeerId) -> EngineError {
    EngineError::invalid(format!("{sender} does not own the file"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{connected, pair, Harness, START};
    use prv_perms::DenyReason;

    /// Alice shares a file with Bob and Bob has applied it.
    async fn shared(chat_id: &ChatId, permissions: Permissions) -> (Harness, Harness, FileId) {
        let (alice, bob) = connected(chat_id).await;
        let outcome = alice.encrypt(chat_id, b"quarterly numbers", permissions).await;
        bob.deliver(&outcome.outgoing[0]).await;
        (alice, bob, outcome.file_id)
    }

    async fn decision(h: &Harness, file_id: &FileId) -> AccessDecision {
        h.engine
            .check_access(&h.ctx, file_id, &h.ctx.profile, Operation::Decrypt)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_revoke_reaches_grantee() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        assert_eq!(decision(&bob, &file_id).await, AccessDecision::Allowed);

        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "project over")
            .await
            .unwrap();
        assert_eq!(revoked.grant.state, GrantState::Revoked);
        assert!(revoked.grant.wrapped_key.is_none());

        let processed = bob.deliver(&revoked.reply).await;
        let Outcome::GrantUpdated { grant } = processed.outcome else {
            panic!("expected GrantUpdated");
        };
        assert_eq!(grant.state, GrantState::Revoked);
        assert!(grant.wrapped_key.is_none());
        assert_eq!(
            decision(&bob, &file_id).await,
            AccessDecision::Denied(DenyReason::Revoked(Some("project over".into())))
        );

        let status = bob
            .engine
            .file_access_status(&bob.ctx, &chat, &file_id)
            .await
            .unwrap();
        assert_eq!(status.status, AccessStatus::Revoked);
        assert_eq!(status.reason.as_deref(), Some("project over"));
    }

    #[tokio::test]
    async fn test_revoked_grant_cannot_be_regranted_directly() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "oops")
            .await
            .unwrap();

        let err = alice
            .engine
            .accept(&alice.ctx, &chat, &file_id, &bob.ctx.profile, Permissions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);

        let err = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "again")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    #[tokio::test]
    async fn test_request_after_revoke_opens_new_lifecycle() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;

        let request = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        assert_eq!(request.grant.state, GrantState::Requested);
        assert_eq!(request.grant.lifecycle, 2);

        let processed = alice.deliver(&request.reply).await;
        assert!(matches!(processed.outcome, Outcome::GrantRequested { .. }));
        let status = alice
            .engine
            .file_access_status(&alice.ctx, &chat, &file_id)
            .await
            .unwrap();
        assert_eq!(status.status, AccessStatus::WaitingOwnerAction);
        let status = bob
            .engine
            .file_access_status(&bob.ctx, &chat, &file_id)
            .await
            .unwrap();
        assert_eq!(status.status, AccessStatus::Requested);

        let accepted = alice
            .engine
            .accept(
                &alice.ctx,
                &chat,
                &file_id,
                &bob.ctx.profile,
                Permissions::new(true, false, 0),
            )
            .await
            .unwrap();
        assert_eq!(accepted.grant.lifecycle, 2);

        bob.deliver(&accepted.reply).await;
        let grant = bob
            .engine
            .grant(&file_id, &bob.ctx.profile)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.state, GrantState::Granted);
        assert_eq!(grant.lifecycle, 2);
        assert!(grant.wrapped_key.is_some());
        assert_eq!(decision(&bob, &file_id).await, AccessDecision::Allowed);

        let history = alice
            .engine
            .grant_history(&file_id, &bob.ctx.profile)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, GrantState::Revoked);
    }

    #[tokio::test]
    async fn test_accept_redelivery_is_idempotent() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;
        let request = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        alice.deliver(&request.reply).await;
        let accepted = alice
            .engine
            .accept(&alice.ctx, &chat, &file_id, &bob.ctx.profile, Permissions::default())
            .await
            .unwrap();

        let raw = accepted.encoded_reply();
        let first = bob
            .engine
            .process_message(&bob.ctx, raw.as_bytes())
            .await
            .unwrap();
        let second = bob
            .engine
            .process_message(&bob.ctx, raw.as_bytes())
            .await
            .unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);

        let grants = bob.engine.grants_for_file(&file_id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].state, GrantState::Granted);
        assert!(grants[0].wrapped_key.is_some());
    }

    #[tokio::test]
    async fn test_stale_revoke_is_rejected() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;
        let request = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        alice.deliver(&request.reply).await;
        let accepted = alice
            .engine
            .accept(&alice.ctx, &chat, &file_id, &bob.ctx.profile, Permissions::default())
            .await
            .unwrap();
        bob.deliver(&accepted.reply).await;

        // The first lifecycle's revocation, resent under a new message id.
        let stale = Pdu::new(
            alice.ctx.profile.clone(),
            chat.clone(),
            revoked.reply.body.clone(),
        );
        let err = bob
            .engine
            .process_message(&bob.ctx, codec::encode(&stale).as_bytes())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
        assert_eq!(decision(&bob, &file_id).await, AccessDecision::Allowed);
    }

    #[tokio::test]
    async fn test_deny_request() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;
        let request = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        alice.deliver(&request.reply).await;

        let denied = alice
            .engine
            .deny(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "not this time")
            .await
            .unwrap();
        assert_eq!(denied.grant.state, GrantState::Denied);

        bob.deliver(&denied.reply).await;
        let status = bob
            .engine
            .file_access_status(&bob.ctx, &chat, &file_id)
            .await
            .unwrap();
        assert_eq!(status.status, AccessStatus::Denied);
        assert_eq!(status.reason.as_deref(), Some("not this time"));

        let err = alice
            .engine
            .deny(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "twice")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyResolved);
    }

    #[tokio::test]
    async fn test_request_lifecycle_must_follow_current() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;

        let cases = [
            (u32::MAX, ErrorKind::MalformedMessage),
            (0, ErrorKind::MalformedMessage),
            (7, ErrorKind::InvalidArgument),
        ];
        for (lifecycle, kind) in cases {
            let pdu = Pdu::new(
                bob.ctx.profile.clone(),
                chat.clone(),
                AccessGrantRequest { file_id, lifecycle },
            );
            let err = alice
                .engine
                .process_message(&alice.ctx, codec::encode(&pdu).as_bytes())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), kind, "lifecycle {lifecycle}");
            let err = alice.engine.process_pdu(&alice.ctx, pdu).await.unwrap_err();
            assert_eq!(err.kind(), kind, "lifecycle {lifecycle}");
        }

        let grant = alice
            .engine
            .grant(&file_id, &bob.ctx.profile)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.state, GrantState::Revoked);
        assert_eq!(grant.lifecycle, 1);

        // Deny and re-request still walk one lifecycle at a time.
        let request = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        alice.deliver(&request.reply).await;
        let denied = alice
            .engine
            .deny(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "no")
            .await
            .unwrap();
        bob.deliver(&denied.reply).await;
        let again = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        assert_eq!(again.grant.lifecycle, 3);
        let processed = alice.deliver(&again.reply).await;
        let Outcome::GrantRequested { grant } = processed.outcome else {
            panic!("expected GrantRequested");
        };
        assert_eq!(grant.lifecycle, 3);
    }

    #[tokio::test]
    async fn test_reject_for_newer_lifecycle_archives_grantee_record() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;

        // Bob's request reaches Alice without Bob's own record moving on.
        let request = Pdu::new(
            bob.ctx.profile.clone(),
            chat.clone(),
            AccessGrantRequest { file_id, lifecycle: 2 },
        );
        alice.deliver(&request).await;
        let denied = alice
            .engine
            .deny(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "not this time")
            .await
            .unwrap();
        assert_eq!(denied.grant.lifecycle, 2);

        let processed = bob.deliver(&denied.reply).await;
        let Outcome::GrantUpdated { grant } = processed.outcome else {
            panic!("expected GrantUpdated");
        };
        assert_eq!(grant.state, GrantState::Denied);
        assert_eq!(grant.lifecycle, 2);
        assert_eq!(grant.reason.as_deref(), Some("not this time"));

        let history = bob
            .engine
            .grant_history(&file_id, &bob.ctx.profile)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].state, GrantState::Revoked);
        assert_eq!(history[0].lifecycle, 1);
        assert_eq!(history[0].reason.as_deref(), Some("rotate"));

        let again = bob.engine.request_grant(&bob.ctx, &chat, &file_id).await.unwrap();
        assert_eq!(again.grant.lifecycle, 3);
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let chat = ChatId::from("chat1");
        let (_alice, bob, file_id) = shared(&chat, Permissions::new(true, false, 60)).await;

        bob.clock.set(START + 59_999);
        assert_eq!(decision(&bob, &file_id).await, AccessDecision::Allowed);

        bob.clock.set(START + 60_000);
        assert_eq!(
            decision(&bob, &file_id).await,
            AccessDecision::Denied(DenyReason::Expired { at: START + 60_000 })
        );
        let status = bob
            .engine
            .file_access_status(&bob.ctx, &chat, &file_id)
            .await
            .unwrap();
        assert_eq!(status.status, AccessStatus::Expired);
        assert_eq!(status.expires_at, Some(START + 60_000));
    }

    #[tokio::test]
    async fn test_permission_flags() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::new(false, true, 0)).await;
        let expected = [
            (Operation::Decrypt, AccessDecision::Allowed),
            (Operation::Forward, AccessDecision::Allowed),
            (
                Operation::Download,
                AccessDecision::Denied(DenyReason::DownloadNotAllowed),
            ),
        ];
        for (op, want) in expected {
            let got = alice
                .engine
                .check_access(&alice.ctx, &file_id, &bob.ctx.profile, op)
                .await
                .unwrap();
            assert_eq!(got, want, "{op:?}");
        }

        // The owner is never restricted.
        let owner = alice
            .engine
            .check_access(&alice.ctx, &file_id, &alice.ctx.profile, Operation::Download)
            .await
            .unwrap();
        assert_eq!(owner, AccessDecision::Allowed);
    }

    #[tokio::test]
    async fn test_accept_needs_trusted_peer() {
        let (alice, bob) = pair().await;
        let chat = ChatId::from("chat1");
        let outcome = alice.encrypt(&chat, b"data", Permissions::default()).await;
        assert!(outcome.grants.is_empty());

        let err = alice
            .engine
            .accept(&alice.ctx, &chat, &outcome.file_id, &bob.ctx.profile, Permissions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownPeer);

        let err = alice
            .engine
            .accept(&alice.ctx, &chat, &outcome.file_id, &alice.ctx.profile, Permissions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_owner_moves_need_ownership() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;

        let err = bob
            .engine
            .revoke(&bob.ctx, &chat, &file_id, &alice.ctx.profile, "mine now")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFile);

        let err = alice
            .engine
            .revoke(&alice.ctx, &"other".into(), &file_id, &bob.ctx.profile, "wrong chat")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownFile);

        let long = "x".repeat(validation::limits::MAX_REASON_LEN + 1);
        let err = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, &long)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_key_redelivery() {
        let chat = ChatId::from("chat1");
        let (alice, bob, file_id) = shared(&chat, Permissions::default()).await;

        let ask = bob.engine.request_key(&bob.ctx, &chat, &file_id).await.unwrap();
        let processed = alice.deliver(&ask).await;
        assert!(matches!(
            processed.outcome,
            Outcome::KeyRequest { decision: AccessDecision::Allowed, .. }
        ));
        let reply = processed.reply.unwrap();
        assert_eq!(reply.kind(), prv_core::PduKind::AccessGrantAccept);
        let refreshed = bob.deliver(&reply).await;
        assert!(matches!(refreshed.outcome, Outcome::GrantUpdated { .. }));

        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &file_id, &bob.ctx.profile, "done")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;

        let ask = bob.engine.request_key(&bob.ctx, &chat, &file_id).await.unwrap();
        let reply = alice.deliver(&ask).await.reply.unwrap();
        assert_eq!(reply.kind(), prv_core::PduKind::AccessDeniedNotice);

        // Already revoked on our side, so the notice changes nothing.
        let noted = bob.deliver(&reply).await;
        assert!(matches!(noted.outcome, Outcome::Noted { .. }));
    }

    #[tokio::test]
    async fn test_delete_chat_closes_grants() {
        let chat = ChatId::from("chat1");
        let (alice, bob, granted) = shared(&chat, Permissions::default()).await;

        let second = alice.encrypt(&chat, b"second", Permissions::default()).await;
        bob.deliver(&second.outgoing[0]).await;
        let revoked = alice
            .engine
            .revoke(&alice.ctx, &chat, &second.file_id, &bob.ctx.profile, "rotate")
            .await
            .unwrap();
        bob.deliver(&revoked.reply).await;
        let request = bob
            .engine
            .request_grant(&bob.ctx, &chat, &second.file_id)
            .await
            .unwrap();
        alice.deliver(&request.reply).await;

        let deletion = alice.engine.delete_chat(&alice.ctx, &chat).await.unwrap();
        assert_eq!(deletion, ChatDeletion { revoked: 1, denied: 1 });

        let grant = alice
            .engine
            .grant(&granted, &bob.ctx.profile)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(grant.state, GrantState::Revoked);
        assert_eq!(grant.reason.as_deref(), Some(CHAT_DELETED_REASON));
        assert!(grant.wrapped_key.is_none());

        let again = alice.engine.delete_chat(&alice.ctx, &chat).await.unwrap();
        assert_eq!(again, ChatDeletion::default());
    }
}
