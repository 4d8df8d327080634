//! Inbound message routing.
//!
//! Decode, serialize on the message id, answer re-deliveries from the
//! dedup cache, dispatch by PDU kind, cache the outcome. Only successful
//! outcomes are cached, so a message that failed can be retried.

use prv_core::{
    codec, validation, ChatId, CoreError, FileId, MessageId, Pdu, PduBody, PduKind, PeerId,
};
use prv_perms::{AccessDecision, AccessGrant, PeerRecord};
use prv_store::Store;
use tracing::{debug, warn};

use crate::context::SessionContext;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::trust::PeerResolution;

/// What processing a message did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// An inbound invitation was recorded. `peer.trust` tells whether it
    /// was accepted on the spot.
    PeerRequest { peer: PeerRecord },

    /// Our invitation was answered.
    PeerResponse(PeerResolution),

    /// A file was shared with us.
    FileShared { grant: AccessGrant },

    /// A grantee asked for its key again.
    KeyRequest {
        file_id: FileId,
        peer_id: PeerId,
        decision: AccessDecision,
    },

    /// A peer asked for access and waits for our decision.
    GrantRequested { grant: AccessGrant },

    /// A request from a peer we do not trust was turned away.
    Refused {
        file_id: FileId,
        peer_id: PeerId,
        reason: String,
    },

    /// The owner changed our grant.
    GrantUpdated { grant: AccessGrant },

    /// A notice that did not change anything.
    Noted { file_id: FileId, reason: String },
}

/// A processed message.
#[derive(Debug, Clone)]
pub struct Processed {
    pub message_id: MessageId,
    pub kind: PduKind,
    pub chat_id: ChatId,
    pub sender: PeerId,
    pub outcome: Outcome,

    /// PDU to send back, if any.
    pub reply: Option<Pdu>,
    /// `reply` in transport form.
    pub encoded_reply: Option<String>,

    /// True when the message id was seen before and this is the stored
    /// outcome.
    pub replayed: bool,
}

/// A handler's result.
pub(crate) struct Dispatch {
    pub outcome: Outcome,
    pub reply: Option<Pdu>,
}

impl<S: Store> Engine<S> {
    /// Process one inbound transport payload.
    pub async fn process_message(&self, ctx: &SessionContext, raw: &[u8]) -> Result<Processed> {
        self.ensure_initialized()?;
        let pdu = codec::decode(raw).map_err(|e| {
            warn!(profile = %ctx.profile, error = %e, "inbound message rejected");
            EngineError::from(e)
        })?;
        self.process_pdu(ctx, pdu).await
    }

    /// Process an already decoded PDU.
    pub async fn process_pdu(&self, ctx: &SessionContext, pdu: Pdu) -> Result<Processed> {
        self.ensure_initialized()?;
        validation::validate_pdu(&pdu).map_err(CoreError::MalformedMessage)?;
        if pdu.sender == ctx.profile {
            return Err(EngineError::invalid("message was sent by this profile"));
        }

        let _guard = self.message_locks.lock(pdu.message_id).await;

        let cached = self.dedup().get(&pdu.message_id);
        if let Some(mut cached) = cached {
            debug!(message = ?pdu.message_id, kind = pdu.kind().name(), "re-delivered message");
            cached.replayed = true;
            return Ok(cached);
        }

        let kind = pdu.kind();
        debug!(
            chat = %pdu.chat_id,
            peer = %pdu.sender,
            kind = kind.name(),
            "dispatching message"
        );

        let dispatched = match &pdu.body {
            PduBody::PeerAddRequest(b) => self.handle_add_request(ctx, &pdu, b).await,
            PduBody::PeerAddResponse(b) => self.handle_add_response(ctx, &pdu, b).await,
            PduBody::FileEncryptRequest(b) => self.handle_file_encrypt(ctx, &pdu, b).await,
            PduBody::FileDecryptRequest(b) => self.handle_decrypt_request(ctx, &pdu, b).await,
            PduBody::AccessGrantRequest(b) => self.handle_grant_request(ctx, &pdu, b).await,
            PduBody::AccessGrantAccept(b) => self.handle_grant_accept(ctx, &pdu, b).await,
            PduBody::AccessGrantReject(b) => self.handle_grant_reject(ctx, &pdu, b).await,
            PduBody::AccessRevokeRequest(b) => self.handle_revoke(ctx, &pdu, b).await,
            PduBody::AccessDeniedNotice(b) => self.handle_denied_notice(ctx, &pdu, b).await,
        };
        let dispatch = dispatched.map_err(|e| {
            debug!(kind = kind.name(), peer = %pdu.sender, error = %e, "message not applied");
            e
        })?;

        let processed = Processed {
            message_id: pdu.message_id,
            kind,
            chat_id: pdu.chat_id,
            sender: pdu.sender,
            encoded_reply: dispatch.reply.as_ref().map(codec::encode),
            reply: dispatch.reply,
            outcome: dispatch.outcome,
            replayed: false,
        };
        self.dedup().insert(processed.message_id, processed.clone());
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{connected, pair};
    use prv_core::{AccessGrantRequest, FileId};
    use prv_perms::{GrantState, Permissions};

    #[tokio::test]
    async fn test_rejects_garbage() {
        let (alice, _bob) = pair().await;
        let err = alice
            .engine
            .process_message(&alice.ctx, b"hello, world")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedMessage);
    }

    #[tokio::test]
    async fn test_rejects_own_messages() {
        let (alice, _bob) = pair().await;
        let pdu = Pdu::new(
            alice.ctx.profile.clone(),
            "chat1".into(),
            AccessGrantRequest {
                file_id: FileId::generate(),
                lifecycle: 1,
            },
        );
        let err = alice
            .engine
            .process_message(&alice.ctx, codec::encode(&pdu).as_bytes())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_redelivery_is_replayed() {
        let chat = ChatId::from("chat1");
        let (alice, bob) = connected(&chat).await;
        let outcome = alice.encrypt(&chat, b"secret", Permissions::default()).await;
        let raw = codec::encode(&outcome.outgoing[0]);

        let first = bob.engine.process_message(&bob.ctx, raw.as_bytes()).await.unwrap();
        assert!(!first.replayed);
        let second = bob.engine.process_message(&bob.ctx, raw.as_bytes()).await.unwrap();
        assert!(second.replayed);
        assert_eq!(first.outcome, second.outcome);

        let grants = bob.engine.grants_for_file(&outcome.file_id).await.unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].state, GrantState::Granted);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let (alice, bob) = pair().await;
        let chat = ChatId::from("chat1");
        let pdu = Pdu::new(
            bob.ctx.profile.clone(),
            chat.clone(),
            AccessGrantRequest {
                file_id: FileId::generate(),
                lifecycle: 1,
            },
        );
        let raw = codec::encode(&pdu);
        for _ in 0..2 {
            let err = alice
                .engine
                .process_message(&alice.ctx, raw.as_bytes())
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UnknownFile);
        }
    }

    #[tokio::test]
    async fn test_untrusted_request_is_refused() {
        let chat = ChatId::from("chat1");
        let (alice, _bob) = connected(&chat).await;
        let outcome = alice.encrypt(&chat, b"secret", Permissions::default()).await;

        let stranger = PeerId::from("mallory");
        let pdu = Pdu::new(
            stranger.clone(),
            chat.clone(),
            AccessGrantRequest {
                file_id: outcome.file_id,
                lifecycle: 1,
            },
        );
        let processed = alice
            .engine
            .process_message(&alice.ctx, codec::encode(&pdu).as_bytes())
            .await
            .unwrap();
        assert!(matches!(processed.outcome, Outcome::Refused { .. }));
        let reply = processed.reply.unwrap();
        assert_eq!(reply.kind(), PduKind::AccessDeniedNotice);
        assert!(processed.encoded_reply.is_some());
        assert!(alice
            .engine
            .grant(&outcome.file_id, &stranger)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_not_initialized() {
        let (alice, _bob) = pair().await;
        alice.engine.shutdown();
        let err = alice
            .engine
            .process_message(&alice.ctx, b"")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotInitialized);
    }
}
