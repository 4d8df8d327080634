//! Peer trust handshake.
//!
//! An invitation creates a Pending binding on the inviter's side; the
//! invitee's response settles it. Only Trusted peers ever receive wrapped
//! file keys.

use prv_core::{validation, ChatId, Pdu, PeerAddRequest, PeerAddResponse, PeerId};
use prv_perms::{peer, Direction, Invitation, PeerRecord, Resolution, TrustState, X25519PublicKey};
use prv_store::{Store, StoreExt};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::context::SessionContext;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::router::{Dispatch, Outcome};

/// A settled peer binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerResolution {
    pub chat_id: ChatId,
    pub peer_id: PeerId,
    pub trust: TrustState,
    pub reason: Option<String>,
    /// True when the binding was already settled the same way.
    pub replayed: bool,
}

impl PeerResolution {
    fn new(resolution: &Resolution) -> Self {
        let record = &resolution.record;
        Self {
            chat_id: record.chat_id.clone(),
            peer_id: record.peer_id.clone(),
            trust: record.trust,
            reason: record.reason.clone(),
            replayed: resolution.replayed,
        }
    }
}

/// Our answer to an inbound invitation.
#[derive(Debug, Clone)]
pub struct PeerAnswer {
    pub resolution: PeerResolution,
    pub reply: Pdu,
}

impl<S: Store> Engine<S> {
    // ─────────────────────────────────────────────────────────────────────────
    // Outbound handshake
    // ─────────────────────────────────────────────────────────────────────────

    /// Invite a peer into a protected chat.
    ///
    /// Records a Pending binding under `peer_id` (generated when absent) and
    /// returns the `PeerAddRequest` to send. The invitee answers under its
    /// own profile id; the binding is re-keyed when the answer arrives.
    pub async fn create_add_request(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        peer_name: &str,
        peer_email: Option<&str>,
        peer_id: Option<PeerId>,
    ) -> Result<Pdu> {
        self.ensure_initialized()?;
        validation::validate_id("chat_id", chat_id.as_str()).map_err(EngineError::argument)?;
        validation::validate_name("peer_name", peer_name).map_err(EngineError::argument)?;
        validation::validate_name("display_name", &ctx.display_name)
            .map_err(EngineError::argument)?;

        let peer_id = peer_id.unwrap_or_else(PeerId::random);
        validation::validate_id("peer_id", peer_id.as_str()).map_err(EngineError::argument)?;
        let credential = self.keys.public_key(&ctx.profile)?;

        let _guard = self.peer_locks.lock((chat_id.clone(), peer_id.clone())).await;
        let current = self.store.get_peer(chat_id, &peer_id).await?;
        let record = peer::invite(
            current.as_ref(),
            Invitation {
                chat_id: chat_id.clone(),
                peer_id: peer_id.clone(),
                name: peer_name.to_string(),
                email: peer_email.map(str::to_string),
                direction: Direction::Outbound,
            },
            self.now(),
        )?;
        self.store.put_peer(&record).await?;

        info!(
            chat = %chat_id,
            peer = %peer_id,
            generation = record.generation,
            "peer invitation created"
        );

        Ok(Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            PeerAddRequest {
                requester_name: ctx.display_name.clone(),
                requester_email: ctx.email.clone(),
                invitation_id: peer_id,
                invitee_name: peer_name.to_string(),
                invitee_email: peer_email.map(str::to_string),
                credential: *credential.as_bytes(),
            },
        ))
    }

    /// Settle a binding we created, given the invitee's answer.
    ///
    /// A second answer with the same outcome returns the earlier resolution
    /// with `replayed` set.
    pub async fn process_add_response(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        peer_id: &PeerId,
        accepted: bool,
        reason: Option<&str>,
    ) -> Result<PeerResolution> {
        self.ensure_initialized()?;
        if let Some(r) = reason {
            validation::validate_reason(r).map_err(EngineError::argument)?;
        }

        let _guard = self.peer_locks.lock((chat_id.clone(), peer_id.clone())).await;
        let record = self
            .store
            .get_peer(chat_id, peer_id)
            .await?
            .ok_or_else(|| unknown_peer(chat_id, peer_id))?;

        let resolution = peer::resolve(&record, accepted, reason, self.now())?;
        if !resolution.replayed {
            self.store.put_peer(&resolution.record).await?;
            info!(
                chat = %chat_id,
                peer = %peer_id,
                profile = %ctx.profile,
                trust = resolution.record.trust.as_str(),
                "peer binding settled"
            );
        }
        Ok(PeerResolution::new(&resolution))
    }

    /// Answer an inbound invitation that is still Pending.
    pub async fn answer_add_request(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        peer_id: &PeerId,
        accepted: bool,
        reason: Option<&str>,
    ) -> Result<PeerAnswer> {
        self.ensure_initialized()?;
        if let Some(r) = reason {
            validation::validate_reason(r).map_err(EngineError::argument)?;
        }

        let _guard = self.peer_locks.lock((chat_id.clone(), peer_id.clone())).await;
        let record = self
            .store
            .get_peer(chat_id, peer_id)
            .await?
            .ok_or_else(|| unknown_peer(chat_id, peer_id))?;
        if record.direction != Direction::Inbound {
            return Err(EngineError::invalid(format!(
                "{peer_id} was invited by us, not the other way round"
            )));
        }

        let resolution = peer::resolve(&record, accepted, reason, self.now())?;
        if !resolution.replayed {
            self.store.put_peer(&resolution.record).await?;
        }

        let reply = self.add_response(ctx, chat_id, &record.invitation_id, accepted, reason)?;
        Ok(PeerAnswer {
            resolution: PeerResolution::new(&resolution),
            reply,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn peer(&self, chat_id: &ChatId, peer_id: &PeerId) -> Result<Option<PeerRecord>> {
        self.ensure_initialized()?;
        Ok(self.store.get_peer(chat_id, peer_id).await?)
    }

    pub async fn peers(&self, chat_id: &ChatId) -> Result<Vec<PeerRecord>> {
        self.ensure_initialized()?;
        Ok(self.store.list_peers(chat_id).await?)
    }

    /// A chat is protected once at least one peer in it is Trusted.
    pub async fn is_chat_protected(&self, chat_id: &ChatId) -> Result<bool> {
        self.ensure_initialized()?;
        Ok(!self.store.trusted_peers(chat_id).await?.is_empty())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound handshake
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn handle_add_request(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &PeerAddRequest,
    ) -> Result<Dispatch> {
        let chat_id = &pdu.chat_id;
        let sender = &pdu.sender;
        let credential = X25519PublicKey::from_bytes(body.credential);
        let now = self.now();

        let _guard = self.peer_locks.lock((chat_id.clone(), sender.clone())).await;
        let current = self.store.get_peer(chat_id, sender).await?;

        let record = match current {
            Some(c) if c.is_trusted() => {
                match self.keys.peer_credential(chat_id, sender)? {
                    Some(known) if known != credential => {
                        return Err(EngineError::AlreadyResolved(format!(
                            "{sender} is trusted under another credential"
                        )))
                    }
                    Some(_) => {}
                    None => self.keys.store_peer_credential(chat_id, sender, credential)?,
                }
                debug!(chat = %chat_id, peer = %sender, "repeated invitation from trusted peer");
                c
            }
            Some(c) if c.trust == TrustState::Pending && c.direction == Direction::Outbound => {
                // We invited them under their own id while they invited us.
                self.keys.store_peer_credential(chat_id, sender, credential)?;
                let settled = peer::resolve(&c, true, None, now)?.record;
                self.store.put_peer(&settled).await?;
                info!(chat = %chat_id, peer = %sender, "mutual invitation settled");
                settled
            }
            current => {
                let mut record = peer::invite(
                    current.as_ref(),
                    Invitation {
                        chat_id: chat_id.clone(),
                        peer_id: sender.clone(),
                        name: body.requester_name.clone(),
                        email: body.requester_email.clone(),
                        direction: Direction::Inbound,
                    },
                    now,
                )?;
                record.invitation_id = body.invitation_id.clone();
                self.keys.store_peer_credential(chat_id, sender, credential)?;

                if self.config.auto_accept_peers {
                    record = peer::resolve(&record, true, None, now)?.record;
                }
                self.store.put_peer(&record).await?;
                info!(
                    chat = %chat_id,
                    peer = %sender,
                    trust = record.trust.as_str(),
                    "peer invitation received"
                );
                record
            }
        };

        let reply = if record.is_trusted() {
            Some(self.add_response(ctx, chat_id, &body.invitation_id, true, None)?)
        } else {
            None
        };

        Ok(Dispatch {
            outcome: Outcome::PeerRequest { peer: record },
            reply,
        })
    }

    pub(crate) async fn handle_add_response(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &PeerAddResponse,
    ) -> Result<Dispatch> {
        let chat_id = &pdu.chat_id;
        let sender = &pdu.sender;
        let invitation = &body.invitation_id;

        let _guards = self.lock_peers(chat_id, invitation, sender).await;

        let record = match self.store.get_peer(chat_id, invitation).await? {
            Some(r) => r,
            None => match self.store.get_peer(chat_id, sender).await? {
                Some(r) if &r.invitation_id == invitation => r,
                _ => return Err(unknown_peer(chat_id, invitation)),
            },
        };
        if record.direction != Direction::Outbound {
            return Err(unknown_peer(chat_id, invitation));
        }

        let credential = match (body.accepted, body.credential) {
            (true, Some(bytes)) => Some(X25519PublicKey::from_bytes(bytes)),
            (true, None) => {
                return Err(EngineError::MalformedMessage(
                    "accepted response carries no credential".into(),
                ))
            }
            (false, _) => None,
        };

        let mut resolution = peer::resolve(&record, body.accepted, body.reason.as_deref(), self.now())?;
        if !resolution.replayed {
            if let Some(credential) = credential {
                self.keys.store_peer_credential(chat_id, sender, credential)?;
            }

            let next = &mut resolution.record;
            if &next.peer_id != sender {
                let old_id = next.peer_id.clone();
                next.peer_id = sender.clone();
                self.store.rekey_peer(&old_id, next).await?;
            } else {
                self.store.put_peer(next).await?;
            }
            info!(
                chat = %chat_id,
                peer = %sender,
                profile = %ctx.profile,
                trust = next.trust.as_str(),
                "peer binding settled"
            );
        }

        Ok(Dispatch {
            outcome: Outcome::PeerResponse(PeerResolution::new(&resolution)),
            reply: None,
        })
    }

    fn add_response(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        invitation_id: &PeerId,
        accepted: bool,
        reason: Option<&str>,
    ) -> Result<Pdu> {
        let credential = if accepted {
            Some(*self.keys.public_key(&ctx.profile)?.as_bytes())
        } else {
            None
        };
        Ok(Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            PeerAddResponse {
                invitation_id: invitation_id.clone(),
                accepted,
                reason: reason.map(str::to_string),
                responder_name: ctx.display_name.clone(),
                credential,
            },
        ))
    }

    /// Lock two peer bindings in a fixed order.
    async fn lock_peers(
        &self,
        chat_id: &ChatId,
        a: &PeerId,
        b: &PeerId,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = vec![a.clone(), b.clone()];
        ids.sort();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.peer_locks.lock((chat_id.clone(), id)).await);
        }
        guards
    }
}

fn unknown_peer(chat_id: &ChatId, peer_id: &PeerId) -> EngineError {
    EngineError::UnknownPeer(format!("{peer_id} in chat {chat_id}"))
}
