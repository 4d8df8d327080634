//! Proptest generators for property-based testing.
//!
//! Every strategy produces values that pass `validate_pdu`, so a generated
//! PDU must survive an encode/decode cycle unchanged.

use proptest::prelude::*;

use prv_core::validation::limits;
use prv_core::{
    AccessDeniedNotice, AccessGrantAccept, AccessGrantReject, AccessGrantRequest,
    AccessRevokeRequest, ChatId, FileDecryptRequest, FileEncryptRequest, FileId, GrantTerms,
    MessageId, Pdu, PduBody, PeerAddRequest, PeerAddResponse, PeerId, SealedKey,
};

/// Generate a peer or profile id.
pub fn peer_id() -> impl Strategy<Value = PeerId> {
    "[a-zA-Z0-9_-]{1,64}".prop_map(PeerId)
}

/// Generate a chat id.
pub fn chat_id() -> impl Strategy<Value = ChatId> {
    "[a-zA-Z0-9_:.-]{1,64}".prop_map(ChatId)
}

pub fn file_id() -> impl Strategy<Value = FileId> {
    any::<[u8; 16]>().prop_map(FileId::from_bytes)
}

pub fn message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 16]>().prop_map(MessageId::from_bytes)
}

/// Generate a display name: never blank.
pub fn display_name() -> impl Strategy<Value = String> {
    "[A-Za-z][A-Za-z0-9 .'-]{0,40}".prop_map(String::from)
}

pub fn email() -> impl Strategy<Value = Option<String>> {
    proptest::option::of("[a-z]{1,12}@[a-z]{1,12}\\.(com|org|net)".prop_map(String::from))
}

/// Generate a reason, including the empty one.
pub fn reason() -> impl Strategy<Value = String> {
    "\\PC{0,64}".prop_map(String::from)
}

pub fn file_name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_-]{1,32}(\\.[a-z]{1,4})?".prop_map(String::from)
}

pub fn lifecycle() -> impl Strategy<Value = u32> {
    1u32..=1000
}

/// Generate a sealed key with the wire length of a real one.
pub fn sealed_key() -> impl Strategy<Value = SealedKey> {
    (
        any::<[u8; 32]>(),
        any::<[u8; 12]>(),
        prop::collection::vec(any::<u8>(), limits::SEALED_KEY_LEN),
    )
        .prop_map(|(ephemeral_public, nonce, ciphertext)| SealedKey {
            ephemeral_public,
            nonce,
            ciphertext,
        })
}

/// Generate grant terms. `access_time` covers zero and negative values.
pub fn grant_terms() -> impl Strategy<Value = GrantTerms> {
    (
        any::<bool>(),
        any::<bool>(),
        prop_oneof![Just(0i64), -86_400i64..0, 1i64..=31_536_000],
        0i64..=2_000_000_000_000,
        lifecycle(),
    )
        .prop_map(
            |(allow_download, allow_forward, access_time, granted_at, lifecycle)| GrantTerms {
                allow_download,
                allow_forward,
                access_time,
                granted_at,
                expires_at: (access_time > 0).then(|| granted_at + access_time * 1000),
                lifecycle,
            },
        )
}

pub fn peer_add_request() -> impl Strategy<Value = PeerAddRequest> {
    (
        display_name(),
        email(),
        peer_id(),
        display_name(),
        email(),
        any::<[u8; 32]>(),
    )
        .prop_map(
            |(requester_name, requester_email, invitation_id, invitee_name, invitee_email, credential)| {
                PeerAddRequest {
                    requester_name,
                    requester_email,
                    invitation_id,
                    invitee_name,
                    invitee_email,
                    credential,
                }
            },
        )
}

/// Accepted responses carry a credential, rejections a reason.
pub fn peer_add_response() -> impl Strategy<Value = PeerAddResponse> {
    (peer_id(), any::<bool>(), reason(), display_name(), any::<[u8; 32]>()).prop_map(
        |(invitation_id, accepted, reason, responder_name, credential)| PeerAddResponse {
            invitation_id,
            accepted,
            reason: (!accepted).then_some(reason),
            responder_name,
            credential: accepted.then_some(credential),
        },
    )
}

pub fn file_encrypt_request() -> impl Strategy<Value = FileEncryptRequest> {
    (file_id(), file_name(), peer_id(), grant_terms(), sealed_key()).prop_map(
        |(file_id, file_name, grantee, terms, wrapped_key)| FileEncryptRequest {
            file_id,
            file_name,
            grantee,
            terms,
            wrapped_key,
        },
    )
}

pub fn access_grant_accept() -> impl Strategy<Value = AccessGrantAccept> {
    (file_id(), peer_id(), grant_terms(), sealed_key()).prop_map(
        |(file_id, grantee, terms, wrapped_key)| AccessGrantAccept {
            file_id,
            grantee,
            terms,
            wrapped_key,
        },
    )
}

/// Generate any PDU body.
pub fn pdu_body() -> impl Strategy<Value = PduBody> {
    prop_oneof![
        peer_add_request().prop_map(PduBody::from),
        peer_add_response().prop_map(PduBody::from),
        file_encrypt_request().prop_map(PduBody::from),
        file_id().prop_map(|file_id| FileDecryptRequest { file_id }.into()),
        (file_id(), lifecycle())
            .prop_map(|(file_id, lifecycle)| AccessGrantRequest { file_id, lifecycle }.into()),
        access_grant_accept().prop_map(PduBody::from),
        (file_id(), peer_id(), reason(), lifecycle()).prop_map(
            |(file_id, grantee, reason, lifecycle)| AccessGrantReject {
                file_id,
                grantee,
                reason,
                lifecycle,
            }
            .into()
        ),
        (file_id(), peer_id(), reason(), lifecycle()).prop_map(
            |(file_id, grantee, reason, lifecycle)| AccessRevokeRequest {
                file_id,
                grantee,
                reason,
                lifecycle,
            }
            .into()
        ),
        (file_id(), peer_id(), reason()).prop_map(|(file_id, grantee, reason)| {
            AccessDeniedNotice {
                file_id,
                grantee,
                reason,
            }
            .into()
        }),
    ]
}

/// Generate a complete PDU.
pub fn pdu() -> impl Strategy<Value = Pdu> {
    (message_id(), peer_id(), chat_id(), pdu_body()).prop_map(|(message_id, sender, chat_id, body)| {
        Pdu {
            message_id,
            sender,
            chat_id,
            body,
        }
    })
}
