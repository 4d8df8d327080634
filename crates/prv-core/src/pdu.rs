//! Protocol data units.
//!
//! A PDU is one structured message of the engine's binary protocol. Every
//! PDU shares an envelope (message id, sender, chat) and carries a tagged
//! body. PDUs are immutable value objects: they are built once, encoded,
//! decoded and consumed, never mutated in place.

use serde::{Deserialize, Serialize};

use crate::types::{ChatId, FileId, MessageId, PeerId};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Discriminator for PDU bodies. The value is the on-wire tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduKind {
    PeerAddRequest = 1,
    PeerAddResponse = 2,
    FileEncryptRequest = 3,
    FileDecryptRequest = 4,
    AccessGrantRequest = 5,
    AccessGrantAccept = 6,
    AccessGrantReject = 7,
    AccessRevokeRequest = 8,
    AccessDeniedNotice = 9,
}

impl PduKind {
    /// Parse a tag byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PduKind::PeerAddRequest),
            2 => Some(PduKind::PeerAddResponse),
            3 => Some(PduKind::FileEncryptRequest),
            4 => Some(PduKind::FileDecryptRequest),
            5 => Some(PduKind::AccessGrantRequest),
            6 => Some(PduKind::AccessGrantAccept),
            7 => Some(PduKind::AccessGrantReject),
            8 => Some(PduKind::AccessRevokeRequest),
            9 => Some(PduKind::AccessDeniedNotice),
            _ => None,
        }
    }

    /// The on-wire tag byte.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable name, used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            PduKind::PeerAddRequest => "peer_add_request",
            PduKind::PeerAddResponse => "peer_add_response",
            PduKind::FileEncryptRequest => "file_encrypt_request",
            PduKind::FileDecryptRequest => "file_decrypt_request",
            PduKind::AccessGrantRequest => "access_grant_request",
            PduKind::AccessGrantAccept => "access_grant_accept",
            PduKind::AccessGrantReject => "access_grant_reject",
            PduKind::AccessRevokeRequest => "access_revoke_request",
            PduKind::AccessDeniedNotice => "access_denied_notice",
        }
    }
}

/// A complete protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Unique id of this message, used for deduplication.
    pub message_id: MessageId,

    /// Profile id of the sending peer.
    pub sender: PeerId,

    /// The chat this message belongs to.
    pub chat_id: ChatId,

    /// The typed body.
    pub body: PduBody,
}

impl Pdu {
    /// Build a PDU with a freshly generated message id.
    pub fn new(sender: PeerId, chat_id: ChatId, body: impl Into<PduBody>) -> Self {
        Self {
            message_id: MessageId::generate(),
            sender,
            chat_id,
            body: body.into(),
        }
    }

    /// The body discriminator.
    pub fn kind(&self) -> PduKind {
        self.body.kind()
    }
}

/// Tagged PDU body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PduBody {
    PeerAddRequest(PeerAddRequest),
    PeerAddResponse(PeerAddResponse),
    FileEncryptRequest(FileEncryptRequest),
    FileDecryptRequest(FileDecryptRequest),
    AccessGrantRequest(AccessGrantRequest),
    AccessGrantAccept(AccessGrantAccept),
    AccessGrantReject(AccessGrantReject),
    AccessRevokeRequest(AccessRevokeRequest),
    AccessDeniedNotice(AccessDeniedNotice),
}

impl PduBody {
    /// The body discriminator.
    pub fn kind(&self) -> PduKind {
        match self {
            PduBody::PeerAddRequest(_) => PduKind::PeerAddRequest,
            PduBody::PeerAddResponse(_) => PduKind::PeerAddResponse,
            PduBody::FileEncryptRequest(_) => PduKind::FileEncryptRequest,
            PduBody::FileDecryptRequest(_) => PduKind::FileDecryptRequest,
            PduBody::AccessGrantRequest(_) => PduKind::AccessGrantRequest,
            PduBody::AccessGrantAccept(_) => PduKind::AccessGrantAccept,
            PduBody::AccessGrantReject(_) => PduKind::AccessGrantReject,
            PduBody::AccessRevokeRequest(_) => PduKind::AccessRevokeRequest,
            PduBody::AccessDeniedNotice(_) => PduKind::AccessDeniedNotice,
        }
    }

    /// The file this body refers to, if any.
    pub fn file_id(&self) -> Option<FileId> {
        match self {
            PduBody::PeerAddRequest(_) | PduBody::PeerAddResponse(_) => None,
            PduBody::FileEncryptRequest(b) => Some(b.file_id),
            PduBody::FileDecryptRequest(b) => Some(b.file_id),
            PduBody::AccessGrantRequest(b) => Some(b.file_id),
            PduBody::AccessGrantAccept(b) => Some(b.file_id),
            PduBody::AccessGrantReject(b) => Some(b.file_id),
            PduBody::AccessRevokeRequest(b) => Some(b.file_id),
            PduBody::AccessDeniedNotice(b) => Some(b.file_id),
        }
    }
}

macro_rules! impl_into_body {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for PduBody {
                fn from(body: $variant) -> Self {
                    PduBody::$variant(body)
                }
            }
        )*
    };
}

impl_into_body!(
    PeerAddRequest,
    PeerAddResponse,
    FileEncryptRequest,
    FileDecryptRequest,
    AccessGrantRequest,
    AccessGrantAccept,
    AccessGrantReject,
    AccessRevokeRequest,
    AccessDeniedNotice,
);

/// A file key sealed for one recipient, as carried on the wire.
///
/// The cryptography lives in `prv-perms`; here it is opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedKey {
    /// Sender's ephemeral X25519 public key.
    pub ephemeral_public: [u8; 32],

    /// AEAD nonce.
    pub nonce: [u8; 12],

    /// The encrypted file key (includes authentication tag).
    pub ciphertext: Vec<u8>,
}

/// Permission attributes of a grant, as agreed by the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantTerms {
    /// The grantee may save a plaintext copy.
    pub allow_download: bool,

    /// The grantee may forward the file to others.
    pub allow_forward: bool,

    /// Requested access duration in seconds; `<= 0` means no expiry.
    pub access_time: i64,

    /// When the owner granted access (Unix milliseconds, owner clock).
    pub granted_at: i64,

    /// When access ends (Unix milliseconds), if it ends.
    pub expires_at: Option<i64>,

    /// Lifecycle counter of the grant this belongs to.
    pub lifecycle: u32,
}

/// Invitation to establish a trusted peer binding within a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddRequest {
    /// Display name of the inviting profile.
    pub requester_name: String,

    /// Email of the inviting profile.
    pub requester_email: Option<String>,

    /// Id under which the inviter tracks the invitee.
    pub invitation_id: PeerId,

    /// Display name the inviter knows the invitee by.
    pub invitee_name: String,

    /// Email the inviter knows the invitee by.
    pub invitee_email: Option<String>,

    /// Inviter's X25519 public credential.
    pub credential: [u8; 32],
}

/// Answer to a [`PeerAddRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddResponse {
    /// Echo of the request's invitation id.
    pub invitation_id: PeerId,

    pub accepted: bool,

    /// Why the invitation was rejected.
    pub reason: Option<String>,

    /// Display name of the responding profile.
    pub responder_name: String,

    /// Responder's X25519 public credential (present when accepted).
    pub credential: Option<[u8; 32]>,
}

/// Announcement of a newly sealed file with its initial grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEncryptRequest {
    pub file_id: FileId,

    /// Original file name (without the artifact extension).
    pub file_name: String,

    /// Peer the wrapped key is sealed for.
    pub grantee: PeerId,

    pub terms: GrantTerms,

    pub wrapped_key: SealedKey,
}

/// Request for (re-)delivery of the wrapped key of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDecryptRequest {
    pub file_id: FileId,
}

/// Request for access to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrantRequest {
    pub file_id: FileId,

    /// Lifecycle the requester opened on its side.
    pub lifecycle: u32,
}

/// Owner's acceptance of an access request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrantAccept {
    pub file_id: FileId,
    pub grantee: PeerId,
    pub terms: GrantTerms,
    pub wrapped_key: SealedKey,
}

/// Owner's refusal of an access request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrantReject {
    pub file_id: FileId,
    pub grantee: PeerId,
    pub reason: String,
    pub lifecycle: u32,
}

/// Owner's revocation of a previously granted access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRevokeRequest {
    pub file_id: FileId,
    pub grantee: PeerId,
    pub reason: String,
    pub lifecycle: u32,
}

/// Notice that a request could not be honoured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDeniedNotice {
    pub file_id: FileId,
    pub grantee: PeerId,
    pub reason: String,
}
