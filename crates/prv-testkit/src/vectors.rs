//! Protocol vectors for cross-implementation checks.
//!
//! One fixed PDU per body kind, with deterministic ids, and the frame
//! header each must produce. Another implementation of the protocol can
//! decode these frames and compare fields.

use prv_core::{
    codec, AccessDeniedNotice, AccessGrantAccept, AccessGrantReject, AccessGrantRequest,
    AccessRevokeRequest, ChatId, FileDecryptRequest, FileEncryptRequest, FileId, GrantTerms,
    MessageId, Pdu, PduBody, PeerAddRequest, PeerAddResponse, PeerId, SealedKey,
};

/// A protocol vector.
#[derive(Debug, Clone)]
pub struct ProtocolVector {
    pub name: &'static str,
    pub pdu: Pdu,
    /// Expected first five frame bytes: magic, version and tag (hex).
    pub expected_header: &'static str,
}

const FILE: FileId = FileId::from_bytes([0x11; 16]);

fn sealed() -> SealedKey {
    SealedKey {
        ephemeral_public: [0x22; 32],
        nonce: [0x33; 12],
        ciphertext: vec![0x44; 48],
    }
}

fn terms() -> GrantTerms {
    GrantTerms {
        allow_download: true,
        allow_forward: false,
        access_time: 3600,
        granted_at: 1_700_000_000_000,
        expires_at: Some(1_700_003_600_000),
        lifecycle: 1,
    }
}

fn vector(
    name: &'static str,
    seq: u8,
    body: PduBody,
    expected_header: &'static str,
) -> ProtocolVector {
    ProtocolVector {
        name,
        pdu: Pdu {
            message_id: MessageId::from_bytes([seq; 16]),
            sender: PeerId::new("alice"),
            chat_id: ChatId::new("chat-1"),
            body,
        },
        expected_header,
    }
}

/// Get all protocol vectors.
pub fn all_vectors() -> Vec<ProtocolVector> {
    let bob = || PeerId::new("bob");
    vec![
        vector(
            "PeerAddRequest with emails",
            1,
            PeerAddRequest {
                requester_name: "Alice".into(),
                requester_email: Some("alice@example.com".into()),
                invitation_id: bob(),
                invitee_name: "Bob".into(),
                invitee_email: Some("bob@example.com".into()),
                credential: [0x55; 32],
            }
            .into(),
            "5052560101",
        ),
        vector(
            "PeerAddResponse rejected",
            2,
            PeerAddResponse {
                invitation_id: bob(),
                accepted: false,
                reason: Some("unknown sender".into()),
                responder_name: "Bob".into(),
                credential: None,
            }
            .into(),
            "5052560102",
        ),
        vector(
            "FileEncryptRequest",
            3,
            FileEncryptRequest {
                file_id: FILE,
                file_name: "report.pdf".into(),
                grantee: bob(),
                terms: terms(),
                wrapped_key: sealed(),
            }
            .into(),
            "5052560103",
        ),
        vector(
            "FileDecryptRequest",
            4,
            FileDecryptRequest { file_id: FILE }.into(),
            "5052560104",
        ),
        vector(
            "AccessGrantRequest second lifecycle",
            5,
            AccessGrantRequest {
                file_id: FILE,
                lifecycle: 2,
            }
            .into(),
            "5052560105",
        ),
        vector(
            "AccessGrantAccept",
            6,
            AccessGrantAccept {
                file_id: FILE,
                grantee: bob(),
                terms: terms(),
                wrapped_key: sealed(),
            }
            .into(),
            "5052560106",
        ),
        vector(
            "AccessGrantReject empty reason",
            7,
            AccessGrantReject {
                file_id: FILE,
                grantee: bob(),
                reason: String::new(),
                lifecycle: 1,
            }
            .into(),
            "5052560107",
        ),
        vector(
            "AccessRevokeRequest",
            8,
            AccessRevokeRequest {
                file_id: FILE,
                grantee: bob(),
                reason: "project closed".into(),
                lifecycle: 1,
            }
            .into(),
            "5052560108",
        ),
        vector(
            "AccessDeniedNotice",
            9,
            AccessDeniedNotice {
                file_id: FILE,
                grantee: bob(),
                reason: "peer not trusted".into(),
            }
            .into(),
            "5052560109",
        ),
    ]
}

/// Check every vector: header bytes, length field, and a lossless decode.
pub fn verify_all_vectors() -> Result<(), String> {
    for v in all_vectors() {
        let frame = codec::encode_binary(&v.pdu);
        let header = hex::encode(&frame[..5]);
        if header != v.expected_header {
            return Err(format!("{}: header {header}, expected {}", v.name, v.expected_header));
        }

        let len = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;
        if len != frame.len() - codec::HEADER_LEN {
            return Err(format!("{}: length field {len} does not match body", v.name));
        }

        let decoded = codec::decode(codec::encode(&v.pdu).as_bytes())
            .map_err(|e| format!("{}: {e}", v.name))?;
        if decoded != v.pdu {
            return Err(format!("{}: decoded PDU differs", v.name));
        }
    }
    Ok(())
}
