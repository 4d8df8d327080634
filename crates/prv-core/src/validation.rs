//! Structural validation of decoded PDUs.
//!
//! The codec guarantees the frame is well-formed; this module checks that
//! the fields inside are within limits.

use crate::error::Malformation;
use crate::pdu::{Pdu, PduBody};

/// Field size limits.
pub mod limits {
    /// Max bytes in a chat or peer id.
    pub const MAX_ID_LEN: usize = 128;
    /// Max bytes in a display name or email.
    pub const MAX_NAME_LEN: usize = 512;
    /// Max bytes in a deny/revoke reason.
    pub const MAX_REASON_LEN: usize = 512;
    /// Max bytes in a file name.
    pub const MAX_FILE_NAME_LEN: usize = 1024;
    /// Max bytes of a sealed file key (32-byte key + 16-byte tag).
    pub const SEALED_KEY_LEN: usize = 48;
    /// Highest grant lifecycle a peer may name. Lifecycles start at 1.
    pub const MAX_LIFECYCLE: u32 = 1_000_000;
    /// Max body bytes in one PDU frame.
    pub const MAX_BODY_LEN: usize = 64 * 1024;
}

fn check_id(field: &str, value: &str) -> Result<(), Malformation> {
    if value.is_empty() {
        return Err(Malformation::Field(format!("{field} is empty")));
    }
    if value.len() > limits::MAX_ID_LEN {
        return Err(Malformation::Field(format!("{field} too long")));
    }
    Ok(())
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), Malformation> {
    if value.len() > max {
        return Err(Malformation::Field(format!(
            "{field} is {} bytes, limit {max}",
            value.len()
        )));
    }
    Ok(())
}

fn check_opt(field: &str, value: &Option<String>, max: usize) -> Result<(), Malformation> {
    match value {
        Some(v) => check_len(field, v, max),
        None => Ok(()),
    }
}

fn check_lifecycle(value: u32) -> Result<(), Malformation> {
    if value == 0 || value > limits::MAX_LIFECYCLE {
        return Err(Malformation::Field(format!(
            "lifecycle {value} outside 1..={}",
            limits::MAX_LIFECYCLE
        )));
    }
    Ok(())
}

/// Check a display name: non-empty and within limits.
pub fn validate_name(field: &str, value: &str) -> Result<(), Malformation> {
    if value.trim().is_empty() {
        return Err(Malformation::Field(format!("{field} is empty")));
    }
    check_len(field, value, limits::MAX_NAME_LEN)
}

/// Check a chat or peer identifier.
pub fn validate_id(field: &str, value: &str) -> Result<(), Malformation> {
    check_id(field, value)
}

/// Check a deny/revoke reason.
pub fn validate_reason(value: &str) -> Result<(), Malformation> {
    check_len("reason", value, limits::MAX_REASON_LEN)
}

/// Validate every field of a PDU against the limits.
pub fn validate_pdu(pdu: &Pdu) -> Result<(), Malformation> {
    check_id("sender", pdu.sender.as_str())?;
    check_id("chat_id", pdu.chat_id.as_str())?;

    match &pdu.body {
        PduBody::PeerAddRequest(b) => {
            validate_name("requester_name", &b.requester_name)?;
            check_opt("requester_email", &b.requester_email, limits::MAX_NAME_LEN)?;
            check_id("invitation_id", b.invitation_id.as_str())?;
            validate_name("invitee_name", &b.invitee_name)?;
            check_opt("invitee_email", &b.invitee_email, limits::MAX_NAME_LEN)?;
        }
        PduBody::PeerAddResponse(b) => {
            check_id("invitation_id", b.invitation_id.as_str())?;
            check_opt("reason", &b.reason, limits::MAX_REASON_LEN)?;
            check_len("responder_name", &b.responder_name, limits::MAX_NAME_LEN)?;
        }
        PduBody::FileEncryptRequest(b) => {
            check_id("grantee", b.grantee.as_str())?;
            if b.file_name.is_empty() {
                return Err(Malformation::Field("file_name is empty".into()));
            }
            check_len("file_name", &b.file_name, limits::MAX_FILE_NAME_LEN)?;
            if b.wrapped_key.ciphertext.len() != limits::SEALED_KEY_LEN {
                return Err(Malformation::Field("wrapped_key has wrong length".into()));
            }
            check_lifecycle(b.terms.lifecycle)?;
        }
        PduBody::FileDecryptRequest(_) => {}
        PduBody::AccessGrantRequest(b) => check_lifecycle(b.lifecycle)?,
        PduBody::AccessGrantAccept(b) => {
            check_id("grantee", b.grantee.as_str())?;
            if b.wrapped_key.ciphertext.len() != limits::SEALED_KEY_LEN {
                return Err(Malformation::Field("wrapped_key has wrong length".into()));
            }
            check_lifecycle(b.terms.lifecycle)?;
        }
        PduBody::AccessGrantReject(b) => {
            check_id("grantee", b.grantee.as_str())?;
            validate_reason(&b.reason)?;
            check_lifecycle(b.lifecycle)?;
        }
        PduBody::AccessRevokeRequest(b) => {
            check_id("grantee", b.grantee.as_str())?;
            validate_reason(&b.reason)?;
            check_lifecycle(b.lifecycle)?;
        }
        PduBody::AccessDeniedNotice(b) => {
            check_id("grantee", b.grantee.as_str())?;
            validate_reason(&b.reason)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AccessGrantReject, AccessGrantRequest};
    use crate::types::FileId;

    #[test]
    fn test_empty_sender_rejected() {
        let pdu = Pdu::new(
            "".into(),
            "chat1".into(),
            AccessGrantRequest {
                file_id: FileId::from_bytes([0; 16]),
                lifecycle: 1,
            },
        );
        assert!(validate_pdu(&pdu).is_err());
    }

    #[test]
    fn test_long_reason_rejected() {
        let pdu = Pdu::new(
            "alice".into(),
            "chat1".into(),
            AccessGrantReject {
                file_id: FileId::from_bytes([0; 16]),
                grantee: "bob".into(),
                reason: "x".repeat(limits::MAX_REASON_LEN + 1),
                lifecycle: 1,
            },
        );
        assert!(matches!(validate_pdu(&pdu), Err(Malformation::Field(_))));
    }

    #[test]
    fn test_lifecycle_bounds() {
        let request = |lifecycle| {
            Pdu::new(
                "bob".into(),
                "chat1".into(),
                AccessGrantRequest {
                    file_id: FileId::from_bytes([0; 16]),
                    lifecycle,
                },
            )
        };
        assert!(validate_pdu(&request(1)).is_ok());
        assert!(validate_pdu(&request(limits::MAX_LIFECYCLE)).is_ok());
        assert!(matches!(validate_pdu(&request(0)), Err(Malformation::Field(_))));
        assert!(matches!(
            validate_pdu(&request(u32::MAX)),
            Err(Malformation::Field(_))
        ));

        let reject = Pdu::new(
            "alice".into(),
            "chat1".into(),
            AccessGrantReject {
                file_id: FileId::from_bytes([0; 16]),
                grantee: "bob".into(),
                reason: "no".into(),
                lifecycle: limits::MAX_LIFECYCLE + 1,
            },
        );
        assert!(validate_pdu(&reject).is_err());
    }

    #[test]
    fn test_blank_name_rejected() {
        assert!(validate_name("peer_name", "   ").is_err());
        assert!(validate_name("peer_name", "Bob").is_ok());
    }
}
