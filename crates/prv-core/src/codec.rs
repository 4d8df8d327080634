//! Binary wire codec for PDUs.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! offset  size  field
//! 0       3     magic "PRV"
//! 3       1     protocol version
//! 4       1     body tag (PduKind)
//! 5       4     body length
//! 9       n     body: CBOR array [message_id, sender, chat_id, payload]
//! ```
//!
//! The chat transport carries frames as standard base64 text. Base64 is the
//! outermost layer and its failures surface as `MalformedMessage` like any
//! other structural problem.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CoreError, Malformation, Result};
use crate::pdu::{Pdu, PduBody, PduKind, PROTOCOL_VERSION};
use crate::types::{ChatId, MessageId, PeerId};
use crate::validation::{limits, validate_pdu};

/// Magic marker at the start of every frame.
pub const MAGIC: [u8; 3] = *b"PRV";

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 9;

/// Number of base64 characters that cover the fixed header.
const HEADER_B64_LEN: usize = 12;

fn trim_whitespace(input: &[u8]) -> &[u8] {
    let start = input
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(input.len());
    let end = input
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &input[start..end]
}

/// The fixed header of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub kind: PduKind,
    pub body_len: usize,
}

/// Parse the fixed header without looking at the body.
pub fn peek_header(bytes: &[u8]) -> Result<FrameHeader> {
    if bytes.len() < HEADER_LEN {
        return Err(Malformation::Truncated {
            expected: HEADER_LEN,
            actual: bytes.len(),
        }
        .into());
    }
    if bytes[..3] != MAGIC {
        return Err(Malformation::BadMagic.into());
    }

    let version = bytes[3];
    if version == 0 {
        return Err(Malformation::ZeroVersion.into());
    }
    if version > PROTOCOL_VERSION {
        return Err(CoreError::UnsupportedVersion(version));
    }

    let kind = PduKind::from_u8(bytes[4]).ok_or(Malformation::UnknownTag(bytes[4]))?;

    let body_len = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
    if body_len > limits::MAX_BODY_LEN {
        return Err(Malformation::TooLarge(body_len).into());
    }

    Ok(FrameHeader {
        version,
        kind,
        body_len,
    })
}

/// Cheap check whether transport text looks like one of our frames.
///
/// Decodes only the base64 prefix that covers the header and checks the
/// declared body length against the input length. Never fails; garbage
/// yields `false`.
pub fn is_protocol_message(input: &[u8]) -> bool {
    let input = trim_whitespace(input);
    if input.len() < HEADER_B64_LEN || input.len() % 4 != 0 {
        return false;
    }

    let prefix = match STANDARD.decode(&input[..HEADER_B64_LEN]) {
        Ok(p) => p,
        Err(_) => return false,
    };

    // Unknown future versions are still ours; decode reports them.
    if prefix.len() < HEADER_LEN || prefix[..3] != MAGIC || prefix[3] == 0 {
        return false;
    }
    if PduKind::from_u8(prefix[4]).is_none() {
        return false;
    }

    let body_len = u32::from_be_bytes([prefix[5], prefix[6], prefix[7], prefix[8]]) as usize;
    if body_len > limits::MAX_BODY_LEN {
        return false;
    }

    let padding = input.iter().rev().take(2).filter(|&&c| c == b'=').count();
    let decoded_len = input.len() / 4 * 3 - padding;
    decoded_len == HEADER_LEN + body_len
}

/// Check whether a binary frame has a valid header and a consistent length.
pub fn is_protocol_frame(bytes: &[u8]) -> bool {
    match peek_header(bytes) {
        Ok(header) => bytes.len() == HEADER_LEN + header.body_len,
        Err(CoreError::UnsupportedVersion(_)) => true,
        Err(_) => false,
    }
}

fn to_cbor<T: Serialize>(pdu: &Pdu, payload: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(&(&pdu.message_id, &pdu.sender, &pdu.chat_id, payload), &mut buf)
        .expect("CBOR serialization failed");
    buf
}

fn encode_body(pdu: &Pdu) -> Vec<u8> {
    match &pdu.body {
        PduBody::PeerAddRequest(b) => to_cbor(pdu, b),
        PduBody::PeerAddResponse(b) => to_cbor(pdu, b),
        PduBody::FileEncryptRequest(b) => to_cbor(pdu, b),
        PduBody::FileDecryptRequest(b) => to_cbor(pdu, b),
        PduBody::AccessGrantRequest(b) => to_cbor(pdu, b),
        PduBody::AccessGrantAccept(b) => to_cbor(pdu, b),
        PduBody::AccessGrantReject(b) => to_cbor(pdu, b),
        PduBody::AccessRevokeRequest(b) => to_cbor(pdu, b),
        PduBody::AccessDeniedNotice(b) => to_cbor(pdu, b),
    }
}

/// Encode a PDU to a binary frame.
pub fn encode_binary(pdu: &Pdu) -> Bytes {
    let body = encode_body(pdu);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(pdu.kind().to_u8());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

/// Encode a PDU to base64 transport text.
pub fn encode(pdu: &Pdu) -> String {
    STANDARD.encode(encode_binary(pdu))
}

type Envelope<T> = (MessageId, PeerId, ChatId, T);

fn from_cbor<T: DeserializeOwned>(body: &[u8]) -> Result<Envelope<T>> {
    ciborium::from_reader(body).map_err(|e| Malformation::Body(e.to_string()).into())
}

fn decode_body(kind: PduKind, body: &[u8]) -> Result<Pdu> {
    macro_rules! decode_as {
        ($variant:ident) => {{
            let (message_id, sender, chat_id, payload) = from_cbor(body)?;
            Pdu {
                message_id,
                sender,
                chat_id,
                body: PduBody::$variant(payload),
            }
        }};
    }

    let pdu = match kind {
        PduKind::PeerAddRequest => decode_as!(PeerAddRequest),
        PduKind::PeerAddResponse => decode_as!(PeerAddResponse),
        PduKind::FileEncryptRequest => decode_as!(FileEncryptRequest),
        PduKind::FileDecryptRequest => decode_as!(FileDecryptRequest),
        PduKind::AccessGrantRequest => decode_as!(AccessGrantRequest),
        PduKind::AccessGrantAccept => decode_as!(AccessGrantAccept),
        PduKind::AccessGrantReject => decode_as!(AccessGrantReject),
        PduKind::AccessRevokeRequest => decode_as!(AccessRevokeRequest),
        PduKind::AccessDeniedNotice => decode_as!(AccessDeniedNotice),
    };
    Ok(pdu)
}

/// Decode a binary frame.
pub fn decode_binary(bytes: &[u8]) -> Result<Pdu> {
    let header = peek_header(bytes)?;

    let expected = HEADER_LEN + header.body_len;
    if bytes.len() < expected {
        return Err(Malformation::Truncated {
            expected,
            actual: bytes.len(),
        }
        .into());
    }
    if bytes.len() > expected {
        return Err(Malformation::TrailingBytes(bytes.len() - expected).into());
    }

    let pdu = decode_body(header.kind, &bytes[HEADER_LEN..])?;
    validate_pdu(&pdu)?;
    Ok(pdu)
}

/// Decode base64 transport text into a PDU.
pub fn decode(input: &[u8]) -> Result<Pdu> {
    let frame = STANDARD
        .decode(trim_whitespace(input))
        .map_err(|e| Malformation::Base64(e.to_string()))?;
    decode_binary(&frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{AccessGrantReject, FileDecryptRequest, PeerAddRequest};
    use crate::types::FileId;

    fn sample() -> Pdu {
        Pdu::new(
            "alice".into(),
            "chat1".into(),
            PeerAddRequest {
                requester_name: "Alice".into(),
                requester_email: None,
                invitation_id: "bob".into(),
                invitee_name: "Bob".into(),
                invitee_email: Some("bob@example.org".into()),
                credential: [9; 32],
            },
        )
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let pdu = sample();
        let text = encode(&pdu);
        assert!(is_protocol_message(text.as_bytes()));
        assert_eq!(decode(text.as_bytes()).unwrap(), pdu);
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_binary(&sample());
        assert_eq!(&frame[..3], b"PRV");
        assert_eq!(frame[3], PROTOCOL_VERSION);
        assert_eq!(frame[4], PduKind::PeerAddRequest.to_u8());
        let body_len = u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]) as usize;
        assert_eq!(frame.len(), HEADER_LEN + body_len);
    }

    #[test]
    fn test_plain_chat_text_is_not_protocol() {
        assert!(!is_protocol_message(b"hello, how are you?"));
        assert!(!is_protocol_message(b""));
        assert!(!is_protocol_message(b"aGVsbG8gd29ybGQgaGVsbG8="));
    }

    #[test]
    fn test_invalid_base64_is_malformed() {
        let err = decode(b"not base64 at all!!").unwrap_err();
        assert!(matches!(
            err,
            CoreError::MalformedMessage(Malformation::Base64(_))
        ));
    }

    #[test]
    fn test_bad_magic_is_malformed() {
        let mut frame = encode_binary(&sample()).to_vec();
        frame[0] = b'X';
        assert_eq!(
            decode_binary(&frame).unwrap_err(),
            CoreError::MalformedMessage(Malformation::BadMagic)
        );
        assert!(!is_protocol_message(STANDARD.encode(&frame).as_bytes()));
    }

    #[test]
    fn test_future_version_is_unsupported() {
        let mut frame = encode_binary(&sample()).to_vec();
        frame[3] = PROTOCOL_VERSION + 1;
        let text = STANDARD.encode(&frame);

        // Still recognised as ours, but not decodable by this engine.
        assert!(is_protocol_message(text.as_bytes()));
        assert_eq!(
            decode(text.as_bytes()).unwrap_err(),
            CoreError::UnsupportedVersion(PROTOCOL_VERSION + 1)
        );
    }

    #[test]
    fn test_truncated_frame() {
        let frame = encode_binary(&sample());
        let cut = &frame[..frame.len() - 1];
        assert!(matches!(
            decode_binary(cut),
            Err(CoreError::MalformedMessage(Malformation::Truncated { .. }))
        ));
        assert!(!is_protocol_frame(cut));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut frame = encode_binary(&sample()).to_vec();
        frame.push(0);
        assert!(matches!(
            decode_binary(&frame),
            Err(CoreError::MalformedMessage(Malformation::TrailingBytes(1)))
        ));
    }

    #[test]
    fn test_unknown_tag() {
        let mut frame = encode_binary(&sample()).to_vec();
        frame[4] = 0x7f;
        assert_eq!(
            decode_binary(&frame).unwrap_err(),
            CoreError::MalformedMessage(Malformation::UnknownTag(0x7f))
        );
    }

    #[test]
    fn test_tag_body_mismatch_is_malformed() {
        // A FileDecryptRequest body relabelled as an AccessGrantReject.
        let pdu = Pdu::new(
            "alice".into(),
            "chat1".into(),
            FileDecryptRequest {
                file_id: FileId::from_bytes([3; 16]),
            },
        );
        let mut frame = encode_binary(&pdu).to_vec();
        frame[4] = PduKind::AccessGrantReject.to_u8();
        assert!(matches!(
            decode_binary(&frame),
            Err(CoreError::MalformedMessage(Malformation::Body(_)))
        ));
    }

    #[test]
    fn test_oversized_length_rejected_without_allocation() {
        let mut frame = vec![b'P', b'R', b'V', PROTOCOL_VERSION, 7];
        frame.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            peek_header(&frame),
            Err(CoreError::MalformedMessage(Malformation::TooLarge(_)))
        ));
    }

    #[test]
    fn test_whitespace_around_transport_text() {
        let pdu = Pdu::new(
            "alice".into(),
            "chat1".into(),
            AccessGrantReject {
                file_id: FileId::from_bytes([5; 16]),
                grantee: "bob".into(),
                reason: String::new(),
                lifecycle: 2,
            },
        );
        let text = format!("  {}\n", encode(&pdu));
        assert!(is_protocol_message(text.as_bytes()));
        assert_eq!(decode(text.as_bytes()).unwrap(), pdu);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn plain_chat_text_is_not_a_frame(text in "[ -~]{0,200}") {
                prop_assume!(!text.trim().starts_with("UFJW"));
                prop_assert!(!is_protocol_message(text.as_bytes()));
            }

            #[test]
            fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = is_protocol_message(&bytes);
                let _ = decode(&bytes);
                let _ = decode_binary(&bytes);
            }

            #[test]
            fn reason_survives_roundtrip(reason in "\\PC{0,100}", lifecycle in 1u32..100) {
                let pdu = Pdu::new(
                    "alice".into(),
                    "chat1".into(),
                    AccessGrantReject {
                        file_id: FileId::from_bytes([1; 16]),
                        grantee: "bob".into(),
                        reason,
                        lifecycle,
                    },
                );
                prop_assert_eq!(decode(encode(&pdu).as_bytes()).unwrap(), pdu);
            }
        }
    }
}
