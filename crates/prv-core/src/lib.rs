//! # PRV Core
//!
//! Pure primitives for the PRV engine: identifiers, protocol data units and
//! the wire codec.
//!
//! This crate contains no I/O, no storage and no cryptography. It turns
//! bytes into typed PDUs and back.
//!
//! ## Key Types
//!
//! - [`Pdu`] - One protocol message: envelope plus tagged body
//! - [`PduKind`] - Discriminator mapped to the on-wire tag byte
//! - [`FileId`], [`MessageId`] - Random 128-bit identifiers
//! - [`ChatId`], [`PeerId`] - Identifiers assigned by the host chat application
//!
//! ## Wire format
//!
//! See the [`codec`] module. Frames are base64 text on the chat transport.

pub mod codec;
pub mod error;
pub mod pdu;
pub mod types;
pub mod validation;

pub use codec::{
    decode, decode_binary, encode, encode_binary, is_protocol_frame, is_protocol_message,
    peek_header, FrameHeader,
};
pub use error::{CoreError, Malformation, Result};
pub use pdu::{
    AccessDeniedNotice, AccessGrantAccept, AccessGrantReject, AccessGrantRequest,
    AccessRevokeRequest, FileDecryptRequest, FileEncryptRequest, GrantTerms, Pdu, PduBody,
    PduKind, PeerAddRequest, PeerAddResponse, SealedKey, PROTOCOL_VERSION,
};
pub use types::{now_millis, ChatId, FileId, MessageId, PeerId};
