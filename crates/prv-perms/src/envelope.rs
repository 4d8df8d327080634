//! Sealed file artifacts.
//!
//! A protected file is stored as a single artifact:
//!
//! ```text
//! "PRVF" | version u8 | header_len u16 BE | header CBOR | nonce[12] | ciphertext+tag
//! ```
//!
//! Everything before the nonce is authenticated as associated data, so a
//! change to any header byte fails decryption just like a change to the
//! ciphertext.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use prv_core::{ChatId, FileId, PeerId};

use crate::crypto::{EncryptionKey, EncryptionNonce, NONCE_LEN, TAG_LEN};
use crate::error::{PermsError, Result};

/// Magic marker of a sealed artifact.
pub const ARTIFACT_MAGIC: [u8; 4] = *b"PRVF";

/// Current artifact format version.
pub const ARTIFACT_VERSION: u8 = 1;

const PREFIX_LEN: usize = 7;

/// Cleartext metadata of a sealed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactHeader {
    pub file_id: FileId,
    pub chat_id: ChatId,
    pub owner: PeerId,

    /// Original file name, restored on decryption.
    pub file_name: String,

    /// When the file was sealed (Unix milliseconds).
    pub created_at: i64,
}

/// A parsed artifact. The ciphertext is only opened by [`SealedArtifact::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedArtifact {
    pub header: ArtifactHeader,
    aad: Vec<u8>,
    nonce: EncryptionNonce,
    ciphertext: Vec<u8>,
}

fn header_prefix(header: &ArtifactHeader) -> Result<Vec<u8>> {
    let mut header_bytes = Vec::new();
    ciborium::into_writer(header, &mut header_bytes).expect("CBOR serialization failed");

    let header_len = u16::try_from(header_bytes.len())
        .map_err(|_| PermsError::InvalidArtifact("header too large".into()))?;

    let mut buf = BytesMut::with_capacity(PREFIX_LEN + header_bytes.len());
    buf.put_slice(&ARTIFACT_MAGIC);
    buf.put_u8(ARTIFACT_VERSION);
    buf.put_u16(header_len);
    buf.put_slice(&header_bytes);
    Ok(buf.to_vec())
}

impl SealedArtifact {
    /// Encrypt `plaintext` under `key`, binding it to `header`.
    pub fn seal(header: ArtifactHeader, plaintext: &[u8], key: &EncryptionKey) -> Result<Self> {
        let aad = header_prefix(&header)?;
        let nonce = EncryptionNonce::generate();
        let ciphertext = key.seal(&nonce, plaintext, &aad)?;

        Ok(Self {
            header,
            aad,
            nonce,
            ciphertext,
        })
    }

    /// Parse an artifact without decrypting it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREFIX_LEN {
            return Err(PermsError::InvalidArtifact("too short".into()));
        }
        if bytes[..4] != ARTIFACT_MAGIC {
            return Err(PermsError::InvalidArtifact("bad magic".into()));
        }
        if bytes[4] != ARTIFACT_VERSION {
            return Err(PermsError::InvalidArtifact(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }

        let header_len = u16::from_be_bytes([bytes[5], bytes[6]]) as usize;
        let header_end = PREFIX_LEN + header_len;
        if bytes.len() < header_end + NONCE_LEN + TAG_LEN {
            return Err(PermsError::InvalidArtifact("truncated".into()));
        }

        let header: ArtifactHeader = ciborium::from_reader(&bytes[PREFIX_LEN..header_end])
            .map_err(|e| PermsError::InvalidArtifact(format!("header: {e}")))?;

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[header_end..header_end + NONCE_LEN]);

        Ok(Self {
            header,
            aad: bytes[..header_end].to_vec(),
            nonce: EncryptionNonce::from_bytes(nonce),
            ciphertext: bytes[header_end + NONCE_LEN..].to_vec(),
        })
    }

    /// Serialize to the on-disk form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.aad.len() + NONCE_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.aad);
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.extend_from_slice(&self.ciphertext);
        buf
    }

    /// Authenticate and decrypt.
    pub fn open(&self, key: &EncryptionKey) -> Result<Vec<u8>> {
        key.open(&self.nonce, &self.ciphertext, &self.aad)
    }

    /// Size of the ciphertext, including the tag.
    pub fn ciphertext_len(&self) -> usize {
        self.ciphertext.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ArtifactHeader {
        ArtifactHeader {
            file_id: FileId::from_bytes([1; 16]),
            chat_id: "chat1".into(),
            owner: "alice".into(),
            file_name: "report.pdf".into(),
            created_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptionKey::generate();
        let sealed = SealedArtifact::seal(header(), b"quarterly numbers", &key).unwrap();

        let parsed = SealedArtifact::from_bytes(&sealed.to_bytes()).unwrap();
        assert_eq!(parsed.header, header());
        assert_eq!(parsed.open(&key).unwrap(), b"quarterly numbers");
    }

    #[test]
    fn test_empty_plaintext() {
        let key = EncryptionKey::generate();
        let sealed = SealedArtifact::seal(header(), b"", &key).unwrap();
        let parsed = SealedArtifact::from_bytes(&sealed.to_bytes()).unwrap();
        assert!(parsed.open(&key).unwrap().is_empty());
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let key = EncryptionKey::generate();
        let bytes = SealedArtifact::seal(header(), b"do not touch", &key)
            .unwrap()
            .to_bytes();

        for i in 0..bytes.len() {
            let mut tampered = bytes.clone();
            tampered[i] ^= 0x01;
            let opened = SealedArtifact::from_bytes(&tampered).and_then(|a| a.open(&key));
            assert!(opened.is_err(), "flip at byte {i} went undetected");
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = SealedArtifact::seal(header(), b"secret", &EncryptionKey::generate()).unwrap();
        assert!(sealed.open(&EncryptionKey::generate()).is_err());
    }

    #[test]
    fn test_rejects_non_artifact() {
        assert!(SealedArtifact::from_bytes(b"plain text file").is_err());
        assert!(SealedArtifact::from_bytes(b"").is_err());
    }
}
