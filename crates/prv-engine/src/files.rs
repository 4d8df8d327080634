//! Sealing and opening protected files.
//!
//! Every file gets a fresh key. The key is wrapped once for the owner and
//! once for each trusted peer of the chat; the sealed artifact itself is
//! the same for everyone.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use prv_core::{codec, validation, ChatId, FileDecryptRequest, FileEncryptRequest, FileId, Pdu};
use prv_perms::{
    check_access, state, AccessDecision, AccessGrant, ArtifactHeader, DenyReason, EncryptionKey,
    GrantKey, Operation, Permissions, SealedArtifact, WrappedKey,
};
use prv_store::{FileRecord, InsertResult, Store, StoreExt};
use tracing::{debug, info, warn};

use crate::context::SessionContext;
use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::grants::{not_addressed, not_owner};
use crate::router::{Dispatch, Outcome};

/// Name used when an artifact's file name has no usable final component.
const FALLBACK_FILE_NAME: &str = "file";

/// The result of sealing a file.
#[derive(Debug, Clone)]
pub struct EncryptOutcome {
    pub file_id: FileId,
    pub artifact_path: PathBuf,
    /// One Granted grant per trusted peer that had a credential.
    pub grants: Vec<AccessGrant>,
    /// One `FileEncryptRequest` per grant, in the same order.
    pub outgoing: Vec<Pdu>,
}

impl EncryptOutcome {
    /// The outgoing PDUs in transport form.
    pub fn encoded_outgoing(&self) -> Vec<String> {
        self.outgoing.iter().map(codec::encode).collect()
    }
}

/// The result of opening a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// Plaintext was written to `path`.
    Decrypted { path: PathBuf },
    /// Access was refused; the ciphertext was not touched.
    Denied(DenyReason),
}

impl DecryptOutcome {
    /// The plaintext path, or `AccessDenied`.
    pub fn into_result(self) -> Result<PathBuf> {
        match self {
            DecryptOutcome::Decrypted { path } => Ok(path),
            DecryptOutcome::Denied(reason) => Err(EngineError::AccessDenied(reason)),
        }
    }
}

impl<S: Store> Engine<S> {
    /// Seal a file for a chat.
    ///
    /// Writes `<path>.<artifact_extension>`, records the file with its key
    /// wrapped for the owner, and grants every trusted peer of the chat
    /// access under `permissions`.
    pub async fn encrypt_file(
        &self,
        ctx: &SessionContext,
        path: &Path,
        chat_id: &ChatId,
        permissions: Permissions,
    ) -> Result<EncryptOutcome> {
        self.ensure_initialized()?;
        validation::validate_id("chat_id", chat_id.as_str()).map_err(EngineError::argument)?;

        let file_name = path
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| EngineError::invalid(format!("{} has no file name", path.display())))?
            .to_string();
        if file_name.len() > validation::limits::MAX_FILE_NAME_LEN {
            return Err(EngineError::invalid("file name too long"));
        }

        let plaintext = self.read_source(path).await?;
        let owner_public = self.keys.public_key(&ctx.profile)?;

        let file_id = FileId::generate();
        let now = self.now();
        let file_key = EncryptionKey::generate();

        let header = ArtifactHeader {
            file_id,
            chat_id: chat_id.clone(),
            owner: ctx.profile.clone(),
            file_name: file_name.clone(),
            created_at: now,
        };
        let artifact = SealedArtifact::seal(header, &plaintext, &file_key)?;
        let owner_key = WrappedKey::seal(file_id, ctx.profile.clone(), &file_key, &owner_public)?;

        let mut shares = Vec::new();
        for peer in self.store.trusted_peers(chat_id).await? {
            if peer.peer_id == ctx.profile {
                continue;
            }
            match self.keys.peer_credential(chat_id, &peer.peer_id)? {
                Some(credential) => {
                    let wrapped =
                        WrappedKey::seal(file_id, peer.peer_id.clone(), &file_key, &credential)?;
                    shares.push((peer.peer_id, wrapped));
                }
                None => warn!(chat = %chat_id, peer = %peer.peer_id, "trusted peer has no credential"),
            }
        }

        let artifact_path = self.config.artifact_path_for(path);
        self.write_atomically(&artifact_path, &artifact.to_bytes())
            .await?;

        self.store
            .insert_file(&FileRecord {
                file_id,
                chat_id: chat_id.clone(),
                owner: ctx.profile.clone(),
                file_name: file_name.clone(),
                artifact_path: Some(artifact_path.clone()),
                created_at: now,
                owner_key: Some(owner_key),
            })
            .await?;

        let mut grants = Vec::with_capacity(shares.len());
        let mut outgoing = Vec::with_capacity(shares.len());
        for (peer_id, wrapped) in shares {
            let key = GrantKey::new(file_id, peer_id.clone());
            let _guard = self.grant_locks.lock((file_id, peer_id.clone())).await;
            let t = state::grant(None, &key, chat_id, permissions, wrapped.clone(), now)?;
            self.store.commit_transition(&t).await?;

            outgoing.push(Pdu::new(
                ctx.profile.clone(),
                chat_id.clone(),
                FileEncryptRequest {
                    file_id,
                    file_name: file_name.clone(),
                    grantee: peer_id,
                    terms: t.next.terms(),
                    wrapped_key: wrapped.to_sealed(),
                },
            ));
            grants.push(t.next);
        }

        info!(
            chat = %chat_id,
            file = %file_id,
            bytes = plaintext.len(),
            recipients = grants.len(),
            "file sealed"
        );

        Ok(EncryptOutcome {
            file_id,
            artifact_path,
            grants,
            outgoing,
        })
    }

    /// Open a sealed artifact as the acting profile.
    ///
    /// Refused access comes back as [`DecryptOutcome::Denied`]. Integrity
    /// failures are `CryptoFailure` and leave nothing on disk.
    pub async fn decrypt_file(
        &self,
        ctx: &SessionContext,
        artifact_path: &Path,
        chat_id: &ChatId,
    ) -> Result<DecryptOutcome> {
        self.ensure_initialized()?;

        let bytes = tokio::fs::read(artifact_path)
            .await
            .map_err(|e| EngineError::IoFailure(format!("{}: {e}", artifact_path.display())))?;
        let artifact = SealedArtifact::from_bytes(&bytes)?;
        let header = &artifact.header;
        let file_id = header.file_id;

        // The header id is only authenticated by a key we find through it.
        let file = self.store.get_file(&file_id).await?.ok_or_else(|| {
            warn!(file = %file_id, "artifact names no known file");
            EngineError::CryptoFailure("artifact does not match any known file".into())
        })?;
        if &file.chat_id != chat_id {
            return Err(EngineError::invalid(format!(
                "file {file_id} belongs to another chat"
            )));
        }
        if header.chat_id != file.chat_id
            || header.owner != file.owner
            || header.file_name != file.file_name
        {
            return Err(EngineError::CryptoFailure(
                "artifact header does not match the file record".into(),
            ));
        }

        let wrapped = if file.owner == ctx.profile {
            file.owner_key
                .ok_or_else(|| EngineError::CryptoFailure("file key not held".into()))?
        } else {
            let grant = self.store.get_grant(&file_id, &ctx.profile).await?;
            match check_access(grant.as_ref(), self.now(), Operation::Decrypt, true) {
                AccessDecision::Denied(reason) => {
                    debug!(file = %file_id, %reason, "decrypt refused");
                    return Ok(DecryptOutcome::Denied(reason));
                }
                AccessDecision::Allowed => grant
                    .and_then(|g| g.wrapped_key)
                    .ok_or_else(|| EngineError::CryptoFailure("file key not held".into()))?,
            }
        };

        let file_key = self.keys.unwrap(&ctx.profile, &wrapped)?;
        let plaintext = artifact.open(&file_key).map_err(|e| {
            warn!(file = %file_id, "artifact failed authentication");
            EngineError::from(e)
        })?;

        let out_dir = self.config.decrypted_dir().join(file_id.to_hex());
        tokio::fs::create_dir_all(&out_dir).await?;
        let path = out_dir.join(output_name(&header.file_name));
        self.write_atomically(&path, &plaintext).await?;

        info!(file = %file_id, profile = %ctx.profile, "file decrypted");
        Ok(DecryptOutcome::Decrypted { path })
    }

    /// Known files of a chat.
    pub async fn files(&self, chat_id: &ChatId) -> Result<Vec<FileRecord>> {
        self.ensure_initialized()?;
        Ok(self.store.list_files(chat_id).await?)
    }

    /// Ask the owner to deliver our key again.
    pub async fn request_key(
        &self,
        ctx: &SessionContext,
        chat_id: &ChatId,
        file_id: &FileId,
    ) -> Result<Pdu> {
        self.ensure_initialized()?;
        let file = self.require_file(file_id).await?;
        if &file.chat_id != chat_id || file.owner == ctx.profile {
            return Err(EngineError::UnknownFile(file_id.to_hex()));
        }
        Ok(Pdu::new(
            ctx.profile.clone(),
            chat_id.clone(),
            FileDecryptRequest { file_id: *file_id },
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────────────

    /// A file shared with us: record it and the grant that came with it.
    pub(crate) async fn handle_file_encrypt(
        &self,
        ctx: &SessionContext,
        pdu: &Pdu,
        body: &FileEncryptRequest,
    ) -> Result<Dispatch> {
        if body.grantee != ctx.profile {
            return Err(not_addressed(&body.grantee));
        }
        self.require_trusted_peer(&pdu.chat_id, &pdu.sender).await?;

        let existing = self.store.get_file(&body.file_id).await?;
        if let Some(file) = &existing {
            if file.owner != pdu.sender || file.chat_id != pdu.chat_id {
                return Err(not_owner(&pdu.sender));
            }
        }

        let grant = self
            .adopt(ctx, pdu, body.file_id, &body.terms, &body.wrapped_key)
            .await?;

        if existing.is_none() {
            let record = FileRecord {
                file_id: body.file_id,
                chat_id: pdu.chat_id.clone(),
                owner: pdu.sender.clone(),
                file_name: body.file_name.clone(),
                artifact_path: None,
                created_at: body.terms.granted_at,
                owner_key: None,
            };
            if self.store.insert_file(&record).await? == InsertResult::Inserted {
                info!(
                    chat = %pdu.chat_id,
                    file = %body.file_id,
                    owner = %pdu.sender,
                    "protected file received"
                );
            }
        }

        Ok(Dispatch {
            outcome: Outcome::FileShared { grant },
            reply: None,
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Filesystem helpers
    // ─────────────────────────────────────────────────────────────────────────

    async fn read_source(&self, path: &Path) -> Result<Vec<u8>> {
        let io = |e: std::io::Error| EngineError::IoFailure(format!("{}: {e}", path.display()));

        let meta = tokio::fs::metadata(path).await.map_err(io)?;
        if !meta.is_file() {
            return Err(EngineError::IoFailure(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let too_large = |len: u64| {
            EngineError::IoFailure(format!(
                "{} is {len} bytes, limit {}",
                path.display(),
                self.config.max_file_size
            ))
        };
        if meta.len() > self.config.max_file_size {
            return Err(too_large(meta.len()));
        }

        let bytes = tokio::fs::read(path).await.map_err(io)?;
        if bytes.len() as u64 > self.config.max_file_size {
            return Err(too_large(bytes.len() as u64));
        }
        Ok(bytes)
    }

    /// Write through a temporary sibling and rename into place.
    async fn write_atomically(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let name = target
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(FALLBACK_FILE_NAME);
        let tmp = target.with_file_name(format!(
            ".{name}.{}-{}.tmp",
            std::process::id(),
            self.next_temp_suffix()
        ));

        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// The final path component of an artifact's file name.
fn output_name(file_name: &str) -> &str {
    Path::new(file_name)
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or(FALLBACK_FILE_NAME)
}
