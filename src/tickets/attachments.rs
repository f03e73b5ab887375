use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use log::{debug, warn};
use rand::RngCore;
use std::path::{Path, PathBuf};

use super::models::{Attachment, NewAttachment};
use super::repository::TicketRepository;
use crate::core::error::CoreResult;

pub const RESTRICTED_ACCESS: &str = "restricted";
const MAX_EXTENSION_CHARS: usize = 10;

/// A file carried by an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl InboundAttachment {
    pub fn is_image(&self) -> bool {
        self.content_type.to_ascii_lowercase().starts_with("image/")
    }
}

/// Writes attachment bytes under the uploads root and records them on the ticket.
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persists every non-image attachment; failures are logged per file.
    pub async fn persist_all(
        &self,
        repo: &dyn TicketRepository,
        ticket_id: i64,
        reply_id: Option<i64>,
        attachments: &[InboundAttachment],
    ) -> Vec<Attachment> {
        let mut stored = Vec::new();
        for attachment in attachments.iter().filter(|a| !a.is_image()) {
            match self.persist(repo, ticket_id, reply_id, attachment).await {
                Ok(record) => stored.push(record),
                Err(e) => warn!(
                    "Failed to store attachment '{}' for ticket {}: {}",
                    attachment.filename, ticket_id, e
                ),
            }
        }
        stored
    }

    pub async fn persist(
        &self,
        repo: &dyn TicketRepository,
        ticket_id: i64,
        reply_id: Option<i64>,
        attachment: &InboundAttachment,
    ) -> CoreResult<Attachment> {
        tokio::fs::create_dir_all(&self.root).await?;
        let stored_name = storage_name(&attachment.filename);
        let path = self.root.join(&stored_name);
        tokio::fs::write(&path, &attachment.data).await?;
        debug!(
            "Stored attachment '{}' as {} ({} bytes)",
            attachment.filename,
            path.display(),
            attachment.data.len()
        );

        repo.add_attachment(NewAttachment {
            ticket_id,
            reply_id,
            filename: attachment.filename.clone(),
            stored_name,
            content_type: attachment.content_type.clone(),
            size_bytes: attachment.data.len() as i64,
            access_level: RESTRICTED_ACCESS.to_string(),
        })
        .await
    }
}

/// Random 32-byte URL-safe token plus the sanitised original extension.
pub fn storage_name(filename: &str) -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);
    match sanitize_extension(filename) {
        Some(ext) => format!("{token}.{ext}"),
        None => token,
    }
}

pub fn sanitize_extension(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    let ext: String = ext
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_CHARS)
        .collect::<String>()
        .to_ascii_lowercase();
    (!ext.is_empty()).then_some(ext)
}
