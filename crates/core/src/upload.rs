//! Upload Saga
//!
//! Places an agent's attachment in vendor storage before the media message that
//! references it is written to the socket. The pipeline is strictly sequential and
//! never retries:
//!
//! 1. refresh the access token,
//! 2. request a single-use upload ticket for the file extension,
//! 3. decode the base64 payload,
//! 4. build the signed multipart form (field order is part of the signature),
//! 5. POST it to the ticket URL and read the final `Location`,
//! 6. read image dimensions when the attachment is an image.
//!
//! Any failing step before the last aborts the whole saga; no partial media
//! message is produced. An image whose dimensions can't be read is already
//! stored by then, so it goes out as a document instead.

use crate::{
    command::Attachment,
    identity::{AccessGrant, IdentityProvider},
};
use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Multipart fields in the order the storage service validates its signature over.
pub const SIGNED_FIELD_ORDER: [&str; 9] = [
    "acl",
    "Content-Type",
    "key",
    "Content-disposition",
    "X-Amz-Date",
    "Policy",
    "X-Amz-Credential",
    "X-Amz-Algorithm",
    "X-Amz-Signature",
];
pub const FILE_FIELD: &str = "file";
const ACL_PUBLIC_READ: &str = "public-read";

/// A short-lived, single-use signed upload descriptor.
#[derive(Debug, Deserialize)]
pub struct UploadTicket {
    pub url: String,
    pub date: String,
    pub policy: String,
    pub credential: String,
    pub algorithm: String,
    pub signature: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

/// A fully built multipart upload. Consumes the ticket it was signed with.
#[derive(Debug, Clone)]
pub struct UploadForm {
    pub url: String,
    pub fields: Vec<(&'static str, String)>,
    pub file: FilePart,
}

impl UploadForm {
    pub fn new(ticket: UploadTicket, attachment: &Attachment, bytes: Bytes) -> Self {
        let values = [
            ACL_PUBLIC_READ.to_string(),
            attachment.mime_type.clone(),
            ticket.key,
            content_disposition(&attachment.name),
            ticket.date,
            ticket.policy,
            ticket.credential,
            ticket.algorithm,
            ticket.signature,
        ];
        Self {
            url: ticket.url,
            fields: SIGNED_FIELD_ORDER.into_iter().zip(values).collect(),
            file: FilePart {
                name: attachment.name.clone(),
                mime_type: attachment.mime_type.clone(),
                bytes,
            },
        }
    }

    /// Every part name in wire order, the file part last.
    pub fn field_names(&self) -> Vec<&'static str> {
        self.fields
            .iter()
            .map(|(name, _)| *name)
            .chain(std::iter::once(FILE_FIELD))
            .collect()
    }
}

/// `attachment; filename*=UTF-8''<name>` with the name percent-encoded per RFC 5987.
fn content_disposition(file_name: &str) -> String {
    let mut encoded = String::with_capacity(file_name.len());
    for byte in file_name.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    format!("attachment; filename*=UTF-8''{encoded}")
}

fn image_dimensions(bytes: &[u8]) -> Result<(u32, u32)> {
    let size = imagesize::blob_size(bytes)?;
    Ok((u32::try_from(size.width)?, u32::try_from(size.height)?))
}

/// The vendor media-transfer endpoints.
#[async_trait]
pub trait MediaTransfer: Send + Sync {
    /// Requests an upload ticket. A rejected request is an error.
    async fn request_ticket(&self, access_token: &SecretString, extension: &str) -> Result<UploadTicket>;

    /// POSTs the form and returns the storage response's `Location` header, if any.
    async fn upload(&self, form: UploadForm) -> Result<Option<String>>;
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("access token refresh failed: {0:#}")]
    Refresh(anyhow::Error),
    #[error("upload ticket request failed: {0:#}")]
    Ticket(anyhow::Error),
    #[error("attachment payload is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),
    #[error("storage upload failed: {0:#}")]
    Transfer(anyhow::Error),
    #[error("storage response carried no Location")]
    MissingLocation,
}

/// The result of a completed saga.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedMedia {
    pub location: String,
    pub size: usize,
    /// Width and height, present only for images.
    pub dimensions: Option<(u32, u32)>,
}

/// Runs the upload pipeline against the identity provider and media endpoints.
pub struct UploadSaga<'a> {
    identity: &'a dyn IdentityProvider,
    media: &'a dyn MediaTransfer,
}

impl<'a> UploadSaga<'a> {
    pub fn new(identity: &'a dyn IdentityProvider, media: &'a dyn MediaTransfer) -> Self {
        Self { identity, media }
    }

    /// Uploads `attachment`. On a successful refresh `access_token` is replaced
    /// with the new token, even if a later step fails.
    pub async fn run(
        &self,
        access_token: &mut SecretString,
        attachment: &Attachment,
    ) -> Result<UploadedMedia, UploadError> {
        let AccessGrant {
            access_token: refreshed,
            ..
        } = self
            .identity
            .refresh(access_token)
            .await
            .map_err(UploadError::Refresh)?;
        *access_token = refreshed;

        let extension = attachment.extension();
        let ticket = self
            .media
            .request_ticket(access_token, &extension)
            .await
            .map_err(UploadError::Ticket)?;
        debug!(key = %ticket.key, %extension, "Upload ticket granted");

        let bytes = Bytes::from(
            base64::engine::general_purpose::STANDARD.decode(attachment.payload().trim())?,
        );
        let size = bytes.len();

        let form = UploadForm::new(ticket, attachment, bytes.clone());
        let location = self
            .media
            .upload(form)
            .await
            .map_err(UploadError::Transfer)?
            .filter(|location| !location.trim().is_empty())
            .ok_or(UploadError::MissingLocation)?;

        let dimensions = if attachment.is_image() {
            match image_dimensions(&bytes) {
                Ok(dimensions) => Some(dimensions),
                Err(e) => {
                    warn!(mime_type = %attachment.mime_type, error = %e, "Can't read image dimensions, sending as a document");
                    None
                }
            }
        } else {
            None
        };

        info!(%location, size, ?dimensions, "Attachment uploaded");
        Ok(UploadedMedia {
            location,
            size,
            dimensions,
        })
    }
}
