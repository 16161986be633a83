//! Bus Envelopes
//!
//! Payloads consumed from the internal message bus: lifecycle events that bring an
//! agent online or offline, and commands that must be written to the agent's socket.

use crate::protocol::DecodeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const COMMAND_ACCEPT: &str = "accept";
pub const COMMAND_AGENT_MESSAGE: &str = "agent_message";
pub const COMMAND_AGENT_IMAGE: &str = "agent_image";
pub const COMMAND_AGENT_MEDIA: &str = "agent_media";

/// Requests that an agent's session be brought online or taken offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub agent_id: String,
    pub is_online: bool,
}

/// A command addressed to one agent's session, before its payload is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub agent_id: String,
    pub command_name: String,
    #[serde(default)]
    pub command_payload: Value,
}

impl CommandEnvelope {
    /// Decodes the payload according to `command_name`.
    pub fn decode(&self) -> Result<OutboundCommand, DecodeError> {
        let invalid = |source| DecodeError::InvalidPayload {
            command: self.command_name.clone(),
            source,
        };
        let payload = self.command_payload.clone();
        match self.command_name.as_str() {
            COMMAND_ACCEPT => serde_json::from_value(payload)
                .map(OutboundCommand::Accept)
                .map_err(invalid),
            COMMAND_AGENT_MESSAGE => serde_json::from_value(payload)
                .map(OutboundCommand::AgentTextMessage)
                .map_err(invalid),
            COMMAND_AGENT_IMAGE | COMMAND_AGENT_MEDIA => serde_json::from_value(payload)
                .map(OutboundCommand::AgentMediaMessage)
                .map_err(invalid),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

/// A decoded command ready to be encoded onto the vendor socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCommand {
    Accept(AcceptParams),
    AgentTextMessage(AgentMessageParams),
    AgentMediaMessage(AgentMediaParams),
}

impl OutboundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::Accept(_) => COMMAND_ACCEPT,
            OutboundCommand::AgentTextMessage(_) => COMMAND_AGENT_MESSAGE,
            OutboundCommand::AgentMediaMessage(_) => COMMAND_AGENT_IMAGE,
        }
    }

    /// The client-supplied idempotency token.
    pub fn private_id(&self) -> Option<&str> {
        match self {
            OutboundCommand::Accept(p) => p.private_id.as_deref(),
            OutboundCommand::AgentTextMessage(p) => Some(&p.private_id),
            OutboundCommand::AgentMediaMessage(p) => Some(&p.private_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcceptParams {
    pub chat_id: i64,
    pub client_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessageParams {
    pub message: String,
    pub chat_id: i64,
    pub client_id: i64,
    #[serde(default)]
    pub is_quick: i32,
    #[serde(default)]
    pub private_id: String,
}

/// A file sent by the agent, inlined as a data URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    /// `data:<mime>;base64,<payload>`; a bare base64 payload is accepted too.
    pub src: String,
    #[serde(rename = "type")]
    pub mime_type: String,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// The file extension used to request an upload ticket.
    pub fn extension(&self) -> String {
        self.name
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .filter(|ext| !ext.is_empty())
            .or_else(|| self.mime_type.split_once('/').map(|(_, sub)| sub))
            .unwrap_or("bin")
            .to_ascii_lowercase()
    }

    /// The base64 payload without its data-URL prefix.
    pub fn payload(&self) -> &str {
        self.src
            .split_once(',')
            .map_or(self.src.as_str(), |(_, data)| data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMediaParams {
    #[serde(default)]
    pub message: String,
    pub chat_id: i64,
    pub client_id: i64,
    #[serde(default)]
    pub is_quick: i32,
    #[serde(default)]
    pub private_id: String,
    #[serde(alias = "image")]
    pub file: Attachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Document,
}

/// Where an uploaded attachment landed, as sent inside the media message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Media {
    pub mime_type: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub file: String,
    pub file_name: String,
    pub file_url: String,
    pub file_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
}

/// The `agent_message` params carrying an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaMessageParams {
    pub message: String,
    pub chat_id: i64,
    pub client_id: i64,
    pub is_quick: i32,
    pub private_id: String,
    pub media: Media,
}

impl AgentMediaParams {
    /// Builds the final message once the attachment is in vendor storage.
    pub fn delivered(&self, location: &str, size: usize, dimensions: Option<(u32, u32)>) -> MediaMessageParams {
        let (kind, width, height, thumb) = match dimensions {
            Some((w, h)) => (MediaKind::Photo, Some(w), Some(h), Some(location.to_string())),
            None => (MediaKind::Document, None, None, None),
        };
        MediaMessageParams {
            message: self.message.clone(),
            chat_id: self.chat_id,
            client_id: self.client_id,
            is_quick: self.is_quick,
            private_id: self.private_id.clone(),
            media: Media {
                mime_type: self.file.mime_type.clone(),
                kind,
                file: location.to_string(),
                file_name: self.file.name.clone(),
                file_url: location.to_string(),
                file_size: size,
                width,
                height,
                thumb,
            },
        }
    }
}
