//! Vendor Chat Socket Protocol
//!
//! Frames exchanged with the vendor chat server are JSON-RPC-like envelopes
//! (`{id, method, params, jsonrpc}`), except for the keepalive which is the bare
//! single character `.` in both directions. This module owns the outbound request
//! shapes used during the handshake and the classifier for inbound frames.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Keepalive ping and pong payload.
pub const KEEPALIVE: &str = ".";
pub const JSONRPC_VERSION: &str = "2.0";

pub const METHOD_SUBSCRIBE: &str = "subscribe";
pub const METHOD_COMETAN: &str = "cometan";
pub const METHOD_HANDLE: &str = "handle";
pub const METHOD_BATCH: &str = "batch";

/// Event name the vendor sends when the same agent logs in from another device.
pub const EVENT_LOGIN_ANOTHER_DEVICE: &str = "login_another_dev";
/// Event name acknowledging a successful `login` request.
pub const EVENT_LOGIN_OK: &str = "login_ok";

/// Errors raised while decoding an inbound frame.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("`{method}` frame has no id")]
    MissingId { method: String },
    #[error("`handle` frame {id:?} has no event name")]
    MissingEventName { id: Option<i64> },
    #[error("`batch` frame {id} params are not a list")]
    BatchNotList { id: i64 },
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid `{command}` payload: {source}")]
    InvalidPayload {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The id of the offending frame, when it could be read.
    ///
    /// A frame whose id is known is still acknowledged even if its body is unusable.
    pub fn correlation_id(&self) -> Option<i64> {
        match self {
            DecodeError::MissingEventName { id } => *id,
            DecodeError::BatchNotList { id } => Some(*id),
            _ => None,
        }
    }
}

// --- Outbound ---

/// An outbound request frame. `id` is the session's request-sequence value.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Request<P> {
    pub id: u64,
    pub method: &'static str,
    pub params: P,
    pub jsonrpc: &'static str,
}

impl<P: Serialize> Request<P> {
    pub fn new(id: u64, method: &'static str, params: P) -> Self {
        Self {
            id,
            method,
            params,
            jsonrpc: JSONRPC_VERSION,
        }
    }
}

/// Attaches the vendor command `name` to a parameter struct.
#[derive(Serialize, Debug)]
pub struct Named<'a, P> {
    pub name: &'static str,
    #[serde(flatten)]
    pub params: &'a P,
}

impl<'a, P: Serialize> Named<'a, P> {
    pub fn new(name: &'static str, params: &'a P) -> Self {
        Self { name, params }
    }
}

/// Registers the socket as a receiver of `handle` and `batch` events.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct SubscribeParams {
    pub callback: &'static str,
    pub batch: &'static str,
    pub sid: Option<String>,
}

impl Default for SubscribeParams {
    fn default() -> Self {
        Self {
            callback: METHOD_HANDLE,
            batch: METHOD_BATCH,
            sid: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct RmoState {
    pub available_for_calls: bool,
}

/// Static client identity presented with the `login` request.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub ui_version: &'static str,
    pub ua_build_number: &'static str,
    pub commit_number: &'static str,
    pub app_instance_id: &'static str,
    pub features: [&'static str; 3],
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            ui_version: "3.1.2",
            ua_build_number: "3.1.2",
            commit_number: "web - 1.2.5 61a1133 Linux x86_64",
            app_instance_id: "1488c95-9e6f-51cc-bb-65fbf84e9b19",
            features: ["inbox", "multidevices", "support_admin_login"],
        }
    }
}

/// Parameters of the `login` (authenticate) request.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AuthParams {
    pub name: &'static str,
    pub ui_version: &'static str,
    pub ua_version: &'static str,
    pub ua_build_number: &'static str,
    pub commit_number: &'static str,
    pub away: bool,
    pub app_instance_id: &'static str,
    pub rmo_state: RmoState,
    pub features: [&'static str; 3],
    pub access_token: String,
}

impl AuthParams {
    pub fn new(identity: &ClientIdentity, access_token: String) -> Self {
        Self {
            name: "login",
            ui_version: identity.ui_version,
            ua_version: identity.ui_version,
            ua_build_number: identity.ua_build_number,
            commit_number: identity.commit_number,
            away: false,
            app_instance_id: identity.app_instance_id,
            rmo_state: RmoState {
                available_for_calls: false,
            },
            features: identity.features,
            access_token,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CannedPhrasesParams {
    pub name: &'static str,
    pub get_phrases: u8,
    pub version: Option<String>,
}

impl Default for CannedPhrasesParams {
    fn default() -> Self {
        Self {
            name: "canned_phrases",
            get_phrases: 1,
            version: None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct EmptyResult {}

/// Acknowledges an inbound frame by echoing its id.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CorrelationReply {
    pub id: i64,
    pub result: EmptyResult,
}

impl CorrelationReply {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            result: EmptyResult {},
        }
    }
}

/// One element of a batch, re-framed as a standalone envelope for the bus.
#[derive(Serialize, Debug)]
struct ForwardedEvent<'a> {
    id: i64,
    method: &'a str,
    params: &'a Value,
    jsonrpc: &'static str,
}

// --- Inbound ---

#[derive(Deserialize, Debug)]
struct RawFrame {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEnvelope {
    /// The keepalive reply.
    Pong,
    /// A `handle` event. `raw` is the frame exactly as received. The vendor
    /// omits `id` on some notifications; those get no correlation reply.
    SingleEvent {
        id: Option<i64>,
        event_name: String,
        raw: String,
    },
    /// A `batch` event. Elements that failed to decode are dropped from `events`
    /// and counted in `skipped`; the rest keep their original order.
    BatchEvent {
        id: i64,
        events: Vec<Value>,
        skipped: usize,
    },
    /// Any other well-formed frame, e.g. the result of one of our own requests.
    Other {
        id: Option<i64>,
        method: Option<String>,
    },
}

impl InboundEnvelope {
    /// Classifies a text frame by its `method` discriminator and the shape of `params`.
    pub fn classify(text: &str) -> Result<Self, DecodeError> {
        if text == KEEPALIVE {
            return Ok(InboundEnvelope::Pong);
        }

        let frame: RawFrame = serde_json::from_str(text)?;
        match frame.method.as_deref() {
            Some(METHOD_HANDLE) => {
                let event_name = frame
                    .params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or(DecodeError::MissingEventName { id: frame.id })?
                    .to_string();
                Ok(InboundEnvelope::SingleEvent {
                    id: frame.id,
                    event_name,
                    raw: text.to_string(),
                })
            }
            Some(METHOD_BATCH) => {
                let id = frame.id.ok_or_else(|| DecodeError::MissingId {
                    method: METHOD_BATCH.to_string(),
                })?;
                let Value::Array(items) = frame.params else {
                    return Err(DecodeError::BatchNotList { id });
                };
                let total = items.len();
                let events: Vec<Value> = items
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, item)| {
                        if item.get("name").and_then(Value::as_str).is_some() {
                            Some(item)
                        } else {
                            warn!(id, index, "Skipping batch element without an event name");
                            None
                        }
                    })
                    .collect();
                let skipped = total - events.len();
                Ok(InboundEnvelope::BatchEvent {
                    id,
                    events,
                    skipped,
                })
            }
            _ => Ok(InboundEnvelope::Other {
                id: frame.id,
                method: frame.method,
            }),
        }
    }

    /// True for the vendor's "logged in from another device" event.
    pub fn is_forced_logout(&self) -> bool {
        matches!(self, InboundEnvelope::SingleEvent { event_name, .. } if event_name == EVENT_LOGIN_ANOTHER_DEVICE)
    }

    /// The id a correlation reply must echo, if this frame needs one.
    pub fn correlation_id(&self) -> Option<i64> {
        match self {
            InboundEnvelope::SingleEvent { id, .. } => *id,
            InboundEnvelope::BatchEvent { id, .. } => Some(*id),
            InboundEnvelope::Pong | InboundEnvelope::Other { .. } => None,
        }
    }
}

/// Re-frames every element of a batch as its own envelope, preserving order.
pub fn split_batch(id: i64, events: &[Value]) -> Result<Vec<Vec<u8>>, serde_json::Error> {
    events
        .iter()
        .map(|params| {
            serde_json::to_vec(&ForwardedEvent {
                id,
                method: METHOD_BATCH,
                params,
                jsonrpc: JSONRPC_VERSION,
            })
        })
        .collect()
}
