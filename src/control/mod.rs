//! Control channel — request/response messaging between an external caller
//! and the running manager.
//!
//! Callers hold a [`ControlHandle`]. Each [`ControlMessage`] carries its own
//! oneshot reply sender, so a reply can only ever reach the caller that sent
//! the message, and at most once. Commands that need no reply simply drop
//! the sender.
//!
//! ## Wire format
//!
//! ```text
//! → { "type": "GET_CACHE_STATUS" }
//! ← { "success": true, "type": "CACHE_STATUS", "payload": { "version": .., "caches": { .. }, "timestamp": .. } }
//!
//! → { "type": "PREFETCH", "payload": { "url": "/about.html" } }
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Messages buffered before [`ControlHandle::send`] starts waiting.
pub const CHANNEL_CAPACITY: usize = 32;

/// Failure to deliver a control message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("no controller is running")]
    NoController,

    #[error("controller sent no reply to {tag}")]
    NoReply { tag: String },
}

/// A control command, parsed from its wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Delete every namespace regardless of version.
    ClearCache,
    /// Activate an installed-but-waiting version immediately.
    SkipWaiting,
    GetCacheStatus,
    /// Fetch `url` and store it in the primary namespace.
    Prefetch { url: String },
    /// A known tag whose payload could not be used.
    Malformed { tag: String, reason: String },
    /// A tag this manager does not understand.
    Unknown(String),
}

impl ControlCommand {
    pub const CLEAR_CACHE: &'static str = "CLEAR_CACHE";
    pub const SKIP_WAITING: &'static str = "SKIP_WAITING";
    pub const GET_CACHE_STATUS: &'static str = "GET_CACHE_STATUS";
    pub const PREFETCH: &'static str = "PREFETCH";

    /// The wire tag of this command.
    pub fn tag(&self) -> &str {
        match self {
            Self::ClearCache => Self::CLEAR_CACHE,
            Self::SkipWaiting => Self::SKIP_WAITING,
            Self::GetCacheStatus => Self::GET_CACHE_STATUS,
            Self::Prefetch { .. } => Self::PREFETCH,
            Self::Malformed { tag, .. } | Self::Unknown(tag) => tag.as_str(),
        }
    }
}

impl From<ControlRequest> for ControlCommand {
    fn from(request: ControlRequest) -> Self {
        match request.tag.as_str() {
            Self::CLEAR_CACHE => Self::ClearCache,
            Self::SKIP_WAITING => Self::SkipWaiting,
            Self::GET_CACHE_STATUS => Self::GetCacheStatus,
            Self::PREFETCH => {
                let url = request
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("url"))
                    .and_then(Value::as_str);
                match url {
                    Some(url) => Self::Prefetch {
                        url: url.to_owned(),
                    },
                    None => Self::Malformed {
                        tag: request.tag,
                        reason: "payload.url is required".to_owned(),
                    },
                }
            }
            _ => Self::Unknown(request.tag),
        }
    }
}

/// Incoming wire message: `{ "type": TAG, "payload"?: .. }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlRequest {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Outgoing wire reply: `{ "success": bool, "type": TAG, "payload"?: .. }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub success: bool,
    #[serde(rename = "type")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl ControlReply {
    pub const CACHE_CLEARED: &'static str = "CACHE_CLEARED";
    pub const CACHE_STATUS: &'static str = "CACHE_STATUS";

    pub fn ok(tag: impl Into<String>) -> Self {
        Self {
            success: true,
            tag: tag.into(),
            payload: None,
        }
    }

    /// A failed reply carrying `{ "error": message }`.
    pub fn failed(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            tag: tag.into(),
            payload: Some(serde_json::json!({ "error": message.into() })),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Payload of a `CACHE_STATUS` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub version: String,
    pub caches: BTreeMap<String, NamespaceStatus>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStatus {
    pub entries: usize,
    pub urls: Vec<String>,
}

/// A command in flight, paired with the channel its reply goes back on.
#[derive(Debug)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub reply: Option<oneshot::Sender<ControlReply>>,
}

impl ControlMessage {
    /// Sends `reply` to the originating caller, if it is still listening.
    pub fn respond(self, reply: ControlReply) {
        if let Some(tx) = self.reply {
            let _ = tx.send(reply);
        }
    }
}

/// Creates a connected handle and receiver.
pub fn channel() -> (ControlHandle, mpsc::Receiver<ControlMessage>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ControlHandle { tx }, rx)
}

/// The caller's side of the control channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    /// Sends `command` and waits for its reply, if the command produces one.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NoController`] if the control loop has stopped.
    pub async fn send(&self, command: ControlCommand) -> Result<Option<ControlReply>, ChannelError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = ControlMessage {
            command,
            reply: Some(reply_tx),
        };
        self.tx
            .send(message)
            .await
            .map_err(|_| ChannelError::NoController)?;
        Ok(reply_rx.await.ok())
    }

    /// Sends `command` and requires a reply.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::NoController`] — the control loop has stopped.
    /// - [`ChannelError::NoReply`] — the command was handled without a reply.
    pub async fn request(&self, command: ControlCommand) -> Result<ControlReply, ChannelError> {
        let tag = command.tag().to_owned();
        self.send(command)
            .await?
            .ok_or(ChannelError::NoReply { tag })
    }

    /// Sends `command` without waiting for it to be handled.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NoController`] if the control loop has stopped.
    pub async fn post(&self, command: ControlCommand) -> Result<(), ChannelError> {
        self.tx
            .send(ControlMessage {
                command,
                reply: None,
            })
            .await
            .map_err(|_| ChannelError::NoController)
    }

    /// Returns `true` once the control loop has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
