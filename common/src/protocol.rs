//! Wire messages exchanged between the trigger controller and the capture
//! agent.  Every payload is UTF-8 JSON.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Operator → device, on the command topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Capture {
        /// Correlation token echoed back in the preview event.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
    },
    Save {
        id: String,
    },
}

/// Device → operator, on the preview topic.
///
/// A successful capture carries `id` and `thumbnail`; a failed one carries
/// only `message`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Base64-encoded JPEG.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
}

/// What a preview event means to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    Ready { id: String, thumbnail: Vec<u8> },
    Failed { reason: String },
}

impl PreviewEvent {
    pub fn ready(id: &str, jpeg: &[u8], request: Option<String>) -> Self {
        Self {
            id: Some(id.to_string()),
            thumbnail: Some(BASE64.encode(jpeg)),
            message: None,
            request,
        }
    }

    pub fn failed(message: impl Into<String>, request: Option<String>) -> Self {
        Self {
            message: Some(message.into()),
            request,
            ..Self::default()
        }
    }

    /// Classify the event.  Anything without both an id and a decodable,
    /// non-empty thumbnail counts as a failed capture.
    pub fn outcome(&self) -> Preview {
        let (Some(id), Some(thumb)) = (&self.id, &self.thumbnail) else {
            return Preview::Failed {
                reason: self
                    .message
                    .clone()
                    .unwrap_or_else(|| "preview without thumbnail".to_string()),
            };
        };
        match BASE64.decode(thumb.trim()) {
            Ok(bytes) if !bytes.is_empty() && !id.is_empty() => Preview::Ready {
                id: id.clone(),
                thumbnail: bytes,
            },
            Ok(_) => Preview::Failed {
                reason: "empty thumbnail or id".to_string(),
            },
            Err(e) => Preview::Failed {
                reason: format!("thumbnail is not valid base64: {e}"),
            },
        }
    }
}

/// Device → operator, on the ack topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AckEvent {
    Saved {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Rejected {
        id: String,
        error: String,
    },
}

impl AckEvent {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Saved { id, .. } => id.as_deref(),
            Self::Rejected { id, .. } => Some(id),
        }
    }
}

/// Encode any wire message.
pub fn to_payload<T: Serialize>(msg: &T) -> Vec<u8> {
    // Serializing these plain structs cannot fail.
    serde_json::to_vec(msg).unwrap_or_default()
}
