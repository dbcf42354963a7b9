//! Conversation messages exchanged between agents and language models.
//!
//! Messages follow the chat-completion conventions: a system prompt, user
//! turns, assistant turns that may carry tool calls, and tool turns holding
//! the results of one dispatched batch. Binary content is representable in
//! three forms — inline base64, an offloaded blob marker, and a short-lived
//! signed download URL — so that persisted state never embeds raw bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::ToolCallId;

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    /// System instructions.
    System {
        /// The instruction text.
        content: String,
    },
    /// A user turn.
    User {
        /// Content parts of the turn.
        content: Vec<ContentPart>,
    },
    /// An assistant turn, possibly requesting tool calls.
    Assistant {
        /// Content parts of the turn.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        content: Vec<ContentPart>,
        /// Tool calls requested by the model.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCallPart>,
    },
    /// Results for one dispatched tool batch.
    Tool {
        /// One result part per originating tool call, in tool-call order.
        results: Vec<ToolResultPart>,
    },
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::System {
            content: content.into(),
        }
    }

    /// Create a user message from plain text.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            content: vec![ContentPart::text(text)],
        }
    }

    /// Create a user message from content parts.
    #[must_use]
    pub fn user_parts(content: Vec<ContentPart>) -> Self {
        Self::User { content }
    }

    /// Create an assistant message from plain text.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant {
            content: vec![ContentPart::text(text)],
            tool_calls: Vec::new(),
        }
    }

    /// Create an assistant message with text and tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(
        text: Option<String>,
        tool_calls: Vec<ToolCallPart>,
    ) -> Self {
        Self::Assistant {
            content: text.map(ContentPart::text).into_iter().collect(),
            tool_calls,
        }
    }

    /// Create a tool message holding one batch of results.
    #[must_use]
    pub fn tool(results: Vec<ToolResultPart>) -> Self {
        Self::Tool { results }
    }

    /// Concatenated text content, if any.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let parts = match self {
            Self::System { content } => return Some(content.clone()),
            Self::User { content } | Self::Assistant { content, .. } => content,
            Self::Tool { .. } => return None,
        };
        let text: Vec<&str> = parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::Binary(_) => None,
            })
            .collect();
        if text.is_empty() {
            None
        } else {
            Some(text.join(""))
        }
    }

    /// Tool calls carried by this message, if it is an assistant turn.
    #[must_use]
    pub fn tool_calls(&self) -> Option<&[ToolCallPart]> {
        match self {
            Self::Assistant { tool_calls, .. } if !tool_calls.is_empty() => Some(tool_calls),
            _ => None,
        }
    }
}

/// A single piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// Binary content in one of its three representations.
    Binary(BinaryPart),
}

impl ContentPart {
    /// Create a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create a binary part from raw bytes (inline base64 representation).
    #[must_use]
    pub fn binary(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Binary(BinaryPart::from_bytes(content_type, bytes))
    }
}

/// Binary message content with its transport representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryPart {
    /// MIME type of the content.
    pub content_type: String,
    /// Size of the decoded content in bytes.
    pub size: u64,
    /// Where the bytes live.
    #[serde(flatten)]
    pub data: BinaryData,
}

impl BinaryPart {
    /// Create an inline part from raw bytes.
    #[must_use]
    pub fn from_bytes(content_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            content_type: content_type.into(),
            size: bytes.len() as u64,
            data: BinaryData::Inline {
                data: BASE64.encode(bytes),
            },
        }
    }

    /// Decode inline data back to raw bytes. Returns `None` for offloaded
    /// representations or invalid base64.
    #[must_use]
    pub fn decode(&self) -> Option<Vec<u8>> {
        match &self.data {
            BinaryData::Inline { data } => BASE64.decode(data).ok(),
            BinaryData::Blob { .. } | BinaryData::Url { .. } => None,
        }
    }

    /// Check whether the bytes are still inline.
    #[must_use]
    pub const fn is_inline(&self) -> bool {
        matches!(self.data, BinaryData::Inline { .. })
    }
}

/// The transport representation of binary content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BinaryData {
    /// Base64-encoded bytes carried in the message itself.
    Inline {
        /// Base64 payload.
        data: String,
    },
    /// Opaque marker for bytes offloaded to blob storage.
    Blob {
        /// Storage URI resolvable via the blob store.
        uri: String,
    },
    /// Short-lived signed download URL produced on state read.
    Url {
        /// The signed URL.
        url: String,
        /// Storage URI the URL was derived from.
        uri: String,
        /// Expiry of the signed URL.
        expires_at: DateTime<Utc>,
    },
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPart {
    /// Identifier of this invocation.
    pub id: ToolCallId,
    /// Name of the tool to invoke.
    pub name: String,
    /// JSON arguments for the invocation.
    pub arguments: Value,
}

impl ToolCallPart {
    /// Create a tool call part.
    #[must_use]
    pub fn new(id: ToolCallId, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id,
            name: name.into(),
            arguments,
        }
    }
}

/// The result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultPart {
    /// Identifier of the originating tool call.
    pub tool_call_id: ToolCallId,
    /// Name of the tool that produced the result.
    pub tool_name: String,
    /// Result payload; error text when `is_error` is set.
    pub output: Value,
    /// Whether the invocation failed.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultPart {
    /// Create a successful result part.
    #[must_use]
    pub fn success(tool_call_id: ToolCallId, tool_name: impl Into<String>, output: Value) -> Self {
        Self {
            tool_call_id,
            tool_name: tool_name.into(),
            output,
            is_error: false,
        }
    }

    /// Create an error result part with a textual message.
    #[must_use]
    pub fn error(
        tool_call_id: ToolCallId,
        tool_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id,
            tool_name: tool_name.into(),
            output: Value::String(message.into()),
            is_error: true,
        }
    }
}
