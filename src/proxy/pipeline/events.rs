use crate::error::ProxyError;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

// Public Anthropic streaming vocabulary. Private upstream variants never
// reach these types: the parser maps or drops them first.

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamingEvent, ProxyError>> + Send>>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        citations: Option<Vec<Value>>,
    },
    Thinking {
        thinking: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ServerToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    WebSearchToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
    },
    // Private inbound shape only: carries upstream search knowledge that is
    // consumed internally and never forwarded.
    ToolResult {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        knowledge: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    CitationsDelta { citation: Value },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageShell {
    #[serde(default = "default_message_id")]
    pub id: String,
    #[serde(rename = "type", default = "default_message_type")]
    pub kind: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

fn default_message_id() -> String {
    "msg_unknown".to_string()
}
fn default_message_type() -> String {
    "message".to_string()
}
fn default_role() -> String {
    "assistant".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamingEvent {
    MessageStart {
        message: MessageShell,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: ContentDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
    Error {
        error: ErrorPayload,
    },
}

impl StreamingEvent {
    // SSE event name; matches the serde tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MessageStart { .. } => "message_start",
            Self::ContentBlockStart { .. } => "content_block_start",
            Self::ContentBlockDelta { .. } => "content_block_delta",
            Self::ContentBlockStop { .. } => "content_block_stop",
            Self::MessageDelta { .. } => "message_delta",
            Self::MessageStop => "message_stop",
            Self::Error { .. } => "error",
        }
    }

    pub fn text_delta(index: usize, text: String) -> Self {
        Self::ContentBlockDelta {
            index,
            delta: ContentDelta::TextDelta { text },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_round_trip_through_wire_shape() {
        let wire = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": "Hello"}
        });
        let ev: StreamingEvent = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(ev.name(), "content_block_delta");
        assert_eq!(serde_json::to_value(&ev).unwrap(), wire);
    }

    #[test]
    fn unknown_event_type_fails_deserialization() {
        let wire = json!({"type": "thinking_summary", "summary": "..."});
        assert!(serde_json::from_value::<StreamingEvent>(wire).is_err());
    }

    #[test]
    fn tool_result_block_parses_private_knowledge() {
        let wire = json!({
            "type": "tool_result",
            "tool_use_id": "tu_1",
            "content": [],
            "knowledge": [{"url": "https://example.com"}]
        });
        let block: ContentBlock = serde_json::from_value(wire).unwrap();
        match block {
            ContentBlock::ToolResult { knowledge, .. } => assert!(knowledge.is_some()),
            other => panic!("expected tool_result, got {:?}", other),
        }
    }

    #[test]
    fn message_shell_tolerates_sparse_fields() {
        let shell: MessageShell = serde_json::from_value(json!({"model": "m"})).unwrap();
        assert_eq!(shell.id, "msg_unknown");
        assert_eq!(shell.role, "assistant");
        assert_eq!(shell.kind, "message");
    }
}
