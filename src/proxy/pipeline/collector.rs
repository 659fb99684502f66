use crate::proxy::pipeline::events::{
    ContentBlock, ContentDelta, MessageShell, StreamingEvent, Usage,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;

// Applies every event to a materialized message. This is the eventual
// non-streaming body, and the source of truth for usage accounting.

#[derive(Debug, Clone, Serialize)]
pub struct CollectedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub role: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

impl Default for CollectedMessage {
    fn default() -> Self {
        Self {
            id: "msg_unknown".to_string(),
            kind: "message".to_string(),
            role: "assistant".to_string(),
            model: String::new(),
            content: Vec::new(),
            stop_reason: None,
            stop_sequence: None,
            usage: Usage::default(),
        }
    }
}

impl CollectedMessage {
    // Concatenation of all text blocks, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn thinking_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Thinking { thinking, .. } => Some(thinking.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug)]
enum PendingBlock {
    Text {
        text: String,
        citations: Vec<Value>,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        server: bool,
        initial_input: Value,
        json_buf: String,
    },
    Passthrough(ContentBlock),
}

#[derive(Debug, Default)]
pub struct MessageCollector {
    pub message: CollectedMessage,
    open: BTreeMap<usize, PendingBlock>,
    finished: bool,
}

impl MessageCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &StreamingEvent) {
        match event {
            StreamingEvent::MessageStart { message } => self.apply_start(message),
            StreamingEvent::ContentBlockStart {
                index,
                content_block,
            } => self.open_block(*index, content_block),
            StreamingEvent::ContentBlockDelta { index, delta } => self.apply_delta(*index, delta),
            StreamingEvent::ContentBlockStop { index } => self.close_block(*index),
            StreamingEvent::MessageDelta { delta, usage } => {
                if delta.stop_reason.is_some() {
                    self.message.stop_reason = delta.stop_reason.clone();
                }
                if delta.stop_sequence.is_some() {
                    self.message.stop_sequence = delta.stop_sequence.clone();
                }
                if let Some(u) = usage {
                    self.merge_usage(u);
                }
            }
            StreamingEvent::MessageStop => self.finish(),
            StreamingEvent::Error { error } => {
                tracing::warn!(
                    "[Collector] Error event in stream: {} ({})",
                    error.message,
                    error.kind
                );
            }
        }
    }

    fn apply_start(&mut self, shell: &MessageShell) {
        self.message.id = shell.id.clone();
        if !shell.model.is_empty() {
            self.message.model = shell.model.clone();
        }
        self.message.role = shell.role.clone();
        if let Some(usage) = &shell.usage {
            self.merge_usage(usage);
        }
    }

    fn merge_usage(&mut self, usage: &Usage) {
        if usage.input_tokens > 0 {
            self.message.usage.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.message.usage.output_tokens = usage.output_tokens;
        }
        if usage.cache_read_input_tokens.is_some() {
            self.message.usage.cache_read_input_tokens = usage.cache_read_input_tokens;
        }
        if usage.cache_creation_input_tokens.is_some() {
            self.message.usage.cache_creation_input_tokens = usage.cache_creation_input_tokens;
        }
    }

    fn open_block(&mut self, index: usize, block: &ContentBlock) {
        let pending = match block {
            ContentBlock::Text { text, citations } => PendingBlock::Text {
                text: text.clone(),
                citations: citations.clone().unwrap_or_default(),
            },
            ContentBlock::Thinking {
                thinking,
                signature,
            } => PendingBlock::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            ContentBlock::ToolUse { id, name, input } => PendingBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                server: false,
                initial_input: input.clone(),
                json_buf: String::new(),
            },
            ContentBlock::ServerToolUse { id, name, input } => PendingBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                server: true,
                initial_input: input.clone(),
                json_buf: String::new(),
            },
            other => PendingBlock::Passthrough(other.clone()),
        };
        self.open.insert(index, pending);
    }

    fn apply_delta(&mut self, index: usize, delta: &ContentDelta) {
        let Some(pending) = self.open.get_mut(&index) else {
            tracing::debug!("[Collector] Delta for unopened block {}", index);
            return;
        };
        match (pending, delta) {
            (PendingBlock::Text { text, .. }, ContentDelta::TextDelta { text: t }) => {
                text.push_str(t);
            }
            (PendingBlock::Text { citations, .. }, ContentDelta::CitationsDelta { citation }) => {
                citations.push(citation.clone());
            }
            (
                PendingBlock::Thinking { thinking, .. },
                ContentDelta::ThinkingDelta { thinking: t },
            ) => {
                thinking.push_str(t);
            }
            (
                PendingBlock::Thinking { signature, .. },
                ContentDelta::SignatureDelta { signature: s },
            ) => {
                *signature = Some(s.clone());
            }
            (
                PendingBlock::ToolUse { json_buf, .. },
                ContentDelta::InputJsonDelta { partial_json },
            ) => {
                json_buf.push_str(partial_json);
            }
            (pending, delta) => {
                tracing::debug!(
                    "[Collector] Delta/block mismatch at {}: {:?} into {:?}",
                    index,
                    delta,
                    pending
                );
            }
        }
    }

    fn close_block(&mut self, index: usize) {
        if let Some(pending) = self.open.remove(&index) {
            self.message.content.push(Self::finalize(pending));
        }
    }

    fn finalize(pending: PendingBlock) -> ContentBlock {
        match pending {
            PendingBlock::Text { text, citations } => ContentBlock::Text {
                text,
                citations: if citations.is_empty() {
                    None
                } else {
                    Some(citations)
                },
            },
            PendingBlock::Thinking {
                thinking,
                signature,
            } => ContentBlock::Thinking {
                thinking,
                signature,
            },
            PendingBlock::ToolUse {
                id,
                name,
                server,
                initial_input,
                json_buf,
            } => {
                let input = if json_buf.trim().is_empty() {
                    if initial_input.is_null() {
                        json!({})
                    } else {
                        initial_input
                    }
                } else {
                    serde_json::from_str(&json_buf).unwrap_or(json!({}))
                };
                if server {
                    ContentBlock::ServerToolUse { id, name, input }
                } else {
                    ContentBlock::ToolUse { id, name, input }
                }
            }
            PendingBlock::Passthrough(block) => block,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Close anything the upstream left open.
        let indices: Vec<usize> = self.open.keys().copied().collect();
        for index in indices {
            self.close_block(index);
        }
        // A thinking block without a signature gets the empty string so the
        // body stays schema-complete.
        for block in &mut self.message.content {
            if let ContentBlock::Thinking { signature, .. } = block {
                if signature.is_none() {
                    *signature = Some(String::new());
                }
            }
        }
        if self.message.stop_reason.is_none() {
            self.message.stop_reason = Some("end_turn".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pipeline::events::MessageDeltaBody;
    use serde_json::json;

    fn text_start(index: usize) -> StreamingEvent {
        StreamingEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::Text {
                text: String::new(),
                citations: None,
            },
        }
    }

    #[test]
    fn accumulates_text_across_deltas() {
        let mut c = MessageCollector::new();
        c.apply(&text_start(0));
        c.apply(&StreamingEvent::text_delta(0, "Hello".into()));
        c.apply(&StreamingEvent::text_delta(0, " World".into()));
        c.apply(&StreamingEvent::ContentBlockStop { index: 0 });
        c.apply(&StreamingEvent::MessageStop);
        assert_eq!(c.message.text(), "Hello World");
        assert_eq!(c.message.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn signature_delta_lands_in_thinking_block() {
        let mut c = MessageCollector::new();
        c.apply(&StreamingEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        });
        c.apply(&StreamingEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::ThinkingDelta {
                thinking: "reasoning".into(),
            },
        });
        c.apply(&StreamingEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::SignatureDelta {
                signature: "sig-1".into(),
            },
        });
        c.apply(&StreamingEvent::ContentBlockStop { index: 0 });
        c.apply(&StreamingEvent::MessageStop);
        match &c.message.content[0] {
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "reasoning");
                assert_eq!(signature.as_deref(), Some("sig-1"));
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn missing_thinking_signature_is_filled_with_empty_string() {
        let mut c = MessageCollector::new();
        c.apply(&StreamingEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Thinking {
                thinking: "t".into(),
                signature: None,
            },
        });
        c.apply(&StreamingEvent::ContentBlockStop { index: 0 });
        c.apply(&StreamingEvent::MessageStop);
        match &c.message.content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some(""));
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn citations_append_to_owning_text_block() {
        let mut c = MessageCollector::new();
        c.apply(&text_start(0));
        c.apply(&StreamingEvent::text_delta(0, "cited".into()));
        c.apply(&StreamingEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::CitationsDelta {
                citation: json!({"url": "https://example.com"}),
            },
        });
        c.apply(&StreamingEvent::ContentBlockStop { index: 0 });
        match &c.message.content[0] {
            ContentBlock::Text { citations, .. } => {
                assert_eq!(citations.as_ref().unwrap().len(), 1);
            }
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn tool_input_rebuilt_from_partial_json() {
        let mut c = MessageCollector::new();
        c.apply(&StreamingEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "calc".into(),
                input: json!({}),
            },
        });
        c.apply(&StreamingEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "{\"expr\":".into(),
            },
        });
        c.apply(&StreamingEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::InputJsonDelta {
                partial_json: "\"2+2\"}".into(),
            },
        });
        c.apply(&StreamingEvent::ContentBlockStop { index: 0 });
        match &c.message.content[0] {
            ContentBlock::ToolUse { input, .. } => assert_eq!(input["expr"], "2+2"),
            other => panic!("unexpected block {:?}", other),
        }
    }

    #[test]
    fn message_delta_sets_stop_metadata_and_usage() {
        let mut c = MessageCollector::new();
        c.apply(&StreamingEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some("stop_sequence".into()),
                stop_sequence: Some("STOP".into()),
            },
            usage: Some(Usage {
                input_tokens: 10,
                output_tokens: 5,
                ..Usage::default()
            }),
        });
        assert_eq!(c.message.stop_reason.as_deref(), Some("stop_sequence"));
        assert_eq!(c.message.stop_sequence.as_deref(), Some("STOP"));
        assert_eq!(c.message.usage.output_tokens, 5);
    }

    #[test]
    fn unclosed_blocks_are_finalized_at_message_stop() {
        let mut c = MessageCollector::new();
        c.apply(&text_start(0));
        c.apply(&StreamingEvent::text_delta(0, "dangling".into()));
        c.apply(&StreamingEvent::MessageStop);
        assert_eq!(c.message.text(), "dangling");
    }
}
