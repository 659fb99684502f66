use crate::error::{ProxyError, ProxyResult};
use crate::models::MessagesRequest;
use crate::proxy::pipeline::events::{
    ContentBlock, ContentDelta, EventStream, MessageDeltaBody, StreamingEvent,
};
use crate::proxy::pipeline::SharedContext;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

// Stream transforms, applied in pipeline order. Each stage is a function
// EventStream -> EventStream, closed over the shared request context.

// The upstream may report its canonical model id; the client-requested name
// wins in message_start.
pub fn inject_model(stream: EventStream, model: String) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamingEvent::MessageStart { mut message }) => {
                    if message.model != model {
                        tracing::debug!(
                            "[Pipeline] Rewriting model {} -> {}",
                            message.model,
                            model
                        );
                        message.model = model.clone();
                    }
                    yield Ok(StreamingEvent::MessageStart { message });
                }
                other => yield other,
            }
        }
    })
}

#[derive(Debug)]
pub enum StopScan {
    Pass(String),
    Hit { emit: String, sequence: String },
}

// Cross-delta stop-sequence scanner. Text is withheld up to the longest
// sequence length minus one, so a sequence split across deltas still
// matches. The invariant after a Pass: the held tail contains no complete
// sequence.
pub struct StopScanner {
    sequences: Vec<String>,
    tail: String,
    holdback: usize,
}

impl StopScanner {
    pub fn new(sequences: Vec<String>) -> Self {
        let holdback = sequences
            .iter()
            .map(|s| s.len())
            .max()
            .unwrap_or(1)
            .saturating_sub(1);
        Self {
            sequences,
            tail: String::new(),
            holdback,
        }
    }

    pub fn push(&mut self, text: &str) -> StopScan {
        let mut combined = std::mem::take(&mut self.tail);
        combined.push_str(text);

        let hit = self
            .sequences
            .iter()
            .filter_map(|seq| combined.find(seq.as_str()).map(|pos| (pos, seq.clone())))
            .min_by_key(|(pos, _)| *pos);

        if let Some((pos, sequence)) = hit {
            return StopScan::Hit {
                emit: combined[..pos].to_string(),
                sequence,
            };
        }

        // Keep a char-boundary-safe tail of up to `holdback` bytes.
        let mut cut = combined.len().saturating_sub(self.holdback);
        while cut < combined.len() && !combined.is_char_boundary(cut) {
            cut += 1;
        }
        let emit = combined[..cut].to_string();
        self.tail = combined[cut..].to_string();
        StopScan::Pass(emit)
    }

    pub fn flush(&mut self) -> String {
        std::mem::take(&mut self.tail)
    }
}

// Truncate the stream at the first client-supplied stop sequence and
// terminate with a synthetic stop_sequence message_delta + message_stop.
pub fn enforce_stop_sequences(stream: EventStream, sequences: Vec<String>) -> EventStream {
    if sequences.is_empty() {
        return stream;
    }
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        let mut scanner = StopScanner::new(sequences);
        let mut text_index: Option<usize> = None;
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match &event {
                StreamingEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text { .. },
                } => {
                    text_index = Some(*index);
                    yield Ok(event);
                }
                StreamingEvent::ContentBlockDelta {
                    index,
                    delta: ContentDelta::TextDelta { text },
                } => match scanner.push(text) {
                    StopScan::Pass(emit) => {
                        if !emit.is_empty() {
                            yield Ok(StreamingEvent::text_delta(*index, emit));
                        }
                    }
                    StopScan::Hit { emit, sequence } => {
                        let index = *index;
                        if !emit.is_empty() {
                            yield Ok(StreamingEvent::text_delta(index, emit));
                        }
                        tracing::debug!("[Pipeline] Stop sequence matched: {:?}", sequence);
                        yield Ok(StreamingEvent::ContentBlockStop { index });
                        yield Ok(StreamingEvent::MessageDelta {
                            delta: MessageDeltaBody {
                                stop_reason: Some("stop_sequence".to_string()),
                                stop_sequence: Some(sequence),
                            },
                            usage: None,
                        });
                        yield Ok(StreamingEvent::MessageStop);
                        return;
                    }
                },
                StreamingEvent::ContentBlockStop { index }
                    if text_index == Some(*index) =>
                {
                    let rest = scanner.flush();
                    if !rest.is_empty() {
                        yield Ok(StreamingEvent::text_delta(*index, rest));
                    }
                    text_index = None;
                    yield Ok(event);
                }
                _ => yield Ok(event),
            }
        }
    })
}

// Names of tools in the client request that execute server-side and must
// not pause the stream.
pub fn server_tool_names(tools: Option<&Vec<Value>>) -> HashSet<String> {
    let mut names = HashSet::new();
    if let Some(tools) = tools {
        for tool in tools {
            let is_server = tool
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.starts_with("web_search") || t.starts_with("code_execution"))
                .unwrap_or(false);
            if is_server {
                if let Some(name) = tool.get("name").and_then(Value::as_str) {
                    names.insert(name.to_string());
                }
            }
        }
    }
    names
}

// Client tool calls terminate the message with stop_reason = "tool_use".
// Server tools (web search, server-side code execution) continue in the
// same stream. Private tool_result blocks are swallowed; their knowledge
// payloads land in the context for tool continuity.
pub fn handle_tool_calls(stream: EventStream, ctx: SharedContext) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        let mut current_tool: Option<(usize, String, bool)> = None;
        let mut skipping: Option<usize> = None;
        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            match &event {
                StreamingEvent::ContentBlockStart {
                    index,
                    content_block,
                } => match content_block {
                    ContentBlock::ToolUse { id, name, .. } => {
                        let server = ctx.lock().expect("pipeline context")
                            .server_tool_names
                            .contains(name);
                        current_tool = Some((*index, id.clone(), server));
                        tracing::debug!(
                            "[Pipeline] Tool use start: {} (name: {}, server: {})",
                            id,
                            name,
                            server
                        );
                        yield Ok(event);
                    }
                    ContentBlock::ToolResult { knowledge, tool_use_id, .. } => {
                        tracing::debug!(
                            "[Pipeline] Swallowing private tool_result block: {}",
                            tool_use_id
                        );
                        if let Some(k) = knowledge {
                            ctx.lock().expect("pipeline context").knowledge.push(k.clone());
                        }
                        skipping = Some(*index);
                    }
                    _ => yield Ok(event),
                },
                StreamingEvent::ContentBlockDelta { index, .. }
                    if skipping == Some(*index) => {}
                StreamingEvent::ContentBlockStop { index } => {
                    if skipping == Some(*index) {
                        skipping = None;
                        continue;
                    }
                    let index = *index;
                    yield Ok(event);
                    if let Some((tool_index, id, server)) = current_tool.clone() {
                        if tool_index == index {
                            current_tool = None;
                            if server {
                                continue;
                            }
                            ctx.lock().expect("pipeline context").pending_tool_call =
                                Some(id.clone());
                            tracing::info!("[Pipeline] Client tool call registered: {}", id);
                            yield Ok(StreamingEvent::MessageDelta {
                                delta: MessageDeltaBody {
                                    stop_reason: Some("tool_use".to_string()),
                                    stop_sequence: None,
                                },
                                usage: None,
                            });
                            yield Ok(StreamingEvent::MessageStop);
                            return;
                        }
                    }
                }
                _ => yield Ok(event),
            }
        }
    })
}

// Apply every event to the collector while passing it through unchanged.
pub fn tap_collect(stream: EventStream, ctx: SharedContext) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => {
                    ctx.lock().expect("pipeline context").collector.apply(&event);
                    yield Ok(event);
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
    })
}

// Peek the first event before committing response headers. An upstream
// overload announced as the first SSE event converts into a retryable
// error; Ok(None) means the attempt should be repeated (empty stream or
// stall).
pub async fn peek_first_event(
    stream: &mut EventStream,
    timeout: Duration,
) -> ProxyResult<Option<StreamingEvent>> {
    match tokio::time::timeout(timeout, stream.next()).await {
        Ok(Some(Ok(event))) => {
            if let StreamingEvent::Error { error } = &event {
                if error.kind == "overloaded_error" {
                    return Err(ProxyError::UpstreamOverloaded(error.message.clone()));
                }
                return Err(ProxyError::UpstreamProtocol(format!(
                    "upstream error event: {} ({})",
                    error.message, error.kind
                )));
            }
            Ok(Some(event))
        }
        Ok(Some(Err(e))) => Err(e),
        Ok(None) => {
            tracing::warn!("[Pipeline] Stream ended before first event");
            Ok(None)
        }
        Err(_) => {
            tracing::warn!("[Pipeline] Timed out waiting for first event");
            Ok(None)
        }
    }
}

// Known liveness probes are answered with a canned reply instead of
// spending upstream quota. Real one-word prompts ("hi") pass through.
pub fn liveness_reply(request: &MessagesRequest) -> Option<&'static str> {
    if request.messages.len() != 1 {
        return None;
    }
    let message = &request.messages[0];
    if message.role != "user" {
        return None;
    }
    let text = message.text();
    let text = text.trim().to_ascii_lowercase();
    if text == "ping" || text.starts_with("warmup") || text == "connection test" {
        Some("Trestle is up. This canned reply did not consume upstream quota.")
    } else {
        None
    }
}
