use crate::error::ProxyError;
use crate::proxy::pipeline::events::{EventStream, StreamingEvent};
use crate::proxy::upstream::ByteStream;
use futures::StreamExt;
use serde_json::{json, Value};

// Decode raw SSE frames into tagged events. The upstream mixes public
// Anthropic events with private Claude.ai variants; the private ones are
// normalized into public shapes here or dropped, so nothing downstream ever
// sees them.

pub struct EventParser {
    buffer: String,
}

impl EventParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
        }
    }

    pub fn feed(&mut self, chunk: &str) -> Vec<StreamingEvent> {
        if chunk.contains('\r') {
            self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(chunk);
        }
        self.drain_complete()
    }

    fn drain_complete(&mut self) -> Vec<StreamingEvent> {
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer[..pos].to_string();
            self.buffer.drain(..pos + 2);
            if let Some(event) = parse_sse_frame(&frame) {
                events.push(event);
            }
        }
        events
    }

    // Process whatever is left when the upstream closes mid-frame.
    pub fn flush(&mut self) -> Vec<StreamingEvent> {
        if self.buffer.trim().is_empty() {
            self.buffer.clear();
            return Vec::new();
        }
        tracing::warn!(
            "[Parser] Flushing incomplete buffer ({} bytes)",
            self.buffer.len()
        );
        self.buffer.push_str("\n\n");
        self.drain_complete()
    }
}

impl Default for EventParser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_sse_frame(frame: &str) -> Option<StreamingEvent> {
    let mut data: Option<String> = None;
    for line in frame.split('\n') {
        if line.is_empty() {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        // The event name is redundant with data.type for this upstream;
        // only data lines matter. Multi-line data joins with \n.
        if field == "data" {
            match &mut data {
                None => data = Some(value.to_string()),
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(value);
                }
            }
        }
    }

    let data = data?;
    let value: Value = match serde_json::from_str(&data) {
        Ok(v) => v,
        Err(e) => {
            tracing::error!("[Parser] Malformed event payload: {}", e);
            return None;
        }
    };

    let normalized = normalize_private_event(value)?;
    match serde_json::from_value::<StreamingEvent>(normalized) {
        Ok(event) => Some(event),
        Err(e) => {
            // Unknown discriminants are dropped, never stored.
            tracing::debug!("[Parser] Dropping unmodeled event: {}", e);
            None
        }
    }
}

// Map private upstream variants onto the public schema, or drop them.
fn normalize_private_event(data: Value) -> Option<Value> {
    if !data.is_object() {
        return None;
    }

    match data.get("type").and_then(Value::as_str) {
        Some("message_limit") => return None,
        Some("content_block_delta") => {}
        _ => return Some(data),
    }

    let delta_type = data
        .get("delta")
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str);

    match delta_type {
        Some("citation_start_delta") => {
            let citation =
                convert_private_citation(data.get("delta").and_then(|d| d.get("citation")))?;
            let mut normalized = data;
            normalized["delta"] = json!({
                "type": "citations_delta",
                "citation": citation,
            });
            Some(normalized)
        }
        Some("citation_end_delta") | Some("thinking_summary_delta") => None,
        _ => Some(data),
    }
}

// The private citation payload is thinner than the public schema; a minimal
// web_search_result_location is synthesized so the source link survives.
fn convert_private_citation(raw: Option<&Value>) -> Option<Value> {
    let raw = raw?.as_object()?;
    let url = raw.get("url").and_then(Value::as_str).filter(|u| !u.is_empty())?;
    let title = raw.get("title").and_then(Value::as_str);
    let encrypted_index = raw
        .get("uuid")
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .unwrap_or(url);

    Some(json!({
        "type": "web_search_result_location",
        "cited_text": title.unwrap_or(""),
        "encrypted_index": encrypted_index,
        "title": title,
        "url": url,
    }))
}

pub fn parse_stream(mut upstream: ByteStream) -> EventStream {
    Box::pin(async_stream::stream! {
        let mut parser = EventParser::new();
        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for event in parser.feed(&text) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(ProxyError::UpstreamProtocol(format!(
                        "upstream stream read failed: {}",
                        e
                    )));
                    return;
                }
            }
        }
        for event in parser.flush() {
            yield Ok(event);
        }
    })
}
