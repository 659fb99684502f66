pub mod collector;
pub mod emitter;
pub mod events;
pub mod parser;
pub mod stages;
pub mod tokens;

use crate::proxy::upstream::ByteStream;
use collector::MessageCollector;
use events::EventStream;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

// Per-request mutable bag shared by the pipeline stages.
#[derive(Debug)]
pub struct PipelineContext {
    pub requested_model: String,
    pub stop_sequences: Vec<String>,
    pub stream_requested: bool,
    pub server_tool_names: HashSet<String>,
    pub collector: MessageCollector,
    // Upstream search knowledge swallowed from private tool_result blocks.
    pub knowledge: Vec<Value>,
    // Set when a client tool call paused the message; the web conversation
    // is kept alive for the continuation.
    pub pending_tool_call: Option<String>,
}

pub type SharedContext = Arc<Mutex<PipelineContext>>;

impl PipelineContext {
    pub fn new(requested_model: String, stop_sequences: Vec<String>, stream_requested: bool) -> Self {
        Self {
            requested_model,
            stop_sequences,
            stream_requested,
            server_tool_names: HashSet::new(),
            collector: MessageCollector::new(),
            knowledge: Vec::new(),
            pending_tool_call: None,
        }
    }

    pub fn shared(self) -> SharedContext {
        Arc::new(Mutex::new(self))
    }
}

// Assemble the staged transforms over a raw upstream byte stream. Ordering
// matters: parse, normalize the model name, enforce stop sequences, handle
// tool calls, then tap everything into the collector.
pub fn build_pipeline(raw: ByteStream, ctx: SharedContext) -> EventStream {
    let (model, stops) = {
        let guard = ctx.lock().expect("pipeline context");
        (guard.requested_model.clone(), guard.stop_sequences.clone())
    };
    let events = parser::parse_stream(raw);
    let events = stages::inject_model(events, model);
    let events = stages::enforce_stop_sequences(events, stops);
    let events = stages::handle_tool_calls(events, ctx.clone());
    stages::tap_collect(events, ctx)
}
