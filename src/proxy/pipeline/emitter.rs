use crate::error::{ProxyError, ProxyResult};
use crate::proxy::pipeline::events::{EventStream, StreamingEvent};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;

// Terminal stages: either SSE frames to the client socket, or a drained
// stream whose materialized message the collector holds.

pub type SseByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub fn sse_frame(event: &StreamingEvent) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event.name(),
        serde_json::to_string(event).unwrap_or_default()
    ))
}

// Once bytes are on the wire the HTTP status is committed; a late failure
// becomes a final error event and the stream closes.
pub fn error_frame(error: &ProxyError) -> Bytes {
    let payload = serde_json::json!({
        "type": "error",
        "error": {
            "type": error.error_type(),
            "message": error.to_string(),
            "code": error.code(),
        }
    });
    Bytes::from(format!("event: error\ndata: {}\n\n", payload))
}

pub fn into_sse_bytes(stream: EventStream) -> SseByteStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => yield Ok(sse_frame(&event)),
                Err(e) => {
                    tracing::error!(
                        "[Emitter] Stream error after headers committed (code {}): {}",
                        e.code(),
                        e
                    );
                    yield Ok(error_frame(&e));
                    return;
                }
            }
        }
    })
}

// Drive the stream to completion for a buffered response. The collector tap
// upstream of this call has already materialized the message.
pub async fn drain(mut stream: EventStream) -> ProxyResult<()> {
    while let Some(item) = stream.next().await {
        item?;
    }
    Ok(())
}
