use crate::models::MessagesRequest;
use crate::proxy::pipeline::collector::CollectedMessage;

// Character-ratio token estimate, used only when the upstream omitted
// usage (the web path reports none).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    ((chars + 3) / 4).max(1)
}

fn request_text(request: &MessagesRequest) -> String {
    let mut out = String::new();
    if let Some(system) = &request.system {
        if let Some(s) = system.as_str() {
            out.push_str(s);
        }
    }
    for message in &request.messages {
        out.push_str(&message.text());
        out.push('\n');
    }
    out
}

// Fill missing usage fields on the materialized message.
pub fn fill_missing_usage(message: &mut CollectedMessage, request: &MessagesRequest) {
    if message.usage.input_tokens == 0 {
        message.usage.input_tokens = estimate_tokens(&request_text(request));
    }
    if message.usage.output_tokens == 0 {
        let mut produced = message.text();
        produced.push_str(&message.thinking_text());
        message.usage.output_tokens = estimate_tokens(&produced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::pipeline::events::Usage;
    use serde_json::json;

    #[test]
    fn estimate_is_quarter_of_chars_rounded_up() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }

    #[test]
    fn upstream_usage_is_never_overwritten() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "m", "messages": [{"role": "user", "content": "hello there"}]
        }))
        .unwrap();
        let mut message = CollectedMessage {
            usage: Usage {
                input_tokens: 42,
                output_tokens: 7,
                ..Usage::default()
            },
            ..CollectedMessage::default()
        };
        fill_missing_usage(&mut message, &request);
        assert_eq!(message.usage.input_tokens, 42);
        assert_eq!(message.usage.output_tokens, 7);
    }

    #[test]
    fn missing_usage_is_estimated_from_text() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "m", "messages": [{"role": "user", "content": "hello there friend"}]
        }))
        .unwrap();
        let mut message = CollectedMessage::default();
        message.content.push(
            crate::proxy::pipeline::events::ContentBlock::Text {
                text: "a reply of some length".into(),
                citations: None,
            },
        );
        fill_missing_usage(&mut message, &request);
        assert!(message.usage.input_tokens > 0);
        assert!(message.usage.output_tokens > 0);
    }
}
