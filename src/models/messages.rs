use serde::{Deserialize, Serialize};
use serde_json::Value;

// Anthropic Messages API request body. Tools stay as raw JSON so the OAuth
// path forwards them byte-faithfully; the web path only inspects type/name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<RequestMetadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl MessagesRequest {
    // Whether the request asks for extended thinking.
    pub fn thinking_enabled(&self) -> bool {
        matches!(
            self.thinking.as_ref().map(|t| t.kind.as_str()),
            Some("enabled") | Some("adaptive")
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("`model` must not be empty".into());
        }
        if self.messages.is_empty() {
            return Err("`messages` must not be empty".into());
        }
        for (i, m) in self.messages.iter().enumerate() {
            if m.role != "user" && m.role != "assistant" {
                return Err(format!("messages[{}].role must be user or assistant", i));
            }
        }
        Ok(())
    }
}

impl Message {
    // Plain-text view of the message, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_and_block_content() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "max_tokens": 128,
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": [{"type": "text", "text": "hello"}]}
            ]
        }))
        .unwrap();
        assert!(req.validate().is_ok());
        assert_eq!(req.messages[0].text(), "hi");
        assert_eq!(req.messages[1].text(), "hello");
        assert!(!req.stream);
    }

    #[test]
    fn rejects_empty_messages() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-sonnet-4-20250514",
            "messages": []
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn thinking_enabled_covers_adaptive() {
        let req: MessagesRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x"}],
            "thinking": {"type": "adaptive"}
        }))
        .unwrap();
        assert!(req.thinking_enabled());
    }
}
