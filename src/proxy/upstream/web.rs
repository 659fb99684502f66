use crate::constants;
use crate::error::{classify_upstream_status, ProxyError, ProxyResult};
use crate::models::{short_id, Account, MessageContent, MessagesRequest};
use crate::proxy::upstream::{ByteStream, ProbeOutcome};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};

// Web path: a conversation dance against the claude.ai private API.
// Create -> send completion (private SSE schema) -> delete, all under one
// retry unit. The transcript is flattened into a single text attachment.

#[derive(Debug, Clone, Serialize)]
pub struct Attachment {
    pub file_name: String,
    pub file_type: String,
    pub file_size: usize,
    pub extracted_content: String,
}

impl Attachment {
    pub fn from_text(text: String) -> Self {
        Self {
            file_name: "paste.txt".to_string(),
            file_type: "text/plain".to_string(),
            file_size: text.len(),
            extracted_content: text,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebCompletionRequest {
    pub prompt: String,
    pub timezone: String,
    pub model: String,
    pub rendering_mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens_to_sample: Option<u32>,
    pub attachments: Vec<Attachment>,
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

fn org_url(account: &Account, suffix: &str) -> String {
    format!(
        "{}/api/organizations/{}{}",
        constants::CLAUDE_WEB_BASE_URL,
        account.organization_uuid,
        suffix
    )
}

fn cookie_header(account: &Account) -> ProxyResult<String> {
    account
        .cookie_value
        .clone()
        .ok_or_else(|| ProxyError::InvalidCredentials("account has no cookie".into()))
}

// The 429 body from the web endpoint embeds a unix `resetsAt` timestamp,
// usually inside an escaped JSON string in error.message.
static RESETS_AT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\\?"resetsAt\\?"\s*:\s*(\d+)"#).expect("static regex"));

pub fn parse_resets_at(body: &str) -> Option<DateTime<Utc>> {
    let caps = RESETS_AT_RE.captures(body)?;
    let ts: i64 = caps.get(1)?.as_str().parse().ok()?;
    Utc.timestamp_opt(ts, 0).single()
}

async fn fail_from_response(
    response: reqwest::Response,
    via_proxy: Option<&str>,
) -> ProxyError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let resets_at = parse_resets_at(&body);
    classify_upstream_status(status, &body, resets_at, via_proxy)
}

pub async fn create_conversation(
    client: &reqwest::Client,
    account: &Account,
    via_proxy: Option<&str>,
) -> ProxyResult<String> {
    let conversation_uuid = uuid::Uuid::new_v4().to_string();
    let response = client
        .post(org_url(account, "/chat_conversations"))
        .header("Cookie", cookie_header(account)?)
        .header("Referer", format!("{}/chats", constants::CLAUDE_WEB_BASE_URL))
        .json(&json!({ "uuid": conversation_uuid, "name": "" }))
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(fail_from_response(response, via_proxy).await);
    }
    tracing::debug!(
        "[Web] Created conversation {} for account {}",
        short_id(&conversation_uuid),
        account.short_id()
    );
    Ok(conversation_uuid)
}

pub async fn delete_conversation(
    client: &reqwest::Client,
    account: &Account,
    conversation_uuid: &str,
) -> ProxyResult<()> {
    let response = client
        .delete(org_url(
            account,
            &format!("/chat_conversations/{}", conversation_uuid),
        ))
        .header("Cookie", cookie_header(account)?)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProxyError::Internal(format!(
            "delete conversation returned HTTP {}",
            response.status()
        )));
    }
    tracing::debug!("[Web] Deleted conversation {}", short_id(conversation_uuid));
    Ok(())
}

// PATCH-like settings update on the conversation. Both the conversation
// flag and the injected web_search_v0 tool are required to trigger search.
pub async fn update_conversation_settings(
    client: &reqwest::Client,
    account: &Account,
    conversation_uuid: &str,
    web_search: bool,
    paprika_mode: Option<&str>,
) -> ProxyResult<()> {
    let response = client
        .put(org_url(
            account,
            &format!("/chat_conversations/{}", conversation_uuid),
        ))
        .header("Cookie", cookie_header(account)?)
        .json(&json!({
            "settings": {
                "enabled_web_search": web_search,
                "paprika_mode": paprika_mode,
            }
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ProxyError::Internal(format!(
            "conversation settings update returned HTTP {}",
            response.status()
        )));
    }
    Ok(())
}

pub async fn send_completion(
    client: &reqwest::Client,
    account: &Account,
    conversation_uuid: &str,
    request: &WebCompletionRequest,
    via_proxy: Option<&str>,
) -> ProxyResult<ByteStream> {
    let response = client
        .post(org_url(
            account,
            &format!("/chat_conversations/{}/completion", conversation_uuid),
        ))
        .header("Cookie", cookie_header(account)?)
        .header("Accept", "text/event-stream")
        .header("Referer", format!("{}/chats", constants::CLAUDE_WEB_BASE_URL))
        .json(request)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(fail_from_response(response, via_proxy).await);
    }
    Ok(Box::pin(response.bytes_stream()))
}

// Inline image payload lifted from a request content block.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSource {
    pub media_type: String,
    // Base64 payload as the client sent it.
    pub data: String,
}

// Collect base64 image blocks from the transcript. URL sources cannot be
// replayed through the upload endpoint and are skipped.
pub fn extract_images(request: &MessagesRequest) -> Vec<ImageSource> {
    let mut images = Vec::new();
    for message in &request.messages {
        let MessageContent::Blocks(blocks) = &message.content else {
            continue;
        };
        for block in blocks {
            if block.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            let Some(source) = block.get("source") else {
                continue;
            };
            match source.get("type").and_then(Value::as_str) {
                Some("base64") => {
                    let media_type = source
                        .get("media_type")
                        .and_then(Value::as_str)
                        .unwrap_or("image/png");
                    let Some(data) = source.get("data").and_then(Value::as_str) else {
                        continue;
                    };
                    images.push(ImageSource {
                        media_type: media_type.to_string(),
                        data: data.to_string(),
                    });
                }
                other => {
                    tracing::debug!("[Web] Skipping non-base64 image source: {:?}", other);
                }
            }
        }
    }
    images
}

async fn upload_file_to(
    client: &reqwest::Client,
    base_url: &str,
    account: &Account,
    data: Vec<u8>,
    filename: &str,
    content_type: &str,
) -> ProxyResult<String> {
    let part = reqwest::multipart::Part::bytes(data)
        .file_name(filename.to_string())
        .mime_str(content_type)
        .map_err(|e| ProxyError::Validation(format!("invalid media type: {}", e)))?;
    let form = reqwest::multipart::Form::new().part("file", part);

    let response = client
        .post(format!(
            "{}/api/{}/upload",
            base_url, account.organization_uuid
        ))
        .header("Cookie", cookie_header(account)?)
        .header("Referer", format!("{}/chats", constants::CLAUDE_WEB_BASE_URL))
        .multipart(form)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(fail_from_response(response, None).await);
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| ProxyError::UpstreamProtocol(format!("upload response: {}", e)))?;
    body.get("file_uuid")
        .or_else(|| body.get("file_url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            ProxyError::UpstreamProtocol("upload response carried no file id".into())
        })
}

// Upload one file to the organization and return its id for the
// completion request's `files` list.
pub async fn upload_file(
    client: &reqwest::Client,
    account: &Account,
    data: Vec<u8>,
    filename: &str,
    content_type: &str,
) -> ProxyResult<String> {
    upload_file_to(
        client,
        constants::CLAUDE_WEB_BASE_URL,
        account,
        data,
        filename,
        content_type,
    )
    .await
}

// Decode and upload every inline image. Failures are logged and skipped so
// a bad attachment never sinks the whole request.
pub async fn upload_images(
    client: &reqwest::Client,
    account: &Account,
    images: &[ImageSource],
) -> Vec<String> {
    use base64::Engine;

    let mut file_ids = Vec::new();
    for (i, image) in images.iter().enumerate() {
        let bytes = match base64::engine::general_purpose::STANDARD.decode(image.data.as_bytes())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("[Web] Failed to decode image {}: {}", i, e);
                continue;
            }
        };
        match upload_file(
            client,
            account,
            bytes,
            &format!("image_{}.png", i),
            &image.media_type,
        )
        .await
        {
            Ok(file_id) => {
                tracing::debug!("[Web] Uploaded image {}: {}", i, file_id);
                file_ids.push(file_id);
            }
            Err(e) => {
                tracing::error!("[Web] Failed to upload image {}: {}", i, e);
            }
        }
    }
    file_ids
}

// Replace versioned public web-search server tools with the web endpoint's
// own variant. Returns whether search was requested, plus the rewritten
// tool list.
pub fn process_web_search_tools(tools: &[Value]) -> (bool, Vec<Value>) {
    let mut has_web_search = false;
    let mut filtered: Vec<Value> = Vec::with_capacity(tools.len());
    for tool in tools {
        let tool_type = tool.get("type").and_then(Value::as_str);
        if matches!(tool_type, Some(t) if t.starts_with(constants::WEB_SEARCH_TOOL_PREFIX)) {
            has_web_search = true;
        } else {
            filtered.push(tool.clone());
        }
    }
    if has_web_search {
        filtered.insert(
            0,
            json!({
                "type": constants::WEB_SEARCH_V0_TYPE,
                "name": constants::WEB_SEARCH_TOOL_NAME,
            }),
        );
    }
    (has_web_search, filtered)
}

fn render_block(block: &Value, out: &mut String) {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => {
            if let Some(text) = block.get("text").and_then(Value::as_str) {
                out.push_str(text);
                out.push('\n');
            }
        }
        Some("tool_use") => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or("tool");
            let id = block.get("id").and_then(Value::as_str).unwrap_or("");
            let input = block.get("input").cloned().unwrap_or(json!({}));
            out.push_str(&format!(
                "<tool_call id=\"{}\" name=\"{}\">{}</tool_call>\n",
                id, name, input
            ));
        }
        Some("tool_result") => {
            let id = block
                .get("tool_use_id")
                .and_then(Value::as_str)
                .unwrap_or("");
            let content = match block.get("content") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Array(items)) => items
                    .iter()
                    .filter_map(|i| i.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n"),
                _ => String::new(),
            };
            out.push_str(&format!(
                "<tool_result id=\"{}\">{}</tool_result>\n",
                id, content
            ));
        }
        // Image blocks are uploaded separately and referenced through the
        // completion request's `files` list; thinking blocks are not
        // replayable through the web endpoint.
        _ => {}
    }
}

// Flatten the Messages transcript into the single text the completion
// endpoint accepts. This is where inbound client tool results are reshaped
// for the web path.
pub fn flatten_transcript(request: &MessagesRequest) -> ProxyResult<String> {
    let mut out = String::new();

    if let Some(system) = &request.system {
        match system {
            Value::String(s) if !s.is_empty() => {
                out.push_str("System: ");
                out.push_str(s);
                out.push_str("\n\n");
            }
            Value::Array(blocks) => {
                let text: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if !text.is_empty() {
                    out.push_str("System: ");
                    out.push_str(&text.join("\n"));
                    out.push_str("\n\n");
                }
            }
            _ => {}
        }
    }

    for message in &request.messages {
        let prefix = if message.role == "user" {
            "Human: "
        } else {
            "Assistant: "
        };
        out.push_str(prefix);
        match &message.content {
            MessageContent::Text(s) => {
                out.push_str(s);
                out.push('\n');
            }
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    render_block(block, &mut out);
                }
            }
        }
        out.push('\n');
    }

    let merged = out.trim().to_string();
    if merged.is_empty() {
        return Err(ProxyError::Validation(
            "no usable text in messages".into(),
        ));
    }
    Ok(merged)
}

pub fn build_completion_request(
    request: &MessagesRequest,
    tools: Vec<Value>,
    files: Vec<String>,
) -> ProxyResult<WebCompletionRequest> {
    let merged = flatten_transcript(request)?;
    Ok(WebCompletionRequest {
        prompt: String::new(),
        timezone: "UTC".to_string(),
        model: request.model.clone(),
        rendering_mode: "messages".to_string(),
        max_tokens_to_sample: request.max_tokens,
        attachments: vec![Attachment::from_text(merged)],
        files,
        tools,
    })
}

// Cookie-path rate-limit probe: create -> minimal send -> delete.
pub async fn probe(client: &reqwest::Client, account: &Account) -> ProbeOutcome {
    let conversation = match create_conversation(client, account, None).await {
        Ok(c) => c,
        Err(ProxyError::RateLimited { resets_at }) => {
            return ProbeOutcome::RateLimited(resets_at)
        }
        Err(e) => return ProbeOutcome::Inconclusive(e.to_string()),
    };

    let payload = WebCompletionRequest {
        prompt: "hi".to_string(),
        timezone: "UTC".to_string(),
        model: constants::PROBE_MODEL.to_string(),
        rendering_mode: "messages".to_string(),
        max_tokens_to_sample: Some(1),
        attachments: Vec::new(),
        files: Vec::new(),
        tools: Vec::new(),
    };

    let outcome = match send_completion(client, account, &conversation, &payload, None).await {
        Ok(_) => ProbeOutcome::Valid,
        Err(ProxyError::RateLimited { resets_at }) => ProbeOutcome::RateLimited(resets_at),
        Err(e) => ProbeOutcome::Inconclusive(e.to_string()),
    };

    if let Err(e) = delete_conversation(client, account, &conversation).await {
        tracing::debug!("[Web] Probe conversation cleanup failed: {}", e);
    }
    outcome
}
