use bytes::Bytes;
use serde_json::{Map, Value as JsonValue, json};

use tollgate_protocol::RelayMode;
use tollgate_protocol::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
    MessageContent,
};
use tollgate_protocol::sse::SseEvent;
use tollgate_protocol::usage::Usage;

use crate::adapter::{Adapter, StreamScan};
use crate::api_type::ApiType;
use crate::descriptor::RelayDescriptor;
use crate::error::{AdapterError, AdapterResult};
use crate::headers::{self, Headers};
use crate::request::{OutboundBody, RelayPayload};
use crate::response::ParsedResponse;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

/// Gemini dialect upstream: chat maps onto `generateContent` /
/// `streamGenerateContent`, embeddings onto `embedContent`.
#[derive(Debug, Default)]
pub struct GeminiAdapter;

#[async_trait::async_trait]
impl Adapter for GeminiAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Gemini
    }

    fn build_url(&self, desc: &RelayDescriptor) -> AdapterResult<String> {
        let base = desc
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        let model = &desc.actual_model;
        match desc.mode {
            RelayMode::Chat | RelayMode::ClaudeMessages => {
                if desc.is_stream {
                    Ok(format!(
                        "{base}/v1beta/models/{model}:streamGenerateContent?alt=sse"
                    ))
                } else {
                    Ok(format!("{base}/v1beta/models/{model}:generateContent"))
                }
            }
            RelayMode::Embeddings => Ok(format!("{base}/v1beta/models/{model}:embedContent")),
            _ => Err(AdapterError::Unsupported("mode not served by gemini family")),
        }
    }

    fn set_headers(&self, desc: &RelayDescriptor, headers: &mut Headers) {
        headers::header_set(headers, "x-goog-api-key", desc.api_key.clone());
        headers::set_accept_json(headers);
    }

    fn convert_request(
        &self,
        desc: &RelayDescriptor,
        payload: &RelayPayload,
    ) -> AdapterResult<OutboundBody> {
        match payload {
            RelayPayload::Chat(req) => {
                if req.messages.is_empty() {
                    return Err(AdapterError::NilRequest);
                }
                let body = chat_to_generate_content(req);
                let bytes = serde_json::to_vec(&body)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(OutboundBody::Json(Bytes::from(bytes)))
            }
            RelayPayload::Embeddings(req) => {
                let text = req.input.flat_text();
                if text.is_empty() {
                    return Err(AdapterError::NilRequest);
                }
                let body = json!({
                    "model": format!("models/{}", desc.actual_model),
                    "content": {"parts": [{"text": text}]}
                });
                let bytes = serde_json::to_vec(&body)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(OutboundBody::Json(Bytes::from(bytes)))
            }
            _ => Err(AdapterError::Unsupported("mode not served by gemini family")),
        }
    }

    fn parse_response(
        &self,
        desc: &RelayDescriptor,
        body: &Bytes,
    ) -> AdapterResult<ParsedResponse> {
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|err| AdapterError::Serialize(err.to_string()))?;
        match desc.mode {
            RelayMode::Chat => {
                let text = candidates_text(&value).unwrap_or_default();
                let usage = usage_metadata(&value);
                let chat = generate_content_to_chat(&desc.actual_model, &text, usage);
                let translated = serde_json::to_vec(&chat)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(ParsedResponse {
                    body: Bytes::from(translated),
                    usage,
                    text: (!text.is_empty()).then_some(text),
                })
            }
            RelayMode::Embeddings => {
                // embedContent reports no usage; the engine settles at the
                // pre-dispatch estimate.
                let embedding: Vec<f64> = value
                    .get("embedding")
                    .and_then(|e| e.get("values"))
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                let translated = json!({
                    "object": "list",
                    "model": desc.origin_model,
                    "data": [{"object": "embedding", "index": 0, "embedding": embedding}],
                });
                let bytes = serde_json::to_vec(&translated)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(ParsedResponse {
                    body: Bytes::from(bytes),
                    usage: None,
                    text: None,
                })
            }
            _ => Err(AdapterError::Unsupported("mode not served by gemini family")),
        }
    }

    fn scan_stream_event(&self, _desc: &RelayDescriptor, scan: &mut StreamScan, event: &SseEvent) {
        if event.is_done() {
            return;
        }
        let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) else {
            return;
        };
        if let Some(text) = candidates_text(&value) {
            scan.text.push_str(&text);
        }
        if let Some(usage) = usage_metadata(&value) {
            scan.usage = Some(usage);
        }
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            scan.upstream_error = Some(message.to_string());
        }
    }
}

fn chat_to_generate_content(req: &ChatCompletionRequest) -> JsonValue {
    let mut system_parts: Vec<JsonValue> = Vec::new();
    let mut contents: Vec<JsonValue> = Vec::new();
    for message in &req.messages {
        let text = message
            .content
            .as_ref()
            .map(MessageContent::flat_text)
            .unwrap_or_default();
        match message.role {
            ChatRole::System | ChatRole::Developer => {
                system_parts.push(json!({"text": text}));
            }
            ChatRole::Assistant => {
                contents.push(json!({"role": "model", "parts": [{"text": text}]}));
            }
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }
    let mut body = json!({"contents": contents});
    if !system_parts.is_empty() {
        body["systemInstruction"] = json!({"parts": system_parts});
    }
    let mut generation_config = Map::new();
    if let Some(max_tokens) = req.max_tokens.or(req.max_completion_tokens) {
        generation_config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = req.temperature {
        generation_config.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = req.top_p {
        generation_config.insert("topP".to_string(), json!(top_p));
    }
    if !generation_config.is_empty() {
        body["generationConfig"] = JsonValue::Object(generation_config);
    }
    body
}

fn generate_content_to_chat(
    model: &str,
    text: &str,
    usage: Option<Usage>,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: "chatcmpl-gemini".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: Some(MessageContent::Text(text.to_string())),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage,
        extra: Map::new(),
    }
}

fn candidates_text(value: &JsonValue) -> Option<String> {
    let candidates = value.get("candidates")?.as_array()?;
    let mut out = String::new();
    for candidate in candidates {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    out.push_str(text);
                }
            }
        }
    }
    (!out.is_empty()).then_some(out)
}

fn usage_metadata(value: &JsonValue) -> Option<Usage> {
    let metadata = value.get("usageMetadata")?;
    let prompt = metadata.get("promptTokenCount").and_then(|v| v.as_i64());
    let candidates = metadata
        .get("candidatesTokenCount")
        .and_then(|v| v.as_i64());
    if prompt.is_none() && candidates.is_none() {
        return None;
    }
    Some(Usage::new(prompt.unwrap_or(0), candidates.unwrap_or(0)))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn descriptor(mode: RelayMode, is_stream: bool) -> RelayDescriptor {
        RelayDescriptor {
            api_type: ApiType::Gemini,
            channel_id: 3,
            channel_name: "google".into(),
            token_id: 1,
            user_id: 1,
            group: "default".into(),
            mode,
            is_stream,
            origin_model: "gemini-pro".into(),
            actual_model: "gemini-1.5-pro".into(),
            base_url: None,
            api_key: "g-key".into(),
            auto_ban: true,
            api_version: None,
            plugin_id: None,
            library_id: None,
            config: HashMap::new(),
        }
    }

    #[test]
    fn stream_url_uses_sse_action() {
        let adapter = GeminiAdapter;
        assert_eq!(
            adapter.build_url(&descriptor(RelayMode::Chat, true)).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:streamGenerateContent?alt=sse"
        );
        assert_eq!(
            adapter.build_url(&descriptor(RelayMode::Chat, false)).unwrap(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
    }

    #[test]
    fn chat_response_translates_to_canonical() {
        let adapter = GeminiAdapter;
        let desc = descriptor(RelayMode::Chat, false);
        let body = Bytes::from(
            serde_json::to_vec(&json!({
                "candidates": [{"content": {"parts": [{"text": "answer"}], "role": "model"}}],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 3}
            }))
            .unwrap(),
        );
        let parsed = adapter.parse_response(&desc, &body).unwrap();
        assert_eq!(parsed.text.as_deref(), Some("answer"));
        assert_eq!(parsed.usage.map(|u| u.prompt_tokens), Some(12));
        let value: JsonValue = serde_json::from_slice(&parsed.body).unwrap();
        assert_eq!(value["object"], "chat.completion");
    }
}
