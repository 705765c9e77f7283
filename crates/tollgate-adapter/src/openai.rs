use bytes::Bytes;
use serde_json::Value as JsonValue;

use tollgate_protocol::RelayMode;
use tollgate_protocol::chat::{ChatCompletionChunk, ChatCompletionResponse};
use tollgate_protocol::sse::SseEvent;

use crate::adapter::{Adapter, StreamScan, join_url};
use crate::api_type::ApiType;
use crate::descriptor::RelayDescriptor;
use crate::error::{AdapterError, AdapterResult};
use crate::headers::{self, Headers};
use crate::request::{MultipartForm, OutboundBody, RelayPayload};
use crate::response::{ParsedResponse, usage_from_json};
use crate::transform;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Generic OpenAI-shaped upstream. Azure-style deployments are served by the
/// same adapter: an `api_version` slot in the descriptor switches the URL
/// scheme and auth header.
#[derive(Debug, Default)]
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    fn mode_path(mode: RelayMode) -> AdapterResult<&'static str> {
        Ok(match mode {
            RelayMode::Chat => "/v1/chat/completions",
            RelayMode::Completions => "/v1/completions",
            RelayMode::Embeddings => "/v1/embeddings",
            RelayMode::Moderation => "/v1/moderations",
            RelayMode::ImagesGenerations => "/v1/images/generations",
            RelayMode::ImagesEdits => "/v1/images/edits",
            RelayMode::AudioSpeech => "/v1/audio/speech",
            RelayMode::AudioTranscription => "/v1/audio/transcriptions",
            RelayMode::AudioTranslation => "/v1/audio/translations",
            RelayMode::Responses => "/v1/responses",
            RelayMode::ClaudeMessages => "/v1/chat/completions",
            RelayMode::Realtime | RelayMode::ModelsList => {
                return Err(AdapterError::Unsupported("mode has no http path"));
            }
        })
    }

    fn serialize_json<T: serde::Serialize>(value: &T) -> AdapterResult<OutboundBody> {
        let body =
            serde_json::to_vec(value).map_err(|err| AdapterError::Serialize(err.to_string()))?;
        Ok(OutboundBody::Json(Bytes::from(body)))
    }

    fn transcription_form(
        fields: &tollgate_protocol::audio::TranscriptionFields,
        model: &str,
        file_name: &str,
        file: &Bytes,
    ) -> MultipartForm {
        let mut form = MultipartForm::default()
            .text("model", model)
            .file("file", file_name, file.clone());
        if let Some(language) = &fields.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &fields.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(format) = &fields.response_format {
            form = form.text("response_format", format.clone());
        }
        if let Some(temperature) = fields.temperature {
            form = form.text("temperature", temperature.to_string());
        }
        form
    }
}

#[async_trait::async_trait]
impl Adapter for OpenAiAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::OpenAi
    }

    fn build_url(&self, desc: &RelayDescriptor) -> AdapterResult<String> {
        let path = Self::mode_path(desc.mode)?;
        if let Some(api_version) = &desc.api_version {
            // Azure deployment layout: the model is part of the path and the
            // version travels as a query parameter.
            let base = desc
                .base_url
                .as_deref()
                .ok_or_else(|| {
                    AdapterError::InvalidConfig("azure channel requires a base url".to_string())
                })?
                .trim_end_matches('/');
            let trimmed = path.trim_start_matches("/v1");
            return Ok(format!(
                "{base}/openai/deployments/{model}{trimmed}?api-version={api_version}",
                model = desc.actual_model
            ));
        }
        Ok(join_url(desc.base_url.as_deref(), DEFAULT_BASE_URL, path))
    }

    fn set_headers(&self, desc: &RelayDescriptor, headers: &mut Headers) {
        if desc.api_version.is_some() {
            headers::header_set(headers, "api-key", desc.api_key.clone());
        } else {
            headers::set_bearer(headers, &desc.api_key);
        }
        if desc.is_stream {
            headers::header_set(headers, "accept", "text/event-stream");
        } else {
            headers::set_accept_json(headers);
        }
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
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::Completions(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::Embeddings(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::Moderation(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::ImagesGenerations(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::ImagesEdits {
                request,
                image_name,
                image,
            } => {
                let mut form = MultipartForm::default()
                    .text("model", desc.actual_model.clone())
                    .text("prompt", request.prompt.clone())
                    .file("image", image_name.clone(), image.clone());
                if let Some(n) = request.n {
                    form = form.text("n", n.to_string());
                }
                if let Some(size) = &request.size {
                    form = form.text("size", size.clone());
                }
                Ok(OutboundBody::Multipart(form))
            }
            RelayPayload::AudioSpeech(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
            RelayPayload::AudioTranscription {
                fields,
                file_name,
                file,
            }
            | RelayPayload::AudioTranslation {
                fields,
                file_name,
                file,
            } => Ok(OutboundBody::Multipart(Self::transcription_form(
                fields,
                &desc.actual_model,
                file_name,
                file,
            ))),
            RelayPayload::ClaudeMessages(req) => {
                if req.messages.is_empty() {
                    return Err(AdapterError::NilRequest);
                }
                let mut chat = transform::claude_to_chat(req);
                chat.model = desc.actual_model.clone();
                Self::serialize_json(&chat)
            }
            RelayPayload::Responses(req) => {
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                Self::serialize_json(&req)
            }
        }
    }

    fn parse_response(
        &self,
        desc: &RelayDescriptor,
        body: &Bytes,
    ) -> AdapterResult<ParsedResponse> {
        match desc.mode {
            RelayMode::Chat | RelayMode::Completions => {
                let value: JsonValue = serde_json::from_slice(body)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                let usage = usage_from_json(&value);
                let text = completion_text(&value);
                Ok(ParsedResponse {
                    body: body.clone(),
                    usage,
                    text,
                })
            }
            RelayMode::ClaudeMessages => {
                // The client speaks Claude; translate the chat response back.
                let chat: ChatCompletionResponse = serde_json::from_slice(body)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                let usage = chat.usage;
                let claude = transform::chat_response_to_claude(&chat);
                let translated = serde_json::to_vec(&claude)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(ParsedResponse {
                    body: Bytes::from(translated),
                    usage,
                    text: claude
                        .content
                        .first()
                        .and_then(|block| block.get("text"))
                        .and_then(|t| t.as_str())
                        .map(str::to_string),
                })
            }
            RelayMode::Embeddings | RelayMode::Responses => {
                let value: JsonValue = serde_json::from_slice(body)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(ParsedResponse {
                    body: body.clone(),
                    usage: usage_from_json(&value),
                    text: None,
                })
            }
            // Binary or usage-free bodies pass through; the engine settles at
            // the pre-dispatch estimate.
            _ => Ok(ParsedResponse {
                body: body.clone(),
                usage: None,
                text: None,
            }),
        }
    }

    fn scan_stream_event(&self, desc: &RelayDescriptor, scan: &mut StreamScan, event: &SseEvent) {
        if event.is_done() {
            return;
        }
        let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) else {
            return;
        };
        if let Some(usage) = usage_from_json(&value) {
            scan.usage = Some(usage);
        }
        // Responses-mode terminal events nest usage under `response`.
        if scan.usage.is_none()
            && let Some(response) = value.get("response")
            && let Some(usage) = usage_from_json(response)
        {
            scan.usage = Some(usage);
        }
        if let Some(message) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            scan.upstream_error = Some(message.to_string());
        }
        match desc.mode {
            RelayMode::Chat | RelayMode::ClaudeMessages => {
                if let Ok(chunk) = serde_json::from_value::<ChatCompletionChunk>(value) {
                    for choice in &chunk.choices {
                        if let Some(content) = &choice.delta.content {
                            scan.text.push_str(content);
                        }
                    }
                }
            }
            RelayMode::Completions => {
                if let Some(choices) = value.get("choices").and_then(|c| c.as_array()) {
                    for choice in choices {
                        if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
                            scan.text.push_str(text);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn realtime_url(&self, desc: &RelayDescriptor) -> AdapterResult<String> {
        let base = join_url(desc.base_url.as_deref(), DEFAULT_BASE_URL, "/v1/realtime");
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base
        };
        Ok(format!("{ws_base}?model={}", desc.actual_model))
    }
}

fn completion_text(value: &JsonValue) -> Option<String> {
    let choices = value.get("choices")?.as_array()?;
    let mut out = String::new();
    for choice in choices {
        if let Some(text) = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
        {
            out.push_str(text);
        } else if let Some(text) = choice.get("text").and_then(|t| t.as_str()) {
            out.push_str(text);
        }
    }
    (!out.is_empty()).then_some(out)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn descriptor(mode: RelayMode) -> RelayDescriptor {
        RelayDescriptor {
            api_type: ApiType::OpenAi,
            channel_id: 1,
            channel_name: "main".into(),
            token_id: 1,
            user_id: 1,
            group: "default".into(),
            mode,
            is_stream: false,
            origin_model: "gpt-4o".into(),
            actual_model: "gpt-4o".into(),
            base_url: None,
            api_key: "sk-upstream".into(),
            auto_ban: true,
            api_version: None,
            plugin_id: None,
            library_id: None,
            config: HashMap::new(),
        }
    }

    #[test]
    fn chat_url_and_headers() {
        let adapter = OpenAiAdapter;
        let desc = descriptor(RelayMode::Chat);
        assert_eq!(
            adapter.build_url(&desc).unwrap(),
            "https://api.openai.com/v1/chat/completions"
        );
        let mut headers = Headers::new();
        adapter.set_headers(&desc, &mut headers);
        assert_eq!(
            headers::header_get(&headers, "authorization"),
            Some("Bearer sk-upstream")
        );
    }

    #[test]
    fn azure_layout_switches_url_and_auth() {
        let adapter = OpenAiAdapter;
        let mut desc = descriptor(RelayMode::Chat);
        desc.api_version = Some("2024-06-01".into());
        desc.base_url = Some("https://corp.openai.azure.com".into());
        let url = adapter.build_url(&desc).unwrap();
        assert_eq!(
            url,
            "https://corp.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
        let mut headers = Headers::new();
        adapter.set_headers(&desc, &mut headers);
        assert_eq!(headers::header_get(&headers, "api-key"), Some("sk-upstream"));
        assert_eq!(headers::header_get(&headers, "authorization"), None);
    }

    #[test]
    fn empty_chat_is_nil_request() {
        let adapter = OpenAiAdapter;
        let desc = descriptor(RelayMode::Chat);
        let payload = RelayPayload::Chat(
            serde_json::from_value(serde_json::json!({"model": "gpt-4o", "messages": []})).unwrap(),
        );
        assert!(matches!(
            adapter.convert_request(&desc, &payload),
            Err(AdapterError::NilRequest)
        ));
    }

    #[test]
    fn model_is_remapped_in_body() {
        let adapter = OpenAiAdapter;
        let mut desc = descriptor(RelayMode::Chat);
        desc.actual_model = "gpt-4o-2024-08-06".into();
        let payload = RelayPayload::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": "hi"}]
            }))
            .unwrap(),
        );
        let OutboundBody::Json(body) = adapter.convert_request(&desc, &payload).unwrap() else {
            panic!("expected json body");
        };
        let value: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["model"], "gpt-4o-2024-08-06");
    }

    #[test]
    fn stream_scan_collects_text_and_usage() {
        let adapter = OpenAiAdapter;
        let desc = descriptor(RelayMode::Chat);
        let mut scan = StreamScan::new();
        let chunk = |data: &str| SseEvent {
            event: None,
            data: data.to_string(),
        };
        adapter.scan_stream_event(
            &desc,
            &mut scan,
            &chunk(r#"{"id":"c","object":"chat.completion.chunk","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"hel"}}]}"#),
        );
        adapter.scan_stream_event(
            &desc,
            &mut scan,
            &chunk(r#"{"id":"c","object":"chat.completion.chunk","created":0,"model":"gpt-4o","choices":[{"index":0,"delta":{"content":"lo"}}],"usage":{"prompt_tokens":5,"completion_tokens":2,"total_tokens":7}}"#),
        );
        assert_eq!(scan.text, "hello");
        assert_eq!(scan.usage.map(|u| u.completion_tokens), Some(2));
    }
}
