use bytes::Bytes;
use serde_json::Value as JsonValue;

use tollgate_protocol::RelayMode;
use tollgate_protocol::claude::ClaudeMessagesResponse;
use tollgate_protocol::sse::SseEvent;
use tollgate_protocol::usage::Usage;

use crate::adapter::{Adapter, StreamScan, join_url};
use crate::api_type::ApiType;
use crate::descriptor::RelayDescriptor;
use crate::error::{AdapterError, AdapterResult};
use crate::headers::{self, Headers};
use crate::request::{OutboundBody, RelayPayload};
use crate::response::ParsedResponse;
use crate::transform;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic-shaped upstream. Serves native `/v1/messages` traffic and
/// translated OpenAI chat traffic; other modes are not in this family.
#[derive(Debug, Default)]
pub struct ClaudeAdapter;

#[async_trait::async_trait]
impl Adapter for ClaudeAdapter {
    fn api_type(&self) -> ApiType {
        ApiType::Claude
    }

    fn build_url(&self, desc: &RelayDescriptor) -> AdapterResult<String> {
        match desc.mode {
            RelayMode::Chat | RelayMode::ClaudeMessages => Ok(join_url(
                desc.base_url.as_deref(),
                DEFAULT_BASE_URL,
                "/v1/messages",
            )),
            _ => Err(AdapterError::Unsupported("mode not served by claude family")),
        }
    }

    fn set_headers(&self, desc: &RelayDescriptor, headers: &mut Headers) {
        headers::header_set(headers, "x-api-key", desc.api_key.clone());
        headers::header_set(
            headers,
            "anthropic-version",
            desc.api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        );
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
        let request = match payload {
            RelayPayload::ClaudeMessages(req) => {
                if req.messages.is_empty() {
                    return Err(AdapterError::NilRequest);
                }
                let mut req = req.clone();
                req.model = desc.actual_model.clone();
                req
            }
            RelayPayload::Chat(req) => {
                if req.messages.is_empty() {
                    return Err(AdapterError::NilRequest);
                }
                let mut converted = transform::chat_to_claude(req);
                converted.model = desc.actual_model.clone();
                converted
            }
            _ => return Err(AdapterError::Unsupported("mode not served by claude family")),
        };
        let body = serde_json::to_vec(&request)
            .map_err(|err| AdapterError::Serialize(err.to_string()))?;
        Ok(OutboundBody::Json(Bytes::from(body)))
    }

    fn parse_response(
        &self,
        desc: &RelayDescriptor,
        body: &Bytes,
    ) -> AdapterResult<ParsedResponse> {
        let message: ClaudeMessagesResponse = serde_json::from_slice(body)
            .map_err(|err| AdapterError::Serialize(err.to_string()))?;
        let usage = Usage::from_anthropic(message.usage.input_tokens, message.usage.output_tokens);
        match desc.mode {
            RelayMode::ClaudeMessages => Ok(ParsedResponse {
                body: body.clone(),
                usage: Some(usage),
                text: text_of(&message),
            }),
            RelayMode::Chat => {
                // The client speaks OpenAI chat; translate back.
                let chat = transform::claude_response_to_chat(&message, 0);
                let translated = serde_json::to_vec(&chat)
                    .map_err(|err| AdapterError::Serialize(err.to_string()))?;
                Ok(ParsedResponse {
                    body: Bytes::from(translated),
                    usage: Some(usage),
                    text: text_of(&message),
                })
            }
            _ => Err(AdapterError::Unsupported("mode not served by claude family")),
        }
    }

    fn scan_stream_event(&self, _desc: &RelayDescriptor, scan: &mut StreamScan, event: &SseEvent) {
        let Ok(value) = serde_json::from_str::<JsonValue>(&event.data) else {
            return;
        };
        match event.event.as_deref() {
            Some("message_start") => {
                if let Some(usage) = value.get("message").and_then(|m| m.get("usage")) {
                    let input = usage.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
                    let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
                    scan.usage = Some(Usage::from_anthropic(input, output));
                }
            }
            Some("message_delta") => {
                // Carries the final output_tokens count; input arrived on start.
                if let Some(usage) = value.get("usage") {
                    let output = usage.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0);
                    let input = scan.usage.map(|u| u.prompt_tokens).unwrap_or(0);
                    scan.usage = Some(Usage::from_anthropic(input, output));
                }
            }
            Some("content_block_delta") => {
                if let Some(text) = value
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(|t| t.as_str())
                {
                    scan.text.push_str(text);
                }
            }
            Some("error") => {
                if let Some(message) = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(|m| m.as_str())
                {
                    scan.upstream_error = Some(message.to_string());
                }
            }
            _ => {}
        }
    }
}

fn text_of(message: &ClaudeMessagesResponse) -> Option<String> {
    let text = message
        .content
        .iter()
        .filter_map(|block| {
            if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                block.get("text").and_then(|t| t.as_str()).map(str::to_string)
            } else {
                None
            }
        })
        .collect::<Vec<_>>()
        .join("");
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn descriptor(mode: RelayMode) -> RelayDescriptor {
        RelayDescriptor {
            api_type: ApiType::Claude,
            channel_id: 2,
            channel_name: "anthropic".into(),
            token_id: 1,
            user_id: 1,
            group: "default".into(),
            mode,
            is_stream: false,
            origin_model: "claude-3-5-sonnet".into(),
            actual_model: "claude-3-5-sonnet-20241022".into(),
            base_url: None,
            api_key: "sk-ant".into(),
            auto_ban: true,
            api_version: None,
            plugin_id: None,
            library_id: None,
            config: HashMap::new(),
        }
    }

    #[test]
    fn headers_carry_api_key_and_version() {
        let adapter = ClaudeAdapter;
        let mut headers = Headers::new();
        adapter.set_headers(&descriptor(RelayMode::ClaudeMessages), &mut headers);
        assert_eq!(headers::header_get(&headers, "x-api-key"), Some("sk-ant"));
        assert_eq!(
            headers::header_get(&headers, "anthropic-version"),
            Some("2023-06-01")
        );
        assert_eq!(headers::header_get(&headers, "authorization"), None);
    }

    #[test]
    fn chat_mode_translates_request() {
        let adapter = ClaudeAdapter;
        let desc = descriptor(RelayMode::Chat);
        let payload = RelayPayload::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "claude-3-5-sonnet",
                "messages": [
                    {"role": "system", "content": "be brief"},
                    {"role": "user", "content": "hi"}
                ]
            }))
            .unwrap(),
        );
        let OutboundBody::Json(body) = adapter.convert_request(&desc, &payload).unwrap() else {
            panic!("expected json body");
        };
        let value: JsonValue = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(value["system"], "be brief");
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn stream_scan_merges_start_and_delta_usage() {
        let adapter = ClaudeAdapter;
        let desc = descriptor(RelayMode::ClaudeMessages);
        let mut scan = StreamScan::new();
        adapter.scan_stream_event(
            &desc,
            &mut scan,
            &SseEvent {
                event: Some("message_start".into()),
                data: r#"{"message":{"usage":{"input_tokens":30,"output_tokens":1}}}"#.into(),
            },
        );
        adapter.scan_stream_event(
            &desc,
            &mut scan,
            &SseEvent {
                event: Some("message_delta".into()),
                data: r#"{"usage":{"output_tokens":25}}"#.into(),
            },
        );
        let usage = scan.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 30);
        assert_eq!(usage.completion_tokens, 25);
    }
}
