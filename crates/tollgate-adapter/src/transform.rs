//! Cross-family request/response translation.
//!
//! Translation is structural and lossy-safe: typed fields map one-to-one and
//! unknown extensions stay behind on the source shape rather than being
//! guessed at. Streaming bodies are relayed verbatim in the upstream's own
//! framing, so only buffered shapes are translated here.

use serde_json::{Map, Value as JsonValue, json};

use tollgate_protocol::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
    MessageContent, StopSequences,
};
use tollgate_protocol::claude::{
    ClaudeContent, ClaudeMessage, ClaudeMessagesRequest, ClaudeMessagesResponse, ClaudeUsage,
};
use tollgate_protocol::usage::Usage;

/// Claude-shaped request → OpenAI chat shape (for Claude bodies relayed
/// through an OpenAI-family channel).
pub fn claude_to_chat(req: &ClaudeMessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(req.messages.len() + 1);
    if let Some(system) = &req.system {
        let text = match system {
            JsonValue::String(text) => text.clone(),
            other => ClaudeContent::Blocks(vec![other.clone()]).flat_text(),
        };
        if !text.is_empty() {
            messages.push(ChatMessage {
                role: ChatRole::System,
                content: Some(MessageContent::Text(text)),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            });
        }
    }
    for message in &req.messages {
        let role = match message.role.as_str() {
            "assistant" => ChatRole::Assistant,
            _ => ChatRole::User,
        };
        messages.push(ChatMessage {
            role,
            content: Some(MessageContent::Text(message.content.flat_text())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        });
    }
    ChatCompletionRequest {
        model: req.model.clone(),
        messages,
        max_tokens: Some(req.max_tokens),
        max_completion_tokens: None,
        temperature: req.temperature,
        top_p: req.top_p,
        n: None,
        stream: req.stream,
        stop: req
            .stop_sequences
            .as_ref()
            .map(|stops| StopSequences::Many(stops.clone())),
        tools: None,
        tool_choice: None,
        response_format: None,
        user: None,
        extra: Map::new(),
    }
}

/// OpenAI chat request → Claude messages shape (for chat bodies relayed
/// through an Anthropic-family channel).
pub fn chat_to_claude(req: &ChatCompletionRequest) -> ClaudeMessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in &req.messages {
        let text = message
            .content
            .as_ref()
            .map(MessageContent::flat_text)
            .unwrap_or_default();
        match message.role {
            ChatRole::System | ChatRole::Developer => system_parts.push(text),
            ChatRole::Assistant => messages.push(ClaudeMessage {
                role: "assistant".to_string(),
                content: ClaudeContent::Text(text),
            }),
            _ => messages.push(ClaudeMessage {
                role: "user".to_string(),
                content: ClaudeContent::Text(text),
            }),
        }
    }
    let stop_sequences = req.stop.as_ref().map(|stop| match stop {
        StopSequences::Single(one) => vec![one.clone()],
        StopSequences::Many(many) => many.clone(),
    });
    ClaudeMessagesRequest {
        model: req.model.clone(),
        messages,
        // Anthropic requires max_tokens; fall back to a generous default.
        max_tokens: req.max_tokens.or(req.max_completion_tokens).unwrap_or(4096),
        system: (!system_parts.is_empty()).then(|| JsonValue::String(system_parts.join("\n"))),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences,
        stream: req.stream,
        tools: None,
        extra: Map::new(),
    }
}

/// Claude messages response → OpenAI chat response.
pub fn claude_response_to_chat(
    resp: &ClaudeMessagesResponse,
    created: i64,
) -> ChatCompletionResponse {
    let text = resp
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
    let finish_reason = match resp.stop_reason.as_deref() {
        Some("max_tokens") => Some("length".to_string()),
        Some(_) => Some("stop".to_string()),
        None => None,
    };
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", resp.id),
        object: "chat.completion".to_string(),
        created,
        model: resp.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: Some(MessageContent::Text(text)),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason,
        }],
        usage: Some(Usage::from_anthropic(
            resp.usage.input_tokens,
            resp.usage.output_tokens,
        )),
        extra: Map::new(),
    }
}

/// OpenAI chat response → Claude messages response.
pub fn chat_response_to_claude(resp: &ChatCompletionResponse) -> ClaudeMessagesResponse {
    let (text, finish_reason) = resp
        .choices
        .first()
        .map(|choice| {
            (
                choice
                    .message
                    .content
                    .as_ref()
                    .map(MessageContent::flat_text)
                    .unwrap_or_default(),
                choice.finish_reason.clone(),
            )
        })
        .unwrap_or_default();
    let stop_reason = match finish_reason.as_deref() {
        Some("length") => Some("max_tokens".to_string()),
        Some(_) => Some("end_turn".to_string()),
        None => None,
    };
    let usage = resp.usage.unwrap_or_default();
    ClaudeMessagesResponse {
        id: format!("msg_{}", resp.id.trim_start_matches("chatcmpl-")),
        kind: "message".to_string(),
        role: "assistant".to_string(),
        model: resp.model.clone(),
        content: vec![json!({"type": "text", "text": text})],
        stop_reason,
        usage: ClaudeUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request() -> ChatCompletionRequest {
        serde_json::from_value(json!({
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ],
            "max_tokens": 128,
            "stop": ["END"]
        }))
        .unwrap()
    }

    #[test]
    fn chat_to_claude_extracts_system_and_roles() {
        let out = chat_to_claude(&chat_request());
        assert_eq!(out.system, Some(JsonValue::String("be terse".into())));
        assert_eq!(out.messages.len(), 3);
        assert_eq!(out.messages[1].role, "assistant");
        assert_eq!(out.max_tokens, 128);
        assert_eq!(out.stop_sequences, Some(vec!["END".to_string()]));
    }

    #[test]
    fn claude_to_chat_round_trips_system() {
        let claude = chat_to_claude(&chat_request());
        let back = claude_to_chat(&claude);
        assert_eq!(back.messages[0].role, ChatRole::System);
        assert_eq!(back.messages.len(), 4);
        assert_eq!(back.max_tokens, Some(128));
    }

    #[test]
    fn claude_response_maps_stop_reason_and_usage() {
        let resp = ClaudeMessagesResponse {
            id: "abc".into(),
            kind: "message".into(),
            role: "assistant".into(),
            model: "claude-3-5-sonnet".into(),
            content: vec![json!({"type": "text", "text": "out"})],
            stop_reason: Some("max_tokens".into()),
            usage: ClaudeUsage {
                input_tokens: 10,
                output_tokens: 20,
            },
        };
        let chat = claude_response_to_chat(&resp, 0);
        assert_eq!(chat.choices[0].finish_reason.as_deref(), Some("length"));
        let usage = chat.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.total_tokens, 30);
    }
}
