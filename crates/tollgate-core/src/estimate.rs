use tiktoken_rs::{get_bpe_from_model, o200k_base};

use tollgate_adapter::RelayPayload;
use tollgate_protocol::chat::MessageContent;

/// Per-message protocol overhead in the chat token count.
const MESSAGE_OVERHEAD_TOKENS: i64 = 3;
/// Flat per-image token equivalent; per-image pricing rides on model ratio.
const IMAGE_TOKEN_UNITS: i64 = 1000;
/// Transcription is priced by audio duration; approximate seconds from the
/// upload size until the upstream reports a real duration.
const AUDIO_BYTES_PER_SECOND: i64 = 32_000;
/// Token equivalent of one second of audio.
const AUDIO_TOKENS_PER_SECOND: i64 = 17;

/// Count tokens for `text` with the model's own encoding, falling back to
/// the o200k base encoding for unknown models.
pub fn count_text_tokens(model: &str, text: &str) -> Result<i64, String> {
    let bpe = get_bpe_from_model(model)
        .or_else(|_| o200k_base())
        .map_err(|err| err.to_string())?;
    Ok(bpe.encode_ordinary(text).len() as i64)
}

/// Pure prompt-side cost estimate for a payload, in canonical tokens.
///
/// Errors mean "estimation unavailable", not "reject": the caller applies
/// the configured floor and proceeds.
pub fn estimate_prompt_tokens(payload: &RelayPayload) -> Result<i64, String> {
    match payload {
        RelayPayload::Chat(req) => {
            let mut total = MESSAGE_OVERHEAD_TOKENS;
            for message in &req.messages {
                let text = message
                    .content
                    .as_ref()
                    .map(MessageContent::flat_text)
                    .unwrap_or_default();
                total += count_text_tokens(&req.model, &text)? + MESSAGE_OVERHEAD_TOKENS;
            }
            Ok(total)
        }
        RelayPayload::Completions(req) => count_text_tokens(&req.model, &req.prompt.flat_text()),
        RelayPayload::Embeddings(req) => count_text_tokens(&req.model, &req.input.flat_text()),
        RelayPayload::Moderation(req) => count_text_tokens(&req.model, &req.input.flat_text()),
        RelayPayload::ImagesGenerations(req) => Ok(req.image_count() * IMAGE_TOKEN_UNITS),
        RelayPayload::ImagesEdits { request, .. } => {
            Ok(request.image_count() * IMAGE_TOKEN_UNITS)
        }
        // Speech is priced per input character.
        RelayPayload::AudioSpeech(req) => Ok(req.input.chars().count() as i64),
        RelayPayload::AudioTranscription { file, .. }
        | RelayPayload::AudioTranslation { file, .. } => {
            let seconds = (file.len() as i64 / AUDIO_BYTES_PER_SECOND).max(1);
            Ok(seconds * AUDIO_TOKENS_PER_SECOND)
        }
        RelayPayload::ClaudeMessages(req) => {
            let mut total = MESSAGE_OVERHEAD_TOKENS;
            for message in &req.messages {
                total += count_text_tokens(&req.model, &message.content.flat_text())?
                    + MESSAGE_OVERHEAD_TOKENS;
            }
            Ok(total)
        }
        RelayPayload::Responses(req) => {
            let text = req
                .input
                .as_ref()
                .map(|input| match input {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_default();
            count_text_tokens(&req.model, &text)
        }
    }
}

/// Completion-side bound included in the reservation: the client's declared
/// maximum output, zero when unbounded.
pub fn max_completion_tokens(payload: &RelayPayload) -> i64 {
    match payload {
        RelayPayload::Chat(req) => req.max_tokens.or(req.max_completion_tokens).unwrap_or(0),
        RelayPayload::Completions(req) => req.max_tokens.unwrap_or(0),
        RelayPayload::ClaudeMessages(req) => req.max_tokens,
        RelayPayload::Responses(req) => req.max_output_tokens.unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_payload(text: &str, max_tokens: Option<i64>) -> RelayPayload {
        RelayPayload::Chat(
            serde_json::from_value(serde_json::json!({
                "model": "gpt-4o",
                "messages": [{"role": "user", "content": text}],
                "max_tokens": max_tokens,
            }))
            .unwrap(),
        )
    }

    #[test]
    fn chat_estimate_counts_overhead() {
        let estimate = estimate_prompt_tokens(&chat_payload("hello there", None)).unwrap();
        // 2 content tokens + per-message and per-request overhead.
        assert!(estimate >= 2 + 2 * MESSAGE_OVERHEAD_TOKENS);
        assert!(estimate < 20);
    }

    #[test]
    fn max_completion_prefers_declared_bound() {
        assert_eq!(max_completion_tokens(&chat_payload("x", Some(128))), 128);
        assert_eq!(max_completion_tokens(&chat_payload("x", None)), 0);
    }

    #[test]
    fn image_estimate_scales_with_count() {
        let payload = RelayPayload::ImagesGenerations(
            serde_json::from_value(serde_json::json!({
                "model": "dall-e-3",
                "prompt": "a lighthouse",
                "n": 3
            }))
            .unwrap(),
        );
        assert_eq!(estimate_prompt_tokens(&payload).unwrap(), 3 * IMAGE_TOKEN_UNITS);
    }

    #[test]
    fn speech_estimate_is_per_character() {
        let payload = RelayPayload::AudioSpeech(
            serde_json::from_value(serde_json::json!({
                "model": "tts-1",
                "input": "twelve chars",
                "voice": "alloy"
            }))
            .unwrap(),
        );
        assert_eq!(estimate_prompt_tokens(&payload).unwrap(), 12);
    }
}
