use bytes::Bytes;

use tollgate_protocol::Usage;

use crate::headers::Headers;

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pull canonical usage out of a JSON body, accepting both the OpenAI
/// (`prompt_tokens`/`completion_tokens`) and Anthropic
/// (`input_tokens`/`output_tokens`) spellings.
pub fn usage_from_json(value: &serde_json::Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    let prompt = usage
        .get("prompt_tokens")
        .or_else(|| usage.get("input_tokens"))
        .and_then(|v| v.as_i64());
    let completion = usage
        .get("completion_tokens")
        .or_else(|| usage.get("output_tokens"))
        .and_then(|v| v.as_i64());
    if prompt.is_none() && completion.is_none() {
        return None;
    }
    Some(Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0)))
}

/// A buffered upstream response after adapter-side translation.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    /// Body relayed to the client, already in the client's protocol shape.
    pub body: Bytes,
    /// Usage reported by the upstream; `None` for modes whose upstream
    /// reports no token accounting (images, speech) — those settle at the
    /// pre-dispatch estimate.
    pub usage: Option<Usage>,
    /// Completion text, when the mode has one; used for completion-token
    /// estimation when the upstream omits usage.
    pub text: Option<String>,
}
