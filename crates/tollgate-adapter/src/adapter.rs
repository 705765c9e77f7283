use async_trait::async_trait;

use tollgate_protocol::Usage;
use tollgate_protocol::sse::SseEvent;

use crate::api_type::ApiType;
use crate::client::UpstreamClient;
use crate::descriptor::RelayDescriptor;
use crate::error::{AdapterError, AdapterResult, UpstreamFailure};
use crate::headers::Headers;
use crate::request::{OutboundBody, OutboundRequest, RelayPayload};
use crate::response::{ParsedResponse, UpstreamResponse};

/// Rolling state while relaying a streamed response: adapters feed usage and
/// completion text out of their own event shapes as chunks pass through.
#[derive(Debug, Default)]
pub struct StreamScan {
    pub usage: Option<Usage>,
    pub text: String,
    pub upstream_error: Option<String>,
}

impl StreamScan {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One implementation per upstream protocol family.
///
/// Build steps are deterministic, pure functions of the descriptor and
/// payload; `execute` composes them with the shared client so call sites
/// never branch on channel type.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn api_type(&self) -> ApiType;

    /// Deterministic, mode-sensitive upstream URL.
    fn build_url(&self, desc: &RelayDescriptor) -> AdapterResult<String>;

    /// Auth and protocol headers. Must never carry the inbound client's own
    /// credential.
    fn set_headers(&self, desc: &RelayDescriptor, headers: &mut Headers);

    /// Structural translation of the canonical request into the provider's
    /// wire shape. Fails with [`AdapterError::NilRequest`] on empty input and
    /// must not drop fields the provider needs.
    fn convert_request(
        &self,
        desc: &RelayDescriptor,
        payload: &RelayPayload,
    ) -> AdapterResult<OutboundBody>;

    /// Parse a buffered 2xx body back into the client's protocol shape plus
    /// canonical usage.
    fn parse_response(
        &self,
        desc: &RelayDescriptor,
        body: &bytes::Bytes,
    ) -> AdapterResult<ParsedResponse>;

    /// Fold one relayed stream event into the running scan.
    fn scan_stream_event(&self, desc: &RelayDescriptor, scan: &mut StreamScan, event: &SseEvent);

    /// WebSocket URL for the realtime mode; most families do not serve it.
    fn realtime_url(&self, _desc: &RelayDescriptor) -> AdapterResult<String> {
        Err(AdapterError::Unsupported("realtime"))
    }

    /// Build and perform the transport call through the shared client.
    async fn execute(
        &self,
        client: &dyn UpstreamClient,
        desc: &RelayDescriptor,
        payload: &RelayPayload,
    ) -> Result<UpstreamResponse, ExecuteError> {
        let url = self.build_url(desc).map_err(ExecuteError::Build)?;
        let body = self
            .convert_request(desc, payload)
            .map_err(ExecuteError::Build)?;
        let mut headers = Headers::new();
        self.set_headers(desc, &mut headers);
        let request = OutboundRequest {
            url,
            headers,
            body,
            is_stream: desc.is_stream,
        };
        client.send(request).await.map_err(ExecuteError::Transport)
    }
}

#[derive(Debug)]
pub enum ExecuteError {
    Build(AdapterError),
    Transport(UpstreamFailure),
}

impl std::fmt::Display for ExecuteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteError::Build(err) => write!(f, "{err}"),
            ExecuteError::Transport(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ExecuteError {}

/// Shared URL joiner: trims trailing slashes and collapses a doubled `/v1`
/// when the configured base already ends with one.
pub(crate) fn join_url(base: Option<&str>, default_base: &str, path: &str) -> String {
    let base = base.unwrap_or(default_base).trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") && (path == "v1" || path.starts_with("v1/")) {
        path = path.trim_start_matches("v1/").trim_start_matches("v1");
    }
    format!("{base}/{path}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_deduplicates_v1() {
        assert_eq!(
            join_url(Some("https://api.example.com/v1"), "https://d", "/v1/chat/completions"),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url(None, "https://api.openai.com", "/v1/embeddings"),
            "https://api.openai.com/v1/embeddings"
        );
    }
}
