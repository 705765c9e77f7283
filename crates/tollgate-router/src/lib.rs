//! Inbound HTTP surface: the versioned OpenAI-compatible endpoints, mapped
//! onto the relay engine. Handlers parse the canonical body, run the relay
//! inside the fault boundary, and translate errors into the structured
//! envelope with a request-correlating id.

mod realtime;

use std::convert::Infallible;

use axum::Router;
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use uuid::Uuid;

use tollgate_adapter::RelayPayload;
use tollgate_common::RelayError;
use tollgate_core::engine::{RelayEngine, RelayResponse};
use tollgate_core::recover::run_protected;
use tollgate_protocol::audio::{SpeechRequest, TranscriptionFields};
use tollgate_protocol::chat::{ChatCompletionRequest, CompletionRequest, ResponsesRequest};
use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::embeddings::EmbeddingsRequest;
use tollgate_protocol::envelope::ErrorEnvelope;
use tollgate_protocol::images::ImageRequest;
use tollgate_protocol::moderation::ModerationRequest;
use tollgate_protocol::RelayMode;

pub const REQUEST_ID_HEADER: &str = "x-tollgate-request-id";
const REQUEST_EXCERPT_LIMIT: usize = 2048;

#[derive(Clone)]
pub struct RouterState {
    pub engine: RelayEngine,
}

pub fn relay_router(engine: RelayEngine) -> Router {
    let state = RouterState { engine };
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/completions", post(completions))
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/engines/{model}/embeddings", post(embeddings_by_path))
        .route("/v1/moderations", post(moderations))
        .route("/v1/images/generations", post(images_generations))
        .route("/v1/images/edits", post(images_edits))
        .route("/v1/audio/speech", post(audio_speech))
        .route("/v1/audio/transcriptions", post(audio_transcriptions))
        .route("/v1/audio/translations", post(audio_translations))
        .route("/v1/messages", post(claude_messages))
        .route("/v1/responses", post(responses))
        .route("/v1/realtime", get(realtime::realtime_upgrade))
        .route("/v1/models", get(models_list))
        .with_state(state)
}

/// `Authorization` wins; `x-api-key` is the alternate header some
/// sub-protocols send.
pub(crate) fn auth_header(headers: &HeaderMap) -> Option<String> {
    let primary = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if let Some(primary) = primary {
        return Some(primary.to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(|key| format!("Bearer {key}"))
}

async fn chat_completions(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<ChatCompletionRequest>(state, headers, body, RelayMode::Chat, RelayPayload::Chat)
        .await
}

async fn completions(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<CompletionRequest>(
        state,
        headers,
        body,
        RelayMode::Completions,
        RelayPayload::Completions,
    )
    .await
}

async fn embeddings(State(state): State<RouterState>, headers: HeaderMap, body: Bytes) -> Response {
    relay_json::<EmbeddingsRequest>(
        state,
        headers,
        body,
        RelayMode::Embeddings,
        RelayPayload::Embeddings,
    )
    .await
}

async fn embeddings_by_path(
    State(state): State<RouterState>,
    Path(model): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let trace_id = new_trace_id();
    let mut request: EmbeddingsRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return error_response(
                &trace_id,
                RelayError::MalformedRequestBody(err.to_string()),
            );
        }
    };
    // The path parameter is authoritative for this variant.
    request.model = model;
    run_relay(
        state,
        headers,
        RelayMode::Embeddings,
        RelayPayload::Embeddings(request),
        trace_id,
        body,
    )
    .await
}

async fn moderations(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<ModerationRequest>(
        state,
        headers,
        body,
        RelayMode::Moderation,
        RelayPayload::Moderation,
    )
    .await
}

async fn images_generations(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<ImageRequest>(
        state,
        headers,
        body,
        RelayMode::ImagesGenerations,
        RelayPayload::ImagesGenerations,
    )
    .await
}

async fn images_edits(
    State(state): State<RouterState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let trace_id = new_trace_id();
    let form = match read_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => return error_response(&trace_id, err),
    };
    let (image_name, image) = match form.file {
        Some(file) => file,
        None => {
            return error_response(
                &trace_id,
                RelayError::MalformedRequestBody("missing image attachment".to_string()),
            );
        }
    };
    let request = ImageRequest {
        model: form.text.get("model").cloned().unwrap_or_default(),
        prompt: form.text.get("prompt").cloned().unwrap_or_default(),
        n: form.text.get("n").and_then(|n| n.parse().ok()),
        size: form.text.get("size").cloned(),
        quality: None,
        response_format: form.text.get("response_format").cloned(),
        user: None,
        extra: serde_json::Map::new(),
    };
    run_relay(
        state,
        headers,
        RelayMode::ImagesEdits,
        RelayPayload::ImagesEdits {
            request,
            image_name,
            image,
        },
        trace_id,
        Bytes::new(),
    )
    .await
}

async fn audio_speech(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<SpeechRequest>(
        state,
        headers,
        body,
        RelayMode::AudioSpeech,
        RelayPayload::AudioSpeech,
    )
    .await
}

async fn audio_transcriptions(
    State(state): State<RouterState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    relay_audio(state, headers, multipart, RelayMode::AudioTranscription).await
}

async fn audio_translations(
    State(state): State<RouterState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    relay_audio(state, headers, multipart, RelayMode::AudioTranslation).await
}

async fn claude_messages(
    State(state): State<RouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    relay_json::<ClaudeMessagesRequest>(
        state,
        headers,
        body,
        RelayMode::ClaudeMessages,
        RelayPayload::ClaudeMessages,
    )
    .await
}

async fn responses(State(state): State<RouterState>, headers: HeaderMap, body: Bytes) -> Response {
    relay_json::<ResponsesRequest>(
        state,
        headers,
        body,
        RelayMode::Responses,
        RelayPayload::Responses,
    )
    .await
}

async fn models_list(State(state): State<RouterState>, headers: HeaderMap) -> Response {
    let trace_id = new_trace_id();
    let auth = auth_header(&headers);
    match state.engine.list_models(auth.as_deref()).await {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            attach_request_id(&mut response, &trace_id);
            response
        }
        Err(err) => error_response(&trace_id, err),
    }
}

async fn relay_audio(
    state: RouterState,
    headers: HeaderMap,
    multipart: Multipart,
    mode: RelayMode,
) -> Response {
    let trace_id = new_trace_id();
    let form = match read_multipart(multipart).await {
        Ok(form) => form,
        Err(err) => return error_response(&trace_id, err),
    };
    let (file_name, file) = match form.file {
        Some(file) => file,
        None => {
            return error_response(
                &trace_id,
                RelayError::MalformedRequestBody("missing file attachment".to_string()),
            );
        }
    };
    let fields = TranscriptionFields {
        model: form.text.get("model").cloned().unwrap_or_default(),
        language: form.text.get("language").cloned(),
        prompt: form.text.get("prompt").cloned(),
        response_format: form.text.get("response_format").cloned(),
        temperature: form.text.get("temperature").and_then(|t| t.parse().ok()),
    };
    let payload = match mode {
        RelayMode::AudioTranslation => RelayPayload::AudioTranslation {
            fields,
            file_name,
            file,
        },
        _ => RelayPayload::AudioTranscription {
            fields,
            file_name,
            file,
        },
    };
    run_relay(state, headers, mode, payload, trace_id, Bytes::new()).await
}

async fn relay_json<T>(
    state: RouterState,
    headers: HeaderMap,
    body: Bytes,
    mode: RelayMode,
    wrap: impl FnOnce(T) -> RelayPayload,
) -> Response
where
    T: serde::de::DeserializeOwned,
{
    let trace_id = new_trace_id();
    let parsed: T = match serde_json::from_slice(&body) {
        Ok(parsed) => parsed,
        Err(err) => {
            return error_response(
                &trace_id,
                RelayError::MalformedRequestBody(err.to_string()),
            );
        }
    };
    run_relay(state, headers, mode, wrap(parsed), trace_id, body).await
}

async fn run_relay(
    state: RouterState,
    headers: HeaderMap,
    mode: RelayMode,
    payload: RelayPayload,
    trace_id: String,
    raw_body: Bytes,
) -> Response {
    let auth = auth_header(&headers);
    let excerpt = excerpt_of(&raw_body);
    info!(event = "downstream_received", trace_id = %trace_id, mode = %mode.as_str());
    let result = run_protected(
        state.engine.relay(auth.as_deref(), mode, payload, &trace_id),
        &trace_id,
        &excerpt,
    )
    .await;
    match result {
        Ok(relay) => relay_response(relay, &trace_id),
        Err(err) => error_response(&trace_id, err),
    }
}

fn relay_response(relay: RelayResponse, trace_id: &str) -> Response {
    match relay {
        RelayResponse::Buffered {
            status,
            content_type,
            body,
        } => {
            let mut response = Response::new(Body::from(body));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            set_content_type(&mut response, &content_type);
            attach_request_id(&mut response, trace_id);
            response
        }
        RelayResponse::Stream {
            status,
            content_type,
            body,
        } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, Infallible>);
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
            set_content_type(&mut response, &content_type);
            attach_request_id(&mut response, trace_id);
            response
        }
    }
}

pub(crate) fn error_response(trace_id: &str, err: RelayError) -> Response {
    let message = if err.is_sensitive() {
        "internal error, contact the operator with the request id".to_string()
    } else {
        err.to_string()
    };
    let envelope = ErrorEnvelope::new(
        format!("{trace_id}: {message}"),
        "tollgate_error",
        err.code(),
    );
    let mut response = (err.status(), axum::Json(envelope)).into_response();
    attach_request_id(&mut response, trace_id);
    response
}

pub(crate) fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

fn attach_request_id(response: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

fn set_content_type(response: &mut Response, content_type: &str) {
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
}

fn excerpt_of(body: &Bytes) -> String {
    String::from_utf8_lossy(body)
        .chars()
        .take(REQUEST_EXCERPT_LIMIT)
        .collect()
}

#[derive(Default)]
struct ParsedMultipart {
    text: std::collections::HashMap<String, String>,
    file: Option<(String, Bytes)>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RealtimeQuery {
    pub model: Option<String>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<ParsedMultipart, RelayError> {
    let mut out = ParsedMultipart::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| RelayError::MalformedRequestBody(err.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if field.file_name().is_some() {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|err| RelayError::MalformedRequestBody(err.to_string()))?;
            out.file = Some((file_name, data));
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| RelayError::MalformedRequestBody(err.to_string()))?;
            out.text.insert(name, value);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_header_prefers_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("alt"));
        assert_eq!(auth_header(&headers).as_deref(), Some("Bearer alt"));
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer sk-primary"),
        );
        assert_eq!(auth_header(&headers).as_deref(), Some("Bearer sk-primary"));
    }

    #[test]
    fn sensitive_errors_are_masked() {
        let response = error_response("trace-1", RelayError::QuotaStoreFailure("dsn leak".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
