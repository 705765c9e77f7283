use bytes::Bytes;

use tollgate_protocol::audio::{SpeechRequest, TranscriptionFields};
use tollgate_protocol::chat::{ChatCompletionRequest, CompletionRequest, ResponsesRequest};
use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::embeddings::EmbeddingsRequest;
use tollgate_protocol::images::ImageRequest;
use tollgate_protocol::moderation::ModerationRequest;

/// The canonical inbound request, parsed at the router and handed to the
/// engine. One variant per relay mode that carries a body.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    Chat(ChatCompletionRequest),
    Completions(CompletionRequest),
    Embeddings(EmbeddingsRequest),
    Moderation(ModerationRequest),
    ImagesGenerations(ImageRequest),
    ImagesEdits {
        request: ImageRequest,
        image_name: String,
        image: Bytes,
    },
    AudioSpeech(SpeechRequest),
    AudioTranscription {
        fields: TranscriptionFields,
        file_name: String,
        file: Bytes,
    },
    AudioTranslation {
        fields: TranscriptionFields,
        file_name: String,
        file: Bytes,
    },
    ClaudeMessages(ClaudeMessagesRequest),
    Responses(ResponsesRequest),
}

impl RelayPayload {
    pub fn model(&self) -> &str {
        match self {
            RelayPayload::Chat(req) => &req.model,
            RelayPayload::Completions(req) => &req.model,
            RelayPayload::Embeddings(req) => &req.model,
            RelayPayload::Moderation(req) => &req.model,
            RelayPayload::ImagesGenerations(req) => &req.model,
            RelayPayload::ImagesEdits { request, .. } => &request.model,
            RelayPayload::AudioSpeech(req) => &req.model,
            RelayPayload::AudioTranscription { fields, .. } => &fields.model,
            RelayPayload::AudioTranslation { fields, .. } => &fields.model,
            RelayPayload::ClaudeMessages(req) => &req.model,
            RelayPayload::Responses(req) => &req.model,
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            RelayPayload::Chat(req) => req.is_stream(),
            RelayPayload::Completions(req) => req.stream.unwrap_or(false),
            RelayPayload::ClaudeMessages(req) => req.is_stream(),
            RelayPayload::Responses(req) => req.stream.unwrap_or(false),
            _ => false,
        }
    }
}

/// Fully built outbound request handed to the shared client.
#[derive(Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: crate::headers::Headers,
    pub body: OutboundBody,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum OutboundBody {
    Empty,
    Json(Bytes),
    Multipart(MultipartForm),
}

#[derive(Debug, Default)]
pub struct MultipartForm {
    pub fields: Vec<MultipartField>,
}

#[derive(Debug)]
pub enum MultipartField {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        data: Bytes,
    },
}

impl MultipartForm {
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(MultipartField::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        data: Bytes,
    ) -> Self {
        self.fields.push(MultipartField::File {
            name: name.into(),
            file_name: file_name.into(),
            data,
        });
        self
    }
}
