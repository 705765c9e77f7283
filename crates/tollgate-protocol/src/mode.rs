use serde::{Deserialize, Serialize};

/// The canonical request kind driving validation, default-model resolution,
/// and cost-estimation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    Chat,
    Completions,
    Embeddings,
    Moderation,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    ClaudeMessages,
    Responses,
    Realtime,
    ModelsList,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::Chat => "chat",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::Moderation => "moderation",
            RelayMode::ImagesGenerations => "images.generations",
            RelayMode::ImagesEdits => "images.edits",
            RelayMode::AudioSpeech => "audio.speech",
            RelayMode::AudioTranscription => "audio.transcription",
            RelayMode::AudioTranslation => "audio.translation",
            RelayMode::ClaudeMessages => "claude.messages",
            RelayMode::Responses => "responses",
            RelayMode::Realtime => "realtime",
            RelayMode::ModelsList => "models.list",
        }
    }

    /// Default model applied when the body omits one. Defaults must be
    /// applied before token resolution so model-restricted tokens are
    /// checked against the effective model.
    pub fn default_model(&self) -> Option<&'static str> {
        match self {
            RelayMode::Moderation => Some("omni-moderation-latest"),
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits => Some("dall-e-3"),
            RelayMode::AudioSpeech => Some("tts-1"),
            RelayMode::AudioTranscription | RelayMode::AudioTranslation => Some("whisper-1"),
            _ => None,
        }
    }

    /// Read-only listing surfaces never consume quota.
    pub fn meters_quota(&self) -> bool {
        !matches!(self, RelayMode::ModelsList)
    }
}
