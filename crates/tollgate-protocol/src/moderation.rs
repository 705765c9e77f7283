use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// `POST /v1/moderations` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRequest {
    #[serde(default)]
    pub model: String,
    pub input: ModerationInput,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModerationInput {
    Single(String),
    Many(Vec<String>),
}

impl ModerationInput {
    pub fn flat_text(&self) -> String {
        match self {
            ModerationInput::Single(text) => text.clone(),
            ModerationInput::Many(items) => items.join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResponse {
    pub id: String,
    pub model: String,
    pub results: Vec<JsonValue>,
}
