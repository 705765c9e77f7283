use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::usage::Usage;

/// `POST /v1/embeddings` request body. A path-parameter variant
/// (`/v1/engines/{model}/embeddings`) injects the model before parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: String,
    pub input: EmbeddingsInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingsInput {
    Single(String),
    Many(Vec<String>),
    /// Pre-tokenized input; forwarded as-is.
    Tokens(JsonValue),
}

impl EmbeddingsInput {
    pub fn flat_text(&self) -> String {
        match self {
            EmbeddingsInput::Single(text) => text.clone(),
            EmbeddingsInput::Many(items) => items.join("\n"),
            EmbeddingsInput::Tokens(_) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub object: String,
    pub data: Vec<EmbeddingObject>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingObject {
    pub object: String,
    pub index: i64,
    pub embedding: Vec<f64>,
}
