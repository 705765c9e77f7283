use serde::{Deserialize, Serialize};

/// Upstream protocol family. Derived once from the channel's type tag; all
/// adapter dispatch keys off this constant rather than string comparisons at
/// call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiType {
    OpenAi,
    Claude,
    Gemini,
}

impl ApiType {
    /// Resolve a stored channel type tag. Unknown tags are a configuration
    /// fault surfaced at selection time, not a panic.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "openai" | "azure" | "custom" => Some(ApiType::OpenAi),
            "claude" | "anthropic" => Some(ApiType::Claude),
            "gemini" | "google" => Some(ApiType::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::OpenAi => "openai",
            ApiType::Claude => "claude",
            ApiType::Gemini => "gemini",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_aliases_resolve() {
        assert_eq!(ApiType::from_tag("azure"), Some(ApiType::OpenAi));
        assert_eq!(ApiType::from_tag("Anthropic"), Some(ApiType::Claude));
        assert_eq!(ApiType::from_tag("google"), Some(ApiType::Gemini));
        assert_eq!(ApiType::from_tag("mystery"), None);
    }
}
