use serde::{Deserialize, Serialize};

/// Canonical usage currency for cost computation, regardless of the
/// upstream's native accounting unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt_tokens: i64, completion_tokens: i64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }

    /// Anthropic reports `input_tokens`/`output_tokens`; fold into the
    /// canonical shape.
    pub fn from_anthropic(input_tokens: i64, output_tokens: i64) -> Self {
        Self::new(input_tokens, output_tokens)
    }
}
