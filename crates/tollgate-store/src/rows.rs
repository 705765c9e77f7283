use serde::{Deserialize, Serialize};

/// Permission level attached to an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
    Root,
}

impl Role {
    pub fn from_i16(value: i16) -> Self {
        match value {
            value if value >= 100 => Role::Root,
            value if value >= 10 => Role::Admin,
            _ => Role::User,
        }
    }

    pub fn as_i16(&self) -> i16 {
        match self {
            Role::User => 1,
            Role::Admin => 10,
            Role::Root => 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRow {
    pub id: i64,
    pub username: String,
    pub role: Role,
    pub enabled: bool,
    /// Default tenant tier; tokens without a group inherit this.
    pub group: String,
    /// Console/API bearer credential, distinct from relay tokens.
    pub access_token: Option<String>,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// Key material after the `sk-` prefix is stripped.
    pub key: String,
    /// Overrides the owner's group when set.
    pub group: Option<String>,
    pub remaining_quota: i64,
    pub unlimited_quota: bool,
    /// Comma-separated model allow-list; empty means unrestricted.
    pub models: Option<String>,
    pub enabled: bool,
    /// Eligible for flat per-call billing when the global flag is on.
    pub billing_by_request: bool,
}

impl TokenRow {
    pub fn allows_model(&self, model: &str) -> bool {
        match self.models.as_deref() {
            None | Some("") => true,
            Some(list) => list.split(',').any(|entry| entry.trim() == model),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    /// Upstream protocol family tag, e.g. `openai`, `claude`, `gemini`.
    pub kind: String,
    pub enabled: bool,
    /// Comma-separated tenant groups this channel serves.
    pub groups: String,
    /// Comma-separated model names this channel serves.
    pub models: String,
    pub base_url: Option<String>,
    pub api_key: String,
    /// Selection weight; zero-weight channels participate uniformly.
    pub weight: i64,
    /// Canonical → upstream model-name remapping, stored as a JSON object.
    pub model_remap: Option<serde_json::Value>,
    /// Generic per-channel key-value configuration (API version, plugin id,
    /// library id and the like live here as named slots).
    pub config: Option<serde_json::Value>,
    /// `None` means the ban-on-error default (true) applies.
    pub auto_ban: Option<bool>,
    pub used_quota: i64,
}

impl ChannelRow {
    pub fn serves_group(&self, group: &str) -> bool {
        self.groups.split(',').any(|entry| entry.trim() == group)
    }

    pub fn serves_model(&self, model: &str) -> bool {
        self.models.split(',').any(|entry| entry.trim() == model)
    }
}

/// Append-only record of one completed (or explicitly zero-cost) request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumeLogEntry {
    pub user_id: i64,
    pub channel_id: i64,
    pub token_id: i64,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    /// Human-readable multiplier breakdown, e.g.
    /// `model ratio 0.002 × group ratio 1.0, completion ratio 2.0`.
    pub ratio_detail: String,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    pub content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelRow {
        ChannelRow {
            id: 1,
            name: "main".into(),
            kind: "openai".into(),
            enabled: true,
            groups: "default,vip".into(),
            models: "gpt-4o, gpt-4o-mini".into(),
            base_url: None,
            api_key: "k".into(),
            weight: 0,
            model_remap: None,
            config: None,
            auto_ban: None,
            used_quota: 0,
        }
    }

    #[test]
    fn group_and_model_membership_trims_whitespace() {
        let row = channel();
        assert!(row.serves_group("vip"));
        assert!(!row.serves_group("free"));
        assert!(row.serves_model("gpt-4o-mini"));
        assert!(!row.serves_model("gpt-3.5-turbo"));
    }

    #[test]
    fn empty_model_list_means_unrestricted() {
        let token = TokenRow {
            id: 1,
            user_id: 1,
            name: "t".into(),
            key: "abc".into(),
            group: None,
            remaining_quota: 100,
            unlimited_quota: false,
            models: Some(String::new()),
            enabled: true,
            billing_by_request: false,
        };
        assert!(token.allows_model("anything"));
    }
}
