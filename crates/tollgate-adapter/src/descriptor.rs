use std::collections::HashMap;

use tollgate_protocol::RelayMode;

use crate::api_type::ApiType;

/// Immutable per-request relay context.
///
/// Built once after channel selection and threaded explicitly through every
/// component call; nothing request-scoped travels through ambient maps.
/// Exists only for the duration of one request and is never persisted.
#[derive(Debug, Clone)]
pub struct RelayDescriptor {
    pub api_type: ApiType,
    pub channel_id: i64,
    pub channel_name: String,
    pub token_id: i64,
    pub user_id: i64,
    pub group: String,
    pub mode: RelayMode,
    pub is_stream: bool,
    /// Model name the client asked for.
    pub origin_model: String,
    /// Model name sent upstream after the channel's remap table applies.
    pub actual_model: String,
    pub base_url: Option<String>,
    /// Channel credential injected into outbound auth headers. The inbound
    /// client's own credential never reaches the upstream.
    pub api_key: String,
    /// Ban-on-error policy; defaults on unless the channel opted out.
    pub auto_ban: bool,
    /// Named auxiliary slots translated from legacy per-type settings.
    pub api_version: Option<String>,
    pub plugin_id: Option<String>,
    pub library_id: Option<String>,
    /// Remaining generic key-value configuration from the channel record.
    pub config: HashMap<String, String>,
}

impl RelayDescriptor {
    pub fn config_get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}
