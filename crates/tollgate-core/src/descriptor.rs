use std::collections::HashMap;

use serde_json::Value as JsonValue;

use tollgate_adapter::{ApiType, RelayDescriptor};
use tollgate_common::{RelayError, RelayResult};
use tollgate_protocol::RelayMode;
use tollgate_store::ChannelRow;

use crate::token::TokenGrant;

/// Materialize the per-request descriptor from the chosen channel.
///
/// Pure data transformation: the only failure is an unresolvable channel
/// type tag (a configuration fault). Malformed auxiliary config degrades to
/// unset slots rather than aborting the request.
pub fn build_descriptor(
    channel: &ChannelRow,
    grant: &TokenGrant,
    mode: RelayMode,
    is_stream: bool,
) -> RelayResult<RelayDescriptor> {
    let api_type = ApiType::from_tag(&channel.kind).ok_or_else(|| {
        RelayError::DataIntegrityFault(format!(
            "channel {} has unknown type tag {:?}",
            channel.id, channel.kind
        ))
    })?;

    let actual_model = remap_model(channel.model_remap.as_ref(), &grant.model);
    let mut config = flatten_config(channel.config.as_ref());
    let api_version = config.remove("api_version");
    let plugin_id = config.remove("plugin_id");
    let library_id = config.remove("library_id");

    Ok(RelayDescriptor {
        api_type,
        channel_id: channel.id,
        channel_name: channel.name.clone(),
        token_id: grant.token_id,
        user_id: grant.user_id,
        group: grant.group.clone(),
        mode,
        is_stream,
        origin_model: grant.model.clone(),
        actual_model,
        base_url: channel.base_url.clone().filter(|url| !url.is_empty()),
        api_key: channel.api_key.clone(),
        auto_ban: channel.auto_ban.unwrap_or(true),
        api_version,
        plugin_id,
        library_id,
        config,
    })
}

fn remap_model(remap: Option<&JsonValue>, model: &str) -> String {
    remap
        .and_then(|value| value.as_object())
        .and_then(|map| map.get(model))
        .and_then(|mapped| mapped.as_str())
        .filter(|mapped| !mapped.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| model.to_string())
}

fn flatten_config(config: Option<&JsonValue>) -> HashMap<String, String> {
    let mut out = HashMap::new();
    let Some(JsonValue::Object(map)) = config else {
        return out;
    };
    for (key, value) in map {
        match value {
            JsonValue::String(text) => {
                out.insert(key.clone(), text.clone());
            }
            JsonValue::Number(number) => {
                out.insert(key.clone(), number.to_string());
            }
            JsonValue::Bool(flag) => {
                out.insert(key.clone(), flag.to_string());
            }
            // Nested or null values are not representable as slots; skip.
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn grant() -> TokenGrant {
        TokenGrant {
            token_id: 7,
            token_name: "t".into(),
            user_id: 1,
            group: "default".into(),
            unlimited_quota: false,
            remaining_quota: 1000,
            billing_by_request: false,
            model: "gpt-4o".into(),
            meter: true,
            channel_pin: None,
        }
    }

    fn channel(remap: Option<JsonValue>, config: Option<JsonValue>) -> ChannelRow {
        ChannelRow {
            id: 3,
            name: "main".into(),
            kind: "openai".into(),
            enabled: true,
            groups: "default".into(),
            models: "gpt-4o".into(),
            base_url: Some("https://proxy.example.com".into()),
            api_key: "key".into(),
            weight: 0,
            model_remap: remap,
            config,
            auto_ban: None,
            used_quota: 0,
        }
    }

    #[test]
    fn remap_and_slots_apply() {
        let channel = channel(
            Some(json!({"gpt-4o": "gpt-4o-2024-08-06"})),
            Some(json!({"api_version": "2024-06-01", "region": "eastus", "retries": 2})),
        );
        let desc = build_descriptor(&channel, &grant(), RelayMode::Chat, false).unwrap();
        assert_eq!(desc.actual_model, "gpt-4o-2024-08-06");
        assert_eq!(desc.origin_model, "gpt-4o");
        assert_eq!(desc.api_version.as_deref(), Some("2024-06-01"));
        assert_eq!(desc.config_get("region"), Some("eastus"));
        assert_eq!(desc.config_get("retries"), Some("2"));
        assert!(desc.auto_ban);
    }

    #[test]
    fn malformed_config_degrades_to_unset() {
        let channel = channel(Some(json!("not a map")), Some(json!([1, 2, 3])));
        let desc = build_descriptor(&channel, &grant(), RelayMode::Chat, false).unwrap();
        assert_eq!(desc.actual_model, "gpt-4o");
        assert!(desc.api_version.is_none());
        assert!(desc.config.is_empty());
    }

    #[test]
    fn unknown_type_tag_is_integrity_fault() {
        let mut bad = channel(None, None);
        bad.kind = "mystery".into();
        assert!(matches!(
            build_descriptor(&bad, &grant(), RelayMode::Chat, false),
            Err(RelayError::DataIntegrityFault(_))
        ));
    }
}
