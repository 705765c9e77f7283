use std::sync::Arc;

use tollgate_common::{RelayError, RelayResult};
use tollgate_protocol::RelayMode;
use tollgate_store::cache::UserStatusCache;
use tollgate_store::{Role, SharedStore};

/// Token-scoped grant attached to the request after validation.
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub token_id: i64,
    pub token_name: String,
    pub user_id: i64,
    /// Token group, falling back to the owner's default group.
    pub group: String,
    pub unlimited_quota: bool,
    pub remaining_quota: i64,
    pub billing_by_request: bool,
    /// Effective model after endpoint defaults applied.
    pub model: String,
    /// Whether this request consumes quota at all (listing endpoints do not).
    pub meter: bool,
    /// Honored admin-only channel pin, if the credential carried one.
    pub channel_pin: Option<i64>,
}

pub struct TokenValidator {
    store: SharedStore,
    status_cache: Arc<UserStatusCache>,
}

impl TokenValidator {
    pub fn new(store: SharedStore, status_cache: Arc<UserStatusCache>) -> Self {
        Self {
            store,
            status_cache,
        }
    }

    /// Validate an `Authorization: Bearer sk-<key>[-<channelId>]` credential
    /// against the requested model.
    ///
    /// Endpoint default models are applied *before* resolution so that
    /// model-restricted tokens are checked against the effective model.
    pub async fn validate(
        &self,
        auth_header: Option<&str>,
        mode: RelayMode,
        requested_model: Option<&str>,
    ) -> RelayResult<TokenGrant> {
        let model = match requested_model.filter(|m| !m.is_empty()) {
            Some(model) => model.to_string(),
            None if !mode.meters_quota() => String::new(),
            None => mode
                .default_model()
                .map(str::to_string)
                .ok_or_else(|| RelayError::MalformedRequestBody("missing model".to_string()))?,
        };

        let raw = auth_header.ok_or(RelayError::Unauthenticated)?.trim();
        let raw = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();
        let raw = raw.strip_prefix("sk-").unwrap_or(raw);
        if raw.is_empty() {
            return Err(RelayError::InvalidToken("empty key".to_string()));
        }
        // Key material never contains the delimiter; a trailing segment is a
        // channel pin.
        let (key, pin) = match raw.split_once('-') {
            Some((key, pin_text)) => {
                let pin = pin_text
                    .parse::<i64>()
                    .map_err(|_| RelayError::InvalidToken("malformed channel pin".to_string()))?;
                (key, Some(pin))
            }
            None => (raw, None),
        };

        let token = self
            .store
            .get_token_by_key(key)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?
            .ok_or_else(|| RelayError::InvalidToken("unknown key".to_string()))?;
        if !token.enabled {
            return Err(RelayError::InvalidToken("token disabled".to_string()));
        }
        if !model.is_empty() && !token.allows_model(&model) {
            return Err(RelayError::ModelNotAllowedForToken { model });
        }

        let enabled = self
            .status_cache
            .is_enabled(self.store.as_ref(), token.user_id)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?;
        if !enabled {
            return Err(RelayError::UserDisabled);
        }

        let user = self
            .store
            .get_user(token.user_id)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?
            .ok_or_else(|| {
                RelayError::DataIntegrityFault(format!(
                    "token {} references missing user {}",
                    token.id, token.user_id
                ))
            })?;

        if pin.is_some() && user.role < Role::Admin {
            return Err(RelayError::ChannelPinForbidden);
        }

        let group = token
            .group
            .clone()
            .filter(|group| !group.is_empty())
            .unwrap_or_else(|| user.group.clone());

        Ok(TokenGrant {
            token_id: token.id,
            token_name: token.name,
            user_id: token.user_id,
            group,
            unlimited_quota: token.unlimited_quota,
            remaining_quota: token.remaining_quota,
            billing_by_request: token.billing_by_request,
            model,
            meter: mode.meters_quota(),
            channel_pin: pin,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tollgate_store::{MemStore, TokenRow, UserRow};

    use super::*;

    fn seed(store: &MemStore, role: Role, models: Option<&str>) {
        store.put_user(UserRow {
            id: 1,
            username: "alice".into(),
            role,
            enabled: true,
            group: "default".into(),
            access_token: None,
            quota: 10_000,
            used_quota: 0,
            request_count: 0,
        });
        store.put_token(TokenRow {
            id: 7,
            user_id: 1,
            name: "workbench".into(),
            key: "abc123".into(),
            group: None,
            remaining_quota: 5_000,
            unlimited_quota: false,
            models: models.map(str::to_string),
            enabled: true,
            billing_by_request: false,
        });
    }

    fn validator(store: Arc<MemStore>) -> TokenValidator {
        TokenValidator::new(
            store,
            Arc::new(UserStatusCache::new(Duration::from_secs(30))),
        )
    }

    #[tokio::test]
    async fn resolves_grant_with_owner_group() {
        let store = Arc::new(MemStore::new());
        seed(&store, Role::User, None);
        let validator = validator(store);
        let grant = validator
            .validate(Some("Bearer sk-abc123"), RelayMode::Chat, Some("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(grant.token_id, 7);
        assert_eq!(grant.group, "default");
        assert_eq!(grant.model, "gpt-4o");
        assert!(grant.meter);
        assert_eq!(grant.channel_pin, None);
    }

    #[tokio::test]
    async fn default_model_applies_before_allow_list() {
        let store = Arc::new(MemStore::new());
        seed(&store, Role::User, Some("gpt-4o"));
        let validator = validator(store);
        // Moderation defaults to a model outside the allow-list.
        let err = validator
            .validate(Some("Bearer sk-abc123"), RelayMode::Moderation, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ModelNotAllowedForToken { model } if model == "omni-moderation-latest"));
    }

    #[tokio::test]
    async fn channel_pin_requires_admin() {
        let store = Arc::new(MemStore::new());
        seed(&store, Role::User, None);
        let validator = validator(store.clone());
        let err = validator
            .validate(Some("Bearer sk-abc123-5"), RelayMode::Chat, Some("gpt-4o"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelPinForbidden));

        seed(&store, Role::Admin, None);
        let grant = validator
            .validate(Some("Bearer sk-abc123-5"), RelayMode::Chat, Some("gpt-4o"))
            .await
            .unwrap();
        assert_eq!(grant.channel_pin, Some(5));
    }

    #[tokio::test]
    async fn disabled_owner_fails_fast() {
        let store = Arc::new(MemStore::new());
        seed(&store, Role::User, None);
        store.put_user(UserRow {
            id: 1,
            username: "alice".into(),
            role: Role::User,
            enabled: false,
            group: "default".into(),
            access_token: None,
            quota: 10_000,
            used_quota: 0,
            request_count: 0,
        });
        let validator = validator(store);
        let err = validator
            .validate(Some("Bearer sk-abc123"), RelayMode::Chat, Some("gpt-4o"))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UserDisabled));
    }
}
