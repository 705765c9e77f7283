use std::sync::Arc;

use tollgate_common::{RelayError, RelayResult};
use tollgate_store::cache::UserStatusCache;
use tollgate_store::{Role, SharedStore};

/// Typed identity produced once per request; downstream callers never
/// re-assert credential material.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
}

/// Already-authenticated session state attached by an outer layer (web UI
/// session middleware). Mutually exclusive with bearer credentials: when a
/// session is present it wins and the bearer header is ignored.
#[derive(Debug, Clone)]
pub struct SessionClaims {
    pub user_id: i64,
}

pub struct EntitlementResolver {
    store: SharedStore,
    status_cache: Arc<UserStatusCache>,
}

impl EntitlementResolver {
    pub fn new(store: SharedStore, status_cache: Arc<UserStatusCache>) -> Self {
        Self {
            store,
            status_cache,
        }
    }

    /// Resolve a session or bearer credential into an identity at or above
    /// `min_role`. Account status is re-checked on every call through the
    /// short-TTL cache, never trusted across requests.
    pub async fn resolve(
        &self,
        session: Option<&SessionClaims>,
        bearer: Option<&str>,
        min_role: Role,
    ) -> RelayResult<Identity> {
        let user = if let Some(session) = session {
            self.store
                .get_user(session.user_id)
                .await
                .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?
                .ok_or(RelayError::InvalidCredential)?
        } else if let Some(bearer) = bearer {
            let bearer = bearer.trim();
            if bearer.is_empty() {
                return Err(RelayError::Unauthenticated);
            }
            self.store
                .get_user_by_access_token(bearer)
                .await
                .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?
                .ok_or(RelayError::InvalidCredential)?
        } else {
            return Err(RelayError::Unauthenticated);
        };

        let enabled = self
            .status_cache
            .is_enabled(self.store.as_ref(), user.id)
            .await
            .map_err(|err| RelayError::QuotaStoreFailure(err.to_string()))?;
        if !enabled {
            return Err(RelayError::AccountDisabled);
        }
        if user.role < min_role {
            return Err(RelayError::InsufficientRole);
        }
        Ok(Identity {
            user_id: user.id,
            username: user.username,
            role: user.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tollgate_store::{MemStore, UserRow};

    use super::*;

    fn resolver(store: Arc<MemStore>) -> EntitlementResolver {
        EntitlementResolver::new(
            store,
            Arc::new(UserStatusCache::new(Duration::from_secs(30))),
        )
    }

    fn user(id: i64, role: Role, enabled: bool) -> UserRow {
        UserRow {
            id,
            username: format!("u{id}"),
            role,
            enabled,
            group: "default".into(),
            access_token: Some(format!("at-{id}")),
            quota: 0,
            used_quota: 0,
            request_count: 0,
        }
    }

    #[tokio::test]
    async fn session_wins_over_bearer() {
        let store = Arc::new(MemStore::new());
        store.put_user(user(1, Role::User, true));
        store.put_user(user(2, Role::User, true));
        let resolver = resolver(store);
        let session = SessionClaims { user_id: 1 };
        let identity = resolver
            .resolve(Some(&session), Some("at-2"), Role::User)
            .await
            .unwrap();
        assert_eq!(identity.user_id, 1);
    }

    #[tokio::test]
    async fn missing_credential_and_bad_bearer() {
        let store = Arc::new(MemStore::new());
        store.put_user(user(1, Role::User, true));
        let resolver = resolver(store);
        assert!(matches!(
            resolver.resolve(None, None, Role::User).await,
            Err(RelayError::Unauthenticated)
        ));
        assert!(matches!(
            resolver.resolve(None, Some("nope"), Role::User).await,
            Err(RelayError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn disabled_account_and_low_role() {
        let store = Arc::new(MemStore::new());
        store.put_user(user(1, Role::User, false));
        store.put_user(user(2, Role::User, true));
        let resolver = resolver(store);
        assert!(matches!(
            resolver.resolve(None, Some("at-1"), Role::User).await,
            Err(RelayError::AccountDisabled)
        ));
        assert!(matches!(
            resolver.resolve(None, Some("at-2"), Role::Admin).await,
            Err(RelayError::InsufficientRole)
        ));
    }
}
