use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after store connection): CLI > ENV > stored row, then the
/// merged result is persisted back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used by this process (`memory://` selects the in-memory store).
    pub dsn: String,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Seconds a cached user quota/status entry stays fresh.
    pub cache_ttl_secs: u64,
    /// Outbound request timeout in seconds.
    pub upstream_timeout_secs: u64,
}

/// Optional layer used when merging global config sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub proxy: Option<String>,
    pub cache_ttl_secs: Option<u64>,
    pub upstream_timeout_secs: Option<u64>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.cache_ttl_secs.is_some() {
            self.cache_ttl_secs = other.cache_ttl_secs;
        }
        if other.upstream_timeout_secs.is_some() {
            self.upstream_timeout_secs = other.upstream_timeout_secs;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            proxy: self.proxy,
            cache_ttl_secs: self.cache_ttl_secs.unwrap_or(30),
            upstream_timeout_secs: self.upstream_timeout_secs.unwrap_or(600),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            proxy: value.proxy,
            cache_ttl_secs: Some(value.cache_ttl_secs),
            upstream_timeout_secs: Some(value.upstream_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            dsn: Some("sqlite://a.db".to_string()),
            ..Default::default()
        };
        base.overlay(GlobalConfigPatch {
            dsn: Some("sqlite://b.db".to_string()),
            port: Some(8080),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.dsn, "sqlite://b.db");
    }

    #[test]
    fn missing_dsn_is_rejected() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("dsn")));
    }
}
