use clap::Parser;

#[derive(Parser)]
#[command(name = "tollgate")]
pub(crate) struct Cli {
    /// Database DSN (`sqlite://...`, `mysql://...`, `postgres://...`, or
    /// `memory://` for an ephemeral in-memory store).
    #[arg(long, env = "TOLLGATE_DSN", default_value = "sqlite://tollgate.db")]
    pub(crate) dsn: String,
    #[arg(long, env = "TOLLGATE_HOST", default_value = "0.0.0.0")]
    pub(crate) host: String,
    #[arg(long, env = "TOLLGATE_PORT", default_value_t = 3000)]
    pub(crate) port: u16,
    /// Outbound proxy for upstream egress.
    #[arg(long, env = "TOLLGATE_PROXY")]
    pub(crate) proxy: Option<String>,
    /// Seconds a cached user quota/status entry stays fresh.
    #[arg(long, default_value_t = 30)]
    pub(crate) cache_ttl_secs: u64,
    /// Outbound request timeout in seconds.
    #[arg(long, default_value_t = 600)]
    pub(crate) upstream_timeout_secs: u64,
    /// JSON file holding option flags and ratio tables.
    #[arg(long, env = "TOLLGATE_PRICING")]
    pub(crate) pricing: Option<String>,
}
