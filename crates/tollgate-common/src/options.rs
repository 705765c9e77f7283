use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Runtime-toggleable behavior flags.
///
/// Loaded from the store at bootstrap, held behind an `ArcSwap` snapshot in
/// the core state, and replaced wholesale on reload. Never mutated in place
/// while requests are in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionFlags {
    /// Bill a flat per-call price (from `RatioTables::per_call_ratio`) instead
    /// of token-metered cost, for tokens that opted in.
    pub billing_by_request_enabled: bool,
    /// When false, all model ratios are treated as 1.
    pub model_ratio_enabled: bool,
    /// Capture prompt/completion text into consumption log entries.
    pub log_content_enabled: bool,
    /// Minimum reservation taken when estimation fails, in quota units.
    pub pre_consume_floor: i64,
    /// Flip a channel's enabled flag off when its upstream reports an
    /// auth/billing-shaped failure (channels may opt out individually).
    pub auto_disable_enabled: bool,
}

impl Default for OptionFlags {
    fn default() -> Self {
        Self {
            billing_by_request_enabled: false,
            model_ratio_enabled: true,
            log_content_enabled: false,
            pre_consume_floor: 500,
            auto_disable_enabled: true,
        }
    }
}

/// Per-model and per-group price multipliers.
///
/// All tables are immutable once built; reload swaps the whole snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioTables {
    /// Quota units per prompt token, by model name.
    pub model_ratio: HashMap<String, f64>,
    /// Flat per-call price in quota units, by model name (request billing).
    pub per_call_ratio: HashMap<String, f64>,
    /// Completion-token weight relative to prompt tokens, by model name.
    pub completion_ratio: HashMap<String, f64>,
    /// Tenant tier multiplier, by group label.
    pub group_ratio: HashMap<String, f64>,
}

impl RatioTables {
    pub fn model_ratio(&self, model: &str) -> f64 {
        self.model_ratio.get(model).copied().unwrap_or(1.0)
    }

    pub fn per_call_ratio(&self, model: &str) -> Option<f64> {
        self.per_call_ratio.get(model).copied()
    }

    pub fn completion_ratio(&self, model: &str) -> f64 {
        self.completion_ratio.get(model).copied().unwrap_or(1.0)
    }

    pub fn group_ratio(&self, group: &str) -> f64 {
        self.group_ratio.get(group).copied().unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entries_fall_back_to_unit_ratio() {
        let tables = RatioTables::default();
        assert_eq!(tables.model_ratio("gpt-x"), 1.0);
        assert_eq!(tables.completion_ratio("gpt-x"), 1.0);
        assert_eq!(tables.group_ratio("vip"), 1.0);
        assert!(tables.per_call_ratio("gpt-x").is_none());
    }
}
