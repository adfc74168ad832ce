use std::env;
use std::path::PathBuf;
use std::time::Duration;

use photoshift_contracts::operations::CostTable;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;
pub const DEFAULT_PLACEHOLDER_BASE: &str = "placeholder://photoshift";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    /// Answer rate-limited or unavailable providers with a simulated result.
    pub fallback_enabled: bool,
    pub placeholder_base: String,
    /// Where per-job receipts are written; `None` disables receipts.
    pub receipts_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            fallback_enabled: true,
            placeholder_base: DEFAULT_PLACEHOLDER_BASE.to_string(),
            receipts_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();
        Self {
            poll_interval: get("PHOTOSHIFT_POLL_INTERVAL_S")
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .map(|value| Duration::from_secs_f64(value.clamp(0.0, 60.0)))
                .unwrap_or(defaults.poll_interval),
            max_poll_attempts: get("PHOTOSHIFT_MAX_POLL_ATTEMPTS")
                .and_then(|value| value.parse::<u32>().ok())
                .map(|value| value.clamp(1, 600))
                .unwrap_or(defaults.max_poll_attempts),
            fallback_enabled: get("PHOTOSHIFT_FALLBACK")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(defaults.fallback_enabled),
            placeholder_base: get("PHOTOSHIFT_PLACEHOLDER_BASE")
                .unwrap_or(defaults.placeholder_base),
            receipts_dir: get("PHOTOSHIFT_RECEIPTS_DIR").map(PathBuf::from),
        }
    }
}

/// Built-in cost table, with overrides from `PHOTOSHIFT_CREDIT_COSTS_PATH` when set.
pub fn load_cost_table() -> anyhow::Result<CostTable> {
    let mut table = CostTable::default();
    if let Some(path) = env::var("PHOTOSHIFT_CREDIT_COSTS_PATH")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        let raw = std::fs::read_to_string(&path)?;
        let skipped = table.merge_overrides_json(&raw)?;
        if !skipped.is_empty() {
            anyhow::bail!(
                "credit cost overrides in {path} have invalid entries: {}",
                skipped.join(", ")
            );
        }
    }
    Ok(table)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    use super::{OrchestratorConfig, DEFAULT_MAX_POLL_ATTEMPTS, DEFAULT_POLL_INTERVAL};

    fn config_from(pairs: &[(&str, &str)]) -> OrchestratorConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.max_poll_attempts, DEFAULT_MAX_POLL_ATTEMPTS);
        assert!(config.fallback_enabled);
    }

    #[test]
    fn environment_overrides_are_parsed_and_clamped() {
        let config = config_from(&[
            ("PHOTOSHIFT_POLL_INTERVAL_S", "0.5"),
            ("PHOTOSHIFT_MAX_POLL_ATTEMPTS", "5000"),
            ("PHOTOSHIFT_FALLBACK", "off"),
            ("PHOTOSHIFT_PLACEHOLDER_BASE", "https://cdn.example/placeholders"),
            ("PHOTOSHIFT_RECEIPTS_DIR", "/tmp/receipts"),
        ]);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.max_poll_attempts, 600);
        assert!(!config.fallback_enabled);
        assert_eq!(config.placeholder_base, "https://cdn.example/placeholders");
        assert_eq!(config.receipts_dir, Some(PathBuf::from("/tmp/receipts")));
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let config = config_from(&[
            ("PHOTOSHIFT_POLL_INTERVAL_S", "soon"),
            ("PHOTOSHIFT_MAX_POLL_ATTEMPTS", "-3"),
            ("PHOTOSHIFT_FALLBACK", "maybe"),
            ("PHOTOSHIFT_PLACEHOLDER_BASE", "   "),
        ]);
        assert_eq!(config, OrchestratorConfig::default());
    }

    #[test]
    fn zero_attempts_clamp_to_one() {
        let config = config_from(&[("PHOTOSHIFT_MAX_POLL_ATTEMPTS", "0")]);
        assert_eq!(config.max_poll_attempts, 1);
    }
}
