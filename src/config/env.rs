use super::{Config, FlowControlPolicy};

pub fn apply_env_overrides(config: &mut Config) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup`; invalid values are ignored with a warning.
pub fn apply_env_overrides_from(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(raw) = lookup("DCP_NOOP_INTERVAL_SECS") {
        match raw.trim().parse::<u64>() {
            Ok(secs) => config.limits.noop_interval_ms = secs * 1_000,
            Err(err) => tracing::warn!("invalid DCP_NOOP_INTERVAL_SECS, ignoring: {err}"),
        }
    }

    if let Some(raw) = lookup("DCP_IDLE_TIMEOUT_SECS") {
        match raw.trim().parse::<u64>() {
            Ok(secs) => config.limits.idle_timeout_ms = secs * 1_000,
            Err(err) => tracing::warn!("invalid DCP_IDLE_TIMEOUT_SECS, ignoring: {err}"),
        }
    }

    if let Some(raw) = lookup("DCP_REPLICATION_THROTTLE_PERCENT") {
        match raw.trim().parse::<u8>() {
            Ok(pct) if (1..=100).contains(&pct) => {
                config.limits.replication_throttle_percent = pct;
            }
            Ok(pct) => {
                tracing::warn!("DCP_REPLICATION_THROTTLE_PERCENT out of range ({pct}), ignoring");
            }
            Err(err) => {
                tracing::warn!("invalid DCP_REPLICATION_THROTTLE_PERCENT, ignoring: {err}");
            }
        }
    }

    if let Some(raw) = lookup("DCP_FLOW_CONTROL_POLICY") {
        let trimmed = raw.trim();
        match FlowControlPolicy::parse(trimmed) {
            Some(policy) => config.replication.flow_control_policy = policy,
            None => tracing::warn!("invalid DCP_FLOW_CONTROL_POLICY `{trimmed}`, ignoring"),
        }
    }

    if let Some(raw) = lookup("DCP_BUCKET_NAME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            config.replication.bucket_name = trimmed.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn apply(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::default();
        apply_env_overrides_from(&mut config, |key| vars.get(key).cloned());
        config
    }

    #[test]
    fn overrides_apply_valid_values() {
        let config = apply(&[
            ("DCP_NOOP_INTERVAL_SECS", "4"),
            ("DCP_IDLE_TIMEOUT_SECS", " 30 "),
            ("DCP_FLOW_CONTROL_POLICY", "none"),
            ("DCP_REPLICATION_THROTTLE_PERCENT", "80"),
            ("DCP_BUCKET_NAME", "beer-sample"),
        ]);
        assert_eq!(config.limits.noop_interval_ms, 4_000);
        assert_eq!(config.limits.idle_timeout_ms, 30_000);
        assert_eq!(config.replication.flow_control_policy, FlowControlPolicy::None);
        assert_eq!(config.limits.replication_throttle_percent, 80);
        assert_eq!(config.replication.bucket_name, "beer-sample");
    }

    #[test]
    fn invalid_values_are_ignored() {
        let defaults = Config::default();
        let config = apply(&[
            ("DCP_NOOP_INTERVAL_SECS", "soon"),
            ("DCP_FLOW_CONTROL_POLICY", "aggressive"),
            ("DCP_REPLICATION_THROTTLE_PERCENT", "150"),
        ]);
        assert_eq!(config.limits.noop_interval_ms, defaults.limits.noop_interval_ms);
        assert_eq!(
            config.replication.flow_control_policy,
            defaults.replication.flow_control_policy
        );
        assert_eq!(
            config.limits.replication_throttle_percent,
            defaults.limits.replication_throttle_percent
        );
    }
}
