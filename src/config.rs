//! Router configuration.
//!
//! Every setting has a default and can be overridden from a serialized
//! config or from `SHARDWISE_*` environment variables.

use {
    crate::{
        error::{ConfigError, ConfigResult},
        shard::ConsistencyLevel,
    },
    serde::{Deserialize, Serialize},
    std::{str::FromStr, time::Duration},
};

/// Prefix of the environment variables read by [`RouterConfig::from_env`].
pub const ENV_PREFIX: &str = "SHARDWISE_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Virtual nodes placed for a shard that does not set its own count.
    pub virtual_nodes: u32,
    /// Distinct ring owners considered when selecting a shard for a key.
    pub replica_candidates: usize,
    /// Connection/QPS utilization at which a shard stops taking work.
    pub load_threshold: f64,
    /// Spread of QPS utilization that triggers re-balancing.
    pub rebalance_threshold: f64,
    /// Shards below this utilization are candidates for merging.
    pub merge_threshold: f64,
    /// Shard legs of one query running at the same time.
    pub max_parallelism: usize,
    pub step_timeout_ms: u64,
    pub health_interval_secs: u64,
    pub rebalance_interval_secs: u64,
    pub index_stats_interval_secs: u64,
    /// Consecutive failed probes before a shard is marked failed.
    pub failure_threshold: u32,
    /// Finished rebalance operations, and plans, remembered for status
    /// queries.
    pub operation_history: usize,
    pub default_consistency: ConsistencyLevel,
    pub preferred_region: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            virtual_nodes: 256,
            replica_candidates: 3,
            load_threshold: 0.8,
            rebalance_threshold: 0.30,
            merge_threshold: 0.2,
            max_parallelism: 16,
            step_timeout_ms: 30_000,
            health_interval_secs: 30,
            rebalance_interval_secs: 300,
            index_stats_interval_secs: 60,
            failure_threshold: 3,
            operation_history: 1024,
            default_consistency: ConsistencyLevel::Eventual,
            preferred_region: None,
        }
    }
}

impl RouterConfig {
    /// Defaults overridden by `SHARDWISE_*` environment variables.
    ///
    /// Unparsable values are reported rather than silently ignored.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env()`](Self::from_env), reading variables through
    /// `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        override_with(&var, "VIRTUAL_NODES", "virtual_nodes", &mut config.virtual_nodes)?;
        override_with(
            &var,
            "REPLICA_CANDIDATES",
            "replica_candidates",
            &mut config.replica_candidates,
        )?;
        override_with(&var, "LOAD_THRESHOLD", "load_threshold", &mut config.load_threshold)?;
        override_with(
            &var,
            "REBALANCE_THRESHOLD",
            "rebalance_threshold",
            &mut config.rebalance_threshold,
        )?;
        override_with(&var, "MERGE_THRESHOLD", "merge_threshold", &mut config.merge_threshold)?;
        override_with(&var, "MAX_PARALLELISM", "max_parallelism", &mut config.max_parallelism)?;
        override_with(&var, "STEP_TIMEOUT_MS", "step_timeout_ms", &mut config.step_timeout_ms)?;
        override_with(
            &var,
            "HEALTH_INTERVAL_SECS",
            "health_interval_secs",
            &mut config.health_interval_secs,
        )?;
        override_with(
            &var,
            "REBALANCE_INTERVAL_SECS",
            "rebalance_interval_secs",
            &mut config.rebalance_interval_secs,
        )?;
        override_with(
            &var,
            "INDEX_STATS_INTERVAL_SECS",
            "index_stats_interval_secs",
            &mut config.index_stats_interval_secs,
        )?;
        override_with(
            &var,
            "FAILURE_THRESHOLD",
            "failure_threshold",
            &mut config.failure_threshold,
        )?;
        override_with(
            &var,
            "OPERATION_HISTORY",
            "operation_history",
            &mut config.operation_history,
        )?;

        if let Some(value) = var("DEFAULT_CONSISTENCY") {
            config.default_consistency = match value.to_lowercase().as_str() {
                "strong" => ConsistencyLevel::Strong,
                "eventual" => ConsistencyLevel::Eventual,
                _ => {
                    return Err(ConfigError::InvalidSetting {
                        name: "default_consistency",
                        reason: format!("unknown consistency level `{value}`"),
                    });
                }
            };
        }
        if let Some(region) = var("PREFERRED_REGION") {
            config.preferred_region = Some(region).filter(|r| !r.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that every setting is within range.
    pub fn validate(&self) -> ConfigResult<()> {
        let invalid = |name: &'static str, reason: &str| {
            Err(ConfigError::InvalidSetting {
                name,
                reason: reason.to_string(),
            })
        };

        if self.virtual_nodes == 0 {
            return invalid("virtual_nodes", "must be positive");
        }
        if self.replica_candidates == 0 {
            return invalid("replica_candidates", "must be positive");
        }
        if !(self.load_threshold > 0.0 && self.load_threshold <= 1.0) {
            return invalid("load_threshold", "must be within (0, 1]");
        }
        if !(self.rebalance_threshold > 0.0 && self.rebalance_threshold < 1.0) {
            return invalid("rebalance_threshold", "must be within (0, 1)");
        }
        if !(0.0..1.0).contains(&self.merge_threshold) {
            return invalid("merge_threshold", "must be within [0, 1)");
        }
        if self.max_parallelism == 0 {
            return invalid("max_parallelism", "must be positive");
        }
        if self.step_timeout_ms == 0 {
            return invalid("step_timeout_ms", "must be positive");
        }
        if self.health_interval_secs == 0
            || self.rebalance_interval_secs == 0
            || self.index_stats_interval_secs == 0
        {
            return invalid("interval", "background intervals must be positive");
        }
        if self.failure_threshold == 0 {
            return invalid("failure_threshold", "must be positive");
        }
        if self.operation_history == 0 {
            return invalid("operation_history", "must be positive");
        }
        Ok(())
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.rebalance_interval_secs)
    }

    pub fn index_stats_interval(&self) -> Duration {
        Duration::from_secs(self.index_stats_interval_secs)
    }
}

fn override_with<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    suffix: &str,
    name: &'static str,
    slot: &mut T,
) -> ConfigResult<()> {
    if let Some(raw) = var(suffix) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidSetting {
            name,
            reason: format!("cannot parse `{raw}`"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = RouterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.step_timeout(), Duration::from_secs(30));
        assert_eq!(config.rebalance_interval(), Duration::from_secs(300));
    }

    #[test]
    fn environment_overrides() {
        let config = RouterConfig::from_lookup(lookup(&[
            ("VIRTUAL_NODES", "64"),
            ("DEFAULT_CONSISTENCY", "Strong"),
            ("PREFERRED_REGION", "eu-west"),
        ]))
        .unwrap();
        assert_eq!(config.virtual_nodes, 64);
        assert_eq!(config.default_consistency, ConsistencyLevel::Strong);
        assert_eq!(config.preferred_region.as_deref(), Some("eu-west"));
        assert_eq!(config.max_parallelism, 16);
    }

    #[test]
    fn bad_values_rejected() {
        assert!(matches!(
            RouterConfig::from_lookup(lookup(&[("MAX_PARALLELISM", "many")])),
            Err(ConfigError::InvalidSetting {
                name: "max_parallelism",
                ..
            })
        ));
        assert!(matches!(
            RouterConfig::from_lookup(lookup(&[("LOAD_THRESHOLD", "1.5")])),
            Err(ConfigError::InvalidSetting {
                name: "load_threshold",
                ..
            })
        ));
    }

    #[test]
    fn partial_documents_deserialize() {
        let config: RouterConfig =
            serde_json::from_str(r#"{"virtual_nodes": 32, "default_consistency": "strong"}"#).unwrap();
        assert_eq!(config.virtual_nodes, 32);
        assert_eq!(config.default_consistency, ConsistencyLevel::Strong);
        assert_eq!(config.replica_candidates, 3);
    }
}
