use {
    crate::error::{ConfigError, ConfigResult},
    serde::{Deserialize, Serialize},
    std::{borrow::Borrow, fmt},
};

/// Shard identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ShardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ShardId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Shard lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Active,
    ReadOnly,
    Maintenance,
    Failed,
}

impl fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ShardStatus::Active => "active",
            ShardStatus::ReadOnly => "readonly",
            ShardStatus::Maintenance => "maintenance",
            ShardStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Consistency level of a shard or of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    Strong,
    #[default]
    Eventual,
}

impl ConsistencyLevel {
    /// Whether data served at `self` is acceptable to a reader requiring
    /// `required`.
    pub fn satisfies(self, required: ConsistencyLevel) -> bool {
        match required {
            ConsistencyLevel::Eventual => true,
            ConsistencyLevel::Strong => self == ConsistencyLevel::Strong,
        }
    }
}

/// Kind of operation a shard is selected for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Write,
}

/// How to reach a shard.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            database: None,
        }
    }

    fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && self.port != 0
    }
}

/// Capacity limits and current usage of a shard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardCapacity {
    pub max_connections: u32,
    #[serde(default)]
    pub current_connections: u32,
    /// Storage limit in bytes.
    pub max_storage: u64,
    #[serde(default)]
    pub used_storage: u64,
    pub max_qps: u32,
    #[serde(default)]
    pub current_qps: u32,
}

impl ShardCapacity {
    pub fn new(max_connections: u32, max_storage: u64, max_qps: u32) -> Self {
        Self {
            max_connections,
            current_connections: 0,
            max_storage,
            used_storage: 0,
            max_qps,
            current_qps: 0,
        }
    }

    /// Fraction of the connection pool in use.
    pub fn connection_utilization(&self) -> f64 {
        ratio(self.current_connections as f64, self.max_connections as f64)
    }

    /// Fraction of the QPS budget in use.
    pub fn qps_utilization(&self) -> f64 {
        ratio(self.current_qps as f64, self.max_qps as f64)
    }

    pub fn storage_utilization(&self) -> f64 {
        ratio(self.used_storage as f64, self.max_storage as f64)
    }
}

fn ratio(current: f64, max: f64) -> f64 {
    if max <= 0.0 { 1.0 } else { current / max }
}

/// Point-in-time load figures reported by health monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ShardLoad {
    pub connections: u32,
    pub qps: u32,
    pub used_storage: u64,
}

/// Shard configuration accepted by `add_shard`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub id: ShardId,
    pub region: String,
    pub connection: ConnectionInfo,
    pub capacity: ShardCapacity,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u8,
    #[serde(default)]
    pub consistency: ConsistencyLevel,
    /// Number of virtual nodes; `None` uses the router default.
    #[serde(default)]
    pub virtual_nodes: Option<u32>,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_replication_factor() -> u8 {
    1
}

fn default_weight() -> u32 {
    1
}

impl ShardConfig {
    pub fn new(
        id: impl Into<ShardId>,
        region: impl Into<String>,
        connection: ConnectionInfo,
        capacity: ShardCapacity,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            connection,
            capacity,
            replication_factor: default_replication_factor(),
            consistency: ConsistencyLevel::default(),
            virtual_nodes: None,
            weight: default_weight(),
        }
    }

    pub fn with_virtual_nodes(mut self, count: u32) -> Self {
        self.virtual_nodes = Some(count);
        self
    }

    pub fn with_consistency(mut self, consistency: ConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }

    /// Checks the configuration as a whole.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.id.as_str().trim().is_empty() || !self.connection.is_complete() {
            return Err(ConfigError::MissingConnectionInfo(self.id.clone()));
        }
        let capacity = &self.capacity;
        for (field, value) in [
            ("max_connections", capacity.max_connections as u64),
            ("max_storage", capacity.max_storage),
            ("max_qps", capacity.max_qps as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::NonPositiveCapacity {
                    shard: self.id.clone(),
                    field,
                });
            }
        }
        if self.replication_factor == 0 {
            return Err(ConfigError::NonPositiveCapacity {
                shard: self.id.clone(),
                field: "replication_factor",
            });
        }
        if self.virtual_nodes == Some(0) {
            return Err(ConfigError::NoVirtualNodes(self.id.clone()));
        }
        if self.weight == 0 {
            return Err(ConfigError::InvalidWeight(self.id.clone()));
        }
        Ok(())
    }
}

/// Registered shard.
#[derive(Debug, Clone, PartialEq)]
pub struct Shard {
    pub config: ShardConfig,
    pub status: ShardStatus,
    /// Virtual nodes actually placed on the ring.
    pub virtual_nodes: u32,
    /// Shards holding read replicas of this shard's ranges.
    pub replicas: Vec<ShardId>,
}

impl Shard {
    pub(crate) fn new(config: ShardConfig, virtual_nodes: u32) -> Self {
        Self {
            config,
            status: ShardStatus::Active,
            virtual_nodes,
            replicas: Vec::new(),
        }
    }

    pub fn id(&self) -> &ShardId {
        &self.config.id
    }

    pub fn region(&self) -> &str {
        &self.config.region
    }

    pub fn capacity(&self) -> &ShardCapacity {
        &self.config.capacity
    }

    pub fn consistency(&self) -> ConsistencyLevel {
        self.config.consistency
    }

    pub fn connection_utilization(&self) -> f64 {
        self.config.capacity.connection_utilization()
    }

    pub fn qps_utilization(&self) -> f64 {
        self.config.capacity.qps_utilization()
    }

    /// Status allows the operation, load aside.
    pub fn accepts(&self, op: Operation) -> bool {
        match (self.status, op) {
            (ShardStatus::Active, _) => true,
            (ShardStatus::ReadOnly, Operation::Read) => true,
            (ShardStatus::ReadOnly, Operation::Write) => false,
            (ShardStatus::Maintenance | ShardStatus::Failed, _) => false,
        }
    }

    /// Whether the shard should be considered for routing at all.
    pub fn is_routable(&self) -> bool {
        matches!(self.status, ShardStatus::Active | ShardStatus::ReadOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(id: &str) -> ShardConfig {
        ShardConfig::new(
            id,
            "us-east",
            ConnectionInfo::new("10.0.0.1", 5432),
            ShardCapacity::new(100, 1 << 30, 1000),
        )
    }

    #[test]
    fn validation() {
        assert!(config("s1").validate().is_ok());

        let mut missing = config("s1");
        missing.connection.host = " ".into();
        assert_eq!(
            missing.validate(),
            Err(ConfigError::MissingConnectionInfo("s1".into()))
        );

        let mut no_qps = config("s1");
        no_qps.capacity.max_qps = 0;
        assert_eq!(
            no_qps.validate(),
            Err(ConfigError::NonPositiveCapacity {
                shard: "s1".into(),
                field: "max_qps"
            })
        );

        assert_eq!(
            config("s1").with_virtual_nodes(0).validate(),
            Err(ConfigError::NoVirtualNodes("s1".into()))
        );
    }

    #[test]
    fn status_policy() {
        let mut shard = Shard::new(config("s1"), 1);
        assert!(shard.accepts(Operation::Write));

        shard.status = ShardStatus::ReadOnly;
        assert!(shard.accepts(Operation::Read));
        assert!(!shard.accepts(Operation::Write));

        shard.status = ShardStatus::Failed;
        assert!(!shard.accepts(Operation::Read));
    }

    #[test]
    fn consistency_satisfaction() {
        use ConsistencyLevel::*;
        assert!(Strong.satisfies(Strong));
        assert!(Strong.satisfies(Eventual));
        assert!(!Eventual.satisfies(Strong));
    }
}
