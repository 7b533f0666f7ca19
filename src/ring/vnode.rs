use {
    crate::{hash::Position, shard::ShardId},
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Virtual node identifier: the owning shard it was created for and its
/// ordinal within the shard's batch.
///
/// The id never changes, even after the node's range has been handed over to
/// another shard by re-balancing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VirtualNodeId {
    pub origin: ShardId,
    pub ordinal: u32,
}

impl fmt::Display for VirtualNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.ordinal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VirtualNodeStatus {
    Active,
    /// Range is being copied to another shard; ownership is unchanged.
    Migrating,
    Inactive,
}

/// Placement unit on the ring.
///
/// A virtual node sitting at `token` owns the arc between its predecessor's
/// token (exclusive) and its own token (inclusive).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNode {
    pub id: VirtualNodeId,
    pub shard: ShardId,
    pub token: Position,
    pub weight: u32,
    pub status: VirtualNodeStatus,
}

impl VirtualNode {
    pub fn new(shard: ShardId, ordinal: u32, token: Position, weight: u32) -> Self {
        Self {
            id: VirtualNodeId {
                origin: shard.clone(),
                ordinal,
            },
            shard,
            token,
            weight,
            status: VirtualNodeStatus::Active,
        }
    }

    /// Seed used to derive the ring position of a virtual node.
    ///
    /// `attempt` is bumped only when the derived position collides with an
    /// existing one.
    pub(crate) fn token_seed(shard: &ShardId, ordinal: u32, attempt: u32) -> String {
        if attempt == 0 {
            format!("{shard}#{ordinal}")
        } else {
            format!("{shard}#{ordinal}/{attempt}")
        }
    }
}
