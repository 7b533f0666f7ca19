use {
    crate::{
        hash::Position,
        ring::KeyRange,
        shard::ShardId,
    },
    serde::{Deserialize, Serialize},
    std::fmt,
};

/// Identifier of a rebalance operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub u64);

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Identifier of a batch of operations planned together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plan-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OperationKind {
    /// Hands part of the source's virtual nodes to a new logical shard.
    Split { source: ShardId, new_shard: ShardId },
    /// Drains the source into the target; the source leaves the ring.
    Merge { source: ShardId, target: ShardId },
    /// Hands part of the source's virtual nodes to an existing shard.
    Move { source: ShardId, target: ShardId },
    /// Copies the source's ranges to a read replica. Ownership stays.
    Replicate { source: ShardId, target: ShardId },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Split { .. } => "split",
            OperationKind::Merge { .. } => "merge",
            OperationKind::Move { .. } => "move",
            OperationKind::Replicate { .. } => "replicate",
        }
    }

    pub fn source(&self) -> &ShardId {
        match self {
            OperationKind::Split { source, .. }
            | OperationKind::Merge { source, .. }
            | OperationKind::Move { source, .. }
            | OperationKind::Replicate { source, .. } => source,
        }
    }

    /// Shard receiving the data.
    pub fn target(&self) -> &ShardId {
        match self {
            OperationKind::Split { new_shard, .. } => new_shard,
            OperationKind::Merge { target, .. }
            | OperationKind::Move { target, .. }
            | OperationKind::Replicate { target, .. } => target,
        }
    }

    /// Whether ring ownership changes on commit.
    pub fn transfers_ownership(&self) -> bool {
        !matches!(self, OperationKind::Replicate { .. })
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.name(), self.source(), self.target())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    MarkMigrating,
    CopyData,
    Commit,
    Finalize,
}

impl Phase {
    /// Progress reached once the phase is entered.
    pub(crate) fn progress(self) -> f64 {
        match self {
            Phase::MarkMigrating => 0.0,
            Phase::CopyData => 0.25,
            Phase::Commit => 0.5,
            Phase::Finalize => 0.75,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::MarkMigrating => "mark_migrating",
            Phase::CopyData => "copy_data",
            Phase::Commit => "commit",
            Phase::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum OperationStatus {
    Planned,
    Executing { phase: Phase },
    Completed,
    Failed { reason: String },
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Completed | OperationStatus::Failed { .. })
    }
}

/// Operation tracked by the rebalancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    /// Virtual nodes taking part, in ring order.
    pub tokens: Vec<Position>,
    /// Ranges covered by `tokens` when the operation was created.
    pub ranges: Vec<KeyRange>,
    pub status: OperationStatus,
    /// Completed fraction, `0.0..=1.0`.
    pub progress: f64,
    /// Set once ownership has been flipped; the operation can no longer be
    /// cancelled afterwards.
    pub committed: bool,
}

impl RebalanceOperation {
    pub(crate) fn new(id: OperationId, kind: OperationKind, tokens: Vec<Position>, ranges: Vec<KeyRange>) -> Self {
        Self {
            id,
            kind,
            tokens,
            ranges,
            status: OperationStatus::Planned,
            progress: 0.0,
            committed: false,
        }
    }

    pub(crate) fn enter(&mut self, phase: Phase) {
        self.status = OperationStatus::Executing { phase };
        self.progress = phase.progress();
    }

    pub(crate) fn complete(&mut self) {
        self.status = OperationStatus::Completed;
        self.progress = 1.0;
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>) {
        self.status = OperationStatus::Failed {
            reason: reason.into(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_accessors() {
        let split = OperationKind::Split {
            source: "s1".into(),
            new_shard: "s1-s1".into(),
        };
        assert_eq!(split.source().as_str(), "s1");
        assert_eq!(split.target().as_str(), "s1-s1");
        assert!(split.transfers_ownership());
        assert_eq!(split.to_string(), "split s1 -> s1-s1");

        let replicate = OperationKind::Replicate {
            source: "s1".into(),
            target: "s2".into(),
        };
        assert!(!replicate.transfers_ownership());
    }

    #[test]
    fn status_transitions() {
        let kind = OperationKind::Move {
            source: "a".into(),
            target: "b".into(),
        };
        let mut op = RebalanceOperation::new(OperationId(7), kind, vec![1, 2], Vec::new());
        assert_eq!(op.id.to_string(), "op-7");
        assert!(!op.status.is_terminal());

        op.enter(Phase::Commit);
        assert_eq!(op.status, OperationStatus::Executing { phase: Phase::Commit });
        assert_eq!(op.progress, 0.5);

        op.complete();
        assert!(op.status.is_terminal());
        assert_eq!(op.progress, 1.0);
    }
}
