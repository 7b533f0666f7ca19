use {
    crate::{
        hash::Position,
        ring::{HashRing, Interval, KeyRange},
        shard::ShardId,
    },
    std::collections::{BTreeMap, BTreeSet},
};

/// Ownership difference between two rings.
///
/// For every shard gaining ranges, lists the ranges it has to pull and the
/// shard currently holding them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationPlan {
    /// Target shard to `(range, source shard)` pairs, ranges in ring order.
    transfers: BTreeMap<ShardId, Vec<Interval<ShardId>>>,
}

impl MigrationPlan {
    /// Diffs `before` against `after`.
    ///
    /// Both rings are cut at the union of their tokens: inside each
    /// resulting arc neither ring changes owner, so comparing the owners of
    /// the arc's closing token is enough.
    pub fn between(before: &HashRing, after: &HashRing) -> Self {
        let mut transfers: BTreeMap<ShardId, Vec<Interval<ShardId>>> = BTreeMap::new();
        if before.is_empty() || after.is_empty() {
            return Self { transfers };
        }

        let cuts: BTreeSet<Position> = before
            .virtual_nodes()
            .chain(after.virtual_nodes())
            .map(|node| node.token)
            .collect();
        let Some(last) = cuts.last().copied() else {
            return Self { transfers };
        };

        let mut previous = last;
        for token in cuts {
            let from = before.owner(token).map(|node| &node.shard);
            let to = after.owner(token).map(|node| &node.shard);
            if let (Some(from), Some(to)) = (from, to)
                && from != to
            {
                let pending = transfers.entry(to.clone()).or_default();
                for range in KeyRange::arc(previous, token) {
                    pending.push(Interval::new(range, from.clone()));
                }
            }
            previous = token;
        }

        for pending in transfers.values_mut() {
            pending.sort_by_key(|interval| interval.key_range().start());
        }
        Self { transfers }
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    /// Shards receiving data.
    pub fn targets(&self) -> impl Iterator<Item = &ShardId> {
        self.transfers.keys()
    }

    /// Ranges the shard has to pull, with the shard holding each of them.
    pub fn pending_intervals(&self, target: &ShardId) -> impl Iterator<Item = &Interval<ShardId>> {
        self.transfers.get(target).into_iter().flatten()
    }

    /// Fraction of the hash space changing owner.
    pub fn moved_fraction(&self) -> f64 {
        let moved: u128 = self
            .transfers
            .values()
            .flatten()
            .map(|interval| interval.key_range().width())
            .sum();
        moved as f64 / (1u128 << 64) as f64
    }
}
