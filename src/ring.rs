pub mod interval;
pub mod vnode;

use {
    crate::{
        error::{ConfigError, ConfigResult, RingError, RingResult},
        hash::{self, Position},
        shard::ShardId,
    },
    std::collections::BTreeMap,
};

pub use {
    interval::{Interval, KeyRange},
    vnode::{VirtualNode, VirtualNodeId, VirtualNodeStatus},
};

/// Range of the ring with its owning shard.
pub type ShardInterval = Interval<ShardId>;

/// Probes per virtual node before giving up on finding a free position.
const MAX_TOKEN_ATTEMPTS: u32 = 16;

/// Consistent hash ring.
///
/// Virtual nodes are kept sorted by their ring position (token). A key is
/// owned by the first virtual node at or after the key's position, wrapping
/// around to the first node on the ring.
///
/// Every position of the `u64` space is owned by exactly one virtual node as
/// long as the ring is not empty, so there is neither a gap nor an overlap
/// to maintain explicitly: ranges are derived from neighbouring tokens.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    nodes: BTreeMap<Position, VirtualNode>,

    /// Number of virtual nodes currently owned by each shard.
    owners: BTreeMap<ShardId, usize>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring position of a key.
    pub fn hash(input: &str) -> Position {
        hash::hash(input)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of distinct shards owning at least one virtual node.
    pub fn shard_count(&self) -> usize {
        self.owners.len()
    }

    pub fn shards(&self) -> impl Iterator<Item = &ShardId> {
        self.owners.keys()
    }

    pub fn contains_shard(&self, shard: &ShardId) -> bool {
        self.owners.contains_key(shard)
    }

    /// Virtual nodes in ring order.
    pub fn virtual_nodes(&self) -> impl Iterator<Item = &VirtualNode> {
        self.nodes.values()
    }

    /// Inserts a virtual node at its token.
    pub fn add_node(&mut self, node: VirtualNode) -> RingResult<()> {
        if let Some(existing) = self.nodes.get(&node.token) {
            return Err(RingError::TokenOccupied {
                token: node.token,
                owner: existing.shard.clone(),
            });
        }
        self.insert_node(node);
        Ok(())
    }

    fn insert_node(&mut self, node: VirtualNode) {
        *self.owners.entry(node.shard.clone()).or_insert(0) += 1;
        self.nodes.insert(node.token, node);
    }

    /// Places a batch of `count` virtual nodes for a shard.
    ///
    /// Tokens are derived from the shard id and the node ordinal, so the same
    /// shard lands on the same positions on every process. On the (very
    /// unlikely) collision with an existing token, a new position is probed.
    /// Nothing is inserted unless the whole batch fits.
    pub fn add_shard(&mut self, shard: &ShardId, count: u32, weight: u32) -> ConfigResult<()> {
        let mut batch = Vec::with_capacity(count as usize);
        let mut taken = std::collections::BTreeSet::new();
        for ordinal in 0..count {
            let token = (0..MAX_TOKEN_ATTEMPTS)
                .map(|attempt| Self::hash(&VirtualNode::token_seed(shard, ordinal, attempt)))
                .find(|token| !self.nodes.contains_key(token) && !taken.contains(token))
                .ok_or_else(|| ConfigError::TokenSpaceExhausted {
                    shard: shard.clone(),
                    ordinal,
                })?;
            taken.insert(token);
            batch.push(VirtualNode::new(shard.clone(), ordinal, token, weight));
        }

        for node in batch {
            self.insert_node(node);
        }
        Ok(())
    }

    /// Removes every virtual node owned by the shard.
    ///
    /// Returns the number of removed virtual nodes. Ranges of removed nodes
    /// are absorbed by their clockwise successors.
    pub fn remove_node(&mut self, shard: &ShardId) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| &node.shard != shard);
        self.owners.remove(shard);
        before - self.nodes.len()
    }

    /// Returns up to `count` distinct shards responsible for the key.
    ///
    /// The first shard is the primary owner, the rest are replica candidates
    /// in ring order. An empty ring yields an empty list.
    pub fn get_nodes(&self, key: &str, count: usize) -> Vec<ShardId> {
        self.get_nodes_at(Self::hash(key), count)
    }

    /// Same as [`get_nodes()`](Self::get_nodes), for a precomputed position.
    pub fn get_nodes_at(&self, position: Position, count: usize) -> Vec<ShardId> {
        let wanted = count.min(self.owners.len());
        let mut shards: Vec<ShardId> = Vec::with_capacity(wanted);
        if wanted == 0 {
            return shards;
        }

        let walk = self
            .nodes
            .range(position..)
            .chain(self.nodes.range(..position));
        for (_, node) in walk {
            if !shards.contains(&node.shard) {
                shards.push(node.shard.clone());
                if shards.len() == wanted {
                    break;
                }
            }
        }
        shards
    }

    /// Virtual node owning the position.
    pub fn owner(&self, position: Position) -> Option<&VirtualNode> {
        self.nodes
            .range(position..)
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, node)| node)
    }

    /// Shard owning the key.
    pub fn primary(&self, key: &str) -> Option<&ShardId> {
        self.owner(Self::hash(key)).map(|node| &node.shard)
    }

    pub fn node(&self, token: Position) -> Option<&VirtualNode> {
        self.nodes.get(&token)
    }

    /// Token of the virtual node preceding `token` on the ring.
    fn predecessor(&self, token: Position) -> Option<Position> {
        self.nodes
            .range(..token)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(pos, _)| *pos)
    }

    /// Ranges owned by the virtual node at `token`.
    pub fn node_ranges(&self, token: Position) -> Vec<KeyRange> {
        if !self.nodes.contains_key(&token) {
            return Vec::new();
        }
        match self.predecessor(token) {
            Some(prev) => KeyRange::arc(prev, token),
            None => Vec::new(),
        }
    }

    /// Tokens of the virtual nodes owned by the shard, in ring order.
    pub fn shard_tokens(&self, shard: &ShardId) -> Vec<Position> {
        self.nodes
            .values()
            .filter(|node| &node.shard == shard)
            .map(|node| node.token)
            .collect()
    }

    /// Returns `[start..end)` ranges of the ring owned by the shard.
    ///
    /// Whenever the shard owns nothing, `None` is returned.
    pub fn intervals(&self, shard: &ShardId) -> Option<Vec<KeyRange>> {
        if !self.contains_shard(shard) {
            return None;
        }
        let mut ranges: Vec<KeyRange> = self
            .shard_tokens(shard)
            .into_iter()
            .flat_map(|token| self.node_ranges(token))
            .collect();
        ranges.sort();
        Some(ranges)
    }

    /// All ranges of the ring with their owners, sorted by range start.
    pub fn ranges(&self) -> Vec<ShardInterval> {
        let mut ranges: Vec<ShardInterval> = self
            .nodes
            .values()
            .flat_map(|node| {
                self.node_ranges(node.token)
                    .into_iter()
                    .map(|range| Interval::new(range, node.shard.clone()))
            })
            .collect();
        ranges.sort_by_key(|interval| interval.key_range().start());
        ranges
    }

    /// Fraction of the hash space owned by the shard.
    pub fn load_share(&self, shard: &ShardId) -> f64 {
        let owned: u128 = self
            .intervals(shard)
            .unwrap_or_default()
            .iter()
            .map(KeyRange::width)
            .sum();
        owned as f64 / (1u128 << 64) as f64
    }

    /// Hands ownership of the given virtual nodes to `target`.
    ///
    /// Ranges stay exactly where they are, only their owner changes. The
    /// whole batch is rejected if any token is unknown.
    pub fn reassign(&mut self, tokens: &[Position], target: &ShardId) -> RingResult<()> {
        if let Some(missing) = tokens.iter().find(|t| !self.nodes.contains_key(t)) {
            return Err(RingError::UnknownToken(*missing));
        }
        for token in tokens {
            if let Some(node) = self.nodes.get_mut(token) {
                if &node.shard == target {
                    continue;
                }
                if let Some(count) = self.owners.get_mut(&node.shard) {
                    *count -= 1;
                    if *count == 0 {
                        self.owners.remove(&node.shard);
                    }
                }
                node.shard = target.clone();
                *self.owners.entry(target.clone()).or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Sets the status of the given virtual nodes.
    pub fn set_status(&mut self, tokens: &[Position], status: VirtualNodeStatus) -> RingResult<()> {
        if let Some(missing) = tokens.iter().find(|t| !self.nodes.contains_key(t)) {
            return Err(RingError::UnknownToken(*missing));
        }
        for token in tokens {
            if let Some(node) = self.nodes.get_mut(token) {
                node.status = status;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(shards: &[&str], vnodes: u32) -> HashRing {
        let mut ring = HashRing::new();
        for shard in shards {
            ring.add_shard(&ShardId::from(*shard), vnodes, 1).unwrap();
        }
        ring
    }

    fn assert_full_coverage(ring: &HashRing) {
        let ranges = ring.ranges();
        assert_eq!(ranges.first().map(|r| r.key_range().start()), Some(0));
        for pair in ranges.windows(2) {
            assert_eq!(
                pair[0].key_range().end(),
                Some(pair[1].key_range().start()),
                "Gap or overlap between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
        assert_eq!(ranges.last().and_then(|r| r.key_range().end()), None);
        let total: u128 = ranges.iter().map(|r| r.key_range().width()).sum();
        assert_eq!(total, 1u128 << 64);
    }

    #[test]
    fn empty_ring() {
        let ring = HashRing::new();
        assert!(ring.get_nodes("any-key", 3).is_empty());
        assert!(ring.owner(42).is_none());
        assert!(ring.ranges().is_empty());
    }

    #[test]
    fn lookups_are_deterministic() {
        let ring = ring_with(&["s1", "s2", "s3"], 64);
        for i in 0..500 {
            let key = format!("account-{i}");
            assert_eq!(ring.get_nodes(&key, 1), ring.get_nodes(&key, 1));
            assert_eq!(ring.get_nodes(&key, 1)[0], *ring.primary(&key).unwrap());
        }
    }

    #[test]
    fn replica_candidates_are_distinct() {
        let ring = ring_with(&["s1", "s2", "s3"], 32);
        let nodes = ring.get_nodes("order-7", 5);
        assert_eq!(nodes.len(), 3);
        let mut dedup = nodes.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }

    #[test]
    fn coverage_survives_mutations() {
        let mut ring = ring_with(&["s1"], 1);
        assert_full_coverage(&ring);

        ring.add_shard(&"s2".into(), 17, 1).unwrap();
        ring.add_shard(&"s3".into(), 64, 1).unwrap();
        assert_full_coverage(&ring);

        ring.remove_node(&"s2".into());
        assert_full_coverage(&ring);

        let tokens = ring.shard_tokens(&"s3".into());
        ring.reassign(&tokens[..10], &"s1".into()).unwrap();
        assert_full_coverage(&ring);

        ring.remove_node(&"s1".into());
        assert_full_coverage(&ring);
        assert_eq!(ring.shard_count(), 1);
    }

    #[test]
    fn ranges_match_lookups() {
        let ring = ring_with(&["s1", "s2", "s3", "s4"], 16);
        for interval in ring.ranges() {
            let start = interval.key_range().start();
            assert_eq!(&ring.get_nodes_at(start, 1)[0], interval.owner());
        }
    }

    #[test]
    fn duplicate_token_rejected() {
        let mut ring = ring_with(&["s1"], 4);
        let token = ring.shard_tokens(&"s1".into())[0];
        let err = ring
            .add_node(VirtualNode::new("s2".into(), 0, token, 1))
            .unwrap_err();
        assert_eq!(
            err,
            RingError::TokenOccupied {
                token,
                owner: "s1".into()
            }
        );
        assert_eq!(ring.len(), 4);
        assert!(!ring.contains_shard(&"s2".into()));
    }

    #[test]
    fn batches_register_every_node() {
        let mut ring = ring_with(&["s1", "s2"], 16);
        ring.add_shard(&"s3".into(), 8, 2).unwrap();
        assert_eq!(ring.len(), 40);
        assert_eq!(ring.shard_count(), 3);
        assert_eq!(ring.shard_tokens(&"s3".into()).len(), 8);
        assert!(
            ring.virtual_nodes()
                .filter(|node| node.shard.as_str() == "s3")
                .all(|node| node.weight == 2)
        );

        assert_eq!(ring.remove_node(&"s3".into()), 8);
        assert_eq!(ring.shard_count(), 2);
        assert_full_coverage(&ring);
    }

    #[test]
    fn reassign_moves_ownership_only() {
        let mut ring = ring_with(&["s1", "s2"], 8);
        let tokens = ring.shard_tokens(&"s1".into());
        let ranges_before = ring.node_ranges(tokens[0]);

        ring.reassign(&tokens[..1], &"s2".into()).unwrap();
        assert_eq!(ring.node(tokens[0]).unwrap().shard, ShardId::from("s2"));
        assert_eq!(ring.node_ranges(tokens[0]), ranges_before);
        assert_eq!(ring.shard_tokens(&"s1".into()).len(), 7);

        assert_eq!(
            ring.reassign(&[tokens[0].wrapping_add(1)], &"s2".into()),
            Err(RingError::UnknownToken(tokens[0].wrapping_add(1)))
        );

        // Handing over every node drops the shard from the owners.
        ring.reassign(&tokens[1..], &"s2".into()).unwrap();
        assert!(!ring.contains_shard(&"s1".into()));
        assert_eq!(ring.load_share(&"s2".into()), 1.0);
    }
}
