use {
    crate::hash::Position,
    serde::{Deserialize, Serialize},
};

/// A half-open range of ring positions.
///
/// Range bounded inclusively below and exclusively above i.e.
/// `[start..end)`. Ranges reaching the top of the hash space are
/// `Unbounded`, i.e. `[start..=u64::MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyRange {
    Bounded(Position, Position),
    Unbounded(Position),
}

impl KeyRange {
    /// The whole hash space.
    pub const FULL: KeyRange = KeyRange::Unbounded(0);

    /// Create a new key range from the given start and end positions.
    pub(crate) fn new(start: Position, end: Option<Position>) -> Self {
        match end {
            Some(end) => KeyRange::Bounded(start, end),
            None => KeyRange::Unbounded(start),
        }
    }

    /// Ranges covering the ring arc `(after..=upto]`, walking clockwise.
    ///
    /// An arc that crosses the top of the hash space is split in two pieces.
    /// When `after == upto` the arc covers the whole ring. Pieces are
    /// returned in ascending order of their start.
    pub fn arc(after: Position, upto: Position) -> Vec<KeyRange> {
        let inclusive = |start: Position, last: Position| {
            KeyRange::new(start, last.checked_add(1))
        };

        if after < upto {
            return vec![inclusive(after + 1, upto)];
        }

        let mut pieces = vec![inclusive(0, upto)];
        if after < Position::MAX {
            pieces.push(KeyRange::Unbounded(after + 1));
        }
        pieces
    }

    pub fn start(&self) -> Position {
        match self {
            KeyRange::Bounded(start, _) | KeyRange::Unbounded(start) => *start,
        }
    }

    /// Exclusive end, `None` when the range runs to the top of the space.
    pub fn end(&self) -> Option<Position> {
        match self {
            KeyRange::Bounded(_, end) => Some(*end),
            KeyRange::Unbounded(_) => None,
        }
    }

    /// Check if the given position is in the range.
    ///
    /// Note not the key itself, but the hash of the key provides the position
    /// within the ring.
    pub fn contains(&self, position: Position) -> bool {
        match self {
            KeyRange::Bounded(start, end) => position >= *start && position < *end,
            KeyRange::Unbounded(start) => position >= *start,
        }
    }

    /// Number of positions covered.
    pub fn width(&self) -> u128 {
        let end = self.end().map_or(1u128 << 64, u128::from);
        end.saturating_sub(u128::from(self.start()))
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0
    }

    /// Whether two ranges share at least one position.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        let end = |r: &KeyRange| r.end().map_or(1u128 << 64, u128::from);
        let start = |r: &KeyRange| u128::from(r.start());
        !self.is_empty()
            && !other.is_empty()
            && start(self) < end(other)
            && start(other) < end(self)
    }

    /// Splits the hash space into `count` near-equal consecutive ranges.
    pub fn partition(count: u32) -> Vec<KeyRange> {
        let count = u128::from(count.max(1));
        let span = (1u128 << 64) / count;
        (0..count)
            .map(|i| {
                let start = (i * span) as Position;
                if i + 1 == count {
                    KeyRange::Unbounded(start)
                } else {
                    KeyRange::Bounded(start, ((i + 1) * span) as Position)
                }
            })
            .collect()
    }
}

/// A range of the ring together with the party responsible for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval<O> {
    key_range: KeyRange,
    owner: O,
}

impl<O> Interval<O> {
    /// Creates a new interval with the given key range and owner.
    pub(crate) fn new(key_range: KeyRange, owner: O) -> Self {
        Self { key_range, owner }
    }

    /// Returns the key range of the interval.
    pub fn key_range(&self) -> &KeyRange {
        &self.key_range
    }

    /// Returns the owner of the interval.
    pub fn owner(&self) -> &O {
        &self.owner
    }
}
