use rapidhash::v3::rapidhash_v3;

/// Position on the hash ring.
pub type Position = u64;

/// Hashes a string key onto the ring.
///
/// Relies on the rapidhash V3 algorithm with default seed and secrets, so the
/// output is portable across platforms and releases: ring placement computed
/// by one process is reproducible by any other.
pub fn hash(input: &str) -> Position {
    rapidhash_v3(input.as_bytes())
}
