use {
    crate::{index::IndexCatalog, registry::ShardRegistry, ring::HashRing},
    parking_lot::{Mutex, RwLock},
    std::sync::Arc,
};

/// Immutable view of the cluster at one version.
///
/// The ring, the registry and index placement always change together: a
/// reader holding a snapshot never sees a ring that disagrees with the
/// registry it was published with.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    pub version: u64,
    pub ring: HashRing,
    pub registry: ShardRegistry,
    pub indexes: IndexCatalog,
}

impl Topology {
    pub fn new(registry: ShardRegistry) -> Self {
        Self {
            version: 0,
            ring: HashRing::new(),
            registry,
            indexes: IndexCatalog::new(),
        }
    }
}

/// Publication point for topology snapshots.
///
/// Readers grab the current `Arc` and work off it for the rest of the
/// decision. Writers are serialized and publish a modified copy.
#[derive(Debug, Default)]
pub struct TopologyHandle {
    current: RwLock<Arc<Topology>>,
    writer: Mutex<()>,
}

impl TopologyHandle {
    pub fn new(topology: Topology) -> Self {
        Self {
            current: RwLock::new(Arc::new(topology)),
            writer: Mutex::new(()),
        }
    }

    /// Current snapshot.
    pub fn load(&self) -> Arc<Topology> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version
    }

    /// Applies `change` to a copy of the current snapshot and publishes it
    /// under the next version.
    ///
    /// When `change` fails, nothing is published.
    pub fn update<T, E>(&self, change: impl FnOnce(&mut Topology) -> Result<T, E>) -> Result<T, E> {
        let _writer = self.writer.lock();
        let mut next = Topology::clone(&self.load());
        let out = change(&mut next)?;
        next.version += 1;
        *self.current.write() = Arc::new(next);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ConfigError, shard::ShardId},
    };

    #[test]
    fn failed_update_publishes_nothing() {
        let handle = TopologyHandle::default();
        let before = handle.load();

        let result: Result<(), ConfigError> = handle.update(|topology| {
            topology.ring.add_shard(&ShardId::from("s1"), 4, 1)?;
            Err(ConfigError::UnknownShard("s2".into()))
        });
        assert!(result.is_err());
        assert!(Arc::ptr_eq(&before, &handle.load()));
        assert!(handle.load().ring.is_empty());
    }

    #[test]
    fn readers_keep_their_snapshot() {
        let handle = TopologyHandle::default();
        let before = handle.load();

        handle
            .update(|topology| topology.ring.add_shard(&ShardId::from("s1"), 4, 1))
            .unwrap();

        assert_eq!(before.version, 0);
        assert!(before.ring.is_empty());
        assert_eq!(handle.version(), 1);
        assert_eq!(handle.load().ring.len(), 4);
    }
}
