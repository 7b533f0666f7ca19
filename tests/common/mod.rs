#![allow(dead_code)]

use {
    async_trait::async_trait,
    parking_lot::Mutex,
    shardwise::{
        DataCopier, Event, HealthProbe, KeyRange, Row, RouterConfig, Shard, ShardAccess, ShardConfig,
        ShardCoordinator, ShardError, ShardId, ShardRequest, Value,
        events::ChannelSink,
        shard::{ConnectionInfo, ShardCapacity, ShardLoad},
    },
    std::{
        collections::{BTreeMap, BTreeSet},
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
    },
    tokio::sync::{Notify, mpsc::UnboundedReceiver},
};

pub fn shard_config(id: &str, virtual_nodes: u32) -> ShardConfig {
    ShardConfig::new(
        id,
        "eu-west",
        ConnectionInfo::new(format!("{id}.db.internal"), 5432),
        ShardCapacity::new(100, 1 << 30, 1000),
    )
    .with_virtual_nodes(virtual_nodes)
}

pub fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

/// In-memory shards: rows are stored per `(shard, table)`.
#[derive(Clone, Default)]
pub struct FakeShards(Arc<ShardsInner>);

#[derive(Default)]
pub struct ShardsInner {
    rows: Mutex<BTreeMap<(ShardId, String), Vec<Row>>>,
    failing: Mutex<BTreeSet<ShardId>>,
    requests: Mutex<Vec<ShardRequest>>,
}

impl FakeShards {
    pub fn insert(&self, shard: &str, table: &str, row: Row) {
        self.0
            .rows
            .lock()
            .entry((ShardId::from(shard), table.to_string()))
            .or_default()
            .push(row);
    }

    pub fn fail(&self, shard: &str) {
        self.0.failing.lock().insert(ShardId::from(shard));
    }

    pub fn heal(&self, shard: &str) {
        self.0.failing.lock().remove(&ShardId::from(shard));
    }

    pub fn requests(&self) -> Vec<ShardRequest> {
        self.0.requests.lock().clone()
    }

    pub fn clear_requests(&self) {
        self.0.requests.lock().clear();
    }
}

#[async_trait]
impl ShardAccess for FakeShards {
    async fn execute(&self, request: ShardRequest) -> Result<Vec<Row>, ShardError> {
        self.0.requests.lock().push(request.clone());
        if self.0.failing.lock().contains(&request.shard) {
            return Err(ShardError::Unreachable(request.shard.to_string()));
        }
        // Without a table, the statement reads every table of the shard.
        let mut rows: Vec<Row> = self
            .0
            .rows
            .lock()
            .iter()
            .filter(|((shard, table), _)| {
                shard == &request.shard && request.table.as_ref().is_none_or(|t| t == table)
            })
            .flat_map(|(_, rows)| rows.iter().cloned())
            .collect();
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

/// Records copies; can be told to fail or to hold until released.
#[derive(Clone, Default)]
pub struct FakeCopier(Arc<CopierInner>);

#[derive(Default)]
pub struct CopierInner {
    fail: AtomicBool,
    hold: AtomicBool,
    started: Notify,
    release: Notify,
    copies: Mutex<Vec<(ShardId, ShardId, Vec<KeyRange>)>>,
}

impl FakeCopier {
    pub fn fail(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    pub fn hold(&self) {
        self.0.hold.store(true, Ordering::SeqCst);
    }

    /// Lets a held copy finish.
    pub fn release(&self) {
        self.0.hold.store(false, Ordering::SeqCst);
        self.0.release.notify_one();
    }

    /// Resolves once a copy has started.
    pub async fn started(&self) {
        self.0.started.notified().await
    }

    pub fn copies(&self) -> Vec<(ShardId, ShardId, Vec<KeyRange>)> {
        self.0.copies.lock().clone()
    }
}

#[async_trait]
impl DataCopier for FakeCopier {
    async fn copy(&self, source: &ShardId, target: &ShardId, ranges: &[KeyRange]) -> Result<(), ShardError> {
        self.0
            .copies
            .lock()
            .push((source.clone(), target.clone(), ranges.to_vec()));
        self.0.started.notify_one();
        if self.0.hold.load(Ordering::SeqCst) {
            self.0.release.notified().await;
        }
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(ShardError::Unreachable(target.to_string()));
        }
        Ok(())
    }
}

/// Every shard answers with an idle load.
#[derive(Clone, Default)]
pub struct IdleProbe;

#[async_trait]
impl HealthProbe for IdleProbe {
    async fn probe(&self, _shard: &Shard) -> Result<ShardLoad, ShardError> {
        Ok(ShardLoad::default())
    }
}

pub struct Harness {
    pub coordinator: ShardCoordinator,
    pub shards: FakeShards,
    pub copier: FakeCopier,
    pub events: UnboundedReceiver<Event>,
}

impl Harness {
    pub fn new(shards: &[&str], virtual_nodes: u32) -> Self {
        Self::with_config(RouterConfig::default(), shards, virtual_nodes)
    }

    pub fn with_config(config: RouterConfig, shards: &[&str], virtual_nodes: u32) -> Self {
        let (sink, events) = ChannelSink::new();
        let fake_shards = FakeShards::default();
        let copier = FakeCopier::default();
        let coordinator = ShardCoordinator::builder(config)
            .with_event_sink(sink)
            .with_shard_access(fake_shards.clone())
            .with_data_copier(copier.clone())
            .with_health_probe(IdleProbe)
            .with_shards(shards.iter().map(|id| shard_config(id, virtual_nodes)))
            .build()
            .unwrap();
        let mut harness = Self {
            coordinator,
            shards: fake_shards,
            copier,
            events,
        };
        harness.drain_events();
        harness
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Sets QPS utilization of each shard, in `shards` order.
    pub fn set_utilization(&self, loads: &[(&str, f64)]) {
        let loads: Vec<(ShardId, ShardLoad)> = loads
            .iter()
            .map(|(id, util)| {
                let load = ShardLoad {
                    connections: 10,
                    qps: (util * 1000.0).round() as u32,
                    used_storage: 0,
                };
                (ShardId::from(*id), load)
            })
            .collect();
        self.coordinator.router().update_loads(&loads);
    }
}
