//! In-memory collaborators for node-level tests.

#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use futures::StreamExt;
use ipnet::IpNet;
use parking_lot::Mutex;
use slb::{
    engine::{
        Classifier, FlowSource, FlowSpec, InterfaceEventSubscriber, Route, RouteManager,
        SnapshotStream, StreamSource, StreamSpec, TargetEntry, TargetRegistry,
        TracingReachability,
    },
    NodeCollaborators,
};
use tokio::sync::mpsc;

#[derive(Default)]
pub struct MemoryClassifier {
    tables: Mutex<BTreeMap<String, u32>>,
    active: Mutex<BTreeSet<(String, u32)>>,
    flows: Mutex<BTreeSet<(String, String)>>,
}

impl MemoryClassifier {
    pub fn tables(&self) -> Vec<String> {
        self.tables.lock().keys().cloned().collect()
    }

    pub fn active(&self, stream: &str) -> Vec<u32> {
        self.active
            .lock()
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn flows(&self, stream: &str) -> Vec<String> {
        self.flows
            .lock()
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[async_trait]
impl Classifier for MemoryClassifier {
    async fn create_bucket_table(&self, stream: &str, max_targets: u32) -> anyhow::Result<()> {
        self.tables.lock().insert(stream.to_string(), max_targets);
        Ok(())
    }

    async fn delete_bucket_table(&self, stream: &str) -> anyhow::Result<()> {
        self.tables.lock().remove(stream);
        Ok(())
    }

    async fn activate(&self, stream: &str, identifier: u32, _value: u32) -> anyhow::Result<()> {
        self.active.lock().insert((stream.to_string(), identifier));
        Ok(())
    }

    async fn deactivate(&self, stream: &str, identifier: u32, _value: u32) -> anyhow::Result<()> {
        self.active.lock().remove(&(stream.to_string(), identifier));
        Ok(())
    }

    async fn upsert_flow(&self, stream: &str, flow: &FlowSpec) -> anyhow::Result<()> {
        self.flows
            .lock()
            .insert((stream.to_string(), flow.name.clone()));
        Ok(())
    }

    async fn delete_flow(&self, stream: &str, name: &str) -> anyhow::Result<()> {
        self.flows
            .lock()
            .remove(&(stream.to_string(), name.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryRoutes {
    live: Arc<Mutex<Vec<(IpNet, u32)>>>,
}

impl MemoryRoutes {
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }
}

#[derive(Debug)]
struct MemoryRoute {
    ip: IpNet,
    mark: u32,
    live: Arc<Mutex<Vec<(IpNet, u32)>>>,
}

#[async_trait]
impl Route for MemoryRoute {
    async fn verify(&self) -> bool {
        self.live.lock().contains(&(self.ip, self.mark))
    }

    async fn delete(&self) -> anyhow::Result<()> {
        let mut live = self.live.lock();
        if let Some(pos) = live.iter().position(|r| *r == (self.ip, self.mark)) {
            live.remove(pos);
        }
        Ok(())
    }
}

#[async_trait]
impl RouteManager for MemoryRoutes {
    async fn new_route(&self, ip: IpNet, mark: u32) -> anyhow::Result<Box<dyn Route>> {
        self.live.lock().push((ip, mark));
        Ok(Box::new(MemoryRoute {
            ip,
            mark,
            live: self.live.clone(),
        }))
    }

    fn subscribe(&self, _prefix: &str, _subscriber: Arc<dyn InterfaceEventSubscriber>) {}

    fn unsubscribe(&self, _prefix: &str, _subscriber: &Arc<dyn InterfaceEventSubscriber>) {}
}

pub type Sender<T> = mpsc::UnboundedSender<anyhow::Result<Vec<T>>>;

/// One queued channel per watch call and key; nothing queued never yields.
pub struct Snapshots<T> {
    queued: Mutex<BTreeMap<String, VecDeque<mpsc::UnboundedReceiver<anyhow::Result<Vec<T>>>>>>,
}

impl<T> Default for Snapshots<T> {
    fn default() -> Self {
        Self {
            queued: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T: Send + 'static> Snapshots<T> {
    pub fn channel(&self, key: &str) -> Sender<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queued
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    fn watch(&self, key: &str) -> SnapshotStream<T> {
        let next = self
            .queued
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(rx) => futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .boxed(),
            None => futures::stream::pending().boxed(),
        }
    }
}

#[async_trait]
impl TargetRegistry for Snapshots<TargetEntry> {
    async fn watch_targets(&self, stream: &str) -> anyhow::Result<SnapshotStream<TargetEntry>> {
        Ok(self.watch(stream))
    }
}

#[async_trait]
impl FlowSource for Snapshots<FlowSpec> {
    async fn watch_flows(&self, stream: &str) -> anyhow::Result<SnapshotStream<FlowSpec>> {
        Ok(self.watch(stream))
    }
}

#[async_trait]
impl StreamSource for Snapshots<StreamSpec> {
    async fn watch_streams(&self) -> anyhow::Result<SnapshotStream<StreamSpec>> {
        Ok(self.watch(""))
    }
}

#[derive(Default)]
pub struct Fakes {
    pub classifier: Arc<MemoryClassifier>,
    pub routes: Arc<MemoryRoutes>,
    pub registry: Arc<Snapshots<TargetEntry>>,
    pub flows: Arc<Snapshots<FlowSpec>>,
    pub streams: Arc<Snapshots<StreamSpec>>,
}

impl Fakes {
    pub fn collaborators(&self) -> NodeCollaborators {
        NodeCollaborators {
            classifier: self.classifier.clone(),
            routes: self.routes.clone(),
            reachability: Arc::new(TracingReachability),
            registry: self.registry.clone(),
            flows: self.flows.clone(),
            streams: self.streams.clone(),
        }
    }
}
