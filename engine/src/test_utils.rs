//! In-memory collaborators for the engine's unit tests.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    net::IpAddr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Once,
    },
};

use async_trait::async_trait;
use futures::StreamExt;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    classifier::Classifier,
    flow::{FlowSpec, Protocol},
    load_balancer::{Collaborators, ForwardingObserver, LoadBalancer, LoadBalancerConfig},
    reachability::ReachabilityLogger,
    routing::{Interface, InterfaceEventSubscriber, Route, RouteManager},
    target::TargetEntry,
    watch::{FlowSource, SnapshotStream, StreamSource, StreamSpec, TargetRegistry},
};

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

pub fn net(raw: &str) -> IpNet {
    crate::target::parse_ip(raw).unwrap()
}

/// Valid single-port TCP flow towards 20.0.0.1.
pub fn flow_spec(name: &str, port: u16) -> FlowSpec {
    FlowSpec {
        name: name.to_string(),
        priority: 1,
        vips: vec![net("20.0.0.1/32")],
        source_subnets: Vec::new(),
        source_port_ranges: Vec::new(),
        destination_port_ranges: vec![port.to_string()],
        protocols: vec![Protocol::Tcp],
        byte_matches: Vec::new(),
    }
}

// ============================================================================
// Classifier
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierCall {
    CreateTable(String, u32),
    DeleteTable(String),
    Activate(u32, u32),
    Deactivate(u32, u32),
    UpsertFlow(String),
    DeleteFlow(String),
}

/// Records successful calls; failures are injected per operation.
#[derive(Default)]
pub struct FakeClassifier {
    calls: Mutex<Vec<ClassifierCall>>,
    active: Mutex<BTreeSet<(String, u32)>>,
    failing_activations: Mutex<BTreeSet<u32>>,
    fail_deactivations: AtomicBool,
    fail_flows: AtomicBool,
    fail_table: AtomicBool,
}

impl FakeClassifier {
    pub fn calls(&self) -> Vec<ClassifierCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Identifiers currently activated in the bucket table of `stream`.
    pub fn active(&self, stream: &str) -> Vec<u32> {
        self.active
            .lock()
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn fail_activate(&self, identifier: u32) {
        self.failing_activations.lock().insert(identifier);
    }

    pub fn allow_activate(&self, identifier: u32) {
        self.failing_activations.lock().remove(&identifier);
    }

    pub fn fail_deactivations(&self, fail: bool) {
        self.fail_deactivations.store(fail, Ordering::SeqCst);
    }

    pub fn fail_flows(&self, fail: bool) {
        self.fail_flows.store(fail, Ordering::SeqCst);
    }

    pub fn fail_table(&self, fail: bool) {
        self.fail_table.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: ClassifierCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn create_bucket_table(&self, stream: &str, max_targets: u32) -> anyhow::Result<()> {
        if self.fail_table.load(Ordering::SeqCst) {
            anyhow::bail!("shared memory unavailable");
        }
        self.record(ClassifierCall::CreateTable(stream.to_string(), max_targets));
        Ok(())
    }

    async fn delete_bucket_table(&self, stream: &str) -> anyhow::Result<()> {
        if self.fail_table.load(Ordering::SeqCst) {
            anyhow::bail!("shared memory unavailable");
        }
        self.record(ClassifierCall::DeleteTable(stream.to_string()));
        Ok(())
    }

    async fn activate(&self, stream: &str, identifier: u32, value: u32) -> anyhow::Result<()> {
        if self.failing_activations.lock().contains(&identifier) {
            anyhow::bail!("activation of {} refused", identifier);
        }
        self.active.lock().insert((stream.to_string(), identifier));
        self.record(ClassifierCall::Activate(identifier, value));
        Ok(())
    }

    async fn deactivate(&self, stream: &str, identifier: u32, value: u32) -> anyhow::Result<()> {
        if self.fail_deactivations.load(Ordering::SeqCst) {
            anyhow::bail!("deactivation of {} refused", identifier);
        }
        self.active.lock().remove(&(stream.to_string(), identifier));
        self.record(ClassifierCall::Deactivate(identifier, value));
        Ok(())
    }

    async fn upsert_flow(&self, _stream: &str, flow: &FlowSpec) -> anyhow::Result<()> {
        if self.fail_flows.load(Ordering::SeqCst) {
            anyhow::bail!("flow {} refused", flow.name);
        }
        self.record(ClassifierCall::UpsertFlow(flow.name.clone()));
        Ok(())
    }

    async fn delete_flow(&self, _stream: &str, name: &str) -> anyhow::Result<()> {
        if self.fail_flows.load(Ordering::SeqCst) {
            anyhow::bail!("flow {} refused", name);
        }
        self.record(ClassifierCall::DeleteFlow(name.to_string()));
        Ok(())
    }
}

// ============================================================================
// Routes
// ============================================================================

#[derive(Default)]
struct RouteState {
    next_id: u64,
    created: usize,
    live: BTreeMap<u64, IpNet>,
    broken: BTreeSet<u64>,
    failing: BTreeSet<IpNet>,
    subscribers: Vec<(String, Arc<dyn InterfaceEventSubscriber>)>,
}

/// Route manager keeping its "kernel" routes in memory.
#[derive(Clone, Default)]
pub struct FakeRoutes {
    state: Arc<Mutex<RouteState>>,
}

impl FakeRoutes {
    /// Route creation towards `ip` fails until cleared.
    pub fn fail_ip(&self, ip: &str) {
        self.state.lock().failing.insert(net(ip));
    }

    pub fn clear_failures(&self) {
        self.state.lock().failing.clear();
    }

    /// Marks the live routes towards `ip` as no longer verifying.
    pub fn break_ip(&self, ip: &str) {
        let ip = net(ip);
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .live
            .iter()
            .filter(|(_, net)| **net == ip)
            .map(|(id, _)| *id)
            .collect();
        state.broken.extend(ids);
    }

    pub fn live_routes(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_ips(&self) -> Vec<IpNet> {
        self.state.lock().live.values().copied().collect()
    }

    /// Total routes ever created.
    pub fn created_routes(&self) -> usize {
        self.state.lock().created
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn emit_created(&self, name: &str) {
        let iface = Interface::new(name, 7);
        for subscriber in self.matching(name) {
            subscriber.on_interface_created(&iface);
        }
    }

    pub fn emit_deleted(&self, name: &str) {
        let iface = Interface::new(name, 7);
        for subscriber in self.matching(name) {
            subscriber.on_interface_deleted(&iface);
        }
    }

    fn matching(&self, name: &str) -> Vec<Arc<dyn InterfaceEventSubscriber>> {
        self.state
            .lock()
            .subscribers
            .iter()
            .filter(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, s)| s.clone())
            .collect()
    }
}

#[async_trait]
impl RouteManager for FakeRoutes {
    async fn new_route(&self, ip: IpNet, mark: u32) -> anyhow::Result<Box<dyn Route>> {
        let mut state = self.state.lock();
        if state.failing.contains(&ip) {
            anyhow::bail!("no route to {} for mark {}", ip, mark);
        }
        state.next_id += 1;
        state.created += 1;
        let id = state.next_id;
        state.live.insert(id, ip);
        Ok(Box::new(FakeRoute {
            id,
            ip,
            state: self.state.clone(),
        }))
    }

    fn subscribe(&self, prefix: &str, subscriber: Arc<dyn InterfaceEventSubscriber>) {
        self.state
            .lock()
            .subscribers
            .push((prefix.to_string(), subscriber));
    }

    fn unsubscribe(&self, prefix: &str, subscriber: &Arc<dyn InterfaceEventSubscriber>) {
        self.state
            .lock()
            .subscribers
            .retain(|(p, s)| !(p == prefix && Arc::ptr_eq(s, subscriber)));
    }
}

struct FakeRoute {
    id: u64,
    ip: IpNet,
    state: Arc<Mutex<RouteState>>,
}

impl fmt::Debug for FakeRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeRoute")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .finish()
    }
}

#[async_trait]
impl Route for FakeRoute {
    async fn verify(&self) -> bool {
        let state = self.state.lock();
        state.live.contains_key(&self.id) && !state.broken.contains(&self.id)
    }

    async fn delete(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.broken.remove(&self.id);
        state.live.remove(&self.id);
        Ok(())
    }
}

// ============================================================================
// Snapshot watches
// ============================================================================

pub type SnapshotSender<T> = mpsc::UnboundedSender<anyhow::Result<Vec<T>>>;

/// Hands out queued snapshot channels, one per watch call and key.
/// A watch with nothing queued never yields.
pub struct FakeSnapshots<T> {
    queued: Mutex<BTreeMap<String, VecDeque<mpsc::UnboundedReceiver<anyhow::Result<Vec<T>>>>>>,
    watches: AtomicUsize,
}

impl<T> Default for FakeSnapshots<T> {
    fn default() -> Self {
        Self {
            queued: Mutex::new(BTreeMap::new()),
            watches: AtomicUsize::new(0),
        }
    }
}

impl<T: Send + 'static> FakeSnapshots<T> {
    /// Queues the channel served by the next watch on `key`.
    pub fn channel(&self, key: &str) -> SnapshotSender<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queued
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(rx);
        tx
    }

    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    fn watch(&self, key: &str) -> SnapshotStream<T> {
        self.watches.fetch_add(1, Ordering::SeqCst);
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
impl TargetRegistry for FakeSnapshots<TargetEntry> {
    async fn watch_targets(&self, stream: &str) -> anyhow::Result<SnapshotStream<TargetEntry>> {
        Ok(self.watch(stream))
    }
}

#[async_trait]
impl FlowSource for FakeSnapshots<FlowSpec> {
    async fn watch_flows(&self, stream: &str) -> anyhow::Result<SnapshotStream<FlowSpec>> {
        Ok(self.watch(stream))
    }
}

#[async_trait]
impl StreamSource for FakeSnapshots<StreamSpec> {
    async fn watch_streams(&self) -> anyhow::Result<SnapshotStream<StreamSpec>> {
        Ok(self.watch(""))
    }
}

/// Watch whose connection attempt never completes.
#[derive(Default)]
pub struct StalledWatch {
    connects: AtomicUsize,
}

impl StalledWatch {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    async fn stall<T>(&self) -> anyhow::Result<SnapshotStream<T>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        futures::future::pending().await
    }
}

#[async_trait]
impl TargetRegistry for StalledWatch {
    async fn watch_targets(&self, _stream: &str) -> anyhow::Result<SnapshotStream<TargetEntry>> {
        self.stall().await
    }
}

#[async_trait]
impl FlowSource for StalledWatch {
    async fn watch_flows(&self, _stream: &str) -> anyhow::Result<SnapshotStream<FlowSpec>> {
        self.stall().await
    }
}

#[async_trait]
impl StreamSource for StalledWatch {
    async fn watch_streams(&self) -> anyhow::Result<SnapshotStream<StreamSpec>> {
        self.stall().await
    }
}

// ============================================================================
// Observers
// ============================================================================

#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(String, bool)>>,
}

impl RecordingObserver {
    /// `(stream, forwarding)` transitions in order.
    pub fn events(&self) -> Vec<(String, bool)> {
        self.events.lock().clone()
    }
}

impl ForwardingObserver for RecordingObserver {
    fn forwarding_started(&self, stream: &str) {
        self.events.lock().push((stream.to_string(), true));
    }

    fn forwarding_stopped(&self, stream: &str) {
        self.events.lock().push((stream.to_string(), false));
    }
}

#[derive(Default)]
pub struct RecordingReachability {
    registered: Mutex<BTreeSet<IpAddr>>,
}

impl RecordingReachability {
    pub fn registered(&self) -> Vec<IpAddr> {
        self.registered.lock().iter().copied().collect()
    }
}

impl ReachabilityLogger for RecordingReachability {
    fn register(&self, ips: &[IpAddr]) {
        self.registered.lock().extend(ips.iter().copied());
    }

    fn unregister(&self, ips: &[IpAddr]) {
        let mut registered = self.registered.lock();
        for ip in ips {
            registered.remove(ip);
        }
    }
}

/// Fakes wired into a [`Collaborators`] set.
#[derive(Default)]
pub struct Harness {
    pub classifier: Arc<FakeClassifier>,
    pub routes: FakeRoutes,
    pub reachability: Arc<RecordingReachability>,
    pub registry: Arc<FakeSnapshots<TargetEntry>>,
    pub flows: Arc<FakeSnapshots<FlowSpec>>,
    pub observer: Arc<RecordingObserver>,
}

impl Harness {
    pub fn new() -> Self {
        init_test_logging();
        Self::default()
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            classifier: self.classifier.clone(),
            routes: Arc::new(self.routes.clone()),
            reachability: self.reachability.clone(),
            registry: self.registry.clone(),
            flows: self.flows.clone(),
            observer: Some(self.observer.clone()),
        }
    }

    pub fn load_balancer(&self, config: LoadBalancerConfig) -> LoadBalancer {
        LoadBalancer::new(config, self.collaborators())
    }
}
