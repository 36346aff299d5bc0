//! Per-stream load balancer
//!
//! Keeps the classifier's bucket table, the kernel routes and the flow set of
//! one stream in sync with the target registry and configuration watches.
//!
//! Lifecycle: `Created -> Running -> Stopped`. While running, three tasks are
//! scheduled: the target watch, the flow watch and the pending-target retry
//! loop. Every mutation of the stream's tables happens under one lock.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use futures::StreamExt;
use ipnet::IpNet;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    classifier::Classifier,
    error::{LbError, LbResult, MultiError},
    flow::{Flow, FlowSpec},
    reachability::ReachabilityLogger,
    retry::{RetryError, RetryPolicy},
    routing::{Interface, InterfaceEventSubscriber, RouteManager},
    target::{Target, TargetEntry},
    watch::{FlowSource, TargetRegistry},
};

pub const DEFAULT_PENDING_RETRY_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PENDING_DEBOUNCE: Duration = Duration::from_millis(100);
pub const DEFAULT_WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_INTERFACE_PREFIX: &str = "nfqlb";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerConfig {
    pub stream: String,
    pub max_targets: u32,
    /// Identifier offset of the stream, see [`crate::IdentifierOffsetGenerator`].
    pub offset: u32,
    /// Name prefix of the classifier-facing interfaces of this node.
    pub interface_prefix: String,
    pub pending_retry_interval: Duration,
    pub pending_debounce: Duration,
    pub watch_retry_delay: Duration,
}

impl LoadBalancerConfig {
    pub fn new(stream: impl Into<String>, max_targets: u32, offset: u32) -> Self {
        Self {
            stream: stream.into(),
            max_targets,
            offset,
            interface_prefix: DEFAULT_INTERFACE_PREFIX.to_string(),
            pending_retry_interval: DEFAULT_PENDING_RETRY_INTERVAL,
            pending_debounce: DEFAULT_PENDING_DEBOUNCE,
            watch_retry_delay: DEFAULT_WATCH_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_interface_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.interface_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_pending_retry(mut self, interval: Duration, debounce: Duration) -> Self {
        self.pending_retry_interval = interval;
        self.pending_debounce = debounce;
        self
    }

    #[must_use]
    pub fn with_watch_retry_delay(mut self, delay: Duration) -> Self {
        self.watch_retry_delay = delay;
        self
    }
}

/// Receives per-stream forwarding transitions. A stream forwards while it
/// has at least one active target.
pub trait ForwardingObserver: Send + Sync {
    fn forwarding_started(&self, stream: &str);

    fn forwarding_stopped(&self, stream: &str);
}

/// External collaborators shared by the load balancers of a node.
#[derive(Clone)]
pub struct Collaborators {
    pub classifier: Arc<dyn Classifier>,
    pub routes: Arc<dyn RouteManager>,
    pub reachability: Arc<dyn ReachabilityLogger>,
    pub registry: Arc<dyn TargetRegistry>,
    pub flows: Arc<dyn FlowSource>,
    pub observer: Option<Arc<dyn ForwardingObserver>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

#[derive(Default)]
struct Tables {
    targets: BTreeMap<u32, Target>,
    pending: BTreeMap<u32, Target>,
    flows: BTreeMap<String, Flow>,
    forwarding: bool,
    /// Set once by `delete`; rejects every later mutation.
    closed: bool,
}

struct Inner {
    config: LoadBalancerConfig,
    collab: Collaborators,
    tables: Mutex<Tables>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    trigger_tx: mpsc::Sender<()>,
    trigger_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    subscriber: Arc<dyn InterfaceEventSubscriber>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<Inner>,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("config", &self.inner.config)
            .finish()
    }
}

impl LoadBalancer {
    pub fn new(config: LoadBalancerConfig, collab: Collaborators) -> Self {
        // Single slot: a full channel already owes the loop one pass.
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let subscriber: Arc<dyn InterfaceEventSubscriber> = Arc::new(InterfaceTrigger {
            stream: config.stream.clone(),
            prefix: config.interface_prefix.clone(),
            tx: trigger_tx.clone(),
        });

        Self {
            inner: Arc::new(Inner {
                config,
                collab,
                tables: Mutex::new(Tables::default()),
                lifecycle: Mutex::new(Lifecycle::Created),
                cancel: CancellationToken::new(),
                trigger_tx,
                trigger_rx: parking_lot::Mutex::new(Some(trigger_rx)),
                subscriber,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &LoadBalancerConfig {
        &self.inner.config
    }

    pub fn stream(&self) -> &str {
        &self.inner.config.stream
    }

    pub async fn state(&self) -> Lifecycle {
        *self.inner.lifecycle.lock().await
    }

    /// Subscriber that schedules a pending-target pass on interface events.
    pub fn interface_subscriber(&self) -> Arc<dyn InterfaceEventSubscriber> {
        self.inner.subscriber.clone()
    }

    /// Creates the classifier bucket table, subscribes to interface events
    /// and spawns the watch and retry loops.
    pub async fn start(&self) -> LbResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle != Lifecycle::Created {
            return Err(self.invalid_state(*lifecycle, "start"));
        }

        let config = &self.inner.config;
        self.inner
            .collab
            .classifier
            .create_bucket_table(&config.stream, config.max_targets)
            .await
            .map_err(|source| LbError::Classifier {
                stream: config.stream.clone(),
                op: "create bucket table",
                source,
            })?;

        self.inner
            .collab
            .routes
            .subscribe(&config.interface_prefix, self.inner.subscriber.clone());

        let Some(triggers) = self.inner.trigger_rx.lock().take() else {
            return Err(self.invalid_state(*lifecycle, "start"));
        };

        let tasks = vec![
            tokio::spawn(self.clone().run_target_watch()),
            tokio::spawn(self.clone().run_flow_watch()),
            tokio::spawn(self.clone().run_pending_loop(triggers)),
        ];
        self.inner.tasks.lock().extend(tasks);

        *lifecycle = Lifecycle::Running;
        info!(
            stream = %config.stream,
            max_targets = config.max_targets,
            offset = config.offset,
            "Load balancer started"
        );
        Ok(())
    }

    /// Stops the loops and tears down every target, flow and the bucket
    /// table. Every step is attempted regardless of earlier failures.
    pub async fn delete(&self) -> LbResult<()> {
        let mut lifecycle = self.inner.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        let was_running = *lifecycle == Lifecycle::Running;
        *lifecycle = Lifecycle::Stopped;
        drop(lifecycle);

        self.inner.cancel.cancel();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(stream = %self.stream(), error = %e, "Load balancer task failed");
            }
        }

        let mut errors = MultiError::new();
        {
            let mut tables = self.inner.tables.lock().await;
            tables.closed = true;
            tables.pending.clear();

            let identifiers: Vec<u32> = tables.targets.keys().copied().collect();
            for identifier in identifiers {
                if let Err(e) = self.remove_target_locked(&mut tables, identifier).await {
                    errors.push(LbError::for_target(self.stream(), identifier, e));
                }
            }

            let flows = std::mem::take(&mut tables.flows);
            for flow in flows.into_values() {
                errors.collect(flow.delete().await);
            }

            self.update_forwarding(&mut tables);
        }

        if was_running {
            if let Err(source) = self
                .inner
                .collab
                .classifier
                .delete_bucket_table(self.stream())
                .await
            {
                errors.push(LbError::Classifier {
                    stream: self.stream().to_string(),
                    op: "delete bucket table",
                    source,
                });
            }
            self.inner
                .collab
                .routes
                .unsubscribe(&self.inner.config.interface_prefix, &self.inner.subscriber);
        }

        if errors.is_empty() {
            info!(stream = %self.stream(), "Load balancer deleted");
        } else {
            warn!(
                stream = %self.stream(),
                errors = errors.len(),
                "Load balancer deleted with errors"
            );
        }
        errors.into_result()
    }

    /// Reconciles the stream against a full registry snapshot.
    pub async fn set_targets(&self, entries: Vec<TargetEntry>) -> LbResult<()> {
        let max_targets = self.inner.config.max_targets;
        let mut candidates: BTreeMap<u32, BTreeSet<IpNet>> = BTreeMap::new();
        for entry in &entries {
            match entry.parse(max_targets) {
                Ok((identifier, ips)) => {
                    candidates.insert(identifier, ips);
                }
                Err(e) => debug!(stream = %self.stream(), error = %e, "Skipping target entry"),
            }
        }

        let mut tables = self.inner.tables.lock().await;
        self.ensure_open(&tables, "set targets")?;
        let mut errors = MultiError::new();

        // Pending targets are never retried from here; the retry loop owns them.
        let pending: Vec<u32> = tables.pending.keys().copied().collect();
        for identifier in pending {
            let unchanged = match (candidates.get(&identifier), tables.pending.get(&identifier)) {
                (Some(ips), Some(target)) => target.same_ips(ips),
                _ => false,
            };
            if unchanged {
                candidates.remove(&identifier);
            } else {
                debug!(
                    stream = %self.stream(),
                    identifier,
                    "Discarding stale pending target"
                );
                tables.pending.remove(&identifier);
            }
        }

        let active: Vec<u32> = tables.targets.keys().copied().collect();
        for identifier in active {
            let unchanged = match (candidates.get(&identifier), tables.targets.get(&identifier)) {
                (Some(ips), Some(target)) => target.same_ips(ips),
                _ => false,
            };
            if unchanged {
                candidates.remove(&identifier);
                continue;
            }
            match self.remove_target_locked(&mut tables, identifier).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => errors.push(LbError::for_target(self.stream(), identifier, e)),
            }
        }

        for (identifier, ips) in candidates {
            let target = Target::new(identifier, ips, self.inner.config.offset);
            if let Err(e) = self.add_target_locked(&mut tables, target).await {
                errors.push(LbError::for_target(self.stream(), identifier, e));
            }
        }

        self.update_forwarding(&mut tables);
        errors.into_result()
    }

    pub async fn add_target(&self, target: Target) -> LbResult<()> {
        let mut tables = self.inner.tables.lock().await;
        self.ensure_open(&tables, "add target")?;
        let result = self.add_target_locked(&mut tables, target).await;
        self.update_forwarding(&mut tables);
        result
    }

    /// Returns [`LbError::NoSuchTarget`] when the identifier is not active.
    pub async fn remove_target(&self, identifier: u32) -> LbResult<()> {
        let mut tables = self.inner.tables.lock().await;
        self.ensure_open(&tables, "remove target")?;
        let result = self.remove_target_locked(&mut tables, identifier).await;
        self.update_forwarding(&mut tables);
        result
    }

    /// One pass of the pending-target retry loop: re-queue active targets
    /// whose routes no longer verify, then retry every pending target.
    pub async fn process_pending(&self) {
        let mut tables = self.inner.tables.lock().await;
        if tables.closed {
            return;
        }

        let active: Vec<u32> = tables.targets.keys().copied().collect();
        for identifier in active {
            let replacement = match tables.targets.get(&identifier) {
                Some(target) if !target.verify().await => target.reincarnate(),
                _ => continue,
            };
            warn!(
                stream = %self.stream(),
                identifier,
                "Target routes failed verification, re-queueing as pending"
            );
            if let Err(e) = self.remove_target_locked(&mut tables, identifier).await {
                warn!(
                    stream = %self.stream(),
                    identifier,
                    error = %e,
                    "Failed to remove unverified target"
                );
            }
            tables.pending.insert(identifier, replacement);
        }

        let pending = std::mem::take(&mut tables.pending);
        for (identifier, target) in pending {
            if let Err(e) = self.add_target_locked(&mut tables, target).await {
                debug!(
                    stream = %self.stream(),
                    identifier,
                    error = %e,
                    "Pending target still not configured"
                );
            }
        }

        self.update_forwarding(&mut tables);
    }

    /// Reconciles the flows of the stream against a full snapshot.
    pub async fn set_flows(&self, specs: Vec<FlowSpec>) -> LbResult<()> {
        let mut errors = MultiError::new();
        let mut incoming: BTreeMap<String, FlowSpec> = BTreeMap::new();
        for spec in specs {
            match spec.validate() {
                Ok(()) => {
                    incoming.insert(spec.name.clone(), spec);
                }
                Err(e) => {
                    warn!(stream = %self.stream(), flow = %spec.name, error = %e, "Rejecting flow");
                    errors.push(e);
                }
            }
        }

        let mut tables = self.inner.tables.lock().await;
        self.ensure_open(&tables, "set flows")?;

        let removed: Vec<String> = tables
            .flows
            .keys()
            .filter(|name| !incoming.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            let Some(flow) = tables.flows.remove(&name) else {
                continue;
            };
            if let Err(e) = flow.delete().await {
                warn!(stream = %self.stream(), flow = %name, error = %e, "Failed to delete flow");
                // Kept so the next snapshot retries the deletion.
                tables.flows.insert(name, flow);
                errors.push(e);
            }
        }

        for (name, spec) in incoming {
            match tables.flows.get_mut(&name) {
                Some(flow) => {
                    if let Err(e) = flow.update(spec).await {
                        warn!(stream = %self.stream(), flow = %name, error = %e, "Failed to update flow");
                        errors.push(e);
                    }
                }
                None => {
                    let classifier = self.inner.collab.classifier.clone();
                    match Flow::create(self.stream(), spec, classifier).await {
                        Ok(flow) => {
                            tables.flows.insert(name, flow);
                        }
                        Err(e) => {
                            warn!(stream = %self.stream(), flow = %name, error = %e, "Failed to create flow");
                            errors.push(e);
                        }
                    }
                }
            }
        }

        errors.into_result()
    }

    /// Schedules a pending-target pass; coalesces with one already owed.
    pub fn trigger_pending(&self) {
        let _ = self.inner.trigger_tx.try_send(());
    }

    pub async fn active_targets(&self) -> Vec<u32> {
        self.inner.tables.lock().await.targets.keys().copied().collect()
    }

    pub async fn pending_targets(&self) -> Vec<u32> {
        self.inner.tables.lock().await.pending.keys().copied().collect()
    }

    pub async fn target_ips(&self, identifier: u32) -> Option<BTreeSet<IpNet>> {
        let tables = self.inner.tables.lock().await;
        tables
            .targets
            .get(&identifier)
            .or_else(|| tables.pending.get(&identifier))
            .map(|t| t.ips().clone())
    }

    pub async fn flow_names(&self) -> Vec<String> {
        self.inner.tables.lock().await.flows.keys().cloned().collect()
    }

    pub async fn is_forwarding(&self) -> bool {
        self.inner.tables.lock().await.forwarding
    }

    async fn add_target_locked(&self, tables: &mut Tables, mut target: Target) -> LbResult<()> {
        let identifier = target.identifier();
        if tables.targets.contains_key(&identifier) {
            return Err(LbError::TargetAlreadyActive(identifier));
        }

        if let Err(e) = target.configure(self.inner.collab.routes.as_ref()).await {
            tables.pending.insert(identifier, target);
            return Err(e);
        }

        if let Err(source) = self
            .inner
            .collab
            .classifier
            .activate(self.stream(), identifier, target.mark())
            .await
        {
            if let Err(rollback) = target.delete_routes().await {
                warn!(
                    stream = %self.stream(),
                    identifier,
                    error = %rollback,
                    "Failed to roll back routes after activation failure"
                );
            }
            tables.pending.insert(identifier, target);
            return Err(LbError::Classifier {
                stream: self.stream().to_string(),
                op: "activate",
                source,
            });
        }

        tables.pending.remove(&identifier);
        self.inner.collab.reachability.register(&target.addresses());
        info!(
            stream = %self.stream(),
            identifier,
            mark = target.mark(),
            ips = ?target.ips(),
            "Target activated"
        );
        tables.targets.insert(identifier, target);
        Ok(())
    }

    async fn remove_target_locked(&self, tables: &mut Tables, identifier: u32) -> LbResult<()> {
        tables.pending.remove(&identifier);
        let Some(mut target) = tables.targets.remove(&identifier) else {
            return Err(LbError::NoSuchTarget(identifier));
        };

        self.inner
            .collab
            .reachability
            .unregister(&target.addresses());

        let mut errors = MultiError::new();
        if let Err(source) = self
            .inner
            .collab
            .classifier
            .deactivate(self.stream(), identifier, target.mark())
            .await
        {
            errors.push(LbError::Classifier {
                stream: self.stream().to_string(),
                op: "deactivate",
                source,
            });
        }
        errors.collect(target.delete_routes().await);

        info!(stream = %self.stream(), identifier, "Target removed");
        errors.into_result()
    }

    fn update_forwarding(&self, tables: &mut Tables) {
        let forwarding = !tables.targets.is_empty();
        if forwarding == tables.forwarding {
            return;
        }
        tables.forwarding = forwarding;
        info!(stream = %self.stream(), forwarding, "Forwarding state changed");
        if let Some(observer) = &self.inner.collab.observer {
            if forwarding {
                observer.forwarding_started(self.stream());
            } else {
                observer.forwarding_stopped(self.stream());
            }
        }
    }

    fn ensure_open(&self, tables: &Tables, op: &'static str) -> LbResult<()> {
        if tables.closed {
            return Err(self.invalid_state(Lifecycle::Stopped, op));
        }
        Ok(())
    }

    fn invalid_state(&self, state: Lifecycle, op: &'static str) -> LbError {
        LbError::InvalidState {
            stream: self.stream().to_string(),
            state: state.as_str(),
            op,
        }
    }

    #[instrument(name = "target_watch", skip_all, fields(stream = %self.inner.config.stream))]
    async fn run_target_watch(self) {
        let policy = RetryPolicy::new(self.inner.config.watch_retry_delay, self.inner.cancel.clone());
        let this = self.clone();
        let result = policy
            .run("target watch", move || {
                let this = this.clone();
                async move { this.watch_targets_once().await }
            })
            .await;
        self.log_watch_exit("target watch", result);
    }

    async fn watch_targets_once(&self) -> Result<(), backoff::Error<LbError>> {
        let connect = self.inner.collab.registry.watch_targets(self.stream());
        let mut snapshots = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Ok(()),
            snapshots = connect => snapshots.map_err(|source| self.watch_error(source))?,
        };

        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                next = snapshots.next() => next,
            };
            match next {
                Some(Ok(entries)) => {
                    debug!(entries = entries.len(), "Received target snapshot");
                    if let Err(e) = self.set_targets(entries).await {
                        warn!(error = %e, "Target reconciliation completed with errors");
                    }
                }
                Some(Err(source)) => return Err(self.watch_error(source)),
                None => return Err(self.watch_error(anyhow::anyhow!("target watch ended"))),
            }
        }
    }

    #[instrument(name = "flow_watch", skip_all, fields(stream = %self.inner.config.stream))]
    async fn run_flow_watch(self) {
        let policy = RetryPolicy::new(self.inner.config.watch_retry_delay, self.inner.cancel.clone());
        let this = self.clone();
        let result = policy
            .run("flow watch", move || {
                let this = this.clone();
                async move { this.watch_flows_once().await }
            })
            .await;
        self.log_watch_exit("flow watch", result);
    }

    async fn watch_flows_once(&self) -> Result<(), backoff::Error<LbError>> {
        let connect = self.inner.collab.flows.watch_flows(self.stream());
        let mut snapshots = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Ok(()),
            snapshots = connect => snapshots.map_err(|source| self.watch_error(source))?,
        };

        loop {
            let next = tokio::select! {
                _ = self.inner.cancel.cancelled() => return Ok(()),
                next = snapshots.next() => next,
            };
            match next {
                Some(Ok(specs)) => {
                    debug!(flows = specs.len(), "Received flow snapshot");
                    if let Err(e) = self.set_flows(specs).await {
                        warn!(error = %e, "Flow reconciliation completed with errors");
                    }
                }
                Some(Err(source)) => return Err(self.watch_error(source)),
                None => return Err(self.watch_error(anyhow::anyhow!("flow watch ended"))),
            }
        }
    }

    fn watch_error(&self, source: anyhow::Error) -> backoff::Error<LbError> {
        backoff::Error::transient(LbError::Watch {
            stream: self.stream().to_string(),
            source,
        })
    }

    fn log_watch_exit(&self, name: &str, result: Result<(), RetryError<LbError>>) {
        match result {
            Ok(()) | Err(RetryError::Cancelled) => debug!(watch = name, "Watch loop stopped"),
            Err(RetryError::Permanent(e)) => error!(watch = name, error = %e, "Watch loop failed"),
        }
    }

    #[instrument(name = "pending_loop", skip_all, fields(stream = %self.inner.config.stream))]
    async fn run_pending_loop(self, mut triggers: mpsc::Receiver<()>) {
        let config = &self.inner.config;
        let cancel = self.inner.cancel.clone();
        let mut ticker = tokio::time::interval(config.pending_retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                trigger = triggers.recv() => {
                    if trigger.is_none() {
                        break;
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(config.pending_debounce) => {}
                    }
                    while triggers.try_recv().is_ok() {}
                    ticker.reset();
                    debug!("Pending pass triggered by interface event");
                }
            }
            self.process_pending().await;
        }
        debug!("Pending loop stopped");
    }
}

/// Schedules a pending pass when a classifier-facing interface changes.
struct InterfaceTrigger {
    stream: String,
    prefix: String,
    tx: mpsc::Sender<()>,
}

impl InterfaceTrigger {
    fn trigger(&self, iface: &Interface, event: &str) {
        if !iface.name.starts_with(&self.prefix) {
            return;
        }
        debug!(
            stream = %self.stream,
            interface = %iface.name,
            event,
            "Interface event, scheduling pending pass"
        );
        let _ = self.tx.try_send(());
    }
}

impl InterfaceEventSubscriber for InterfaceTrigger {
    fn on_interface_created(&self, iface: &Interface) {
        self.trigger(iface, "created");
    }

    fn on_interface_deleted(&self, iface: &Interface) {
        self.trigger(iface, "deleted");
    }
}
