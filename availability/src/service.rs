//! Forwarding availability broadcast
//!
//! One instance per node aggregates the forwarding state of every stream.
//! Watchers are told whenever the node flips between "no forwarding path"
//! and "at least one". Each watcher owns a single-slot notification channel;
//! a notification that finds the slot occupied is dropped, since the watcher
//! recomputes the current value when it drains the slot anyway.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use crate::{
    error::{AvailabilityError, AvailabilityResult},
    proto::{Descriptor, WatchResponse},
    strategy::{AvailabilityStrategy, LockedRead, PathRegistry, Registration},
};

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);
const WATCH_STREAM_BUFFER: usize = 4;

type Ack = oneshot::Sender<()>;

/// Destination of a watcher's responses.
#[async_trait]
pub trait WatchSink: Send + Sync {
    async fn deliver(&self, response: WatchResponse) -> AvailabilityResult<()>;
}

#[async_trait]
impl WatchSink for mpsc::Sender<Result<WatchResponse, Status>> {
    async fn deliver(&self, response: WatchResponse) -> AvailabilityResult<()> {
        self.send(Ok(response))
            .await
            .map_err(|_| AvailabilityError::SinkClosed)
    }
}

pub struct ForwardingAvailabilityService {
    paths: PathRegistry,
    strategy: Arc<dyn AvailabilityStrategy>,
    available: Descriptor,
    watchers: Mutex<HashMap<u64, mpsc::Sender<Ack>>>,
    next_watcher: AtomicU64,
    stop_timeout: Duration,
}

impl ForwardingAvailabilityService {
    /// `available` is the descriptor announced while any path forwards.
    pub fn new(available: Descriptor) -> Self {
        Self {
            paths: PathRegistry::default(),
            strategy: Arc::new(LockedRead),
            available,
            watchers: Mutex::new(HashMap::new()),
            next_watcher: AtomicU64::new(0),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_strategy(mut self, strategy: Arc<dyn AvailabilityStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn register(&self, name: &str) {
        match self.paths.insert(name) {
            Registration::Became => {
                info!(path = name, "First forwarding path registered, node available");
                self.notify();
            }
            Registration::Added => debug!(path = name, "Forwarding path registered"),
            Registration::Duplicate | Registration::Stopped => {}
        }
    }

    pub fn unregister(&self, name: &str) {
        if self.paths.remove(name) {
            info!(path = name, "Last forwarding path unregistered, node unavailable");
            self.notify();
        }
    }

    pub fn is_available(&self) -> bool {
        self.paths.is_available()
    }

    pub fn is_stopped(&self) -> bool {
        self.paths.is_stopped()
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.lock().len()
    }

    /// Owes every watcher one refresh. Never blocks.
    pub fn notify(&self) {
        let watchers: Vec<mpsc::Sender<Ack>> = self.watchers.lock().values().cloned().collect();
        for tx in watchers {
            let (ack, _) = oneshot::channel();
            // A full slot already owes the watcher a refresh.
            let _ = tx.try_send(ack);
        }
    }

    /// Delivers the current value to `sink`, then every change of it, until
    /// `cancel` fires or delivery fails.
    pub async fn watch<S>(&self, sink: &S, cancel: CancellationToken) -> AvailabilityResult<()>
    where
        S: WatchSink + ?Sized,
    {
        let (tx, mut notifications) = mpsc::channel::<Ack>(1);
        let attached = self.attach(tx);
        let watcher = attached.id;

        let mut last = self.strategy.evaluate(&self.paths).await;
        sink.deliver(self.response(last)).await?;
        debug!(watcher, available = last, "Watcher attached");

        loop {
            let ack = tokio::select! {
                _ = cancel.cancelled() => break,
                ack = notifications.recv() => match ack {
                    Some(ack) => ack,
                    None => break,
                },
            };

            let current = self.strategy.evaluate(&self.paths).await;
            if current != last {
                sink.deliver(self.response(current)).await?;
                debug!(watcher, available = current, "Availability delivered");
                last = current;
            }
            let _ = ack.send(());
        }

        debug!(watcher, "Watcher cancelled");
        Ok(())
    }

    /// Server-streaming form of [`Self::watch`]. Dropping the stream
    /// detaches the watcher.
    pub fn watch_stream(self: &Arc<Self>) -> ReceiverStream<Result<WatchResponse, Status>> {
        let (tx, rx) = mpsc::channel(WATCH_STREAM_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = service.watch(&tx, CancellationToken::new()) => {
                    if let Err(e) = result {
                        debug!(error = %e, "Watch stream ended");
                    }
                }
                _ = tx.closed() => debug!("Watch stream dropped by receiver"),
            }
        });
        ReceiverStream::new(rx)
    }

    /// Announces final unavailability and waits, bounded by the stop
    /// timeout, until every watcher has observed it. Idempotent.
    pub async fn stop(&self) {
        if !self.paths.stop() {
            return;
        }

        let watchers: Vec<mpsc::Sender<Ack>> = self.watchers.lock().values().cloned().collect();
        info!(watchers = watchers.len(), "Stopping availability service");

        let acks = watchers.into_iter().map(|tx| async move {
            let (ack, observed) = oneshot::channel();
            if tx.send(ack).await.is_ok() {
                let _ = observed.await;
            }
        });
        if tokio::time::timeout(self.stop_timeout, join_all(acks))
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.stop_timeout,
                "Not every watcher acknowledged the stop in time"
            );
        }
    }

    fn response(&self, available: bool) -> WatchResponse {
        if available {
            WatchResponse::single(self.available.clone())
        } else {
            WatchResponse::single(Descriptor::unavailable())
        }
    }

    fn attach(&self, tx: mpsc::Sender<Ack>) -> Attached<'_> {
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        self.watchers.lock().insert(id, tx);
        Attached { service: self, id }
    }
}

/// Detaches the watcher however its future ends.
struct Attached<'a> {
    service: &'a ForwardingAvailabilityService,
    id: u64,
}

impl Drop for Attached<'_> {
    fn drop(&mut self) {
        self.service.watchers.lock().remove(&self.id);
    }
}
