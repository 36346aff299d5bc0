//! Node-level stream lifecycle.
//!
//! Turns stream snapshots from configuration into started and deleted
//! [`LoadBalancer`] instances, each with its own identifier offset.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    error::{LbError, LbResult, MultiError},
    id_offset::IdentifierOffsetGenerator,
    load_balancer::{
        Collaborators, LoadBalancer, LoadBalancerConfig, DEFAULT_INTERFACE_PREFIX,
        DEFAULT_PENDING_DEBOUNCE, DEFAULT_PENDING_RETRY_INTERVAL, DEFAULT_WATCH_RETRY_DELAY,
    },
    retry::{RetryError, RetryPolicy},
    watch::{StreamSource, StreamSpec},
};

/// Settings shared by every load balancer of the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDefaults {
    pub interface_prefix: String,
    pub pending_retry_interval: Duration,
    pub pending_debounce: Duration,
    pub watch_retry_delay: Duration,
}

impl Default for StreamDefaults {
    fn default() -> Self {
        Self {
            interface_prefix: DEFAULT_INTERFACE_PREFIX.to_string(),
            pending_retry_interval: DEFAULT_PENDING_RETRY_INTERVAL,
            pending_debounce: DEFAULT_PENDING_DEBOUNCE,
            watch_retry_delay: DEFAULT_WATCH_RETRY_DELAY,
        }
    }
}

impl StreamDefaults {
    fn config_for(&self, spec: &StreamSpec, offset: u32) -> LoadBalancerConfig {
        LoadBalancerConfig::new(&spec.name, spec.max_targets, offset)
            .with_interface_prefix(&self.interface_prefix)
            .with_pending_retry(self.pending_retry_interval, self.pending_debounce)
            .with_watch_retry_delay(self.watch_retry_delay)
    }
}

pub struct StreamManager {
    offsets: Arc<IdentifierOffsetGenerator>,
    collab: Collaborators,
    defaults: StreamDefaults,
    streams: Mutex<BTreeMap<String, LoadBalancer>>,
}

impl StreamManager {
    pub fn new(
        offsets: Arc<IdentifierOffsetGenerator>,
        collab: Collaborators,
        defaults: StreamDefaults,
    ) -> Self {
        Self {
            offsets,
            collab,
            defaults,
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn offsets(&self) -> &Arc<IdentifierOffsetGenerator> {
        &self.offsets
    }

    pub async fn streams(&self) -> Vec<String> {
        self.streams.lock().await.keys().cloned().collect()
    }

    pub async fn load_balancer(&self, stream: &str) -> Option<LoadBalancer> {
        self.streams.lock().await.get(stream).cloned()
    }

    /// Reconciles the running streams against a full snapshot. A failure
    /// on one stream never aborts the rest of the snapshot.
    pub async fn set_streams(&self, snapshot: Vec<StreamSpec>) -> LbResult<()> {
        let mut wanted: BTreeMap<String, StreamSpec> = BTreeMap::new();
        for spec in snapshot {
            if spec.name.is_empty() || spec.max_targets == 0 {
                warn!(stream = %spec.name, max_targets = spec.max_targets, "Skipping invalid stream");
                continue;
            }
            wanted.insert(spec.name.clone(), spec);
        }

        let mut streams = self.streams.lock().await;
        let mut errors = MultiError::new();

        let stale: Vec<String> = streams
            .iter()
            .filter(|(name, lb)| {
                !matches!(
                    wanted.get(*name),
                    Some(spec) if spec.max_targets == lb.config().max_targets
                )
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(lb) = streams.remove(&name) {
                errors.collect(self.remove_stream(lb).await);
            }
        }

        for (name, spec) in wanted {
            if streams.contains_key(&name) {
                continue;
            }
            match self.add_stream(&spec).await {
                Ok(lb) => {
                    streams.insert(name, lb);
                }
                Err(e) => {
                    warn!(stream = %name, error = %e, "Failed to start stream");
                    errors.push(e);
                }
            }
        }

        errors.into_result()
    }

    /// Follows the stream source until `cancel` fires.
    pub async fn watch_streams(
        &self,
        source: Arc<dyn StreamSource>,
        cancel: CancellationToken,
    ) -> LbResult<()> {
        let policy = RetryPolicy::new(self.defaults.watch_retry_delay, cancel.clone());
        let result = policy
            .run("stream watch", || {
                let source = source.clone();
                let cancel = cancel.clone();
                async move { self.watch_streams_once(source.as_ref(), &cancel).await }
            })
            .await;

        match result {
            Ok(()) | Err(RetryError::Cancelled) => {
                debug!("Stream watch stopped");
                Ok(())
            }
            Err(RetryError::Permanent(e)) => Err(e),
        }
    }

    async fn watch_streams_once(
        &self,
        source: &dyn StreamSource,
        cancel: &CancellationToken,
    ) -> Result<(), backoff::Error<LbError>> {
        let mut snapshots = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            snapshots = source.watch_streams() => snapshots.map_err(stream_watch_error)?,
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = snapshots.next() => next,
            };
            match next {
                Some(Ok(specs)) => {
                    debug!(streams = specs.len(), "Received stream snapshot");
                    if let Err(e) = self.set_streams(specs).await {
                        warn!(error = %e, "Stream reconciliation completed with errors");
                    }
                }
                Some(Err(source)) => return Err(stream_watch_error(source)),
                None => {
                    return Err(stream_watch_error(anyhow::anyhow!("stream watch ended")));
                }
            }
        }
    }

    /// Deletes every stream and releases its offset.
    pub async fn shutdown(&self) -> LbResult<()> {
        let mut streams = self.streams.lock().await;
        let mut errors = MultiError::new();
        for (_, lb) in std::mem::take(&mut *streams) {
            errors.collect(self.remove_stream(lb).await);
        }
        info!("All streams shut down");
        errors.into_result()
    }

    async fn add_stream(&self, spec: &StreamSpec) -> LbResult<LoadBalancer> {
        let offset = self.offsets.generate(&spec.name, spec.max_targets)?;
        let lb = LoadBalancer::new(
            self.defaults.config_for(spec, offset),
            self.collab.clone(),
        );
        if let Err(e) = lb.start().await {
            self.offsets.release(&spec.name);
            return Err(e);
        }
        info!(
            stream = %spec.name,
            max_targets = spec.max_targets,
            offset,
            "Stream added"
        );
        Ok(lb)
    }

    async fn remove_stream(&self, lb: LoadBalancer) -> LbResult<()> {
        let result = lb.delete().await;
        self.offsets.release(lb.stream());
        info!(stream = %lb.stream(), "Stream removed");
        result
    }
}

fn stream_watch_error(source: anyhow::Error) -> backoff::Error<LbError> {
    backoff::Error::transient(LbError::Watch {
        stream: "*".to_string(),
        source,
    })
}
