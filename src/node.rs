//! Process-level composition of one load-balancer node.
//!
//! Wires the stream manager to the node-wide availability service: a stream
//! that starts forwarding registers as a path, one that stops unregisters.

use std::sync::Arc;

use slb_availability::ForwardingAvailabilityService;
use slb_engine::{
    Classifier, Collaborators, FlowSource, ForwardingObserver, IdentifierOffsetGenerator,
    LbResult, ReachabilityLogger, RouteManager, StreamManager, StreamSource, TargetRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigResult, NodeConfig};

/// External systems a node is built on.
#[derive(Clone)]
pub struct NodeCollaborators {
    pub classifier: Arc<dyn Classifier>,
    pub routes: Arc<dyn RouteManager>,
    pub reachability: Arc<dyn ReachabilityLogger>,
    pub registry: Arc<dyn TargetRegistry>,
    pub flows: Arc<dyn FlowSource>,
    pub streams: Arc<dyn StreamSource>,
}

struct AvailabilityObserver(Arc<ForwardingAvailabilityService>);

impl ForwardingObserver for AvailabilityObserver {
    fn forwarding_started(&self, stream: &str) {
        self.0.register(stream);
    }

    fn forwarding_stopped(&self, stream: &str) {
        self.0.unregister(stream);
    }
}

pub struct Node {
    manager: StreamManager,
    availability: Arc<ForwardingAvailabilityService>,
    streams: Arc<dyn StreamSource>,
    cancel: CancellationToken,
}

impl Node {
    pub fn new(config: &NodeConfig, collab: NodeCollaborators) -> ConfigResult<Self> {
        config.validate()?;

        let availability = Arc::new(
            ForwardingAvailabilityService::new(config.descriptor())
                .with_stop_timeout(config.stop_timeout()),
        );
        let collaborators = Collaborators {
            classifier: collab.classifier,
            routes: collab.routes,
            reachability: collab.reachability,
            registry: collab.registry,
            flows: collab.flows,
            observer: Some(Arc::new(AvailabilityObserver(availability.clone()))),
        };
        let manager = StreamManager::new(
            Arc::new(IdentifierOffsetGenerator::new(config.identifier_offset_base)),
            collaborators,
            config.stream_defaults(),
        );

        Ok(Self {
            manager,
            availability,
            streams: collab.streams,
            cancel: CancellationToken::new(),
        })
    }

    pub fn availability(&self) -> &Arc<ForwardingAvailabilityService> {
        &self.availability
    }

    pub fn streams(&self) -> &StreamManager {
        &self.manager
    }

    /// Follows the stream configuration until [`Self::shutdown`] is called.
    pub async fn run(&self) -> LbResult<()> {
        info!("Node running");
        self.manager
            .watch_streams(self.streams.clone(), self.cancel.clone())
            .await
    }

    /// Announces unavailability to every watcher, then tears down all streams.
    pub async fn shutdown(&self) -> LbResult<()> {
        info!("Node shutting down");
        self.cancel.cancel();
        self.availability.stop().await;
        let result = self.manager.shutdown().await;
        if let Err(e) = &result {
            warn!(error = %e, "Stream teardown completed with errors");
        }
        result
    }
}
