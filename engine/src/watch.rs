//! Snapshot-delivering watch sources.
//!
//! Every message of these streams is the complete current filtered set, not
//! a delta; the engine diffs each one against its in-memory state.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::{flow::FlowSpec, target::TargetEntry};

pub type SnapshotStream<T> = BoxStream<'static, anyhow::Result<Vec<T>>>;

/// Target registry, filtered by stream and enabled status.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn watch_targets(&self, stream: &str) -> anyhow::Result<SnapshotStream<TargetEntry>>;
}

/// Configuration watch delivering the flows of a stream.
#[async_trait]
pub trait FlowSource: Send + Sync {
    async fn watch_flows(&self, stream: &str) -> anyhow::Result<SnapshotStream<FlowSpec>>;
}

/// A stream as announced by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub max_targets: u32,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, max_targets: u32) -> Self {
        Self {
            name: name.into(),
            max_targets,
        }
    }
}

/// Configuration watch delivering the streams this node serves.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn watch_streams(&self) -> anyhow::Result<SnapshotStream<StreamSpec>>;
}
