//! Contract of the external shared-memory classifier process.
//!
//! The classifier owns the consistent-hashing bucket table of a stream and
//! performs the per-packet forwarding decision; the engine only keeps its
//! table and flow set in sync.

use async_trait::async_trait;

use crate::flow::FlowSpec;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Creates the shared bucket table of `stream`, sized for `max_targets`.
    async fn create_bucket_table(&self, stream: &str, max_targets: u32) -> anyhow::Result<()>;

    async fn delete_bucket_table(&self, stream: &str) -> anyhow::Result<()>;

    /// Activates bucket `identifier` of `stream`, steering it to `value`.
    async fn activate(&self, stream: &str, identifier: u32, value: u32) -> anyhow::Result<()>;

    async fn deactivate(&self, stream: &str, identifier: u32, value: u32) -> anyhow::Result<()>;

    /// Creates or replaces flow `flow.name`, targeting `stream`.
    async fn upsert_flow(&self, stream: &str, flow: &FlowSpec) -> anyhow::Result<()>;

    async fn delete_flow(&self, stream: &str, name: &str) -> anyhow::Result<()>;
}
