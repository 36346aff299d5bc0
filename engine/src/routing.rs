//! Kernel routing collaborator and interface event contract.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use ipnet::IpNet;

/// A configured kernel route steering packets carrying a mark to a target IP.
#[async_trait]
pub trait Route: Send + Sync + fmt::Debug {
    /// Whether the route is still present and functioning in the kernel.
    async fn verify(&self) -> bool;

    async fn delete(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait RouteManager: Send + Sync {
    async fn new_route(&self, ip: IpNet, mark: u32) -> anyhow::Result<Box<dyn Route>>;

    /// Delivers created/deleted events for interfaces whose name starts with `prefix`.
    fn subscribe(&self, prefix: &str, subscriber: Arc<dyn InterfaceEventSubscriber>);

    fn unsubscribe(&self, prefix: &str, subscriber: &Arc<dyn InterfaceEventSubscriber>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
}

impl Interface {
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
        }
    }
}

pub trait InterfaceEventSubscriber: Send + Sync {
    fn on_interface_created(&self, iface: &Interface);

    fn on_interface_deleted(&self, iface: &Interface);
}
