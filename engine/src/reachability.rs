//! Advisory reachability logging for target IPs.
//!
//! Implementations must not block; the engine never waits on or fails
//! because of them.

use std::net::IpAddr;

use tracing::debug;

pub trait ReachabilityLogger: Send + Sync {
    fn register(&self, ips: &[IpAddr]);

    fn unregister(&self, ips: &[IpAddr]);
}

/// Writes registrations to the debug log and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReachability;

impl ReachabilityLogger for TracingReachability {
    fn register(&self, ips: &[IpAddr]) {
        debug!(?ips, "Reachability logging registered");
    }

    fn unregister(&self, ips: &[IpAddr]) {
        debug!(?ips, "Reachability logging unregistered");
    }
}
