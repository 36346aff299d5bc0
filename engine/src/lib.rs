//! Control-plane engine of a stateless load-balancer node
//!
//! For every configured stream this crate keeps three external systems in
//! sync with the target registry and the flow configuration:
//! - the classifier's consistent-hashing bucket table
//! - kernel routes steering marked packets to target IPs
//! - the classifier's flow selectors
//!
//! Targets that cannot be configured are parked as pending and retried by a
//! periodic, interface-event-driven loop.

pub mod classifier;
pub mod error;
pub mod flow;
pub mod id_offset;
pub mod load_balancer;
pub mod reachability;
pub mod retry;
pub mod routing;
pub mod stream_manager;
pub mod target;
pub mod watch;

#[cfg(test)]
mod test_utils;

pub use classifier::Classifier;
pub use error::{LbError, LbResult, MultiError};
pub use flow::{Flow, FlowSpec, Protocol};
pub use id_offset::{IdentifierOffsetGenerator, OffsetError};
pub use load_balancer::{
    Collaborators, ForwardingObserver, Lifecycle, LoadBalancer, LoadBalancerConfig,
    DEFAULT_INTERFACE_PREFIX, DEFAULT_PENDING_DEBOUNCE, DEFAULT_PENDING_RETRY_INTERVAL,
    DEFAULT_WATCH_RETRY_DELAY,
};
pub use reachability::{ReachabilityLogger, TracingReachability};
pub use retry::{RetryError, RetryPolicy};
pub use routing::{Interface, InterfaceEventSubscriber, Route, RouteManager};
pub use stream_manager::{StreamDefaults, StreamManager};
pub use target::{Target, TargetEntry, TargetStatus};
pub use watch::{FlowSource, SnapshotStream, StreamSource, StreamSpec, TargetRegistry};
