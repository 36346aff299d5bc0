//! Node-wide forwarding availability
//!
//! Aggregates the forwarding state of every stream on the node and pushes
//! edge-triggered availability updates to long-lived watchers.

pub mod error;
pub mod proto;
pub mod service;
pub mod strategy;

pub use error::{AvailabilityError, AvailabilityResult};
pub use proto::{Descriptor, WatchResponse};
pub use service::{ForwardingAvailabilityService, WatchSink, DEFAULT_STOP_TIMEOUT};
pub use strategy::{AvailabilityStrategy, Delayed, LockedRead, PathRegistry, Registration};
