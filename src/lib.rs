//! Stateless load-balancer node control plane
//!
//! Configuration, logging bootstrap and the [`node::Node`] that composes the
//! reconciliation engine with the availability broadcast.

pub mod config;
pub mod logging;
pub mod node;

pub use config::{AvailabilityConfig, ConfigError, ConfigResult, NodeConfig};
pub use logging::{init_logging, LoggingConfig, LoggingError};
pub use node::{Node, NodeCollaborators};
pub use slb_availability as availability;
pub use slb_engine as engine;
