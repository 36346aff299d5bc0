//! Backend targets
//!
//! A [`TargetEntry`] is what the registry reports; a [`Target`] is the
//! engine's incarnation of it, owning the kernel routes that steer marked
//! packets to the target IPs. A target whose IP set changes is destroyed
//! and replaced by a new incarnation with the same identifier.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    net::IpAddr,
    str::FromStr,
};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{LbError, LbResult, MultiError},
    routing::{Route, RouteManager},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    #[default]
    Enabled,
    Disabled,
}

/// One entry of a target registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetEntry {
    pub identifier: String,
    pub ips: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub status: TargetStatus,
}

impl TargetEntry {
    pub fn new(identifier: impl Into<String>, ips: &[&str]) -> Self {
        Self {
            identifier: identifier.into(),
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            attributes: BTreeMap::new(),
            status: TargetStatus::Enabled,
        }
    }

    /// Validates the entry against the identifier range of its stream.
    pub fn parse(&self, max_targets: u32) -> LbResult<(u32, BTreeSet<IpNet>)> {
        if self.status == TargetStatus::Disabled {
            return Err(LbError::InvalidTarget(format!(
                "target '{}' is disabled",
                self.identifier
            )));
        }

        let identifier: u32 = self.identifier.trim().parse().map_err(|_| {
            LbError::InvalidTarget(format!("identifier '{}' is not a number", self.identifier))
        })?;
        if identifier == 0 || identifier > max_targets {
            return Err(LbError::InvalidTarget(format!(
                "identifier {} outside 1..={}",
                identifier, max_targets
            )));
        }

        if self.ips.is_empty() {
            return Err(LbError::InvalidTarget(format!(
                "target {} has no IPs",
                identifier
            )));
        }
        let ips = self
            .ips
            .iter()
            .map(|ip| parse_ip(ip))
            .collect::<LbResult<BTreeSet<_>>>()?;

        Ok((identifier, ips))
    }
}

/// Accepts a plain address or an address in CIDR notation.
pub fn parse_ip(raw: &str) -> LbResult<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = IpNet::from_str(raw) {
        return Ok(net);
    }
    IpAddr::from_str(raw)
        .map(IpNet::from)
        .map_err(|_| LbError::InvalidTarget(format!("invalid IP '{}'", raw)))
}

pub struct Target {
    identifier: u32,
    mark: u32,
    ips: BTreeSet<IpNet>,
    routes: Vec<(IpNet, Box<dyn Route>)>,
}

impl Target {
    /// `offset` is the stream's identifier offset; the route mark and the
    /// classifier activation value are `identifier + offset`.
    pub fn new(identifier: u32, ips: BTreeSet<IpNet>, offset: u32) -> Self {
        Self {
            identifier,
            mark: identifier.saturating_add(offset),
            ips,
            routes: Vec::new(),
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn ips(&self) -> &BTreeSet<IpNet> {
        &self.ips
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.ips.iter().map(|net| net.addr()).collect()
    }

    pub fn same_ips(&self, ips: &BTreeSet<IpNet>) -> bool {
        &self.ips == ips
    }

    pub fn is_configured(&self) -> bool {
        !self.routes.is_empty()
    }

    /// Creates one route per IP. On any failure the routes created so far
    /// are removed again and the target is left unconfigured.
    pub async fn configure(&mut self, routes: &dyn RouteManager) -> LbResult<()> {
        let ips: Vec<IpNet> = self.ips.iter().copied().collect();
        for ip in ips {
            match routes.new_route(ip, self.mark).await {
                Ok(route) => self.routes.push((ip, route)),
                Err(source) => {
                    if let Err(rollback) = self.delete_routes().await {
                        warn!(
                            identifier = self.identifier,
                            error = %rollback,
                            "Failed to roll back partially configured routes"
                        );
                    }
                    return Err(LbError::Route {
                        ip: ip.to_string(),
                        mark: self.mark,
                        source,
                    });
                }
            }
        }
        debug!(
            identifier = self.identifier,
            mark = self.mark,
            routes = self.routes.len(),
            "Configured target routes"
        );
        Ok(())
    }

    /// True when every route of the target still verifies.
    pub async fn verify(&self) -> bool {
        if self.routes.len() != self.ips.len() {
            return false;
        }
        for (_, route) in &self.routes {
            if !route.verify().await {
                return false;
            }
        }
        true
    }

    /// Removes every route, attempting all of them even if some fail.
    pub async fn delete_routes(&mut self) -> LbResult<()> {
        let mut errors = MultiError::new();
        for (ip, route) in self.routes.drain(..) {
            if let Err(source) = route.delete().await {
                errors.push(LbError::Route {
                    ip: ip.to_string(),
                    mark: self.mark,
                    source,
                });
            }
        }
        errors.into_result()
    }

    /// Fresh, unconfigured incarnation with the same identity.
    pub fn reincarnate(&self) -> Self {
        Self {
            identifier: self.identifier,
            mark: self.mark,
            ips: self.ips.clone(),
            routes: Vec::new(),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("identifier", &self.identifier)
            .field("mark", &self.mark)
            .field("ips", &self.ips)
            .field("routes", &self.routes.len())
            .finish()
    }
}
