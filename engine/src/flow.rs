//! Traffic selectors ("flows") and their classifier adapter.

use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    classifier::Classifier,
    error::{LbError, LbResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
}

/// Traffic selector mapped to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub vips: Vec<IpNet>,
    #[serde(default)]
    pub source_subnets: Vec<IpNet>,
    #[serde(default)]
    pub source_port_ranges: Vec<String>,
    #[serde(default)]
    pub destination_port_ranges: Vec<String>,
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub byte_matches: Vec<String>,
}

impl FlowSpec {
    pub fn validate(&self) -> LbResult<()> {
        let invalid = |reason: String| LbError::InvalidFlow {
            name: self.name.clone(),
            reason,
        };

        if self.name.trim().is_empty() {
            return Err(invalid("empty name".to_string()));
        }
        if self.vips.is_empty() {
            return Err(invalid("no VIPs".to_string()));
        }
        if self.protocols.is_empty() {
            return Err(invalid("no protocols".to_string()));
        }
        for range in self
            .source_port_ranges
            .iter()
            .chain(&self.destination_port_ranges)
        {
            parse_port_range(range).map_err(invalid)?;
        }
        Ok(())
    }
}

/// Parses `"any"`, `"80"` or `"8000-8080"` into an inclusive range.
pub fn parse_port_range(raw: &str) -> Result<(u16, u16), String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("any") {
        return Ok((0, u16::MAX));
    }
    let port = |s: &str| {
        s.trim()
            .parse::<u16>()
            .map_err(|_| format!("invalid port '{}' in range '{}'", s, raw))
    };
    match raw.split_once('-') {
        Some((low, high)) => {
            let (low, high) = (port(low)?, port(high)?);
            if low > high {
                return Err(format!("port range '{}' is reversed", raw));
            }
            Ok((low, high))
        }
        None => port(raw).map(|p| (p, p)),
    }
}

/// A flow installed in the classifier for one stream.
pub struct Flow {
    stream: String,
    spec: FlowSpec,
    classifier: Arc<dyn Classifier>,
}

impl Flow {
    pub async fn create(
        stream: &str,
        spec: FlowSpec,
        classifier: Arc<dyn Classifier>,
    ) -> LbResult<Self> {
        let flow = Self {
            stream: stream.to_string(),
            spec,
            classifier,
        };
        flow.upsert("create flow").await?;
        Ok(flow)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &FlowSpec {
        &self.spec
    }

    /// Pushes `spec` to the classifier when it differs from the installed one.
    pub async fn update(&mut self, spec: FlowSpec) -> LbResult<bool> {
        if self.spec == spec {
            return Ok(false);
        }
        let previous = std::mem::replace(&mut self.spec, spec);
        if let Err(e) = self.upsert("update flow").await {
            self.spec = previous;
            return Err(e);
        }
        Ok(true)
    }

    pub async fn delete(&self) -> LbResult<()> {
        self.classifier
            .delete_flow(&self.stream, &self.spec.name)
            .await
            .map_err(|source| LbError::Classifier {
                stream: self.stream.clone(),
                op: "delete flow",
                source,
            })?;
        debug!(stream = %self.stream, flow = %self.spec.name, "Deleted flow");
        Ok(())
    }

    async fn upsert(&self, op: &'static str) -> LbResult<()> {
        self.classifier
            .upsert_flow(&self.stream, &self.spec)
            .await
            .map_err(|source| LbError::Classifier {
                stream: self.stream.clone(),
                op,
                source,
            })?;
        debug!(stream = %self.stream, flow = %self.spec.name, op, "Installed flow");
        Ok(())
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("stream", &self.stream)
            .field("spec", &self.spec)
            .finish()
    }
}
