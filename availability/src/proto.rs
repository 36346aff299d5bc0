//! Wire messages of the availability watch.
//!
//! Hand-written `prost` messages so the service slots into a tonic
//! server-streaming handler without a build step.

use std::collections::HashMap;

/// Opaque key/value description of this node. Empty means unavailable.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Descriptor {
    #[prost(map = "string, string", tag = "1")]
    pub attributes: HashMap<String, String>,
}

impl Descriptor {
    pub fn available<K, V>(attributes: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            attributes: attributes
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn is_available(&self) -> bool {
        !self.attributes.is_empty()
    }
}

#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct WatchResponse {
    #[prost(message, repeated, tag = "1")]
    pub descriptors: Vec<Descriptor>,
}

impl WatchResponse {
    pub fn single(descriptor: Descriptor) -> Self {
        Self {
            descriptors: vec![descriptor],
        }
    }

    /// True when the response carries a non-empty descriptor.
    pub fn is_available(&self) -> bool {
        self.descriptors.iter().any(Descriptor::is_available)
    }
}
