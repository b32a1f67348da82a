use std::fmt;

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(u64);

impl ChainId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain-{}", self.0)
    }
}

/// Immutable snapshot of a chain's order and cached aggregates.
///
/// The manager never edits a published snapshot; every structural change
/// publishes a new one, so a render holding an `Arc<PluginChain>` keeps the
/// order it started with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginChain {
    id: ChainId,
    name: String,
    instances: Vec<InstanceId>,
    latency_samples: u32,
    cpu_usage: f32,
}

impl PluginChain {
    pub(crate) fn new(id: ChainId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            instances: Vec::new(),
            latency_samples: 0,
            cpu_usage: 0.0,
        }
    }

    /// Copy with a different order and freshly computed aggregates.
    pub(crate) fn with_order(
        &self,
        instances: Vec<InstanceId>,
        latency_samples: u32,
        cpu_usage: f32,
    ) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            instances,
            latency_samples,
            cpu_usage,
        }
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn contains(&self, instance: InstanceId) -> bool {
        self.instances.contains(&instance)
    }

    pub fn position(&self, instance: InstanceId) -> Option<usize> {
        self.instances.iter().position(|id| *id == instance)
    }

    /// Sum of member latencies at the time of the last structural change or
    /// refresh.
    pub fn latency_samples(&self) -> u32 {
        self.latency_samples
    }

    pub fn cpu_usage(&self) -> f32 {
        self.cpu_usage
    }

    /// Whether `order` contains exactly the members of this chain.
    pub fn is_permutation(&self, order: &[InstanceId]) -> bool {
        if order.len() != self.instances.len() {
            return false;
        }
        let mut current = self.instances.clone();
        let mut proposed = order.to_vec();
        current.sort();
        proposed.sort();
        current == proposed
    }
}
