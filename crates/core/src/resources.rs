//! Resource descriptors: capacity requested by a task or offered by a node.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Consumable capacity plus placement hints.
///
/// `cpus`, `mem_mb` and `custom` are consumed while a task runs. `timeout`
/// is the task's wall-clock budget; `node` and `queue` are affinity hints.
/// None of the last three take part in admission comparisons.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    /// CPU slots
    pub cpus: u32,

    /// Memory in megabytes
    pub mem_mb: u64,

    /// Wall-clock budget
    #[serde(default, with = "duration_ms")]
    pub timeout: Option<Duration>,

    /// Custom named quantities (licenses, GPUs, ...)
    #[serde(default)]
    pub custom: BTreeMap<String, u64>,

    /// Preferred execution node
    #[serde(default)]
    pub node: Option<String>,

    /// Preferred execution queue
    #[serde(default)]
    pub queue: Option<String>,
}

impl Resources {
    /// Empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set CPU slots.
    pub fn with_cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Set memory.
    pub fn with_mem_mb(mut self, mem_mb: u64) -> Self {
        self.mem_mb = mem_mb;
        self
    }

    /// Set wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set a custom quantity.
    pub fn with_custom(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.custom.insert(name.into(), amount);
        self
    }

    /// Set preferred node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Set preferred queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Nothing consumable requested.
    pub fn is_zero(&self) -> bool {
        self.cpus == 0 && self.mem_mb == 0 && self.custom.values().all(|v| *v == 0)
    }

    /// Per-field sum of consumable quantities.
    pub fn add(&self, other: &Resources) -> Resources {
        let mut sum = self.consumable();
        sum.cpus = sum.cpus.saturating_add(other.cpus);
        sum.mem_mb = sum.mem_mb.saturating_add(other.mem_mb);
        for (name, amount) in &other.custom {
            let slot = sum.custom.entry(name.clone()).or_insert(0);
            *slot = slot.saturating_add(*amount);
        }
        sum
    }

    /// Per-field difference of consumable quantities, floored at zero.
    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        let mut diff = self.consumable();
        diff.cpus = diff.cpus.saturating_sub(other.cpus);
        diff.mem_mb = diff.mem_mb.saturating_sub(other.mem_mb);
        for (name, amount) in &other.custom {
            if let Some(slot) = diff.custom.get_mut(name) {
                *slot = slot.saturating_sub(*amount);
            }
        }
        diff
    }

    /// `self <= available` on every consumable field.
    ///
    /// A custom quantity the other side does not offer counts as zero.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpus <= available.cpus
            && self.mem_mb <= available.mem_mb
            && self
                .custom
                .iter()
                .all(|(name, amount)| *amount <= available.custom.get(name).copied().unwrap_or(0))
    }

    fn consumable(&self) -> Resources {
        Resources {
            cpus: self.cpus,
            mem_mb: self.mem_mb,
            custom: self.custom.clone(),
            ..Resources::default()
        }
    }
}

impl std::fmt::Display for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpus={} mem={}MB", self.cpus, self.mem_mb)?;
        for (name, amount) in &self.custom {
            write!(f, " {}={}", name, amount)?;
        }
        if let Some(timeout) = self.timeout {
            write!(f, " timeout={}s", timeout.as_secs_f64())?;
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
