//! Container resource envelope.

use serde::{Deserialize, Serialize};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// CPU shares given per vCPU.
const SHARES_PER_VCPU: f64 = 32.0;

/// The runtime refuses shares below this.
const MIN_CPU_SHARES: u32 = 2;

const CPU_EPSILON: f64 = 0.0001;

/// CPU and memory allocation of a container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerResources {
    /// CPU cap in vCPUs. `0.0` means uncapped.
    pub cpus: f64,

    /// Relative CPU weight.
    pub cpu_shares: u32,

    /// Memory limit in bytes.
    pub memory_bytes: u64,
}

impl ContainerResources {
    pub const UNLIMITED_CPUS: f64 = 0.0;

    /// Resources for a node with `vcpu` vCPUs capped at `cpu_cap` and
    /// `memory_gb` GiB of memory.
    pub fn from_node(cpu_cap: f64, vcpu: f64, memory_gb: f64) -> Self {
        let cpu_shares = ((SHARES_PER_VCPU * vcpu).round() as u32).max(MIN_CPU_SHARES);
        Self {
            cpus: cpu_cap.max(0.0),
            cpu_shares,
            memory_bytes: (memory_gb * GIB).round() as u64,
        }
    }

    /// Same allocation without a CPU cap.
    #[must_use]
    pub fn with_unlimited_cpus(self) -> Self {
        Self {
            cpus: Self::UNLIMITED_CPUS,
            ..self
        }
    }

    /// Same CPU allocation with a different memory limit.
    #[must_use]
    pub fn with_memory_bytes(self, memory_bytes: u64) -> Self {
        Self {
            memory_bytes,
            ..self
        }
    }

    pub fn is_cpu_unlimited(&self) -> bool {
        self.cpus.abs() < CPU_EPSILON
    }

    /// True if the CPU part (cap and shares) is the same.
    pub fn equals_cpu(&self, other: &Self) -> bool {
        (self.cpus - other.cpus).abs() < CPU_EPSILON && self.cpu_shares == other.cpu_shares
    }

    /// True if the memory limit is the same.
    pub fn equals_memory(&self, other: &Self) -> bool {
        self.memory_bytes == other.memory_bytes
    }

    pub fn to_string_cpu(&self) -> String {
        let cap = if self.is_cpu_unlimited() {
            "unlimited".to_string()
        } else {
            format!("{:.2}", self.cpus)
        };
        format!("CPU: {cap} vcpu, {} shares", self.cpu_shares)
    }

    pub fn to_string_memory(&self) -> String {
        format!("Memory: {} MiB", self.memory_bytes / (1024 * 1024))
    }
}

impl std::fmt::Display for ContainerResources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}, {}", self.to_string_cpu(), self.to_string_memory())
    }
}
