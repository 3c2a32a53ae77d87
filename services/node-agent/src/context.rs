//! Per-attempt convergence context.
//!
//! A context is an immutable snapshot of one node's desired specification
//! plus the helpers a single convergence attempt needs: where the node's
//! files live, how long the warm-up window is, and a tracing span that
//! scopes every log line of the attempt to the node.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_id::{ContainerName, HostName};
use fleet_reconcile::ContainerResources;
use tracing::Span;

use crate::spec::NodeSpec;

/// Location of a node's files on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathResolver {
    node_root: PathBuf,
}

impl PathResolver {
    pub fn new(data_dir: impl AsRef<Path>, container_name: &ContainerName) -> Self {
        Self {
            node_root: data_dir.as_ref().join(container_name.as_str()),
        }
    }

    /// Root of the container's file system on the host.
    pub fn node_root(&self) -> &Path {
        &self.node_root
    }

    /// Directory holding the node's indexed documents.
    pub fn documents_dir(&self) -> PathBuf {
        self.node_root.join("opt/vespa/var/db/vespa/search")
    }
}

/// Everything one convergence attempt knows about its node.
#[derive(Debug, Clone)]
pub struct NodeAgentContext {
    node: NodeSpec,
    container_name: ContainerName,
    paths: PathResolver,
    warm_up_duration: Option<Duration>,
    span: Span,
}

impl NodeAgentContext {
    pub fn new(node: NodeSpec, data_dir: impl AsRef<Path>) -> Self {
        let container_name = ContainerName::from_hostname(&node.hostname);
        let paths = PathResolver::new(data_dir, &container_name);
        let span = tracing::info_span!("node", hostname = %node.hostname);
        Self {
            node,
            container_name,
            paths,
            warm_up_duration: None,
            span,
        }
    }

    /// Sets the window after the first healthy check during which CPU is
    /// left uncapped. A zero duration disables warm-up.
    pub fn with_warm_up(mut self, warm_up: Duration) -> Self {
        self.warm_up_duration = (!warm_up.is_zero()).then_some(warm_up);
        self
    }

    pub fn node(&self) -> &NodeSpec {
        &self.node
    }

    pub fn hostname(&self) -> &HostName {
        &self.node.hostname
    }

    pub fn container_name(&self) -> &ContainerName {
        &self.container_name
    }

    pub fn paths(&self) -> &PathResolver {
        &self.paths
    }

    pub fn warm_up_duration(&self) -> Option<Duration> {
        self.warm_up_duration
    }

    /// vCPUs the node is entitled to on this host.
    pub fn vcpu_on_this_host(&self) -> f64 {
        self.node.resources.vcpu
    }

    /// Steady-state resources: CPU capped at the node's vCPU count.
    pub fn capped_resources(&self) -> ContainerResources {
        let vcpu = self.vcpu_on_this_host();
        ContainerResources::from_node(vcpu, vcpu, self.node.resources.memory_gb)
    }

    /// Span scoping the log lines of one attempt to this node.
    pub fn span(&self) -> &Span {
        &self.span
    }
}
