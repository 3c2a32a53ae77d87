//! Reboot and restart generation bookkeeping.

/// Generations the agent has satisfied for one node.
///
/// The restart generation only exists while the node is allocated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Generations {
    pub reboot: u64,
    pub restart: Option<u64>,
}

impl Generations {
    pub fn new(reboot: u64, restart: Option<u64>) -> Self {
        Self { reboot, restart }
    }

    /// Adopt generations observed as current in the node repository.
    ///
    /// Something outside the agent completed or cancelled a reboot/restart
    /// when the observed value is ahead of ours. A restart generation
    /// appearing or disappearing means the allocation changed.
    ///
    /// Returns true if anything changed.
    pub fn adopt_observed(&mut self, current_reboot: u64, current_restart: Option<u64>) -> bool {
        let mut changed = false;

        if self.reboot < current_reboot {
            self.reboot = current_reboot;
            changed = true;
        }

        let allocation_changed = self.restart.is_some() != current_restart.is_some();
        let cancelled = matches!(
            (self.restart, current_restart),
            (Some(ours), Some(observed)) if ours < observed
        );
        if allocation_changed || cancelled {
            self.restart = current_restart;
            changed = true;
        }

        changed
    }

    /// Record that a fresh container satisfies the wanted generations.
    pub fn satisfy(&mut self, wanted_reboot: u64, wanted_restart: Option<u64>) {
        self.reboot = wanted_reboot;
        self.restart = wanted_restart;
    }

    pub fn reboot_behind(&self, wanted: u64) -> bool {
        self.reboot < wanted
    }

    pub fn restart_behind(&self, wanted: Option<u64>) -> bool {
        matches!((self.restart, wanted), (Some(ours), Some(wanted)) if ours < wanted)
    }
}
