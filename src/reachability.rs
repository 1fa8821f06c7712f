use tracing::info;

/// Edge of the reachability signal worth reacting to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityChange {
    Lost,
    Restored,
}

/// Network reachability as reported by the platform layer.
#[derive(Debug, Clone)]
pub struct ReachabilityMonitor {
    reachable: bool,
    transitions: u64,
}

impl Default for ReachabilityMonitor {
    fn default() -> Self {
        ReachabilityMonitor {
            reachable: true,
            transitions: 0,
        }
    }
}

impl ReachabilityMonitor {
    pub fn new(reachable: bool) -> Self {
        ReachabilityMonitor {
            reachable,
            transitions: 0,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Number of edges observed so far.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// Records a new value; repeated values are not an edge.
    pub fn update(&mut self, reachable: bool) -> Option<ReachabilityChange> {
        if reachable == self.reachable {
            return None;
        }
        self.reachable = reachable;
        self.transitions += 1;
        info!(reachable, "network reachability changed");

        Some(if reachable {
            ReachabilityChange::Restored
        } else {
            ReachabilityChange::Lost
        })
    }
}
