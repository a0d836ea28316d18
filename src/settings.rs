use std::time::Duration;

use crate::connectivity::NetworkStatus;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Status reported before the collaborator's first real signal.
    /// `Connected` is the optimistic choice: it offers a working-network
    /// affordance before any reachability proof exists. `Unknown` waits.
    pub initial_status: NetworkStatus,
    /// How long to wait for that first signal before falling back.
    pub initial_status_wait: Duration,
    /// Grace window between the last detach and the upstream release.
    pub release_grace: Duration,
    /// Capacity of the fan-out channel and each adapter inbox.
    pub channel_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            initial_status: NetworkStatus::Unknown,
            initial_status_wait: Duration::from_millis(500),
            release_grace: Duration::from_secs(5),
            channel_capacity: 32,
        }
    }
}
