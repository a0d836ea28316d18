use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::broadcast::{StateBroadcaster, Subscription};
use crate::connectivity::{ConnectivitySource, ConnectivityWatcher, NetworkStatus};
use crate::settings::Settings;
use crate::speedtest::aggregator::SpeedTestAggregator;
use crate::speedtest::{SpeedTestInstrument, TestOutcome};

// The instrument accepts one listener process-wide, so the service that owns
// it must be a singleton too.
static SERVICE_LIVE: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("a network service is already live in this process")]
    AlreadyRunning,
}

/// The crate's entry point: owns the connectivity and speed-test pipelines
/// and the start command. One instance per process; dropping it tears the
/// pipelines down and frees the slot.
pub struct NetworkService {
    network_status: StateBroadcaster<NetworkStatus>,
    speed_test: StateBroadcaster<TestOutcome>,
    instrument: Arc<dyn SpeedTestInstrument>,
}

impl NetworkService {
    pub fn new(
        connectivity: Arc<dyn ConnectivitySource>,
        instrument: Arc<dyn SpeedTestInstrument>,
        settings: Settings,
    ) -> Result<Self, ServiceError> {
        if SERVICE_LIVE.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        debug!("network service starting");
        let watcher = ConnectivityWatcher::new(connectivity, &settings);
        let aggregator =
            SpeedTestAggregator::new(Arc::clone(&instrument), settings.channel_capacity);
        Ok(Self {
            network_status: StateBroadcaster::new(
                watcher,
                settings.channel_capacity,
                settings.release_grace,
            ),
            speed_test: StateBroadcaster::new(
                aggregator,
                settings.channel_capacity,
                settings.release_grace,
            ),
            instrument,
        })
    }

    /// Live reachability. The first subscriber registers the platform
    /// callback; the last one detaching releases it after the grace window.
    pub fn network_status(&self) -> Subscription<NetworkStatus> {
        self.network_status.subscribe()
    }

    /// Live progress and terminal result of speed-test runs, seeded with an
    /// idle snapshot before the first run.
    pub fn speed_test(&self) -> Subscription<TestOutcome> {
        self.speed_test.subscribe()
    }

    /// Kick off a run. Fire-and-forget: errors come back through the outcome
    /// stream, and repeat calls are the instrument's problem to serialize.
    pub fn start_speed_test(&self) {
        debug!("speed test requested");
        self.instrument.start_test();
    }
}

impl Drop for NetworkService {
    fn drop(&mut self) {
        debug!("network service stopped");
        SERVICE_LIVE.store(false, Ordering::SeqCst);
    }
}
