use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::broadcast::{SourceHandle, StatePublisher, StateSource};
use crate::settings::Settings;

/// Last-known reachability of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    Unknown,
}

/// Raw signal from the connectivity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivitySignal {
    Available,
    Lost,
}

impl From<ConnectivitySignal> for NetworkStatus {
    fn from(signal: ConnectivitySignal) -> Self {
        match signal {
            ConnectivitySignal::Available => NetworkStatus::Connected,
            ConnectivitySignal::Lost => NetworkStatus::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Wifi,
    Cellular,
}

/// Filter for the networks the collaborator should report on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSpec {
    pub require_internet: bool,
    pub transports: Vec<Transport>,
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self {
            require_internet: true,
            transports: vec![Transport::Wifi, Transport::Cellular],
        }
    }
}

pub type RegistrationId = u64;

/// Externally owned connectivity notifier. Implementations deliver signals by
/// sending into the channel installed at registration, from threads they own;
/// the raw callback never crosses this boundary.
pub trait ConnectivitySource: Send + Sync {
    fn register(
        &self,
        spec: &RequestSpec,
        signals: mpsc::Sender<ConnectivitySignal>,
    ) -> anyhow::Result<RegistrationId>;

    fn unregister(&self, id: RegistrationId);
}

/// Maps the collaborator's availability signals onto the `NetworkStatus`
/// stream. Registration lives exactly as long as the broadcaster keeps the
/// returned handle.
pub(crate) struct ConnectivityWatcher {
    source: Arc<dyn ConnectivitySource>,
    fallback: NetworkStatus,
    fallback_wait: Duration,
    capacity: usize,
}

impl ConnectivityWatcher {
    pub(crate) fn new(source: Arc<dyn ConnectivitySource>, settings: &Settings) -> Self {
        Self {
            source,
            fallback: settings.initial_status,
            fallback_wait: settings.initial_status_wait,
            capacity: settings.channel_capacity,
        }
    }
}

impl StateSource<NetworkStatus> for ConnectivityWatcher {
    fn connect(&self, publisher: StatePublisher<NetworkStatus>) -> SourceHandle {
        let spec = RequestSpec::default();
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = match self.source.register(&spec, tx) {
            Ok(id) => id,
            Err(err) => {
                warn!(%err, "connectivity registration rejected");
                let fallback = self.fallback;
                tokio::spawn(async move { publisher.publish(fallback) });
                return SourceHandle::idle();
            }
        };
        trace!(id, "connectivity callback registered");
        let task = tokio::spawn(relay(rx, publisher, self.fallback, self.fallback_wait));
        let source = Arc::clone(&self.source);
        SourceHandle::new(task, move || {
            trace!(id, "connectivity callback unregistered");
            source.unregister(id);
        })
    }
}

async fn relay(
    mut signals: mpsc::Receiver<ConnectivitySignal>,
    publisher: StatePublisher<NetworkStatus>,
    fallback: NetworkStatus,
    fallback_wait: Duration,
) {
    // The collaborator owes us nothing on registration; after the bounded
    // wait the configured fallback stands in until a real signal lands.
    match tokio::time::timeout(fallback_wait, signals.recv()).await {
        Ok(Some(signal)) => publisher.publish(signal.into()),
        Ok(None) => {
            publisher.publish(fallback);
            return;
        }
        Err(_) => publisher.publish(fallback),
    }
    while let Some(signal) = signals.recv().await {
        publisher.publish(signal.into());
    }
}
