use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use super::{
    FailureKind, InstrumentEvent, SpeedTestInstrument, TestFailure, TestOutcome, TestSnapshot,
};
use crate::broadcast::{SourceHandle, StatePublisher, StateSource};

/// Folds the instrument's callback sequence into the `TestOutcome` stream.
/// Holds the single current-snapshot cell; the instrument listener lives
/// exactly as long as the broadcaster keeps the returned handle.
pub(crate) struct SpeedTestAggregator {
    instrument: Arc<dyn SpeedTestInstrument>,
    capacity: usize,
}

impl SpeedTestAggregator {
    pub(crate) fn new(instrument: Arc<dyn SpeedTestInstrument>, capacity: usize) -> Self {
        Self {
            instrument,
            capacity,
        }
    }
}

impl StateSource<TestOutcome> for SpeedTestAggregator {
    fn connect(&self, publisher: StatePublisher<TestOutcome>) -> SourceHandle {
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Err(err) = self.instrument.install_listener(tx) {
            warn!(%err, "speed test listener rejected");
            // Subscribers still get the idle seed so they have something to render.
            tokio::spawn(async move {
                publisher.publish(TestOutcome::Testing(TestSnapshot::default()));
            });
            return SourceHandle::idle();
        }
        trace!("speed test listener installed");
        let task = tokio::spawn(aggregate(rx, publisher));
        let instrument = Arc::clone(&self.instrument);
        SourceHandle::new(task, move || {
            trace!("speed test listener removed");
            instrument.remove_listener();
        })
    }
}

async fn aggregate(
    mut events: mpsc::Receiver<InstrumentEvent>,
    publisher: StatePublisher<TestOutcome>,
) {
    let mut snapshot = TestSnapshot::default();
    publisher.publish(TestOutcome::Testing(snapshot.clone()));
    while let Some(event) = events.recv().await {
        publisher.publish(fold(&mut snapshot, event));
    }
    trace!("instrument closed the event channel");
}

/// One instrument event in, the full outcome to display out. Failure events
/// leave the snapshot cell untouched; the next `TestStarted` resets it, so a
/// fresh run never carries fields over from a failed one.
fn fold(snapshot: &mut TestSnapshot, event: InstrumentEvent) -> TestOutcome {
    match event {
        InstrumentEvent::TestStarted => *snapshot = TestSnapshot::default(),
        InstrumentEvent::FindingBestServerStarted => snapshot.initialized = true,
        InstrumentEvent::PingStarted => snapshot.ping_in_progress = true,
        InstrumentEvent::PingFinished { ping_ms, jitter_ms } => {
            snapshot.ping_in_progress = false;
            snapshot.ping_ms = ping_ms;
            snapshot.jitter_ms = jitter_ms;
        }
        InstrumentEvent::DownloadStarted => snapshot.download_in_progress = true,
        InstrumentEvent::DownloadProgress { percent, mbps } => {
            snapshot.download_percent = percent;
            snapshot.download_mbps = mbps;
        }
        InstrumentEvent::DownloadFinished { mbps } => {
            snapshot.download_in_progress = false;
            snapshot.download_mbps = mbps;
        }
        InstrumentEvent::UploadStarted => snapshot.upload_in_progress = true,
        InstrumentEvent::UploadProgress { percent, mbps } => {
            snapshot.upload_percent = percent;
            snapshot.upload_mbps = mbps;
        }
        InstrumentEvent::UploadFinished { mbps } => {
            snapshot.upload_in_progress = false;
            snapshot.upload_mbps = mbps;
        }
        InstrumentEvent::TestFinished { server_url } => {
            snapshot.ping_in_progress = false;
            snapshot.download_in_progress = false;
            snapshot.upload_in_progress = false;
            snapshot.server_url = server_url.unwrap_or_default();
            snapshot.finished = true;
        }
        InstrumentEvent::FetchServerFailed => {
            return TestOutcome::Failure(TestFailure::new(FailureKind::ServerFetch, ""));
        }
        InstrumentEvent::Warning { detail } => {
            return TestOutcome::Failure(TestFailure::new(FailureKind::Warning, detail));
        }
        InstrumentEvent::FatalError { detail } => {
            return TestOutcome::Failure(TestFailure::new(FailureKind::Fatal, detail));
        }
        InstrumentEvent::Interrupted { detail } => {
            return TestOutcome::Failure(TestFailure::new(FailureKind::Interrupted, detail));
        }
    }
    TestOutcome::Testing(snapshot.clone())
}
