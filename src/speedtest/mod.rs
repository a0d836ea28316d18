pub mod aggregator;

use std::fmt;

use tokio::sync::mpsc;

/// Progress of one speed-test run. Replaced wholesale on every instrument
/// event; a new run resets it to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestSnapshot {
    pub server_url: String,
    pub initialized: bool,
    pub ping_in_progress: bool,
    pub download_in_progress: bool,
    pub upload_in_progress: bool,
    pub ping_ms: u32,
    pub jitter_ms: u32,
    pub download_mbps: u32,
    pub upload_mbps: u32,
    pub download_percent: u32,
    pub upload_percent: u32,
    pub finished: bool,
}

/// What the speed-test stream currently shows: a live (or terminal) snapshot,
/// or the failure that ended the displayed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Testing(TestSnapshot),
    Failure(TestFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ServerFetch,
    Warning,
    Fatal,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl TestFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for TestFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FailureKind::ServerFetch => write!(f, "Failed to fetch server"),
            FailureKind::Warning => write!(f, "Warning: {}", self.detail),
            FailureKind::Fatal => write!(f, "Fatal error: {}", self.detail),
            FailureKind::Interrupted => write!(f, "Test interrupted: {}", self.detail),
        }
    }
}

/// Lifecycle events of the external instrument. A clean run raises them in
/// order: started, server search, ping, download, upload, finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstrumentEvent {
    TestStarted,
    FetchServerFailed,
    FindingBestServerStarted,
    PingStarted,
    PingFinished { ping_ms: u32, jitter_ms: u32 },
    DownloadStarted,
    DownloadProgress { percent: u32, mbps: u32 },
    DownloadFinished { mbps: u32 },
    UploadStarted,
    UploadProgress { percent: u32, mbps: u32 },
    UploadFinished { mbps: u32 },
    TestFinished { server_url: Option<String> },
    Warning { detail: String },
    FatalError { detail: String },
    Interrupted { detail: String },
}

/// Externally owned measurement instrument. Accepts at most one listener per
/// process; events are forwarded as messages through the installed channel.
pub trait SpeedTestInstrument: Send + Sync {
    fn install_listener(&self, events: mpsc::Sender<InstrumentEvent>) -> anyhow::Result<()>;

    fn remove_listener(&self);

    /// Fire-and-forget; failures surface asynchronously on the outcome stream.
    fn start_test(&self);
}
