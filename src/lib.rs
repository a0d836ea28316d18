//! Connectivity and speed-test state aggregation: turns two callback-driven
//! collaborators into deduplicated, replay-latest state streams.

mod broadcast;
mod connectivity;
mod service;
mod settings;
mod speedtest;

pub use broadcast::Subscription;
pub use connectivity::{
    ConnectivitySignal, ConnectivitySource, NetworkStatus, RegistrationId, RequestSpec, Transport,
};
pub use service::{NetworkService, ServiceError};
pub use settings::Settings;
pub use speedtest::{
    FailureKind, InstrumentEvent, SpeedTestInstrument, TestFailure, TestOutcome, TestSnapshot,
};
