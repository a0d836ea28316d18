use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Upstream half of one pipeline. `connect` registers with the collaborator,
/// starts the forwarding task, and returns the handle that undoes both.
///
/// `connect` runs under the broadcaster's lock: the publisher may only be used
/// from tasks it spawns, never called synchronously inside `connect` itself.
pub(crate) trait StateSource<T>: Send + Sync + 'static {
    fn connect(&self, publisher: StatePublisher<T>) -> SourceHandle;
}

/// Keeps one collaborator registration alive. Dropping it releases the
/// registration exactly once and stops the forwarding task.
pub(crate) struct SourceHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
    task: Option<JoinHandle<()>>,
}

impl SourceHandle {
    pub(crate) fn new(task: JoinHandle<()>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
            task: Some(task),
        }
    }

    /// Handle for a source that never came up (registration rejected).
    pub(crate) fn idle() -> Self {
        Self {
            release: None,
            task: None,
        }
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Write half handed to a source's forwarding task.
pub(crate) struct StatePublisher<T> {
    shared: Weak<Shared<T>>,
}

impl<T: Clone + PartialEq> StatePublisher<T> {
    /// Publish a value to all subscribers and cache it for late ones.
    /// Suppressed when `value` equals the previously published value.
    pub(crate) fn publish(&self, value: T) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut inner = shared.inner.lock();
        if inner.latest.as_ref() == Some(&value) {
            return;
        }
        inner.latest = Some(value.clone());
        let _ = shared.tx.send(value);
    }
}

/// Shared-subscription wrapper over one state source: multicasts emissions,
/// replays the latest value to new subscribers, and keeps the upstream
/// registration alive only while someone is listening (plus a grace window).
pub(crate) struct StateBroadcaster<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    source: Box<dyn StateSource<T>>,
    tx: broadcast::Sender<T>,
    grace: Duration,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    latest: Option<T>,
    subscribers: usize,
    upstream: Option<SourceHandle>,
    // Bumped on every subscribe and every 1->0 transition; a pending release
    // only fires if the epoch it captured is still current.
    epoch: u64,
}

impl<T: Clone + PartialEq + Send + 'static> StateBroadcaster<T> {
    pub(crate) fn new(source: impl StateSource<T>, capacity: usize, grace: Duration) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                source: Box::new(source),
                tx,
                grace,
                inner: Mutex::new(Inner {
                    latest: None,
                    subscribers: 0,
                    upstream: None,
                    epoch: 0,
                }),
            }),
        }
    }

    /// Attach a subscriber. The first one brings the upstream registration up;
    /// any pending grace release is cancelled and the live upstream reused.
    pub(crate) fn subscribe(&self) -> Subscription<T> {
        let mut inner = self.shared.inner.lock();
        inner.subscribers += 1;
        inner.epoch += 1;
        if inner.upstream.is_none() {
            trace!("connecting upstream source");
            let publisher = StatePublisher {
                shared: Arc::downgrade(&self.shared),
            };
            inner.upstream = Some(self.shared.source.connect(publisher));
        }
        let rx = self.shared.tx.subscribe();
        let replay = inner.latest.clone();
        drop(inner);
        Subscription {
            shared: Arc::clone(&self.shared),
            replay,
            rx,
            attached: true,
        }
    }
}

/// One consumer's view of a pipeline: the latest value first, then every
/// subsequent emission in order. Detaches on drop.
pub struct Subscription<T: Clone + Send + 'static> {
    shared: Arc<Shared<T>>,
    replay: Option<T>,
    rx: broadcast::Receiver<T>,
    attached: bool,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Next value, or `None` once the pipeline is gone.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.replay.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber fell behind, resuming with newer values");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Consume the subscription as a `futures` stream.
    pub fn into_stream(self) -> impl futures::Stream<Item = T> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|value| (value, sub))
        })
    }

    /// Detach from the pipeline. Idempotent; dropping calls this too.
    pub fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;
        let mut inner = self.shared.inner.lock();
        inner.subscribers -= 1;
        if inner.subscribers > 0 {
            return;
        }
        inner.epoch += 1;
        let epoch = inner.epoch;
        drop(inner);
        schedule_release(&self.shared, epoch);
    }
}

impl<T: Clone + Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn schedule_release<T: Clone + Send + 'static>(shared: &Arc<Shared<T>>, epoch: u64) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        // No runtime to drive the grace timer, so release on the spot.
        let mut inner = shared.inner.lock();
        if inner.subscribers == 0 && inner.epoch == epoch && inner.upstream.take().is_some() {
            debug!("upstream released without grace (no runtime)");
        }
        return;
    };
    let grace = shared.grace;
    let weak = Arc::downgrade(shared);
    handle.spawn(async move {
        tokio::time::sleep(grace).await;
        let Some(shared) = weak.upgrade() else {
            return;
        };
        // The handle is dropped while the lock is held so a concurrent
        // subscribe cannot open a second registration next to the dying one.
        let mut inner = shared.inner.lock();
        if inner.subscribers == 0 && inner.epoch == epoch && inner.upstream.take().is_some() {
            debug!("grace window elapsed, upstream released");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    const GRACE: Duration = Duration::from_secs(5);

    struct FakeSource {
        sender: Arc<Mutex<Option<mpsc::Sender<u32>>>>,
        connects: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    impl StateSource<u32> for FakeSource {
        fn connect(&self, publisher: StatePublisher<u32>) -> SourceHandle {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::channel(8);
            *self.sender.lock() = Some(tx);
            let task = tokio::spawn(async move {
                while let Some(value) = rx.recv().await {
                    publisher.publish(value);
                }
            });
            let sender = Arc::clone(&self.sender);
            let releases = Arc::clone(&self.releases);
            SourceHandle::new(task, move || {
                sender.lock().take();
                releases.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    struct Fixture {
        bus: StateBroadcaster<u32>,
        sender: Arc<Mutex<Option<mpsc::Sender<u32>>>>,
        connects: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let sender = Arc::new(Mutex::new(None));
        let connects = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));
        let source = FakeSource {
            sender: Arc::clone(&sender),
            connects: Arc::clone(&connects),
            releases: Arc::clone(&releases),
        };
        Fixture {
            bus: StateBroadcaster::new(source, 8, GRACE),
            sender,
            connects,
            releases,
        }
    }

    impl Fixture {
        async fn push(&self, value: u32) {
            let tx = self.sender.lock().clone().expect("source not connected");
            tx.send(value).await.expect("forwarding task gone");
        }
    }

    #[tokio::test]
    async fn replays_latest_value_to_late_subscriber() {
        let fx = fixture();
        let mut first = fx.bus.subscribe();
        fx.push(7).await;
        assert_eq!(first.recv().await, Some(7));

        let mut late = fx.bus.subscribe();
        assert_eq!(late.recv().await, Some(7));

        fx.push(9).await;
        assert_eq!(first.recv().await, Some(9));
        assert_eq!(late.recv().await, Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn suppresses_consecutive_duplicates() {
        let fx = fixture();
        let mut sub = fx.bus.subscribe();
        for value in [1, 1, 2, 2, 2, 1] {
            fx.push(value).await;
        }
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, Some(2));
        assert_eq!(sub.recv().await, Some(1));
        let quiet = tokio::time::timeout(Duration::from_millis(50), sub.recv()).await;
        assert!(quiet.is_err(), "expected no further emissions");
    }

    #[tokio::test(start_paused = true)]
    async fn releases_upstream_once_after_grace() {
        let fx = fixture();
        let sub = fx.bus.subscribe();
        assert_eq!(fx.connects.load(Ordering::SeqCst), 1);
        drop(sub);

        assert_eq!(fx.releases.load(Ordering::SeqCst), 0);
        tokio::time::sleep(GRACE + Duration::from_millis(50)).await;
        assert_eq!(fx.releases.load(Ordering::SeqCst), 1);

        // Well past the window nothing fires again.
        tokio::time::sleep(GRACE * 3).await;
        assert_eq!(fx.releases.load(Ordering::SeqCst), 1);

        // A fresh subscriber starts a fresh registration.
        let _sub = fx.bus.subscribe();
        assert_eq!(fx.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_within_grace_reuses_upstream() {
        let fx = fixture();
        let sub = fx.bus.subscribe();
        drop(sub);

        tokio::time::sleep(GRACE / 2).await;
        let _sub = fx.bus.subscribe();
        tokio::time::sleep(GRACE * 3).await;

        assert_eq!(fx.connects.load(Ordering::SeqCst), 1);
        assert_eq!(fx.releases.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detach_is_idempotent_and_leaves_others_attached() {
        let fx = fixture();
        let mut first = fx.bus.subscribe();
        let mut second = fx.bus.subscribe();

        first.detach();
        first.detach();
        drop(first);

        fx.push(3).await;
        assert_eq!(second.recv().await, Some(3));
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(fx.releases.load(Ordering::SeqCst), 0);

        drop(second);
        tokio::time::sleep(GRACE * 2).await;
        assert_eq!(fx.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscription_works_as_stream() {
        let fx = fixture();
        let sub = fx.bus.subscribe();
        fx.push(4).await;
        let mut stream = Box::pin(sub.into_stream());
        assert_eq!(stream.next().await, Some(4));
        fx.push(5).await;
        assert_eq!(stream.next().await, Some(5));
    }
}
