//! Timeout checker for time-bounded operations.
//!
//! One background task serves every registered [`TimeoutEndpoint`]. Deadlines
//! live in a min-heap; the task sleeps until the earliest one and is woken
//! early whenever a sooner deadline is registered.
//!
//! Each endpoint carries a single-fire guard. Firing and natural completion
//! both try to move the endpoint out of `PENDING` with a compare-and-swap,
//! so exactly one of them acts:
//!
//! ```rust,ignore
//! let endpoint = checker.register(Duration::from_secs(2), move || token.cancel());
//! // ... run the operation ...
//! if !checker.unregister(&endpoint) {
//!     // the deadline fired first; the operation is a timeout
//! }
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const PENDING: u8 = 0;
const FIRED: u8 = 1;
const COMPLETED: u8 = 2;

/// Heap size below which stale deadlines are left to expire on their own
const COMPACT_MIN_QUEUED: usize = 64;

type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

/// A deadline registered with the [`TimeoutChecker`]
pub struct TimeoutEndpoint {
    id: u64,
    deadline: Instant,
    state: AtomicU8,
    callback: Mutex<Option<TimeoutCallback>>,
}

impl TimeoutEndpoint {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Mark the owning operation as finished. Returns `false` if the
    /// deadline already fired, in which case the timeout wins.
    pub fn complete(&self) -> bool {
        let won = self
            .state
            .compare_exchange(PENDING, COMPLETED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.callback.lock().take();
        }
        won || self.state.load(Ordering::Acquire) == COMPLETED
    }

    pub fn is_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    /// Fire the callback if nothing else claimed the endpoint first
    fn fire(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback();
        }
        true
    }
}

impl std::fmt::Debug for TimeoutEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutEndpoint")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}

#[derive(Default)]
struct Schedule {
    queue: BinaryHeap<Reverse<(Instant, u64)>>,
    endpoints: HashMap<u64, Arc<TimeoutEndpoint>>,
}

impl Schedule {
    /// Drop heap entries of unregistered endpoints once they dominate the heap
    fn compact(&mut self) {
        if self.queue.len() < COMPACT_MIN_QUEUED || self.queue.len() <= self.endpoints.len() * 2 {
            return;
        }
        let Schedule { queue, endpoints } = self;
        let before = queue.len();
        queue.retain(|Reverse((_, id))| endpoints.contains_key(id));
        trace!(dropped = before - queue.len(), "Timeout queue compacted");
    }
}

struct Inner {
    schedule: Mutex<Schedule>,
    wake: Notify,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

/// Shared checker serving all time-bounded operations of the process
#[derive(Clone)]
pub struct TimeoutChecker {
    inner: Arc<Inner>,
}

impl TimeoutChecker {
    /// Create a checker and spawn its background loop on the current runtime
    pub fn start() -> Self {
        let checker = Self {
            inner: Arc::new(Inner {
                schedule: Mutex::new(Schedule::default()),
                wake: Notify::new(),
                next_id: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        };
        let inner = Arc::clone(&checker.inner);
        tokio::spawn(run_loop(inner));
        debug!("Timeout checker started");
        checker
    }

    /// Register a callback to run once `timeout` elapses
    pub fn register<F>(&self, timeout: Duration, callback: F) -> Arc<TimeoutEndpoint>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let endpoint = Arc::new(TimeoutEndpoint {
            id,
            deadline: Instant::now() + timeout,
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(Some(Box::new(callback))),
        });
        {
            let mut schedule = self.inner.schedule.lock();
            schedule.queue.push(Reverse((endpoint.deadline, id)));
            schedule.endpoints.insert(id, Arc::clone(&endpoint));
        }
        self.inner.wake.notify_one();
        trace!(endpoint_id = id, timeout_ms = timeout.as_millis() as u64, "Timeout registered");
        endpoint
    }

    /// Remove an endpoint. Idempotent. Returns `true` if the endpoint is now
    /// completed (its deadline can no longer fire), `false` if it already fired.
    pub fn unregister(&self, endpoint: &TimeoutEndpoint) -> bool {
        let completed = endpoint.complete();
        let mut schedule = self.inner.schedule.lock();
        schedule.endpoints.remove(&endpoint.id);
        schedule.compact();
        completed
    }

    /// Number of endpoints still waiting for their deadline
    pub fn len(&self) -> usize {
        self.inner.schedule.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the background loop. Pending endpoints never fire afterwards.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

async fn run_loop(inner: Arc<Inner>) {
    loop {
        let due = take_due(&inner);
        for endpoint in due {
            if endpoint.fire() {
                debug!(endpoint_id = endpoint.id, "Timeout fired");
            }
        }

        let next_deadline = {
            let schedule = inner.schedule.lock();
            schedule.queue.peek().map(|Reverse((deadline, _))| *deadline)
        };

        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = sleep_until_deadline(next_deadline) => {}
        }
    }
    debug!("Timeout checker stopped");
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Pop every elapsed deadline that is still registered
fn take_due(inner: &Inner) -> Vec<Arc<TimeoutEndpoint>> {
    let now = Instant::now();
    let mut schedule = inner.schedule.lock();
    let mut due = Vec::new();
    while let Some(Reverse((deadline, id))) = schedule.queue.peek().copied() {
        if deadline > now {
            break;
        }
        schedule.queue.pop();
        if let Some(endpoint) = schedule.endpoints.remove(&id) {
            due.push(endpoint);
        }
    }
    due
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_fires_after_deadline() {
        let checker = TimeoutChecker::start();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let endpoint = checker.register(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(endpoint.is_fired());
        assert!(!checker.unregister(&endpoint));
        assert!(checker.is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_deadlines_do_not_pile_up() {
        let checker = TimeoutChecker::start();
        let mut kept = Vec::new();
        for i in 0..1000 {
            let endpoint = checker.register(Duration::from_secs(3600), || {});
            if i % 100 == 0 {
                kept.push(endpoint);
            } else {
                assert!(checker.unregister(&endpoint));
            }
        }

        let queued = checker.inner.schedule.lock().queue.len();
        assert_eq!(checker.len(), 10);
        assert!(queued < COMPACT_MIN_QUEUED * 2, "queued: {}", queued);
        for endpoint in &kept {
            assert!(checker.unregister(endpoint));
        }
        checker.shutdown();
    }

    #[tokio::test]
    async fn test_unregister_before_deadline_prevents_fire() {
        let checker = TimeoutChecker::start();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let endpoint = checker.register(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(checker.unregister(&endpoint));
        assert!(checker.unregister(&endpoint));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sooner_deadline_wakes_loop() {
        let checker = TimeoutChecker::start();
        let _late = checker.register(Duration::from_secs(60), || {});
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        checker.register(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(checker.len(), 1);
        checker.shutdown();
    }

    #[test]
    fn test_fire_and_complete_are_exclusive() {
        let endpoint = TimeoutEndpoint {
            id: 1,
            deadline: Instant::now(),
            state: AtomicU8::new(PENDING),
            callback: Mutex::new(None),
        };
        assert!(endpoint.fire());
        assert!(!endpoint.complete());
        assert!(!endpoint.fire());
    }
}
