//! Service CIDR discovery controller.
//!
//! The [`ServiceCidrDiscoverer`] consumes a queue of Service keys fed by a
//! watch layer, resolves each key to its current cluster IPs through an
//! injected [`ServiceIpResolver`], folds every address into the matching
//! family's [`CidrTracker`], and fans out to registered event handlers
//! whenever a covering block grows.
//!
//! Because the covering blocks never shrink, a deletion needs no special
//! handling: reprocessing the key simply resolves to no addresses and
//! leaves the trackers alone. For the same reason the queue is free to
//! coalesce duplicate keys, since processing always re-derives the
//! current state from the resolver rather than from notification
//! payloads.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Notify, oneshot};

use crate::cidr::{CidrBlock, CidrTracker, IpFamily};

/// Error type for Service CIDR queries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No address of the requested family has been observed yet.
    #[error("{family} Service CIDR is not available yet")]
    CidrNotAvailable {
        /// The family the caller asked for.
        family: IpFamily,
    },
}

/// Identifies a Service across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    /// Namespace the Service lives in.
    pub namespace: String,
    /// The Service's name.
    pub name: String,
}

impl ServiceKey {
    /// Creates a key from a namespace and name.
    #[must_use]
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A grown covering block delivered to event handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CidrUpdate {
    /// Family whose block grew.
    pub family: IpFamily,
    /// The new covering block for that family.
    pub cidr: CidrBlock,
}

/// Resolves a Service key to its current cluster IP addresses.
///
/// Implementations return the concrete addresses currently assigned to
/// the Service; a headless Service or a key that no longer resolves
/// contributes no addresses. Resolution happens at processing time, so
/// the discoverer never retains stale per-Service state.
pub trait ServiceIpResolver: Send + Sync {
    /// Current cluster IPs for `key`, empty if none.
    fn resolve(&self, key: &ServiceKey) -> Vec<IpAddr>;
}

/// Callback invoked with the covering blocks that grew during one
/// processing pass.
///
/// Handlers are shared so delivery can run on a snapshot of the
/// registry without holding its lock.
pub type CidrEventHandler = Arc<dyn Fn(&[CidrUpdate]) + Send + Sync>;

#[derive(Default)]
struct PendingKeys {
    queue: VecDeque<ServiceKey>,
    queued: HashSet<ServiceKey>,
}

struct Trackers {
    v4: CidrTracker,
    v6: CidrTracker,
}

impl Trackers {
    fn get(&self, family: IpFamily) -> &CidrTracker {
        match family {
            IpFamily::V4 => &self.v4,
            IpFamily::V6 => &self.v6,
        }
    }

    fn get_mut(&mut self, family: IpFamily) -> &mut CidrTracker {
        match family {
            IpFamily::V4 => &mut self.v4,
            IpFamily::V6 => &mut self.v6,
        }
    }
}

/// Discovers the Service CIDRs in use by a cluster, one per IP family.
///
/// A single worker task (see [`run`](Self::run)) drains the pending-key
/// queue and is the only writer of tracker state; queries and handler
/// registration are safe from any task at any time.
pub struct ServiceCidrDiscoverer {
    resolver: Arc<dyn ServiceIpResolver>,
    trackers: Mutex<Trackers>,
    pending: Mutex<PendingKeys>,
    wakeup: Notify,
    handlers: Mutex<Vec<CidrEventHandler>>,
}

// No lock is held across handler callbacks, so a poisoned lock only
// means some other holder panicked mid-read; the protected values are
// still consistent and safe to reuse.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceCidrDiscoverer {
    /// Creates a discoverer with no observed addresses.
    #[must_use]
    pub fn new(resolver: Arc<dyn ServiceIpResolver>) -> Self {
        Self {
            resolver,
            trackers: Mutex::new(Trackers {
                v4: CidrTracker::new(IpFamily::V4),
                v6: CidrTracker::new(IpFamily::V6),
            }),
            pending: Mutex::new(PendingKeys::default()),
            wakeup: Notify::new(),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a handler invoked, in registration order, every time a
    /// covering block grows.
    ///
    /// Register handlers before [`run`](Self::run) to observe the first
    /// computed CIDRs; registration remains safe while running and never
    /// waits for an in-progress delivery.
    pub fn add_event_handler(&self, handler: impl Fn(&[CidrUpdate]) + Send + Sync + 'static) {
        lock(&self.handlers).push(Arc::new(handler));
    }

    /// Returns the current covering block for `family`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CidrNotAvailable`] while no address of that
    /// family has been observed.
    pub fn get_service_cidr(&self, family: IpFamily) -> Result<CidrBlock, Error> {
        lock(&self.trackers)
            .get(family)
            .current()
            .ok_or(Error::CidrNotAvailable { family })
    }

    /// Marks a Service key as needing (re)processing.
    ///
    /// Safe to call from any task or thread; duplicate keys already
    /// waiting in the queue are coalesced.
    pub fn enqueue(&self, key: ServiceKey) {
        {
            let mut pending = lock(&self.pending);
            if !pending.queued.insert(key.clone()) {
                return;
            }
            pending.queue.push_back(key);
        }
        self.wakeup.notify_one();
    }

    /// Drains the pending-key queue until `shutdown` fires.
    ///
    /// Processes one key at a time; an in-flight key is always finished
    /// before shutdown takes effect, and remaining queued keys are left
    /// undrained.
    pub async fn run(&self, mut shutdown: oneshot::Receiver<()>) {
        tracing::debug!("Service CIDR discovery started");
        loop {
            let key = tokio::select! {
                _ = &mut shutdown => break,
                key = self.next_key() => key,
            };
            self.process(&key);
        }
        tracing::debug!("Service CIDR discovery stopped");
    }

    async fn next_key(&self) -> ServiceKey {
        loop {
            // Arm the waiter before checking the queue so a key enqueued
            // in between is not missed.
            let notified = self.wakeup.notified();
            if let Some(key) = self.pop_key() {
                return key;
            }
            notified.await;
        }
    }

    fn pop_key(&self) -> Option<ServiceKey> {
        let mut pending = lock(&self.pending);
        let key = pending.queue.pop_front()?;
        pending.queued.remove(&key);
        Some(key)
    }

    fn process(&self, key: &ServiceKey) {
        let ips = self.resolver.resolve(key);
        tracing::debug!("processing Service {key}: {} cluster IP(s)", ips.len());

        let updates: Vec<CidrUpdate> = {
            let mut trackers = lock(&self.trackers);
            let mut changed = Vec::new();
            for ip in ips {
                let family = IpFamily::of(ip);
                if trackers.get_mut(family).observe(ip) && !changed.contains(&family) {
                    changed.push(family);
                }
            }
            changed
                .into_iter()
                .filter_map(|family| {
                    trackers
                        .get(family)
                        .current()
                        .map(|cidr| CidrUpdate { family, cidr })
                })
                .collect()
        };

        if !updates.is_empty() {
            self.notify_handlers(&updates);
        }
    }

    fn notify_handlers(&self, updates: &[CidrUpdate]) {
        // Deliver to a snapshot so registration never waits on a slow
        // handler; handlers added mid-delivery see the next change.
        let handlers: Vec<CidrEventHandler> = lock(&self.handlers).clone();
        for (i, handler) in handlers.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| handler(updates))).is_err() {
                tracing::error!("Service CIDR event handler #{i} panicked");
            }
        }
    }
}
