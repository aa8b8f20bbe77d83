//! Membership convergence monitoring.
//!
//! Operational and test tooling often needs to hold a thread until a
//! distributed cache's membership has settled on an expected set of
//! nodes after a topology change. [`await_membership`] registers a
//! topology-change listener on the cache, compares the live member set
//! against the expected one, and blocks the calling thread on a timed
//! condition wait that is re-armed by every change notification.
//!
//! The notification callback never performs the comparison itself: it
//! only wakes the waiting thread, so the cache's event-delivery executor
//! stays free to deliver further events. Listener registration is
//! cleaned up unconditionally on both the success and the timeout path.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{ConvergenceTimeout, Error, Result};

/// A snapshot of a cache's membership.
///
/// Produced by the cache layer, observed (never mutated) by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipView {
    topology_id: u64,
    members: BTreeSet<String>,
}

impl MembershipView {
    /// Create a view with the given topology id and member identifiers.
    pub fn new<I, S>(topology_id: u64, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topology_id,
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Monotonically increasing id of the topology that produced this view.
    pub fn topology_id(&self) -> u64 {
        self.topology_id
    }

    /// The member identifiers, sorted.
    pub fn members(&self) -> &BTreeSet<String> {
        &self.members
    }
}

impl fmt::Display for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (topology id {})", self.members, self.topology_id)
    }
}

/// Opaque handle to a registered topology listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

impl ListenerHandle {
    /// Build a handle from a raw id. Intended for cache implementations.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The raw id.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Callback invoked after a membership change has taken effect locally.
///
/// "Post" semantics: the cache must never invoke the listener before the
/// change is visible through [`TopologyCache::current_view`]. Delivery
/// happens on the cache's own executor; implementations must not block it.
pub trait TopologyListener: Send + Sync {
    /// A topology change has been applied.
    fn topology_changed(&self, view: &MembershipView);
}

/// The monitor's view of a running distributed cache.
///
/// External collaborator contract: the cache computes membership and
/// delivers post-change notifications asynchronously on a non-blocking
/// executor of its own.
pub trait TopologyCache: Send + Sync {
    /// The current membership view.
    fn current_view(&self) -> MembershipView;

    /// Register a topology-change listener.
    fn add_listener(&self, listener: Arc<dyn TopologyListener>) -> ListenerHandle;

    /// Remove a previously registered listener. Returns `false` if the
    /// handle is unknown.
    fn remove_listener(&self, handle: ListenerHandle) -> bool;
}

/// Wakes the waiting thread on every topology change.
///
/// The condition variable is owned here, private to one wait, instead of
/// synchronizing on a shared object: the waker is a synchronization
/// primitive and nothing else.
#[derive(Default)]
struct TopologyWaker {
    generation: Mutex<u64>,
    condvar: Condvar,
}

impl TopologyListener for TopologyWaker {
    fn topology_changed(&self, view: &MembershipView) {
        // The member-set comparison runs on the waiting thread, not
        // here, so the cache's event-delivery executor is never blocked.
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.condvar.notify_all();
        tracing::trace!(topology_id = view.topology_id(), "topology change notification");
    }
}

/// Deregisters the listener on every exit path.
struct ListenerGuard<'a> {
    cache: &'a dyn TopologyCache,
    handle: ListenerHandle,
}

impl Drop for ListenerGuard<'_> {
    fn drop(&mut self) {
        if !self.cache.remove_listener(self.handle) {
            tracing::warn!("topology listener was already removed");
        }
    }
}

/// Block until the cache's member set equals `expected` or the timeout
/// expires.
///
/// Returns immediately (without blocking) when the sets already match at
/// call time. On expiry the error carries the last observed member set
/// and topology id so the caller can decide whether to retry with a
/// fresh deadline.
///
/// The wait observes every topology change that occurs after listener
/// registration: membership is recomputed eagerly at registration and
/// again on every wake-up before re-blocking, and the wake counter is
/// held across the comparison, so no notification can be lost.
pub fn await_membership<I, S>(
    cache: &dyn TopologyCache,
    expected: I,
    timeout: Duration,
) -> Result<MembershipView>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let expected: BTreeSet<String> = expected.into_iter().map(Into::into).collect();
    let waker = Arc::new(TopologyWaker::default());
    let handle = cache.add_listener(waker.clone());
    let _guard = ListenerGuard { cache, handle };

    let start = Instant::now();
    let deadline = start + timeout;

    let mut generation = waker.generation.lock();
    loop {
        let view = cache.current_view();
        if *view.members() == expected {
            tracing::info!(
                view = %view,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "successfully established view"
            );
            return Ok(view);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::ConvergenceTimeout(Box::new(ConvergenceTimeout {
                expected,
                observed: view.members().clone(),
                topology_id: view.topology_id(),
                waited: timeout,
            })));
        }
        tracing::info!(
            expected = ?expected,
            observed = ?view.members(),
            topology_id = view.topology_id(),
            "waiting for a topology change event"
        );
        // Spurious wake-ups only cost a recomputation.
        let _ = waker.condvar.wait_for(&mut generation, deadline - now);
    }
}
