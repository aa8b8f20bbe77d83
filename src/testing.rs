//! In-process test doubles for the external collaborators.
//!
//! Production deployments wire the channel against a real server
//! registry and a real distributed cache. The doubles here stand in for
//! those collaborators in integration tests and demos:
//!
//! - [`ScriptedTopologyCache`]: a cache whose membership views are
//!   installed by the test, with post-change notifications delivered
//!   asynchronously off the installing thread, like a real cache's
//!   non-blocking event executor.
//! - [`RecordingHandler`]: a fork handler that forwards every delivered
//!   message into an awaitable queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fork::MessageHandler;
use crate::message::Message;
use crate::monitor::{ListenerHandle, MembershipView, TopologyCache, TopologyListener};

/// Topology cache double with test-controlled membership views.
pub struct ScriptedTopologyCache {
    view: Mutex<MembershipView>,
    listeners: Mutex<HashMap<u64, Arc<dyn TopologyListener>>>,
    next_handle: AtomicU64,
}

impl ScriptedTopologyCache {
    /// Create a cache presenting the given initial view.
    pub fn new(initial: MembershipView) -> Self {
        Self {
            view: Mutex::new(initial),
            listeners: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Install a new membership view and notify listeners.
    ///
    /// The view becomes visible through [`TopologyCache::current_view`]
    /// before any listener runs ("post" semantics), and notifications
    /// are delivered on a separate thread so the installer is never
    /// blocked by listener logic.
    pub fn install_view(&self, view: MembershipView) {
        *self.view.lock() = view.clone();
        let listeners: Vec<_> = self.listeners.lock().values().cloned().collect();
        if listeners.is_empty() {
            return;
        }
        std::thread::spawn(move || {
            for listener in listeners {
                listener.topology_changed(&view);
            }
        });
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl TopologyCache for ScriptedTopologyCache {
    fn current_view(&self) -> MembershipView {
        self.view.lock().clone()
    }

    fn add_listener(&self, listener: Arc<dyn TopologyListener>) -> ListenerHandle {
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().insert(id, listener);
        ListenerHandle::from_raw(id)
    }

    fn remove_listener(&self, handle: ListenerHandle) -> bool {
        self.listeners.lock().remove(&handle.raw()).is_some()
    }
}

/// Fork handler forwarding every delivery into an awaitable queue.
#[derive(Clone)]
pub struct RecordingHandler {
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// Queue of delivered messages, in arrival order.
    pub fn received(&self) -> async_channel::Receiver<Message> {
        self.rx.clone()
    }

    /// Number of messages delivered so far and not yet consumed.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for RecordingHandler {
    fn on_message(&self, msg: Message) {
        let _ = self.tx.try_send(msg);
    }
}
