//! Fork multiplexing: several logical sub-channels over one physical
//! channel.
//!
//! The [`ForkProtocol`] is the topmost layer of every assembled stack.
//! Inbound messages carrying a fork envelope are demultiplexed to the
//! handler registered for the fork id; messages without an envelope go
//! to the channel-level receiver. A message addressed to a fork that is
//! not registered locally takes a three-way branch:
//!
//! 1. fork known: dispatch to its handler,
//! 2. fork unknown, message is not a response-expecting request: drop,
//! 3. fork unknown, message is a request expecting a response: hand to
//!    the [`OrphanResponseCorrelator`] so the remote requester is
//!    unblocked immediately instead of running into its timeout.
//!
//! The third branch covers the race between an in-flight call and an
//! undeploy removing the target fork on this node.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::correlator::OrphanResponseCorrelator;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::stack::{LayerLinks, LayerStatsSnapshot, ProtocolLayer};

/// Receiver for messages delivered to a fork or to the channel itself.
///
/// Invoked on the transport's delivery thread; implementations must not
/// block it for unbounded time.
pub trait MessageHandler: Send + Sync {
    /// Deliver one inbound message.
    fn on_message(&self, msg: Message);
}

/// The fork multiplexer layer.
pub struct ForkProtocol {
    links: LayerLinks,
    forks: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
    receiver: RwLock<Option<Arc<dyn MessageHandler>>>,
    orphan: OnceLock<OrphanResponseCorrelator>,
}

impl ForkProtocol {
    pub(crate) fn new(stats_enabled: bool) -> Self {
        Self {
            links: LayerLinks::new(stats_enabled),
            forks: RwLock::new(HashMap::new()),
            receiver: RwLock::new(None),
            orphan: OnceLock::new(),
        }
    }

    pub(crate) fn set_orphan_correlator(&self, correlator: OrphanResponseCorrelator) {
        let _ = self.orphan.set(correlator);
    }

    /// Register a handler for a fork id.
    ///
    /// Multiplexing is one-to-one per physical channel: a second
    /// registration under the same id is a configuration error.
    pub fn register(&self, fork_id: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let fork_id = fork_id.into();
        let mut forks = self.forks.write();
        if forks.contains_key(&fork_id) {
            return Err(Error::DuplicateFork(fork_id));
        }
        tracing::debug!(fork = %fork_id, "registered fork");
        forks.insert(fork_id, handler);
        Ok(())
    }

    /// Remove the handler for a fork id. Returns `false` if the id was
    /// not registered.
    pub fn deregister(&self, fork_id: &str) -> bool {
        let removed = self.forks.write().remove(fork_id).is_some();
        if removed {
            tracing::debug!(fork = %fork_id, "deregistered fork");
        }
        removed
    }

    /// Whether a handler is registered for the fork id.
    pub fn is_registered(&self, fork_id: &str) -> bool {
        self.forks.read().contains_key(fork_id)
    }

    /// Install the receiver for non-multiplexed messages.
    pub(crate) fn set_receiver(&self, handler: Arc<dyn MessageHandler>) {
        *self.receiver.write() = Some(handler);
    }
}

impl ProtocolLayer for ForkProtocol {
    fn name(&self) -> &str {
        "fork"
    }

    fn up(&self, msg: Message) {
        self.links.record_up();
        let Some(fork) = msg.fork.as_ref() else {
            // Not multiplexed: deliver to the channel-level receiver.
            match self.receiver.read().clone() {
                Some(receiver) => receiver.on_message(msg),
                None => tracing::trace!("dropping message: channel has no receiver"),
            }
            return;
        };

        let handler = self.forks.read().get(&fork.channel_id).cloned();
        match handler {
            Some(handler) => handler.on_message(msg),
            None => {
                let awaits_response = msg
                    .correlation
                    .map_or(false, |header| header.awaits_response());
                if awaits_response {
                    match self.orphan.get() {
                        Some(correlator) => correlator.handle(msg),
                        None => tracing::warn!(
                            fork = %fork.channel_id,
                            "orphaned request dropped: correlator not installed"
                        ),
                    }
                } else {
                    // One-way message to a missing fork: nothing waits
                    // for it, dropping is the correct outcome.
                    tracing::trace!(fork = %fork.channel_id, "dropping message for unknown fork");
                }
            }
        }
    }

    fn down(&self, msg: Message) -> Result<()> {
        self.links.record_down();
        self.links.pass_down(msg)
    }

    fn set_up_layer(&self, layer: Arc<dyn ProtocolLayer>) {
        self.links.set_up(layer);
    }

    fn set_down_layer(&self, layer: Arc<dyn ProtocolLayer>) {
        self.links.set_down(layer);
    }

    fn stats(&self) -> LayerStatsSnapshot {
        self.links.snapshot()
    }
}
