//! Channel factory: orchestrates stack assembly into a usable channel.
//!
//! `create_channel` builds the ordered layer chain, installs the managed
//! socket factory into the transport, and attaches the topology address
//! generator. Construction-time errors abort the whole build; a
//! partially-usable channel is never returned. The returned [`Channel`]
//! is not yet connected: `connect` binds the sockets and starts I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::address::{TopologyAddress, TopologyAddressGenerator};
use crate::config::ProtocolStackConfiguration;
use crate::error::Result;
use crate::fork::{ForkProtocol, MessageHandler};
use crate::message::Message;
use crate::socket::{ManagedSocketFactory, SocketBindingMap};
use crate::stack::{assemble, LayerStatsSnapshot, ProtocolLayer};
use crate::transport::UdpTransport;

/// Factory for fork-able channels.
///
/// Owns the stack configuration for one channel family; each
/// `create_channel` call produces a fresh set of layer instances.
pub struct ChannelFactory {
    configuration: ProtocolStackConfiguration,
}

impl ChannelFactory {
    /// Create a factory over the given stack configuration.
    pub fn new(configuration: ProtocolStackConfiguration) -> Self {
        Self { configuration }
    }

    /// The stack configuration this factory builds channels from.
    pub fn configuration(&self) -> &ProtocolStackConfiguration {
        &self.configuration
    }

    /// Assemble a channel with the given id.
    pub fn create_channel(&self, id: &str) -> Result<Channel> {
        let stack = assemble(&self.configuration)?;

        // Every socket the transport opens goes through the registry so
        // the server's socket-binding lifecycle can track and close it.
        let socket_factory = ManagedSocketFactory::new(
            self.configuration.registry().clone(),
            stack.bindings.clone(),
        );
        stack.transport.set_socket_factory(socket_factory);

        let generator = TopologyAddressGenerator::new(stack.transport.topology().cloned());
        let bindings = stack.bindings;

        tracing::debug!(
            channel = %id,
            node = %self.configuration.node_name(),
            layers = stack.layers.len(),
            "assembled channel stack"
        );

        Ok(Channel {
            name: id.to_owned(),
            node_name: self.configuration.node_name().to_owned(),
            layers: stack.layers,
            transport: stack.transport,
            fork: stack.fork,
            generator,
            bindings,
            open: AtomicBool::new(false),
        })
    }

    /// Whether a response is the synthetic answer to a request that
    /// targeted an unknown fork.
    ///
    /// Synthetic responses are the only responses without a payload, so
    /// callers use this to filter them out of application traffic.
    pub fn is_unknown_fork_response(response: &Message) -> bool {
        !response.has_payload()
    }
}

/// An assembled group-communication channel.
///
/// The channel owns all its protocol-layer instances; no layer is shared
/// across channels. Fork registration is expected to happen under
/// external synchronization (deployment sequencing); steady-state
/// dispatch only reads the fork table.
pub struct Channel {
    name: String,
    node_name: String,
    layers: Vec<Arc<dyn ProtocolLayer>>,
    transport: Arc<UdpTransport>,
    fork: Arc<ForkProtocol>,
    generator: TopologyAddressGenerator,
    bindings: SocketBindingMap,
    open: AtomicBool,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("node_name", &self.node_name)
            .field("open", &self.open)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// The channel id this channel was created with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The logical node name from the stack configuration.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Bind the transport socket and start I/O.
    pub async fn connect(&self) -> Result<()> {
        self.transport.clone().connect().await?;
        self.open.store(true, Ordering::SeqCst);
        tracing::info!(
            channel = %self.name,
            node = %self.node_name,
            addr = %self.transport.local_addr(),
            "channel connected"
        );
        Ok(())
    }

    /// Stop I/O and release managed sockets. Idempotent.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.transport.stop();
            tracing::info!(channel = %self.name, "channel closed");
        }
    }

    /// Whether the channel is currently connected.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The node's self-address: transport address plus configured
    /// topology metadata.
    pub fn address(&self) -> TopologyAddress {
        self.generator.generate(self.transport.local_addr())
    }

    /// Send a message down the full stack.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.fork.down(msg)
    }

    /// Register a handler for a logical sub-channel.
    pub fn register_fork(
        &self,
        fork_id: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.fork.register(fork_id, handler)
    }

    /// Remove a sub-channel handler. Returns `false` if the id was not
    /// registered.
    pub fn deregister_fork(&self, fork_id: &str) -> bool {
        self.fork.deregister(fork_id)
    }

    /// Whether a sub-channel handler is registered for the id.
    pub fn is_fork_registered(&self, fork_id: &str) -> bool {
        self.fork.is_registered(fork_id)
    }

    /// Install the receiver for messages that carry no fork envelope.
    pub fn set_receiver(&self, handler: Arc<dyn MessageHandler>) {
        self.fork.set_receiver(handler);
    }

    /// The aggregate socket-binding map merged across all layers of
    /// this channel's stack.
    pub fn socket_bindings(&self) -> &SocketBindingMap {
        &self.bindings
    }

    /// Layer names, bottom to top.
    pub fn layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name().to_owned()).collect()
    }

    /// Per-layer message counters, bottom to top. All zero unless the
    /// stack was configured with statistics enabled.
    pub fn layer_stats(&self) -> Vec<(String, LayerStatsSnapshot)> {
        self.layers
            .iter()
            .map(|l| (l.name().to_owned(), l.stats()))
            .collect()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}
