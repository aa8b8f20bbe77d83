//! Protocol stack assembly.
//!
//! A stack is an ordered chain of [`ProtocolLayer`]s with the transport
//! at the bottom and the fork multiplexer strictly last:
//!
//! ```text
//! [ fork multiplexer ]   <- always appended, top of stack
//! [ relay? ]             <- optional, directly below the multiplexer
//! [ protocol_n ]
//!   ...
//! [ protocol_1 ]
//! [ transport ]          <- index 0, owns the sockets
//! ```
//!
//! Inbound messages travel up the chain, outbound messages down. Each
//! configuration is invoked exactly once per `create_channel` call and
//! the socket-binding requirements of all layers are merged into one
//! aggregate map; a duplicate binding claim is a configuration error,
//! never a silent override.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use crate::config::{ProtocolConfig, ProtocolStackConfiguration, RelayConfig};
use crate::correlator::OrphanResponseCorrelator;
use crate::error::{Error, Result};
use crate::fork::ForkProtocol;
use crate::message::Message;
use crate::socket::{SocketBinding, SocketBindingMap};
use crate::transport::UdpTransport;

/// One position in a protocol stack.
///
/// Layers form a singly linked chain in each direction; `up` is called on
/// whatever thread the layer below delivers messages on and must not
/// block for unbounded time.
pub trait ProtocolLayer: Send + Sync {
    /// Layer name for diagnostics.
    fn name(&self) -> &str;

    /// Process an inbound message moving up the stack.
    fn up(&self, msg: Message);

    /// Process an outbound message moving down the stack.
    fn down(&self, msg: Message) -> Result<()>;

    /// Wire the neighbor above. Called once during assembly.
    fn set_up_layer(&self, layer: Arc<dyn ProtocolLayer>);

    /// Wire the neighbor below. Called once during assembly.
    fn set_down_layer(&self, layer: Arc<dyn ProtocolLayer>);

    /// Message counters for this layer. Zero when statistics are
    /// disabled on the stack.
    fn stats(&self) -> LayerStatsSnapshot;
}

/// Point-in-time view of one layer's message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayerStatsSnapshot {
    /// Messages that passed this layer moving up.
    pub up_messages: u64,
    /// Messages that passed this layer moving down.
    pub down_messages: u64,
}

/// Neighbor links and counters shared by every layer implementation.
pub(crate) struct LayerLinks {
    up: OnceLock<Arc<dyn ProtocolLayer>>,
    down: OnceLock<Arc<dyn ProtocolLayer>>,
    stats_enabled: bool,
    up_messages: AtomicU64,
    down_messages: AtomicU64,
}

impl LayerLinks {
    pub(crate) fn new(stats_enabled: bool) -> Self {
        Self {
            up: OnceLock::new(),
            down: OnceLock::new(),
            stats_enabled,
            up_messages: AtomicU64::new(0),
            down_messages: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_up(&self, layer: Arc<dyn ProtocolLayer>) {
        let _ = self.up.set(layer);
    }

    pub(crate) fn set_down(&self, layer: Arc<dyn ProtocolLayer>) {
        let _ = self.down.set(layer);
    }

    pub(crate) fn record_up(&self) {
        if self.stats_enabled {
            self.up_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_down(&self) {
        if self.stats_enabled {
            self.down_messages.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Forward a message to the neighbor above, dropping it at the top
    /// of the stack.
    pub(crate) fn pass_up(&self, msg: Message) {
        match self.up.get() {
            Some(layer) => layer.up(msg),
            None => tracing::trace!("message reached top of stack without a receiver"),
        }
    }

    /// Forward a message to the neighbor below.
    pub(crate) fn pass_down(&self, msg: Message) -> Result<()> {
        match self.down.get() {
            Some(layer) => layer.down(msg),
            None => Err(Error::Channel("layer has no downward neighbor".to_owned())),
        }
    }

    pub(crate) fn snapshot(&self) -> LayerStatsSnapshot {
        LayerStatsSnapshot {
            up_messages: self.up_messages.load(Ordering::Relaxed),
            down_messages: self.down_messages.load(Ordering::Relaxed),
        }
    }
}

/// Generic mid-stack layer for configured protocols.
///
/// The stack does not interpret protocol semantics beyond ordering;
/// configured layers forward messages unchanged and retain their name,
/// properties and counters for management tooling.
pub struct PassthroughLayer {
    config: ProtocolConfig,
    links: LayerLinks,
}

impl PassthroughLayer {
    pub(crate) fn new(config: ProtocolConfig, stats_enabled: bool) -> Self {
        Self {
            config,
            links: LayerLinks::new(stats_enabled),
        }
    }

    /// Configured properties of this layer.
    pub fn properties(&self) -> &HashMap<String, String> {
        self.config.properties()
    }
}

impl ProtocolLayer for PassthroughLayer {
    fn name(&self) -> &str {
        self.config.name()
    }

    fn up(&self, msg: Message) {
        self.links.record_up();
        self.links.pass_up(msg);
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

/// Cross-site relay position, directly below the fork multiplexer.
///
/// Site bridging itself is an external concern; locally the layer is
/// pass-through and only contributes its socket bindings and site name.
pub struct RelayLayer {
    config: RelayConfig,
    links: LayerLinks,
}

impl RelayLayer {
    pub(crate) fn new(config: RelayConfig, stats_enabled: bool) -> Self {
        Self {
            config,
            links: LayerLinks::new(stats_enabled),
        }
    }

    /// The local site name.
    pub fn site(&self) -> &str {
        self.config.site()
    }
}

impl ProtocolLayer for RelayLayer {
    fn name(&self) -> &str {
        "relay"
    }

    fn up(&self, msg: Message) {
        self.links.record_up();
        self.links.pass_up(msg);
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

/// The product of one assembly pass.
pub(crate) struct AssembledStack {
    /// All layers bottom to top; `layers[0]` is the transport, the last
    /// entry the fork multiplexer.
    pub(crate) layers: Vec<Arc<dyn ProtocolLayer>>,
    pub(crate) transport: Arc<UdpTransport>,
    pub(crate) fork: Arc<ForkProtocol>,
    pub(crate) bindings: SocketBindingMap,
}

/// Build the ordered layer chain for one channel.
pub(crate) fn assemble(config: &ProtocolStackConfiguration) -> Result<AssembledStack> {
    let transport_config = config.transport().ok_or(Error::MissingTransport)?;
    let stats_enabled = config.statistics_enabled();

    let mut bindings = SocketBindingMap::new();
    claim_binding(&mut bindings, "transport", transport_config.binding())?;

    let transport = Arc::new(UdpTransport::new(transport_config.clone(), stats_enabled));
    let mut layers: Vec<Arc<dyn ProtocolLayer>> = vec![transport.clone()];

    for protocol_config in config.protocols() {
        for binding in protocol_config.bindings() {
            claim_binding(&mut bindings, protocol_config.name(), binding)?;
        }
        layers.push(Arc::new(PassthroughLayer::new(
            protocol_config.clone(),
            stats_enabled,
        )));
    }

    if let Some(relay_config) = config.relay() {
        for binding in relay_config.bindings() {
            claim_binding(&mut bindings, "relay", binding)?;
        }
        layers.push(Arc::new(RelayLayer::new(relay_config.clone(), stats_enabled)));
    }

    // The multiplexer is always appended, even when no fork is ever
    // opened: it is also the extension point for orphan termination.
    let fork = Arc::new(ForkProtocol::new(stats_enabled));
    layers.push(fork.clone());

    for pair in layers.windows(2) {
        pair[0].set_up_layer(pair[1].clone());
        pair[1].set_down_layer(pair[0].clone());
    }

    // Synthetic responses enter the send path below the multiplexer so
    // they can never loop back through it.
    let below_fork = layers[layers.len() - 2].clone();
    fork.set_orphan_correlator(OrphanResponseCorrelator::new(below_fork));

    Ok(AssembledStack {
        layers,
        transport,
        fork,
        bindings,
    })
}

fn claim_binding(
    bindings: &mut SocketBindingMap,
    claimed_by: &str,
    binding: &SocketBinding,
) -> Result<()> {
    if bindings.contains_key(&binding.name) {
        return Err(Error::DuplicateBinding {
            name: binding.name.clone(),
            claimed_by: claimed_by.to_owned(),
        });
    }
    bindings.insert(binding.name.clone(), binding.clone());
    Ok(())
}
