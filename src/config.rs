//! Declarative configuration for one protocol stack.
//!
//! A [`ProtocolStackConfiguration`] is the immutable description of one
//! channel family: a transport at the bottom, zero or more named protocol
//! layers, an optional cross-site relay, the node name, the stack-wide
//! statistics toggle and the socket-binding registry every managed socket
//! is created through. It is built once from the management model and
//! owned by the [`ChannelFactory`](crate::ChannelFactory) for the
//! lifetime of the channel family; layer instances are created fresh per
//! `create_channel` call.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::TopologyMetadata;
use crate::socket::{SocketBinding, SocketBindingRegistry};

/// Configuration of the bottom transport layer.
///
/// The transport owns outbound socket creation; its primary socket is
/// described by a [`SocketBinding`] so it is created through the managed
/// socket factory and tracked by the registry.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    binding: SocketBinding,
    properties: HashMap<String, String>,
    topology: Option<TopologyMetadata>,
}

impl TransportConfig {
    /// Create a transport configuration bound to the given binding.
    pub fn new(binding: SocketBinding) -> Self {
        Self {
            binding,
            properties: HashMap::new(),
            topology: None,
        }
    }

    /// Attach a named property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Attach static topology metadata (site/rack/machine) to be carried
    /// by the node's generated address.
    pub fn with_topology(mut self, topology: TopologyMetadata) -> Self {
        self.topology = Some(topology);
        self
    }

    /// The transport's primary socket binding.
    pub fn binding(&self) -> &SocketBinding {
        &self.binding
    }

    /// Configured properties.
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Topology metadata, if configured.
    pub fn topology(&self) -> Option<&TopologyMetadata> {
        self.topology.as_ref()
    }
}

/// Configuration of one mid-stack protocol layer.
///
/// Each instance is a factory for exactly one layer position; order in
/// the stack configuration is the order in the assembled stack. The
/// property map is opaque to the stack: it is retained on the layer for
/// inspection by management tooling and unknown properties are not an
/// error.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    name: String,
    properties: HashMap<String, String>,
    bindings: Vec<SocketBinding>,
}

impl ProtocolConfig {
    /// Create a protocol configuration with the given layer name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
            bindings: Vec::new(),
        }
    }

    /// Attach a named property.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Declare a socket binding required by this layer.
    pub fn with_binding(mut self, binding: SocketBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// The layer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured properties.
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Socket bindings required by this layer.
    pub fn bindings(&self) -> &[SocketBinding] {
        &self.bindings
    }
}

/// Configuration of the optional cross-site relay layer.
///
/// When present, the relay always occupies the position directly below
/// the fork multiplexer. Actual site bridging is delegated to the peer
/// site's stack; locally the layer is pass-through.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    site: String,
    bindings: Vec<SocketBinding>,
}

impl RelayConfig {
    /// Create a relay configuration for the local site name.
    pub fn new(site: impl Into<String>) -> Self {
        Self {
            site: site.into(),
            bindings: Vec::new(),
        }
    }

    /// Declare a socket binding required by the relay.
    pub fn with_binding(mut self, binding: SocketBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// The local site name.
    pub fn site(&self) -> &str {
        &self.site
    }

    /// Socket bindings required by the relay.
    pub fn bindings(&self) -> &[SocketBinding] {
        &self.bindings
    }
}

/// Ordered description of one protocol stack.
#[derive(Clone)]
pub struct ProtocolStackConfiguration {
    node_name: String,
    statistics_enabled: bool,
    transport: Option<TransportConfig>,
    protocols: Vec<ProtocolConfig>,
    relay: Option<RelayConfig>,
    registry: Arc<dyn SocketBindingRegistry>,
}

impl ProtocolStackConfiguration {
    /// Create a stack configuration for the given node.
    ///
    /// The configuration is not usable for channel creation until a
    /// transport has been attached with [`with_transport`](Self::with_transport);
    /// assembly reports a configuration error otherwise.
    pub fn new(node_name: impl Into<String>, registry: Arc<dyn SocketBindingRegistry>) -> Self {
        Self {
            node_name: node_name.into(),
            statistics_enabled: false,
            transport: None,
            protocols: Vec::new(),
            relay: None,
            registry,
        }
    }

    /// Attach the transport configuration.
    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Append a protocol layer configuration.
    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Attach the optional relay configuration.
    pub fn with_relay(mut self, relay: RelayConfig) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Enable or disable per-layer message statistics.
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.statistics_enabled = enabled;
        self
    }

    /// The node name; also used as the channel's logical name.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Whether per-layer statistics are enabled.
    pub fn statistics_enabled(&self) -> bool {
        self.statistics_enabled
    }

    /// The transport configuration, if any.
    pub fn transport(&self) -> Option<&TransportConfig> {
        self.transport.as_ref()
    }

    /// Mid-stack protocol configurations in stack order.
    pub fn protocols(&self) -> &[ProtocolConfig] {
        &self.protocols
    }

    /// The relay configuration, if any.
    pub fn relay(&self) -> Option<&RelayConfig> {
        self.relay.as_ref()
    }

    /// The socket-binding registry managed sockets are created through.
    pub fn registry(&self) -> &Arc<dyn SocketBindingRegistry> {
        &self.registry
    }
}

impl fmt::Debug for ProtocolStackConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolStackConfiguration")
            .field("node_name", &self.node_name)
            .field("statistics_enabled", &self.statistics_enabled)
            .field("transport", &self.transport)
            .field("protocols", &self.protocols)
            .field("relay", &self.relay)
            .finish_non_exhaustive()
    }
}
