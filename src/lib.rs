//! # fork-channel
//!
//! A multiplexed group-communication channel assembled from declarative
//! configuration, plus a membership-convergence monitor for the cache
//! layer built on top of it.
//!
//! One physical channel carries several logical sub-channels ("forks"),
//! each identified by a fork id embedded in the message envelope. The
//! stack is assembled bottom-up from configuration, the transport's
//! sockets are created through the server's socket-binding registry, and
//! requests addressed to a fork that no longer exists are answered with
//! an identifiable synthetic response instead of leaving the requester
//! blocked.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Fork handlers (per deployment)             │
//! └────────────┬────────────────────┬────────────────────────────┘
//!              │ register/deregister│ on_message()
//! ┌────────────▼────────────────────▼────────────────────────────┐
//! │                       ForkProtocol                            │
//! │  (demultiplexes by fork id; orphaned requests -> correlator)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │                       RelayLayer?                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │                  PassthroughLayer * n                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │                       UdpTransport                            │
//! │      (sockets via ManagedSocketFactory -> registry)           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`ChannelFactory::create_channel`] builds the chain in this order,
//! installs the [`ManagedSocketFactory`] into the transport and attaches
//! the [`TopologyAddressGenerator`]. Independently,
//! [`await_membership`] blocks a caller until a distributed cache's
//! member set converges to an expected target set, re-checking on every
//! topology-change notification.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use fork_channel::{
//!     ChannelFactory, InMemorySocketRegistry, ProtocolConfig,
//!     ProtocolStackConfiguration, SocketBinding, TransportConfig,
//! };
//!
//! let registry = Arc::new(InMemorySocketRegistry::new());
//! let config = ProtocolStackConfiguration::new("node-1", registry)
//!     .with_transport(TransportConfig::new(SocketBinding::new(
//!         "jgroups-udp",
//!         "0.0.0.0:7600".parse().unwrap(),
//!     )))
//!     .with_protocol(ProtocolConfig::new("FD_ALL"))
//!     .with_statistics(true);
//!
//! let factory = ChannelFactory::new(config);
//! let channel = factory.create_channel("ee")?;
//! channel.connect().await?;
//! channel.register_fork("web", Arc::new(my_handler))?;
//! # Ok::<(), fork_channel::Error>(())
//! ```

#![deny(missing_docs)]

mod address;
mod config;
mod correlator;
mod error;
mod factory;
mod fork;
mod message;
mod monitor;
mod socket;
mod stack;
pub mod testing;
mod transport;

pub use address::{TopologyAddress, TopologyAddressGenerator, TopologyMetadata};
pub use config::{ProtocolConfig, ProtocolStackConfiguration, RelayConfig, TransportConfig};
pub use correlator::OrphanResponseCorrelator;
pub use error::{ConvergenceTimeout, Error, Result};
pub use factory::{Channel, ChannelFactory};
pub use fork::{ForkProtocol, MessageHandler};
pub use message::{CorrelationHeader, CorrelationType, Flags, ForkHeader, Message};
pub use monitor::{
    await_membership, ListenerHandle, MembershipView, TopologyCache, TopologyListener,
};
pub use socket::{
    InMemorySocketRegistry, ManagedSocketFactory, SocketBinding, SocketBindingMap,
    SocketBindingRegistry,
};
pub use stack::{LayerStatsSnapshot, PassthroughLayer, ProtocolLayer, RelayLayer};
pub use transport::{TransportError, UdpTransport};
