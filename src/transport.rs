//! UDP transport layer: the bottom of every stack.
//!
//! The transport owns the channel's sockets. It never creates them
//! itself: the [`ManagedSocketFactory`] installed by the channel factory
//! decides whether a requested address belongs to a managed binding and
//! routes creation through the socket-binding registry accordingly.
//! Socket setup and all blocking I/O run on the tokio runtime, never on
//! the thread assembling the stack, and the downward send path is a
//! fire-and-forget queue drained by a writer task.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::address::{TopologyAddress, TopologyMetadata};
use crate::config::TransportConfig;
use crate::error::{Error as ChannelError, Result};
use crate::message::Message;
use crate::socket::ManagedSocketFactory;
use crate::stack::{LayerLinks, LayerStatsSnapshot, ProtocolLayer};

/// Largest datagram the transport will receive.
const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The channel factory never installed a socket factory.
    #[error("no socket factory installed on the transport")]
    FactoryMissing,

    /// Socket creation for the given local address failed.
    #[error("failed to create socket for {addr}: {source}")]
    Bind {
        /// Requested local address.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Any other socket-level I/O failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),
}

/// Bottom protocol layer speaking UDP.
pub struct UdpTransport {
    config: TransportConfig,
    links: LayerLinks,
    factory: OnceLock<ManagedSocketFactory>,
    outbound_tx: async_channel::Sender<Message>,
    outbound_rx: async_channel::Receiver<Message>,
    local_addr: OnceLock<SocketAddr>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl UdpTransport {
    pub(crate) fn new(config: TransportConfig, stats_enabled: bool) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        Self {
            config,
            links: LayerLinks::new(stats_enabled),
            factory: OnceLock::new(),
            outbound_tx,
            outbound_rx,
            local_addr: OnceLock::new(),
            tasks: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    /// Install the socket factory all socket creation goes through.
    /// Called once by the channel factory before `connect`.
    pub(crate) fn set_socket_factory(&self, factory: ManagedSocketFactory) {
        let _ = self.factory.set(factory);
    }

    /// Static topology metadata configured for this transport.
    pub(crate) fn topology(&self) -> Option<&TopologyMetadata> {
        self.config.topology()
    }

    /// The bound local address once connected, the configured address
    /// before that.
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
            .get()
            .copied()
            .unwrap_or(self.config.binding().addr)
    }

    /// Bind the socket and start the receive and send tasks.
    ///
    /// A failed bind leaves the transport disconnected; the caller owns
    /// the retry policy and may call `connect` again.
    pub(crate) async fn connect(self: Arc<Self>) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(ChannelError::Channel(
                "transport is already connected".to_owned(),
            ));
        }
        match self.clone().bind_and_start().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn bind_and_start(self: Arc<Self>) -> Result<()> {
        let factory = self
            .factory
            .get()
            .cloned()
            .ok_or(TransportError::FactoryMissing)?;
        let addr = self.config.binding().addr;

        // Socket setup may block (name resolution, kernel limits); keep
        // it off the control thread.
        let std_socket = tokio::task::spawn_blocking(move || factory.create_datagram_socket(addr))
            .await
            .map_err(|err| ChannelError::Channel(format!("socket setup task failed: {err}")))?
            .map_err(|source| TransportError::Bind { addr, source })?;
        let socket = Arc::new(tokio::net::UdpSocket::from_std(std_socket).map_err(TransportError::Socket)?);
        let local = socket.local_addr().map_err(TransportError::Socket)?;
        let _ = self.local_addr.set(local);
        tracing::debug!(%local, "transport connected");

        let recv_socket = socket.clone();
        let this = self.clone();
        let recv_task = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, from)) => match Message::decode_from_slice(&buf[..len]) {
                        Some(mut msg) => {
                            if msg.src.is_none() {
                                msg.src = Some(TopologyAddress::new(from));
                            }
                            this.links.record_up();
                            this.links.pass_up(msg);
                        }
                        None => tracing::warn!(%from, len, "dropping undecodable datagram"),
                    },
                    Err(err) => {
                        tracing::debug!(error = %err, "receive loop terminated");
                        break;
                    }
                }
            }
        });

        let outbound_rx = self.outbound_rx.clone();
        let send_task = tokio::spawn(async move {
            while let Ok(msg) = outbound_rx.recv().await {
                let Some(dest) = msg.dest.as_ref().map(|d| d.addr()) else {
                    // Group delivery is the job of the membership layer
                    // above; a destination-less message stops here.
                    tracing::trace!("dropping outbound message without destination");
                    continue;
                };
                let frame = msg.encode_to_bytes();
                if let Err(err) = socket.send_to(&frame, dest).await {
                    tracing::debug!(%dest, error = %err, "failed to send datagram");
                }
            }
        });

        self.tasks.lock().extend([recv_task, send_task]);
        Ok(())
    }

    /// Stop I/O tasks and release the managed binding.
    pub(crate) fn stop(&self) {
        self.outbound_tx.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Some(factory) = self.factory.get() {
            factory.release(&self.config.binding().name);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl ProtocolLayer for UdpTransport {
    fn name(&self) -> &str {
        "udp"
    }

    fn up(&self, msg: Message) {
        self.links.record_up();
        self.links.pass_up(msg);
    }

    fn down(&self, msg: Message) -> Result<()> {
        self.links.record_down();
        self.outbound_tx
            .try_send(msg)
            .map_err(|_| ChannelError::Shutdown)
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
