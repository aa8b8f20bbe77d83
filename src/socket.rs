//! Managed socket creation through a socket-binding registry.
//!
//! The server owns its network endpoints: every socket used by the
//! communication stack should be created through the [`SocketBindingRegistry`]
//! so it is centrally tracked and can be released by the server's
//! socket-binding lifecycle, independent of the channel's own shutdown
//! path. The [`ManagedSocketFactory`] sits between the transport layer and
//! the registry and decides, per creation request, whether the requested
//! local address belongs to a configured binding (create through the
//! registry) or not (fall back to direct creation).

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

/// A named, centrally managed network endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketBinding {
    /// Logical binding name, unique within the server.
    pub name: String,
    /// Local address the binding resolves to.
    pub addr: SocketAddr,
}

impl SocketBinding {
    /// Create a binding descriptor.
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for SocketBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.addr)
    }
}

/// Aggregate mapping from binding name to binding descriptor, merged
/// across all protocol configurations of one stack.
pub type SocketBindingMap = HashMap<String, SocketBinding>;

/// Registry owning the server's managed sockets.
///
/// This is an external collaborator: the server implementation decides
/// how sockets are tracked and closed. Implementations must serialize
/// concurrent bind/unbind calls internally. The registry may retain its
/// own handle to a socket it hands out in order to close it centrally.
pub trait SocketBindingRegistry: Send + Sync {
    /// Bind a datagram socket for the given binding and hand it to the
    /// caller. The socket must be registered under the binding name
    /// before this returns.
    fn bind_datagram(&self, binding: &SocketBinding) -> io::Result<std::net::UdpSocket>;

    /// Release the socket registered under `name`. Returns `false` if no
    /// such registration exists.
    fn unbind(&self, name: &str) -> bool;
}

/// In-process registry tracking bound sockets by binding name.
///
/// Suitable for tests and embedded deployments; a full server would back
/// this with its management model instead.
#[derive(Debug, Default)]
pub struct InMemorySocketRegistry {
    bound: Mutex<HashMap<String, SocketAddr>>,
}

impl InMemorySocketRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names and resolved addresses of all currently bound bindings.
    pub fn bound_bindings(&self) -> Vec<(String, SocketAddr)> {
        self.bound
            .lock()
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect()
    }

    /// Whether a binding with the given name is currently bound.
    pub fn is_bound(&self, name: &str) -> bool {
        self.bound.lock().contains_key(name)
    }
}

impl SocketBindingRegistry for InMemorySocketRegistry {
    fn bind_datagram(&self, binding: &SocketBinding) -> io::Result<std::net::UdpSocket> {
        let socket = std::net::UdpSocket::bind(binding.addr)?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        self.bound.lock().insert(binding.name.clone(), local);
        tracing::debug!(binding = %binding.name, addr = %local, "bound managed socket");
        Ok(socket)
    }

    fn unbind(&self, name: &str) -> bool {
        let removed = self.bound.lock().remove(name);
        if let Some(addr) = removed {
            tracing::debug!(binding = %name, addr = %addr, "released managed socket");
        }
        removed.is_some()
    }
}

/// Socket factory installed into the transport layer.
///
/// Creation requests whose local address matches a known binding go
/// through the registry; anything else is created directly. The factory
/// is invoked from the transport's own runtime tasks, never from the
/// thread assembling the stack, so slow socket setup cannot stall
/// channel construction.
#[derive(Clone)]
pub struct ManagedSocketFactory {
    registry: Arc<dyn SocketBindingRegistry>,
    bindings: Arc<SocketBindingMap>,
}

impl ManagedSocketFactory {
    /// Create a factory over the given registry and aggregate binding map.
    pub fn new(registry: Arc<dyn SocketBindingRegistry>, bindings: SocketBindingMap) -> Self {
        Self {
            registry,
            bindings: Arc::new(bindings),
        }
    }

    /// The binding whose configured address matches `addr`, if any.
    fn binding_for(&self, addr: SocketAddr) -> Option<&SocketBinding> {
        self.bindings.values().find(|binding| binding.addr == addr)
    }

    /// Create a datagram socket bound to `addr`.
    ///
    /// Managed addresses are bound through the registry; unmanaged ones
    /// directly. The returned socket is always non-blocking.
    pub fn create_datagram_socket(&self, addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
        match self.binding_for(addr) {
            Some(binding) => self.registry.bind_datagram(binding),
            None => {
                let socket = std::net::UdpSocket::bind(addr)?;
                socket.set_nonblocking(true)?;
                tracing::trace!(%addr, "bound unmanaged socket");
                Ok(socket)
            }
        }
    }

    /// Release the managed socket bound under `name`, if any.
    ///
    /// Failure to release never propagates; the registry's own lifecycle
    /// will still reap the socket.
    pub fn release(&self, name: &str) {
        if self.bindings.contains_key(name) && !self.registry.unbind(name) {
            tracing::warn!(binding = %name, "socket binding was not registered at release");
        }
    }
}

impl fmt::Debug for ManagedSocketFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedSocketFactory")
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}
