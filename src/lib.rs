//! ## TURN client transport
//!
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! A TURN (Traversal Using Relays around NAT) client asks a relay server
//! to allocate a public transport address on its behalf and to forward
//! traffic between that address and the client. This crate owns the
//! client side of the protocol: the socket to the server, the
//! allocation/refresh/permission/channel machinery, and the framing of
//! TURN messages over datagram and stream transports.
//!
//! The [`TurnClient`] facade is handle-like and cheap to clone. All
//! protocol work happens on a driver task; operations return immediately
//! and completion is observed through the [`TurnObserver`] callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use turn_client::{
//!     AddressFamily, AllocRequest, ConnKind, Credential, SessionState, TurnClient,
//!     TurnClientOptions, config::TurnConfig, resolver::DnsResolver,
//! };
//!
//! struct Observer;
//!
//! impl turn_client::TurnObserver for Observer {
//!     fn on_state(&self, old: SessionState, new: SessionState) {
//!         println!("{} -> {}", old, new);
//!     }
//!
//!     fn on_rx_data(&self, peer: std::net::SocketAddr, data: &[u8]) {
//!         println!("{} bytes from {}", data.len(), peer);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), turn_client::Error> {
//!     let client = TurnClient::new(TurnClientOptions {
//!         af: AddressFamily::V4,
//!         conn: ConnKind::Udp,
//!         config: TurnConfig::default(),
//!         observer: Arc::new(Observer),
//!     })?;
//!
//!     client.alloc(AllocRequest {
//!         domain: "turn.example.com".to_string(),
//!         port: 3478,
//!         resolver: DnsResolver,
//!         credential: Some(Credential {
//!             username: "user".to_string(),
//!             password: "secret".to_string(),
//!         }),
//!         param: Default::default(),
//!     })?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod resolver;

mod error;
mod session;
mod socket;

pub use codec;
pub use error::Error;
pub use session::{
    AllocParam, CHANNEL_LIFETIME, Credential, DEFAULT_LIFETIME, PERMISSION_LIFETIME, SessionInfo,
    SessionState,
};

use crate::{
    config::TurnConfig,
    resolver::Resolver,
    socket::{Command, Driver, Shared},
};

use std::{
    any::Any,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

/// IP address family of the client socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub(crate) fn matches(&self, addr: &SocketAddr) -> bool {
        match self {
            Self::V4 => addr.is_ipv4(),
            Self::V6 => addr.is_ipv6(),
        }
    }
}

/// Transport between the client and the turn server.
///
/// This is a runtime tag: a build without the `tcp` feature rejects
/// `Tcp` at create time instead of not naming it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnKind {
    Udp,
    Tcp,
}

/// Application callbacks.
///
/// All callbacks are invoked from the client's driver task. Calling back
/// into the [`TurnClient`] from inside a callback is safe, including
/// `destroy`: operations are queued and executed after the callback
/// returns.
pub trait TurnObserver: Send + Sync + 'static {
    /// Relayed traffic from a peer.
    #[allow(unused_variables)]
    fn on_rx_data(&self, peer: SocketAddr, data: &[u8]) {}

    /// Session state transition, delivered before the client itself acts
    /// on the new state.
    ///
    /// A transition to [`SessionState::Destroying`] is the last word on a
    /// failed or finished session; no data callbacks follow it.
    #[allow(unused_variables)]
    fn on_state(&self, old: SessionState, new: SessionState) {}

    /// A channel binding for the peer completed.
    #[allow(unused_variables)]
    fn on_channel_bound(&self, peer: SocketAddr, number: u16) {}
}

pub struct TurnClientOptions {
    pub af: AddressFamily,
    pub conn: ConnKind,
    pub config: TurnConfig,
    pub observer: Arc<dyn TurnObserver>,
}

/// Everything `alloc` needs to reach and authenticate against a server.
pub struct AllocRequest<R> {
    /// Server host name or address literal.
    pub domain: String,
    /// Port used when the resolver does not dictate one.
    pub port: u16,
    pub resolver: R,
    pub credential: Option<Credential>,
    pub param: AllocParam,
}

/// TURN client handle.
///
/// Clones share one session. The client is destroyed explicitly with
/// [`TurnClient::destroy`], or implicitly when every handle is dropped.
#[derive(Clone)]
pub struct TurnClient {
    inner: Arc<Inner>,
}

struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    destroyed: AtomicBool,
    user_data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TurnClient {
    /// Create the client and spawn its driver task.
    ///
    /// Must be called from within a tokio runtime. The socket itself is
    /// not created here; that happens once `alloc` has resolved the
    /// server.
    pub fn new(options: TurnClientOptions) -> Result<Self, Error> {
        if matches!(options.conn, ConnKind::Tcp) && !cfg!(feature = "tcp") {
            return Err(Error::Invalid("tcp support is not enabled"));
        }

        if let Some(bound) = options.config.bound_addr {
            if !options.af.matches(&bound) {
                return Err(Error::Invalid(
                    "bound address does not match the address family",
                ));
            }
        }

        let shared = Arc::new(Shared {
            info: RwLock::new(SessionInfo::default()),
        });

        let (commands, receiver) = mpsc::unbounded_channel();

        tokio::spawn(Driver::new(options, receiver, shared.clone()).run());

        Ok(Self {
            inner: Arc::new(Inner {
                commands,
                shared,
                destroyed: AtomicBool::new(false),
                user_data: Mutex::new(None),
            }),
        })
    }

    /// Start the allocation.
    ///
    /// Returns immediately; resolution, connection and the Allocate
    /// exchange run on the driver task, and the outcome arrives through
    /// `on_state` (`Ready` on success, `Destroying` on failure).
    pub fn alloc<R: Resolver>(&self, request: AllocRequest<R>) -> Result<(), Error> {
        self.live()?;

        self.send(Command::Alloc {
            credential: request.credential,
            param: request.param,
        })?;

        let commands = self.inner.commands.clone();
        tokio::spawn(async move {
            let result = request.resolver.resolve(&request.domain, request.port).await;
            let _ = commands.send(Command::Resolved(result));
        });

        Ok(())
    }

    /// Send application data to a peer through the relay.
    pub fn send_to(&self, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        self.live()?;
        self.ready()?;
        self.send(Command::SendTo {
            peer,
            data: Bytes::copy_from_slice(data),
        })
    }

    /// Install permissions for the peers, coalesced into one request.
    pub fn set_perm(&self, peers: &[SocketAddr]) -> Result<(), Error> {
        if peers.is_empty() {
            return Err(Error::Invalid("no peer addresses"));
        }

        self.live()?;
        self.ready()?;
        self.send(Command::SetPerm(peers.to_vec()))
    }

    /// Bind the peer to a channel; completion arrives via
    /// `on_channel_bound`.
    pub fn bind_channel(&self, peer: SocketAddr) -> Result<(), Error> {
        self.live()?;
        self.ready()?;
        self.send(Command::BindChannel(peer))
    }

    /// SOFTWARE attribute value stamped on outgoing requests.
    pub fn set_software_name(&self, name: &str) -> Result<(), Error> {
        self.live()?;
        self.send(Command::SetSoftware(name.to_string()))
    }

    /// Read-only snapshot of the session.
    pub fn info(&self) -> SessionInfo {
        self.inner.shared.info.read().clone()
    }

    pub fn set_user_data(&self, value: Arc<dyn Any + Send + Sync>) {
        *self.inner.user_data.lock() = Some(value);
    }

    pub fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.user_data.lock().clone()
    }

    /// Tear the session down.
    ///
    /// A live allocation is released gracefully first; the application
    /// observes `Deallocating`, `Destroying` and finally `Destroyed`.
    /// Calling this a second time has no effect.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.commands.send(Command::Destroy);
    }

    fn live(&self) -> Result<(), Error> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState);
        }

        Ok(())
    }

    fn ready(&self) -> Result<(), Error> {
        if self.info().state != SessionState::Ready {
            return Err(Error::InvalidState);
        }

        Ok(())
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.inner
            .commands
            .send(command)
            .map_err(|_| Error::InvalidState)
    }
}
