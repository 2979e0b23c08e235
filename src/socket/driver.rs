use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;

#[cfg(feature = "tcp")]
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpSocket, TcpStream},
};

use crate::{ConnKind, config::TurnConfig, error::Error};

/// Upper bound on sequential ports tried when binding within a port
/// range.
pub const MAX_BIND_RETRY: u16 = 100;

/// A connected datagram or stream socket towards the turn server.
///
/// The socket is created only once the server has been resolved, and is
/// replaced wholesale on an alternate-server redirect.
pub(crate) enum Transport {
    Udp(UdpSocket),
    #[cfg(feature = "tcp")]
    Tcp(TcpStream),
}

impl Transport {
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.recv(buf).await,
            #[cfg(feature = "tcp")]
            Self::Tcp(stream) => stream.read(buf).await,
        }
    }

    pub async fn send(&mut self, pkt: &[u8]) -> io::Result<()> {
        match self {
            Self::Udp(socket) => socket.send(pkt).await.map(|_| ()),
            #[cfg(feature = "tcp")]
            Self::Tcp(stream) => stream.write_all(pkt).await,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Udp(socket) => socket.local_addr(),
            #[cfg(feature = "tcp")]
            Self::Tcp(stream) => stream.local_addr(),
        }
    }
}

/// Create, bind and connect the server socket.
///
/// Binding walks forward from the configured port through at most
/// `min(port_range, 100)` candidates; QoS is applied after bind and
/// before connect. The datagram variant of "connect" only fixes the
/// remote address and completes synchronously.
pub(crate) async fn connect(
    conn: ConnKind,
    remote: SocketAddr,
    config: &TurnConfig,
) -> Result<Transport, Error> {
    let kind = match conn {
        ConnKind::Udp => Type::DGRAM,
        ConnKind::Tcp => Type::STREAM,
    };

    let socket = bind(kind, remote, config)?;
    apply_qos(&socket, config)?;

    match conn {
        ConnKind::Udp => {
            let socket = UdpSocket::try_from(std::net::UdpSocket::from(socket))?;
            socket.connect(remote).await.map_err(Error::ConnectFailed)?;
            Ok(Transport::Udp(socket))
        }
        #[cfg(feature = "tcp")]
        ConnKind::Tcp => {
            let socket = TcpSocket::from_std_stream(socket.into());
            let stream = socket.connect(remote).await.map_err(Error::ConnectFailed)?;

            // any received data should be processed as soon as possible,
            // disable the Nagle algorithm.
            if let Err(e) = stream.set_nodelay(true) {
                log::error!("tcp socket set nodelay failed!: err={}", e);
            }

            Ok(Transport::Tcp(stream))
        }
        #[cfg(not(feature = "tcp"))]
        ConnKind::Tcp => Err(Error::Invalid("tcp support is not enabled")),
    }
}

// Bind within the configured port range.
//
// The caller-provided port is the first candidate; each failure moves one
// port forward until the range (or the 100-attempt cap) is exhausted. An
// unset or zero port binds once to an ephemeral port.
fn bind(kind: Type, remote: SocketAddr, config: &TurnConfig) -> Result<Socket, Error> {
    let domain = if remote.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, kind, None)?;
    socket.set_nonblocking(true)?;

    let bound = config.bound_addr.unwrap_or_else(|| {
        if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        }
    });

    let attempts = if bound.port() == 0 {
        1
    } else {
        config.port_range.clamp(1, MAX_BIND_RETRY)
    };

    for index in 0..attempts {
        let Some(port) = bound.port().checked_add(index) else {
            break;
        };

        let mut addr = bound;
        addr.set_port(port);

        match socket.bind(&addr.into()) {
            Ok(()) => {
                log::debug!("socket bound: addr={}", addr);
                return Ok(socket);
            }
            Err(e) => {
                log::debug!("bind attempt failed: addr={}, err={}", addr, e);
            }
        }
    }

    log::error!(
        "bind port range exhausted: addr={}, range={}",
        bound,
        attempts
    );

    Err(Error::BindExhausted)
}

// Apply the configured traffic class as a DSCP codepoint. The socket
// priority field has no portable expression and is carried for
// configuration parity only.
fn apply_qos(socket: &Socket, config: &TurnConfig) -> Result<(), Error> {
    let dscp = config.dscp();
    if dscp == 0 {
        return Ok(());
    }

    match socket.set_tos((dscp as u32) << 2) {
        Ok(()) => {
            log::debug!("qos applied: dscp={}", dscp);
            Ok(())
        }
        Err(e) if config.qos_ignore_error => {
            log::warn!("qos apply failed, ignored: dscp={}, err={}", dscp, e);
            Ok(())
        }
        Err(e) => {
            log::error!("qos apply failed: dscp={}, err={}", dscp, e);
            Err(Error::Io(e))
        }
    }
}
