mod driver;
mod stream;

use self::{driver::Transport, stream::StreamBuffer};
use crate::{
    AddressFamily, ConnKind, TurnClientOptions, TurnObserver,
    config::TurnConfig,
    error::Error,
    session::{AllocParam, Credential, Session, SessionInfo, SessionOutput, SessionState},
};

use std::{io, net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

/// State the driver task publishes for the synchronous facade.
pub(crate) struct Shared {
    pub info: RwLock<SessionInfo>,
}

/// Facade-to-driver commands.
///
/// Every externally triggered operation funnels through this queue and is
/// executed on the driver task, so re-entrant calls (the application
/// invoking `send_to` from inside a data callback, or `destroy` from
/// inside a state callback) never deadlock and never race the socket.
pub(crate) enum Command {
    Alloc {
        credential: Option<Credential>,
        param: AllocParam,
    },
    Resolved(io::Result<Vec<SocketAddr>>),
    SendTo { peer: SocketAddr, data: Bytes },
    BindChannel(SocketAddr),
    SetPerm(Vec<SocketAddr>),
    SetSoftware(String),
    Destroy,
}

/// The lifecycle glue between the session state machine and the socket.
///
/// One task per client: it drains the session's outputs onto the wire and
/// into the application callbacks, feeds inbound traffic back in, and
/// wakes the session at the instants it asks for. Teardown happens here,
/// on the loop iteration after the `Destroying` transition was observed,
/// never inside a callback frame.
pub(crate) struct Driver {
    session: Session,
    conn: ConnKind,
    af: AddressFamily,
    config: TurnConfig,
    observer: Arc<dyn TurnObserver>,
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    transport: Option<Transport>,
    stream: Option<StreamBuffer>,
    read_buf: Vec<u8>,
    commands_closed: bool,
    teardown: bool,
}

impl Driver {
    pub fn new(
        options: TurnClientOptions,
        commands: mpsc::UnboundedReceiver<Command>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            session: Session::new(options.conn),
            read_buf: vec![0u8; options.config.max_pkt_size],
            conn: options.conn,
            af: options.af,
            config: options.config,
            observer: options.observer,
            commands,
            shared,
            transport: None,
            stream: None,
            commands_closed: false,
            teardown: false,
        }
    }

    pub async fn run(mut self) {
        enum Event {
            Command(Option<Command>),
            Read(io::Result<usize>),
            Timeout,
        }

        loop {
            self.drain().await;

            if self.teardown {
                break;
            }

            let timeout = self.session.poll_timeout();

            let event = tokio::select! {
                command = self.commands.recv(), if !self.commands_closed => Event::Command(command),
                result = recv_some(&mut self.transport, &mut self.read_buf) => Event::Read(result),
                _ = tokio::time::sleep_until(
                    tokio::time::Instant::from_std(timeout.unwrap_or_else(Instant::now))
                ), if timeout.is_some() => Event::Timeout,
            };

            match event {
                Event::Command(Some(command)) => self.handle_command(command),
                // every facade handle is gone, tear down like an explicit
                // destroy.
                Event::Command(None) => {
                    self.commands_closed = true;
                    self.session.shutdown(Instant::now());
                }
                Event::Read(result) => self.handle_read(result),
                Event::Timeout => self.session.handle_timeout(Instant::now()),
            }
        }

        self.transport = None;
        self.stream = None;
        self.session.finish();
        self.drain().await;
    }

    // Deliver everything the session produced: packets to the socket,
    // data and transitions to the application, lifecycle actions to
    // ourselves.
    async fn drain(&mut self) {
        while let Some(output) = self.session.poll_output() {
            match output {
                SessionOutput::Transmit(bytes) => self.transmit(&bytes).await,
                SessionOutput::Relayed { peer, data } => {
                    self.observer.on_rx_data(peer, &data);
                }
                SessionOutput::ChannelBound { peer, number } => {
                    self.observer.on_channel_bound(peer, number);
                }
                SessionOutput::StateChanged { old, new } => {
                    self.handle_state(old, new).await;
                }
            }
        }

        self.update_info();
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();

        match command {
            Command::Alloc { credential, param } => {
                if self.session.begin(credential, param).is_err() {
                    log::warn!("alloc on a session that is already started");
                }
            }
            Command::Resolved(Ok(addrs)) => {
                match addrs.into_iter().find(|addr| self.af.matches(addr)) {
                    Some(addr) => self.session.server_resolved(addr),
                    None => {
                        self.session.fail(
                            "server resolution failed",
                            Error::Invalid("no address of the configured family"),
                        );
                    }
                }
            }
            Command::Resolved(Err(e)) => {
                self.session.fail("server resolution failed", Error::Io(e));
            }
            Command::SendTo { peer, data } => {
                if let Err(e) = self.session.send_to(peer, &data) {
                    log::warn!("send dropped: peer={}, err={}", peer, e);
                }
            }
            Command::BindChannel(peer) => {
                if let Err(e) = self.session.bind_channel(peer, now) {
                    log::warn!("channel bind dropped: peer={}, err={}", peer, e);
                }
            }
            Command::SetPerm(peers) => {
                if let Err(e) = self.session.set_perm(&peers, now) {
                    log::warn!("set permission dropped: err={}", e);
                }
            }
            Command::SetSoftware(name) => self.session.set_software(name),
            Command::Destroy => self.session.shutdown(now),
        }
    }

    fn handle_read(&mut self, result: io::Result<usize>) {
        let now = Instant::now();

        match result {
            Ok(0) if matches!(self.conn, ConnKind::Tcp) => {
                self.session
                    .fail("connection closed by the server", Error::ClosedByPeer);
            }
            Ok(size) => match &mut self.stream {
                // stream transport: accumulate, then hand the session one
                // framed message at a time. A frame the session cannot
                // parse was still consumed in full.
                Some(stream) => {
                    stream.extend(&self.read_buf[..size]);

                    // a server streaming bytes that never complete a frame
                    // must not grow the buffer without bound.
                    if stream.len() > self.config.max_pkt_size * 3 {
                        self.session
                            .fail("stream buffer limit exceeded", Error::ProtocolError);
                        return;
                    }

                    loop {
                        match stream.next_frame() {
                            Ok(Some(frame)) => {
                                self.session.handle_input(&frame, now);
                            }
                            Ok(None) => break,
                            Err(e) => {
                                self.session.fail("corrupt stream from the server", e);
                                break;
                            }
                        }
                    }
                }
                // datagram transport: the datagram is the frame.
                None => {
                    self.session.handle_input(&self.read_buf[..size], now);
                }
            },
            Err(e) => {
                if matches!(self.conn, ConnKind::Tcp) {
                    self.session.fail("socket read failed", Error::Io(e));
                } else {
                    // datagram read errors are transient noise.
                    log::debug!("udp recv error ignored: err={}", e);
                }
            }
        }
    }

    async fn handle_state(&mut self, old: SessionState, new: SessionState) {
        // the application observes the transition before the adapter acts
        // on it, and may call destroy from inside the callback; that lands
        // on the command queue and is processed afterwards.
        self.update_info();
        self.observer.on_state(old, new);

        if new == SessionState::Resolved {
            self.connect_server().await;
        }

        if new >= SessionState::Destroying {
            self.transport = None;
            self.stream = None;
            self.teardown = true;
        }
    }

    // Runs on the initial resolution and again on every alternate-server
    // redirect; any existing connection is discarded first.
    async fn connect_server(&mut self) {
        self.transport = None;
        self.stream = None;

        let Some(server) = self.session.server() else {
            self.session
                .fail("resolved without a server address", Error::InvalidState);
            return;
        };

        log::info!(
            "connecting to turn server: server={}, transport={:?}",
            server,
            self.conn
        );

        match driver::connect(self.conn, server, &self.config).await {
            Ok(transport) => {
                if let Ok(local) = transport.local_addr() {
                    log::info!("turn socket connected: local={}, server={}", local, server);
                }

                if matches!(self.conn, ConnKind::Tcp) {
                    self.stream = Some(StreamBuffer::new(self.config.max_pkt_size));
                }

                self.transport = Some(transport);
                self.session.connected(Instant::now());
            }
            Err(e) => {
                self.session.fail("socket setup failed", e);
            }
        }
    }

    async fn transmit(&mut self, bytes: &[u8]) {
        match &mut self.transport {
            Some(transport) => {
                if let Err(e) = transport.send(bytes).await {
                    // a broken stream is fatal; datagram sends are fire
                    // and forget and covered by retransmission.
                    if matches!(self.conn, ConnKind::Tcp) {
                        self.session.fail("stream send failed", Error::Io(e));
                    } else {
                        log::error!("socket send failed: err={}", e);
                    }
                }
            }
            None => log::debug!("dropping outbound packet, no transport"),
        }
    }

    fn update_info(&mut self) {
        *self.shared.info.write() = self.session.info(Instant::now());
    }
}

async fn recv_some(transport: &mut Option<Transport>, buf: &mut [u8]) -> io::Result<usize> {
    match transport {
        Some(transport) => transport.recv(buf).await,
        None => std::future::pending().await,
    }
}
