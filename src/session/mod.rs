pub mod transactions;

use self::transactions::{Request, Transactions};
use crate::{ConnKind, error::Error};

use std::{
    collections::VecDeque,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    DecodeResult, Decoder,
    channel_data::{CHANNEL_NUMBER_MAX, CHANNEL_NUMBER_MIN, ChannelData},
    crypto::long_term_credential,
    message::{
        Message, MessageEncoder,
        attributes::{error::ErrorKind, *},
        methods::*,
    },
};
use rand::Rng;

/// Lifetime the client assumes when the server response does not carry a
/// LIFETIME attribute.
pub const DEFAULT_LIFETIME: u32 = 600;

/// Server-fixed permission lifetime.
pub const PERMISSION_LIFETIME: Duration = Duration::from_secs(300);

// permissions are renewed this long before they lapse.
const PERMISSION_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Server-fixed channel binding lifetime.
pub const CHANNEL_LIFETIME: Duration = Duration::from_secs(600);

// bindings are refreshed at 9/10 of their lifetime.
const CHANNEL_REFRESH: Duration = Duration::from_secs(CHANNEL_LIFETIME.as_secs() / 10 * 9);

/// Allocation lifecycle.
///
/// States only ever move forward, with one exception: a 300 (Try
/// Alternate) redirect re-enters `Resolved` so the adapter reconnects to
/// the replacement server. Nothing is observed after `Destroying` except
/// the final transition to `Destroyed`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    #[default]
    Null,
    Resolving,
    Resolved,
    Allocating,
    Ready,
    Deallocating,
    Destroying,
    Destroyed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Long term credential, combined with the realm the server announces
/// into the MESSAGE-INTEGRITY key.
#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

/// Hints for the Allocate request.
#[derive(Debug, Clone)]
pub struct AllocParam {
    /// Requested allocation lifetime in seconds; the server decides the
    /// effective value.
    pub lifetime: Option<u32>,
    /// Peak bandwidth hint in kbit/s.
    pub bandwidth: Option<u32>,
    /// Address family requested for the relayed address.
    pub peer_family: Option<address::IpFamily>,
    /// Transport between server and peers, nearly always UDP.
    pub transport: Transport,
    /// Ask the server to set the DF bit when relaying onward.
    pub dont_fragment: bool,
}

impl Default for AllocParam {
    fn default() -> Self {
        Self {
            lifetime: None,
            bandwidth: None,
            peer_family: None,
            transport: Transport::Udp,
            dont_fragment: false,
        }
    }
}

/// Read-only snapshot of the session.
#[derive(Debug, Default, Clone)]
pub struct SessionInfo {
    pub state: SessionState,
    pub server: Option<SocketAddr>,
    pub relay_addr: Option<SocketAddr>,
    pub mapped_addr: Option<SocketAddr>,
    pub lifetime_remaining: Option<Duration>,
    /// Active channel bindings, peer to channel number.
    pub channels: Vec<(SocketAddr, u16)>,
    /// Installed permissions and the time left on each.
    pub permissions: Vec<(IpAddr, Duration)>,
}

/// Events the session hands back to the adapter driving it.
#[derive(Debug, Clone)]
pub enum SessionOutput {
    /// A packet to put on the wire towards the server.
    Transmit(Bytes),
    /// Relayed peer traffic for the application.
    Relayed { peer: SocketAddr, data: Bytes },
    /// A channel binding completed.
    ChannelBound { peer: SocketAddr, number: u16 },
    StateChanged {
        old: SessionState,
        new: SessionState,
    },
}

struct ChannelBinding {
    number: u16,
    bound: bool,
    pending: bool,
    refresh_at: Instant,
}

struct Permission {
    addr: SocketAddr,
    expires_at: Instant,
    pending: bool,
}

/// TURN protocol state machine.
///
/// The session performs no I/O and reads no clock of its own: the adapter
/// feeds it inbound frames (`handle_input`), wakes it at the instant
/// `poll_timeout` asks for (`handle_timeout`), and drains the work it
/// produces (`poll_output`).
pub struct Session {
    state: SessionState,
    conn: ConnKind,
    software: Option<String>,
    credential: Option<Credential>,
    realm: Option<String>,
    nonce: Option<String>,
    key: Option<[u8; 16]>,
    auth_retried: bool,
    stale_retried: bool,
    alternate_tried: bool,
    refresh_retried: bool,
    server: Option<SocketAddr>,
    relay_addr: Option<SocketAddr>,
    mapped_addr: Option<SocketAddr>,
    lifetime: u32,
    expires_at: Option<Instant>,
    refresh_at: Option<Instant>,
    param: AllocParam,
    transactions: Transactions,
    channels: HashMap<SocketAddr, ChannelBinding>,
    channel_peers: HashMap<u16, SocketAddr>,
    next_channel: u16,
    permissions: HashMap<IpAddr, Permission>,
    outputs: VecDeque<SessionOutput>,
}

impl Session {
    pub fn new(conn: ConnKind) -> Self {
        Self {
            state: SessionState::Null,
            conn,
            software: None,
            credential: None,
            realm: None,
            nonce: None,
            key: None,
            auth_retried: false,
            stale_retried: false,
            alternate_tried: false,
            refresh_retried: false,
            server: None,
            relay_addr: None,
            mapped_addr: None,
            lifetime: 0,
            expires_at: None,
            refresh_at: None,
            param: AllocParam::default(),
            transactions: Transactions::default(),
            channels: HashMap::new(),
            channel_peers: HashMap::new(),
            next_channel: CHANNEL_NUMBER_MIN,
            permissions: HashMap::new(),
            outputs: VecDeque::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn set_software(&mut self, name: String) {
        self.software = Some(name);
    }

    pub fn info(&self, now: Instant) -> SessionInfo {
        SessionInfo {
            state: self.state,
            server: self.server,
            relay_addr: self.relay_addr,
            mapped_addr: self.mapped_addr,
            lifetime_remaining: self.expires_at.map(|it| it.saturating_duration_since(now)),
            channels: self
                .channels
                .iter()
                .filter(|(_, binding)| binding.bound)
                .map(|(peer, binding)| (*peer, binding.number))
                .collect(),
            permissions: self
                .permissions
                .iter()
                .map(|(ip, it)| (*ip, it.expires_at.saturating_duration_since(now)))
                .collect(),
        }
    }

    /// Start the allocation flow; the server name is being resolved from
    /// here on.
    pub fn begin(
        &mut self,
        credential: Option<Credential>,
        param: AllocParam,
    ) -> Result<(), Error> {
        if self.state != SessionState::Null {
            return Err(Error::InvalidState);
        }

        self.credential = credential;
        self.param = param;
        self.set_state(SessionState::Resolving);

        Ok(())
    }

    /// The resolver produced the server endpoint; the adapter creates and
    /// connects the socket on observing the transition.
    pub fn server_resolved(&mut self, addr: SocketAddr) {
        if self.state != SessionState::Resolving {
            return;
        }

        log::info!("turn server resolved: server={}", addr);

        self.server = Some(addr);
        self.set_state(SessionState::Resolved);
    }

    /// The transport to the server is up, send the Allocate request.
    pub fn connected(&mut self, now: Instant) {
        if self.state != SessionState::Resolved {
            return;
        }

        self.set_state(SessionState::Allocating);
        self.send_allocate(now);
    }

    /// Terminate after a fatal error. The reason is logged; the
    /// application observes the `Destroying` transition.
    pub fn fail(&mut self, title: &str, error: Error) {
        log::error!("session failed: {}: {}", title, error);

        if self.state < SessionState::Destroying {
            self.set_state(SessionState::Destroying);
        }
    }

    /// Graceful teardown. A live allocation is released with a zero
    /// lifetime Refresh first; calling this again while teardown is in
    /// progress has no effect.
    pub fn shutdown(&mut self, now: Instant) {
        match self.state {
            SessionState::Ready => {
                self.set_state(SessionState::Deallocating);
                self.send_refresh(Some(0), true, now);
            }
            SessionState::Deallocating | SessionState::Destroying | SessionState::Destroyed => {}
            _ => self.set_state(SessionState::Destroying),
        }
    }

    /// The adapter has released the socket and timers; emit the terminal
    /// transition.
    pub fn finish(&mut self) {
        if self.state != SessionState::Destroyed {
            self.set_state(SessionState::Destroyed);
        }
    }

    /// Send application data to a peer through the relay.
    ///
    /// With a completed channel binding for the peer the compact
    /// ChannelData framing is used, otherwise a Send indication.
    pub fn send_to(&mut self, peer: SocketAddr, data: &[u8]) -> Result<(), Error> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }

        if let Some(binding) = self.channels.get(&peer) {
            if binding.bound {
                let mut buf = BytesMut::with_capacity(4 + data.len() + 3);
                ChannelData {
                    number: binding.number,
                    bytes: data,
                }
                .encode(&mut buf, self.is_tcp());

                self.outputs.push_back(SessionOutput::Transmit(buf.freeze()));
                return Ok(());
            }
        }

        let dont_fragment = self.param.dont_fragment;
        self.encode_indication(SEND_INDICATION, |message| {
            message.append::<XorPeerAddress>(peer);
            message.append::<Data>(data);
            if dont_fragment {
                message.append::<DontFragment>(());
            }
        });

        Ok(())
    }

    /// Install (or renew) permissions for the given peers, coalesced into
    /// a single CreatePermission request.
    pub fn set_perm(&mut self, peers: &[SocketAddr], now: Instant) -> Result<(), Error> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }

        if peers.is_empty() {
            return Err(Error::Invalid("no peer addresses"));
        }

        for peer in peers {
            self.permissions.insert(
                peer.ip(),
                Permission {
                    addr: *peer,
                    expires_at: now + PERMISSION_LIFETIME,
                    pending: true,
                },
            );
        }

        self.send_create_permission(peers.to_vec(), false, now);

        Ok(())
    }

    /// Bind the peer to a channel number, or renew the existing binding.
    pub fn bind_channel(&mut self, peer: SocketAddr, now: Instant) -> Result<(), Error> {
        if self.state != SessionState::Ready {
            return Err(Error::InvalidState);
        }

        if let Some(binding) = self.channels.get_mut(&peer) {
            binding.pending = true;
            let number = binding.number;
            self.send_channel_bind(peer, number, false, now);
            return Ok(());
        }

        if self.next_channel > CHANNEL_NUMBER_MAX {
            return Err(Error::Invalid("channel numbers exhausted"));
        }

        let number = self.next_channel;
        self.next_channel += 1;

        self.channels.insert(
            peer,
            ChannelBinding {
                number,
                bound: false,
                pending: true,
                refresh_at: now + CHANNEL_REFRESH,
            },
        );
        self.channel_peers.insert(number, peer);

        self.send_channel_bind(peer, number, false, now);

        Ok(())
    }

    /// Feed one inbound frame from the server socket.
    ///
    /// Returns whether the frame was understood; the caller advances by
    /// the framed length either way.
    pub fn handle_input(&mut self, pkt: &[u8], now: Instant) -> bool {
        if self.state >= SessionState::Destroying {
            return false;
        }

        let mut decoder = Decoder::default();
        match decoder.decode(pkt) {
            Err(e) => {
                log::debug!("dropping unparsable packet: len={}, err={}", pkt.len(), e);
                false
            }
            Ok(DecodeResult::ChannelData(channel_data)) => {
                match self.channel_peers.get(&channel_data.number()).copied() {
                    Some(peer) => {
                        self.outputs.push_back(SessionOutput::Relayed {
                            peer,
                            data: Bytes::copy_from_slice(channel_data.as_bytes()),
                        });
                    }
                    None => {
                        log::debug!(
                            "channel data for unknown channel: number={:#06x}",
                            channel_data.number()
                        );
                    }
                }

                true
            }
            Ok(DecodeResult::Message(message)) => {
                let method = message.method();

                if method == DATA_INDICATION {
                    let (Some(peer), Some(data)) =
                        (message.get::<XorPeerAddress>(), message.get::<Data>())
                    else {
                        log::warn!("data indication without peer address or data");
                        return true;
                    };

                    self.outputs.push_back(SessionOutput::Relayed {
                        peer,
                        data: Bytes::copy_from_slice(data),
                    });

                    return true;
                }

                if method.is_response() {
                    let Some(request) = self.transactions.remove(message.transaction_id()) else {
                        log::debug!("response for unknown transaction: method={:?}", method);
                        return true;
                    };

                    self.dispatch_response(method, request, &message, now);
                    return true;
                }

                log::debug!("unexpected message: method={:?}", method);
                true
            }
        }
    }

    /// The next instant at which `handle_timeout` has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.state >= SessionState::Destroying {
            return None;
        }

        let mut next = self.transactions.poll_timeout();

        if self.state == SessionState::Ready {
            next = min_instant(next, self.refresh_at);

            for permission in self.permissions.values() {
                if !permission.pending {
                    next = min_instant(
                        next,
                        Some(permission.expires_at - PERMISSION_REFRESH_MARGIN),
                    );
                }
            }

            for binding in self.channels.values() {
                if binding.bound && !binding.pending {
                    next = min_instant(next, Some(binding.refresh_at));
                }
            }
        }

        next
    }

    /// Drive every clock the session keeps: transaction retransmits, the
    /// allocation refresh, and permission and channel renewals.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state >= SessionState::Destroying {
            return;
        }

        let mut retransmit = Vec::new();
        let mut expired = Vec::new();
        self.transactions.handle_timeout(now, &mut retransmit, &mut expired);

        for bytes in retransmit {
            self.outputs.push_back(SessionOutput::Transmit(bytes));
        }

        for request in expired {
            self.on_transaction_timeout(request, now);
        }

        if self.state != SessionState::Ready {
            return;
        }

        if self.refresh_at.is_some_and(|it| now >= it) {
            self.refresh_at = None;
            let lifetime = self.param.lifetime;
            self.send_refresh(lifetime, false, now);
        }

        let mut renew = Vec::new();
        for permission in self.permissions.values_mut() {
            if !permission.pending && now + PERMISSION_REFRESH_MARGIN >= permission.expires_at {
                permission.pending = true;
                renew.push(permission.addr);
            }
        }
        if !renew.is_empty() {
            self.send_create_permission(renew, false, now);
        }

        let mut rebind = Vec::new();
        for (peer, binding) in self.channels.iter_mut() {
            if binding.bound && !binding.pending && now >= binding.refresh_at {
                binding.pending = true;
                rebind.push((*peer, binding.number));
            }
        }
        for (peer, number) in rebind {
            self.send_channel_bind(peer, number, false, now);
        }
    }

    /// Drain the work produced by the calls above.
    pub fn poll_output(&mut self) -> Option<SessionOutput> {
        self.outputs.pop_front()
    }

    fn is_tcp(&self) -> bool {
        matches!(self.conn, ConnKind::Tcp)
    }

    fn set_state(&mut self, new: SessionState) {
        let old = self.state;
        if old == new {
            return;
        }

        log::info!("session state changed: old={}, new={}", old, new);

        self.state = new;
        self.outputs
            .push_back(SessionOutput::StateChanged { old, new });
    }

    fn send_allocate(&mut self, now: Instant) {
        let param = self.param.clone();
        self.encode_request(ALLOCATE_REQUEST, Request::Allocate, now, move |message| {
            message.append::<RequestedTransport>(param.transport);
            if let Some(lifetime) = param.lifetime {
                message.append::<Lifetime>(lifetime);
            }
            if let Some(bandwidth) = param.bandwidth {
                message.append::<Bandwidth>(bandwidth);
            }
            if let Some(family) = param.peer_family {
                message.append::<RequestedAddressFamily>(family);
            }
            if param.dont_fragment {
                message.append::<DontFragment>(());
            }
        });
    }

    fn send_refresh(&mut self, lifetime: Option<u32>, deallocate: bool, now: Instant) {
        let lifetime = if deallocate { Some(0) } else { lifetime };
        self.encode_request(
            REFRESH_REQUEST,
            Request::Refresh { deallocate },
            now,
            move |message| {
                if let Some(lifetime) = lifetime {
                    message.append::<Lifetime>(lifetime);
                }
            },
        );
    }

    fn send_create_permission(&mut self, peers: Vec<SocketAddr>, retried: bool, now: Instant) {
        let attrs = peers.clone();
        self.encode_request(
            CREATE_PERMISSION_REQUEST,
            Request::CreatePermission { peers, retried },
            now,
            move |message| {
                for peer in attrs {
                    message.append::<XorPeerAddress>(peer);
                }
            },
        );
    }

    fn send_channel_bind(&mut self, peer: SocketAddr, number: u16, retried: bool, now: Instant) {
        self.encode_request(
            CHANNEL_BIND_REQUEST,
            Request::ChannelBind {
                peer,
                number,
                retried,
            },
            now,
            move |message| {
                message.append::<ChannelNumber>(number);
                message.append::<XorPeerAddress>(peer);
            },
        );
    }

    fn encode_request(
        &mut self,
        method: Method,
        request: Request,
        now: Instant,
        write: impl FnOnce(&mut MessageEncoder),
    ) {
        let mut id = [0u8; 12];
        rand::rng().fill(&mut id[..]);

        let mut buf = BytesMut::with_capacity(256);

        {
            let mut message = MessageEncoder::new(method, &id, &mut buf);

            if let Some(software) = &self.software {
                message.append::<Software>(software.as_str());
            }

            write(&mut message);

            let sealed = if let (Some(credential), Some(realm), Some(nonce), Some(key)) =
                (&self.credential, &self.realm, &self.nonce, &self.key)
            {
                message.append::<UserName>(credential.username.as_str());
                message.append::<Realm>(realm.as_str());
                message.append::<Nonce>(nonce.as_str());
                message.flush(Some(key.as_slice()))
            } else {
                message.flush(None)
            };

            if sealed.is_err() {
                log::error!("failed to encode request: method={:?}", method);
                return;
            }
        }

        let bytes = buf.freeze();
        self.transactions.insert(id, request, bytes.clone(), now);
        self.outputs.push_back(SessionOutput::Transmit(bytes));
    }

    fn encode_indication(&mut self, method: Method, write: impl FnOnce(&mut MessageEncoder)) {
        let mut id = [0u8; 12];
        rand::rng().fill(&mut id[..]);

        let mut buf = BytesMut::with_capacity(128);

        {
            let mut message = MessageEncoder::new(method, &id, &mut buf);

            if let Some(software) = &self.software {
                message.append::<Software>(software.as_str());
            }

            write(&mut message);

            if message.flush(None).is_err() {
                log::error!("failed to encode indication: method={:?}", method);
                return;
            }
        }

        self.outputs.push_back(SessionOutput::Transmit(buf.freeze()));
    }

    fn dispatch_response(
        &mut self,
        method: Method,
        request: Request,
        message: &Message,
        now: Instant,
    ) {
        match request {
            Request::Allocate => match method {
                ALLOCATE_RESPONSE => self.on_allocate_response(message, now),
                ALLOCATE_ERROR => self.on_allocate_error(message, now),
                _ => log::warn!("allocate transaction got: method={:?}", method),
            },
            Request::Refresh { deallocate } => match method {
                REFRESH_RESPONSE => self.on_refresh_response(deallocate, message, now),
                REFRESH_ERROR => self.on_refresh_error(deallocate, message, now),
                _ => log::warn!("refresh transaction got: method={:?}", method),
            },
            Request::CreatePermission { peers, retried } => match method {
                CREATE_PERMISSION_RESPONSE => self.on_create_permission_response(&peers, now),
                CREATE_PERMISSION_ERROR => {
                    self.on_create_permission_error(peers, retried, message, now)
                }
                _ => log::warn!("create permission transaction got: method={:?}", method),
            },
            Request::ChannelBind {
                peer,
                number,
                retried,
            } => match method {
                CHANNEL_BIND_RESPONSE => self.on_channel_bind_response(peer, number, now),
                CHANNEL_BIND_ERROR => {
                    self.on_channel_bind_error(peer, number, retried, message, now)
                }
                _ => log::warn!("channel bind transaction got: method={:?}", method),
            },
        }
    }

    fn on_allocate_response(&mut self, message: &Message, now: Instant) {
        if self.state != SessionState::Allocating {
            return;
        }

        if !self.verify(message) {
            self.fail("allocate response failed the integrity check", Error::ProtocolError);
            return;
        }

        let Some(relay) = message.get::<XorRelayedAddress>() else {
            self.fail("allocate response without a relayed address", Error::ProtocolError);
            return;
        };

        self.relay_addr = Some(relay);
        self.mapped_addr = message.get::<XorMappedAddress>();
        self.lifetime = message.get::<Lifetime>().unwrap_or(DEFAULT_LIFETIME);
        self.expires_at = Some(now + Duration::from_secs(self.lifetime as u64));
        self.schedule_refresh(now);

        log::info!(
            "allocation ready: relay={}, lifetime={}",
            relay,
            self.lifetime
        );

        self.set_state(SessionState::Ready);
    }

    fn on_allocate_error(&mut self, message: &Message, now: Instant) {
        if self.state != SessionState::Allocating {
            return;
        }

        let Some(error) = message.get::<ErrorCode>() else {
            self.fail("allocate error response without ERROR-CODE", Error::ProtocolError);
            return;
        };

        match error.kind() {
            // A 401 challenge carries the realm and nonce the long term
            // credential is derived with; retry the request once with
            // MESSAGE-INTEGRITY.
            Some(ErrorKind::Unauthorized) => {
                if self.auth_retried {
                    self.fail("credentials rejected by the server", Error::AuthFailed);
                    return;
                }

                let Some(credential) = self.credential.clone() else {
                    self.fail("server requires authentication, no credential configured", Error::AuthRequired);
                    return;
                };

                let (Some(realm), Some(nonce)) = (message.get::<Realm>(), message.get::<Nonce>())
                else {
                    self.fail("401 challenge without realm or nonce", Error::ProtocolError);
                    return;
                };

                self.key = Some(long_term_credential(
                    &credential.username,
                    &credential.password,
                    realm,
                ));
                self.realm = Some(realm.to_string());
                self.nonce = Some(nonce.to_string());
                self.auth_retried = true;

                self.send_allocate(now);
            }
            Some(ErrorKind::StaleNonce) => {
                match message.get::<Nonce>() {
                    Some(nonce) if !self.stale_retried => {
                        self.nonce = Some(nonce.to_string());
                        self.stale_retried = true;
                        self.send_allocate(now);
                    }
                    _ => self.fail("stale nonce loop on allocate", Error::AuthFailed),
                };
            }
            // Close the current socket and restart against the named
            // server; the adapter observes the fresh Resolved transition.
            Some(ErrorKind::TryAlternate) => {
                if self.alternate_tried {
                    self.fail("redirected more than once", Error::AllocRejected(300));
                    return;
                }

                let Some(alternate) = message.get::<AlternateServer>() else {
                    self.fail("300 response without ALTERNATE-SERVER", Error::ProtocolError);
                    return;
                };

                log::info!("redirected to alternate server: server={}", alternate);

                self.alternate_tried = true;
                self.transactions.clear();
                self.server = Some(alternate);
                self.set_state(SessionState::Resolved);
            }
            _ => {
                log::error!(
                    "allocation rejected: code={}, reason={}",
                    error.code,
                    error.message
                );

                self.set_state(SessionState::Deallocating);
                self.set_state(SessionState::Destroying);
            }
        }
    }

    fn on_refresh_response(&mut self, deallocate: bool, message: &Message, now: Instant) {
        if deallocate {
            self.set_state(SessionState::Destroying);
            return;
        }

        if self.state != SessionState::Ready {
            return;
        }

        self.lifetime = message.get::<Lifetime>().unwrap_or(DEFAULT_LIFETIME);
        self.expires_at = Some(now + Duration::from_secs(self.lifetime as u64));
        self.refresh_retried = false;
        self.schedule_refresh(now);

        log::debug!("allocation refreshed: lifetime={}", self.lifetime);
    }

    fn on_refresh_error(&mut self, deallocate: bool, message: &Message, now: Instant) {
        if deallocate {
            // 437 here means the allocation is already gone, anything else
            // leaves nothing to release either.
            self.set_state(SessionState::Destroying);
            return;
        }

        if self.state != SessionState::Ready {
            return;
        }

        if let Some(nonce) = message.get::<Nonce>() {
            self.nonce = Some(nonce.to_string());
        }

        if !self.refresh_retried {
            self.refresh_retried = true;
            let lifetime = self.param.lifetime;
            self.send_refresh(lifetime, false, now);
        } else {
            log::error!("allocation refresh failed twice, releasing");
            self.set_state(SessionState::Deallocating);
            self.send_refresh(Some(0), true, now);
        }
    }

    fn on_create_permission_response(&mut self, peers: &[SocketAddr], now: Instant) {
        for peer in peers {
            if let Some(permission) = self.permissions.get_mut(&peer.ip()) {
                permission.expires_at = now + PERMISSION_LIFETIME;
                permission.pending = false;
            }
        }

        log::debug!("permissions installed: peers={:?}", peers);
    }

    fn on_create_permission_error(
        &mut self,
        peers: Vec<SocketAddr>,
        retried: bool,
        message: &Message,
        now: Instant,
    ) {
        if !retried {
            if let (Some(error), Some(nonce)) = (message.get::<ErrorCode>(), message.get::<Nonce>())
            {
                if error.kind() == Some(ErrorKind::StaleNonce) {
                    self.nonce = Some(nonce.to_string());
                    self.send_create_permission(peers, true, now);
                    return;
                }
            }
        }

        log::warn!("create permission rejected: peers={:?}", peers);

        for peer in peers {
            self.permissions.remove(&peer.ip());
        }
    }

    fn on_channel_bind_response(&mut self, peer: SocketAddr, number: u16, now: Instant) {
        let Some(binding) = self.channels.get_mut(&peer) else {
            return;
        };

        binding.bound = true;
        binding.pending = false;
        binding.refresh_at = now + CHANNEL_REFRESH;

        // a channel binding also installs the permission.
        self.permissions.insert(
            peer.ip(),
            Permission {
                addr: peer,
                expires_at: now + PERMISSION_LIFETIME,
                pending: false,
            },
        );

        log::info!("channel bound: peer={}, number={:#06x}", peer, number);

        self.outputs
            .push_back(SessionOutput::ChannelBound { peer, number });
    }

    fn on_channel_bind_error(
        &mut self,
        peer: SocketAddr,
        number: u16,
        retried: bool,
        message: &Message,
        now: Instant,
    ) {
        if !retried {
            if let (Some(error), Some(nonce)) = (message.get::<ErrorCode>(), message.get::<Nonce>())
            {
                if error.kind() == Some(ErrorKind::StaleNonce) {
                    self.nonce = Some(nonce.to_string());
                    self.send_channel_bind(peer, number, true, now);
                    return;
                }
            }
        }

        log::warn!("channel bind rejected: peer={}, number={:#06x}", peer, number);

        self.channels.remove(&peer);
        self.channel_peers.remove(&number);
    }

    fn on_transaction_timeout(&mut self, request: Request, now: Instant) {
        match request {
            Request::Allocate => self.fail("allocate transaction timed out", Error::TimedOut),
            Request::Refresh { deallocate: true } => {
                log::warn!("deallocate refresh timed out");
                self.set_state(SessionState::Destroying);
            }
            Request::Refresh { deallocate: false } => {
                log::warn!("refresh transaction timed out, releasing");
                if self.state == SessionState::Ready {
                    self.set_state(SessionState::Deallocating);
                    self.send_refresh(Some(0), true, now);
                }
            }
            Request::CreatePermission { peers, .. } => {
                log::warn!("create permission timed out: peers={:?}", peers);
                for peer in peers {
                    self.permissions.remove(&peer.ip());
                }
            }
            Request::ChannelBind { peer, number, .. } => {
                log::warn!("channel bind timed out: peer={}", peer);
                self.channels.remove(&peer);
                self.channel_peers.remove(&number);
            }
        }
    }

    // Success responses are integrity-checked once the long term key is
    // known; challenges arrive before any key exists and are exempt.
    fn verify(&self, message: &Message) -> bool {
        match &self.key {
            Some(key) => message.checksum(key.as_slice()).is_ok(),
            None => true,
        }
    }

    fn schedule_refresh(&mut self, now: Instant) {
        let lifetime = self.lifetime as u64;
        let jitter = rand::rng().random_range(0..=lifetime / 10);
        let delay = (lifetime / 2).saturating_sub(jitter).max(1);
        self.refresh_at = Some(now + Duration::from_secs(delay));
    }
}

fn min_instant(a: Option<Instant>, b: Option<Instant>) -> Option<Instant> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
