use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::Duration,
};

use anyhow::Result;
use bytes::BytesMut;
use codec::{
    DecodeResult, Decoder,
    channel_data::ChannelData,
    crypto::long_term_credential,
    message::{
        MessageEncoder,
        attributes::{error::ErrorKind, *},
        methods::*,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
    sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel},
};
use turn_client::{
    AddressFamily, AllocRequest, ConnKind, Credential, SessionState, TurnClient,
    TurnClientOptions, TurnObserver, config::TurnConfig,
};

const USERNAME: &str = "user1";
const PASSWORD: &str = "test";
const REALM: &str = "localhost";
const RELAY: &str = "203.0.113.5:49200";

fn init_log() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

fn server_key() -> [u8; 16] {
    long_term_credential(USERNAME, PASSWORD, REALM)
}

fn credential() -> Credential {
    Credential {
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
    }
}

// Minimal turn server behavior shared by the udp and tcp mocks: a 401
// challenge for the first Allocate, success responses for everything
// else, and echoing of Send indications and ChannelData back at the
// client as if the peer answered in kind.
fn respond(
    bytes: &[u8],
    source: SocketAddr,
    channels: &mut HashMap<u16, SocketAddr>,
    is_tcp: bool,
) -> Vec<Vec<u8>> {
    let key = server_key();
    let mut decoder = Decoder::default();
    let mut replies = Vec::new();

    match decoder.decode(bytes) {
        Err(_) => {}
        Ok(DecodeResult::ChannelData(channel_data)) => {
            if channels.contains_key(&channel_data.number()) {
                let mut buf = BytesMut::new();
                ChannelData {
                    number: channel_data.number(),
                    bytes: channel_data.as_bytes(),
                }
                .encode(&mut buf, is_tcp);
                replies.push(buf.to_vec());
            }
        }
        Ok(DecodeResult::Message(message)) => match message.method() {
            ALLOCATE_REQUEST => {
                if message.get::<MessageIntegrity>().is_none() {
                    let mut buf = BytesMut::new();
                    let mut resp = MessageEncoder::extend(ALLOCATE_ERROR, &message, &mut buf);
                    resp.append::<ErrorCode>(ErrorCode::from(ErrorKind::Unauthorized));
                    resp.append::<Realm>(REALM);
                    resp.append::<Nonce>("testnonce");
                    resp.flush(None).unwrap();
                    replies.push(buf.to_vec());
                } else {
                    let mut buf = BytesMut::new();
                    let mut resp = MessageEncoder::extend(ALLOCATE_RESPONSE, &message, &mut buf);
                    resp.append::<XorRelayedAddress>(RELAY.parse().unwrap());
                    resp.append::<XorMappedAddress>(source);
                    resp.append::<Lifetime>(600);
                    resp.flush(Some(&key[..])).unwrap();
                    replies.push(buf.to_vec());
                }
            }
            REFRESH_REQUEST => {
                let lifetime = message.get::<Lifetime>().unwrap_or(600);
                let mut buf = BytesMut::new();
                let mut resp = MessageEncoder::extend(REFRESH_RESPONSE, &message, &mut buf);
                resp.append::<Lifetime>(lifetime);
                resp.flush(Some(&key[..])).unwrap();
                replies.push(buf.to_vec());
            }
            CREATE_PERMISSION_REQUEST => {
                let mut buf = BytesMut::new();
                let mut resp =
                    MessageEncoder::extend(CREATE_PERMISSION_RESPONSE, &message, &mut buf);
                resp.flush(Some(&key[..])).unwrap();
                replies.push(buf.to_vec());
            }
            CHANNEL_BIND_REQUEST => {
                let number = message.get::<ChannelNumber>().unwrap();
                let peer = message.get::<XorPeerAddress>().unwrap();
                channels.insert(number, peer);

                let mut buf = BytesMut::new();
                let mut resp = MessageEncoder::extend(CHANNEL_BIND_RESPONSE, &message, &mut buf);
                resp.flush(Some(&key[..])).unwrap();
                replies.push(buf.to_vec());

                // on stream transports, follow up with a data indication
                // and a channel data message in the same segment so the
                // client has to split them apart.
                if is_tcp {
                    let id = [0xABu8; 12];
                    let mut buf = BytesMut::new();
                    let mut indication = MessageEncoder::new(DATA_INDICATION, &id, &mut buf);
                    indication.append::<XorPeerAddress>(peer);
                    indication.append::<Data>(b"hello");
                    indication.flush(None).unwrap();
                    replies.push(buf.to_vec());

                    let mut buf = BytesMut::new();
                    ChannelData {
                        number,
                        bytes: b"world",
                    }
                    .encode(&mut buf, true);
                    replies.push(buf.to_vec());
                }
            }
            SEND_INDICATION => {
                let peer = message.get::<XorPeerAddress>().unwrap();
                let data = message.get::<Data>().unwrap();

                let id = [0xCDu8; 12];
                let mut buf = BytesMut::new();
                let mut indication = MessageEncoder::new(DATA_INDICATION, &id, &mut buf);
                indication.append::<XorPeerAddress>(peer);
                indication.append::<Data>(data);
                indication.flush(None).unwrap();
                replies.push(buf.to_vec());
            }
            _ => {}
        },
    }

    replies
}

async fn spawn_udp_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut channels = HashMap::new();
        let mut buf = vec![0u8; 2048];

        while let Ok((size, source)) = socket.recv_from(&mut buf).await {
            for reply in respond(&buf[..size], source, &mut channels, false) {
                let _ = socket.send_to(&reply, source).await;
            }
        }
    });

    addr
}

// Responds to every Allocate with a 300 redirect towards `target`.
async fn spawn_redirect_server(target: SocketAddr) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 2048];

        while let Ok((size, source)) = socket.recv_from(&mut buf).await {
            let mut decoder = Decoder::default();
            let Ok(DecodeResult::Message(message)) = decoder.decode(&buf[..size]) else {
                continue;
            };

            if message.method() != ALLOCATE_REQUEST {
                continue;
            }

            let mut out = BytesMut::new();
            let mut resp = MessageEncoder::extend(ALLOCATE_ERROR, &message, &mut out);
            resp.append::<ErrorCode>(ErrorCode::from(ErrorKind::TryAlternate));
            resp.append::<AlternateServer>(target);
            resp.flush(None).unwrap();

            let _ = socket.send_to(&out, source).await;
        }
    });

    addr
}

async fn spawn_tcp_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let Ok((mut stream, source)) = listener.accept().await else {
            return;
        };

        let mut channels = HashMap::new();
        let mut buf = BytesMut::new();
        let mut chunk = [0u8; 2048];

        loop {
            let Ok(size) = stream.read(&mut chunk).await else {
                break;
            };
            if size == 0 {
                break;
            }

            buf.extend_from_slice(&chunk[..size]);

            loop {
                if buf.len() < 4 {
                    break;
                }

                let Ok(size) = Decoder::message_size(&buf, true) else {
                    break;
                };
                if size > buf.len() {
                    break;
                }

                let frame = buf.split_to(size);
                let replies = respond(&frame, source, &mut channels, true);

                // everything in one write so back to back frames share a
                // segment.
                if !replies.is_empty() && stream.write_all(&replies.concat()).await.is_err() {
                    return;
                }
            }
        }
    });

    addr
}

struct Events {
    states: UnboundedSender<SessionState>,
    data: UnboundedSender<(SocketAddr, Vec<u8>)>,
    channels: UnboundedSender<(SocketAddr, u16)>,
    // set when the observer should destroy the client from inside the
    // ready transition.
    destroy_on_ready: OnceLock<TurnClient>,
}

impl Events {
    fn new() -> (
        Arc<Self>,
        UnboundedReceiver<SessionState>,
        UnboundedReceiver<(SocketAddr, Vec<u8>)>,
        UnboundedReceiver<(SocketAddr, u16)>,
    ) {
        let (states, states_rx) = unbounded_channel();
        let (data, data_rx) = unbounded_channel();
        let (channels, channels_rx) = unbounded_channel();

        (
            Arc::new(Self {
                states,
                data,
                channels,
                destroy_on_ready: OnceLock::new(),
            }),
            states_rx,
            data_rx,
            channels_rx,
        )
    }
}

impl TurnObserver for Events {
    fn on_rx_data(&self, peer: SocketAddr, data: &[u8]) {
        let _ = self.data.send((peer, data.to_vec()));
    }

    fn on_state(&self, _: SessionState, new: SessionState) {
        if new == SessionState::Ready {
            if let Some(client) = self.destroy_on_ready.get() {
                client.destroy();
            }
        }

        let _ = self.states.send(new);
    }

    fn on_channel_bound(&self, peer: SocketAddr, number: u16) {
        let _ = self.channels.send((peer, number));
    }
}

async fn wait_for_state(
    states: &mut UnboundedReceiver<SessionState>,
    target: SessionState,
) -> Vec<SessionState> {
    let mut seen = Vec::new();

    loop {
        let state = tokio::time::timeout(Duration::from_secs(5), states.recv())
            .await
            .expect("timed out waiting for a state transition")
            .expect("state channel closed");

        seen.push(state);
        if state == target {
            return seen;
        }
    }
}

async fn wait_for_data(
    data: &mut UnboundedReceiver<(SocketAddr, Vec<u8>)>,
) -> (SocketAddr, Vec<u8>) {
    tokio::time::timeout(Duration::from_secs(5), data.recv())
        .await
        .expect("timed out waiting for relayed data")
        .expect("data channel closed")
}

fn client(conn: ConnKind, observer: Arc<Events>) -> TurnClient {
    TurnClient::new(TurnClientOptions {
        af: AddressFamily::V4,
        conn,
        config: TurnConfig::default(),
        observer,
    })
    .unwrap()
}

fn alloc(turn: &TurnClient, server: SocketAddr) {
    turn.alloc(AllocRequest {
        domain: "turn.example".to_string(),
        port: 3478,
        resolver: server,
        credential: Some(credential()),
        param: Default::default(),
    })
    .unwrap();
}

#[tokio::test]
async fn test_udp_allocate_send_receive() -> Result<()> {
    init_log();

    let server = spawn_udp_server().await;
    let (observer, mut states, mut data, _) = Events::new();
    let turn = client(ConnKind::Udp, observer);

    turn.set_software_name("turn-client")?;
    turn.set_user_data(Arc::new(42u32));
    assert_eq!(
        turn.user_data()
            .and_then(|it| it.downcast::<u32>().ok())
            .as_deref(),
        Some(&42)
    );

    alloc(&turn, server);

    let seen = wait_for_state(&mut states, SessionState::Ready).await;
    assert_eq!(
        seen,
        [
            SessionState::Resolving,
            SessionState::Resolved,
            SessionState::Allocating,
            SessionState::Ready,
        ]
    );

    let info = turn.info();
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.server, Some(server));
    assert_eq!(info.relay_addr, Some(RELAY.parse()?));
    assert!(info.lifetime_remaining.is_some());

    // no channel binding yet, this goes out as a Send indication and the
    // peer's answer comes back as a Data indication.
    let peer: SocketAddr = "198.51.100.7:1000".parse()?;
    turn.send_to(peer, b"hello")?;

    let (from, payload) = wait_for_data(&mut data).await;
    assert_eq!(from, peer);
    assert_eq!(payload, b"hello");

    turn.destroy();
    let seen = wait_for_state(&mut states, SessionState::Destroyed).await;
    assert_eq!(
        seen,
        [
            SessionState::Deallocating,
            SessionState::Destroying,
            SessionState::Destroyed,
        ]
    );

    // the handle is inert now.
    assert!(turn.send_to(peer, b"hello").is_err());

    Ok(())
}

#[tokio::test]
async fn test_udp_channel_data_round_trip() -> Result<()> {
    init_log();

    let server = spawn_udp_server().await;
    let (observer, mut states, mut data, mut channels) = Events::new();
    let turn = client(ConnKind::Udp, observer);

    alloc(&turn, server);
    wait_for_state(&mut states, SessionState::Ready).await;

    let peer: SocketAddr = "198.51.100.7:1000".parse()?;
    turn.bind_channel(peer)?;

    let (bound_peer, number) = tokio::time::timeout(Duration::from_secs(5), channels.recv())
        .await?
        .unwrap();
    assert_eq!(bound_peer, peer);
    assert!(number >= 0x4000);

    assert_eq!(turn.info().channels, [(peer, number)]);

    // data now travels as ChannelData in both directions; the mock echoes
    // on the same channel.
    turn.send_to(peer, b"over the channel")?;

    let (from, payload) = wait_for_data(&mut data).await;
    assert_eq!(from, peer);
    assert_eq!(payload, b"over the channel");

    turn.destroy();
    wait_for_state(&mut states, SessionState::Destroyed).await;

    Ok(())
}

#[tokio::test]
async fn test_alternate_server_redirect() -> Result<()> {
    init_log();

    let server = spawn_udp_server().await;
    let redirect = spawn_redirect_server(server).await;

    let (observer, mut states, _, _) = Events::new();
    let turn = client(ConnKind::Udp, observer);

    alloc(&turn, redirect);

    let seen = wait_for_state(&mut states, SessionState::Ready).await;

    // the 300 sends the session back through Resolved with a new socket
    // towards the alternate server.
    assert_eq!(
        seen,
        [
            SessionState::Resolving,
            SessionState::Resolved,
            SessionState::Allocating,
            SessionState::Resolved,
            SessionState::Allocating,
            SessionState::Ready,
        ]
    );

    assert_eq!(turn.info().server, Some(server));

    turn.destroy();
    wait_for_state(&mut states, SessionState::Destroyed).await;

    Ok(())
}

#[tokio::test]
async fn test_destroy_inside_state_callback() -> Result<()> {
    init_log();

    let server = spawn_udp_server().await;
    let (observer, mut states, _, _) = Events::new();
    let turn = client(ConnKind::Udp, observer.clone());

    // the observer calls destroy from inside on_state(Ready); teardown
    // must still be orderly and complete.
    observer.destroy_on_ready.set(turn.clone()).ok().unwrap();

    alloc(&turn, server);

    let seen = wait_for_state(&mut states, SessionState::Destroyed).await;
    assert_eq!(
        &seen[seen.len() - 3..],
        [
            SessionState::Deallocating,
            SessionState::Destroying,
            SessionState::Destroyed,
        ]
    );

    // destroying again is a no-op.
    turn.destroy();
    assert!(turn.send_to("198.51.100.7:1000".parse()?, b"x").is_err());

    Ok(())
}

#[tokio::test]
async fn test_port_range_exhaustion() -> Result<()> {
    init_log();

    // occupy two adjacent ports, then force the client into exactly that
    // range.
    let (first, _second, base) = {
        let mut result = None;

        for base in (15000..25000).step_by(7) {
            let first = std::net::UdpSocket::bind(("127.0.0.1", base));
            let second = std::net::UdpSocket::bind(("127.0.0.1", base + 1));

            if let (Ok(first), Ok(second)) = (first, second) {
                result = Some((first, second, base));
                break;
            }
        }

        result.expect("no adjacent free ports found")
    };

    let server = spawn_udp_server().await;
    let (observer, mut states, _, _) = Events::new();

    let turn = TurnClient::new(TurnClientOptions {
        af: AddressFamily::V4,
        conn: ConnKind::Udp,
        config: TurnConfig {
            bound_addr: Some(SocketAddr::new("127.0.0.1".parse()?, base)),
            port_range: 2,
            ..Default::default()
        },
        observer,
    })?;

    alloc(&turn, server);

    // both candidate ports are taken, the session dies without ever
    // reaching Ready.
    let seen = wait_for_state(&mut states, SessionState::Destroyed).await;
    assert!(!seen.contains(&SessionState::Ready));
    assert!(seen.contains(&SessionState::Destroying));

    drop(first);

    Ok(())
}

#[tokio::test]
async fn test_tcp_allocate_and_stream_split() -> Result<()> {
    init_log();

    let server = spawn_tcp_server().await;
    let (observer, mut states, mut data, mut channels) = Events::new();
    let turn = client(ConnKind::Tcp, observer);

    alloc(&turn, server);
    wait_for_state(&mut states, SessionState::Ready).await;

    // binding a channel makes the mock answer with a stun response, a
    // data indication and a padded ChannelData frame back to back in one
    // segment.
    let peer: SocketAddr = "198.51.100.7:1000".parse()?;
    turn.bind_channel(peer)?;

    let (bound_peer, _) = tokio::time::timeout(Duration::from_secs(5), channels.recv())
        .await?
        .unwrap();
    assert_eq!(bound_peer, peer);

    let (from, payload) = wait_for_data(&mut data).await;
    assert_eq!((from, payload), (peer, b"hello".to_vec()));

    let (from, payload) = wait_for_data(&mut data).await;
    assert_eq!((from, payload), (peer, b"world".to_vec()));

    turn.destroy();
    wait_for_state(&mut states, SessionState::Destroyed).await;

    Ok(())
}

#[tokio::test]
async fn test_operations_before_allocation_are_rejected() -> Result<()> {
    init_log();

    let (observer, _states, _, _) = Events::new();
    let turn = client(ConnKind::Udp, observer);

    let peer: SocketAddr = "198.51.100.7:1000".parse()?;
    assert!(matches!(
        turn.send_to(peer, b"hello"),
        Err(turn_client::Error::InvalidState)
    ));
    assert!(matches!(
        turn.bind_channel(peer),
        Err(turn_client::Error::InvalidState)
    ));
    assert!(matches!(
        turn.set_perm(&[peer]),
        Err(turn_client::Error::InvalidState)
    ));

    Ok(())
}
