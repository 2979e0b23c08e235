use std::net::SocketAddr;

use anyhow::Result;
use bytes::BytesMut;
use turn_client_codec::{
    Decoder,
    channel_data::ChannelData,
    crypto::long_term_credential,
    message::{
        MessageEncoder,
        attributes::{error::ErrorKind, *},
        methods::*,
    },
};

#[test]
fn test_allocate_request_round_trip() -> Result<()> {
    let transaction_id = [0x21u8; 12];

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &transaction_id, &mut buf);
    message.append::<RequestedTransport>(Transport::Udp);
    message.append::<Software>("turn-client");
    message.flush(None)?;

    let mut decoder = Decoder::default();
    let message = decoder.decode(&buf[..])?.into_message().unwrap();

    assert_eq!(message.method(), ALLOCATE_REQUEST);
    assert_eq!(message.transaction_id(), &transaction_id);
    assert_eq!(message.get::<RequestedTransport>(), Some(Transport::Udp));
    assert_eq!(message.get::<Software>(), Some("turn-client"));

    Ok(())
}

#[test]
fn test_authenticated_request_integrity() -> Result<()> {
    let key = long_term_credential("user1", "test", "localhost");
    let transaction_id = [0x42u8; 12];

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(REFRESH_REQUEST, &transaction_id, &mut buf);
    message.append::<Lifetime>(600);
    message.append::<UserName>("user1");
    message.append::<Realm>("localhost");
    message.append::<Nonce>("6a5633624b523331");
    message.flush(Some(&key[..]))?;

    let mut decoder = Decoder::default();
    let message = decoder.decode(&buf[..])?.into_message().unwrap();

    assert_eq!(message.method(), REFRESH_REQUEST);
    assert_eq!(message.get::<Lifetime>(), Some(600));
    assert_eq!(message.get::<UserName>(), Some("user1"));
    assert!(message.get::<MessageIntegrity>().is_some());
    assert!(message.get::<Fingerprint>().is_some());

    assert!(message.checksum(&key).is_ok());

    let wrong_key = long_term_credential("user1", "wrong", "localhost");
    assert!(message.checksum(&wrong_key).is_err());

    Ok(())
}

#[test]
fn test_error_response() -> Result<()> {
    let transaction_id = [0x33u8; 12];

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(ALLOCATE_ERROR, &transaction_id, &mut buf);
    message.append::<ErrorCode>(ErrorCode::from(ErrorKind::Unauthorized));
    message.append::<Realm>("localhost");
    message.append::<Nonce>("1c13d2b245b3a734");
    message.flush(None)?;

    let mut decoder = Decoder::default();
    let message = decoder.decode(&buf[..])?.into_message().unwrap();

    assert_eq!(message.method(), ALLOCATE_ERROR);

    let error = message.get::<ErrorCode>().unwrap();
    assert_eq!(error.code, 401);
    assert_eq!(error.kind(), Some(ErrorKind::Unauthorized));
    assert_eq!(message.get::<Realm>(), Some("localhost"));
    assert_eq!(message.get::<Nonce>(), Some("1c13d2b245b3a734"));

    Ok(())
}

#[test]
fn test_address_attributes() -> Result<()> {
    let transaction_id = [0x52u8; 12];
    let relayed: SocketAddr = "203.0.113.5:49200".parse()?;
    let mapped: SocketAddr = "198.51.100.7:1000".parse()?;
    let alternate: SocketAddr = "10.0.0.2:3478".parse()?;

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(ALLOCATE_RESPONSE, &transaction_id, &mut buf);
    message.append::<XorRelayedAddress>(relayed);
    message.append::<XorMappedAddress>(mapped);
    message.append::<AlternateServer>(alternate);
    message.append::<Lifetime>(600);
    message.flush(None)?;

    let mut decoder = Decoder::default();
    let message = decoder.decode(&buf[..])?.into_message().unwrap();

    assert_eq!(message.get::<XorRelayedAddress>(), Some(relayed));
    assert_eq!(message.get::<XorMappedAddress>(), Some(mapped));
    assert_eq!(message.get::<AlternateServer>(), Some(alternate));
    assert_eq!(message.get::<Lifetime>(), Some(600));

    Ok(())
}

#[test]
fn test_send_indication_peer_list() -> Result<()> {
    let transaction_id = [0x64u8; 12];
    let peers: [SocketAddr; 2] = ["198.51.100.7:1000".parse()?, "198.51.100.8:2000".parse()?];

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(CREATE_PERMISSION_REQUEST, &transaction_id, &mut buf);
    for peer in peers {
        message.append::<XorPeerAddress>(peer);
    }
    message.flush(None)?;

    let mut decoder = Decoder::default();
    let message = decoder.decode(&buf[..])?.into_message().unwrap();

    let decoded: Vec<SocketAddr> = message.get_all::<XorPeerAddress>().collect();
    assert_eq!(&decoded[..], &peers[..]);

    Ok(())
}

#[test]
fn test_channel_data_tcp_round_trip() -> Result<()> {
    let mut bytes = BytesMut::with_capacity(1500);

    ChannelData {
        number: 0x4001,
        bytes: b"hello",
    }
    .encode(&mut bytes, true);

    // 4-byte header, 5 bytes of data, 3 bytes of stream padding.
    assert_eq!(bytes.len(), 12);
    assert_eq!(Decoder::message_size(&bytes[..], true)?, 12);
    assert_eq!(Decoder::message_size(&bytes[..], false)?, 9);

    let decoded = ChannelData::decode(&bytes[..])?;
    assert_eq!(decoded.number(), 0x4001);
    assert_eq!(decoded.as_bytes(), b"hello");

    Ok(())
}

#[test]
fn test_channel_data_rejects_stun_range_numbers() {
    // 0x7FFF is the last valid channel, 0x3FFF and below collide with the
    // stun framing.
    let bytes = [0x3Fu8, 0xFF, 0x00, 0x00];
    assert!(ChannelData::decode(&bytes).is_err());

    let bytes = [0x40u8, 0x00, 0x00, 0x00];
    assert!(ChannelData::decode(&bytes).is_ok());
}

#[test]
fn test_message_size_probe() -> Result<()> {
    let transaction_id = [0x11u8; 12];

    let mut buf = BytesMut::with_capacity(1280);
    let mut message = MessageEncoder::new(DATA_INDICATION, &transaction_id, &mut buf);
    message.append::<XorPeerAddress>("198.51.100.7:1000".parse()?);
    message.append::<Data>(b"hello");
    message.flush(None)?;

    // the probe only ever looks at the first 4 bytes.
    assert_eq!(Decoder::message_size(&buf[..4], false)?, buf.len());
    assert!(Decoder::message_size(&buf[..3], false).is_err());

    Ok(())
}
