use bytes::{BufMut, BytesMut};

use super::Error;

/// Channel numbers are allocated from the 0x4000-0x7FFF range; the two
/// high bits distinguish a ChannelData header from a stun header on the
/// same socket.
pub const CHANNEL_NUMBER_MIN: u16 = 0x4000;
pub const CHANNEL_NUMBER_MAX: u16 = 0x7FFF;

/// The ChannelData Message
///
/// The ChannelData message is used to carry application data between the
/// client and the server once a channel binding for the peer exists. It
/// replaces the Send/Data indication overhead with a fixed 4-byte header:
/// channel number, then the length in bytes of the application data (the
/// header itself is not counted; 0 is a valid length).
///
/// Over stream transports each ChannelData message is padded up to a
/// multiple of 4 bytes so the next message starts aligned; over datagram
/// transports no padding is used.
pub struct ChannelData<'a> {
    pub number: u16,
    pub bytes: &'a [u8],
}

impl<'a> ChannelData<'a> {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Encode into the buffer, replacing its contents. `is_tcp` appends
    /// the zero padding that stream framing requires.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4001,
    ///     bytes: b"hello",
    /// }
    /// .encode(&mut bytes, true);
    ///
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[..], &[0x40, 0x01, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o', 0, 0, 0]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut, is_tcp: bool) {
        bytes.clear();
        bytes.put_u16(self.number);
        bytes.put_u16(self.bytes.len() as u16);
        bytes.extend_from_slice(self.bytes);

        if is_tcp {
            let pad = bytes.len() % 4;
            if pad > 0 {
                bytes.put_bytes(0, 4 - pad);
            }
        }
    }

    /// Decode the message at the head of the buffer. Trailing padding
    /// beyond the length field is ignored, so the same call handles both
    /// framings.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::channel_data::ChannelData;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// ChannelData {
    ///     number: 0x4001,
    ///     bytes: b"hello",
    /// }
    /// .encode(&mut bytes, true);
    ///
    /// let ret = ChannelData::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.number, 0x4001);
    /// assert_eq!(ret.bytes, b"hello");
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let number = u16::from_be_bytes(bytes[..2].try_into()?);
        if !(CHANNEL_NUMBER_MIN..=CHANNEL_NUMBER_MAX).contains(&number) {
            return Err(Error::InvalidInput);
        }

        let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;
        if size > bytes.len() - 4 {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            bytes: &bytes[4..4 + size],
            number,
        })
    }
}
