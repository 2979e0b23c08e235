//! ## STUN/TURN wire codec
//!
//! [RFC5389]: https://tools.ietf.org/html/rfc5389
//! [RFC5766]: https://tools.ietf.org/html/rfc5766
//!
//! TURN messages are STUN messages with TURN-specific methods and
//! attributes. A TURN client speaks two framings on the same socket: STUN
//! messages (20-byte header, magic cookie) for the control plane, and
//! ChannelData (4-byte header) for data sent over an established channel
//! binding.
//!
//! This crate owns everything byte-level: reading and writing messages
//! without copying attribute payloads, the ChannelData framing including
//! the 4-byte alignment that stream transports require, and the long-term
//! credential digests used for MESSAGE-INTEGRITY.

pub mod channel_data;
pub mod crypto;
pub mod message;

use self::{
    channel_data::ChannelData,
    message::{Message, attributes::AttributeKind},
};

use std::{array::TryFromSliceError, ops::Range, str::Utf8Error};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    DigestFailed,
    IntegrityNotFound,
    IntegrityMismatch,
    MagicNumberMismatch,
    UnknownMethod,
    Utf8Error(Utf8Error),
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// A cache of the list of attributes, this is for internal use only.
#[derive(Debug, Clone)]
pub struct Attributes(Vec<(AttributeKind, Range<usize>)>);

impl Default for Attributes {
    fn default() -> Self {
        Self(Vec::with_capacity(20))
    }
}

impl Attributes {
    pub fn append(&mut self, kind: AttributeKind, range: Range<usize>) {
        self.0.push((kind, range));
    }

    /// Gets an attribute from the list.
    ///
    /// Note: This function will only look for the first matching attribute
    /// in the list and return it.
    pub fn get(&self, kind: &AttributeKind) -> Option<Range<usize>> {
        self.0
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, v)| v.clone())
    }

    /// Gets all the values of an attribute from the list.
    ///
    /// A stun message can carry multiple attributes of the same type, for
    /// example the XOR-PEER-ADDRESS list in a CreatePermission request.
    pub fn get_all<'a>(
        &'a self,
        kind: &'a AttributeKind,
    ) -> impl Iterator<Item = &'a Range<usize>> {
        self.0.iter().filter(move |(k, _)| k == kind).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        if !self.0.is_empty() {
            self.0.clear();
        }
    }
}

pub enum DecodeResult<'a> {
    Message(Message<'a>),
    ChannelData(ChannelData<'a>),
}

impl<'a> DecodeResult<'a> {
    pub fn into_message(self) -> Option<Message<'a>> {
        match self {
            Self::Message(it) => Some(it),
            _ => None,
        }
    }

    pub fn into_channel_data(self) -> Option<ChannelData<'a>> {
        match self {
            Self::ChannelData(it) => Some(it),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Decoder(Attributes);

impl Decoder {
    /// Decode a single framing unit, either a stun message or a
    /// ChannelData message.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::ALLOCATE_REQUEST;
    /// use turn_client_codec::Decoder;
    ///
    /// let buffer = [
    ///     0x00u8, 0x03, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x6c, 0x46, 0x62,
    ///     0x54, 0x75, 0x4b, 0x44, 0x51, 0x46, 0x48, 0x4c, 0x71,
    /// ];
    ///
    /// let mut decoder = Decoder::default();
    /// let message = decoder.decode(&buffer).unwrap().into_message().unwrap();
    ///
    /// assert_eq!(message.method(), ALLOCATE_REQUEST);
    /// ```
    pub fn decode<'a>(&'a mut self, bytes: &'a [u8]) -> Result<DecodeResult<'a>, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        Ok(if bytes[0] >> 6 == 0 {
            self.0.clear();

            DecodeResult::Message(Message::decode(bytes, &mut self.0)?)
        } else {
            DecodeResult::ChannelData(ChannelData::decode(bytes)?)
        })
    }

    /// Compute the total framed size of the message starting at the head of
    /// the buffer, from the first 4 bytes alone.
    ///
    /// A buffer starting with two zero bits and a length field that is a
    /// multiple of 4 is a stun message of `20 + length` bytes; a `0b01`
    /// lead is ChannelData of `4 + length` bytes, padded up to a 4-byte
    /// boundary on stream transports.
    ///
    /// # Test
    ///
    /// ```
    /// use turn_client_codec::Decoder;
    ///
    /// let stun = [0x00u8, 0x03, 0x00, 0x08, 0x21, 0x12, 0xa4, 0x42];
    /// assert_eq!(Decoder::message_size(&stun, false).unwrap(), 28);
    ///
    /// let channel_data = [0x40u8, 0x01, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c];
    /// assert_eq!(Decoder::message_size(&channel_data, false).unwrap(), 9);
    /// assert_eq!(Decoder::message_size(&channel_data, true).unwrap(), 12);
    /// ```
    pub fn message_size(bytes: &[u8], is_tcp: bool) -> Result<usize, Error> {
        if bytes.len() < 4 {
            return Err(Error::InvalidInput);
        }

        let length = u16::from_be_bytes(bytes[2..4].try_into()?) as usize;

        Ok(if bytes[0] >> 6 == 0 && length % 4 == 0 {
            20 + length
        } else {
            let mut size = 4 + length;
            if is_tcp && size % 4 > 0 {
                size += 4 - size % 4;
            }

            size
        })
    }
}
