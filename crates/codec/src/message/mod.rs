pub mod attributes;
pub mod methods;

use crate::{
    Attributes, Error,
    crypto::{fingerprint, hmac_sha1},
    message::{
        attributes::{Attribute, AttributeKind, MessageIntegrity},
        methods::Method,
    },
};

use bytes::{BufMut, BytesMut};

static MAGIC_NUMBER: u32 = 0x2112A442;

/// Writes a stun message into a caller-provided buffer.
///
/// The header is written on construction, attributes are appended one at a
/// time, and `flush` patches the length field and optionally appends
/// MESSAGE-INTEGRITY and FINGERPRINT.
pub struct MessageEncoder<'a> {
    transaction_id: &'a [u8],
    bytes: &'a mut BytesMut,
}

impl<'a> MessageEncoder<'a> {
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    /// use turn_client_codec::*;
    ///
    /// let transaction_id = [
    ///     0x64u8, 0x4f, 0x5a, 0x78, 0x6a, 0x56, 0x33, 0x62, 0x4b, 0x52, 0x33,
    ///     0x31,
    /// ];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &transaction_id, &mut buf);
    /// message.flush(None).unwrap();
    ///
    /// assert_eq!(buf.len(), 20);
    /// assert_eq!(&buf[4..8], &[0x21, 0x12, 0xa4, 0x42]);
    /// assert_eq!(&buf[8..], &transaction_id);
    /// ```
    pub fn new(method: Method, transaction_id: &'a [u8; 12], bytes: &'a mut BytesMut) -> Self {
        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(transaction_id.as_slice());

        Self {
            transaction_id,
            bytes,
        }
    }

    /// Create a message that reuses the transaction id of a received
    /// message, for building the response side of an exchange.
    pub fn extend(method: Method, reader: &Message<'a>, bytes: &'a mut BytesMut) -> Self {
        let transaction_id = reader.transaction_id();

        bytes.clear();
        bytes.put_u16(method.into());
        bytes.put_u16(0);
        bytes.put_u32(MAGIC_NUMBER);
        bytes.put(transaction_id);

        Self {
            transaction_id,
            bytes,
        }
    }

    /// Append an attribute to the message attribute list.
    ///
    /// The value length field is patched after serialization, and the body
    /// is padded out to a 4-byte boundary.
    pub fn append<'c, T: Attribute<'c>>(&'c mut self, value: T::Item) {
        self.bytes.put_u16(T::KIND as u16);

        // reserve the length field, the value size is only known after
        // serialization.
        let offset = self.bytes.len();
        self.bytes.put_u16(0);
        T::serialize(value, self.bytes, self.transaction_id);

        let size = self.bytes.len() - offset - 2;
        self.bytes[offset..offset + 2].copy_from_slice(&(size as u16).to_be_bytes());

        let pad = alignment_32(size);
        if pad > 0 {
            self.bytes.put_bytes(0, pad);
        }
    }

    /// Finish the message: write the attribute list size into the header,
    /// and when a credential key is given, seal the message with
    /// MESSAGE-INTEGRITY and FINGERPRINT.
    ///
    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use turn_client_codec::message::attributes::*;
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    /// use turn_client_codec::*;
    ///
    /// let transaction_id = [0x72u8; 12];
    ///
    /// let mut buf = BytesMut::with_capacity(1280);
    /// let mut message = MessageEncoder::new(ALLOCATE_REQUEST, &transaction_id, &mut buf);
    /// message.append::<RequestedTransport>(Transport::Udp);
    /// message.flush(None).unwrap();
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buf[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), ALLOCATE_REQUEST);
    /// assert_eq!(message.get::<RequestedTransport>(), Some(Transport::Udp));
    /// ```
    pub fn flush(&mut self, key: Option<&[u8]>) -> Result<(), Error> {
        self.set_len(self.bytes.len() - 20);

        if let Some(key) = key {
            self.seal(key)?;
        }

        Ok(())
    }

    // Appends MESSAGE-INTEGRITY and FINGERPRINT. The header length field
    // must cover each attribute at the time its digest is computed.
    fn seal(&mut self, key: &[u8]) -> Result<(), Error> {
        let len = self.bytes.len();

        // the integrity digest covers the message with the length field
        // already including the 24-byte MESSAGE-INTEGRITY attribute.
        self.set_len(len - 20 + 24);

        let digest = hmac_sha1(key, &[&self.bytes[..]])?;
        self.bytes.put_u16(AttributeKind::MessageIntegrity as u16);
        self.bytes.put_u16(20);
        self.bytes.put(digest.as_slice());

        // same again for the 8-byte FINGERPRINT attribute.
        self.set_len(len - 20 + 24 + 8);

        let fingerprint = fingerprint(&self.bytes[..]);
        self.bytes.put_u16(AttributeKind::Fingerprint as u16);
        self.bytes.put_u16(4);
        self.bytes.put_u32(fingerprint);

        Ok(())
    }

    fn set_len(&mut self, len: usize) {
        self.bytes[2..4].copy_from_slice((len as u16).to_be_bytes().as_slice());
    }
}

/// A decoded stun message, borrowing the source buffer.
pub struct Message<'a> {
    method: Method,
    bytes: &'a [u8],
    // offset of the MESSAGE-INTEGRITY attribute, used when verifying the
    // digest.
    integrity_offset: u16,
    attributes: &'a Attributes,
}

impl<'a> Message<'a> {
    #[inline]
    pub fn method(&self) -> Method {
        self.method
    }

    #[inline]
    pub fn transaction_id(&self) -> &'a [u8] {
        &self.bytes[8..20]
    }

    /// Get the first attribute of the given type, if present and parsable.
    pub fn get<T: Attribute<'a>>(&self) -> Option<T::Item> {
        let range = self.attributes.get(&T::KIND)?;
        T::deserialize(&self.bytes[range], self.transaction_id()).ok()
    }

    /// Get every attribute of the given type, in message order.
    pub fn get_all<T: Attribute<'a>>(&self) -> impl Iterator<Item = T::Item> {
        self.attributes
            .get_all(&T::KIND)
            .map(|it| T::deserialize(&self.bytes[it.clone()], self.transaction_id()))
            .filter(|it| it.is_ok())
            .flatten()
    }

    /// Verify the MESSAGE-INTEGRITY attribute against a credential key.
    ///
    /// The digest covers the message up to the integrity attribute, with
    /// the header length field adjusted to end just past it.
    pub fn checksum(&self, key: &[u8]) -> Result<(), Error> {
        if self.bytes.is_empty() || self.integrity_offset < 20 {
            return Err(Error::InvalidInput);
        }

        let integrity = self
            .get::<MessageIntegrity>()
            .ok_or(Error::IntegrityNotFound)?;

        let size = self.integrity_offset as usize;
        let size_buf = (self.integrity_offset + 4).to_be_bytes();
        let body = [&self.bytes[0..2], &size_buf, &self.bytes[4..size]];

        if integrity != hmac_sha1(key, &body)?.as_slice() {
            return Err(Error::IntegrityMismatch);
        }

        Ok(())
    }

    /// # Test
    ///
    /// ```
    /// use turn_client_codec::message::methods::*;
    /// use turn_client_codec::message::*;
    /// use turn_client_codec::*;
    ///
    /// let buffer: [u8; 20] = [
    ///     0x00, 0x04, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42, 0x72, 0x6d, 0x49,
    ///     0x42, 0x72, 0x52, 0x64, 0x48, 0x57, 0x62, 0x4b, 0x2b,
    /// ];
    ///
    /// let mut attributes = Attributes::default();
    /// let message = Message::decode(&buffer[..], &mut attributes).unwrap();
    ///
    /// assert_eq!(message.method(), REFRESH_REQUEST);
    /// ```
    pub fn decode(bytes: &'a [u8], attributes: &'a mut Attributes) -> Result<Self, Error> {
        let len = bytes.len();

        // There must be at least a complete header.
        if len < 20 {
            return Err(Error::InvalidInput);
        }

        let method = Method::try_from(u16::from_be_bytes(bytes[..2].try_into()?))?;

        // The length field does not include the header itself.
        {
            let size = u16::from_be_bytes(bytes[2..4].try_into()?) as usize + 20;
            if len < size {
                return Err(Error::InvalidInput);
            }
        }

        if bytes[4..8] != MAGIC_NUMBER.to_be_bytes() {
            return Err(Error::MagicNumberMismatch);
        }

        let mut integrity_seen = false;
        let mut integrity_offset = 0;
        let mut offset = 20;

        loop {
            if len - offset < 4 {
                break;
            }

            let key = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);

            // remember where the last attribute before MESSAGE-INTEGRITY
            // ends, the digest check needs that offset.
            if !integrity_seen {
                integrity_offset = offset as u16;
            }

            let size = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;

            offset += 4;
            if len - offset < size {
                break;
            }

            let range = offset..(offset + size);

            if size > 0 {
                offset += size + alignment_32(size);
            }

            // skip the attributes that are not supported.
            let kind = if let Ok(kind) = AttributeKind::try_from(key) {
                if kind == AttributeKind::MessageIntegrity {
                    integrity_seen = true;
                }

                kind
            } else {
                continue;
            };

            attributes.append(kind, range);
        }

        Ok(Self {
            integrity_offset,
            attributes,
            method,
            bytes,
        })
    }

}

/// compute padding size.
///
/// RFC5766 stipulates that attribute bodies are aligned on 4 bytes.
///
/// # Test
///
/// ```
/// use turn_client_codec::message::alignment_32;
///
/// assert_eq!(alignment_32(4), 0);
/// assert_eq!(alignment_32(0), 0);
/// assert_eq!(alignment_32(5), 3);
/// ```
#[inline(always)]
pub fn alignment_32(size: usize) -> usize {
    let range = size % 4;
    if size == 0 || range == 0 {
        return 0;
    }

    4 - range
}
