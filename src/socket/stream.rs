use bytes::{Bytes, BytesMut};
use codec::Decoder;

use crate::error::Error;

/// Reassembly buffer for stream transports.
///
/// TCP delivers an unframed byte stream; TURN messages are carved out of
/// it one at a time using only their leading 4 bytes: stun messages are
/// `20 + length`, ChannelData is `4 + length` rounded up to the 4-byte
/// stream alignment. Datagram transports never go through here, a
/// datagram is a frame by itself.
pub(crate) struct StreamBuffer {
    buf: BytesMut,
    max_pkt_size: usize,
}

impl StreamBuffer {
    pub fn new(max_pkt_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_pkt_size * 2),
            max_pkt_size,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Framed length of the message at the head of the buffer, or 0 when
    /// more bytes are needed to complete it.
    pub fn has_packet(&self) -> usize {
        match Decoder::message_size(&self.buf, true) {
            Ok(size) if size <= self.buf.len() => size,
            _ => 0,
        }
    }

    /// Split one complete message off the head of the buffer.
    ///
    /// A frame whose computed length exceeds the read buffer size can
    /// never be completed and reports a protocol error; the connection is
    /// beyond recovery at that point.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, Error> {
        if let Ok(size) = Decoder::message_size(&self.buf, true) {
            if size > self.max_pkt_size {
                return Err(Error::ProtocolError);
            }
        }

        match self.has_packet() {
            0 => Ok(None),
            size => Ok(Some(self.buf.split_to(size).freeze())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    // a 20-byte stun message and a 12-byte tcp-padded ChannelData frame.
    fn stun_frame() -> Vec<u8> {
        let mut frame = vec![0x01u8, 0x01, 0x00, 0x00, 0x21, 0x12, 0xa4, 0x42];
        frame.extend_from_slice(&[0x72u8; 12]);
        frame
    }

    fn channel_frame() -> Vec<u8> {
        let mut frame = BytesMut::new();
        frame.put_u16(0x4001);
        frame.put_u16(5);
        frame.extend_from_slice(b"hello");
        frame.put_bytes(0, 3);
        frame.to_vec()
    }

    #[test]
    fn test_splits_mixed_stream() {
        let mut stream = StreamBuffer::new(3000);

        // [stun 20][channel data 12][4 bytes of the next stun header]
        stream.extend(&stun_frame());
        stream.extend(&channel_frame());
        stream.extend(&stun_frame()[..4]);

        let frame = stream.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 20);
        assert_eq!(frame[0], 0x01);

        let frame = stream.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[4..9], b"hello");

        // the partial header is not a frame yet.
        assert_eq!(stream.has_packet(), 0);
        assert!(stream.next_frame().unwrap().is_none());

        // the remaining 16 bytes complete it.
        stream.extend(&stun_frame()[4..]);
        let frame = stream.next_frame().unwrap().unwrap();
        assert_eq!(frame.len(), 20);
    }

    #[test]
    fn test_frame_lengths_sum_to_bytes_consumed() {
        let mut input = Vec::new();
        for _ in 0..3 {
            input.extend_from_slice(&stun_frame());
            input.extend_from_slice(&channel_frame());
        }

        let mut stream = StreamBuffer::new(3000);
        let mut consumed = 0;

        // feed in awkward chunk sizes, drain after each chunk.
        for chunk in input.chunks(7) {
            stream.extend(chunk);
            while let Some(frame) = stream.next_frame().unwrap() {
                consumed += frame.len();
            }
        }

        assert_eq!(consumed, input.len());
        assert_eq!(stream.len(), 0);
        assert_eq!(stream.has_packet(), 0);
    }

    #[test]
    fn test_oversized_frame_is_a_protocol_error() {
        let mut stream = StreamBuffer::new(16);

        // a stun message claiming a 64-byte body can never fit.
        stream.extend(&[0x01u8, 0x01, 0x00, 0x40, 0x21, 0x12, 0xa4, 0x42]);

        assert!(matches!(stream.next_frame(), Err(Error::ProtocolError)));
    }

    #[test]
    fn test_unpadded_length_is_rounded_on_stream() {
        let mut stream = StreamBuffer::new(3000);
        stream.extend(&channel_frame());

        // the reported length covers the padding and is 4-byte aligned.
        let size = stream.has_packet();
        assert_eq!(size, 12);
        assert_eq!(size % 4, 0);
    }
}
