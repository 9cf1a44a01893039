use std::fmt;
use std::io::Cursor;

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::Bytes;

use super::coding::{CloseCode, Control, Data, OpCode};
use super::mask::apply_mask;
use super::PAYLOAD_MAX;
use crate::error::{CapacityError, Error, ProtocolError, Result};

/// A struct representing a WebSocket frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented message.
    pub is_final: bool,
    /// Reserved for protocol extensions, must be zero without negotiation.
    pub rsv1: bool,
    /// Reserved for protocol extensions, must be zero without negotiation.
    pub rsv2: bool,
    /// Reserved for protocol extensions, must be zero without negotiation.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any. The key is applied to the payload on the wire
    /// only; in-memory payloads are always plaintext.
    pub mask: Option<u32>,
}

impl Default for FrameHeader {
    fn default() -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: OpCode::Control(Control::Close),
            mask: None,
        }
    }
}

impl FrameHeader {
    /// Get the size of the header formatted for a payload of the given length.
    pub fn len(&self, payload_len: u64) -> usize {
        let mut header_length = 2;
        if payload_len > 125 {
            if payload_len <= u16::MAX as u64 {
                header_length += 2;
            } else {
                header_length += 8;
            }
        }
        if self.mask.is_some() {
            header_length += 4;
        }
        header_length
    }

    /// Parse a header from the cursor, along with the payload length it
    /// announces. Returns `Ok(None)` and leaves the cursor untouched when the
    /// input does not yet contain a complete header.
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Option<(FrameHeader, u64)>> {
        let initial = cursor.position();
        match Self::parse_internal(cursor) {
            ret @ Ok(Some(_)) => ret,
            ret => {
                cursor.set_position(initial);
                ret
            }
        }
    }

    fn parse_internal(cursor: &mut Cursor<&[u8]>) -> Result<Option<(FrameHeader, u64)>> {
        let (first, second) = {
            let mut head = [0u8; 2];
            if read_available(cursor, &mut head) != 2 {
                return Ok(None);
            }
            (head[0], head[1])
        };

        let is_final = first & 0x80 != 0;
        let rsv1 = first & 0x40 != 0;
        let rsv2 = first & 0x20 != 0;
        let rsv3 = first & 0x10 != 0;

        let opcode = OpCode::from(first & 0x0F);
        if opcode.is_reserved() {
            return Err(Error::Protocol(ProtocolError::InvalidOpcode(first & 0x0F)));
        }

        let masked = second & 0x80 != 0;

        let length = match second & 0x7F {
            126 => match cursor.read_u16::<NetworkEndian>() {
                Ok(length) => u64::from(length),
                Err(_) => return Ok(None),
            },
            127 => match cursor.read_u64::<NetworkEndian>() {
                Ok(length) if length > PAYLOAD_MAX as u64 => {
                    // Reject before the payload is ever allocated.
                    return Err(Error::Capacity(CapacityError::MessageTooLong {
                        size: length,
                        max_size: PAYLOAD_MAX as u64,
                    }));
                }
                Ok(length) => length,
                Err(_) => return Ok(None),
            },
            length => u64::from(length),
        };

        let mask = if masked {
            match cursor.read_u32::<NetworkEndian>() {
                Ok(key) => Some(key),
                Err(_) => return Ok(None),
            }
        } else {
            None
        };

        let header = FrameHeader {
            is_final,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
        };
        Ok(Some((header, length)))
    }

    /// Append the wire form of the header to `out`, announcing a payload of
    /// the given length.
    pub fn format(&self, payload_len: u64, out: &mut Vec<u8>) {
        let mut first = u8::from(self.opcode);
        if self.is_final {
            first |= 0x80;
        }
        if self.rsv1 {
            first |= 0x40;
        }
        if self.rsv2 {
            first |= 0x20;
        }
        if self.rsv3 {
            first |= 0x10;
        }
        out.push(first);

        let masked_bit = if self.mask.is_some() { 0x80 } else { 0 };
        if payload_len < 126 {
            out.push(masked_bit | payload_len as u8);
        } else if payload_len <= u16::MAX as u64 {
            out.push(masked_bit | 126);
            out.extend_from_slice(&(payload_len as u16).to_be_bytes());
        } else {
            out.push(masked_bit | 127);
            out.extend_from_slice(&payload_len.to_be_bytes());
        }

        if let Some(key) = self.mask {
            out.extend_from_slice(&key.to_be_bytes());
        }
    }
}

/// Read from the cursor without failing on a short input.
fn read_available(cursor: &mut Cursor<&[u8]>, buf: &mut [u8]) -> usize {
    use std::io::Read;
    match cursor.read(buf) {
        Ok(n) => n,
        Err(_) => 0,
    }
}

/// A struct representing a WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Bytes,
}

impl Frame {
    /// Get the length of the frame.
    /// This is the length of the header + the length of the payload.
    #[inline]
    pub fn len(&self) -> usize {
        self.header.len(self.payload.len() as u64) + self.payload.len()
    }

    /// Get a reference to the frame's header.
    #[inline]
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Test whether the frame is a final frame.
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.is_final
    }

    /// Get the OpCode of the frame.
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Test whether the frame is masked.
    #[inline]
    pub fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Get a reference to the frame's payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame into its payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Mask the frame with the given key when it is written out.
    #[inline]
    pub fn set_mask(&mut self, key: u32) -> &mut Frame {
        self.header.mask = Some(key);
        self
    }

    /// Create a frame from a header and its announced payload.
    pub fn from_payload(header: FrameHeader, payload: Bytes) -> Self {
        Frame { header, payload }
    }

    /// Consume a close frame into its close code, read from the first two
    /// payload bytes. A payload too short to carry a code stands for a
    /// normal closure.
    #[inline]
    pub fn into_close(self) -> Option<CloseCode> {
        if self.payload.len() >= 2 {
            let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
            Some(code.into())
        } else {
            None
        }
    }

    /// Create a new data frame.
    #[inline]
    pub fn message(data: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(
            matches!(opcode, OpCode::Data(_)),
            "Invalid opcode for data frame."
        );
        Frame {
            header: FrameHeader {
                is_final,
                opcode,
                ..FrameHeader::default()
            },
            payload: data.into(),
        }
    }

    /// Create a new Ping control frame. Payloads longer than the control
    /// frame limit of 125 bytes are truncated.
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader {
                opcode: OpCode::Control(Control::Ping),
                ..FrameHeader::default()
            },
            payload: truncate_control(data.into()),
        }
    }

    /// Create a new Pong control frame. Payloads longer than the control
    /// frame limit of 125 bytes are truncated.
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Frame {
        Frame {
            header: FrameHeader {
                opcode: OpCode::Control(Control::Pong),
                ..FrameHeader::default()
            },
            payload: truncate_control(data.into()),
        }
    }

    /// Create a new Close control frame carrying the given close code.
    #[inline]
    pub fn close(code: Option<CloseCode>) -> Frame {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&u16::from(code).to_be_bytes()),
            None => Bytes::new(),
        };
        Frame {
            header: FrameHeader::default(),
            payload,
        }
    }

    /// Append the wire form of the frame to `out`, applying the mask to the
    /// written payload if one is set.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.reserve(self.len());
        self.header.format(self.payload.len() as u64, out);
        let start = out.len();
        out.extend_from_slice(&self.payload);
        if let Some(key) = self.header.mask {
            apply_mask(&mut out[start..], key);
        }
    }

    /// Split a data payload into as many frames as its size requires: the
    /// first frame carries `kind`, interior frames are non-final
    /// continuations, the last frame carries the final flag. Text payloads
    /// must be valid UTF-8 as a whole.
    pub fn fragment(kind: Data, data: Bytes, mask: Option<u32>) -> Result<Vec<Frame>> {
        debug_assert!(
            matches!(kind, Data::Text | Data::Binary),
            "Only text and binary messages fragment."
        );
        if kind == Data::Text {
            std::str::from_utf8(&data)?;
        }
        Ok(Self::fragment_into(kind, data, mask, PAYLOAD_MAX))
    }

    fn fragment_into(kind: Data, data: Bytes, mask: Option<u32>, max_len: usize) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(data.len() / max_len.max(1) + 1);
        let mut start = 0;
        loop {
            let end = usize::min(start + max_len, data.len());
            let opcode = if start == 0 {
                OpCode::Data(kind)
            } else {
                OpCode::Data(Data::Continue)
            };
            let mut frame = Frame::message(data.slice(start..end), opcode, end == data.len());
            if let Some(key) = mask {
                frame.set_mask(key);
            }
            frames.push(frame);
            start = end;
            if start >= data.len() {
                break;
            }
        }
        frames
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<FRAME final: {} opcode: {} masked: {} payload length: {}>",
            self.header.is_final,
            self.header.opcode,
            self.is_masked(),
            self.payload.len(),
        )
    }
}

fn truncate_control(mut data: Bytes) -> Bytes {
    // Control frames carry at most 125 payload bytes (RFC 6455 §5.5).
    if data.len() > 125 {
        data.truncate(125);
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_ping() {
        let frame = Frame::ping(vec![0x01, 0x02]);
        let mut buf = Vec::with_capacity(frame.len());
        frame.encode(&mut buf);
        assert_eq!(buf, vec![0x89, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn ping_payload_truncated() {
        let frame = Frame::ping(vec![0xAA; 200]);
        assert_eq!(frame.payload().len(), 125);
    }

    #[test]
    fn close_carries_code() {
        let frame = Frame::close(Some(CloseCode::Normal));
        assert_eq!(frame.payload(), &[0x03, 0xe8]);
        assert_eq!(frame.into_close(), Some(CloseCode::Normal));
    }

    #[test]
    fn close_without_code() {
        let frame = Frame::close(None);
        assert_eq!(frame.into_close(), None);
    }

    #[test]
    fn masked_encode_applies_key() {
        let mut frame = Frame::pong(&b"Hello"[..]);
        frame.set_mask(0x37fa_213d);
        let mut buf = Vec::new();
        frame.encode(&mut buf);
        assert_eq!(
            buf,
            vec![0x8a, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    #[test]
    fn fragment_shape() {
        let data = Bytes::from_static(b"abcdefghijkl");
        let frames = Frame::fragment_into(Data::Binary, data.clone(), None, 4);
        assert_eq!(frames.len(), 3);

        let opcodes: Vec<u8> = frames.iter().map(|f| u8::from(f.opcode())).collect();
        assert_eq!(opcodes, vec![2, 0, 0]);
        let fins: Vec<bool> = frames.iter().map(|f| f.is_final()).collect();
        assert_eq!(fins, vec![false, false, true]);

        let mut joined = Vec::new();
        for frame in frames {
            joined.extend_from_slice(frame.payload());
        }
        assert_eq!(joined, data);
    }

    #[test]
    fn fragment_splits_at_the_payload_cap() {
        // One byte past the cap forces a second frame; slicing keeps this
        // cheap since the fragments borrow the same allocation.
        let data = Bytes::from(vec![0x5a; PAYLOAD_MAX + 1]);
        let frames = Frame::fragment(Data::Binary, data, None).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload().len(), PAYLOAD_MAX);
        assert_eq!(frames[1].payload().len(), 1);
        assert!(!frames[0].is_final());
        assert!(frames[1].is_final());
        assert_eq!(frames[1].opcode(), OpCode::Data(Data::Continue));
    }

    #[test]
    fn fragment_small_payload_is_single_frame() {
        let frames = Frame::fragment(Data::Text, Bytes::from_static(b"hi"), None).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_final());
        assert_eq!(frames[0].opcode(), OpCode::Data(Data::Text));
    }

    #[test]
    fn fragment_empty_payload_is_single_frame() {
        let frames = Frame::fragment(Data::Binary, Bytes::new(), None).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_final());
    }

    #[test]
    fn fragment_rejects_invalid_utf8() {
        let err = Frame::fragment(Data::Text, Bytes::from_static(&[0xff, 0xfe]), None).unwrap_err();
        assert!(matches!(err, Error::Utf8(_)));
    }

    #[test]
    fn header_roundtrip_extended_lengths() {
        for len in [0u64, 125, 126, 127, 65535, 65536] {
            let header = FrameHeader {
                opcode: OpCode::Data(Data::Binary),
                ..FrameHeader::default()
            };
            let mut buf = Vec::new();
            header.format(len, &mut buf);
            let mut cursor = Cursor::new(&buf[..]);
            let (parsed, parsed_len) = FrameHeader::parse(&mut cursor).unwrap().unwrap();
            assert_eq!(parsed, header);
            assert_eq!(parsed_len, len);
        }
    }

    #[test]
    fn header_parse_incomplete_resets_cursor() {
        // A masked frame header missing its key bytes.
        let buf = [0x82u8, 0xFE, 0x01];
        let mut cursor = Cursor::new(&buf[..]);
        assert!(FrameHeader::parse(&mut cursor).unwrap().is_none());
        assert_eq!(cursor.position(), 0);
    }
}
