//! Utilities to work with raw WebSocket frames.

pub mod coding;

#[allow(clippy::module_inception)]
mod frame;
mod mask;

pub use self::frame::{Frame, FrameHeader};
pub use self::mask::apply_mask;

use std::io::{Cursor, Read, Write};

use byteorder::{NetworkEndian, ReadBytesExt};
use log::trace;

use crate::error::{CapacityError, Error, ProtocolError, Result};
use self::coding::OpCode;

/// The largest payload a single frame may announce. Messages beyond this
/// size go out as multiple frames via [`Frame::fragment`].
pub const PAYLOAD_MAX: usize = 32 << 20;

/// Read a single well-formed frame from the stream, blocking until it is
/// complete. The payload is unmasked in memory; the mask flag and key stay
/// on the parsed header.
///
/// Errors carry the close code to answer with: a short read maps to 1001,
/// an oversize announcement to 1009, a reserved opcode to 1002 (see
/// [`Error::close_code`]).
pub fn read_frame(stream: &mut impl Read) -> Result<Frame> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head)?;
    let (first, second) = (head[0], head[1]);

    let opcode = OpCode::from(first & 0x0F);
    if opcode.is_reserved() {
        return Err(Error::Protocol(ProtocolError::InvalidOpcode(first & 0x0F)));
    }

    let length = match second & 0x7F {
        126 => u64::from(stream.read_u16::<NetworkEndian>()?),
        127 => {
            let length = stream.read_u64::<NetworkEndian>()?;
            if length > PAYLOAD_MAX as u64 {
                // Reject before allocating anything for the payload.
                return Err(Error::Capacity(CapacityError::MessageTooLong {
                    size: length,
                    max_size: PAYLOAD_MAX as u64,
                }));
            }
            length
        }
        length => u64::from(length),
    };

    let mask = if second & 0x80 != 0 {
        Some(stream.read_u32::<NetworkEndian>()?)
    } else {
        None
    };

    let mut payload = vec![0u8; length as usize];
    stream.read_exact(&mut payload)?;
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    let header = FrameHeader {
        is_final: first & 0x80 != 0,
        rsv1: first & 0x40 != 0,
        rsv2: first & 0x20 != 0,
        rsv3: first & 0x10 != 0,
        opcode,
        mask,
    };
    let frame = Frame::from_payload(header, payload.into());
    trace!("received frame {}", frame);
    Ok(frame)
}

/// Split an in-memory byte buffer into complete frames plus any trailing
/// partial bytes. Never consumes more than it parses: the returned remainder
/// starts at the first incomplete frame.
pub fn parse_buffer(buf: &[u8]) -> Result<(Vec<Frame>, &[u8])> {
    let mut frames = Vec::new();
    let mut rest = buf;
    loop {
        let mut cursor = Cursor::new(rest);
        let (header, length) = match FrameHeader::parse(&mut cursor)? {
            Some(parsed) => parsed,
            None => return Ok((frames, rest)),
        };
        let header_len = cursor.position() as usize;
        let total = header_len + length as usize;
        if rest.len() < total {
            return Ok((frames, rest));
        }

        let mut payload = rest[header_len..total].to_vec();
        if let Some(key) = header.mask {
            apply_mask(&mut payload, key);
        }
        frames.push(Frame::from_payload(header, payload.into()));
        rest = &rest[total..];
    }
}

/// Encode and write a single frame as one stream write. Returns the number
/// of bytes put on the wire.
pub fn write_frame(frame: Frame, stream: &mut impl Write) -> Result<usize> {
    trace!("sending frame {}", frame);
    let mut buf = Vec::with_capacity(frame.len());
    frame.encode(&mut buf);
    write_bytes(stream, &buf)
}

/// Write raw, already-encoded bytes to the stream in full.
pub fn write_bytes(stream: &mut impl Write, bytes: &[u8]) -> Result<usize> {
    stream.write_all(bytes)?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::coding::{CloseCode, Control, Data, OpCode};
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_client_masked_ping() {
        // fin=1, opcode=9, unmasked, payload "Hello".
        let raw = [0x89, 0x05, 0x48, 0x65, 0x6c, 0x6c, 0x6f];
        let frame = read_frame(&mut Cursor::new(&raw[..])).unwrap();
        assert!(frame.is_final());
        assert_eq!(frame.opcode(), OpCode::Control(Control::Ping));
        assert!(!frame.is_masked());
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn read_masked_pong() {
        let raw = [
            0x8a, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let frame = read_frame(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(frame.opcode(), OpCode::Control(Control::Pong));
        assert_eq!(frame.header().mask, Some(0x37fa213d));
        assert_eq!(frame.payload(), b"Hello");
    }

    #[test]
    fn read_close_with_code() {
        let raw = [0x88, 0x02, 0x03, 0xe8];
        let frame = read_frame(&mut Cursor::new(&raw[..])).unwrap();
        assert_eq!(frame.opcode(), OpCode::Control(Control::Close));
        assert_eq!(frame.into_close(), Some(CloseCode::Normal));
    }

    #[test]
    fn short_read_maps_to_going_away() {
        let raw = [0x82, 0x05, 0x01];
        let err = read_frame(&mut Cursor::new(&raw[..])).unwrap_err();
        assert_eq!(err.close_code(), CloseCode::Away);
    }

    #[test]
    fn oversize_length_rejected_without_allocation() {
        // 64-bit length far past the cap; only the 10 header bytes exist.
        let raw = [
            0x82, 0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        ];
        let err = read_frame(&mut Cursor::new(&raw[..])).unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity(CapacityError::MessageTooLong { .. })
        ));
        assert_eq!(err.close_code(), CloseCode::Size);
    }

    #[test]
    fn reserved_opcode_rejected() {
        let raw = [0x83, 0x00];
        let err = read_frame(&mut Cursor::new(&raw[..])).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::InvalidOpcode(3))
        ));
    }

    #[test]
    fn roundtrip_preserves_frame() {
        let mut frame = Frame::message(&b"and a happy new year!"[..], OpCode::Data(Data::Text), true);
        frame.set_mask(0xdead_beef);

        let mut wire = Vec::new();
        frame.encode(&mut wire);
        let parsed = read_frame(&mut Cursor::new(&wire[..])).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn parse_buffer_splits_frames_and_remainder() {
        let raw = [
            0x82, 0x07, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, // binary, 7 bytes
            0x82, 0x03, 0x03, 0x02, 0x01, // binary, 3 bytes
            0x99, // trailing partial header
        ];
        let (frames, rest) = parse_buffer(&raw).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload(), &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
        assert_eq!(frames[1].payload(), &[0x03, 0x02, 0x01]);
        assert_eq!(rest, &[0x99]);
    }

    #[test]
    fn parse_buffer_keeps_incomplete_payload_unconsumed() {
        // Header announces 5 payload bytes, only 2 are present.
        let raw = [0x82, 0x05, 0x01, 0x02];
        let (frames, rest) = parse_buffer(&raw).unwrap();
        assert!(frames.is_empty());
        assert_eq!(rest, &raw[..]);
    }

    #[test]
    fn parse_buffer_empty_input() {
        let (frames, rest) = parse_buffer(&[]).unwrap();
        assert!(frames.is_empty());
        assert!(rest.is_empty());
    }

    #[test]
    fn write_frame_counts_wire_bytes() {
        let mut out = Vec::new();
        let n = write_frame(Frame::ping(vec![0x04, 0x05]), &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(out, vec![0x89, 0x02, 0x04, 0x05]);
    }
}
