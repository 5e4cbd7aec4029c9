//! MBAP frame codec
//!
//! Encodes and decodes the Modbus TCP application data unit:
//!
//! ```text
//! +----------------+-------------+--------+---------+---------------+-----------+
//! | transaction id | protocol id | length | unit id | function code |  payload  |
//! |    2 bytes     |   2 bytes   | 2 bytes| 1 byte  |    1 byte     |  n bytes  |
//! +----------------+-------------+--------+---------+---------------+-----------+
//! ```
//!
//! `length` counts the unit id, the function code and the payload. All
//! functions here are pure; [`MbapCodec`] adapts them to `tokio_util` so the
//! transport's receive loop can run a `FramedRead`.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ModbusError, ModbusResult};

/// Size of the MBAP header including the unit id
pub const MBAP_HEADER_SIZE: usize = 7;

/// Smallest legal value of the length field (unit id + function code)
const MIN_LENGTH_FIELD: u16 = 2;

/// Largest legal value of the length field (unit id + 253-byte PDU)
const MAX_LENGTH_FIELD: u16 = (crate::MAX_TCP_FRAME_SIZE - MBAP_HEADER_SIZE + 1) as u16;

/// One Modbus TCP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame with protocol id 0 and a consistent length field
    pub fn new(transaction_id: u16, unit_id: u8, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (payload.len() + 2) as u16,
            unit_id,
            function_code,
            payload,
        }
    }

    /// Exception responses carry the request's function code with bit 7 set
    pub fn is_exception(&self) -> bool {
        self.function_code & 0x80 != 0
    }

    /// Function code with the exception bit cleared
    pub fn base_function_code(&self) -> u8 {
        self.function_code & 0x7F
    }

    /// Total size on the wire
    pub fn wire_len(&self) -> usize {
        MBAP_HEADER_SIZE + 1 + self.payload.len()
    }
}

/// Outcome of feeding a possibly partial buffer to [`decode_partial`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameStatus {
    /// A whole frame was decoded from the first `consumed` bytes
    Complete { frame: Frame, consumed: usize },
    /// At least this many more bytes are required
    NeedMoreData(usize),
}

/// Serialize a frame from its parts
pub fn encode(transaction_id: u16, unit_id: u8, function_code: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + payload.len());
    bytes.extend_from_slice(&transaction_id.to_be_bytes());
    bytes.extend_from_slice(&0u16.to_be_bytes());
    bytes.extend_from_slice(&((payload.len() + 2) as u16).to_be_bytes());
    bytes.push(unit_id);
    bytes.push(function_code);
    bytes.extend_from_slice(payload);
    bytes
}

/// Serialize an existing frame, keeping its header fields verbatim
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.wire_len());
    bytes.extend_from_slice(&frame.transaction_id.to_be_bytes());
    bytes.extend_from_slice(&frame.protocol_id.to_be_bytes());
    bytes.extend_from_slice(&frame.length.to_be_bytes());
    bytes.push(frame.unit_id);
    bytes.push(frame.function_code);
    bytes.extend_from_slice(&frame.payload);
    bytes
}

/// Decode exactly one frame occupying the whole buffer
///
/// Fails with `MalformedFrame` when the buffer is shorter than the header,
/// when the protocol id is not 0, or when the declared length disagrees with
/// the bytes that follow it.
pub fn decode(bytes: &[u8]) -> ModbusResult<Frame> {
    if bytes.len() < MBAP_HEADER_SIZE + 1 {
        return Err(ModbusError::malformed_frame(format!(
            "buffer of {} bytes is shorter than the MBAP header",
            bytes.len()
        )));
    }

    let (protocol_id, length) = parse_header(bytes)?;
    let remaining = bytes.len() - (MBAP_HEADER_SIZE - 1);
    if length as usize != remaining {
        return Err(ModbusError::malformed_frame(format!(
            "declared length {} but {} bytes follow the header",
            length, remaining
        )));
    }

    Ok(build_frame(bytes, protocol_id, length))
}

/// Decode the first frame of a stream buffer
///
/// Returns `NeedMoreData(n)` rather than failing while the header or the
/// declared body is incomplete. Trailing bytes after the frame are left for
/// the next call.
pub fn decode_partial(bytes: &[u8]) -> ModbusResult<FrameStatus> {
    if bytes.len() < MBAP_HEADER_SIZE {
        return Ok(FrameStatus::NeedMoreData(MBAP_HEADER_SIZE - bytes.len()));
    }

    let (protocol_id, length) = parse_header(bytes)?;
    let total = MBAP_HEADER_SIZE - 1 + length as usize;
    if bytes.len() < total {
        return Ok(FrameStatus::NeedMoreData(total - bytes.len()));
    }

    Ok(FrameStatus::Complete {
        frame: build_frame(&bytes[..total], protocol_id, length),
        consumed: total,
    })
}

fn parse_header(bytes: &[u8]) -> ModbusResult<(u16, u16)> {
    let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
    if protocol_id != 0 {
        return Err(ModbusError::malformed_frame(format!(
            "protocol id {} is not Modbus",
            protocol_id
        )));
    }

    let length = u16::from_be_bytes([bytes[4], bytes[5]]);
    if !(MIN_LENGTH_FIELD..=MAX_LENGTH_FIELD).contains(&length) {
        return Err(ModbusError::malformed_frame(format!(
            "length field {} outside {}..={}",
            length, MIN_LENGTH_FIELD, MAX_LENGTH_FIELD
        )));
    }

    Ok((protocol_id, length))
}

// Caller guarantees `bytes` holds exactly header + length - 1 bytes.
fn build_frame(bytes: &[u8], protocol_id: u16, length: u16) -> Frame {
    Frame {
        transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
        protocol_id,
        length,
        unit_id: bytes[6],
        function_code: bytes[7],
        payload: bytes[MBAP_HEADER_SIZE + 1..].to_vec(),
    }
}

/// `tokio_util` codec over [`decode_partial`] and [`encode_frame`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MbapCodec;

impl Decoder for MbapCodec {
    type Item = Frame;
    type Error = ModbusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ModbusError> {
        match decode_partial(src)? {
            FrameStatus::Complete { frame, consumed } => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            FrameStatus::NeedMoreData(missing) => {
                src.reserve(missing);
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for MbapCodec {
    type Error = ModbusError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ModbusError> {
        dst.reserve(frame.wire_len());
        dst.put_slice(&encode_frame(&frame));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Read holding registers 0..60 on unit 0x32, transaction 1
    const READ_REQUEST: [u8; 12] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x32, 0x03, 0x00, 0x00, 0x00, 0x3C];

    #[test]
    fn test_encode_read_request() {
        let bytes = encode(1, 0x32, 0x03, &[0x00, 0x00, 0x00, 0x3C]);
        assert_eq!(bytes, READ_REQUEST.to_vec());
    }

    #[test]
    fn test_decode_complete_frame() {
        let frame = decode(&READ_REQUEST).unwrap();
        assert_eq!(frame.transaction_id, 1);
        assert_eq!(frame.protocol_id, 0);
        assert_eq!(frame.length, 6);
        assert_eq!(frame.unit_id, 0x32);
        assert_eq!(frame.function_code, 0x03);
        assert_eq!(frame.payload, vec![0x00, 0x00, 0x00, 0x3C]);
        assert_eq!(encode_frame(&frame), READ_REQUEST.to_vec());
    }

    #[test]
    fn test_frame_round_trip() {
        let frames = [
            Frame::new(0xFFFF, 0x32, 0x10, vec![0x00, 0x23, 0x00, 0x01, 0x02, 0x00, 0x18]),
            Frame::new(7, 1, 0x83, vec![0x02]),
            Frame::new(0, 0xFF, 0x04, vec![]),
        ];
        for frame in frames {
            assert_eq!(decode(&encode_frame(&frame)).unwrap(), frame);
        }
    }

    #[test]
    fn test_decode_rejects_bad_protocol_id() {
        let mut bytes = READ_REQUEST;
        bytes[3] = 0x01;
        assert!(matches!(decode(&bytes), Err(ModbusError::MalformedFrame { .. })));
        assert!(matches!(decode_partial(&bytes), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        // One byte short of the declared length
        assert!(matches!(decode(&READ_REQUEST[..11]), Err(ModbusError::MalformedFrame { .. })));

        // One byte beyond it
        let mut long = READ_REQUEST.to_vec();
        long.push(0);
        assert!(matches!(decode(&long), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_decode_rejects_short_buffer() {
        assert!(matches!(decode(&READ_REQUEST[..5]), Err(ModbusError::MalformedFrame { .. })));
        assert!(matches!(decode(&[]), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_partial_decode_reports_missing_bytes() {
        assert_eq!(decode_partial(&[]).unwrap(), FrameStatus::NeedMoreData(7));
        assert_eq!(decode_partial(&READ_REQUEST[..3]).unwrap(), FrameStatus::NeedMoreData(4));
        assert_eq!(decode_partial(&READ_REQUEST[..7]).unwrap(), FrameStatus::NeedMoreData(5));
        assert_eq!(decode_partial(&READ_REQUEST[..11]).unwrap(), FrameStatus::NeedMoreData(1));
    }

    #[test]
    fn test_partial_decode_leaves_trailing_bytes() {
        let mut stream = READ_REQUEST.to_vec();
        stream.extend_from_slice(&READ_REQUEST[..4]);
        match decode_partial(&stream).unwrap() {
            FrameStatus::Complete { frame, consumed } => {
                assert_eq!(consumed, READ_REQUEST.len());
                assert_eq!(frame.transaction_id, 1);
            }
            other => panic!("expected a complete frame, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_decode_rejects_impossible_length() {
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x32];
        assert!(matches!(decode_partial(&bytes), Err(ModbusError::MalformedFrame { .. })));
        let bytes = [0x00, 0x01, 0x00, 0x00, 0x01, 0x00, 0x32];
        assert!(matches!(decode_partial(&bytes), Err(ModbusError::MalformedFrame { .. })));
    }

    #[test]
    fn test_codec_accumulates_byte_by_byte() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        let mut decoded = Vec::new();

        let mut stream = READ_REQUEST.to_vec();
        stream.extend_from_slice(&encode(2, 0x32, 0x86, &[0x03]));

        for byte in stream {
            buf.put_u8(byte);
            while let Some(frame) = codec.decode(&mut buf).unwrap() {
                decoded.push(frame);
            }
        }

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].transaction_id, 1);
        assert_eq!(decoded[1].transaction_id, 2);
        assert!(decoded[1].is_exception());
        assert_eq!(decoded[1].base_function_code(), 0x06);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_codec_encoder() {
        let mut codec = MbapCodec;
        let mut buf = BytesMut::new();
        let frame = decode(&READ_REQUEST).unwrap();
        codec.encode(frame, &mut buf).unwrap();
        assert_eq!(&buf[..], &READ_REQUEST[..]);
    }
}
