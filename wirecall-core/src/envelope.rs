//! Streaming envelope framing.
//!
//! Streaming RPCs wrap every message in an envelope:
//!
//! ```text
//! [flags:1][length:4 BE][payload:length]
//! ```
//!
//! This module provides constants and functions for packing and unpacking
//! envelopes, including threshold-based compression of the payload.

use bytes::{Bytes, BytesMut};

use crate::compression::BoxedPool;
use crate::error::RpcError;

/// Streaming envelope flags.
pub mod envelope_flags {
    /// Regular message (uncompressed).
    pub const MESSAGE: u8 = 0x00;
    /// Compressed message.
    pub const COMPRESSED: u8 = 0x01;
    /// End of stream.
    pub const END_STREAM: u8 = 0x02;
}

/// Envelope header size (flags + length).
pub const ENVELOPE_HEADER_SIZE: usize = 5;

// Bits that may legally appear in the flags byte.
const KNOWN_FLAGS: u8 = envelope_flags::COMPRESSED | envelope_flags::END_STREAM;

/// Wrap a payload in an envelope.
///
/// # Arguments
/// - `payload`: The message bytes to wrap
/// - `flags`: The envelope flags byte
pub fn wrap_envelope(payload: &[u8], flags: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    frame.extend_from_slice(&[flags]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame.freeze()
}

/// Parse an envelope header from bytes.
///
/// Returns `(flags, length)` if successful.
///
/// # Errors
/// Returns an error if there aren't enough bytes for the header.
pub fn parse_envelope_header(data: &[u8]) -> Result<(u8, u32), RpcError> {
    if data.len() < ENVELOPE_HEADER_SIZE {
        return Err(RpcError::Protocol(format!(
            "incomplete envelope header: expected {} bytes, got {}",
            ENVELOPE_HEADER_SIZE,
            data.len()
        )));
    }

    let flags = data[0];
    let length = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);

    Ok((flags, length))
}

/// Pack a message payload into an envelope, compressing it when it qualifies.
///
/// The payload is compressed with `pool` only when a pool is given and the
/// payload is larger than `min_bytes`; otherwise it is sent as-is with the
/// plain message flag.
pub fn pack_message(
    payload: Bytes,
    pool: Option<&BoxedPool>,
    min_bytes: usize,
) -> Result<Bytes, RpcError> {
    match pool {
        Some(pool) if payload.len() > min_bytes => {
            let compressed = pool
                .compress(&payload)
                .map_err(|e| RpcError::Encode(format!("compression failed: {e}")))?;
            Ok(wrap_envelope(&compressed, envelope_flags::COMPRESSED))
        }
        _ => Ok(wrap_envelope(&payload, envelope_flags::MESSAGE)),
    }
}

/// Unpack a complete envelope into `(flags, payload)`, decompressing the
/// payload when the compressed flag is set.
///
/// # Errors
/// - The frame is shorter than its declared length
/// - The flags byte contains unknown bits
/// - The compressed flag is set but no pool is available, or decompression fails
pub fn unpack_message(frame: Bytes, pool: Option<&BoxedPool>) -> Result<(u8, Bytes), RpcError> {
    let (flags, length) = parse_envelope_header(&frame)?;
    if frame.len() < ENVELOPE_HEADER_SIZE + length as usize {
        return Err(RpcError::Protocol(format!(
            "incomplete envelope: declared {} payload bytes, got {}",
            length,
            frame.len() - ENVELOPE_HEADER_SIZE
        )));
    }
    if flags & !KNOWN_FLAGS != 0 {
        return Err(RpcError::Protocol(format!(
            "invalid envelope flags: 0x{:02x}",
            flags
        )));
    }

    let payload = frame.slice(ENVELOPE_HEADER_SIZE..ENVELOPE_HEADER_SIZE + length as usize);
    if flags & envelope_flags::COMPRESSED == 0 {
        return Ok((flags, payload));
    }

    let Some(pool) = pool else {
        return Err(RpcError::Protocol(
            "received compressed envelope but no compression pool is configured".into(),
        ));
    };
    let decompressed = pool
        .decompress(&payload)
        .map_err(|e| RpcError::Decode(format!("decompression failed: {e}")))?;
    Ok((flags, decompressed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::GzipPool;

    #[test]
    fn test_wrap_envelope_message() {
        let frame = wrap_envelope(b"hello", envelope_flags::MESSAGE);

        assert_eq!(frame[0], envelope_flags::MESSAGE);
        assert_eq!(
            u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]),
            5
        );
        assert_eq!(&frame[5..], b"hello");
    }

    #[test]
    fn test_parse_envelope_header() {
        let data = [0x00, 0x00, 0x00, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
        let (flags, length) = parse_envelope_header(&data).unwrap();

        assert_eq!(flags, envelope_flags::MESSAGE);
        assert_eq!(length, 5);
    }

    #[test]
    fn test_parse_envelope_header_incomplete() {
        let data = [0x00, 0x00, 0x00]; // only 3 bytes
        assert!(parse_envelope_header(&data).is_err());
    }

    #[test]
    fn test_pack_message_below_threshold_is_identity() {
        let pool = BoxedPool::new(GzipPool::default());
        let payload = Bytes::from_static(b"tiny");

        let frame = pack_message(payload.clone(), Some(&pool), 100).unwrap();
        assert_eq!(frame[0], envelope_flags::MESSAGE);
        assert_eq!(&frame[5..], &payload[..]);
    }

    #[test]
    fn test_pack_message_at_threshold_is_identity() {
        // The boundary payload (len == min_bytes) is not compressed.
        let pool = BoxedPool::new(GzipPool::default());
        let payload = Bytes::from(vec![b'a'; 64]);

        let frame = pack_message(payload.clone(), Some(&pool), 64).unwrap();
        assert_eq!(frame[0], envelope_flags::MESSAGE);
    }

    #[test]
    fn test_pack_message_above_threshold_is_compressed() {
        let pool = BoxedPool::new(GzipPool::default());
        let payload = Bytes::from(vec![b'a'; 65]);

        let frame = pack_message(payload.clone(), Some(&pool), 64).unwrap();
        assert_eq!(frame[0], envelope_flags::COMPRESSED);

        let (flags, unpacked) = unpack_message(frame, Some(&pool)).unwrap();
        assert_eq!(flags, envelope_flags::COMPRESSED);
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn test_pack_message_no_pool() {
        let payload = Bytes::from(vec![b'a'; 1000]);
        let frame = pack_message(payload.clone(), None, 0).unwrap();
        assert_eq!(frame[0], envelope_flags::MESSAGE);
    }

    #[test]
    fn test_unpack_message_round_trip() {
        let frame = wrap_envelope(b"hello", envelope_flags::MESSAGE);
        let (flags, payload) = unpack_message(frame, None).unwrap();

        assert_eq!(flags, envelope_flags::MESSAGE);
        assert_eq!(&payload[..], b"hello");
    }

    #[test]
    fn test_unpack_message_end_stream() {
        let frame = wrap_envelope(b"{}", envelope_flags::END_STREAM);
        let (flags, payload) = unpack_message(frame, None).unwrap();

        assert_eq!(flags, envelope_flags::END_STREAM);
        assert_eq!(&payload[..], b"{}");
    }

    #[test]
    fn test_unpack_message_invalid_flags() {
        let frame = wrap_envelope(b"hello", 0xFF);
        assert!(unpack_message(frame, None).is_err());
    }

    #[test]
    fn test_unpack_message_compressed_without_pool() {
        let pool = BoxedPool::new(GzipPool::default());
        let compressed = pool.compress(b"hello").unwrap();
        let frame = wrap_envelope(&compressed, envelope_flags::COMPRESSED);

        assert!(unpack_message(frame, None).is_err());
    }

    #[test]
    fn test_unpack_message_truncated_payload() {
        let mut frame = BytesMut::new();
        frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x10]); // declares 16 bytes
        frame.extend_from_slice(b"short");
        assert!(unpack_message(frame.freeze(), None).is_err());
    }
}
