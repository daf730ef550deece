//! ACIP wire codec: framing, checksums, and frame compression.
//!
//! The codec is semantics-free. It moves `(type, payload bytes, source id)`
//! triples across an ordered byte stream and never interprets payloads;
//! the typed layer lives in [`crate::packet`].

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// =============================================================================
// WIRE CONSTANTS
// =============================================================================

/// Magic prefix of every ACIP packet. Rejecting on mismatch keeps port
/// scanners and cross-protocol traffic out before any allocation happens.
pub const PACKET_MAGIC: u64 = 0xA_5C11_C4A1;

/// Fixed header size: magic(8) + type(2) + length(4) + crc32c(4) + source(4).
pub const HEADER_SIZE: usize = 22;

/// Hard payload cap on stream transports (5 MiB).
/// A raw 1080p RGB frame is ~6 MB; anything that large must be compressed
/// before it reaches the codec, so 5 MiB bounds per-connection buffers.
pub const MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;

/// Payload cap on datachannel transports (16 KiB). Datagram-backed streams
/// fragment poorly beyond this; large frames are compressed to fit.
pub const MAX_DATACHANNEL_PAYLOAD: usize = 16 * 1024;

/// Compression threshold for image frames. At or below this size the
/// zstd header overhead is not worth paying.
pub const COMPRESSION_THRESHOLD: usize = 16 * 1024;

/// Inline compression flags, first payload byte of an `IMAGE_FRAME`.
pub const COMPRESS_NONE: u8 = 0;
pub const COMPRESS_ZSTD: u8 = 1;
pub const COMPRESS_RLE_ZSTD: u8 = 2;

/// zstd level 3: the speed/ratio knee for per-frame compression.
const ZSTD_LEVEL: i32 = 3;

/// First u16 of the extension type range. Types here decode as opaque
/// payloads instead of erroring, so older nodes survive newer peers.
pub const EXTENSION_RANGE_START: u16 = 0xF000;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad packet magic: {0:#x}")]
    BadMagic(u64),

    #[error("payload length {got} exceeds cap {cap}")]
    LengthOverflow { got: usize, cap: usize },

    #[error("payload checksum mismatch: header {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("unknown packet type {0}")]
    UnknownType(u16),

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame decompression failed: {0}")]
    Decompress(String),

    #[error("payload decode failed: {0}")]
    Payload(String),
}

// =============================================================================
// RAW FRAME
// =============================================================================

/// A decoded but uninterpreted packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub packet_type: u16,
    pub payload: Vec<u8>,
    pub source_id: u32,
}

/// Encode a packet: 22-byte header followed by the payload verbatim.
/// CRC32C covers the payload only; the header is protected by the magic
/// and length checks on the far side.
pub fn encode_packet(packet_type: u16, payload: &[u8], source_id: u32) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(CodecError::LengthOverflow {
            got: payload.len(),
            cap: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&PACKET_MAGIC.to_be_bytes());
    buf.extend_from_slice(&packet_type.to_be_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c::crc32c(payload).to_be_bytes());
    buf.extend_from_slice(&source_id.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Parsed header, before the payload has been read or verified.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub packet_type: u16,
    pub length: usize,
    pub crc32c: u32,
    pub source_id: u32,
}

/// Decode the fixed header and enforce magic and length bounds.
/// `cap` is the transport's payload limit.
pub fn decode_header(bytes: &[u8; HEADER_SIZE], cap: usize) -> Result<Header, CodecError> {
    let magic = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    if magic != PACKET_MAGIC {
        return Err(CodecError::BadMagic(magic));
    }
    let packet_type = u16::from_be_bytes(bytes[8..10].try_into().unwrap());
    let length = u32::from_be_bytes(bytes[10..14].try_into().unwrap()) as usize;
    if length > cap {
        return Err(CodecError::LengthOverflow { got: length, cap });
    }
    let crc = u32::from_be_bytes(bytes[14..18].try_into().unwrap());
    let source_id = u32::from_be_bytes(bytes[18..22].try_into().unwrap());
    Ok(Header {
        packet_type,
        length,
        crc32c: crc,
        source_id,
    })
}

/// Decode a complete packet from a contiguous buffer.
pub fn decode_packet(buf: &[u8], cap: usize) -> Result<RawPacket, CodecError> {
    if buf.len() < HEADER_SIZE {
        return Err(CodecError::UnexpectedEof);
    }
    let header_bytes: &[u8; HEADER_SIZE] = buf[..HEADER_SIZE].try_into().unwrap();
    let header = decode_header(header_bytes, cap)?;
    let body = &buf[HEADER_SIZE..];
    if body.len() < header.length {
        return Err(CodecError::UnexpectedEof);
    }
    let payload = body[..header.length].to_vec();
    verify_checksum(&header, &payload)?;
    Ok(RawPacket {
        packet_type: header.packet_type,
        payload,
        source_id: header.source_id,
    })
}

fn verify_checksum(header: &Header, payload: &[u8]) -> Result<(), CodecError> {
    let computed = crc32c::crc32c(payload);
    if computed != header.crc32c {
        return Err(CodecError::ChecksumMismatch {
            expected: header.crc32c,
            computed,
        });
    }
    Ok(())
}

/// Read one packet from an async stream. `cap` is the transport's payload
/// limit (stream vs datachannel).
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, cap: usize) -> Result<RawPacket, CodecError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header_bytes)
        .await
        .map_err(map_eof)?;
    let header = decode_header(&header_bytes, cap)?;

    let mut payload = vec![0u8; header.length];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;
    verify_checksum(&header, &payload)?;

    Ok(RawPacket {
        packet_type: header.packet_type,
        payload,
        source_id: header.source_id,
    })
}

/// Write one packet to an async stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    writer: &mut W,
    packet_type: u16,
    payload: &[u8],
    source_id: u32,
) -> Result<(), CodecError> {
    let bytes = encode_packet(packet_type, payload, source_id)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> CodecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        CodecError::UnexpectedEof
    } else {
        CodecError::Io(e)
    }
}

// =============================================================================
// IMAGE FRAME COMPRESSION
// =============================================================================

/// Compress an image-frame body for the wire. Bodies above the threshold
/// are zstd-compressed, with an RLE pre-pass when the frame has long runs
/// of identical pixels (common for mostly-static terminal scenes).
pub fn compress_frame_body(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    if body.len() <= COMPRESSION_THRESHOLD {
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(COMPRESS_NONE);
        out.extend_from_slice(body);
        return Ok(out);
    }

    let rle = rle_encode_rgb(body);
    let (flag, pre) = if rle.len() * 4 < body.len() * 3 {
        (COMPRESS_RLE_ZSTD, rle)
    } else {
        (COMPRESS_ZSTD, body.to_vec())
    };

    let compressed = zstd::stream::encode_all(&pre[..], ZSTD_LEVEL)?;
    let mut out = Vec::with_capacity(1 + compressed.len());
    out.push(flag);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Reverse of [`compress_frame_body`]. Output is capped at the stream
/// payload limit regardless of what the compressed header claims.
pub fn decompress_frame_body(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (&flag, rest) = data
        .split_first()
        .ok_or_else(|| CodecError::Decompress("empty frame body".into()))?;

    match flag {
        COMPRESS_NONE => Ok(rest.to_vec()),
        COMPRESS_ZSTD => {
            zstd::bulk::decompress(rest, MAX_PAYLOAD_SIZE).map_err(|e| CodecError::Decompress(e.to_string()))
        }
        COMPRESS_RLE_ZSTD => {
            let rle =
                zstd::bulk::decompress(rest, MAX_PAYLOAD_SIZE).map_err(|e| CodecError::Decompress(e.to_string()))?;
            rle_decode_rgb(&rle)
        }
        other => Err(CodecError::Decompress(format!("unknown compression flag {other}"))),
    }
}

/// Run-length encode RGB24 pixels: `[run_len u8][r][g][b]` tuples.
fn rle_encode_rgb(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() / 2);
    let mut pixels = body.chunks_exact(3);
    let Some(first) = pixels.next() else {
        return out;
    };

    let mut run: [u8; 3] = first.try_into().unwrap();
    let mut count: u8 = 1;
    for px in pixels {
        if px == run && count < u8::MAX {
            count += 1;
        } else {
            out.push(count);
            out.extend_from_slice(&run);
            run = px.try_into().unwrap();
            count = 1;
        }
    }
    out.push(count);
    out.extend_from_slice(&run);
    // Trailing bytes that don't form a pixel are carried verbatim with a
    // zero-run marker so decode can restore them.
    let tail = body.len() - body.len() % 3;
    if tail < body.len() {
        out.push(0);
        out.extend_from_slice(&body[tail..]);
    }
    out
}

fn rle_decode_rgb(rle: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(rle.len() * 2);
    let mut i = 0;
    while i < rle.len() {
        let count = rle[i];
        if count == 0 {
            // Zero-run marker: the remainder is a verbatim tail.
            out.extend_from_slice(&rle[i + 1..]);
            break;
        }
        let px = rle
            .get(i + 1..i + 4)
            .ok_or_else(|| CodecError::Decompress("truncated RLE run".into()))?;
        for _ in 0..count {
            out.extend_from_slice(px);
        }
        if out.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::Decompress("RLE output exceeds payload cap".into()));
        }
        i += 4;
    }
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let payload = b"the quick brown fox".to_vec();
        let bytes = encode_packet(3000, &payload, 7).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + payload.len());

        let packet = decode_packet(&bytes, MAX_PAYLOAD_SIZE).unwrap();
        assert_eq!(packet.packet_type, 3000);
        assert_eq!(packet.payload, payload);
        assert_eq!(packet.source_id, 7);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = encode_packet(1, b"x", 0).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            decode_packet(&bytes, MAX_PAYLOAD_SIZE),
            Err(CodecError::BadMagic(_))
        ));
    }

    #[test]
    fn single_bit_flip_fails_checksum() {
        let mut bytes = encode_packet(3000, b"payload under test", 1).unwrap();
        let flip_at = HEADER_SIZE + 4;
        bytes[flip_at] ^= 0x01;
        assert!(matches!(
            decode_packet(&bytes, MAX_PAYLOAD_SIZE),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn length_cap_enforced_per_transport() {
        let payload = vec![0u8; MAX_DATACHANNEL_PAYLOAD + 1];
        let bytes = encode_packet(3001, &payload, 1).unwrap();
        // Fine on a stream transport, rejected on a datachannel.
        assert!(decode_packet(&bytes, MAX_PAYLOAD_SIZE).is_ok());
        assert!(matches!(
            decode_packet(&bytes, MAX_DATACHANNEL_PAYLOAD),
            Err(CodecError::LengthOverflow { .. })
        ));
    }

    #[test]
    fn truncated_buffer_is_eof() {
        let bytes = encode_packet(1, b"hello", 0).unwrap();
        assert!(matches!(
            decode_packet(&bytes[..HEADER_SIZE + 2], MAX_PAYLOAD_SIZE),
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn async_roundtrip() {
        let bytes = encode_packet(5001, b"ping", 42).unwrap();
        let mut reader = std::io::Cursor::new(bytes);
        let packet = read_packet(&mut reader, MAX_PAYLOAD_SIZE).await.unwrap();
        assert_eq!(packet.packet_type, 5001);
        assert_eq!(packet.payload, b"ping");
        assert_eq!(packet.source_id, 42);
    }

    #[test]
    fn small_frames_stay_uncompressed() {
        let body = vec![1u8; 64];
        let wire = compress_frame_body(&body).unwrap();
        assert_eq!(wire[0], COMPRESS_NONE);
        assert_eq!(decompress_frame_body(&wire).unwrap(), body);
    }

    #[test]
    fn large_uniform_frame_compresses_via_rle() {
        // 32 KiB of a single color: RLE collapses it, zstd finishes the job.
        let body = vec![0x7Fu8; 32 * 1024 * 3];
        let wire = compress_frame_body(&body).unwrap();
        assert_eq!(wire[0], COMPRESS_RLE_ZSTD);
        assert!(wire.len() < body.len() / 10);
        assert_eq!(decompress_frame_body(&wire).unwrap(), body);
    }

    #[test]
    fn noisy_frame_compresses_without_rle() {
        let mut body = Vec::with_capacity(48 * 1024);
        let mut x: u32 = 0x12345678;
        while body.len() < 48 * 1024 {
            // xorshift noise defeats the RLE pre-pass
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;
            body.extend_from_slice(&x.to_be_bytes());
        }
        let wire = compress_frame_body(&body).unwrap();
        assert_eq!(wire[0], COMPRESS_ZSTD);
        assert_eq!(decompress_frame_body(&wire).unwrap(), body);
    }

    #[test]
    fn rle_handles_ragged_tail() {
        let mut body = vec![9u8; 300];
        body.push(1);
        body.push(2);
        let rle = rle_encode_rgb(&body);
        assert_eq!(rle_decode_rgb(&rle).unwrap(), body);
    }
}
