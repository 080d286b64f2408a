//! Framing and message codec.
//!
//! Every message is one frame: a 4-byte big-endian length prefix followed by
//! a UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Large replies may instead be sent as two frames: a `DataSizeHint`
//! message, then a raw payload frame holding the (possibly zlib-compressed)
//! JSON of the real message.

use super::messages::{Message, CAP_COMPRESSION, CAP_DATA_INFO};
use crate::config::ProtocolConfig;
use crate::{BrokerError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Payload format strings carried by `DataSizeHint`.
pub const FORMAT_JSON: &str = "json";
pub const FORMAT_ZLIB_JSON: &str = "zlib,json";

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > ProtocolConfig::MAX_MESSAGE_SIZE {
        return Err(BrokerError::protocol(format!(
            "message size {} exceeds maximum {}",
            len,
            ProtocolConfig::MAX_MESSAGE_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| BrokerError::protocol(format!("frame of {} B is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Write a frame in flushed blocks so a slow peer sees steady progress.
pub async fn write_frame_blocks<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| BrokerError::protocol(format!("frame of {} B is too large", payload.len())))?;
    writer.write_all(&len.to_be_bytes()).await?;
    for block in payload.chunks(ProtocolConfig::SEND_OPT_BLOCK_SIZE) {
        writer.write_all(block).await?;
        writer.flush().await?;
    }
    writer.flush().await?;
    Ok(())
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

pub fn decode(payload: &[u8]) -> Result<Message> {
    serde_json::from_slice(payload).map_err(|e| BrokerError::protocol(format!("undecodable message: {}", e)))
}

/// How an already-encoded message should go out.
#[derive(Debug, PartialEq)]
pub enum Outgoing {
    /// One ordinary frame.
    Plain(Vec<u8>),
    /// A `DataSizeHint` frame followed by a payload frame.
    Hinted { hint: Message, payload: Vec<u8> },
}

/// Decide how to send an encoded reply to a receiver with `recv_caps`.
///
/// Small replies and receivers without `CAP_DATA_INFO` get a plain frame.
/// Otherwise the payload is announced by a hint and compressed when the
/// receiver can inflate it and a trial block shrinks enough.
pub fn prepare_outgoing(kind: &str, encoded: Vec<u8>, recv_caps: u32) -> Result<Outgoing> {
    if recv_caps & CAP_DATA_INFO == 0 || encoded.len() < ProtocolConfig::SEND_OPT_MESSAGE_MIN {
        return Ok(Outgoing::Plain(encoded));
    }

    let mut format = FORMAT_JSON;
    let mut payload = encoded;
    if recv_caps & CAP_COMPRESSION != 0 {
        let trial_len = payload.len().min(ProtocolConfig::SEND_OPT_COMPRESS_TRIAL);
        let trial = compress(&payload[..trial_len])?;
        if (trial.len() as f64) < trial_len as f64 * ProtocolConfig::SEND_OPT_COMPRESS_MIN {
            payload = if trial_len == payload.len() {
                trial
            } else {
                compress(&payload)?
            };
            format = FORMAT_ZLIB_JSON;
        }
    }

    Ok(Outgoing::Hinted {
        hint: Message::DataSizeHint {
            data_kind: kind.to_string(),
            length: payload.len() as u64,
            format: format.to_string(),
        },
        payload,
    })
}

/// Turn a hinted payload back into the message it carries.
pub fn decode_hinted(format: &str, payload: &[u8]) -> Result<Message> {
    if format.split(',').any(|part| part == "zlib") {
        let inflated = inflate(payload, ProtocolConfig::MAX_MESSAGE_SIZE)?;
        decode(&inflated)
    } else {
        decode(payload)
    }
}

/// Inflate a zlib payload, refusing output larger than `limit` bytes.
fn inflate(payload: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut inflated = Vec::new();
    ZlibDecoder::new(payload)
        .take(limit as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| BrokerError::protocol(format!("corrupt compressed payload: {}", e)))?;
    if inflated.len() > limit {
        return Err(BrokerError::protocol(format!(
            "compressed payload inflates beyond {} B",
            limit
        )));
    }
    Ok(inflated)
}

fn compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(
        Vec::new(),
        Compression::new(ProtocolConfig::SEND_OPT_COMPRESSION_LEVEL),
    );
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{ExecResult, CAP_ALL};
    use crate::value::Value;

    #[tokio::test]
    async fn test_frame_read_write_roundtrip() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        write_frame(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_frame(&mut cursor).await.unwrap();

        assert_eq!(read_back, Some(payload.to_vec()));
    }

    #[tokio::test]
    async fn test_frame_read_empty_stream_returns_none() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let result = read_frame(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_frame_read_oversized_returns_error() {
        let huge_len: u32 = (ProtocolConfig::MAX_MESSAGE_SIZE + 1) as u32;
        let mut buf = Vec::new();
        buf.extend_from_slice(&huge_len.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let mut cursor = std::io::Cursor::new(buf);
        let result = read_frame(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_block_writer_matches_plain_frame() {
        let payload = vec![7u8; ProtocolConfig::SEND_OPT_BLOCK_SIZE * 2 + 5];
        let mut plain = Vec::new();
        let mut blocks = Vec::new();
        write_frame(&mut plain, &payload).await.unwrap();
        write_frame_blocks(&mut blocks, &payload).await.unwrap();
        assert_eq!(plain, blocks);
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = decode(b"not valid json").unwrap_err();
        assert!(matches!(err, BrokerError::Protocol { .. }));
    }

    #[test]
    fn test_small_reply_is_plain() {
        let encoded = encode(&Message::ExecResult(ExecResult::ok(Value::Int(2)))).unwrap();
        let out = prepare_outgoing("ExecResult", encoded.clone(), CAP_ALL).unwrap();
        assert_eq!(out, Outgoing::Plain(encoded));
    }

    #[test]
    fn test_large_reply_without_capability_is_plain() {
        let big = Value::Str("x".repeat(ProtocolConfig::SEND_OPT_MESSAGE_MIN * 2));
        let encoded = encode(&Message::ExecResult(ExecResult::ok(big))).unwrap();
        let out = prepare_outgoing("ExecResult", encoded, 0).unwrap();
        assert!(matches!(out, Outgoing::Plain(_)));
    }

    #[test]
    fn test_large_compressible_reply_is_hinted_and_compressed() {
        let big = Value::Str("x".repeat(ProtocolConfig::SEND_OPT_MESSAGE_MIN * 2));
        let msg = Message::ExecResult(ExecResult::ok(big));
        let encoded = encode(&msg).unwrap();
        let original_len = encoded.len();

        match prepare_outgoing("ExecResult", encoded, CAP_ALL).unwrap() {
            Outgoing::Hinted { hint, payload } => {
                match &hint {
                    Message::DataSizeHint { length, format, .. } => {
                        assert_eq!(*length as usize, payload.len());
                        assert_eq!(format, FORMAT_ZLIB_JSON);
                    }
                    other => panic!("Expected DataSizeHint, got: {:?}", other),
                }
                assert!(payload.len() < original_len);
                assert_eq!(decode_hinted(FORMAT_ZLIB_JSON, &payload).unwrap(), msg);
            }
            other => panic!("Expected hinted reply, got: {:?}", other),
        }
    }

    #[test]
    fn test_large_reply_without_compression_keeps_json() {
        let big = Value::Str("x".repeat(ProtocolConfig::SEND_OPT_MESSAGE_MIN * 2));
        let encoded = encode(&Message::ExecResult(ExecResult::ok(big))).unwrap();
        match prepare_outgoing("ExecResult", encoded.clone(), CAP_DATA_INFO).unwrap() {
            Outgoing::Hinted { hint, payload } => {
                assert_eq!(payload, encoded);
                assert!(matches!(hint, Message::DataSizeHint { ref format, .. } if format == FORMAT_JSON));
            }
            other => panic!("Expected hinted reply, got: {:?}", other),
        }
    }

    #[test]
    fn test_inflate_stops_at_limit() {
        let bomb = compress(&vec![0u8; 64 * 1024]).unwrap();
        assert!(bomb.len() < 1024);

        let err = inflate(&bomb, 4096).unwrap_err();
        assert!(matches!(err, BrokerError::Protocol { ref message } if message.contains("beyond 4096")));
        assert_eq!(inflate(&bomb, 64 * 1024).unwrap().len(), 64 * 1024);

        let err = decode_hinted(FORMAT_ZLIB_JSON, b"\x78\x9cgarbage").unwrap_err();
        assert!(matches!(err, BrokerError::Protocol { .. }));
    }
}
