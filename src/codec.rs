//! Message codec: chunked bytes to JSON-RPC messages and back.
//!
//! Framing is structural. Each message is one JSON value and the value's own braces
//! delimit it, so no length prefix or newline is needed. The decoder keeps the bytes
//! that do not yet form a complete value and fails once they pass the configured
//! bound, whatever the chunk boundaries were.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use futures::Stream;
use tokio_util::codec::{Decoder, Encoder, FramedRead};
use tokio_util::io::StreamReader;

use crate::error::RpcError;
use crate::message::JsonRpcMessage;

/// Default bound on undecoded input: 1 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// `tokio_util` codec for [`JsonRpcMessage`].
///
/// Decode errors are terminal: once `decode` fails the channel it was reading must be
/// discarded.
#[derive(Debug, Clone)]
pub struct JsonRpcCodec {
    max_message_size: usize,
    scanner: Scanner,
}

impl JsonRpcCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            scanner: Scanner::default(),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn check_size(&self, size: usize) -> Result<(), RpcError> {
        check_size(size, self.max_message_size)
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

fn check_size(size: usize, max: usize) -> Result<(), RpcError> {
    if size > max {
        return Err(RpcError::MessageTooLarge { size, max });
    }
    Ok(())
}

/// Encoded size of `message`, refused when it is over `max`.
pub(crate) fn checked(message: JsonRpcMessage, max: usize) -> Result<JsonRpcMessage, RpcError> {
    let size = serde_json::to_vec(&message)?.len();
    check_size(size, max)?;
    Ok(message)
}

enum Scan {
    /// A whole object ends at this offset.
    Complete(usize),
    Partial,
    Blank,
    Invalid(u8),
}

/// Finds where the next top-level object ends without parsing it.
///
/// State survives between calls so bytes already looked at are never scanned again;
/// `serde_json` only sees a value once its closing brace has arrived.
#[derive(Debug, Clone, Default)]
struct Scanner {
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scanner {
    fn scan(&mut self, buf: &[u8]) -> Scan {
        while self.offset < buf.len() {
            let byte = buf[self.offset];
            self.offset += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match byte {
                b' ' | b'\t' | b'\r' | b'\n' => {}
                b'{' | b'[' if self.depth > 0 => self.depth += 1,
                b'{' => self.depth = 1,
                b'}' | b']' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return Scan::Complete(self.offset);
                    }
                }
                b'"' if self.depth > 0 => self.in_string = true,
                _ if self.depth > 0 => {}
                other => return Scan::Invalid(other),
            }
        }

        if self.depth == 0 {
            Scan::Blank
        } else {
            Scan::Partial
        }
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

impl Decoder for JsonRpcCodec {
    type Item = JsonRpcMessage;
    type Error = RpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<JsonRpcMessage>, RpcError> {
        match self.scanner.scan(src) {
            Scan::Complete(end) => {
                self.check_size(end)?;
                let message = serde_json::from_slice(&src[..end])
                    .map_err(|err| RpcError::MalformedMessage(err.to_string()))?;
                src.advance(end);
                self.scanner.reset();
                Ok(Some(message))
            }
            Scan::Partial => {
                self.check_size(src.len())?;
                Ok(None)
            }
            Scan::Blank => {
                // only whitespace left between messages
                src.clear();
                self.scanner.reset();
                Ok(None)
            }
            Scan::Invalid(byte) => Err(RpcError::MalformedMessage(format!(
                "expected a JSON object, found byte 0x{byte:02x}"
            ))),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<JsonRpcMessage>, RpcError> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() => Ok(None),
            None => Err(RpcError::MalformedMessage(format!(
                "channel closed with {} bytes of an incomplete message",
                src.len()
            ))),
        }
    }
}

impl Encoder<JsonRpcMessage> for JsonRpcCodec {
    type Error = RpcError;

    fn encode(&mut self, item: JsonRpcMessage, dst: &mut BytesMut) -> Result<(), RpcError> {
        let encoded = serde_json::to_vec(&item)?;
        self.check_size(encoded.len())?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

/// Encode one message into its canonical JSON text.
pub fn encode_message(message: &JsonRpcMessage) -> Result<Bytes, RpcError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Lazily decode a stream of byte chunks into messages.
///
/// The returned stream yields at most one error and then ends.
pub fn decode_messages<S>(
    chunks: S,
    max_message_size: usize,
) -> FramedRead<StreamReader<S, Bytes>, JsonRpcCodec>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    FramedRead::new(
        StreamReader::new(chunks),
        JsonRpcCodec::new(max_message_size),
    )
}

#[cfg(test)]
mod tests {
    use futures::{StreamExt, stream};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use serde_json::json;

    use super::*;
    use crate::message::{ErrorObject, RpcId};

    fn sample_messages() -> Vec<JsonRpcMessage> {
        vec![
            JsonRpcMessage::request(RpcId::from(1u64), "vaults.list", None),
            JsonRpcMessage::request(
                RpcId::from("b-2"),
                "keys.sign",
                Some(json!({"data": "aGVsbG8=", "nested": [1, {"x": null}]})),
            ),
            JsonRpcMessage::notification("nodes.ping", Some(json!(["a", "b"]))),
            JsonRpcMessage::result(RpcId::Null, json!("unicode \u{1F512} \"quoted\" {brace}")),
            JsonRpcMessage::error(
                RpcId::from(-9i64),
                ErrorObject::internal("boom").with_data(json!({"why": "test"})),
            ),
        ]
    }

    fn wire(messages: &[JsonRpcMessage]) -> Vec<u8> {
        messages
            .iter()
            .flat_map(|m| encode_message(m).unwrap().to_vec())
            .collect()
    }

    async fn decode_chunks(
        chunks: Vec<Vec<u8>>,
        max: usize,
    ) -> Vec<Result<JsonRpcMessage, RpcError>> {
        let chunks = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))));
        decode_messages(chunks, max).collect().await
    }

    fn split_at_offsets(bytes: &[u8], offsets: &[usize]) -> Vec<Vec<u8>> {
        let mut chunks = Vec::new();
        let mut start = 0;
        for &offset in offsets {
            chunks.push(bytes[start..offset].to_vec());
            start = offset;
        }
        chunks.push(bytes[start..].to_vec());
        chunks
    }

    #[tokio::test]
    async fn test_single_byte_chunks() {
        let text = br#"{"jsonrpc":"2.0","method":"m","id":1}"#;
        let chunks = text.iter().map(|b| vec![*b]).collect();

        let decoded = decode_chunks(chunks, DEFAULT_MAX_MESSAGE_SIZE).await;

        assert_eq!(decoded.len(), 1);
        let message = decoded.into_iter().next().unwrap().unwrap();
        assert_eq!(
            message,
            JsonRpcMessage::request(RpcId::from(1u64), "m", None)
        );
    }

    #[tokio::test]
    async fn test_roundtrip_at_every_split() {
        let messages = sample_messages();
        let bytes = wire(&messages);

        for offset in 0..=bytes.len() {
            let chunks = split_at_offsets(&bytes, &[offset]);
            let decoded: Vec<_> = decode_chunks(chunks, DEFAULT_MAX_MESSAGE_SIZE)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();
            assert_eq!(decoded, messages, "split at {offset}");
        }
    }

    #[tokio::test]
    async fn test_roundtrip_random_rechunking() {
        let messages = sample_messages();
        let bytes = wire(&messages);
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..200 {
            let cuts = rng.random_range(0..12);
            let mut offsets: Vec<usize> = (0..cuts).map(|_| rng.random_range(0..=bytes.len())).collect();
            offsets.sort_unstable();

            let decoded: Vec<_> = decode_chunks(split_at_offsets(&bytes, &offsets), 4096)
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();
            assert_eq!(decoded, messages, "offsets {offsets:?}");
        }
    }

    #[tokio::test]
    async fn test_whitespace_between_messages() {
        let a = encode_message(&JsonRpcMessage::notification("a", None)).unwrap();
        let b = encode_message(&JsonRpcMessage::notification("b", None)).unwrap();
        let mut bytes = b"\n  ".to_vec();
        bytes.extend_from_slice(&a);
        bytes.extend_from_slice(b"\r\n\t");
        bytes.extend_from_slice(&b);
        bytes.extend_from_slice(b"\n");

        let decoded = decode_chunks(vec![bytes], DEFAULT_MAX_MESSAGE_SIZE).await;
        let methods: Vec<_> = decoded
            .iter()
            .map(|m| m.as_ref().unwrap().method().unwrap().to_string())
            .collect();
        assert_eq!(methods, ["a", "b"]);
    }

    #[tokio::test]
    async fn test_size_bound_regardless_of_chunking() {
        let limit = 64;
        let big = JsonRpcMessage::request(RpcId::from(1u64), "m", Some(json!("x".repeat(200))));
        let bytes = encode_message(&big).unwrap().to_vec();
        let mut rng = StdRng::seed_from_u64(7);

        let mut chunkings = vec![
            vec![bytes.clone()],
            bytes.iter().map(|b| vec![*b]).collect::<Vec<_>>(),
        ];
        for _ in 0..20 {
            let mut offsets: Vec<usize> = (0..5).map(|_| rng.random_range(0..=bytes.len())).collect();
            offsets.sort_unstable();
            chunkings.push(split_at_offsets(&bytes, &offsets));
        }

        for chunks in chunkings {
            let decoded = decode_chunks(chunks, limit).await;
            assert_eq!(decoded.len(), 1);
            assert!(matches!(
                decoded[0],
                Err(RpcError::MessageTooLarge { max: 64, .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_message_at_limit_is_accepted() {
        let message = JsonRpcMessage::request(RpcId::from(1u64), "m", None);
        let bytes = encode_message(&message).unwrap().to_vec();
        let limit = bytes.len();

        let chunks = bytes.iter().map(|b| vec![*b]).collect();
        let decoded = decode_chunks(chunks, limit).await;
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap(), &message);
    }

    #[tokio::test]
    async fn test_noise_is_rejected_everywhere() {
        let bytes = wire(&sample_messages()[..2]);

        // control bytes are invalid inside strings as well as between tokens
        for noise in [b"\x00".as_slice(), b"\x01\x1f"] {
            for offset in 0..=bytes.len() {
                let mut noisy = bytes[..offset].to_vec();
                noisy.extend_from_slice(noise);
                noisy.extend_from_slice(&bytes[offset..]);

                let decoded = decode_chunks(vec![noisy], DEFAULT_MAX_MESSAGE_SIZE).await;
                let last = decoded.last().expect("decoder produced nothing");
                assert!(
                    matches!(last, Err(RpcError::MalformedMessage(_))),
                    "noise {noise:?} at {offset} not rejected"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_stray_bytes_between_messages() {
        let first = encode_message(&sample_messages()[0]).unwrap().to_vec();
        let bytes = wire(&sample_messages()[..2]);

        for noise in [b"#".as_slice(), b"]", b"nul", b"[1]", b"\"x\""] {
            for offset in [0, first.len(), bytes.len()] {
                let mut noisy = bytes[..offset].to_vec();
                noisy.extend_from_slice(noise);
                noisy.extend_from_slice(&bytes[offset..]);

                let decoded = decode_chunks(vec![noisy], DEFAULT_MAX_MESSAGE_SIZE).await;
                let last = decoded.last().expect("decoder produced nothing");
                assert!(
                    matches!(last, Err(RpcError::MalformedMessage(_))),
                    "noise {noise:?} at {offset} not rejected"
                );
            }
        }
    }

    #[test]
    fn test_partial_message_is_scanned_once() {
        let message = JsonRpcMessage::request(
            RpcId::from(1u64),
            "m",
            Some(json!({"blob": "y".repeat(512 * 1024), "tricky": "}{\\\"]"})),
        );
        let bytes = encode_message(&message).unwrap();
        let mut codec = JsonRpcCodec::default();
        let mut buf = BytesMut::new();

        let mut decoded = None;
        for chunk in bytes.chunks(256) {
            buf.extend_from_slice(chunk);
            if let Some(message) = codec.decode(&mut buf).unwrap() {
                decoded = Some(message);
                break;
            }
            // the next call resumes where this one stopped
            assert_eq!(codec.scanner.offset, buf.len());
        }

        assert_eq!(decoded, Some(message));
        assert!(buf.is_empty());
        assert_eq!(codec.scanner.offset, 0);
    }

    #[tokio::test]
    async fn test_no_messages_after_error() {
        let mut bytes = b"{]".to_vec();
        bytes.extend_from_slice(&encode_message(&JsonRpcMessage::notification("a", None)).unwrap());

        let decoded = decode_chunks(vec![bytes], DEFAULT_MAX_MESSAGE_SIZE).await;
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_err());
    }

    #[tokio::test]
    async fn test_truncated_input_is_malformed() {
        let decoded = decode_chunks(
            vec![br#"{"jsonrpc":"2.0","meth"#.to_vec()],
            DEFAULT_MAX_MESSAGE_SIZE,
        )
        .await;
        assert!(matches!(
            decoded.as_slice(),
            [Err(RpcError::MalformedMessage(_))]
        ));
    }

    #[tokio::test]
    async fn test_structurally_invalid_value_is_malformed() {
        let decoded = decode_chunks(
            vec![br#"{"jsonrpc":"2.0","method":"m","result":1,"id":1}"#.to_vec()],
            DEFAULT_MAX_MESSAGE_SIZE,
        )
        .await;
        assert!(matches!(
            decoded.as_slice(),
            [Err(RpcError::MalformedMessage(_))]
        ));
    }

    #[test]
    fn test_encoder_refuses_oversized_message() {
        let mut codec = JsonRpcCodec::new(16);
        let mut dst = BytesMut::new();
        let result = codec.encode(
            JsonRpcMessage::notification("a-long-method-name", None),
            &mut dst,
        );
        assert!(matches!(result, Err(RpcError::MessageTooLarge { .. })));
        assert!(dst.is_empty());
    }
}
