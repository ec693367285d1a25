use std::{io, option};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, Chain, Iter};
use futures::{Stream, StreamExt};
use tokio_util::codec::Decoder;

use crate::codec::JsonRpcCodec;
use crate::error::RpcError;
use crate::message::JsonRpcMessage;

/// The bytes left on a channel after its first message.
///
/// Yields whatever was read past the head in the same chunk, then the rest of the
/// source stream untouched.
pub type Remainder<S> = Chain<Iter<option::IntoIter<io::Result<Bytes>>>, S>;

/// Read the first message off a raw byte stream.
///
/// Only as many chunks as needed are pulled. Nothing after the head is decoded, so the
/// remainder can be handed to a consumer that does not speak JSON at all.
pub async fn extract_head<S>(
    mut chunks: S,
    codec: &mut JsonRpcCodec,
) -> Result<(JsonRpcMessage, Remainder<S>), RpcError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let mut buf = BytesMut::new();
    loop {
        if let Some(head) = codec.decode(&mut buf)? {
            return Ok((head, with_leftover(buf, chunks)));
        }
        match chunks.next().await {
            Some(chunk) => buf.extend_from_slice(&chunk?),
            None => {
                return match codec.decode_eof(&mut buf)? {
                    Some(head) => Ok((head, with_leftover(buf, chunks))),
                    None => Err(RpcError::ConnectionClosed),
                };
            }
        }
    }
}

fn with_leftover<S>(buf: BytesMut, chunks: S) -> Remainder<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let leftover = (!buf.is_empty()).then(|| Ok(buf.freeze()));
    stream::iter(leftover).chain(chunks)
}
