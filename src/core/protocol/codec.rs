// src/core/protocol/codec.rs

//! Length-prefixed bincode framing for the private supervisor RPC protocol.
//!
//! Each frame is a 4-byte big-endian body length followed by the bincode
//! encoding of the message. The client side encodes [`RpcRequest`] and
//! decodes [`RpcResponse`]; the server side is the mirror image.

use super::{RpcRequest, RpcResponse};
use crate::core::errors::KeeperError;
use bincode::config;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame. A member map or node list is tiny; this
/// exists so a corrupt length prefix cannot trigger an unbounded allocation.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

fn encode_frame<T: bincode::Encode>(item: T, dst: &mut BytesMut) -> Result<(), KeeperError> {
    let body = bincode::encode_to_vec(item, config::standard())
        .map_err(|e| KeeperError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(KeeperError::Codec(format!(
            "frame of {} bytes exceeds maximum of {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    dst.reserve(4 + body.len());
    dst.put_u32(body.len() as u32);
    dst.extend_from_slice(&body);
    Ok(())
}

fn decode_frame<T: bincode::Decode<()>>(src: &mut BytesMut) -> Result<Option<T>, KeeperError> {
    if src.len() < 4 {
        return Ok(None);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&src[..4]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(KeeperError::Codec(format!(
            "frame length {len} exceeds maximum of {MAX_FRAME_SIZE}"
        )));
    }
    if src.len() < 4 + len {
        src.reserve(4 + len - src.len());
        return Ok(None);
    }
    src.advance(4);
    let body = src.split_to(len);
    let (value, _) = bincode::decode_from_slice(&body, config::standard())
        .map_err(|e| KeeperError::Codec(e.to_string()))?;
    Ok(Some(value))
}

/// Codec for the initiating side of a connection.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Encoder<RpcRequest> for ClientCodec {
    type Error = KeeperError;

    fn encode(&mut self, item: RpcRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst)
    }
}

impl Decoder for ClientCodec {
    type Item = RpcResponse;
    type Error = KeeperError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}

/// Codec for the accepting side of a connection.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Encoder<RpcResponse> for ServerCodec {
    type Error = KeeperError;

    fn encode(&mut self, item: RpcResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_frame(item, dst)
    }
}

impl Decoder for ServerCodec {
    type Item = RpcRequest;
    type Error = KeeperError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_frame(src)
    }
}
