//! Length-prefixed framing shared by the tracker, peer, and local control
//! wire dialects: a 4-byte big-endian length followed by that many bytes of
//! protobuf-encoded message. One codec, reused three times, rather than a
//! separate framing implementation per socket kind.

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder};

/// Frames larger than this are rejected outright; it bounds how much a
/// misbehaving or malicious peer can make us buffer before we've even
/// started parsing.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A `tokio_util` codec pair for any prost message type `M`, applying the
/// 4-byte-big-endian-length-prefix framing common to all three dialects.
pub struct LengthPrefixed<M> {
    _marker: PhantomData<M>,
}

impl<M> Default for LengthPrefixed<M> {
    fn default() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<M> Clone for LengthPrefixed<M> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<M: Message + Default> Decoder for LengthPrefixed<M> {
    type Item = M;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<M>, io::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds maximum of {MAX_FRAME_LEN}"),
            ));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(len);
        let message = M::decode(frame.freeze())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(message))
    }
}

impl<M: Message> Encoder<M> for LengthPrefixed<M> {
    type Error = io::Error;

    fn encode(&mut self, item: M, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = item.encoded_len();
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("refusing to encode frame of {len} bytes"),
            ));
        }
        dst.reserve(4 + len);
        dst.put_u32(len as u32);
        item.encode(dst)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::control::{ClientMessage, RequestKind};

    #[test]
    fn round_trips_a_message() {
        let mut codec = LengthPrefixed::<ClientMessage>::default();
        let msg = ClientMessage {
            message_id: "abc".into(),
            kind: RequestKind::Status as i32,
            tracker: "t1".into(),
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        // length prefix precedes the encoded body
        assert_eq!(
            u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize,
            buf.len() - 4
        );

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn waits_for_a_full_frame() {
        let mut codec = LengthPrefixed::<ClientMessage>::default();
        let msg = ClientMessage {
            message_id: "xyz".into(),
            kind: RequestKind::Init as i32,
            ..Default::default()
        };
        let mut full = BytesMut::new();
        codec.encode(msg, &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_oversized_frames() {
        let mut codec = LengthPrefixed::<ClientMessage>::default();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }
}
