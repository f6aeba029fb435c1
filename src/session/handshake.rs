//! Outer-message encode/decode helpers and the inner substream protocol
//! carried once a session reaches `established`.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::LengthPrefixed;
use crate::proto::peer::{
    outer_message, Bye, ConnectRequest, ConnectResponse, ConnectStatus, Data, EncryptedData,
    OuterMessage,
};
use crate::proto::peer::{inner_message, CloseSub, DataSub, InnerMessage, Open};

/// Encode an `OuterMessage` variant with the shared length-prefixed framing.
pub fn encode_outer(payload: outer_message::Payload) -> Vec<u8> {
    let msg = OuterMessage {
        payload: Some(payload),
    };
    let mut buf = BytesMut::new();
    LengthPrefixed::<OuterMessage>::default()
        .encode(msg, &mut buf)
        .expect("outer message always fits within the frame bound");
    buf.to_vec()
}

pub fn connect_request(connection_name: &str, identity: [u8; 32], public_key: [u8; 32], signature: [u8; 64]) -> Vec<u8> {
    encode_outer(outer_message::Payload::ConnectRequest(ConnectRequest {
        connection_name: connection_name.to_string(),
        identity: identity.to_vec(),
        public_key: public_key.to_vec(),
        signature: signature.to_vec(),
    }))
}

pub fn connect_response(accepted: bool) -> Vec<u8> {
    let status = if accepted {
        ConnectStatus::Accepted
    } else {
        ConnectStatus::Rejected
    };
    encode_outer(outer_message::Payload::ConnectResponse(ConnectResponse {
        status: status as i32,
    }))
}

pub fn bye() -> Vec<u8> {
    encode_outer(outer_message::Payload::Bye(Bye {}))
}

pub fn plaintext_data(inner: Vec<u8>) -> Vec<u8> {
    encode_outer(outer_message::Payload::Data(Data { inner }))
}

pub fn encrypted_data(nonce: [u8; 12], payload: Vec<u8>) -> Vec<u8> {
    encode_outer(outer_message::Payload::EncryptedData(EncryptedData {
        nonce: nonce.to_vec(),
        payload,
    }))
}

/// Try to decode one complete `OuterMessage` out of `buf`, leaving any
/// trailing partial frame for the next call.
pub fn try_decode_outer(buf: &mut BytesMut) -> std::io::Result<Option<OuterMessage>> {
    LengthPrefixed::<OuterMessage>::default().decode(buf)
}

fn encode_inner(payload: inner_message::Payload) -> Vec<u8> {
    let msg = InnerMessage {
        payload: Some(payload),
    };
    let mut buf = BytesMut::new();
    LengthPrefixed::<InnerMessage>::default()
        .encode(msg, &mut buf)
        .expect("inner message always fits within the frame bound");
    buf.to_vec()
}

pub fn open_substream(id: u32) -> Vec<u8> {
    encode_inner(inner_message::Payload::Open(Open { id }))
}

pub fn data_substream(id: u32, bytes: Vec<u8>) -> Vec<u8> {
    encode_inner(inner_message::Payload::Data(DataSub { id, bytes }))
}

pub fn close_substream(id: u32) -> Vec<u8> {
    encode_inner(inner_message::Payload::Close(CloseSub { id }))
}

pub fn try_decode_inner(buf: &mut BytesMut) -> std::io::Result<Option<InnerMessage>> {
    LengthPrefixed::<InnerMessage>::default().decode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_request_roundtrips() {
        let mut buf = BytesMut::from(
            &connect_request("alice", [1u8; 32], [2u8; 32], [3u8; 64])[..],
        );
        let decoded = try_decode_outer(&mut buf).unwrap().unwrap();
        match decoded.payload {
            Some(outer_message::Payload::ConnectRequest(req)) => {
                assert_eq!(req.connection_name, "alice");
                assert_eq!(req.identity, vec![1u8; 32]);
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn inner_open_roundtrips() {
        let mut buf = BytesMut::from(&open_substream(7)[..]);
        let decoded = try_decode_inner(&mut buf).unwrap().unwrap();
        match decoded.payload {
            Some(inner_message::Payload::Open(open)) => assert_eq!(open.id, 7),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn partial_outer_frame_yields_none() {
        let full = connect_response(true);
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(try_decode_outer(&mut partial).unwrap().is_none());
    }
}
