//! Framed codec for the worker channel.
//!
//! LengthDelimitedCodec for framing, serde_json for the message bodies.
//! Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames messages with a 4-byte length prefix and serializes
/// the body with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::{DoneEvent, LogSource, WorkerEvent, WorkerRequest};

    #[test]
    fn roundtrip_request() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();

        let req = WorkerRequest::PredictionInput {
            id: "p1".to_string(),
            payload: serde_json::json!({"x": 1}),
        };
        codec.encode(req, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        match decoded {
            WorkerRequest::PredictionInput { id, payload } => {
                assert_eq!(id, "p1");
                assert_eq!(payload, serde_json::json!({"x": 1}));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn roundtrip_event() {
        let mut codec = JsonCodec::<WorkerEvent>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(
                WorkerEvent::Log {
                    source: LogSource::Stdout,
                    message: "working\n".to_string(),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(WorkerEvent::Done(DoneEvent::ok()), &mut buf)
            .unwrap();

        // Frames decode independently and in order.
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            WorkerEvent::Log { .. }
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap().unwrap(),
            WorkerEvent::Done(done) if done == DoneEvent::ok()
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_data() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();
        codec.encode(WorkerRequest::Shutdown, &mut buf).unwrap();

        let full = buf.clone();
        let mut partial = BytesMut::from(&full[..full.len() - 2]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 2..]);
        assert!(matches!(
            codec.decode(&mut partial).unwrap().unwrap(),
            WorkerRequest::Shutdown
        ));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut codec = JsonCodec::<WorkerRequest>::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"notjs");

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
