// SPDX-License-Identifier: Apache-2.0

//! Correlated message packets.
//!
//! A packet is encoded in two layers: the outer frame carries the
//! correlation key and the payload as opaque bytes. A payload that cannot be
//! decoded is replaced by a failure payload so the reply still reaches the
//! caller waiting on that key.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use tessera_core::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload<T> {
    Content(T),
    Failure(EngineError),
}

impl<T> Payload<T> {
    pub fn into_result(self) -> EngineResult<T> {
        match self {
            Payload::Content(value) => Ok(value),
            Payload::Failure(error) => Err(error),
        }
    }
}

impl<T> From<EngineResult<T>> for Payload<T> {
    fn from(result: EngineResult<T>) -> Self {
        match result {
            Ok(value) => Payload::Content(value),
            Err(error) => Payload::Failure(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessagePacket<K, T> {
    pub key: K,
    pub payload: Payload<T>,
}

#[derive(Serialize, Deserialize)]
struct Frame<K> {
    key: K,
    payload: Vec<u8>,
}

impl<K, T> MessagePacket<K, T>
where
    K: Serialize + DeserializeOwned,
    T: Serialize + DeserializeOwned,
{
    pub fn content(key: K, value: T) -> Self {
        Self {
            key,
            payload: Payload::Content(value),
        }
    }

    pub fn failure(key: K, error: EngineError) -> Self {
        Self {
            key,
            payload: Payload::Failure(error),
        }
    }

    pub fn encode(&self) -> EngineResult<Bytes> {
        let payload = rmp_serde::to_vec_named(&self.payload)
            .map_err(|e| EngineError::internal(format!("encode payload failed: {e}")))?;
        let frame = Frame {
            key: &self.key,
            payload,
        };
        rmp_serde::to_vec_named(&frame)
            .map(Bytes::from)
            .map_err(|e| EngineError::internal(format!("encode packet failed: {e}")))
    }

    /// Fails only when the frame or its key is unreadable; a bad payload
    /// becomes `Payload::Failure` under the original key.
    pub fn decode(bytes: &[u8]) -> EngineResult<Self> {
        let frame: Frame<K> = rmp_serde::from_slice(bytes)
            .map_err(|e| EngineError::malformed(format!("unreadable packet frame: {e}")))?;
        let payload = match rmp_serde::from_slice::<Payload<T>>(&frame.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Packet payload could not be decoded");
                Payload::Failure(EngineError::malformed(format!("unreadable payload: {e}")))
            }
        };
        Ok(Self {
            key: frame.key,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_content_and_failures() {
        let packet = MessagePacket::content(7u64, "hello".to_string());
        let decoded = MessagePacket::<u64, String>::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded, packet);

        let failure: MessagePacket<u64, String> =
            MessagePacket::failure(8, EngineError::visibility_denied("modelB.t2"));
        let decoded = MessagePacket::<u64, String>::decode(&failure.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload.into_result(), Err(EngineError::visibility_denied("modelB.t2")));
    }

    #[test]
    fn undecodable_payload_keeps_the_key() {
        let sent = MessagePacket::content(42u64, "not a number".to_string());
        let received = MessagePacket::<u64, u32>::decode(&sent.encode().unwrap()).unwrap();
        assert_eq!(received.key, 42);
        assert!(matches!(
            received.payload,
            Payload::Failure(EngineError::MalformedEnvelope { .. })
        ));

        let garbage = rmp_serde::to_vec_named(&Frame {
            key: 9u64,
            payload: vec![0xc1, 0xff, 0x00],
        })
        .unwrap();
        let received = MessagePacket::<u64, String>::decode(&garbage).unwrap();
        assert_eq!(received.key, 9);
        assert!(received.payload.into_result().is_err());
    }

    #[test]
    fn unreadable_frame_is_malformed() {
        let err = MessagePacket::<u64, String>::decode(&[0x01, 0x02]).unwrap_err();
        assert!(matches!(err, EngineError::MalformedEnvelope { .. }));
    }
}
