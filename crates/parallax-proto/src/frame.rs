//! Length-prefixed JSON framing for the plugin transport.
//!
//! Each frame is a u32 big-endian length followed by a JSON document. JSON
//! keeps the protocol implementable from any language a plugin happens to be
//! written in.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Upper bound on a single frame. Schemas and build diagnostics fit well
/// inside this; artefacts never travel over this transport.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Construct the codec with protocol limits applied.
#[must_use]
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .length_field_type::<u32>()
        .new_codec()
}

/// Wrap a transport in the framed codec.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    Framed::new(io, codec())
}

/// Serialise one message into a frame payload.
pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec(msg).map(Bytes::from)
}

/// Deserialise one frame payload.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::{PluginRequest, PluginResponse};

    #[test]
    fn round_trips_protocol_messages() {
        let payload = encode(&PluginRequest::Ping).unwrap();
        let back: PluginRequest = decode(&payload).unwrap();
        assert_eq!(back, PluginRequest::Ping);

        let payload = encode(&PluginResponse::Dependencies {
            modules: vec!["time".into()],
        })
        .unwrap();
        let back: PluginResponse = decode(&payload).unwrap();
        assert_eq!(
            back,
            PluginResponse::Dependencies {
                modules: vec!["time".into()],
            }
        );
    }
}
