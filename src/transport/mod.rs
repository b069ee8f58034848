// SPDX-License-Identifier: Apache-2.0

//! Client/server transport: length-delimited frames carrying correlated
//! packets, optionally over TLS.

pub mod client;
pub mod packet;
pub mod protocol;
pub mod server;
pub mod tls;

use tokio_util::codec::LengthDelimitedCodec;

pub use client::{parse_server_name, Notification, ServerConnection};
pub use packet::{MessagePacket, Payload};
pub use protocol::{ClientMessage, ClientPacket, CorrelationKey, ServerMessage, ServerPacket};
pub use server::{ServerHandle, TransportServer};
pub use tls::{
    build_client_engine, build_server_engine, resolve_tls_material, MaterialSource, StoreSpec,
    TlsMaterial, TlsMode,
};

/// Frames larger than `max_frame_bytes` are rejected by both peers.
pub(crate) fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}
