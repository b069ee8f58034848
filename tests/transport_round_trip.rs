// SPDX-License-Identifier: Apache-2.0

mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use common::{fixture, JOIN_SQL, VDB};
use tessera::config::TransportConfig;
use tessera::core_types::envelope::RequestMessage;
use tessera::core_types::EngineError;
use tessera::dispatch::MemoryConnector;
use tessera::session::Credentials;
use tessera::transport::{MessagePacket, Payload, ServerConnection, ServerPacket};
use tessera::EngineConfig;

fn local_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.transport.bind_addr = "127.0.0.1:0".to_string();
    config
}

#[tokio::test]
async fn client_and_server_complete_a_session() {
    let fx = fixture(
        local_config(),
        MemoryConnector::new("mongo").with_warning("statistics are stale"),
    );
    let server = fx.engine.serve().await.unwrap();
    let addr = server.local_addr().to_string();

    let client = ServerConnection::connect(&addr, &fx.engine.config().transport)
        .await
        .unwrap();
    let mut notifications = client.take_notifications().unwrap();
    assert!(client.take_notifications().is_none());

    let logon = client
        .logon(Credentials::new("alice", "secret", VDB))
        .await
        .unwrap();
    assert_eq!(logon.vdb.name, VDB);
    fx.entitlements.assign(logon.session_id(), "analyst");

    client.ping(&logon.token).await.unwrap();
    let results = client
        .execute(&logon.token, RequestMessage::new(1, JOIN_SQL))
        .await
        .unwrap();
    assert_eq!(results.fragments.len(), 2);
    assert_eq!(results.row_count(), 4);
    assert_eq!(results.warnings, vec!["statistics are stale".to_string()]);

    let (request_id, warning) = notifications.try_recv().unwrap();
    assert_eq!(request_id, results.request_id);
    assert_eq!(warning, "statistics are stale");

    assert!(client.close_request(&logon.token, 1).await.unwrap());
    assert_eq!(client.cancel_session_queries(&logon.token).await.unwrap(), 0);
    client.logoff(&logon.token).await.unwrap();

    let err = client.ping(&logon.token).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidSession { .. }));
    assert_eq!(client.pending_calls(), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn unreadable_payload_is_answered_under_its_key() {
    let fx = fixture(local_config(), MemoryConnector::new("mongo"));
    let server = fx.engine.serve().await.unwrap();

    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    let bogus = MessagePacket::content(77u64, "not a client message".to_string());
    framed.send(bogus.encode().unwrap()).await.unwrap();

    let frame = framed.next().await.unwrap().unwrap();
    let reply = ServerPacket::decode(&frame).unwrap();
    assert_eq!(reply.key, 77);
    assert!(matches!(
        reply.payload,
        Payload::Failure(EngineError::MalformedEnvelope { .. })
    ));

    server.shutdown().await;
}

#[tokio::test]
async fn unanswered_calls_time_out_and_are_forgotten() {
    let (client_end, _server_end) = tokio::io::duplex(64 * 1024);
    let config = TransportConfig {
        async_call_ttl_ms: 50,
        ..TransportConfig::default()
    };
    let client = ServerConnection::from_stream(client_end, &config);

    let logon_token = {
        use tessera::core_types::session::SECRET_LEN;
        use tessera::core_types::{SessionId, SessionSecret, SessionToken};
        SessionToken {
            session_id: SessionId(1),
            username: "alice".to_string(),
            secret: SessionSecret::from_bytes([0; SECRET_LEN]),
        }
    };

    let started = tokio::time::Instant::now();
    let err = client.ping(&logon_token).await.unwrap_err();
    assert_eq!(err, EngineError::Timeout { timeout_ms: 50 });
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.pending_calls(), 0);
}
