// SPDX-License-Identifier: Apache-2.0

//! Client side of the transport.
//!
//! A [`ServerConnection`] multiplexes concurrent calls over one stream.
//! Replies are matched to callers by correlation key. A call that outlives
//! its time-to-live is abandoned; a late reply for it is dropped by the
//! reader.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, instrument, warn};

use tessera_core::envelope::RequestMessage;
use tessera_core::{EngineError, EngineResult, LogonResult, RequestId, SessionToken};

use crate::config::TransportConfig;
use crate::dispatch::RequestResults;
use crate::session::Credentials;
use crate::transport::frame_codec;
use crate::transport::packet::Payload;
use crate::transport::protocol::{ClientMessage, ClientPacket, CorrelationKey, ServerMessage, ServerPacket};

const COMPONENT: &str = "transport";

type BoxedStream = Box<dyn Duplex + Send + Unpin>;
type PendingCalls = Arc<Mutex<HashMap<CorrelationKey, oneshot::Sender<Payload<ServerMessage>>>>>;

/// Any duplex byte stream (plain TCP, TLS, or in-memory for tests).
pub trait Duplex: AsyncRead + AsyncWrite {}

impl<S: AsyncRead + AsyncWrite> Duplex for S {}

/// Warning notification: the request that raised it and the text.
pub type Notification = (RequestId, String);

pub struct ServerConnection {
    writer: AsyncMutex<FramedWrite<WriteHalf<BoxedStream>, LengthDelimitedCodec>>,
    pending: PendingCalls,
    next_key: AtomicU64,
    in_flight: Semaphore,
    sync_ttl: Duration,
    async_ttl: Duration,
    notifications: Mutex<Option<UnboundedReceiver<Notification>>>,
    reader: JoinHandle<()>,
}

/// Host names become DNS names; literal addresses stay addresses.
pub fn parse_server_name(host: &str) -> EngineResult<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string())
        .map_err(|e| EngineError::transport_setup(format!("invalid server name {host}: {e}")))
}

async fn open_tcp(addr: &str) -> EngineResult<TcpStream> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| EngineError::unavailable(COMPONENT, format!("connect to {addr} failed: {e}")))?;
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "Could not disable Nagle");
    }
    Ok(stream)
}

impl ServerConnection {
    pub async fn connect(addr: &str, config: &TransportConfig) -> EngineResult<Self> {
        let stream = open_tcp(addr).await?;
        Ok(Self::from_stream(stream, config))
    }

    pub async fn connect_tls(
        addr: &str,
        server_name: &str,
        connector: &TlsConnector,
        config: &TransportConfig,
    ) -> EngineResult<Self> {
        let name = parse_server_name(server_name)?;
        let stream = open_tcp(addr).await?;
        let tls = connector
            .connect(name, stream)
            .await
            .map_err(|e| EngineError::transport_setup(format!("TLS handshake with {addr} failed: {e}")))?;
        Ok(Self::from_stream(tls, config))
    }

    /// Wraps an established stream and starts the reply reader.
    pub fn from_stream<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: BoxedStream = Box::new(stream);
        let (read, write) = tokio::io::split(boxed);
        let pending: PendingCalls = Arc::new(Mutex::new(HashMap::new()));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_replies(
            FramedRead::new(read, frame_codec(config.max_frame_bytes)),
            Arc::clone(&pending),
            notify_tx,
        ));

        Self {
            writer: AsyncMutex::new(FramedWrite::new(write, frame_codec(config.max_frame_bytes))),
            pending,
            next_key: AtomicU64::new(1),
            in_flight: Semaphore::new(config.max_reader_threads.max(1)),
            sync_ttl: Duration::from_millis(config.sync_call_ttl_ms),
            async_ttl: Duration::from_millis(config.async_call_ttl_ms),
            notifications: Mutex::new(Some(notify_rx)),
            reader,
        }
    }

    /// Hands out the warning stream. Only the first caller gets it.
    pub fn take_notifications(&self) -> Option<UnboundedReceiver<Notification>> {
        self.notifications.lock().take()
    }

    /// Calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Sends one message and waits for its reply, bounded by the sync or
    /// async time-to-live.
    #[instrument(skip_all, fields(call = message.name()))]
    pub async fn call(&self, message: ClientMessage) -> EngineResult<ServerMessage> {
        let ttl = if message.is_sync() {
            self.sync_ttl
        } else {
            self.async_ttl
        };
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);

        match timeout(ttl, self.round_trip(key, message)).await {
            Ok(result) => result,
            Err(_) => {
                self.pending.lock().remove(&key);
                warn!(key, ttl_ms = ttl.as_millis() as u64, "Call timed out");
                Err(EngineError::Timeout {
                    timeout_ms: ttl.as_millis() as u64,
                })
            }
        }
    }

    async fn round_trip(&self, key: CorrelationKey, message: ClientMessage) -> EngineResult<ServerMessage> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| EngineError::unavailable(COMPONENT, "connection is closed"))?;

        let bytes = ClientPacket::content(key, message).encode()?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);

        let sent = self.writer.lock().await.send(bytes).await;
        if let Err(e) = sent {
            self.pending.lock().remove(&key);
            return Err(EngineError::unavailable(COMPONENT, format!("send failed: {e}")));
        }

        match rx.await {
            Ok(payload) => payload.into_result(),
            Err(_) => Err(EngineError::unavailable(
                COMPONENT,
                "connection closed before the reply arrived",
            )),
        }
    }

    pub async fn logon(&self, credentials: Credentials) -> EngineResult<LogonResult> {
        match self.call(ClientMessage::Logon { credentials }).await? {
            ServerMessage::LogonResult(result) => Ok(result),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn ping(&self, token: &SessionToken) -> EngineResult<()> {
        self.expect_ack(ClientMessage::Ping {
            token: token.clone(),
        })
        .await
    }

    pub async fn logoff(&self, token: &SessionToken) -> EngineResult<()> {
        self.expect_ack(ClientMessage::Logoff {
            token: token.clone(),
        })
        .await
    }

    pub async fn execute(&self, token: &SessionToken, request: RequestMessage) -> EngineResult<RequestResults> {
        let message = ClientMessage::Execute {
            token: token.clone(),
            request,
        };
        match self.call(message).await? {
            ServerMessage::Results(results) => Ok(results),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn cancel_request(&self, token: &SessionToken, execution_id: u64) -> EngineResult<bool> {
        let message = ClientMessage::CancelRequest {
            token: token.clone(),
            execution_id,
        };
        match self.call(message).await? {
            ServerMessage::Cancelled { count } => Ok(count > 0),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn cancel_session_queries(&self, token: &SessionToken) -> EngineResult<usize> {
        let message = ClientMessage::CancelSessionQueries {
            token: token.clone(),
        };
        match self.call(message).await? {
            ServerMessage::Cancelled { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn close_request(&self, token: &SessionToken, execution_id: u64) -> EngineResult<bool> {
        let message = ClientMessage::CloseRequest {
            token: token.clone(),
            execution_id,
        };
        match self.call(message).await? {
            ServerMessage::Closed { released } => Ok(released),
            other => Err(unexpected(&other)),
        }
    }

    async fn expect_ack(&self, message: ClientMessage) -> EngineResult<()> {
        match self.call(message).await? {
            ServerMessage::Ack => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        self.in_flight.close();
        self.reader.abort();
    }
}

fn unexpected(reply: &ServerMessage) -> EngineError {
    EngineError::malformed(format!("unexpected reply {reply:?}"))
}

async fn read_replies(
    mut frames: FramedRead<ReadHalf<BoxedStream>, LengthDelimitedCodec>,
    pending: PendingCalls,
    notifications: UnboundedSender<Notification>,
) {
    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Reply stream failed");
                break;
            }
        };
        let packet = match ServerPacket::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping reply without a readable key");
                continue;
            }
        };

        if let Payload::Content(ServerMessage::Warning { request_id, message }) = packet.payload {
            let _ = notifications.send((request_id, message));
            continue;
        }
        match pending.lock().remove(&packet.key) {
            Some(waiter) => {
                let _ = waiter.send(packet.payload);
            }
            None => debug!(key = packet.key, "Discarding reply for an abandoned call"),
        }
    }
    // Dropping the senders fails every waiting call.
    pending.lock().clear();
}
