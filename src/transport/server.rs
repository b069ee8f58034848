// SPDX-License-Identifier: Apache-2.0

//! Listener side of the transport.
//!
//! Each connection gets a reader loop and a writer task. Every request runs
//! in its own task so a ping is never queued behind a long execution;
//! replies are written in completion order and matched by key on the client.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use tessera_core::{EngineError, EngineResult};

use crate::config::TransportConfig;
use crate::engine::Engine;
use crate::transport::frame_codec;
use crate::transport::packet::Payload;
use crate::transport::protocol::{ClientMessage, ClientPacket, CorrelationKey, ServerMessage, ServerPacket};

pub struct TransportServer {
    engine: Arc<Engine>,
    config: TransportConfig,
    acceptor: Option<TlsAcceptor>,
}

/// Running listener. Dropping the handle stops it as well.
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops accepting, closes open connections and waits for the accept
    /// loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Accept loop ended abnormally");
        }
        info!(addr = %self.addr, "Transport stopped");
    }
}

impl TransportServer {
    pub fn new(engine: Arc<Engine>, config: TransportConfig, acceptor: Option<TlsAcceptor>) -> Self {
        Self {
            engine,
            config,
            acceptor,
        }
    }

    pub async fn bind(self) -> EngineResult<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind_addr).await.map_err(|e| {
            EngineError::transport_setup(format!("bind {} failed: {e}", self.config.bind_addr))
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| EngineError::transport_setup(format!("listener has no address: {e}")))?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        info!(%addr, tls = self.acceptor.is_some(), "Transport listening");
        let task = tokio::spawn(Arc::new(self).accept_loop(listener, shutdown_rx));
        Ok(ServerHandle {
            addr,
            shutdown,
            task,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(server.serve_connection(stream, peer, shutdown));
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>) {
        let span = info_span!("connection", id = %Uuid::new_v4(), %peer);
        async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(error = %e, "Could not disable Nagle");
            }
            match &self.acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls) => self.run_connection(tls, shutdown).await,
                    Err(e) => warn!(error = %e, "TLS handshake failed"),
                },
                None => self.run_connection(stream, shutdown).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_connection<S>(&self, stream: S, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        debug!("Connection opened");
        let (mut sink, mut frames) =
            Framed::new(stream, frame_codec(self.config.max_frame_bytes)).split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();

        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if let Err(e) = sink.send(bytes).await {
                    debug!(error = %e, "Write failed; dropping remaining replies");
                    break;
                }
            }
        });

        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.next() => frame,
            };
            match frame {
                None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "Frame read failed; closing connection");
                    break;
                }
                Some(Ok(bytes)) => self.dispatch_frame(bytes.freeze(), &out_tx),
            }
        }
        debug!("Connection closed");
    }

    fn dispatch_frame(&self, bytes: Bytes, out: &UnboundedSender<Bytes>) {
        let packet = match ClientPacket::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "Dropping frame without a readable key");
                return;
            }
        };
        let key = packet.key;
        match packet.payload {
            Payload::Content(message) => {
                let engine = Arc::clone(&self.engine);
                let out = out.clone();
                tokio::spawn(handle_request(engine, key, message, out));
            }
            Payload::Failure(error) => send_reply(out, key, Err(error)),
        }
    }
}

async fn handle_request(
    engine: Arc<Engine>,
    key: CorrelationKey,
    message: ClientMessage,
    out: UnboundedSender<Bytes>,
) {
    let call = message.name();
    let (warn_tx, mut warn_rx) = mpsc::unbounded_channel();
    let handled = engine.handle(message, Some(warn_tx));
    tokio::pin!(handled);

    let reply = loop {
        tokio::select! {
            biased;
            Some((request_id, message)) = warn_rx.recv() => {
                send_reply(&out, key, Ok(ServerMessage::Warning { request_id, message }));
            }
            reply = &mut handled => break reply,
        }
    };
    while let Ok((request_id, message)) = warn_rx.try_recv() {
        send_reply(&out, key, Ok(ServerMessage::Warning { request_id, message }));
    }

    if let Err(e) = &reply {
        debug!(key, call, code = e.code(), error = %e, "Call failed");
    }
    send_reply(&out, key, reply);
}

fn send_reply(out: &UnboundedSender<Bytes>, key: CorrelationKey, reply: EngineResult<ServerMessage>) {
    let encoded = ServerPacket {
        key,
        payload: reply.into(),
    }
    .encode()
    .or_else(|e| {
        warn!(key, error = %e, "Reply could not be encoded");
        ServerPacket::failure(key, e).encode()
    });
    match encoded {
        Ok(bytes) => {
            if out.send(bytes).is_err() {
                debug!(key, "Connection gone; reply dropped");
            }
        }
        Err(e) => warn!(key, error = %e, "Failure reply could not be encoded"),
    }
}
