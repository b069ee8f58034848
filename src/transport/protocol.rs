// SPDX-License-Identifier: Apache-2.0

//! Messages exchanged between clients and the engine.

use serde::{Deserialize, Serialize};

use tessera_core::envelope::RequestMessage;
use tessera_core::{LogonResult, RequestId, SessionToken};

use crate::dispatch::RequestResults;
use crate::session::Credentials;
use crate::transport::packet::MessagePacket;

/// Correlation key chosen by the client, unique per connection.
pub type CorrelationKey = u64;

pub type ClientPacket = MessagePacket<CorrelationKey, ClientMessage>;
pub type ServerPacket = MessagePacket<CorrelationKey, ServerMessage>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Logon {
        credentials: Credentials,
    },
    Ping {
        token: SessionToken,
    },
    Logoff {
        token: SessionToken,
    },
    Execute {
        token: SessionToken,
        request: RequestMessage,
    },
    CancelRequest {
        token: SessionToken,
        execution_id: u64,
    },
    CancelSessionQueries {
        token: SessionToken,
    },
    CloseRequest {
        token: SessionToken,
        execution_id: u64,
    },
}

impl ClientMessage {
    /// Calls that wait on authentication or query execution; they get the
    /// longer synchronous time-to-live.
    pub fn is_sync(&self) -> bool {
        matches!(self, ClientMessage::Logon { .. } | ClientMessage::Execute { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Logon { .. } => "logon",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Logoff { .. } => "logoff",
            ClientMessage::Execute { .. } => "execute",
            ClientMessage::CancelRequest { .. } => "cancel_request",
            ClientMessage::CancelSessionQueries { .. } => "cancel_session_queries",
            ClientMessage::CloseRequest { .. } => "close_request",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    LogonResult(LogonResult),
    Ack,
    Results(RequestResults),
    /// Number of requests a cancel call reached.
    Cancelled {
        count: usize,
    },
    Closed {
        released: bool,
    },
    /// Asynchronous notification sent under the key of the request that
    /// produced it, ahead of the final reply.
    Warning {
        request_id: RequestId,
        message: String,
    },
}
