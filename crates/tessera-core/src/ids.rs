// SPDX-License-Identifier: Apache-2.0

//! Correlation identifiers for client requests and per-source executions.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{WireFormat, WireReader};
use crate::error::{EngineError, EngineResult};

/// Placeholder rendered when a request has no known session.
pub const NO_SESSION_MARKER: &str = "C";

/// Opaque numeric session identifier, unique within the cluster while live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A client-visible request: `(session, client execution counter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    session: Option<SessionId>,
    execution: u64,
}

impl RequestId {
    pub fn new(session: SessionId, execution: u64) -> Self {
        Self {
            session: Some(session),
            execution,
        }
    }

    /// A request created where no session is known (server-side only contexts).
    pub fn sessionless(execution: u64) -> Self {
        Self {
            session: None,
            execution,
        }
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn execution(&self) -> u64 {
        self.execution
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session {
            Some(session) => write!(f, "{}.{}", session, self.execution),
            None => write!(f, "{}.{}", NO_SESSION_MARKER, self.execution),
        }
    }
}

impl FromStr for RequestId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (session, execution) = s
            .split_once('.')
            .ok_or_else(|| EngineError::invalid_argument(format!("malformed request id '{s}'")))?;
        let execution = parse_u64(execution, s)?;
        if session == NO_SESSION_MARKER {
            return Ok(Self::sessionless(execution));
        }
        Ok(Self::new(SessionId(parse_u64(session, s)?), execution))
    }
}

impl WireFormat for RequestId {
    const VERSION: u8 = 1;

    fn encode_body(&self, out: &mut BytesMut) {
        match self.session {
            Some(session) => {
                out.put_u8(1);
                out.put_u64(session.0);
            }
            None => out.put_u8(0),
        }
        out.put_u64(self.execution);
    }

    fn decode_body(_version: u8, input: &mut WireReader) -> EngineResult<Self> {
        let session = if input.bool()? {
            Some(SessionId(input.u64()?))
        } else {
            None
        };
        let execution = input.u64()?;
        Ok(Self { session, execution })
    }
}

/// One dispatch of one plan fragment to one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomicRequestId {
    request: RequestId,
    node_id: u32,
    execution_count: u64,
}

impl AtomicRequestId {
    /// Mints a fresh id, drawing the execution count from the shared counter.
    pub fn mint(request: RequestId, node_id: u32, counter: &ExecutionCounter) -> Self {
        Self {
            request,
            node_id,
            execution_count: counter.next(),
        }
    }

    pub fn request(&self) -> &RequestId {
        &self.request
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Process-wide unique counter value; the key of the execution table.
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }
}

impl fmt::Display for AtomicRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.request, self.node_id, self.execution_count)
    }
}

impl FromStr for AtomicRequestId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || EngineError::invalid_argument(format!("malformed atomic request id '{s}'"));
        let (rest, execution_count) = s.rsplit_once('.').ok_or_else(malformed)?;
        let (request, node_id) = rest.rsplit_once('.').ok_or_else(malformed)?;
        Ok(Self {
            request: request.parse()?,
            node_id: node_id.parse().map_err(|_| malformed())?,
            execution_count: parse_u64(execution_count, s)?,
        })
    }
}

impl WireFormat for AtomicRequestId {
    const VERSION: u8 = 1;

    fn encode_body(&self, out: &mut BytesMut) {
        self.request.encode_body(out);
        out.put_u32(self.node_id);
        out.put_u64(self.execution_count);
    }

    fn decode_body(version: u8, input: &mut WireReader) -> EngineResult<Self> {
        let request = RequestId::decode_body(version, input)?;
        Ok(Self {
            request,
            node_id: input.u32()?,
            execution_count: input.u64()?,
        })
    }
}

/// Lock-free, process-wide source of atomic execution counts.
///
/// Values start at 1 and are never reused for the lifetime of the counter.
#[derive(Debug)]
pub struct ExecutionCounter {
    next: AtomicU64,
}

impl ExecutionCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to `next` will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for ExecutionCounter {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_u64(part: &str, whole: &str) -> EngineResult<u64> {
    part.parse()
        .map_err(|_| EngineError::invalid_argument(format!("malformed identifier '{whole}'")))
}
