// SPDX-License-Identifier: Apache-2.0

//! Session identity types shared by the engine and its clients.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;

use crate::codec::{put_str, WireFormat, WireReader};
use crate::error::EngineResult;
use crate::ids::SessionId;

/// Length in bytes of a per-session secret.
pub const SECRET_LEN: usize = 32;

/// Random per-session secret that prevents session id guessing and replay.
#[derive(Clone)]
pub struct SessionSecret([u8; SECRET_LEN]);

impl SessionSecret {
    pub fn from_bytes(bytes: [u8; SECRET_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.0
    }
}

impl PartialEq for SessionSecret {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for SessionSecret {}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for SessionSecret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SessionSecret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let bytes: [u8; SECRET_LEN] = raw
            .try_into()
            .map_err(|_| serde::de::Error::custom("session secret has wrong length"))?;
        Ok(Self(bytes))
    }
}

/// Bearer credential presented by a client on every call after logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken {
    pub session_id: SessionId,
    pub username: String,
    pub secret: SessionSecret,
}

impl SessionToken {
    /// Full identity comparison. Never compare tokens by id alone.
    pub fn same_identity(&self, other: &SessionToken) -> bool {
        // Evaluate every field so the timing does not reveal which one differed.
        let id = self.session_id == other.session_id;
        let user = self.username == other.username;
        let secret = self.secret == other.secret;
        id & user & secret
    }
}

impl WireFormat for SessionToken {
    const VERSION: u8 = 1;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u64(self.session_id.0);
        put_str(out, &self.username);
        out.put_slice(self.secret.as_bytes());
    }

    fn decode_body(_version: u8, input: &mut WireReader) -> EngineResult<Self> {
        let session_id = SessionId(input.u64()?);
        let username = input.string()?;
        let mut secret = [0u8; SECRET_LEN];
        for byte in secret.iter_mut() {
            *byte = input.u8()?;
        }
        Ok(Self {
            session_id,
            username,
            secret: SessionSecret(secret),
        })
    }
}

/// A virtual database bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VdbRef {
    pub name: String,
    pub version: u32,
}

impl VdbRef {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for VdbRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// Everything negotiated at logon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogonResult {
    pub token: SessionToken,
    pub vdb: VdbRef,
    pub time_zone: String,
    pub cluster_name: String,
    pub product_name: String,
    /// Interval at which the client must ping, in milliseconds.
    pub ping_interval_ms: u64,
}

impl LogonResult {
    pub fn session_id(&self) -> SessionId {
        self.token.session_id
    }
}
