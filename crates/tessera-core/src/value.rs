// SPDX-License-Identifier: Apache-2.0

//! Row values exchanged between connectors and clients.

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{put_bytes, put_str, WireReader};
use crate::error::{EngineError, EngineResult};

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

/// One row: an ordered sequence of values.
pub type Row = Vec<Value>;

/// One batch: an ordered sequence of rows.
pub type Batch = Vec<Row>;

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        match self {
            Value::Null => out.put_u8(0),
            Value::Bool(v) => {
                out.put_u8(1);
                out.put_u8(u8::from(*v));
            }
            Value::Int(v) => {
                out.put_u8(2);
                out.put_i64(*v);
            }
            Value::Float(v) => {
                out.put_u8(3);
                out.put_f64(*v);
            }
            Value::Text(v) => {
                out.put_u8(4);
                put_str(out, v);
            }
            Value::Bytes(v) => {
                out.put_u8(5);
                put_bytes(out, v);
            }
            Value::Timestamp(v) => {
                out.put_u8(6);
                out.put_i64(v.timestamp_micros());
            }
        }
    }

    pub(crate) fn decode(input: &mut WireReader) -> EngineResult<Self> {
        Ok(match input.u8()? {
            0 => Value::Null,
            1 => Value::Bool(input.bool()?),
            2 => Value::Int(input.i64()?),
            3 => Value::Float(input.f64()?),
            4 => Value::Text(input.string()?),
            5 => Value::Bytes(input.bytes()?.to_vec()),
            6 => {
                let micros = input.i64()?;
                let ts = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                    EngineError::malformed(format!("timestamp out of range: {micros}"))
                })?;
                Value::Timestamp(ts)
            }
            tag => return Err(EngineError::malformed(format!("unknown value tag {tag}"))),
        })
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}
