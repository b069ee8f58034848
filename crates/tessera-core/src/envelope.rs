// SPDX-License-Identifier: Apache-2.0

//! Envelopes exchanged between the dispatch core and connectors.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec::{put_str, WireFormat, WireReader};
use crate::command::Command;
use crate::error::{EngineError, EngineResult};
use crate::ids::{AtomicRequestId, ExecutionCounter, RequestId};
use crate::transaction::TransactionContext;
use crate::value::{Batch, Value};

/// Batch size used when the client does not ask for one.
pub const DEFAULT_FETCH_SIZE: usize = 2048;

fn default_fetch_size() -> usize {
    DEFAULT_FETCH_SIZE
}

/// A command submission as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    /// Client-scoped, monotonically increasing execution number.
    pub execution_id: u64,
    pub sql: String,
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// Row cap applied to every fragment; `None` means unlimited.
    #[serde(default)]
    pub max_rows: Option<u64>,
    /// When the cap is hit: fail (`true`) or truncate silently (`false`).
    #[serde(default)]
    pub exception_on_max_rows: bool,
    #[serde(default)]
    pub partial_results: bool,
    /// Forces fragments to run one at a time even outside a transaction.
    #[serde(default)]
    pub serial: bool,
    /// Opaque payload forwarded to connectors untouched.
    #[serde(default)]
    pub execution_payload: Option<serde_json::Value>,
}

impl RequestMessage {
    pub fn new(execution_id: u64, sql: impl Into<String>) -> Self {
        Self {
            execution_id,
            sql: sql.into(),
            fetch_size: DEFAULT_FETCH_SIZE,
            max_rows: None,
            exception_on_max_rows: false,
            partial_results: false,
            serial: false,
            execution_payload: None,
        }
    }
}

/// Where a fragment goes and what it runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentTarget {
    pub connector_binding: String,
    pub model_name: String,
    pub command: Command,
}

/// One fragment of a client request bound for exactly one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicRequestMessage {
    atomic_request_id: AtomicRequestId,
    connector_binding: String,
    model_name: String,
    transaction_context: Option<TransactionContext>,
    command: Command,
    fetch_size: usize,
    max_result_rows: Option<u64>,
    exception_on_max_rows: bool,
    execution_payload: Option<serde_json::Value>,
    partial_results: bool,
    serial: bool,
    processing_timestamp: DateTime<Utc>,
}

impl AtomicRequestMessage {
    /// Builds the envelope for `node_id`, minting a fresh atomic id.
    pub fn new(
        request_id: RequestId,
        request: &RequestMessage,
        node_id: u32,
        target: FragmentTarget,
        transaction_context: Option<TransactionContext>,
        counter: &ExecutionCounter,
    ) -> EngineResult<Self> {
        validate_fetch_size(request.fetch_size)?;
        Ok(Self {
            atomic_request_id: AtomicRequestId::mint(request_id, node_id, counter),
            connector_binding: target.connector_binding,
            model_name: target.model_name,
            transaction_context,
            command: target.command,
            fetch_size: request.fetch_size,
            max_result_rows: request.max_rows,
            exception_on_max_rows: request.exception_on_max_rows,
            execution_payload: request.execution_payload.clone(),
            partial_results: request.partial_results,
            serial: request.serial,
            processing_timestamp: Utc::now(),
        })
    }

    pub fn atomic_request_id(&self) -> &AtomicRequestId {
        &self.atomic_request_id
    }

    pub fn connector_binding(&self) -> &str {
        &self.connector_binding
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn transaction_context(&self) -> Option<&TransactionContext> {
        self.transaction_context.as_ref()
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn fetch_size(&self) -> usize {
        self.fetch_size
    }

    pub fn set_fetch_size(&mut self, fetch_size: usize) -> EngineResult<()> {
        validate_fetch_size(fetch_size)?;
        self.fetch_size = fetch_size;
        Ok(())
    }

    pub fn max_result_rows(&self) -> Option<u64> {
        self.max_result_rows
    }

    pub fn exception_on_max_rows(&self) -> bool {
        self.exception_on_max_rows
    }

    pub fn execution_payload(&self) -> Option<&serde_json::Value> {
        self.execution_payload.as_ref()
    }

    pub fn partial_results_allowed(&self) -> bool {
        self.partial_results
    }

    pub fn set_serial(&mut self, serial: bool) {
        self.serial = serial;
    }

    pub fn is_transactional(&self) -> bool {
        self.transaction_context
            .as_ref()
            .is_some_and(TransactionContext::is_transactional)
    }

    /// Serial executions may not run concurrently with siblings sharing the
    /// transaction. A transactional request is always serial.
    pub fn is_serial(&self) -> bool {
        self.serial || self.is_transactional()
    }

    pub fn processing_timestamp(&self) -> DateTime<Utc> {
        self.processing_timestamp
    }
}

fn validate_fetch_size(fetch_size: usize) -> EngineResult<()> {
    if fetch_size < 1 {
        return Err(EngineError::invalid_argument(format!(
            "fetch size must be at least 1, got {fetch_size}"
        )));
    }
    Ok(())
}

/// Hint telling an external result cache how widely a result may be shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    #[default]
    None,
    Session,
    User,
    Vdb,
}

impl CacheScope {
    fn to_byte(self) -> u8 {
        match self {
            CacheScope::None => 0,
            CacheScope::Session => 1,
            CacheScope::User => 2,
            CacheScope::Vdb => 3,
        }
    }

    fn from_byte(byte: u8) -> EngineResult<Self> {
        Ok(match byte {
            0 => CacheScope::None,
            1 => CacheScope::Session,
            2 => CacheScope::User,
            3 => CacheScope::Vdb,
            other => return Err(EngineError::malformed(format!("unknown cache scope {other}"))),
        })
    }
}

/// Marker for "the source has not signalled completion yet".
pub const FINAL_ROW_UNKNOWN: i64 = -1;

/// Results returned by a connector for one pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicResultsMessage {
    pub batches: Vec<Batch>,
    /// `-1` until the source completes, then the 0-based index of the last row.
    pub final_row: i64,
    pub supports_implicit_close: bool,
    pub warnings: Vec<String>,
    pub cache_scope: CacheScope,
    /// Trailing connector properties; absent on the wire when `None`.
    #[serde(default)]
    pub properties: Option<BTreeMap<String, String>>,
}

impl AtomicResultsMessage {
    /// A non-final batch.
    pub fn partial(rows: Batch) -> Self {
        Self {
            batches: vec![rows],
            final_row: FINAL_ROW_UNKNOWN,
            supports_implicit_close: false,
            warnings: Vec::new(),
            cache_scope: CacheScope::None,
            properties: None,
        }
    }

    /// A batch carrying the final-row marker.
    pub fn last(rows: Batch, final_row: i64) -> Self {
        Self {
            final_row,
            ..Self::partial(rows)
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    pub fn with_implicit_close(mut self, supported: bool) -> Self {
        self.supports_implicit_close = supported;
        self
    }

    pub fn is_final(&self) -> bool {
        self.final_row >= 0
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn into_rows(self) -> impl Iterator<Item = Vec<Value>> {
        self.batches.into_iter().flatten()
    }
}

impl WireFormat for AtomicResultsMessage {
    const VERSION: u8 = 1;

    fn encode_body(&self, out: &mut BytesMut) {
        out.put_u32(self.batches.len() as u32);
        for batch in &self.batches {
            out.put_u32(batch.len() as u32);
            for row in batch {
                out.put_u32(row.len() as u32);
                for value in row {
                    value.encode(out);
                }
            }
        }
        out.put_i64(self.final_row);
        out.put_u8(u8::from(self.supports_implicit_close));
        out.put_u32(self.warnings.len() as u32);
        for warning in &self.warnings {
            put_str(out, warning);
        }
        out.put_u8(self.cache_scope.to_byte());
        if let Some(properties) = &self.properties {
            out.put_u32(properties.len() as u32);
            for (key, value) in properties {
                put_str(out, key);
                put_str(out, value);
            }
        }
    }

    fn decode_body(_version: u8, input: &mut WireReader) -> EngineResult<Self> {
        let batch_count = input.u32()? as usize;
        let mut batches = Vec::with_capacity(batch_count.min(1024));
        for _ in 0..batch_count {
            let row_count = input.u32()? as usize;
            let mut batch = Vec::with_capacity(row_count.min(4096));
            for _ in 0..row_count {
                let width = input.u32()? as usize;
                let mut row = Vec::with_capacity(width.min(256));
                for _ in 0..width {
                    row.push(Value::decode(input)?);
                }
                batch.push(row);
            }
            batches.push(batch);
        }
        let final_row = input.i64()?;
        let supports_implicit_close = input.bool()?;
        let warning_count = input.u32()? as usize;
        let mut warnings = Vec::with_capacity(warning_count.min(256));
        for _ in 0..warning_count {
            warnings.push(input.string()?);
        }
        let cache_scope = CacheScope::from_byte(input.u8()?)?;
        let properties = if input.has_remaining() {
            let count = input.u32()? as usize;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key = input.string()?;
                map.insert(key, input.string()?);
            }
            Some(map)
        } else {
            None
        };
        Ok(Self {
            batches,
            final_row,
            supports_implicit_close,
            warnings,
            cache_scope,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{GroupSymbol, MetadataId, Query};
    use crate::ids::SessionId;
    use crate::transaction::TransactionScope;

    fn target() -> FragmentTarget {
        FragmentTarget {
            connector_binding: "pg-main".to_string(),
            model_name: "modelA".to_string(),
            command: Command::Query(Query::new(
                vec![],
                vec![GroupSymbol::new("modelA.t1", MetadataId::catalog("modelA.t1"))],
            )),
        }
    }

    fn build(
        request: &RequestMessage,
        transaction: Option<TransactionContext>,
        counter: &ExecutionCounter,
    ) -> EngineResult<AtomicRequestMessage> {
        AtomicRequestMessage::new(
            RequestId::new(SessionId(1), request.execution_id),
            request,
            0,
            target(),
            transaction,
            counter,
        )
    }

    #[test]
    fn zero_fetch_size_is_rejected_at_construction() {
        let counter = ExecutionCounter::new();
        let mut request = RequestMessage::new(1, "SELECT 1");
        request.fetch_size = 0;
        let err = build(&request, None, &counter).unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
        assert_eq!(counter.peek(), 1, "no id should be minted for a rejected request");
    }

    #[test]
    fn set_fetch_size_rejects_zero_and_keeps_previous() {
        let counter = ExecutionCounter::new();
        let mut message = build(&RequestMessage::new(1, "SELECT 1"), None, &counter).unwrap();
        assert!(message.set_fetch_size(0).is_err());
        assert_eq!(message.fetch_size(), DEFAULT_FETCH_SIZE);
        message.set_fetch_size(10).unwrap();
        assert_eq!(message.fetch_size(), 10);
    }

    #[test]
    fn transactional_implies_serial() {
        let counter = ExecutionCounter::new();
        let request = RequestMessage::new(1, "SELECT 1");
        for scope in [TransactionScope::None, TransactionScope::Local, TransactionScope::Global] {
            for explicit in [false, true] {
                let mut message = build(
                    &request,
                    Some(TransactionContext::new("tx-1", scope)),
                    &counter,
                )
                .unwrap();
                message.set_serial(explicit);
                if message.is_transactional() {
                    assert!(message.is_serial());
                }
                assert_eq!(message.is_serial(), explicit || scope != TransactionScope::None);
            }
        }
    }

    #[test]
    fn every_construction_mints_a_new_id() {
        let counter = ExecutionCounter::new();
        let request = RequestMessage::new(1, "SELECT 1");
        let a = build(&request, None, &counter).unwrap();
        let b = build(&request, None, &counter).unwrap();
        assert_ne!(a.atomic_request_id(), b.atomic_request_id());
    }

    #[test]
    fn results_without_properties_omit_the_trailing_map() {
        let message = AtomicResultsMessage::last(vec![vec![Value::Int(1)]], 0)
            .with_warning("slow source")
            .with_cache_scope(CacheScope::Vdb);
        let encoded = message.to_wire();
        let decoded = AtomicResultsMessage::from_wire(encoded).unwrap();
        assert_eq!(decoded, message);
        assert!(decoded.properties.is_none());

        let mut with_props = message.clone();
        with_props.properties = Some(BTreeMap::from([("source".to_string(), "pg".to_string())]));
        let decoded = AtomicResultsMessage::from_wire(with_props.to_wire()).unwrap();
        assert_eq!(decoded.properties, with_props.properties);
    }
}
