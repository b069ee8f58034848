// SPDX-License-Identifier: Apache-2.0

//! In-memory connector
//!
//! Serves rows registered per group. Used for demos and tests; it also lets
//! tests inject delays, failures and connector warnings.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use tessera_core::command::{Command, Expression, InsertSource};
use tessera_core::envelope::{AtomicResultsMessage, CacheScope};
use tessera_core::{
    AtomicRequestId, AtomicRequestMessage, Connector, EngineError, EngineResult, Row, Value,
};

struct Execution {
    pending: VecDeque<Row>,
    fetch_size: usize,
    delivered: usize,
}

#[derive(Default)]
struct CallLog {
    executed: Vec<AtomicRequestId>,
    cancelled: Vec<AtomicRequestId>,
    closed: Vec<AtomicRequestId>,
}

pub struct MemoryConnector {
    binding: String,
    tables: Mutex<HashMap<String, Vec<Row>>>,
    executions: Mutex<HashMap<AtomicRequestId, Execution>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<CallLog>,
    pull_delay: Option<Duration>,
    warning: Option<String>,
    implicit_close: bool,
    cache_scope: CacheScope,
}

fn key(name: &str) -> String {
    name.to_ascii_lowercase()
}

impl MemoryConnector {
    pub fn new(binding: impl Into<String>) -> Self {
        Self {
            binding: binding.into(),
            tables: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(CallLog::default()),
            pull_delay: None,
            warning: None,
            implicit_close: false,
            cache_scope: CacheScope::Vdb,
        }
    }

    /// Sleeps before answering every pull.
    pub fn with_pull_delay(mut self, delay: Duration) -> Self {
        self.pull_delay = Some(delay);
        self
    }

    /// Attaches a warning to the first batch of every execution.
    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }

    pub fn with_implicit_close(mut self, supported: bool) -> Self {
        self.implicit_close = supported;
        self
    }

    pub fn with_cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    /// Replaces the rows of a group (or the result set of a procedure).
    pub fn set_rows(&self, group: &str, rows: Vec<Row>) {
        self.tables.lock().insert(key(group), rows);
    }

    pub fn rows(&self, group: &str) -> Vec<Row> {
        self.tables.lock().get(&key(group)).cloned().unwrap_or_default()
    }

    /// Executions touching `group` fail from now on.
    pub fn fail_on(&self, group: &str) {
        self.failing.lock().insert(key(group));
    }

    pub fn executed(&self) -> Vec<AtomicRequestId> {
        self.calls.lock().executed.clone()
    }

    pub fn cancelled(&self) -> Vec<AtomicRequestId> {
        self.calls.lock().cancelled.clone()
    }

    pub fn closed(&self) -> Vec<AtomicRequestId> {
        self.calls.lock().closed.clone()
    }

    fn run(&self, command: &Command) -> EngineResult<Vec<Row>> {
        let group = command
            .target_groups()
            .into_iter()
            .next()
            .map(|g| key(g.metadata_id.key()))
            .ok_or_else(|| EngineError::connector(&self.binding, "command has no target group"))?;

        if self.failing.lock().contains(&group) {
            return Err(EngineError::connector(
                &self.binding,
                format!("source rejected the request for {group}"),
            ));
        }

        let mut tables = self.tables.lock();
        match command {
            Command::Query(_) | Command::StoredProcedure(_) => {
                Ok(tables.get(&group).cloned().unwrap_or_default())
            }
            Command::Insert(insert) => match &insert.source {
                InsertSource::Values(values) => {
                    let row: Row = values
                        .iter()
                        .map(|v| match v {
                            Expression::Constant(value) => value.clone(),
                            _ => Value::Null,
                        })
                        .collect();
                    tables.entry(group).or_default().push(row);
                    Ok(vec![vec![Value::Int(1)]])
                }
                InsertSource::Query(_) => Err(EngineError::connector(
                    &self.binding,
                    "INSERT ... SELECT is not supported",
                )),
            },
            Command::Delete(delete) if delete.criteria.is_none() => {
                let removed = tables.remove(&group).map(|rows| rows.len()).unwrap_or(0);
                Ok(vec![vec![Value::Int(removed as i64)]])
            }
            other => Err(EngineError::connector(
                &self.binding,
                format!("{} is not supported", other.kind()),
            )),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn binding_name(&self) -> &str {
        &self.binding
    }

    async fn execute(&self, request: AtomicRequestMessage) -> EngineResult<()> {
        let id = *request.atomic_request_id();
        self.calls.lock().executed.push(id);
        let rows = self.run(request.command())?;
        debug!(atomic = %id, rows = rows.len(), "Memory execution started");
        self.executions.lock().insert(
            id,
            Execution {
                pending: rows.into(),
                fetch_size: request.fetch_size(),
                delivered: 0,
            },
        );
        Ok(())
    }

    async fn more(&self, id: &AtomicRequestId) -> EngineResult<AtomicResultsMessage> {
        if let Some(delay) = self.pull_delay {
            tokio::time::sleep(delay).await;
        }

        let mut executions = self.executions.lock();
        let execution = executions
            .get_mut(id)
            .ok_or_else(|| EngineError::connector(&self.binding, format!("unknown execution {id}")))?;

        let take = execution.fetch_size.min(execution.pending.len());
        let rows: Vec<Row> = execution.pending.drain(..take).collect();
        let first = execution.delivered == 0;
        execution.delivered += rows.len();

        let mut message = if execution.pending.is_empty() {
            let final_row = execution.delivered.saturating_sub(1) as i64;
            AtomicResultsMessage::last(rows, final_row)
        } else {
            AtomicResultsMessage::partial(rows)
        };
        message = message
            .with_implicit_close(self.implicit_close)
            .with_cache_scope(self.cache_scope);
        if first {
            if let Some(warning) = &self.warning {
                message = message.with_warning(warning.clone());
            }
        }
        Ok(message)
    }

    async fn cancel(&self, id: &AtomicRequestId) -> EngineResult<()> {
        self.calls.lock().cancelled.push(*id);
        Ok(())
    }

    async fn close(&self, id: &AtomicRequestId) -> EngineResult<()> {
        self.calls.lock().closed.push(*id);
        self.executions.lock().remove(id);
        Ok(())
    }
}
