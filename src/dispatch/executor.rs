// SPDX-License-Identifier: Apache-2.0

//! Dispatch executor
//!
//! Turns a planned request into atomic requests, runs them against their
//! connectors and assembles the results. Owns the process-wide execution
//! counter and the execution table used for cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{timeout, Duration};
use tracing::{debug, info, instrument, warn};

use tessera_core::envelope::{CacheScope, RequestMessage};
use tessera_core::{
    AtomicRequestId, AtomicRequestMessage, Connector, EngineError, EngineResult, ExecutionCounter,
    RequestId, SessionId, TransactionContext,
};

use crate::config::DispatchConfig;
use crate::dispatch::lanes::TransactionLanes;
use crate::dispatch::registry::ConnectorRegistry;
use crate::dispatch::types::{narrowest, FragmentResult, PlannedFragment, RequestResults};
use crate::metrics;
use crate::session::{SessionCloseReason, SessionListener};

/// Receives connector warnings as they arrive, before the request completes.
pub type WarningSink = UnboundedSender<(RequestId, String)>;

struct AtomicEntry {
    id: AtomicRequestId,
    binding: String,
    cancelled: bool,
}

struct RequestEntry {
    /// Execution counts of the request's atomic requests.
    atomics: Vec<u64>,
    cancelled: bool,
    completed: bool,
}

/// Live executions, keyed by request and by atomic execution count.
#[derive(Default)]
struct ExecutionTable {
    requests: HashMap<RequestId, RequestEntry>,
    atomics: HashMap<u64, AtomicEntry>,
}

/// Outcome of one fragment, before partial-result policy is applied.
enum FragmentOutcome {
    Done(FragmentResult, Vec<String>, CacheScope),
    Failed(AtomicRequestId, String, EngineError),
}

/// Atomic requests registered by [`DispatchCore::prepare`], not yet running.
#[derive(Debug)]
pub struct PreparedRequest {
    request_id: RequestId,
    messages: Vec<AtomicRequestMessage>,
}

impl PreparedRequest {
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

pub struct DispatchCore {
    registry: ConnectorRegistry,
    counter: ExecutionCounter,
    config: DispatchConfig,
    table: Mutex<ExecutionTable>,
    lanes: TransactionLanes,
}

impl DispatchCore {
    pub fn new(registry: ConnectorRegistry, config: DispatchConfig) -> Self {
        Self {
            registry,
            counter: ExecutionCounter::new(),
            config,
            table: Mutex::new(ExecutionTable::default()),
            lanes: TransactionLanes::new(),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Next value the execution counter will hand out.
    pub fn next_execution_count(&self) -> u64 {
        self.counter.peek()
    }

    fn fetch_ttl(&self) -> Duration {
        Duration::from_millis(self.config.fetch_timeout_ms)
    }

    /// Runs every fragment of a request and returns the combined results.
    ///
    /// The request stays in the execution table until `close_request`.
    pub async fn execute(
        self: &Arc<Self>,
        request_id: RequestId,
        request: &RequestMessage,
        fragments: Vec<PlannedFragment>,
        transaction: Option<TransactionContext>,
        warnings: Option<WarningSink>,
    ) -> EngineResult<RequestResults> {
        let prepared = self.prepare(request_id, request, fragments, transaction)?;
        self.run(prepared, request, warnings).await
    }

    /// Mints the atomic requests and enters them in the execution table, so
    /// a session close from here on cancels them.
    pub fn prepare(
        &self,
        request_id: RequestId,
        request: &RequestMessage,
        fragments: Vec<PlannedFragment>,
        transaction: Option<TransactionContext>,
    ) -> EngineResult<PreparedRequest> {
        let messages = fragments
            .into_iter()
            .map(|fragment| {
                AtomicRequestMessage::new(
                    request_id,
                    request,
                    fragment.node_id,
                    fragment.target,
                    transaction.clone(),
                    &self.counter,
                )
            })
            .collect::<EngineResult<Vec<_>>>()?;
        self.register(request_id, &messages)?;
        Ok(PreparedRequest {
            request_id,
            messages,
        })
    }

    /// Drops a prepared request that will never run.
    pub fn abandon(&self, prepared: PreparedRequest) {
        let mut table = self.table.lock();
        for message in &prepared.messages {
            table
                .atomics
                .remove(&message.atomic_request_id().execution_count());
        }
        table.requests.remove(&prepared.request_id);
        debug!(request = %prepared.request_id, "Prepared request abandoned");
    }

    #[instrument(skip_all, fields(request = %prepared.request_id, fragments = prepared.messages.len()))]
    pub async fn run(
        self: &Arc<Self>,
        prepared: PreparedRequest,
        request: &RequestMessage,
        warnings: Option<WarningSink>,
    ) -> EngineResult<RequestResults> {
        let PreparedRequest {
            request_id,
            messages,
        } = prepared;
        for message in &messages {
            metrics::record_atomic_request();
            debug!(atomic = %message.atomic_request_id(), binding = message.connector_binding(), "Atomic request dispatched");
        }

        let serial = messages.iter().any(AtomicRequestMessage::is_serial);
        let partial_allowed = request.partial_results;
        let outcomes = if serial {
            self.run_serial(messages, warnings.clone()).await
        } else {
            self.run_parallel(messages, warnings.clone()).await?
        };

        let mut results = RequestResults {
            request_id,
            fragments: Vec::with_capacity(outcomes.len()),
            warnings: Vec::new(),
            cache_scope: CacheScope::Vdb,
        };
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                FragmentOutcome::Done(fragment, fragment_warnings, scope) => {
                    results.fragments.push(fragment);
                    results.warnings.extend(fragment_warnings);
                    results.cache_scope = narrowest(results.cache_scope, scope);
                }
                FragmentOutcome::Failed(id, binding, error) => {
                    let recoverable = matches!(
                        error,
                        EngineError::ConnectorFailure { .. } | EngineError::Timeout { .. }
                    );
                    if partial_allowed && recoverable {
                        let warning = format!("fragment {id} on {binding} failed: {error}");
                        warn!(atomic = %id, error = %error, "Fragment failed; continuing with partial results");
                        if let Some(sink) = &warnings {
                            let _ = sink.send((request_id, warning.clone()));
                        }
                        results.warnings.push(warning);
                    } else if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }

        if self.is_request_cancelled(&request_id) {
            first_error = Some(EngineError::Cancelled);
        }
        if let Some(error) = first_error {
            self.cancel_request(&request_id).await;
            self.mark_completed(&request_id);
            return Err(error);
        }

        if results.fragments.is_empty() {
            results.cache_scope = CacheScope::None;
        }
        self.mark_completed(&request_id);
        info!(rows = results.row_count(), warnings = results.warnings.len(), "Request completed");
        Ok(results)
    }

    fn register(&self, request_id: RequestId, messages: &[AtomicRequestMessage]) -> EngineResult<()> {
        let mut table = self.table.lock();
        if table.requests.contains_key(&request_id) {
            return Err(EngineError::invalid_argument(format!(
                "request {request_id} is already executing"
            )));
        }
        let mut atomics = Vec::with_capacity(messages.len());
        for message in messages {
            let id = *message.atomic_request_id();
            atomics.push(id.execution_count());
            table.atomics.insert(
                id.execution_count(),
                AtomicEntry {
                    id,
                    binding: message.connector_binding().to_string(),
                    cancelled: false,
                },
            );
        }
        table.requests.insert(
            request_id,
            RequestEntry {
                atomics,
                cancelled: false,
                completed: false,
            },
        );
        Ok(())
    }

    async fn run_serial(
        self: &Arc<Self>,
        messages: Vec<AtomicRequestMessage>,
        warnings: Option<WarningSink>,
    ) -> Vec<FragmentOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let _lane = match message.transaction_context() {
                Some(context) if context.is_transactional() => {
                    Some(self.lanes.acquire(&context.transaction_id).await)
                }
                _ => None,
            };
            outcomes.push(self.run_fragment(message, warnings.clone()).await);
        }
        outcomes
    }

    async fn run_parallel(
        self: &Arc<Self>,
        messages: Vec<AtomicRequestMessage>,
        warnings: Option<WarningSink>,
    ) -> EngineResult<Vec<FragmentOutcome>> {
        let mut handles = Vec::with_capacity(messages.len());
        for message in messages {
            let core = Arc::clone(self);
            let warnings = warnings.clone();
            handles.push(tokio::spawn(async move {
                core.run_fragment(message, warnings).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            let outcome = handle
                .await
                .map_err(|e| EngineError::internal(format!("Fragment task panicked: {e}")))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn run_fragment(
        &self,
        message: AtomicRequestMessage,
        warnings: Option<WarningSink>,
    ) -> FragmentOutcome {
        let id = *message.atomic_request_id();
        let binding = message.connector_binding().to_string();
        let model_name = message.model_name().to_string();

        let Some(connector) = self.registry.get(&binding) else {
            self.finish_atomic(&id);
            let error = EngineError::connector(&binding, "no connector is registered for this binding");
            return FragmentOutcome::Failed(id, binding, error);
        };

        let outcome = self
            .pull(&*connector, message, warnings)
            .await
            .map(|(rows, truncated, fragment_warnings, scope, implicitly_closed)| {
                (
                    FragmentResult {
                        atomic_request_id: id,
                        connector_binding: binding.clone(),
                        model_name,
                        rows,
                        truncated,
                    },
                    fragment_warnings,
                    scope,
                    implicitly_closed,
                )
            });

        let implicitly_closed = matches!(&outcome, Ok((_, _, _, true)));
        if !implicitly_closed {
            if let Err(e) = connector.close(&id).await {
                warn!(atomic = %id, error = %e, "Connector close failed");
            }
        }
        self.finish_atomic(&id);

        match outcome {
            Ok((result, fragment_warnings, scope, _)) => {
                FragmentOutcome::Done(result, fragment_warnings, scope)
            }
            Err(error) => FragmentOutcome::Failed(id, binding, error),
        }
    }

    /// Executes the atomic request and pulls batches until the final row, the
    /// row cap, or cancellation.
    #[allow(clippy::type_complexity)]
    async fn pull(
        &self,
        connector: &dyn Connector,
        message: AtomicRequestMessage,
        warnings: Option<WarningSink>,
    ) -> EngineResult<(Vec<tessera_core::Row>, bool, Vec<String>, CacheScope, bool)> {
        let id = *message.atomic_request_id();
        let binding = message.connector_binding().to_string();
        let max_rows = message.max_result_rows();
        let fail_on_max = message.exception_on_max_rows();

        if self.is_atomic_cancelled(&id) {
            return Err(EngineError::Cancelled);
        }
        connector
            .execute(message)
            .await
            .map_err(|e| as_connector_failure(&binding, e))?;

        let ttl = self.fetch_ttl();
        let mut rows = Vec::new();
        let mut fragment_warnings = Vec::new();
        let mut scope = CacheScope::Vdb;
        loop {
            let batch = match timeout(ttl, connector.more(&id)).await {
                Ok(result) => result.map_err(|e| as_connector_failure(&binding, e))?,
                Err(_) => {
                    metrics::record_fetch_timeout();
                    return Err(EngineError::Timeout {
                        timeout_ms: self.config.fetch_timeout_ms,
                    });
                }
            };

            if self.is_atomic_cancelled(&id) {
                metrics::record_late_result();
                debug!(atomic = %id, "Discarding results of cancelled atomic request");
                return Err(EngineError::Cancelled);
            }

            for warning in &batch.warnings {
                if let Some(sink) = &warnings {
                    let _ = sink.send((*id.request(), warning.clone()));
                }
            }
            fragment_warnings.extend(batch.warnings.iter().cloned());
            scope = narrowest(scope, batch.cache_scope);
            let is_final = batch.is_final();
            let implicit_close = batch.supports_implicit_close;
            rows.extend(batch.into_rows());

            if let Some(max) = max_rows {
                if rows.len() as u64 > max {
                    if fail_on_max {
                        return Err(EngineError::invalid_argument(format!(
                            "atomic request {id} exceeded the maximum of {max} rows"
                        )));
                    }
                    rows.truncate(max as usize);
                    return Ok((rows, true, fragment_warnings, scope, false));
                }
            }

            if is_final {
                return Ok((rows, false, fragment_warnings, scope, implicit_close));
            }
        }
    }

    fn finish_atomic(&self, id: &AtomicRequestId) {
        self.table.lock().atomics.remove(&id.execution_count());
    }

    fn mark_completed(&self, request_id: &RequestId) {
        if let Some(entry) = self.table.lock().requests.get_mut(request_id) {
            entry.completed = true;
        }
    }

    fn is_atomic_cancelled(&self, id: &AtomicRequestId) -> bool {
        let table = self.table.lock();
        match table.atomics.get(&id.execution_count()) {
            Some(entry) => entry.cancelled,
            // Not in the table any more: nothing may consume its results.
            None => true,
        }
    }

    /// A request dropped from the table mid-run counts as cancelled.
    fn is_request_cancelled(&self, request_id: &RequestId) -> bool {
        self.table
            .lock()
            .requests
            .get(request_id)
            .map_or(true, |entry| entry.cancelled)
    }

    /// Flags the atomic request cancelled and returns the connector to notify.
    fn mark_atomic_cancelled(&self, table: &mut ExecutionTable, count: u64) -> Option<(Arc<dyn Connector>, AtomicRequestId)> {
        let entry = table.atomics.get_mut(&count)?;
        if entry.cancelled {
            return None;
        }
        entry.cancelled = true;
        let connector = self.registry.get(&entry.binding)?;
        Some((connector, entry.id))
    }

    fn mark_request_cancelled(&self, request_id: &RequestId) -> Option<Vec<(Arc<dyn Connector>, AtomicRequestId)>> {
        let mut table = self.table.lock();
        let counts = {
            let entry = table.requests.get_mut(request_id)?;
            if entry.completed {
                return Some(Vec::new());
            }
            entry.cancelled = true;
            entry.atomics.clone()
        };
        Some(
            counts
                .into_iter()
                .filter_map(|count| self.mark_atomic_cancelled(&mut table, count))
                .collect(),
        )
    }

    /// Best-effort cancellation of one atomic request. Results that arrive
    /// afterwards are discarded.
    #[instrument(skip(self), fields(atomic = %id))]
    pub async fn cancel_atomic(&self, id: &AtomicRequestId) -> bool {
        let target = {
            let mut table = self.table.lock();
            self.mark_atomic_cancelled(&mut table, id.execution_count())
        };
        match target {
            Some((connector, id)) => {
                notify_cancel(connector, id).await;
                true
            }
            None => false,
        }
    }

    /// Cancels every outstanding atomic request of the request. Returns
    /// whether the request was known.
    #[instrument(skip(self), fields(request = %request_id))]
    pub async fn cancel_request(&self, request_id: &RequestId) -> bool {
        let Some(targets) = self.mark_request_cancelled(request_id) else {
            return false;
        };
        for (connector, id) in targets {
            notify_cancel(connector, id).await;
        }
        true
    }

    /// Cancels all outstanding requests of a session without ending it.
    /// Returns how many requests were cancelled.
    #[instrument(skip(self), fields(session = %session))]
    pub async fn cancel_queries(&self, session: SessionId) -> usize {
        let mut cancelled = 0;
        for request_id in self.outstanding_requests(session) {
            if self.cancel_request(&request_id).await {
                cancelled += 1;
            }
        }
        cancelled
    }

    fn outstanding_requests(&self, session: SessionId) -> Vec<RequestId> {
        self.table
            .lock()
            .requests
            .iter()
            .filter(|(id, entry)| id.session() == Some(session) && !entry.completed)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Releases the request's bookkeeping, cancelling it first if it is
    /// still running. Returns whether the request was known.
    pub async fn close_request(&self, request_id: &RequestId) -> bool {
        let running = self
            .table
            .lock()
            .requests
            .get(request_id)
            .map(|entry| !entry.completed);
        match running {
            None => false,
            Some(still_running) => {
                if still_running {
                    self.cancel_request(request_id).await;
                }
                self.table.lock().requests.remove(request_id);
                true
            }
        }
    }

    /// Number of requests currently tracked (running or awaiting close).
    pub fn tracked_requests(&self) -> usize {
        self.table.lock().requests.len()
    }
}

async fn notify_cancel(connector: Arc<dyn Connector>, id: AtomicRequestId) {
    metrics::record_cancel();
    if let Err(e) = connector.cancel(&id).await {
        warn!(atomic = %id, error = %e, "Connector cancel failed");
    }
}

fn as_connector_failure(binding: &str, error: EngineError) -> EngineError {
    match error {
        EngineError::ConnectorFailure { .. } | EngineError::Cancelled | EngineError::Timeout { .. } => {
            error
        }
        other => EngineError::connector(binding, other.to_string()),
    }
}

impl SessionListener for DispatchCore {
    /// Cancels the session's running requests and drops its bookkeeping.
    fn session_closed(&self, session: SessionId, reason: SessionCloseReason) {
        let mut targets = Vec::new();
        {
            let requests: Vec<RequestId> = self
                .table
                .lock()
                .requests
                .keys()
                .filter(|id| id.session() == Some(session))
                .copied()
                .collect();
            for request_id in &requests {
                if let Some(found) = self.mark_request_cancelled(request_id) {
                    targets.extend(found);
                }
            }
            let mut table = self.table.lock();
            for request_id in &requests {
                table.requests.remove(request_id);
            }
        }

        if targets.is_empty() {
            return;
        }
        info!(session = %session, ?reason, atomics = targets.len(), "Cancelling queries of closed session");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for (connector, id) in targets {
                        notify_cancel(connector, id).await;
                    }
                });
            }
            Err(_) => warn!(session = %session, "No runtime available to notify connectors of cancellation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::memory::MemoryConnector;
    use tessera_core::command::{Command, GroupSymbol, MetadataId, Query};
    use tessera_core::envelope::FragmentTarget;
    use tessera_core::{TransactionScope, Value};

    fn fragment(node_id: u32, binding: &str, group: &str) -> PlannedFragment {
        PlannedFragment {
            node_id,
            target: FragmentTarget {
                connector_binding: binding.to_string(),
                model_name: group.split('.').next().unwrap_or_default().to_string(),
                command: Command::Query(Query::new(
                    vec![],
                    vec![GroupSymbol::new(group, MetadataId::catalog(group))],
                )),
            },
        }
    }

    fn rows(n: i64) -> Vec<tessera_core::Row> {
        (0..n).map(|i| vec![Value::Int(i)]).collect()
    }

    fn core_with(connectors: Vec<Arc<MemoryConnector>>, fetch_timeout_ms: u64) -> Arc<DispatchCore> {
        let mut registry = ConnectorRegistry::new();
        for connector in connectors {
            registry.register(connector);
        }
        Arc::new(DispatchCore::new(registry, DispatchConfig { fetch_timeout_ms }))
    }

    fn request_id(execution: u64) -> RequestId {
        RequestId::new(SessionId(7), execution)
    }

    #[tokio::test]
    async fn combines_fragments_and_closes_explicitly() {
        let pg = Arc::new(MemoryConnector::new("pg").with_cache_scope(CacheScope::User));
        pg.set_rows("a.t1", rows(3));
        let mongo = Arc::new(MemoryConnector::new("mongo").with_warning("index missing"));
        mongo.set_rows("b.t2", rows(2));
        let core = core_with(vec![pg.clone(), mongo.clone()], 1_000);

        let mut request = RequestMessage::new(1, "SELECT ...");
        request.fetch_size = 2;
        let results = core
            .execute(
                request_id(1),
                &request,
                vec![fragment(0, "pg", "a.t1"), fragment(1, "mongo", "b.t2")],
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(results.fragments.len(), 2);
        assert_eq!(results.row_count(), 5);
        assert_eq!(results.warnings, vec!["index missing".to_string()]);
        assert_eq!(results.cache_scope, CacheScope::User);
        assert_eq!(pg.closed().len(), 1);
        assert_eq!(mongo.closed().len(), 1);

        assert!(core.close_request(&request_id(1)).await);
        assert_eq!(core.tracked_requests(), 0);
    }

    #[tokio::test]
    async fn implicit_close_skips_the_close_call() {
        let pg = Arc::new(MemoryConnector::new("pg").with_implicit_close(true));
        pg.set_rows("a.t1", rows(1));
        let core = core_with(vec![pg.clone()], 1_000);
        core.execute(
            request_id(1),
            &RequestMessage::new(1, "SELECT ..."),
            vec![fragment(0, "pg", "a.t1")],
            None,
            None,
        )
        .await
        .unwrap();
        assert!(pg.closed().is_empty());
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        let core = core_with(vec![pg], 1_000);
        let request = RequestMessage::new(1, "SELECT ...");
        core.execute(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap();
        let err = core
            .execute(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn max_rows_truncates_or_fails() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        pg.set_rows("a.t1", rows(10));
        let core = core_with(vec![pg.clone()], 1_000);

        let mut request = RequestMessage::new(1, "SELECT ...");
        request.fetch_size = 4;
        request.max_rows = Some(5);
        let results = core
            .execute(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap();
        assert_eq!(results.row_count(), 5);
        assert!(results.fragments[0].truncated);
        assert_eq!(pg.closed().len(), 1);

        request.exception_on_max_rows = true;
        let err = core
            .execute(request_id(2), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn partial_results_turn_failures_into_warnings() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        pg.set_rows("a.t1", rows(2));
        let mongo = Arc::new(MemoryConnector::new("mongo"));
        mongo.fail_on("b.t2");
        let core = core_with(vec![pg, mongo], 1_000);
        let fragments = || vec![fragment(0, "pg", "a.t1"), fragment(1, "mongo", "b.t2")];

        let mut request = RequestMessage::new(1, "SELECT ...");
        let err = core
            .execute(request_id(1), &request, fragments(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ConnectorFailure { .. }));

        request.partial_results = true;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let results = core
            .execute(request_id(2), &request, fragments(), None, Some(tx))
            .await
            .unwrap();
        assert_eq!(results.row_count(), 2);
        assert_eq!(results.warnings.len(), 1);
        let (warned_request, _) = rx.recv().await.unwrap();
        assert_eq!(warned_request, request_id(2));
    }

    #[tokio::test]
    async fn slow_pull_times_out() {
        let slow = Arc::new(MemoryConnector::new("pg").with_pull_delay(Duration::from_millis(200)));
        slow.set_rows("a.t1", rows(1));
        let core = core_with(vec![slow], 20);
        let err = core
            .execute(
                request_id(1),
                &RequestMessage::new(1, "SELECT ..."),
                vec![fragment(0, "pg", "a.t1")],
                None,
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Timeout { timeout_ms: 20 });
    }

    #[tokio::test]
    async fn cancelled_request_discards_late_results() {
        let slow = Arc::new(MemoryConnector::new("pg").with_pull_delay(Duration::from_millis(100)));
        slow.set_rows("a.t1", rows(1));
        let core = core_with(vec![slow.clone()], 5_000);

        let running = {
            let core = Arc::clone(&core);
            tokio::spawn(async move {
                core.execute(
                    request_id(1),
                    &RequestMessage::new(1, "SELECT ..."),
                    vec![fragment(0, "pg", "a.t1")],
                    None,
                    None,
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(core.cancel_queries(SessionId(7)).await, 1);

        let err = running.await.unwrap().unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert_eq!(slow.cancelled().len(), 1);
        assert_eq!(core.cancel_queries(SessionId(7)).await, 0);
    }

    #[tokio::test]
    async fn transactional_fragments_run_serially() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        pg.set_rows("a.t1", rows(1));
        pg.set_rows("a.t2", rows(1));
        let core = core_with(vec![pg.clone()], 1_000);
        let tx = TransactionContext::new("tx-1", TransactionScope::Local);

        core.execute(
            request_id(1),
            &RequestMessage::new(1, "SELECT ..."),
            vec![fragment(0, "pg", "a.t1"), fragment(1, "pg", "a.t2")],
            Some(tx),
            None,
        )
        .await
        .unwrap();

        let executed = pg.executed();
        assert_eq!(executed.len(), 2);
        assert!(executed[0].execution_count() < executed[1].execution_count());
        assert_eq!(executed[0].node_id(), 0);
    }

    #[tokio::test]
    async fn zero_fetch_size_dispatches_nothing() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        let core = core_with(vec![pg.clone()], 1_000);
        let mut request = RequestMessage::new(1, "SELECT ...");
        request.fetch_size = 0;
        let err = core
            .execute(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument { .. }));
        assert!(pg.executed().is_empty());
        assert_eq!(core.tracked_requests(), 0);
    }

    #[tokio::test]
    async fn session_close_drops_bookkeeping() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        let core = core_with(vec![pg], 1_000);
        core.execute(
            request_id(1),
            &RequestMessage::new(1, "SELECT ..."),
            vec![fragment(0, "pg", "a.t1")],
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(core.tracked_requests(), 1);
        core.session_closed(SessionId(7), SessionCloseReason::Logoff);
        assert_eq!(core.tracked_requests(), 0);
    }

    #[tokio::test]
    async fn session_closed_after_prepare_cancels_the_run() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        pg.set_rows("a.t1", rows(2));
        let core = core_with(vec![pg.clone()], 1_000);
        let request = RequestMessage::new(1, "SELECT ...");

        let prepared = core
            .prepare(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None)
            .unwrap();
        assert_eq!(core.tracked_requests(), 1);
        core.session_closed(SessionId(7), SessionCloseReason::Logoff);

        let err = core.run(prepared, &request, None).await.unwrap_err();
        assert_eq!(err, EngineError::Cancelled);
        assert!(pg.executed().is_empty());
        assert_eq!(core.tracked_requests(), 0);
    }

    #[tokio::test]
    async fn abandoned_request_leaves_no_bookkeeping() {
        let pg = Arc::new(MemoryConnector::new("pg"));
        let core = core_with(vec![pg], 1_000);
        let request = RequestMessage::new(1, "SELECT ...");
        let prepared = core
            .prepare(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None)
            .unwrap();
        core.abandon(prepared);
        assert_eq!(core.tracked_requests(), 0);
        core.execute(request_id(1), &request, vec![fragment(0, "pg", "a.t1")], None, None)
            .await
            .unwrap();
    }
}
