// SPDX-License-Identifier: Apache-2.0

//! Per-session transaction bookkeeping.
//!
//! Only tracks which transaction a session is enlisted in; commit and
//! rollback semantics belong to the connectors.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use tessera_core::{
    EngineError, EngineResult, SessionId, TransactionContext, TransactionScope, TransactionService,
};

use crate::session::{SessionCloseReason, SessionListener};

#[derive(Default)]
pub struct TransactionRegistry {
    active: RwLock<HashMap<SessionId, TransactionContext>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, session: SessionId, scope: TransactionScope) -> EngineResult<TransactionContext> {
        if scope == TransactionScope::None {
            return Err(EngineError::invalid_argument(
                "a transaction needs a local or global scope",
            ));
        }
        let mut active = self.active.write();
        if active.contains_key(&session) {
            return Err(EngineError::invalid_argument(format!(
                "session {session} is already in a transaction"
            )));
        }
        let context = TransactionContext::new(Uuid::new_v4().to_string(), scope);
        active.insert(session, context.clone());
        info!(session = %session, transaction = %context.transaction_id, "Transaction started");
        Ok(context)
    }

    pub fn commit(&self, session: SessionId) -> EngineResult<TransactionContext> {
        self.finish(session, "committed")
    }

    pub fn rollback(&self, session: SessionId) -> EngineResult<TransactionContext> {
        self.finish(session, "rolled back")
    }

    fn finish(&self, session: SessionId, outcome: &str) -> EngineResult<TransactionContext> {
        let context = self.active.write().remove(&session).ok_or_else(|| {
            EngineError::invalid_argument(format!("session {session} has no open transaction"))
        })?;
        info!(session = %session, transaction = %context.transaction_id, "Transaction {}", outcome);
        Ok(context)
    }
}

impl TransactionService for TransactionRegistry {
    fn current(&self, session: SessionId) -> Option<TransactionContext> {
        self.active.read().get(&session).cloned()
    }
}

impl SessionListener for TransactionRegistry {
    fn session_closed(&self, session: SessionId, _reason: SessionCloseReason) {
        if let Some(context) = self.active.write().remove(&session) {
            info!(session = %session, transaction = %context.transaction_id, "Transaction abandoned with its session");
        }
    }
}
