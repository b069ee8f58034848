// SPDX-License-Identifier: Apache-2.0

//! Transaction context attached to atomic requests.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    #[default]
    None,
    Local,
    Global,
}

/// Opaque transaction handle supplied by the transaction service.
///
/// Only the scope is inspected here; the id is used to serialize executions
/// that share the transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionContext {
    pub transaction_id: String,
    pub scope: TransactionScope,
}

impl TransactionContext {
    pub fn new(transaction_id: impl Into<String>, scope: TransactionScope) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            scope,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.scope != TransactionScope::None
    }
}
