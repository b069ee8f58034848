// SPDX-License-Identifier: Apache-2.0

//! Authorization Validator
//!
//! Checks every resource a command touches against the entitlement service
//! with one batched call per action, before anything is dispatched.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use tessera_core::command::Command;
use tessera_core::{
    AuditContext, AuthAction, EngineError, EngineResult, EntitlementService, MetadataService,
    SessionId,
};

use crate::metrics;
use crate::validator::symbols::{self, metadata_unavailable, ResolvedRef, SymbolKind};

/// Procedures every session may execute without an entitlement.
pub const DEFAULT_EXEMPT_PROCEDURES: &[&str] = &["System.getVDBResourcePaths"];

/// Case-insensitive allow-list of fully-qualified procedure names.
#[derive(Debug, Default)]
pub struct ExemptProcedures {
    names: RwLock<HashSet<String>>,
}

impl ExemptProcedures {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: RwLock::new(
                names
                    .into_iter()
                    .map(|n| n.as_ref().to_ascii_lowercase())
                    .collect(),
            ),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_EXEMPT_PROCEDURES.iter().copied())
    }

    pub fn add(&self, name: &str) {
        self.names.write().insert(name.to_ascii_lowercase());
    }

    pub fn remove(&self, name: &str) -> bool {
        self.names.write().remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(&name.to_ascii_lowercase())
    }
}

pub struct AuthorizationValidator {
    metadata: Arc<dyn MetadataService>,
    entitlements: Arc<dyn EntitlementService>,
    exempt: Arc<ExemptProcedures>,
}

/// Names to check for one action, with the audit tag of its first use.
struct ActionBatch {
    context: AuditContext,
    names: BTreeSet<String>,
}

impl AuthorizationValidator {
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        entitlements: Arc<dyn EntitlementService>,
        exempt: Arc<ExemptProcedures>,
    ) -> Self {
        Self {
            metadata,
            entitlements,
            exempt,
        }
    }

    pub fn exempt_procedures(&self) -> &Arc<ExemptProcedures> {
        &self.exempt
    }

    /// Fails with a single `AuthorizationDenied` if any referenced resource is
    /// inaccessible. The error never names the resources.
    #[instrument(skip(self, command), fields(session = %session, command = command.kind()))]
    pub async fn validate(&self, command: &Command, session: SessionId) -> EngineResult<()> {
        let refs = symbols::expand(symbols::collect(command), self.metadata.as_ref())?;
        let batches = self.batch_by_action(&refs)?;

        for (action, batch) in batches {
            if batch.names.is_empty() {
                continue;
            }
            let denied = self
                .entitlements
                .inaccessible(session, action, &batch.names, batch.context)
                .await
                .map_err(|e| match e {
                    EngineError::ComponentUnavailable { .. } => e,
                    other => EngineError::unavailable("entitlements", other.to_string()),
                })?;

            if !denied.is_empty() {
                metrics::record_authorization_denial();
                warn!(action = %action, denied = denied.len(), "Authorization denied");
                debug!(resources = ?denied, "Inaccessible resources");
                return Err(EngineError::authorization_denied(format!(
                    "session {session} is not entitled to {action} one or more resources referenced by this {}",
                    command.kind()
                )));
            }
        }
        Ok(())
    }

    fn batch_by_action(&self, refs: &[ResolvedRef]) -> EngineResult<BTreeMap<AuthAction, ActionBatch>> {
        let mut batches: BTreeMap<AuthAction, ActionBatch> = BTreeMap::new();
        for r in refs {
            if r.id.is_temporary() {
                continue;
            }
            let name = self.metadata.full_name(&r.id).map_err(metadata_unavailable)?;
            if r.kind == SymbolKind::Procedure && self.exempt.contains(&name) {
                continue;
            }
            batches
                .entry(r.action)
                .or_insert_with(|| ActionBatch {
                    context: r.context,
                    names: BTreeSet::new(),
                })
                .names
                .insert(name);
        }
        Ok(batches)
    }
}
