// SPDX-License-Identifier: Apache-2.0

//! Collaborator interfaces consumed by the engine core.
//!
//! Resolution, metadata, entitlements, connectors and transactions all live
//! outside this crate; the engine only talks to them through these traits.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::{Command, MetadataId};
use crate::envelope::{AtomicRequestMessage, AtomicResultsMessage};
use crate::error::EngineResult;
use crate::ids::{AtomicRequestId, SessionId};
use crate::session::VdbRef;
use crate::transaction::TransactionContext;

/// Action a session attempts on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Read,
    Create,
    Update,
    Delete,
}

impl AuthAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthAction::Read => "READ",
            AuthAction::Create => "CREATE",
            AuthAction::Update => "UPDATE",
            AuthAction::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clause kind reported to the entitlement service for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditContext {
    Query,
    Insert,
    Update,
    Delete,
    Procedure,
}

impl AuditContext {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditContext::Query => "query",
            AuditContext::Insert => "insert",
            AuditContext::Update => "update",
            AuditContext::Delete => "delete",
            AuditContext::Procedure => "procedure",
        }
    }
}

/// Turns SQL text into a resolved command for a VDB.
pub trait Resolver: Send + Sync {
    fn resolve(&self, sql: &str, vdb: &VdbRef) -> EngineResult<Command>;
}

/// Catalog lookups needed by the validators and the planner.
pub trait MetadataService: Send + Sync {
    /// Fully-qualified name of a catalog or temporary object.
    fn full_name(&self, id: &MetadataId) -> EngineResult<String>;

    /// Model that owns a group, element or procedure.
    fn model_of(&self, id: &MetadataId) -> EngineResult<MetadataId>;

    /// Resolves a fully-qualified group name (used for `lookup`).
    fn resolve_group(&self, name: &str) -> EngineResult<MetadataId>;

    /// Resolves an element of a group by its short name.
    fn resolve_element(&self, group: &MetadataId, name: &str) -> EngineResult<MetadataId>;

    /// Whether a model is public in the given VDB version.
    fn is_model_public(&self, vdb: &VdbRef, model: &MetadataId) -> EngineResult<bool>;

    /// Connector binding that serves a model in the given VDB version.
    fn connector_binding(&self, vdb: &VdbRef, model: &MetadataId) -> EngineResult<String>;
}

/// Answers "which of these resources may this session not touch".
#[async_trait]
pub trait EntitlementService: Send + Sync {
    async fn inaccessible(
        &self,
        session: SessionId,
        action: AuthAction,
        resources: &BTreeSet<String>,
        context: AuditContext,
    ) -> EngineResult<BTreeSet<String>>;
}

/// Pull-style connector to one kind of data source.
///
/// Every call is keyed by the atomic request id so a single connector can
/// serve many concurrent executions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Binding name this connector is registered under.
    fn binding_name(&self) -> &str;

    /// Starts executing the fragment.
    async fn execute(&self, request: AtomicRequestMessage) -> EngineResult<()>;

    /// Returns the next batch; suspends until one is available.
    async fn more(&self, id: &AtomicRequestId) -> EngineResult<AtomicResultsMessage>;

    /// Best-effort cancellation; results may still arrive afterwards.
    async fn cancel(&self, id: &AtomicRequestId) -> EngineResult<()>;

    /// Releases everything held for the execution.
    async fn close(&self, id: &AtomicRequestId) -> EngineResult<()>;
}

/// Supplies the transaction a session is currently enlisted in.
pub trait TransactionService: Send + Sync {
    fn current(&self, session: SessionId) -> Option<TransactionContext>;
}
