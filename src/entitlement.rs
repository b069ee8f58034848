// SPDX-License-Identifier: Apache-2.0

//! Role-based entitlement service.
//!
//! A grant on `modelA` covers everything below it (`modelA.t1`,
//! `modelA.t1.e1`); a grant on `modelA.t1` covers that group and its elements.

use std::collections::{BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use tessera_core::{AuditContext, AuthAction, EngineResult, EntitlementService, SessionId};

use crate::session::{SessionCloseReason, SessionListener};

#[derive(Default)]
pub struct RoleEntitlements {
    /// role -> (action, lowercased resource prefix)
    roles: RwLock<HashMap<String, HashSet<(AuthAction, String)>>>,
    sessions: RwLock<HashMap<SessionId, HashSet<String>>>,
}

impl RoleEntitlements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, role: &str, action: AuthAction, resource: &str) {
        self.roles
            .write()
            .entry(role.to_string())
            .or_default()
            .insert((action, resource.to_ascii_lowercase()));
    }

    pub fn assign(&self, session: SessionId, role: &str) {
        self.sessions
            .write()
            .entry(session)
            .or_default()
            .insert(role.to_string());
    }

    fn is_allowed(&self, session: SessionId, action: AuthAction, resource: &str) -> bool {
        let sessions = self.sessions.read();
        let Some(assigned) = sessions.get(&session) else {
            return false;
        };
        let resource = resource.to_ascii_lowercase();
        let roles = self.roles.read();
        assigned
            .iter()
            .filter_map(|role| roles.get(role))
            .flatten()
            .any(|(granted_action, prefix)| *granted_action == action && covers(prefix, &resource))
    }
}

fn covers(prefix: &str, resource: &str) -> bool {
    resource == prefix
        || (resource.starts_with(prefix) && resource.as_bytes().get(prefix.len()) == Some(&b'.'))
}

#[async_trait]
impl EntitlementService for RoleEntitlements {
    async fn inaccessible(
        &self,
        session: SessionId,
        action: AuthAction,
        resources: &BTreeSet<String>,
        context: AuditContext,
    ) -> EngineResult<BTreeSet<String>> {
        let denied: BTreeSet<String> = resources
            .iter()
            .filter(|resource| !self.is_allowed(session, action, resource))
            .cloned()
            .collect();
        debug!(
            session = %session,
            action = %action,
            context = context.as_str(),
            checked = resources.len(),
            denied = denied.len(),
            "Entitlement check"
        );
        Ok(denied)
    }
}

impl SessionListener for RoleEntitlements {
    fn session_closed(&self, session: SessionId, _reason: SessionCloseReason) {
        self.sessions.write().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_grants_cover_children_only() {
        let entitlements = RoleEntitlements::new();
        entitlements.grant("analyst", AuthAction::Read, "modelA");
        entitlements.assign(SessionId(1), "analyst");

        let resources = BTreeSet::from([
            "modelA.t1".to_string(),
            "modelA.t1.e1".to_string(),
            "modelAB.t1".to_string(),
        ]);
        let denied = entitlements
            .inaccessible(SessionId(1), AuthAction::Read, &resources, AuditContext::Query)
            .await
            .unwrap();
        assert_eq!(denied, BTreeSet::from(["modelAB.t1".to_string()]));

        let denied = entitlements
            .inaccessible(SessionId(1), AuthAction::Delete, &resources, AuditContext::Delete)
            .await
            .unwrap();
        assert_eq!(denied, resources);
    }

    #[tokio::test]
    async fn closed_sessions_lose_their_roles() {
        let entitlements = RoleEntitlements::new();
        entitlements.grant("admin", AuthAction::Read, "modelA");
        entitlements.assign(SessionId(9), "admin");
        entitlements.session_closed(SessionId(9), SessionCloseReason::Logoff);

        let resources = BTreeSet::from(["modelA.t1".to_string()]);
        let denied = entitlements
            .inaccessible(SessionId(9), AuthAction::Read, &resources, AuditContext::Query)
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);
    }
}
