// SPDX-License-Identifier: Apache-2.0

//! Types shared by the planner, dispatch core and the transport protocol.

use serde::{Deserialize, Serialize};

use tessera_core::envelope::{CacheScope, FragmentTarget};
use tessera_core::{AtomicRequestId, RequestId, Row};

/// One plan node bound for exactly one connector.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedFragment {
    pub node_id: u32,
    pub target: FragmentTarget,
}

/// Rows delivered by one atomic request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FragmentResult {
    pub atomic_request_id: AtomicRequestId,
    pub connector_binding: String,
    pub model_name: String,
    pub rows: Vec<Row>,
    /// The max-row cap cut the result short.
    pub truncated: bool,
}

/// Combined outcome of a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResults {
    pub request_id: RequestId,
    pub fragments: Vec<FragmentResult>,
    pub warnings: Vec<String>,
    /// Narrowest scope reported by any fragment.
    pub cache_scope: CacheScope,
}

impl RequestResults {
    pub fn row_count(&self) -> usize {
        self.fragments.iter().map(|f| f.rows.len()).sum()
    }
}

/// Orders scopes by how widely a result may be shared.
pub(crate) fn narrowest(a: CacheScope, b: CacheScope) -> CacheScope {
    fn width(scope: CacheScope) -> u8 {
        match scope {
            CacheScope::None => 0,
            CacheScope::Session => 1,
            CacheScope::User => 2,
            CacheScope::Vdb => 3,
        }
    }
    if width(a) <= width(b) {
        a
    } else {
        b
    }
}
