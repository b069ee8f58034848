// SPDX-License-Identifier: Apache-2.0

//! Fixed SQL-to-command table.
//!
//! Stands in for a real parser/resolver in embedded deployments and tests.
//! Statements are matched after trimming, collapsing whitespace and ignoring
//! case; registrations are per VDB name.

use std::collections::HashMap;

use parking_lot::RwLock;

use tessera_core::command::Command;
use tessera_core::{EngineError, EngineResult, Resolver, VdbRef};

#[derive(Default)]
pub struct StaticResolver {
    statements: RwLock<HashMap<(String, String), Command>>,
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, vdb_name: &str, sql: &str, command: Command) {
        self.statements
            .write()
            .insert((vdb_name.to_ascii_lowercase(), normalize(sql)), command);
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, sql: &str, vdb: &VdbRef) -> EngineResult<Command> {
        self.statements
            .read()
            .get(&(vdb.name.to_ascii_lowercase(), normalize(sql)))
            .cloned()
            .ok_or_else(|| {
                EngineError::invalid_argument(format!("statement cannot be resolved in VDB {vdb}"))
            })
    }
}
