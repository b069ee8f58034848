// SPDX-License-Identifier: Apache-2.0

//! Visibility Validator
//!
//! Rejects commands that reference a group whose model is private in the
//! session's VDB version.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{instrument, warn};

use tessera_core::command::{Command, Insert, InsertSource, MetadataId};
use tessera_core::{EngineError, EngineResult, MetadataService, VdbRef};

use crate::metrics;
use crate::validator::symbols::{self, metadata_unavailable, SymbolKind};

pub struct VisibilityValidator {
    metadata: Arc<dyn MetadataService>,
}

impl VisibilityValidator {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self { metadata }
    }

    #[instrument(skip(self, command), fields(vdb = %vdb, command = command.kind()))]
    pub fn validate(&self, command: &Command, vdb: &VdbRef) -> EngineResult<()> {
        let refs = symbols::expand(symbols::collect(command), self.metadata.as_ref())?;

        let mut seen: HashSet<&MetadataId> = HashSet::new();
        let groups = refs
            .iter()
            .filter(|r| matches!(r.kind, SymbolKind::Group | SymbolKind::Procedure))
            .map(|r| &r.id)
            .chain(written_groups(command))
            .filter(|id| seen.insert(*id));

        for id in groups {
            if id.is_temporary() {
                return Ok(());
            }
            let model = self.metadata.model_of(id).map_err(metadata_unavailable)?;
            if model.is_temporary() {
                return Ok(());
            }
            let public = self
                .metadata
                .is_model_public(vdb, &model)
                .map_err(metadata_unavailable)?;
            if !public {
                let group = self.metadata.full_name(id).map_err(metadata_unavailable)?;
                metrics::record_visibility_denial();
                warn!(group = %group, model = model.key(), "Group not visible");
                return Err(EngineError::visibility_denied(group));
            }
        }
        Ok(())
    }
}

/// Targets of writes. The access walk only records their elements.
fn written_groups(command: &Command) -> impl Iterator<Item = &MetadataId> {
    let into = match command {
        Command::Query(query) => query.into.as_ref(),
        Command::Insert(Insert {
            source: InsertSource::Query(query),
            ..
        }) => query.into.as_ref(),
        _ => None,
    };
    command
        .target_groups()
        .into_iter()
        .chain(into.map(|into| &into.group))
        .map(|group| &group.metadata_id)
}
