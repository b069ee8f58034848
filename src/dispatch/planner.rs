// SPDX-License-Identifier: Apache-2.0

//! Fragment planner.
//!
//! Splits a resolved command into one fragment per target model and binds
//! each fragment to the connector that serves its model in the session's VDB.

use std::sync::Arc;

use tessera_core::command::{Command, Expression, GroupSymbol, MetadataId, Query};
use tessera_core::envelope::FragmentTarget;
use tessera_core::{EngineError, EngineResult, MetadataService, VdbRef};

use crate::dispatch::types::PlannedFragment;
use crate::validator::symbols::metadata_unavailable;

pub trait Planner: Send + Sync {
    fn plan(&self, command: &Command, vdb: &VdbRef) -> EngineResult<Vec<PlannedFragment>>;
}

/// Default planner: one fragment per model, no criteria pushdown across
/// models.
pub struct ModelPlanner {
    metadata: Arc<dyn MetadataService>,
}

/// Groups of one model, in order of first appearance.
struct ModelGroups<'a> {
    model: MetadataId,
    groups: Vec<&'a GroupSymbol>,
}

impl ModelPlanner {
    pub fn new(metadata: Arc<dyn MetadataService>) -> Self {
        Self { metadata }
    }

    fn model_of(&self, id: &MetadataId) -> EngineResult<MetadataId> {
        if id.is_temporary() {
            return Err(EngineError::invalid_argument(format!(
                "temporary group {} is not served by any connector",
                id.key()
            )));
        }
        self.metadata.model_of(id).map_err(metadata_unavailable)
    }

    fn target(&self, vdb: &VdbRef, model: &MetadataId, command: Command) -> EngineResult<FragmentTarget> {
        let connector_binding = self
            .metadata
            .connector_binding(vdb, model)
            .map_err(metadata_unavailable)?;
        let model_name = self.metadata.full_name(model).map_err(metadata_unavailable)?;
        Ok(FragmentTarget {
            connector_binding,
            model_name,
            command,
        })
    }

    fn group_by_model<'a>(&self, query: &'a Query) -> EngineResult<Vec<ModelGroups<'a>>> {
        let mut by_model: Vec<ModelGroups<'a>> = Vec::new();
        for group in &query.from {
            let model = self.model_of(&group.metadata_id)?;
            match by_model.iter_mut().find(|m| m.model == model) {
                Some(entry) => entry.groups.push(group),
                None => by_model.push(ModelGroups {
                    model,
                    groups: vec![group],
                }),
            }
        }
        Ok(by_model)
    }

    /// Projection for one model: the select expressions that only reference
    /// that model's elements.
    fn project(&self, query: &Query, model: &MetadataId) -> EngineResult<Vec<Expression>> {
        let mut select = Vec::new();
        for expr in &query.select {
            if let Expression::Element(element) = expr {
                if element.metadata_id.is_temporary() {
                    continue;
                }
                if self.model_of(&element.metadata_id)? == *model {
                    select.push(expr.clone());
                }
            }
        }
        Ok(select)
    }
}

impl Planner for ModelPlanner {
    fn plan(&self, command: &Command, vdb: &VdbRef) -> EngineResult<Vec<PlannedFragment>> {
        let query = match command {
            Command::Query(query) => query,
            other => {
                let target_group = other.target_groups().into_iter().next().ok_or_else(|| {
                    EngineError::invalid_argument(format!("{} has no target", other.kind()))
                })?;
                let model = self.model_of(&target_group.metadata_id)?;
                let target = self.target(vdb, &model, other.clone())?;
                return Ok(vec![PlannedFragment { node_id: 0, target }]);
            }
        };

        let by_model = self.group_by_model(query)?;
        if by_model.len() == 1 {
            let target = self.target(vdb, &by_model[0].model, command.clone())?;
            return Ok(vec![PlannedFragment { node_id: 0, target }]);
        }

        let mut fragments = Vec::with_capacity(by_model.len());
        for (node_id, entry) in by_model.iter().enumerate() {
            let mut fragment = Query::new(
                self.project(query, &entry.model)?,
                entry.groups.iter().map(|g| (*g).clone()).collect(),
            );
            fragment.is_xml = query.is_xml;
            let target = self.target(vdb, &entry.model, Command::Query(fragment))?;
            fragments.push(PlannedFragment {
                node_id: node_id as u32,
                target,
            });
        }
        Ok(fragments)
    }
}
