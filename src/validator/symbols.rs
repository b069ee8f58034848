// SPDX-License-Identifier: Apache-2.0

//! Symbol walk shared by the validators.
//!
//! [`collect`] flattens a command into the list of resources it touches and
//! the action each one is touched with. It never consults metadata; `lookup`
//! calls are kept symbolic and expanded afterwards by [`expand`].

use tessera_core::command::{
    Command, Delete, Expression, Insert, InsertSource, MetadataId, Query, StoredProcedure, Update,
};
use tessera_core::{AuditContext, AuthAction, EngineError, EngineResult, MetadataService};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Group,
    Element,
    Procedure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Symbol { kind: SymbolKind, id: MetadataId },
    /// `lookup(group, returnElement, keyElement, ...)` by name.
    Lookup {
        group: String,
        return_element: String,
        key_element: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRef {
    pub action: AuthAction,
    pub context: AuditContext,
    pub target: Target,
}

/// A reference with every `lookup` resolved to catalog symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRef {
    pub kind: SymbolKind,
    pub action: AuthAction,
    pub context: AuditContext,
    pub id: MetadataId,
}

struct Walker {
    refs: Vec<AccessRef>,
}

impl Walker {
    fn push(&mut self, action: AuthAction, context: AuditContext, kind: SymbolKind, id: &MetadataId) {
        self.refs.push(AccessRef {
            action,
            context,
            target: Target::Symbol {
                kind,
                id: id.clone(),
            },
        });
    }

    fn query(&mut self, query: &Query) {
        if let Some(into) = &query.into {
            for element in &into.elements {
                self.push(
                    AuthAction::Create,
                    AuditContext::Insert,
                    SymbolKind::Element,
                    &element.metadata_id,
                );
            }
        }
        for group in &query.from {
            self.push(
                AuthAction::Read,
                AuditContext::Query,
                SymbolKind::Group,
                &group.metadata_id,
            );
        }
        let read_elements = !query.is_xml;
        let expressions = query
            .select
            .iter()
            .chain(query.criteria.iter())
            .chain(query.order_by.iter());
        for expr in expressions {
            self.expression(expr, AuditContext::Query, read_elements);
        }
    }

    fn insert(&mut self, insert: &Insert) {
        for variable in &insert.variables {
            self.push(
                AuthAction::Create,
                AuditContext::Insert,
                SymbolKind::Element,
                &variable.metadata_id,
            );
        }
        match &insert.source {
            InsertSource::Values(values) => {
                for value in values {
                    self.expression(value, AuditContext::Insert, false);
                }
            }
            InsertSource::Query(query) => self.query(query),
        }
    }

    fn update(&mut self, update: &Update) {
        if let Some(criteria) = &update.criteria {
            self.expression(criteria, AuditContext::Update, true);
        }
        for change in &update.changes {
            self.push(
                AuthAction::Update,
                AuditContext::Update,
                SymbolKind::Element,
                &change.element.metadata_id,
            );
            self.expression(&change.value, AuditContext::Update, false);
        }
    }

    fn delete(&mut self, delete: &Delete) {
        if let Some(criteria) = &delete.criteria {
            self.expression(criteria, AuditContext::Delete, true);
        }
        self.push(
            AuthAction::Delete,
            AuditContext::Delete,
            SymbolKind::Group,
            &delete.group.metadata_id,
        );
    }

    fn procedure(&mut self, procedure: &StoredProcedure) {
        self.push(
            AuthAction::Read,
            AuditContext::Procedure,
            SymbolKind::Procedure,
            &procedure.procedure.metadata_id,
        );
        for param in &procedure.params {
            self.expression(param, AuditContext::Procedure, false);
        }
    }

    /// Element symbols are recorded only when `read_elements` is set; lookups
    /// and subqueries are always data accesses.
    fn expression(&mut self, expr: &Expression, context: AuditContext, read_elements: bool) {
        match expr {
            Expression::Element(element) => {
                if read_elements {
                    self.push(
                        AuthAction::Read,
                        context,
                        SymbolKind::Element,
                        &element.metadata_id,
                    );
                }
            }
            Expression::Constant(_) => {}
            Expression::Function(function) => {
                if let Some(lookup) = function.as_lookup() {
                    self.refs.push(AccessRef {
                        action: AuthAction::Read,
                        context,
                        target: Target::Lookup {
                            group: lookup.group.to_string(),
                            return_element: lookup.return_element.to_string(),
                            key_element: lookup.key_element.to_string(),
                        },
                    });
                }
                for arg in &function.args {
                    self.expression(arg, context, read_elements);
                }
            }
            Expression::Compare { left, right, .. } => {
                self.expression(left, context, read_elements);
                self.expression(right, context, read_elements);
            }
            Expression::And(items) | Expression::Or(items) => {
                for item in items {
                    self.expression(item, context, read_elements);
                }
            }
            Expression::Not(inner) | Expression::IsNull(inner) => {
                self.expression(inner, context, read_elements);
            }
            Expression::Subquery(query) => self.query(query),
        }
    }
}

/// Flattens a command into its access references, in walk order.
pub fn collect(command: &Command) -> Vec<AccessRef> {
    let mut walker = Walker { refs: Vec::new() };
    match command {
        Command::Query(query) => walker.query(query),
        Command::Insert(insert) => walker.insert(insert),
        Command::Update(update) => walker.update(update),
        Command::Delete(delete) => walker.delete(delete),
        Command::StoredProcedure(procedure) => walker.procedure(procedure),
    }
    walker.refs
}

/// Resolves `lookup` targets into their group and two elements.
///
/// Metadata failures surface as `ComponentUnavailable`.
pub fn expand(refs: Vec<AccessRef>, metadata: &dyn MetadataService) -> EngineResult<Vec<ResolvedRef>> {
    let mut resolved = Vec::with_capacity(refs.len());
    for access in refs {
        match access.target {
            Target::Symbol { kind, id } => resolved.push(ResolvedRef {
                kind,
                action: access.action,
                context: access.context,
                id,
            }),
            Target::Lookup {
                group,
                return_element,
                key_element,
            } => {
                let group_id = metadata.resolve_group(&group).map_err(metadata_unavailable)?;
                let mut push = |kind, id| {
                    resolved.push(ResolvedRef {
                        kind,
                        action: access.action,
                        context: access.context,
                        id,
                    })
                };
                let return_id = metadata
                    .resolve_element(&group_id, &return_element)
                    .map_err(metadata_unavailable)?;
                let key_id = metadata
                    .resolve_element(&group_id, &key_element)
                    .map_err(metadata_unavailable)?;
                push(SymbolKind::Group, group_id);
                push(SymbolKind::Element, return_id);
                push(SymbolKind::Element, key_id);
            }
        }
    }
    Ok(resolved)
}

pub(crate) fn metadata_unavailable(error: EngineError) -> EngineError {
    match error {
        EngineError::ComponentUnavailable { .. } => error,
        other => EngineError::unavailable("metadata", other.to_string()),
    }
}
