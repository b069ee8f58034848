// SPDX-License-Identifier: Apache-2.0

//! Resolved command tree handed over by the resolver.
//!
//! Every group and element carries the metadata identifier assigned during
//! resolution; this crate never parses SQL text.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Metadata identifier attached to a resolved symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum MetadataId {
    /// A real catalog object (model, group, element, procedure).
    Catalog(String),
    /// A session-scoped temporary or multi-source synthetic object.
    Temporary(String),
}

impl MetadataId {
    pub fn catalog(key: impl Into<String>) -> Self {
        Self::Catalog(key.into())
    }

    pub fn temporary(key: impl Into<String>) -> Self {
        Self::Temporary(key.into())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Catalog(key) | Self::Temporary(key) => key,
        }
    }
}

/// A table, view, or procedure reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSymbol {
    /// Name as written (may be an alias).
    pub name: String,
    pub metadata_id: MetadataId,
}

impl GroupSymbol {
    pub fn new(name: impl Into<String>, metadata_id: MetadataId) -> Self {
        Self {
            name: name.into(),
            metadata_id,
        }
    }
}

/// A column reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementSymbol {
    pub name: String,
    pub metadata_id: MetadataId,
}

impl ElementSymbol {
    pub fn new(name: impl Into<String>, metadata_id: MetadataId) -> Self {
        Self {
            name: name.into(),
            metadata_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

/// Scalar function call. `lookup(group, returnElement, keyElement, keyValue)`
/// is recognised by name and treated as a data access.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub args: Vec<Expression>,
}

/// Arguments of a `lookup(...)` call once recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupCall<'a> {
    pub group: &'a str,
    pub return_element: &'a str,
    pub key_element: &'a str,
}

impl Function {
    pub fn new(name: impl Into<String>, args: Vec<Expression>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Returns the lookup target when this is a `lookup` call with constant
    /// group and element names.
    pub fn as_lookup(&self) -> Option<LookupCall<'_>> {
        if !self.name.eq_ignore_ascii_case("lookup") || self.args.len() != 4 {
            return None;
        }
        let text = |idx: usize| match &self.args[idx] {
            Expression::Constant(value) => value.as_str(),
            _ => None,
        };
        Some(LookupCall {
            group: text(0)?,
            return_element: text(1)?,
            key_element: text(2)?,
        })
    }
}

/// Expression tree used in select lists, criteria and assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expression {
    Element(ElementSymbol),
    Constant(Value),
    Function(Function),
    Compare {
        left: Box<Expression>,
        op: CompareOp,
        right: Box<Expression>,
    },
    And(Vec<Expression>),
    Or(Vec<Expression>),
    Not(Box<Expression>),
    IsNull(Box<Expression>),
    /// Scalar subquery or EXISTS operand.
    Subquery(Box<Query>),
}

impl Expression {
    pub fn element(symbol: ElementSymbol) -> Self {
        Self::Element(symbol)
    }

    pub fn equals(left: Expression, right: Expression) -> Self {
        Self::Compare {
            left: Box::new(left),
            op: CompareOp::Eq,
            right: Box::new(right),
        }
    }
}

/// `SELECT ... INTO target` destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntoClause {
    pub group: GroupSymbol,
    pub elements: Vec<ElementSymbol>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub select: Vec<Expression>,
    pub from: Vec<GroupSymbol>,
    #[serde(default)]
    pub criteria: Option<Expression>,
    #[serde(default)]
    pub order_by: Vec<Expression>,
    #[serde(default)]
    pub into: Option<IntoClause>,
    /// XML document queries expose document elements that carry no entitlements.
    #[serde(default)]
    pub is_xml: bool,
}

impl Query {
    pub fn new(select: Vec<Expression>, from: Vec<GroupSymbol>) -> Self {
        Self {
            select,
            from,
            criteria: None,
            order_by: Vec::new(),
            into: None,
            is_xml: false,
        }
    }

    pub fn with_criteria(mut self, criteria: Expression) -> Self {
        self.criteria = Some(criteria);
        self
    }

    pub fn with_into(mut self, into: IntoClause) -> Self {
        self.into = Some(into);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InsertSource {
    Values(Vec<Expression>),
    Query(Box<Query>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insert {
    pub group: GroupSymbol,
    pub variables: Vec<ElementSymbol>,
    pub source: InsertSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetClause {
    pub element: ElementSymbol,
    pub value: Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub group: GroupSymbol,
    pub changes: Vec<SetClause>,
    #[serde(default)]
    pub criteria: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub group: GroupSymbol,
    #[serde(default)]
    pub criteria: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredProcedure {
    /// The procedure itself, modelled as a group.
    pub procedure: GroupSymbol,
    #[serde(default)]
    pub params: Vec<Expression>,
}

/// A resolved command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Query(Query),
    Insert(Insert),
    Update(Update),
    Delete(Delete),
    StoredProcedure(StoredProcedure),
}

impl Command {
    /// Groups this command reads or writes directly (not through lookups or
    /// subqueries).
    pub fn target_groups(&self) -> Vec<&GroupSymbol> {
        match self {
            Command::Query(query) => query.from.iter().collect(),
            Command::Insert(insert) => vec![&insert.group],
            Command::Update(update) => vec![&update.group],
            Command::Delete(delete) => vec![&delete.group],
            Command::StoredProcedure(proc) => vec![&proc.procedure],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::Query(_) => "query",
            Command::Insert(_) => "insert",
            Command::Update(_) => "update",
            Command::Delete(_) => "delete",
            Command::StoredProcedure(_) => "procedure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_lookup_with_constant_names() {
        let call = Function::new(
            "LOOKUP",
            vec![
                Expression::Constant("pm1.g1".into()),
                Expression::Constant("e2".into()),
                Expression::Constant("e1".into()),
                Expression::Constant(Value::Int(1)),
            ],
        );
        let lookup = call.as_lookup().expect("lookup should be recognised");
        assert_eq!(lookup.group, "pm1.g1");
        assert_eq!(lookup.return_element, "e2");
        assert_eq!(lookup.key_element, "e1");
    }

    #[test]
    fn other_functions_are_not_lookups() {
        let call = Function::new("concat", vec![Expression::Constant("a".into())]);
        assert!(call.as_lookup().is_none());
    }
}
