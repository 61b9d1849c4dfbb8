//! Dependency expansion
//!
//! Boolean and derived operators refer to their operands by object name.
//! Expanding an operator replaces every such name with the fully expanded
//! operand, producing a self-contained tree whose content fully determines
//! the geometry it builds.

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::{DocumentSnapshot, OperatorArgs, OperatorKind, ParamValue};

/// What to do when a reference names an object that is not in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MissingReferencePolicy {
    /// Keep the raw name in place of the operand
    ///
    /// The resulting key is deterministic but does not describe real
    /// geometry; callers that need correctness must validate references.
    #[default]
    BestEffort,
    /// Abort expansion with [`ExpandError::MissingReference`]
    FailFast,
}

/// Expansion errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpandError {
    #[error("{field} references missing object '{name}'")]
    MissingReference { field: String, name: String },

    #[error("Reference cycle through object '{0}'")]
    ReferenceCycle(String),

    #[error("{0} holds a number that is NaN or infinite")]
    NonFiniteNumber(String),
}

/// Result type for expansion
pub type ExpandResult<T> = Result<T, ExpandError>;

/// One argument of an expanded operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExpandedValue {
    /// A literal parameter, or an unresolved reference kept by name
    Literal(ParamValue),
    /// A resolved operand
    Tree(Box<ExpandedTree>),
    /// An ordered list of resolved operands
    Trees(Vec<ExpandedValue>),
}

/// A fully inlined operator: no external name references remain
/// (unless the best-effort policy kept a dangling one)
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedTree {
    pub kind: OperatorKind,
    pub args: BTreeMap<String, ExpandedValue>,
}

impl ExpandedTree {
    /// Check whether any operand is still a bare name reference
    pub fn has_unresolved_references(&self) -> bool {
        fn value_unresolved(kind: &OperatorKind, field: &str, value: &ExpandedValue) -> bool {
            match value {
                ExpandedValue::Literal(v) => {
                    reference_fields(kind).contains(&field) && v.as_str().is_some()
                }
                ExpandedValue::Tree(tree) => tree.has_unresolved_references(),
                ExpandedValue::Trees(items) => {
                    items.iter().any(|item| value_unresolved(kind, field, item))
                }
            }
        }

        self.args
            .iter()
            .any(|(field, value)| value_unresolved(&self.kind, field, value))
    }
}

// Serialized as `{type_name: args}`
impl Serialize for ExpandedTree {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.kind.type_name(), &self.args)?;
        map.end()
    }
}

/// Parameter fields holding object names, per operator kind
pub fn reference_fields(kind: &OperatorKind) -> &'static [&'static str] {
    match kind {
        OperatorKind::Cut => &["Base", "Tool"],
        OperatorKind::Extrusion => &["Base"],
        OperatorKind::Fuse | OperatorKind::Intersection => &["Shapes"],
        OperatorKind::Box
        | OperatorKind::Cylinder
        | OperatorKind::Sphere
        | OperatorKind::Cone
        | OperatorKind::Torus
        | OperatorKind::Sketch
        | OperatorKind::RawImport
        | OperatorKind::Passthrough(_) => &[],
    }
}

/// Keep a parameter as a literal operand
///
/// NaN and infinities have no JSON form and would hash like `null`.
fn literal(field: &str, value: &ParamValue) -> ExpandResult<ExpandedValue> {
    fn non_finite(value: &ParamValue) -> bool {
        match value {
            ParamValue::Number(n) => !n.is_finite(),
            ParamValue::List(items) => items.iter().any(non_finite),
            ParamValue::Map(entries) => entries.values().any(non_finite),
            ParamValue::Null | ParamValue::Bool(_) | ParamValue::Text(_) => false,
        }
    }

    if non_finite(value) {
        return Err(ExpandError::NonFiniteNumber(field.to_string()));
    }
    Ok(ExpandedValue::Literal(value.clone()))
}

/// Expands operators against a document snapshot
pub struct Expander<'a> {
    doc: &'a DocumentSnapshot,
    policy: MissingReferencePolicy,
    /// Objects currently being expanded, outermost first
    stack: Vec<String>,
}

impl<'a> Expander<'a> {
    /// Create an expander reading from `doc`
    pub fn new(doc: &'a DocumentSnapshot, policy: MissingReferencePolicy) -> Self {
        Self {
            doc,
            policy,
            stack: Vec::new(),
        }
    }

    /// Expand an operator and all of its dependencies
    ///
    /// Shared operands are expanded once per reference; nothing is memoized.
    pub fn expand(&mut self, kind: &OperatorKind, args: &OperatorArgs) -> ExpandResult<ExpandedTree> {
        let fields = reference_fields(kind);
        let mut expanded = BTreeMap::new();
        for (field, value) in args {
            let value = if fields.contains(&field.as_str()) {
                self.expand_field(field, value)?
            } else {
                literal(field, value)?
            };
            expanded.insert(field.clone(), value);
        }

        Ok(ExpandedTree {
            kind: kind.clone(),
            args: expanded,
        })
    }

    /// Expand an object of the document by name
    pub fn expand_object(&mut self, name: &str) -> ExpandResult<ExpandedTree> {
        match self.resolve("object", name)? {
            ExpandedValue::Tree(tree) => Ok(*tree),
            _ => Err(ExpandError::MissingReference {
                field: "object".into(),
                name: name.into(),
            }),
        }
    }

    fn expand_field(&mut self, field: &str, value: &ParamValue) -> ExpandResult<ExpandedValue> {
        match value {
            ParamValue::Text(name) => self.resolve(field, name),
            ParamValue::List(items) => {
                let trees = items
                    .iter()
                    .map(|item| match item {
                        ParamValue::Text(name) => self.resolve(field, name),
                        other => literal(field, other),
                    })
                    .collect::<ExpandResult<Vec<_>>>()?;
                Ok(ExpandedValue::Trees(trees))
            }
            other => literal(field, other),
        }
    }

    fn resolve(&mut self, field: &str, name: &str) -> ExpandResult<ExpandedValue> {
        let Some(object) = self.doc.get(name) else {
            return match self.policy {
                MissingReferencePolicy::BestEffort => {
                    tracing::debug!("{} references missing object '{}', keeping name", field, name);
                    Ok(ExpandedValue::Literal(ParamValue::Text(name.to_string())))
                }
                MissingReferencePolicy::FailFast => Err(ExpandError::MissingReference {
                    field: field.to_string(),
                    name: name.to_string(),
                }),
            };
        };

        if self.stack.iter().any(|n| n == name) {
            return Err(ExpandError::ReferenceCycle(name.to_string()));
        }

        self.stack.push(name.to_string());
        let result = self.expand(&object.kind, &object.parameters);
        self.stack.pop();

        Ok(ExpandedValue::Tree(Box::new(result?)))
    }
}

/// Expand an operator against `doc`
pub fn expand(
    kind: &OperatorKind,
    args: &OperatorArgs,
    doc: &DocumentSnapshot,
    policy: MissingReferencePolicy,
) -> ExpandResult<ExpandedTree> {
    Expander::new(doc, policy).expand(kind, args)
}
