//! Substitution expressions embedded in blueprint strings.
//!
//! Blueprint fields may embed `${..}` expressions that are evaluated by the
//! resolver. The schema source hands these over already parsed; the
//! [`parse`] helper is provided so that schema sources and tests can build
//! the expression tree from the textual form.
//!
//! # Expression Forms
//!
//! - `${variables.region}` - an input variable
//! - `${resources.db.spec.host}` - a resource spec or metadata property
//! - `${resources.db?.spec.host}` - same, but yields none when `db` is
//!   conditionally excluded
//! - `${resources.workers[1].spec.id}` - a templated resource instance
//! - `${datasources.network.subnets[0]}` - a data source field
//! - `${children.core.endpoint}` - an export of a child blueprint
//! - `${elem.name}` / `${i}` - the current template element and index
//! - `${join(values, ",")}` - a function call with nested arguments
//!
//! Use `$${` to produce a literal `${`.

mod parse;

use serde::{Deserialize, Serialize};

use crate::value::{PropertyPath, ScalarValue};

pub use parse::{ParseError, parse, parse_at};

/// A line/column position in the blueprint source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourcePosition {
  pub line: usize,
  pub column: usize,
}

impl SourcePosition {
  pub fn new(line: usize, column: usize) -> Self {
    Self { line, column }
  }
}

impl Default for SourcePosition {
  fn default() -> Self {
    Self { line: 1, column: 1 }
  }
}

/// The source span of an element or expression.
///
/// Multi-line string forms (folded or literal blocks) can only approximate
/// the column, in which case `column_accurate` is false.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
  pub start: SourcePosition,
  pub end: Option<SourcePosition>,
  pub column_accurate: bool,
}

impl SourceRange {
  pub fn at(line: usize, column: usize) -> Self {
    Self {
      start: SourcePosition::new(line, column),
      end: None,
      column_accurate: true,
    }
  }
}

/// A parsed expression with its source location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Substitution {
  pub kind: SubstitutionKind,
  pub range: Option<SourceRange>,
}

impl Substitution {
  pub fn new(kind: SubstitutionKind) -> Self {
    Self { kind, range: None }
  }
}

/// The different kinds of expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubstitutionKind {
  Literal(ScalarValue),
  Variable {
    name: String,
  },
  /// `path` always starts with `spec` or `metadata`.
  ResourceProperty {
    resource: String,
    index: Option<usize>,
    path: PropertyPath,
    optional: bool,
  },
  DataSourceProperty {
    data_source: String,
    field: String,
    index: Option<usize>,
  },
  ChildProperty {
    child: String,
    export: String,
    path: PropertyPath,
  },
  Elem {
    path: PropertyPath,
  },
  ElemIndex,
  FunctionCall {
    name: String,
    args: Vec<FunctionArg>,
  },
}

/// A positional or named function argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionArg {
  pub name: Option<String>,
  pub value: Substitution,
}

/// A piece of an interpolated string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringPart {
  Literal(String),
  Substitution(Substitution),
}

/// An ordered mix of literal text and substitutions.
///
/// A single substitution with no surrounding text evaluates to the value of
/// that substitution with its own type; anything else is string
/// interpolation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StringOrSubstitutions {
  pub parts: Vec<StringPart>,
}

impl StringOrSubstitutions {
  /// The lone substitution, when the string is nothing but one expression.
  pub fn single(&self) -> Option<&Substitution> {
    match self.parts.as_slice() {
      [StringPart::Substitution(sub)] => Some(sub),
      _ => None,
    }
  }

  pub fn substitutions(&self) -> impl Iterator<Item = &Substitution> {
    self.parts.iter().filter_map(|part| match part {
      StringPart::Substitution(sub) => Some(sub),
      StringPart::Literal(_) => None,
    })
  }
}

/// A reference to another element found inside an expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementRef {
  Resource { name: String, index: Option<usize> },
  Child { name: String },
  DataSource { name: String },
}

impl Substitution {
  /// Collect every element reference in this expression, including those
  /// nested inside function arguments.
  pub fn collect_refs(&self, out: &mut Vec<ElementRef>) {
    match &self.kind {
      SubstitutionKind::ResourceProperty { resource, index, .. } => out.push(ElementRef::Resource {
        name: resource.clone(),
        index: *index,
      }),
      SubstitutionKind::ChildProperty { child, .. } => out.push(ElementRef::Child { name: child.clone() }),
      SubstitutionKind::DataSourceProperty { data_source, .. } => out.push(ElementRef::DataSource {
        name: data_source.clone(),
      }),
      SubstitutionKind::FunctionCall { args, .. } => {
        for arg in args {
          arg.value.collect_refs(out);
        }
      }
      SubstitutionKind::Literal(_)
      | SubstitutionKind::Variable { .. }
      | SubstitutionKind::Elem { .. }
      | SubstitutionKind::ElemIndex => {}
    }
  }
}

/// Collect every element reference in a value tree.
pub fn collect_node_refs(node: &crate::value::MappingNode, out: &mut Vec<ElementRef>) {
  use crate::value::MappingNode;
  match node {
    MappingNode::Substitutions(subs) => {
      for sub in subs.substitutions() {
        sub.collect_refs(out);
      }
    }
    MappingNode::Items(items) => {
      for item in items {
        collect_node_refs(item, out);
      }
    }
    MappingNode::Fields(fields) => {
      for value in fields.values() {
        collect_node_refs(value, out);
      }
    }
    MappingNode::Scalar(_) | MappingNode::None => {}
  }
}
