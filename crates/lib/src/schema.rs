//! The parsed blueprint object graph.
//!
//! Blueprints arrive already parsed from an external schema source. Every
//! element carries an optional source range so diagnostics can point back
//! at the document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::substitution::SourceRange;
use crate::value::{MappingNode, ScalarValue};

/// A complete blueprint for one deployable unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
  #[serde(default)]
  pub variables: BTreeMap<String, Variable>,
  #[serde(default)]
  pub resources: BTreeMap<String, Resource>,
  #[serde(default)]
  pub data_sources: BTreeMap<String, DataSource>,
  #[serde(default)]
  pub includes: BTreeMap<String, Include>,
  #[serde(default)]
  pub exports: BTreeMap<String, Export>,
}

/// The declared type of an input variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
  String,
  Integer,
  Float,
  Boolean,
  /// A provider-defined type whose allowed values come from the registry.
  Custom(String),
}

impl VariableType {
  /// Returns true if `value` is acceptable for a core type.
  ///
  /// Custom types are validated against registry options separately.
  pub fn accepts(&self, value: &ScalarValue) -> bool {
    matches!(
      (self, value),
      (VariableType::String, ScalarValue::String(_))
        | (VariableType::Integer, ScalarValue::Int(_))
        | (VariableType::Float, ScalarValue::Float(_) | ScalarValue::Int(_))
        | (VariableType::Boolean, ScalarValue::Bool(_))
        | (VariableType::Custom(_), _)
    )
  }
}

impl std::fmt::Display for VariableType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      VariableType::String => write!(f, "string"),
      VariableType::Integer => write!(f, "integer"),
      VariableType::Float => write!(f, "float"),
      VariableType::Boolean => write!(f, "boolean"),
      VariableType::Custom(name) => write!(f, "{name}"),
    }
  }
}

/// An input variable declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
  pub var_type: VariableType,
  #[serde(default)]
  pub default: Option<ScalarValue>,
  #[serde(default)]
  pub allowed_values: Vec<ScalarValue>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub secret: bool,
  #[serde(default)]
  pub range: Option<SourceRange>,
}

impl Variable {
  pub fn new(var_type: VariableType) -> Self {
    Self {
      var_type,
      default: None,
      allowed_values: Vec::new(),
      description: None,
      secret: false,
      range: None,
    }
  }

  pub fn with_default(mut self, default: impl Into<ScalarValue>) -> Self {
    self.default = Some(default.into());
    self
  }
}

/// Resource metadata. Labels are static so link selection can run before
/// any resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetadata {
  #[serde(default)]
  pub display_name: Option<MappingNode>,
  #[serde(default)]
  pub labels: BTreeMap<String, String>,
  #[serde(default)]
  pub annotations: BTreeMap<String, MappingNode>,
  #[serde(default)]
  pub custom: Option<MappingNode>,
}

/// Selects the resources a resource links to by matching their labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSelector {
  pub by_label: BTreeMap<String, String>,
}

impl LinkSelector {
  pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
    !self.by_label.is_empty() && self.by_label.iter().all(|(k, v)| labels.get(k) == Some(v))
  }
}

/// A guard deciding whether an element is part of the deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
  /// An expression that must resolve to a boolean.
  Expr(MappingNode),
  And(Vec<Condition>),
  Or(Vec<Condition>),
  Not(Box<Condition>),
}

impl Condition {
  /// Every expression node reachable from this condition.
  pub fn expressions(&self) -> Vec<&MappingNode> {
    let mut out = Vec::new();
    self.collect_expressions(&mut out);
    out
  }

  fn collect_expressions<'a>(&'a self, out: &mut Vec<&'a MappingNode>) {
    match self {
      Condition::Expr(node) => out.push(node),
      Condition::And(items) | Condition::Or(items) => {
        for item in items {
          item.collect_expressions(out);
        }
      }
      Condition::Not(inner) => inner.collect_expressions(out),
    }
  }
}

/// A resource declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
  pub resource_type: String,
  #[serde(default)]
  pub metadata: ResourceMetadata,
  pub spec: MappingNode,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub condition: Option<Condition>,
  /// Makes the resource a template repeated once per list item.
  #[serde(default)]
  pub each: Option<MappingNode>,
  #[serde(default)]
  pub link_selector: Option<LinkSelector>,
  #[serde(default)]
  pub range: Option<SourceRange>,
}

impl Resource {
  pub fn new(resource_type: impl Into<String>, spec: MappingNode) -> Self {
    Self {
      resource_type: resource_type.into(),
      metadata: ResourceMetadata::default(),
      spec,
      depends_on: Vec::new(),
      condition: None,
      each: None,
      link_selector: None,
      range: None,
    }
  }

  pub fn with_depends_on(mut self, deps: &[&str]) -> Self {
    self.depends_on = deps.iter().map(|d| d.to_string()).collect();
    self
  }

  pub fn with_condition(mut self, condition: Condition) -> Self {
    self.condition = Some(condition);
    self
  }

  pub fn with_each(mut self, each: MappingNode) -> Self {
    self.each = Some(each);
    self
  }

  pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
    self.metadata.labels = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    self
  }

  pub fn with_link_selector(mut self, by_label: &[(&str, &str)]) -> Self {
    self.link_selector = Some(LinkSelector {
      by_label: by_label.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    });
    self
  }
}

/// Filter passed to a data source provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceFilter {
  pub field: String,
  pub operator: String,
  pub search: MappingNode,
}

/// A field exported by a data source, optionally renamed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSourceExport {
  #[serde(default)]
  pub alias_for: Option<String>,
}

/// A data source declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
  pub data_source_type: String,
  #[serde(default)]
  pub filter: Option<DataSourceFilter>,
  #[serde(default)]
  pub exports: BTreeMap<String, DataSourceExport>,
  #[serde(default)]
  pub range: Option<SourceRange>,
}

/// A nested child blueprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Include {
  pub path: MappingNode,
  #[serde(default)]
  pub variables: BTreeMap<String, MappingNode>,
  #[serde(default)]
  pub metadata: Option<MappingNode>,
  #[serde(default)]
  pub depends_on: Vec<String>,
  #[serde(default)]
  pub condition: Option<Condition>,
  #[serde(default)]
  pub range: Option<SourceRange>,
}

impl Include {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: MappingNode::string(path),
      variables: BTreeMap::new(),
      metadata: None,
      depends_on: Vec::new(),
      condition: None,
      range: None,
    }
  }
}

/// A value exposed by the blueprint after deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Export {
  pub field: MappingNode,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub range: Option<SourceRange>,
}

impl Export {
  pub fn new(field: MappingNode) -> Self {
    Self {
      field,
      description: None,
      range: None,
    }
  }
}
