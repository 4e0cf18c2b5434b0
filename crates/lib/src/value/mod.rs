//! The JSON-like value model shared by every stage of the engine.
//!
//! A `MappingNode` is used both for desired-state nodes straight out of the
//! blueprint (which may still carry `${..}` substitutions) and for fully
//! resolved runtime values. Once resolved, a tree contains no
//! `MappingNode::Substitutions` anywhere (see [`MappingNode::is_resolved`]).

pub mod cache;
pub mod path;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::substitution::StringOrSubstitutions;

pub use cache::Cache;
pub use path::{PathError, PathPattern, PathSegment, PropertyPath};

/// A scalar leaf value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
  Bool(bool),
  Int(i64),
  Float(f64),
  String(String),
}

impl ScalarValue {
  /// Render the scalar the way it appears when interpolated into a string.
  pub fn to_interpolated(&self) -> String {
    match self {
      ScalarValue::Bool(b) => b.to_string(),
      ScalarValue::Int(i) => i.to_string(),
      ScalarValue::Float(f) => f.to_string(),
      ScalarValue::String(s) => s.clone(),
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      ScalarValue::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      ScalarValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_i64(&self) -> Option<i64> {
    match self {
      ScalarValue::Int(i) => Some(*i),
      ScalarValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
      _ => None,
    }
  }

  /// Name of the scalar kind, used in type errors.
  pub fn kind(&self) -> &'static str {
    match self {
      ScalarValue::Bool(_) => "boolean",
      ScalarValue::Int(_) => "integer",
      ScalarValue::Float(_) => "float",
      ScalarValue::String(_) => "string",
    }
  }
}

// Integers and floats compare by numeric value so that `1` and `1.0`
// recorded by different providers are not reported as changes.
impl PartialEq for ScalarValue {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ScalarValue::Bool(a), ScalarValue::Bool(b)) => a == b,
      (ScalarValue::String(a), ScalarValue::String(b)) => a == b,
      (ScalarValue::Int(a), ScalarValue::Int(b)) => a == b,
      (ScalarValue::Float(a), ScalarValue::Float(b)) => a == b,
      (ScalarValue::Int(a), ScalarValue::Float(b)) | (ScalarValue::Float(b), ScalarValue::Int(a)) => (*a as f64) == *b,
      _ => false,
    }
  }
}

impl From<&str> for ScalarValue {
  fn from(value: &str) -> Self {
    ScalarValue::String(value.to_string())
  }
}

impl From<String> for ScalarValue {
  fn from(value: String) -> Self {
    ScalarValue::String(value)
  }
}

impl From<i64> for ScalarValue {
  fn from(value: i64) -> Self {
    ScalarValue::Int(value)
  }
}

impl From<f64> for ScalarValue {
  fn from(value: f64) -> Self {
    ScalarValue::Float(value)
  }
}

impl From<bool> for ScalarValue {
  fn from(value: bool) -> Self {
    ScalarValue::Bool(value)
  }
}

/// A node in a blueprint value tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingNode {
  Scalar(ScalarValue),
  Items(Vec<MappingNode>),
  Fields(BTreeMap<String, MappingNode>),
  /// An unresolved string that embeds one or more substitutions.
  Substitutions(StringOrSubstitutions),
  #[default]
  None,
}

impl MappingNode {
  pub fn string(value: impl Into<String>) -> Self {
    MappingNode::Scalar(ScalarValue::String(value.into()))
  }

  pub fn int(value: i64) -> Self {
    MappingNode::Scalar(ScalarValue::Int(value))
  }

  pub fn float(value: f64) -> Self {
    MappingNode::Scalar(ScalarValue::Float(value))
  }

  pub fn bool(value: bool) -> Self {
    MappingNode::Scalar(ScalarValue::Bool(value))
  }

  /// Build a `Fields` node from key/value pairs.
  pub fn fields<K: Into<String>>(pairs: impl IntoIterator<Item = (K, MappingNode)>) -> Self {
    MappingNode::Fields(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }

  pub fn is_none(&self) -> bool {
    matches!(self, MappingNode::None)
  }

  pub fn as_scalar(&self) -> Option<&ScalarValue> {
    match self {
      MappingNode::Scalar(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    self.as_scalar().and_then(ScalarValue::as_str)
  }

  pub fn as_bool(&self) -> Option<bool> {
    self.as_scalar().and_then(ScalarValue::as_bool)
  }

  pub fn as_items(&self) -> Option<&[MappingNode]> {
    match self {
      MappingNode::Items(items) => Some(items),
      _ => None,
    }
  }

  pub fn as_fields(&self) -> Option<&BTreeMap<String, MappingNode>> {
    match self {
      MappingNode::Fields(fields) => Some(fields),
      _ => None,
    }
  }

  /// Name of the node kind, used in diagnostics.
  pub fn kind(&self) -> &'static str {
    match self {
      MappingNode::Scalar(s) => s.kind(),
      MappingNode::Items(_) => "list",
      MappingNode::Fields(_) => "mapping",
      MappingNode::Substitutions(_) => "substitution",
      MappingNode::None => "none",
    }
  }

  /// Returns true if no substitution remains anywhere in the tree.
  pub fn is_resolved(&self) -> bool {
    match self {
      MappingNode::Substitutions(_) => false,
      MappingNode::Items(items) => items.iter().all(MappingNode::is_resolved),
      MappingNode::Fields(fields) => fields.values().all(MappingNode::is_resolved),
      MappingNode::Scalar(_) | MappingNode::None => true,
    }
  }

  /// Look up the value at `path`, returning `None` when any segment is absent.
  pub fn get_path(&self, path: &PropertyPath) -> Option<&MappingNode> {
    let mut current = self;
    for segment in path.segments() {
      current = match (segment, current) {
        (PathSegment::Field(name), MappingNode::Fields(fields)) => fields.get(name)?,
        (PathSegment::Index(idx), MappingNode::Items(items)) => items.get(*idx)?,
        _ => return None,
      };
    }
    if current.is_none() { None } else { Some(current) }
  }

  /// Set the value at `path`, creating intermediate mappings as needed.
  ///
  /// List indices must already exist, except for an index equal to the
  /// list length which appends.
  pub fn set_path(&mut self, path: &PropertyPath, value: MappingNode) -> Result<(), PathError> {
    let Some((last, parents)) = path.segments().split_last() else {
      *self = value;
      return Ok(());
    };

    let mut current = self;
    for segment in parents {
      current = descend_or_create(current, segment, path)?;
    }

    match (last, current) {
      (PathSegment::Field(name), node) => {
        if node.is_none() {
          *node = MappingNode::Fields(BTreeMap::new());
        }
        match node {
          MappingNode::Fields(fields) => {
            fields.insert(name.clone(), value);
            Ok(())
          }
          _ => Err(PathError::NotAMapping(path.to_string())),
        }
      }
      (PathSegment::Index(idx), MappingNode::Items(items)) => {
        if *idx < items.len() {
          items[*idx] = value;
          Ok(())
        } else if *idx == items.len() {
          items.push(value);
          Ok(())
        } else {
          Err(PathError::IndexOutOfBounds {
            path: path.to_string(),
            index: *idx,
          })
        }
      }
      (PathSegment::Index(_), _) => Err(PathError::NotAList(path.to_string())),
    }
  }

  /// Convert a resolved node to JSON. Unresolved substitutions become null.
  pub fn to_json(&self) -> serde_json::Value {
    use serde_json::Value;
    match self {
      MappingNode::Scalar(ScalarValue::Bool(b)) => Value::Bool(*b),
      MappingNode::Scalar(ScalarValue::Int(i)) => Value::from(*i),
      MappingNode::Scalar(ScalarValue::Float(f)) => serde_json::Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
      MappingNode::Scalar(ScalarValue::String(s)) => Value::String(s.clone()),
      MappingNode::Items(items) => Value::Array(items.iter().map(MappingNode::to_json).collect()),
      MappingNode::Fields(fields) => Value::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
      MappingNode::Substitutions(_) | MappingNode::None => Value::Null,
    }
  }
}

fn descend_or_create<'a>(
  node: &'a mut MappingNode,
  segment: &PathSegment,
  full: &PropertyPath,
) -> Result<&'a mut MappingNode, PathError> {
  match segment {
    PathSegment::Field(name) => {
      if node.is_none() {
        *node = MappingNode::Fields(BTreeMap::new());
      }
      match node {
        MappingNode::Fields(fields) => Ok(fields.entry(name.clone()).or_default()),
        _ => Err(PathError::NotAMapping(full.to_string())),
      }
    }
    PathSegment::Index(idx) => match node {
      MappingNode::Items(items) => items.get_mut(*idx).ok_or(PathError::IndexOutOfBounds {
        path: full.to_string(),
        index: *idx,
      }),
      _ => Err(PathError::NotAList(full.to_string())),
    },
  }
}

impl From<serde_json::Value> for MappingNode {
  fn from(value: serde_json::Value) -> Self {
    use serde_json::Value;
    match value {
      Value::Null => MappingNode::None,
      Value::Bool(b) => MappingNode::bool(b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => MappingNode::int(i),
        None => MappingNode::float(n.as_f64().unwrap_or_default()),
      },
      Value::String(s) => MappingNode::string(s),
      Value::Array(items) => MappingNode::Items(items.into_iter().map(MappingNode::from).collect()),
      Value::Object(fields) => MappingNode::Fields(fields.into_iter().map(|(k, v)| (k, MappingNode::from(v))).collect()),
    }
  }
}

impl From<ScalarValue> for MappingNode {
  fn from(value: ScalarValue) -> Self {
    MappingNode::Scalar(value)
  }
}

impl From<&str> for MappingNode {
  fn from(value: &str) -> Self {
    MappingNode::string(value)
  }
}
