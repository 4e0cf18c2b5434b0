//! Property paths and path patterns.
//!
//! Paths use dotted field access with bracketed list indices or quoted keys:
//!
//! - `spec.ports[0].port`
//! - `metadata.annotations["app.kubernetes.io/name"]`
//!
//! Patterns additionally accept `[*]` (any list index) and `.*` (any mapping
//! key). Patterns are used for provider computed fields and for fields that
//! force a resource to be replaced.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while parsing or applying a path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PathError {
  #[error("empty path")]
  Empty,

  #[error("unexpected character '{ch}' at position {pos} in path '{path}'")]
  UnexpectedChar { path: String, ch: char, pos: usize },

  #[error("unclosed bracket in path '{0}'")]
  UnclosedBracket(String),

  #[error("invalid list index '{index}' in path '{path}'")]
  InvalidIndex { path: String, index: String },

  #[error("wildcards are only allowed in patterns: '{0}'")]
  WildcardNotAllowed(String),

  #[error("cannot set field on a non-mapping value at '{0}'")]
  NotAMapping(String),

  #[error("cannot index a non-list value at '{0}'")]
  NotAList(String),

  #[error("index {index} out of bounds at '{path}'")]
  IndexOutOfBounds { path: String, index: usize },
}

/// A single step in a concrete path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSegment {
  Field(String),
  Index(usize),
}

/// A concrete property path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PropertyPath(Vec<PathSegment>);

impl PropertyPath {
  pub fn root() -> Self {
    Self(Vec::new())
  }

  pub fn parse(input: &str) -> Result<Self, PathError> {
    let segments = parse_segments(input)?
      .into_iter()
      .map(|seg| match seg {
        PatternSegment::Field(name) => Ok(PathSegment::Field(name)),
        PatternSegment::Index(idx) => Ok(PathSegment::Index(idx)),
        PatternSegment::AnyIndex | PatternSegment::AnyKey => Err(PathError::WildcardNotAllowed(input.to_string())),
      })
      .collect::<Result<Vec<_>, _>>()?;
    Ok(Self(segments))
  }

  pub fn segments(&self) -> &[PathSegment] {
    &self.0
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  /// Return a new path with a field appended.
  pub fn field(&self, name: impl Into<String>) -> Self {
    let mut segments = self.0.clone();
    segments.push(PathSegment::Field(name.into()));
    Self(segments)
  }

  /// Return a new path with a list index appended.
  pub fn index(&self, idx: usize) -> Self {
    let mut segments = self.0.clone();
    segments.push(PathSegment::Index(idx));
    Self(segments)
  }

  /// Return a new path with `other` appended.
  pub fn join(&self, other: &PropertyPath) -> Self {
    let mut segments = self.0.clone();
    segments.extend(other.0.iter().cloned());
    Self(segments)
  }

  /// The path without its first segment.
  pub fn tail(&self) -> Self {
    Self(self.0.iter().skip(1).cloned().collect())
  }

  /// Returns true if `self` equals `other` or is an ancestor of it.
  pub fn is_prefix_of(&self, other: &PropertyPath) -> bool {
    self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
  }

  /// Returns true if either path is a prefix of the other.
  pub fn overlaps(&self, other: &PropertyPath) -> bool {
    self.is_prefix_of(other) || other.is_prefix_of(self)
  }
}

impl From<Vec<PathSegment>> for PropertyPath {
  fn from(segments: Vec<PathSegment>) -> Self {
    Self(segments)
  }
}

impl fmt::Display for PropertyPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, seg) in self.0.iter().enumerate() {
      match seg {
        PathSegment::Field(name) if is_plain_key(name) => {
          if i > 0 {
            write!(f, ".")?;
          }
          write!(f, "{name}")?;
        }
        PathSegment::Field(name) => write!(f, "[\"{name}\"]")?,
        PathSegment::Index(idx) => write!(f, "[{idx}]")?,
      }
    }
    Ok(())
  }
}

fn is_plain_key(name: &str) -> bool {
  !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}

/// A single step in a path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternSegment {
  Field(String),
  Index(usize),
  /// `[*]`
  AnyIndex,
  /// `.*`
  AnyKey,
}

/// A path pattern that may contain list-index and mapping-key wildcards.
///
/// A pattern matches a concrete path when it matches that path or one of
/// its ancestors, so `spec.arn` also covers `spec.arn.region`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPattern {
  raw: String,
  segments: Vec<PatternSegment>,
}

impl PathPattern {
  pub fn parse(input: &str) -> Result<Self, PathError> {
    Ok(Self {
      raw: input.to_string(),
      segments: parse_segments(input)?,
    })
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }

  pub fn matches(&self, path: &PropertyPath) -> bool {
    if self.segments.len() > path.len() {
      return false;
    }
    self.segments.iter().zip(path.segments()).all(|(pat, seg)| match (pat, seg) {
      (PatternSegment::Field(a), PathSegment::Field(b)) => a == b,
      (PatternSegment::Index(a), PathSegment::Index(b)) => a == b,
      (PatternSegment::AnyIndex, PathSegment::Index(_)) => true,
      (PatternSegment::AnyKey, PathSegment::Field(_)) => true,
      _ => false,
    })
  }
}

impl fmt::Display for PathPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.raw)
  }
}

fn parse_segments(input: &str) -> Result<Vec<PatternSegment>, PathError> {
  if input.trim().is_empty() {
    return Err(PathError::Empty);
  }

  let mut segments = Vec::new();
  let mut chars = input.char_indices().peekable();
  let mut expect_key = true;

  while let Some((pos, ch)) = chars.next() {
    match ch {
      '.' if !expect_key => expect_key = true,
      '[' => {
        let mut content = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == ']' {
            closed = true;
            break;
          }
          content.push(c);
        }
        if !closed {
          return Err(PathError::UnclosedBracket(input.to_string()));
        }
        segments.push(parse_bracket(input, &content)?);
        expect_key = false;
      }
      '*' if expect_key => {
        segments.push(PatternSegment::AnyKey);
        expect_key = false;
      }
      c if expect_key && is_key_char(c) => {
        let mut name = String::from(c);
        while let Some(&(_, next)) = chars.peek() {
          if !is_key_char(next) {
            break;
          }
          name.push(next);
          chars.next();
        }
        segments.push(PatternSegment::Field(name));
        expect_key = false;
      }
      c => {
        return Err(PathError::UnexpectedChar {
          path: input.to_string(),
          ch: c,
          pos,
        });
      }
    }
  }

  if expect_key {
    return Err(PathError::UnexpectedChar {
      path: input.to_string(),
      ch: '.',
      pos: input.len().saturating_sub(1),
    });
  }

  Ok(segments)
}

fn parse_bracket(input: &str, content: &str) -> Result<PatternSegment, PathError> {
  let content = content.trim();
  if content == "*" {
    return Ok(PatternSegment::AnyIndex);
  }
  if let Some(key) = content
    .strip_prefix('"')
    .and_then(|c| c.strip_suffix('"'))
    .or_else(|| content.strip_prefix('\'').and_then(|c| c.strip_suffix('\'')))
  {
    return Ok(PatternSegment::Field(key.to_string()));
  }
  content
    .parse::<usize>()
    .map(PatternSegment::Index)
    .map_err(|_| PathError::InvalidIndex {
      path: input.to_string(),
      index: content.to_string(),
    })
}

fn is_key_char(c: char) -> bool {
  c.is_alphanumeric() || c == '_' || c == '-'
}
