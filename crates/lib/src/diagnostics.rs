//! Diagnostics attached to staged and deployed elements.
//!
//! Every error or warning surfaced to callers carries a machine-readable
//! reason code, a message and, where known, the source range it refers to.
//! Rendering is left to front-ends.

use serde::{Deserialize, Serialize};

use crate::substitution::SourceRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
  Error,
  Warning,
  Info,
}

/// Machine-readable reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
  MissingVariable,
  InvalidVariable,
  UnknownElement,
  DependencyExcluded,
  ResourceNotDeployed,
  ChildExportUnknown,
  InvalidReference,
  InvalidInterpolation,
  FunctionNotFound,
  FunctionFailed,
  DataSourceFailed,
  ProviderNotFound,
  InvalidCondition,
  InvalidTemplate,
  MustResolveDuringStaging,
  DependencyCycle,
  LinkProviderMissing,
  InvalidPathPattern,
  TypeMismatch,
  ChildLoadFailed,
  ChildIncludeCycle,
  MaxIncludeDepth,
  DriftAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
  pub level: DiagnosticLevel,
  pub reason: ReasonCode,
  pub message: String,
  /// The element the diagnostic belongs to, e.g. `resources.orders`.
  pub element: Option<String>,
  pub range: Option<SourceRange>,
}

impl Diagnostic {
  pub fn error(reason: ReasonCode, message: impl Into<String>) -> Self {
    Self {
      level: DiagnosticLevel::Error,
      reason,
      message: message.into(),
      element: None,
      range: None,
    }
  }

  pub fn warning(reason: ReasonCode, message: impl Into<String>) -> Self {
    Self {
      level: DiagnosticLevel::Warning,
      reason,
      message: message.into(),
      element: None,
      range: None,
    }
  }

  pub fn for_element(mut self, element: impl Into<String>) -> Self {
    self.element = Some(element.into());
    self
  }

  pub fn with_range(mut self, range: Option<SourceRange>) -> Self {
    self.range = range;
    self
  }

  pub fn is_error(&self) -> bool {
    self.level == DiagnosticLevel::Error
  }
}

impl std::fmt::Display for Diagnostic {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(element) = &self.element {
      write!(f, "{element}: ")?;
    }
    write!(f, "{}", self.message)?;
    if let Some(range) = &self.range {
      write!(f, " (line {}", range.start.line)?;
      if range.column_accurate {
        write!(f, ", column {}", range.start.column)?;
      }
      write!(f, ")")?;
    }
    Ok(())
  }
}
