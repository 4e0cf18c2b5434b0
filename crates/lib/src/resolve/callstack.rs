//! Function call tracking for error traces.
//!
//! Every concurrent resolution branch works on its own copy of the stack,
//! obtained with [`CallStack::clone`]. The lock only guards a single push,
//! pop or snapshot and is never held while a function runs.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::substitution::SourceRange;

/// One active function invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
  pub file_path: Option<String>,
  pub function_name: String,
  pub location: Option<SourceRange>,
}

impl std::fmt::Display for Call {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.function_name)?;
    match (&self.file_path, &self.location) {
      (Some(path), Some(loc)) => write!(f, " at {path}:{}:{}", loc.start.line, loc.start.column),
      (Some(path), None) => write!(f, " at {path}"),
      (None, Some(loc)) => write!(f, " at {}:{}", loc.start.line, loc.start.column),
      (None, None) => Ok(()),
    }
  }
}

#[derive(Debug, Default)]
pub struct CallStack {
  calls: Mutex<Vec<Call>>,
}

impl CallStack {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, call: Call) {
    self.lock().push(call);
  }

  pub fn pop(&self) -> Option<Call> {
    self.lock().pop()
  }

  /// Active calls ordered innermost first.
  pub fn snapshot(&self) -> Vec<Call> {
    self.lock().iter().rev().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Call>> {
    self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Clone for CallStack {
  fn clone(&self) -> Self {
    Self {
      calls: Mutex::new(self.lock().clone()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn call(name: &str) -> Call {
    Call {
      file_path: Some("app.blueprint.yaml".to_string()),
      function_name: name.to_string(),
      location: Some(SourceRange::at(3, 7)),
    }
  }

  #[test]
  fn snapshot_is_innermost_first() {
    let stack = CallStack::new();
    stack.push(call("join"));
    stack.push(call("map"));
    stack.push(call("to_upper"));

    let names: Vec<_> = stack.snapshot().into_iter().map(|c| c.function_name).collect();
    assert_eq!(names, vec!["to_upper", "map", "join"]);

    assert_eq!(stack.pop().unwrap().function_name, "to_upper");
    assert_eq!(stack.len(), 2);
  }

  #[test]
  fn clone_is_independent() {
    let stack = CallStack::new();
    stack.push(call("join"));

    let branch = stack.clone();
    branch.push(call("split"));

    assert_eq!(stack.len(), 1);
    assert_eq!(branch.len(), 2);
    assert!(stack.pop().is_some());
    assert_eq!(branch.snapshot()[1].function_name, "join");
  }

  #[test]
  fn call_display() {
    assert_eq!(call("join").to_string(), "join at app.blueprint.yaml:3:7");
    let bare = Call {
      file_path: None,
      function_name: "len".to_string(),
      location: None,
    };
    assert_eq!(bare.to_string(), "len");
  }
}
