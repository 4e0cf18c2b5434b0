//! Structural diff between a recorded and a desired resource.
//!
//! Both sides are value trees rooted at the resource (`spec.*` and
//! `metadata.*`). Paths matched by a computed-field pattern are left out of
//! every list, since their values are owned by the provider. Deferred paths
//! are reported as known on deploy and never as removed.

use std::collections::{BTreeMap, BTreeSet};

use crate::diagnostics::{Diagnostic, ReasonCode};
use crate::value::{MappingNode, PathPattern, PropertyPath};

use super::types::FieldChange;

/// Field-level differences for one resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecDiff {
  pub new_fields: Vec<FieldChange>,
  pub modified_fields: Vec<FieldChange>,
  pub removed_fields: Vec<FieldChange>,
  pub unchanged_fields: Vec<String>,
  pub known_on_deploy: Vec<String>,
  /// Type mismatches between the two sides.
  pub warnings: Vec<Diagnostic>,
}

impl SpecDiff {
  /// Returns true if deploying would change anything.
  pub fn has_changes(&self) -> bool {
    !self.new_fields.is_empty()
      || !self.modified_fields.is_empty()
      || !self.removed_fields.is_empty()
      || !self.known_on_deploy.is_empty()
  }

  /// Paths of every new, modified and removed field.
  pub fn changed_paths(&self) -> impl Iterator<Item = &str> {
    self
      .new_fields
      .iter()
      .chain(&self.modified_fields)
      .chain(&self.removed_fields)
      .map(|change| change.path.as_str())
  }
}

struct DiffContext<'a> {
  computed: &'a [PathPattern],
  deferred: &'a [PropertyPath],
  diff: SpecDiff,
}

impl DiffContext<'_> {
  fn is_computed(&self, path: &PropertyPath) -> bool {
    self.computed.iter().any(|pattern| pattern.matches(path))
  }

  fn is_deferred(&self, path: &PropertyPath) -> bool {
    self.deferred.iter().any(|d| d.is_prefix_of(path))
  }
}

/// Compare a recorded value tree with the desired one.
///
/// `prior` is `None` when the resource has never been deployed, in which
/// case every desired field is new.
pub fn diff_specs(
  prior: Option<&MappingNode>,
  desired: &MappingNode,
  computed: &[PathPattern],
  deferred: &[PropertyPath],
) -> SpecDiff {
  let mut ctx = DiffContext {
    computed,
    deferred,
    diff: SpecDiff::default(),
  };

  let known: BTreeSet<String> = deferred
    .iter()
    .filter(|path| !ctx.is_computed(path))
    .map(ToString::to_string)
    .collect();
  ctx.diff.known_on_deploy = known.into_iter().collect();

  diff_node(&mut ctx, &PropertyPath::root(), prior, Some(desired));
  ctx.diff
}

/// Treat none and empty containers as absent, so a missing mapping and an
/// empty one compare equal.
fn present(node: Option<&MappingNode>) -> Option<&MappingNode> {
  node.filter(|n| match n {
    MappingNode::None => false,
    MappingNode::Fields(fields) => !fields.is_empty(),
    MappingNode::Items(items) => !items.is_empty(),
    _ => true,
  })
}

fn diff_node(ctx: &mut DiffContext<'_>, path: &PropertyPath, prior: Option<&MappingNode>, desired: Option<&MappingNode>) {
  if !path.is_empty() && (ctx.is_computed(path) || ctx.is_deferred(path)) {
    return;
  }

  let empty = BTreeMap::new();
  match (present(prior), present(desired)) {
    (None, None) => {}
    (Some(MappingNode::Fields(prev)), Some(MappingNode::Fields(new))) => diff_fields(ctx, path, prev, new),
    (Some(MappingNode::Fields(prev)), None) => diff_fields(ctx, path, prev, &empty),
    (None, Some(MappingNode::Fields(new))) => diff_fields(ctx, path, &empty, new),
    (Some(MappingNode::Items(prev)), Some(MappingNode::Items(new))) => diff_items(ctx, path, prev, new),
    (Some(MappingNode::Items(prev)), None) => diff_items(ctx, path, prev, &[]),
    (None, Some(MappingNode::Items(new))) => diff_items(ctx, path, &[], new),
    (None, Some(new)) => ctx.diff.new_fields.push(FieldChange {
      path: path.to_string(),
      prev: None,
      new: Some(new.clone()),
    }),
    (Some(prev), None) => ctx.diff.removed_fields.push(FieldChange {
      path: path.to_string(),
      prev: Some(prev.clone()),
      new: None,
    }),
    (Some(MappingNode::Scalar(a)), Some(MappingNode::Scalar(b))) => {
      if a == b {
        ctx.diff.unchanged_fields.push(path.to_string());
      } else {
        ctx.diff.modified_fields.push(FieldChange {
          path: path.to_string(),
          prev: prior.cloned(),
          new: desired.cloned(),
        });
      }
    }
    (Some(prev), Some(new)) => {
      ctx.diff.warnings.push(Diagnostic::warning(
        ReasonCode::TypeMismatch,
        format!("'{path}' changes from {} to {}", prev.kind(), new.kind()),
      ));
      ctx.diff.modified_fields.push(FieldChange {
        path: path.to_string(),
        prev: Some(prev.clone()),
        new: Some(new.clone()),
      });
    }
  }
}

fn diff_fields(
  ctx: &mut DiffContext<'_>,
  path: &PropertyPath,
  prev: &BTreeMap<String, MappingNode>,
  new: &BTreeMap<String, MappingNode>,
) {
  let keys: BTreeSet<&String> = prev.keys().chain(new.keys()).collect();
  for key in keys {
    diff_node(ctx, &path.field(key.clone()), prev.get(key), new.get(key));
  }
}

fn diff_items(ctx: &mut DiffContext<'_>, path: &PropertyPath, prev: &[MappingNode], new: &[MappingNode]) {
  for idx in 0..prev.len().max(new.len()) {
    diff_node(ctx, &path.index(idx), prev.get(idx), new.get(idx));
  }
}
