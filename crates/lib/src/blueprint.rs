//! Blueprint preparation.
//!
//! Preparation is the first of two passes over a blueprint. It validates
//! input variables, expands templated resources, evaluates conditions and
//! builds the complete dependency graph, rejecting cycles before anything
//! else is resolved. Staging and deployment then work over the prepared
//! result without changing its shape.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::diagnostics::{Diagnostic, ReasonCode};
use crate::graph::{DependencyGraph, GraphError};
use crate::registry::ProviderRegistry;
use crate::resolve::callstack::CallStack;
use crate::resolve::{ResolveContext, ResolveFor, ResolveInputs, ResolveTarget, SubstitutionResolver};
use crate::schema::{Blueprint, VariableType};
use crate::value::MappingNode;

/// One concrete resource. Plain resources are their own single instance;
/// templates expand into `name_0..name_n`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInstance {
  pub name: String,
  /// The declaring resource in the blueprint.
  pub template: String,
  pub index: Option<usize>,
  pub elem: Option<MappingNode>,
}

/// The name of a template instance.
pub fn instance_name(template: &str, index: usize) -> String {
  format!("{template}_{index}")
}

/// Concrete resource instances and the elements excluded by conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Expansion {
  instances: BTreeMap<String, ResourceInstance>,
  templates: BTreeMap<String, Vec<String>>,
  excluded_resources: BTreeSet<String>,
  excluded_children: BTreeSet<String>,
}

impl Expansion {
  /// Every resource as its own instance, with no exclusions.
  pub fn identity(blueprint: &Blueprint) -> Self {
    let instances = blueprint
      .resources
      .keys()
      .map(|name| {
        (
          name.clone(),
          ResourceInstance {
            name: name.clone(),
            template: name.clone(),
            index: None,
            elem: None,
          },
        )
      })
      .collect();
    Self {
      instances,
      ..Default::default()
    }
  }

  /// Replace a resource with one instance per element.
  pub fn expand_template(&mut self, template: &str, elems: Vec<MappingNode>) {
    self.instances.remove(template);
    let mut names = Vec::with_capacity(elems.len());
    for (index, elem) in elems.into_iter().enumerate() {
      let name = instance_name(template, index);
      self.instances.insert(
        name.clone(),
        ResourceInstance {
          name: name.clone(),
          template: template.to_string(),
          index: Some(index),
          elem: Some(elem),
        },
      );
      names.push(name);
    }
    self.templates.insert(template.to_string(), names);
  }

  pub fn exclude_resource(&mut self, name: &str) {
    self.excluded_resources.insert(name.to_string());
  }

  pub fn exclude_child(&mut self, name: &str) {
    self.excluded_children.insert(name.to_string());
  }

  pub fn instance(&self, name: &str) -> Option<&ResourceInstance> {
    self.instances.get(name)
  }

  pub fn instances(&self) -> impl Iterator<Item = &ResourceInstance> {
    self.instances.values()
  }

  /// Instances that are part of the deployment.
  pub fn active_instances(&self) -> impl Iterator<Item = &ResourceInstance> {
    self
      .instances
      .values()
      .filter(|i| !self.excluded_resources.contains(&i.name))
  }

  /// Instance names of a templated resource, `None` for plain resources.
  pub fn template_instances(&self, template: &str) -> Option<&[String]> {
    self.templates.get(template).map(Vec::as_slice)
  }

  pub fn is_resource_excluded(&self, name: &str) -> bool {
    self.excluded_resources.contains(name)
  }

  pub fn is_child_excluded(&self, name: &str) -> bool {
    self.excluded_children.contains(name)
  }
}

#[derive(Debug, Error)]
pub enum PrepareError {
  #[error("blueprint is invalid: {}", .diagnostics.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
  Invalid { diagnostics: Vec<Diagnostic> },

  #[error(transparent)]
  Graph(#[from] GraphError),
}

impl PrepareError {
  pub fn diagnostics(&self) -> Vec<Diagnostic> {
    match self {
      PrepareError::Invalid { diagnostics } => diagnostics.clone(),
      PrepareError::Graph(err) => vec![err.to_diagnostic()],
    }
  }
}

/// The output of pass one.
#[derive(Clone)]
pub struct PreparedBlueprint {
  pub blueprint: Arc<Blueprint>,
  pub expansion: Arc<Expansion>,
  pub graph: Arc<DependencyGraph>,
  /// A resolver over the final expansion, with fresh resource caches.
  pub resolver: SubstitutionResolver,
  /// Warnings raised during preparation.
  pub diagnostics: Vec<Diagnostic>,
}

/// Validate, expand and graph a blueprint.
///
/// # Errors
///
/// Returns `Graph` for unknown dependencies or cycles (checked before any
/// resolution) and `Invalid` with every diagnostic when variables, templates
/// or conditions cannot be evaluated.
pub async fn prepare(
  blueprint: Arc<Blueprint>,
  inputs: Arc<ResolveInputs>,
  registry: Arc<ProviderRegistry>,
) -> Result<PreparedBlueprint, PrepareError> {
  let identity = Expansion::identity(&blueprint);

  // References in conditions and templates can form cycles too, so the
  // unexpanded graph is checked before anything is resolved.
  DependencyGraph::build(&blueprint, &identity, &registry)?;

  let mut diagnostics = validate_variables(&blueprint, &inputs.params, &registry).await;
  if diagnostics.iter().any(Diagnostic::is_error) {
    return Err(PrepareError::Invalid { diagnostics });
  }

  let resolver = SubstitutionResolver::new(blueprint.clone(), inputs, registry.clone(), Arc::new(identity.clone()));

  let mut expansion = identity;
  for (name, decl) in &blueprint.resources {
    if decl.each.is_none() {
      continue;
    }
    match resolver.resolve_each(name).await {
      Ok(elems) => {
        debug!(template = %name, instances = elems.len(), "expanded template");
        for index in 0..elems.len() {
          let instance = instance_name(name, index);
          if blueprint.resources.contains_key(&instance) {
            diagnostics.push(
              Diagnostic::error(
                ReasonCode::InvalidTemplate,
                format!("template instance '{instance}' collides with a declared resource"),
              )
              .for_element(format!("resources.{name}"))
              .with_range(decl.range),
            );
          }
        }
        expansion.expand_template(name, elems);
      }
      Err(err) => diagnostics.push(err.to_diagnostic(format!("resources.{name}"), decl.range)),
    }
  }

  let resolver = resolver.with_expansion(Arc::new(expansion.clone()));
  let stack = CallStack::new();

  let instances: Vec<_> = expansion.instances().cloned().collect();
  for instance in instances {
    let Some(decl) = blueprint.resources.get(&instance.template) else {
      continue;
    };
    let Some(condition) = &decl.condition else {
      continue;
    };

    let mut ctx = ResolveContext::new(
      format!("resources.{}", instance.name),
      ResolveTarget::Condition,
      ResolveFor::ChangeStaging,
    );
    ctx.range = decl.range;
    if let Some(elem) = &instance.elem {
      ctx = ctx.with_template(elem.clone(), instance.index.unwrap_or_default());
    }

    match resolver.resolve_condition(condition, &ctx, &stack).await {
      Ok(true) => {}
      Ok(false) => {
        debug!(resource = %instance.name, "excluded by condition");
        expansion.exclude_resource(&instance.name);
      }
      Err(err) => diagnostics.push(err.to_diagnostic(ctx.element.clone(), decl.range)),
    }
  }

  for (name, include) in &blueprint.includes {
    let Some(condition) = &include.condition else {
      continue;
    };
    let mut ctx = ResolveContext::new(format!("children.{name}"), ResolveTarget::Condition, ResolveFor::ChangeStaging);
    ctx.range = include.range;

    match resolver.resolve_condition(condition, &ctx, &stack).await {
      Ok(true) => {}
      Ok(false) => {
        debug!(child = %name, "excluded by condition");
        expansion.exclude_child(name);
      }
      Err(err) => diagnostics.push(err.to_diagnostic(ctx.element.clone(), include.range)),
    }
  }

  if diagnostics.iter().any(Diagnostic::is_error) {
    return Err(PrepareError::Invalid { diagnostics });
  }

  let (graph, warnings) = DependencyGraph::build(&blueprint, &expansion, &registry)?;
  diagnostics.extend(warnings);

  info!(
    resources = expansion.active_instances().count(),
    excluded = expansion.excluded_resources.len() + expansion.excluded_children.len(),
    elements = graph.len(),
    "prepared blueprint"
  );

  let expansion = Arc::new(expansion);
  Ok(PreparedBlueprint {
    resolver: resolver.with_expansion(expansion.clone()),
    blueprint,
    expansion,
    graph: Arc::new(graph),
    diagnostics,
  })
}

/// Check supplied and default variable values against their declarations.
async fn validate_variables(
  blueprint: &Blueprint,
  params: &BTreeMap<String, MappingNode>,
  registry: &ProviderRegistry,
) -> Vec<Diagnostic> {
  let mut diagnostics = Vec::new();

  for name in params.keys() {
    if !blueprint.variables.contains_key(name) {
      diagnostics.push(
        Diagnostic::warning(ReasonCode::InvalidVariable, format!("'{name}' is not a declared variable"))
          .for_element(format!("variables.{name}")),
      );
    }
  }

  for (name, decl) in &blueprint.variables {
    let element = format!("variables.{name}");
    let invalid = |message: String| {
      Diagnostic::error(ReasonCode::InvalidVariable, message)
        .for_element(element.clone())
        .with_range(decl.range)
    };

    let value = match params.get(name) {
      Some(MappingNode::Scalar(scalar)) => scalar.clone(),
      Some(other) => {
        diagnostics.push(invalid(format!("expected a {} value, got {}", decl.var_type, other.kind())));
        continue;
      }
      None => match &decl.default {
        Some(default) => default.clone(),
        None => {
          diagnostics.push(
            Diagnostic::error(ReasonCode::MissingVariable, format!("variable '{name}' has no value and no default"))
              .for_element(element.clone())
              .with_range(decl.range),
          );
          continue;
        }
      },
    };

    if !decl.var_type.accepts(&value) {
      diagnostics.push(invalid(format!("expected a {} value, got {}", decl.var_type, value.kind())));
      continue;
    }

    if !decl.allowed_values.is_empty() && !decl.allowed_values.contains(&value) {
      diagnostics.push(invalid(format!(
        "'{}' is not one of the allowed values",
        value.to_interpolated()
      )));
      continue;
    }

    if let VariableType::Custom(type_name) = &decl.var_type {
      let custom = match registry.custom_variable_type(type_name) {
        Ok(custom) => custom,
        Err(err) => {
          diagnostics.push(
            Diagnostic::error(ReasonCode::ProviderNotFound, err.to_string())
              .for_element(element.clone())
              .with_range(decl.range),
          );
          continue;
        }
      };
      match custom.options().await {
        Ok(options) if options.values().any(|option| option == &value) => {}
        Ok(_) => diagnostics.push(invalid(format!(
          "'{}' is not a valid {type_name}",
          value.to_interpolated()
        ))),
        Err(err) => diagnostics.push(invalid(format!("failed to load options for {type_name}: {err}"))),
      }
    }
  }

  diagnostics
}
