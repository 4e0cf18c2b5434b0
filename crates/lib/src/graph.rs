//! Dependency graph of blueprint elements.
//!
//! Resources, links and child blueprints are nodes; an edge points from a
//! dependency to its dependent. The graph is built once per run from the
//! expanded blueprint and never mutated afterwards.
//!
//! Edges come from three places:
//! - explicit `depends_on` lists
//! - references found by walking every substitution of an element,
//!   including function arguments and data source filters it reads
//! - link selectors, which add a link node depending on both resources and,
//!   depending on the link provider's priority, an edge between the two

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::blueprint::Expansion;
use crate::diagnostics::{Diagnostic, ReasonCode};
use crate::registry::{LinkPriority, ProviderRegistry};
use crate::schema::{Blueprint, Condition, ResourceMetadata};
use crate::substitution::{ElementRef, collect_node_refs};
use crate::value::MappingNode;

/// A node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementId {
  Resource(String),
  Link(String),
  Child(String),
}

impl ElementId {
  /// Parse an id in its display form, e.g. `resources.orders`.
  pub fn parse(id: &str) -> Option<Self> {
    let (kind, name) = id.split_once('.')?;
    match kind {
      "resources" => Some(ElementId::Resource(name.to_string())),
      "links" => Some(ElementId::Link(name.to_string())),
      "children" => Some(ElementId::Child(name.to_string())),
      _ => None,
    }
  }

  pub fn name(&self) -> &str {
    match self {
      ElementId::Resource(name) | ElementId::Link(name) | ElementId::Child(name) => name,
    }
  }
}

impl std::fmt::Display for ElementId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ElementId::Resource(name) => write!(f, "resources.{name}"),
      ElementId::Link(name) => write!(f, "links.{name}"),
      ElementId::Child(name) => write!(f, "children.{name}"),
    }
  }
}

/// The two resources joined by a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEndpoints {
  pub name: String,
  /// The selecting resource.
  pub resource_a: String,
  /// The selected resource.
  pub resource_b: String,
}

/// The registry name of the link between two resources.
pub fn link_name(resource_a: &str, resource_b: &str) -> String {
  format!("{resource_a}::{resource_b}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("{element} depends on unknown element '{dependency}'")]
  UnknownDependency { element: String, dependency: String },

  #[error("dependency cycle: {}", .path.join(" -> "))]
  Cycle {
    /// Every element on the cycle, starting and ending with the same one.
    path: Vec<String>,
  },
}

impl GraphError {
  pub fn to_diagnostic(&self) -> Diagnostic {
    match self {
      GraphError::UnknownDependency { element, .. } => {
        Diagnostic::error(ReasonCode::UnknownElement, self.to_string()).for_element(element.clone())
      }
      GraphError::Cycle { .. } => Diagnostic::error(ReasonCode::DependencyCycle, self.to_string()),
    }
  }
}

/// An acyclic graph of resources, links and children.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
  graph: DiGraph<ElementId, ()>,
  nodes: HashMap<ElementId, NodeIndex>,
  links: BTreeMap<String, LinkEndpoints>,
}

impl DependencyGraph {
  /// Build the graph for an expanded blueprint.
  ///
  /// Returns the graph and any warnings raised while selecting links.
  ///
  /// # Errors
  ///
  /// Returns `UnknownDependency` if a `depends_on` entry names nothing in
  /// the blueprint, and `Cycle` if the elements depend on each other.
  pub fn build(
    blueprint: &Blueprint,
    expansion: &Expansion,
    registry: &ProviderRegistry,
  ) -> Result<(Self, Vec<Diagnostic>), GraphError> {
    let mut dag = Self::default();
    let mut warnings = Vec::new();

    for instance in expansion.instances() {
      dag.add_node(ElementId::Resource(instance.name.clone()));
    }
    for name in blueprint.includes.keys() {
      dag.add_node(ElementId::Child(name.clone()));
    }

    for instance in expansion.instances() {
      let Some(decl) = blueprint.resources.get(&instance.template) else {
        continue;
      };
      let element = ElementId::Resource(instance.name.clone());

      for dep in &decl.depends_on {
        for dependency in dag.resolve_dependency(blueprint, expansion, &element, dep)? {
          dag.add_edge(&dependency, &element);
        }
      }

      let mut nodes: Vec<&MappingNode> = vec![&decl.spec];
      nodes.extend(metadata_nodes(&decl.metadata));
      nodes.extend(condition_nodes(decl.condition.as_ref()));
      nodes.extend(decl.each.as_ref());
      for dependency in reference_targets(blueprint, expansion, &nodes) {
        dag.add_edge(&dependency, &element);
      }
    }

    for (name, include) in &blueprint.includes {
      let element = ElementId::Child(name.clone());

      for dep in &include.depends_on {
        for dependency in dag.resolve_dependency(blueprint, expansion, &element, dep)? {
          dag.add_edge(&dependency, &element);
        }
      }

      let mut nodes: Vec<&MappingNode> = vec![&include.path];
      nodes.extend(include.variables.values());
      nodes.extend(include.metadata.as_ref());
      nodes.extend(condition_nodes(include.condition.as_ref()));
      for dependency in reference_targets(blueprint, expansion, &nodes) {
        dag.add_edge(&dependency, &element);
      }
    }

    dag.add_links(blueprint, expansion, registry, &mut warnings);
    dag.verify_acyclic()?;

    debug!(
      nodes = dag.graph.node_count(),
      edges = dag.graph.edge_count(),
      links = dag.links.len(),
      "built dependency graph"
    );
    Ok((dag, warnings))
  }

  fn add_node(&mut self, id: ElementId) -> NodeIndex {
    if let Some(&idx) = self.nodes.get(&id) {
      return idx;
    }
    let idx = self.graph.add_node(id.clone());
    self.nodes.insert(id, idx);
    idx
  }

  fn add_edge(&mut self, from: &ElementId, to: &ElementId) {
    let (Some(&from_idx), Some(&to_idx)) = (self.nodes.get(from), self.nodes.get(to)) else {
      return;
    };
    if !self.graph.contains_edge(from_idx, to_idx) {
      self.graph.add_edge(from_idx, to_idx, ());
    }
  }

  /// Map a `depends_on` entry to graph nodes. Templates expand to all of
  /// their instances.
  fn resolve_dependency(
    &self,
    blueprint: &Blueprint,
    expansion: &Expansion,
    element: &ElementId,
    dependency: &str,
  ) -> Result<Vec<ElementId>, GraphError> {
    if blueprint.resources.contains_key(dependency) {
      return Ok(resource_targets(expansion, dependency, None));
    }
    if blueprint.includes.contains_key(dependency) {
      return Ok(vec![ElementId::Child(dependency.to_string())]);
    }
    Err(GraphError::UnknownDependency {
      element: element.to_string(),
      dependency: dependency.to_string(),
    })
  }

  fn add_links(
    &mut self,
    blueprint: &Blueprint,
    expansion: &Expansion,
    registry: &ProviderRegistry,
    warnings: &mut Vec<Diagnostic>,
  ) {
    let active: Vec<_> = expansion
      .instances()
      .filter(|i| !expansion.is_resource_excluded(&i.name))
      .filter_map(|i| blueprint.resources.get(&i.template).map(|decl| (i, decl)))
      .collect();

    for (source, source_decl) in &active {
      let Some(selector) = &source_decl.link_selector else {
        continue;
      };
      for (target, target_decl) in &active {
        if source.name == target.name || !selector.matches(&target_decl.metadata.labels) {
          continue;
        }

        let Some(provider) = registry.link(&source_decl.resource_type, &target_decl.resource_type) else {
          warnings.push(
            Diagnostic::warning(
              ReasonCode::LinkProviderMissing,
              format!(
                "no link provider for {} -> {}; resources are not linked",
                source_decl.resource_type, target_decl.resource_type
              ),
            )
            .for_element(format!("resources.{}", source.name))
            .with_range(source_decl.range),
          );
          continue;
        };

        let name = link_name(&source.name, &target.name);
        let link = ElementId::Link(name.clone());
        let a = ElementId::Resource(source.name.clone());
        let b = ElementId::Resource(target.name.clone());
        self.add_node(link.clone());
        self.add_edge(&a, &link);
        self.add_edge(&b, &link);
        match provider.priority() {
          LinkPriority::ResourceA => self.add_edge(&a, &b),
          LinkPriority::ResourceB => self.add_edge(&b, &a),
          LinkPriority::None => {}
        }
        self.links.insert(
          name.clone(),
          LinkEndpoints {
            name,
            resource_a: source.name.clone(),
            resource_b: target.name.clone(),
          },
        );
      }
    }
  }

  /// Reject cycles, reporting every element on the first one found.
  fn verify_acyclic(&self) -> Result<(), GraphError> {
    if toposort(&self.graph, None).is_ok() {
      return Ok(());
    }

    let mut components = tarjan_scc(&self.graph);
    components.sort_by_key(|scc| scc.iter().map(|idx| self.graph[*idx].clone()).min());
    for scc in components {
      let self_loop = scc.len() == 1 && self.graph.contains_edge(scc[0], scc[0]);
      if scc.len() > 1 || self_loop {
        return Err(GraphError::Cycle {
          path: self.cycle_path(&scc).iter().map(ToString::to_string).collect(),
        });
      }
    }
    Err(GraphError::Cycle { path: Vec::new() })
  }

  /// Walk a strongly connected component back to its smallest element.
  fn cycle_path(&self, scc: &[NodeIndex]) -> Vec<ElementId> {
    let members: HashSet<NodeIndex> = scc.iter().copied().collect();
    let Some(&start) = scc.iter().min_by_key(|idx| &self.graph[**idx]) else {
      return Vec::new();
    };

    let mut path = vec![start];
    let mut visited = HashSet::from([start]);
    if self.walk_cycle(start, start, &members, &mut visited, &mut path) {
      return path.into_iter().map(|idx| self.graph[idx].clone()).collect();
    }
    scc.iter().map(|idx| self.graph[*idx].clone()).collect()
  }

  fn walk_cycle(
    &self,
    current: NodeIndex,
    start: NodeIndex,
    members: &HashSet<NodeIndex>,
    visited: &mut HashSet<NodeIndex>,
    path: &mut Vec<NodeIndex>,
  ) -> bool {
    let mut next: Vec<NodeIndex> = self
      .graph
      .neighbors_directed(current, Direction::Outgoing)
      .filter(|n| members.contains(n))
      .collect();
    next.sort_by_key(|idx| self.graph[*idx].clone());

    for neighbor in next {
      if neighbor == start {
        path.push(start);
        return true;
      }
      if visited.insert(neighbor) {
        path.push(neighbor);
        if self.walk_cycle(neighbor, start, members, visited, path) {
          return true;
        }
        path.pop();
      }
    }
    false
  }

  /// Elements grouped into waves that can run in parallel.
  ///
  /// Every element's dependencies are in earlier waves. Elements within a
  /// wave are sorted.
  pub fn execution_waves(&self) -> Vec<Vec<ElementId>> {
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|idx| in_degree[*idx] == 0).copied().collect();
      if ready.is_empty() {
        // Unreachable for a verified graph.
        break;
      }

      for &idx in &ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
      }

      let mut wave: Vec<ElementId> = ready.into_iter().map(|idx| self.graph[idx].clone()).collect();
      wave.sort();
      waves.push(wave);
    }

    waves
  }

  /// Execution waves containing only `selected` elements.
  pub fn execution_waves_for(&self, selected: &BTreeSet<ElementId>) -> Vec<Vec<ElementId>> {
    self
      .execution_waves()
      .into_iter()
      .map(|wave| wave.into_iter().filter(|id| selected.contains(id)).collect::<Vec<_>>())
      .filter(|wave| !wave.is_empty())
      .collect()
  }

  /// Elements ordered so that dependencies come first.
  pub fn topological_order(&self) -> Vec<ElementId> {
    self.execution_waves().into_iter().flatten().collect()
  }

  /// Direct dependencies of an element.
  pub fn dependencies(&self, id: &ElementId) -> Vec<ElementId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct dependents of an element.
  pub fn dependents(&self, id: &ElementId) -> Vec<ElementId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: &ElementId, direction: Direction) -> Vec<ElementId> {
    let Some(&idx) = self.nodes.get(id) else {
      return Vec::new();
    };
    let mut out: Vec<ElementId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out
  }

  /// Every element that depends on `id`, directly or transitively.
  pub fn dependents_transitive(&self, id: &ElementId) -> BTreeSet<ElementId> {
    let mut out = BTreeSet::new();
    let Some(&start) = self.nodes.get(id) else {
      return out;
    };

    let mut stack = vec![start];
    let mut seen = HashSet::from([start]);
    while let Some(idx) = stack.pop() {
      for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
        if seen.insert(neighbor) {
          out.insert(self.graph[neighbor].clone());
          stack.push(neighbor);
        }
      }
    }
    out
  }

  pub fn links(&self) -> impl Iterator<Item = &LinkEndpoints> {
    self.links.values()
  }

  pub fn link(&self, name: &str) -> Option<&LinkEndpoints> {
    self.links.get(name)
  }

  pub fn contains(&self, id: &ElementId) -> bool {
    self.nodes.contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }
}

fn metadata_nodes(metadata: &ResourceMetadata) -> Vec<&MappingNode> {
  let mut nodes: Vec<&MappingNode> = metadata.display_name.iter().collect();
  nodes.extend(metadata.annotations.values());
  nodes.extend(metadata.custom.as_ref());
  nodes
}

fn condition_nodes(condition: Option<&Condition>) -> Vec<&MappingNode> {
  condition.map(Condition::expressions).unwrap_or_default()
}

fn resource_targets(expansion: &Expansion, resource: &str, index: Option<usize>) -> Vec<ElementId> {
  match (expansion.template_instances(resource), index) {
    (Some(instances), Some(idx)) => instances
      .get(idx)
      .map(|name| vec![ElementId::Resource(name.clone())])
      .unwrap_or_default(),
    (Some(instances), None) => instances.iter().map(|name| ElementId::Resource(name.clone())).collect(),
    (None, _) => vec![ElementId::Resource(resource.to_string())],
  }
}

/// Graph nodes referenced from a set of value trees. Data source references
/// are followed into the data source's filter.
fn reference_targets(blueprint: &Blueprint, expansion: &Expansion, nodes: &[&MappingNode]) -> BTreeSet<ElementId> {
  let mut refs = Vec::new();
  for node in nodes {
    collect_node_refs(node, &mut refs);
  }

  let mut targets = BTreeSet::new();
  let mut seen_data_sources = BTreeSet::new();
  while let Some(reference) = refs.pop() {
    match reference {
      ElementRef::Resource { name, index } => {
        if blueprint.resources.contains_key(&name) {
          targets.extend(resource_targets(expansion, &name, index));
        }
      }
      ElementRef::Child { name } => {
        if blueprint.includes.contains_key(&name) {
          targets.insert(ElementId::Child(name));
        }
      }
      ElementRef::DataSource { name } => {
        if seen_data_sources.insert(name.clone())
          && let Some(filter) = blueprint.data_sources.get(&name).and_then(|ds| ds.filter.as_ref())
        {
          collect_node_refs(&filter.search, &mut refs);
        }
      }
    }
  }
  targets
}
