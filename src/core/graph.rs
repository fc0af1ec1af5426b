//! Typed resource graph construction.
//!
//! Turns component declarations into nodes with IDs of the form
//! `component/type/name`. Edges are derived: an expression such as
//! `${{ databases.main.url }}` inside a deployment's inputs makes the
//! deployment depend on `component/database/main`. Several components can be
//! added to one builder to produce a single merged graph.

use super::expr;
use super::types::{ComponentConfig, Inputs, ResourceType};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Graph construction and validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("component '{0}' was already added")]
    DuplicateComponent(String),

    #[error("{node}: malformed expression '${{{{ {expression} }}}}'")]
    MalformedExpression { node: String, expression: String },

    #[error("{node}: '{expression}' does not name a known resource")]
    UnknownReference { node: String, expression: String },

    #[error("{node}: '{expression}' is ambiguous, qualify it with one of: {}", .candidates.join(", "))]
    AmbiguousReference {
        node: String,
        expression: String,
        candidates: Vec<String>,
    },

    #[error("{node}: variable '{variable}' is not declared")]
    UnknownVariable { node: String, variable: String },

    #[error("{node}: dependency '{alias}' is not declared")]
    UnknownDependency { node: String, alias: String },

    #[error("{node} depends on missing node {target}")]
    DanglingEdge { node: String, target: String },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Where the value of one expression comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reference {
    /// An output of another node, optionally walked into by `path`
    Output { node: String, path: Vec<String> },
    /// A component variable with its declared default
    Variable {
        name: String,
        #[serde(default)]
        default: Option<Value>,
    },
    /// `environment.*` / `component.*` values supplied at run time
    Context { key: String },
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub component: String,
    pub name: String,
    pub inputs: Inputs,
    pub depends_on: BTreeSet<String>,
    /// Expression text → value source
    #[serde(default)]
    pub references: BTreeMap<String, Reference>,
}

/// Build the conventional node ID.
pub fn node_id(component: &str, resource_type: ResourceType, name: &str) -> String {
    format!("{}/{}/{}", component, resource_type, name)
}

/// Node ID → Node. Iteration follows insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: IndexMap<String, Node>,
}

impl Graph {
    /// Assemble a graph from nodes, rejecting dangling edges and cycles.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self, GraphError> {
        let graph = Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        };
        graph.validate()?;
        Ok(graph)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Components that own at least one node, in first-seen order.
    pub fn components(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for n in self.nodes.values() {
            if !seen.contains(&n.component.as_str()) {
                seen.push(&n.component);
            }
        }
        seen
    }

    /// Nodes that list `id` in their `depends_on`, sorted.
    pub fn dependents_of(&self, id: &str) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .nodes
            .values()
            .filter(|n| n.depends_on.contains(id))
            .map(|n| n.id.as_str())
            .collect();
        out.sort_unstable();
        out
    }

    /// Every edge as `(dependent, dependency)`.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.nodes
            .values()
            .flat_map(|n| n.depends_on.iter().map(move |d| (n.id.as_str(), d.as_str())))
            .collect()
    }

    /// Check that every edge resolves and that no cycle exists.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.nodes.values() {
            if let Some(target) = node.depends_on.iter().find(|d| !self.contains(d)) {
                return Err(GraphError::DanglingEdge {
                    node: node.id.clone(),
                    target: target.clone(),
                });
            }
        }
        match self.find_cycle() {
            Some(path) => Err(GraphError::Cycle { path }),
            None => Ok(()),
        }
    }

    /// Depth-first search with an explicit on-stack set.
    ///
    /// Returns the cycle as the stack slice from the repeated node onward,
    /// closed with that node again, e.g. `[a, b, a]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            OnStack,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut roots: Vec<&str> = self.nodes.keys().map(String::as_str).collect();
        roots.sort_unstable();

        for root in roots {
            if marks.contains_key(root) {
                continue;
            }
            let mut path: Vec<&str> = vec![root];
            let mut frames: Vec<(Vec<&str>, usize)> = vec![(self.sorted_deps(root), 0)];
            marks.insert(root, Mark::OnStack);

            while let Some((deps, next)) = frames.last_mut() {
                if *next < deps.len() {
                    let dep = deps[*next];
                    *next += 1;
                    match marks.get(dep) {
                        Some(Mark::OnStack) => {
                            let start = path.iter().position(|p| *p == dep).unwrap_or(0);
                            let mut cycle: Vec<String> =
                                path[start..].iter().map(|s| s.to_string()).collect();
                            cycle.push(dep.to_string());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None if self.contains(dep) => {
                            marks.insert(dep, Mark::OnStack);
                            path.push(dep);
                            frames.push((self.sorted_deps(dep), 0));
                        }
                        None => {}
                    }
                } else {
                    if let Some(done) = path.pop() {
                        marks.insert(done, Mark::Done);
                    }
                    frames.pop();
                }
            }
        }
        None
    }

    fn sorted_deps(&self, id: &str) -> Vec<&str> {
        self.nodes
            .get(id)
            .map(|n| n.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// Accumulates components and produces a merged graph.
#[derive(Debug, Default, Clone)]
pub struct GraphBuilder {
    components: IndexMap<String, ComponentConfig>,
    /// (component, dependency alias) → component name it resolved to
    links: HashMap<(String, String), String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component. Checks references that stay inside the
    /// component right away; cross-component references are checked by
    /// [`GraphBuilder::build`].
    pub fn add_component(&mut self, name: &str, component: &ComponentConfig) -> Result<(), GraphError> {
        if self.components.contains_key(name) {
            return Err(GraphError::DuplicateComponent(name.to_string()));
        }
        for decl in component.declarations() {
            let id = node_id(name, decl.resource_type, decl.name);
            let mut found = Vec::new();
            expr::scan(&Value::Object(decl.inputs.clone().into_iter().collect()), &mut found);
            for expression in found {
                if !expression.starts_with("dependencies.") {
                    resolve_local(name, component, &id, &expression)?;
                }
            }
            for (ty, target) in &decl.field_refs {
                if !component.names_of(*ty).contains(&target.as_str()) {
                    return Err(GraphError::UnknownReference {
                        node: id.clone(),
                        expression: format!("{}.{}", ty.collection(), target),
                    });
                }
            }
        }
        self.components.insert(name.to_string(), component.clone());
        Ok(())
    }

    /// Record which component a dependency alias resolved to. Without a
    /// link the alias itself is taken as the component name.
    pub fn link_dependency(&mut self, component: &str, alias: &str, target: &str) {
        self.links
            .insert((component.to_string(), alias.to_string()), target.to_string());
    }

    pub fn component_names(&self) -> impl Iterator<Item = &String> {
        self.components.keys()
    }

    /// Produce the graph. Does not consume the builder, so repeated calls
    /// return equal graphs.
    pub fn build(&self) -> Result<Graph, GraphError> {
        let mut nodes = Vec::new();
        for (name, component) in &self.components {
            for decl in component.declarations() {
                let id = node_id(name, decl.resource_type, decl.name);
                let mut depends_on = BTreeSet::new();
                let mut references = BTreeMap::new();

                let mut found = Vec::new();
                expr::scan(&Value::Object(decl.inputs.clone().into_iter().collect()), &mut found);
                for expression in found {
                    let reference = if expression.starts_with("dependencies.") {
                        self.resolve_dependency(name, component, &id, &expression)?
                    } else {
                        resolve_local(name, component, &id, &expression)?
                    };
                    if let Reference::Output { node, .. } = &reference {
                        let external = !self.components.contains_key(component_of(node));
                        if !external {
                            depends_on.insert(node.clone());
                        }
                    }
                    references.insert(expression, reference);
                }
                for (ty, target) in &decl.field_refs {
                    depends_on.insert(node_id(name, *ty, target));
                }

                nodes.push(Node {
                    id,
                    resource_type: decl.resource_type,
                    component: name.clone(),
                    name: decl.name.to_string(),
                    inputs: decl.inputs,
                    depends_on,
                    references,
                });
            }
        }
        Graph::from_nodes(nodes)
    }

    fn resolve_dependency(
        &self,
        name: &str,
        component: &ComponentConfig,
        id: &str,
        expression: &str,
    ) -> Result<Reference, GraphError> {
        let malformed = || GraphError::MalformedExpression {
            node: id.to_string(),
            expression: expression.to_string(),
        };
        let segs = expr::segments(expression);
        if segs.len() < 4 {
            return Err(malformed());
        }
        let alias = segs[1];
        if !component.dependencies.contains_key(alias) {
            return Err(GraphError::UnknownDependency {
                node: id.to_string(),
                alias: alias.to_string(),
            });
        }
        let target_component = self
            .links
            .get(&(name.to_string(), alias.to_string()))
            .map(String::as_str)
            .unwrap_or(alias);
        let ty = ResourceType::from_qualifier(segs[2]).ok_or_else(malformed)?;
        let target = node_id(target_component, ty, segs[3]);

        if let Some(dep) = self.components.get(target_component) {
            if !dep.names_of(ty).contains(&segs[3]) {
                return Err(GraphError::UnknownReference {
                    node: id.to_string(),
                    expression: expression.to_string(),
                });
            }
        }
        Ok(Reference::Output {
            node: target,
            path: segs[4..].iter().map(|s| s.to_string()).collect(),
        })
    }
}

fn component_of(node_id: &str) -> &str {
    node_id.split('/').next().unwrap_or(node_id)
}

/// Resolve an expression that stays inside one component.
fn resolve_local(
    name: &str,
    component: &ComponentConfig,
    id: &str,
    expression: &str,
) -> Result<Reference, GraphError> {
    if !expr::is_valid_path(expression) {
        return Err(GraphError::MalformedExpression {
            node: id.to_string(),
            expression: expression.to_string(),
        });
    }
    let segs = expr::segments(expression);
    let unknown = || GraphError::UnknownReference {
        node: id.to_string(),
        expression: expression.to_string(),
    };

    match segs[0] {
        "variables" => {
            let var = segs.get(1).ok_or_else(unknown)?;
            let decl = component
                .variables
                .get(*var)
                .ok_or_else(|| GraphError::UnknownVariable {
                    node: id.to_string(),
                    variable: var.to_string(),
                })?;
            return Ok(Reference::Variable {
                name: var.to_string(),
                default: decl.default.clone(),
            });
        }
        "environment" | "component" if segs.len() > 1 => {
            return Ok(Reference::Context {
                key: expression.to_string(),
            });
        }
        _ => {}
    }

    // Type-qualified: databases.main.url / database.main.url
    if let (Some(ty), Some(target)) = (ResourceType::from_qualifier(segs[0]), segs.get(1)) {
        if component.names_of(ty).contains(target) {
            return Ok(Reference::Output {
                node: node_id(name, ty, target),
                path: segs[2..].iter().map(|s| s.to_string()).collect(),
            });
        }
    }

    // Unqualified: main.url
    let candidates: Vec<ResourceType> = ResourceType::ALL
        .into_iter()
        .filter(|ty| component.names_of(*ty).contains(&segs[0]))
        .collect();
    match candidates.as_slice() {
        [] => Err(unknown()),
        [ty] => Ok(Reference::Output {
            node: node_id(name, *ty, segs[0]),
            path: segs[1..].iter().map(|s| s.to_string()).collect(),
        }),
        many => Err(GraphError::AmbiguousReference {
            node: id.to_string(),
            expression: expression.to_string(),
            candidates: many
                .iter()
                .map(|ty| format!("{}.{}", ty.collection(), segs[0]))
                .collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(yaml: &str) -> ComponentConfig {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn build_one(name: &str, yaml: &str) -> Result<Graph, GraphError> {
        let mut b = GraphBuilder::new();
        b.add_component(name, &component(yaml))?;
        b.build()
    }

    const APP_A: &str = r#"
databases:
  main:
    type: "postgres:15"
deployments:
  api:
    image: nginx
    environment:
      DB_URL: "${{ databases.main.url }}"
"#;

    #[test]
    fn test_graph_database_deployment_edge() {
        let g = build_one("appA", APP_A).unwrap();
        assert_eq!(g.len(), 2);
        let api = g.get("appA/deployment/api").unwrap();
        assert_eq!(
            api.depends_on.iter().collect::<Vec<_>>(),
            vec!["appA/database/main"]
        );
        assert!(g.get("appA/database/main").unwrap().depends_on.is_empty());
        assert_eq!(
            api.references["databases.main.url"],
            Reference::Output {
                node: "appA/database/main".to_string(),
                path: vec!["url".to_string()],
            }
        );
    }

    #[test]
    fn test_graph_unqualified_reference() {
        let yaml = r#"
databases:
  main: { type: postgres }
deployments:
  api:
    environment:
      DB: "${{ main.url }}"
"#;
        let g = build_one("c", yaml).unwrap();
        assert!(g.get("c/deployment/api").unwrap().depends_on.contains("c/database/main"));
    }

    #[test]
    fn test_graph_ambiguous_reference_rejected() {
        let yaml = r#"
databases:
  main: { type: postgres }
buckets:
  main: {}
deployments:
  api:
    environment:
      DB: "${{ main.url }}"
"#;
        let mut b = GraphBuilder::new();
        let err = b.add_component("c", &component(yaml)).unwrap_err();
        match err {
            GraphError::AmbiguousReference { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
                assert!(candidates.contains(&"databases.main".to_string()));
                assert!(candidates.contains(&"buckets.main".to_string()));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_graph_qualified_disambiguates() {
        let yaml = r#"
databases:
  main: { type: postgres }
buckets:
  main: {}
deployments:
  api:
    environment:
      DB: "${{ databases.main.url }}"
      BUCKET: "${{ bucket.main.name }}"
"#;
        let g = build_one("c", yaml).unwrap();
        let deps = &g.get("c/deployment/api").unwrap().depends_on;
        assert!(deps.contains("c/database/main"));
        assert!(deps.contains("c/bucket/main"));
    }

    #[test]
    fn test_graph_unknown_reference_rejected() {
        let yaml = r#"
deployments:
  api:
    environment:
      DB: "${{ databases.ghost.url }}"
"#;
        let err = build_one("c", yaml).unwrap_err();
        assert!(matches!(err, GraphError::UnknownReference { .. }));
    }

    #[test]
    fn test_graph_mutual_reference_is_cycle() {
        let yaml = r#"
deployments:
  a:
    environment:
      B: "${{ functions.b.url }}"
functions:
  b:
    environment:
      A: "${{ deployments.a.url }}"
"#;
        let err = build_one("c", yaml).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                assert!(path.contains(&"c/deployment/a".to_string()));
                assert!(path.contains(&"c/function/b".to_string()));
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_graph_field_refs_create_edges() {
        let yaml = r#"
deployments:
  api: { image: nginx }
services:
  api: { deployment: api, port: 80 }
routes:
  public: { service: api }
"#;
        let g = build_one("c", yaml).unwrap();
        assert!(g.get("c/service/api").unwrap().depends_on.contains("c/deployment/api"));
        assert!(g.get("c/route/public").unwrap().depends_on.contains("c/service/api"));
        assert_eq!(g.dependents_of("c/deployment/api"), vec!["c/service/api"]);
    }

    #[test]
    fn test_graph_field_ref_to_missing_service() {
        let yaml = r#"
routes:
  public: { service: nope }
"#;
        assert!(matches!(
            build_one("c", yaml).unwrap_err(),
            GraphError::UnknownReference { .. }
        ));
    }

    #[test]
    fn test_graph_variables_and_context() {
        let yaml = r#"
variables:
  level: { default: info }
deployments:
  api:
    environment:
      LOG: "${{ variables.level }}"
      ENV: "${{ environment.name }}"
"#;
        let g = build_one("c", yaml).unwrap();
        let api = g.get("c/deployment/api").unwrap();
        assert!(api.depends_on.is_empty());
        assert_eq!(
            api.references["variables.level"],
            Reference::Variable {
                name: "level".to_string(),
                default: Some(Value::String("info".to_string())),
            }
        );
        assert!(matches!(api.references["environment.name"], Reference::Context { .. }));
    }

    #[test]
    fn test_graph_undeclared_variable() {
        let yaml = r#"
deployments:
  api:
    environment:
      LOG: "${{ variables.nope }}"
"#;
        assert!(matches!(
            build_one("c", yaml).unwrap_err(),
            GraphError::UnknownVariable { .. }
        ));
    }

    #[test]
    fn test_graph_cross_component_edge() {
        let auth = component(
            r#"
services:
  api: { deployment: api }
deployments:
  api: { image: auth }
"#,
        );
        let app = component(
            r#"
dependencies:
  auth: ./auth
deployments:
  web:
    environment:
      AUTH_URL: "${{ dependencies.auth.services.api.url }}"
"#,
        );
        let mut b = GraphBuilder::new();
        b.add_component("auth-svc", &auth).unwrap();
        b.add_component("app", &app).unwrap();
        b.link_dependency("app", "auth", "auth-svc");
        let g = b.build().unwrap();
        assert_eq!(g.len(), 3);
        assert!(g.get("app/deployment/web").unwrap().depends_on.contains("auth-svc/service/api"));
        assert_eq!(g.components(), vec!["auth-svc", "app"]);
    }

    #[test]
    fn test_graph_cross_component_absent_is_external() {
        let app = component(
            r#"
dependencies:
  auth: ./auth
deployments:
  web:
    environment:
      AUTH_URL: "${{ dependencies.auth.services.api.url }}"
"#,
        );
        let mut b = GraphBuilder::new();
        b.add_component("app", &app).unwrap();
        let g = b.build().unwrap();
        let web = g.get("app/deployment/web").unwrap();
        assert!(web.depends_on.is_empty());
        assert!(matches!(web.references.values().next(), Some(Reference::Output { .. })));
    }

    #[test]
    fn test_graph_cross_component_missing_resource() {
        let auth = component("deployments:\n  api: { image: auth }\n");
        let app = component(
            r#"
dependencies:
  auth: ./auth
deployments:
  web:
    environment:
      AUTH_URL: "${{ dependencies.auth.services.api.url }}"
"#,
        );
        let mut b = GraphBuilder::new();
        b.add_component("auth", &auth).unwrap();
        b.add_component("app", &app).unwrap();
        assert!(matches!(b.build().unwrap_err(), GraphError::UnknownReference { .. }));
    }

    #[test]
    fn test_graph_duplicate_component() {
        let mut b = GraphBuilder::new();
        b.add_component("a", &component(APP_A)).unwrap();
        assert_eq!(
            b.add_component("a", &component(APP_A)).unwrap_err(),
            GraphError::DuplicateComponent("a".to_string())
        );
    }

    #[test]
    fn test_graph_build_is_idempotent() {
        let mut b = GraphBuilder::new();
        b.add_component("a", &component(APP_A)).unwrap();
        assert_eq!(b.build().unwrap(), b.build().unwrap());
    }

    #[test]
    fn test_graph_dangling_edge_rejected() {
        let node = Node {
            id: "c/deployment/a".to_string(),
            resource_type: ResourceType::Deployment,
            component: "c".to_string(),
            name: "a".to_string(),
            inputs: Inputs::new(),
            depends_on: BTreeSet::from(["c/database/gone".to_string()]),
            references: BTreeMap::new(),
        };
        assert_eq!(
            Graph::from_nodes([node]).unwrap_err(),
            GraphError::DanglingEdge {
                node: "c/deployment/a".to_string(),
                target: "c/database/gone".to_string(),
            }
        );
    }

    #[test]
    fn test_graph_cycle_message_names_path() {
        let err = GraphError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }
}
