//! Component dependency resolution.
//!
//! Expands a root component reference into every component it depends on,
//! transitively. References are canonicalised so a component reached
//! through two different dependents is loaded once. Cycles are detected
//! with an explicit on-stack list during the depth-first walk, and the
//! post-order of that walk is the returned topological `order`.

use super::graph::{Graph, GraphBuilder, GraphError};
use super::parser::{self, ValidationErrors};
use super::types::ComponentConfig;
use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

static REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^(?P<repo>(?:[a-z0-9.-]+(?::[0-9]+)?/)?",
        r"[a-z0-9]+(?:[._-][a-z0-9]+)*(?:/[a-z0-9]+(?:[._-][a-z0-9]+)*)*)",
        r"(?::(?P<tag>[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}))?",
        r"(?:@(?P<digest>sha256:[0-9a-f]{64}))?$"
    ))
    .expect("remote reference pattern is valid")
});

const COMPONENT_FILES: &[&str] = &["component.yml", "component.yaml"];

/// Resolution failures. None of them return a partial graph.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed reference '{reference}': {reason}")]
    MalformedReference { reference: String, reason: String },

    #[error("component '{reference}' not found at {}", .location.display())]
    NotFound { reference: String, location: PathBuf },

    #[error("failed to load '{reference}': {message}")]
    Load { reference: String, message: String },

    #[error("{}", render_invalid(.0))]
    Invalid(Vec<ValidationErrors>),

    #[error("component dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("component name '{name}' is used by both {first} and {second}")]
    NameConflict {
        name: String,
        first: String,
        second: String,
    },

    #[error("component '{component}': {source}")]
    Graph {
        component: String,
        #[source]
        source: GraphError,
    },

    #[error("resolution cancelled")]
    Cancelled,
}

fn render_invalid(all: &[ValidationErrors]) -> String {
    all.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

// ============================================================================
// References
// ============================================================================

/// Where a component comes from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ComponentRef {
    /// Directory holding `component.yml`, or the file itself
    Local(PathBuf),
    /// Content-addressed registry reference
    Remote {
        repository: String,
        tag: Option<String>,
        digest: Option<String>,
    },
}

/// Whether a component was loaded from disk or a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Local,
    Remote,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl ComponentRef {
    /// Classify a reference string.
    ///
    /// Paths starting with `.`, `/` or `~` are local. Anything else must be
    /// a registry reference `[host[:port]/]repo[:tag][@sha256:<hex>]`, except
    /// plain slash-separated paths, which are taken as local.
    pub fn parse(s: &str) -> Result<Self, ResolveError> {
        let malformed = |reason: &str| ResolveError::MalformedReference {
            reference: s.to_string(),
            reason: reason.to_string(),
        };
        let s = s.trim();
        if s.is_empty() {
            return Err(malformed("empty reference"));
        }
        if s == "." || s == ".." || s.starts_with("./") || s.starts_with("../") || s.starts_with('/') || s.starts_with("~/") {
            return Ok(Self::Local(PathBuf::from(s)));
        }
        if let Some(caps) = REMOTE.captures(s) {
            return Ok(Self::Remote {
                repository: caps["repo"].to_string(),
                tag: caps.name("tag").map(|m| m.as_str().to_string()),
                digest: caps.name("digest").map(|m| m.as_str().to_string()),
            });
        }
        if s.contains('@') {
            return Err(malformed("digest must be sha256:<64 lowercase hex>"));
        }
        if s.contains(':') {
            return Err(malformed("not a valid registry reference"));
        }
        if s.contains('/') {
            return Ok(Self::Local(PathBuf::from(s)));
        }
        Err(malformed("neither a local path nor a registry reference"))
    }

    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Local(_) => SourceKind::Local,
            Self::Remote { .. } => SourceKind::Remote,
        }
    }

    /// Anchor a relative local path at `base`, normalise it lexically and
    /// expand `~/`. Remote references are returned unchanged.
    pub fn anchored(&self, base: &Path) -> Self {
        match self {
            Self::Local(path) => {
                let expanded = match path.strip_prefix("~") {
                    Ok(rest) => std::env::var_os("HOME")
                        .map(|home| PathBuf::from(home).join(rest))
                        .unwrap_or_else(|| path.clone()),
                    Err(_) => path.clone(),
                };
                let joined = if expanded.is_absolute() {
                    expanded
                } else {
                    base.join(expanded)
                };
                Self::Local(normalize(&joined))
            }
            remote => remote.clone(),
        }
    }

    /// Dedup key: absolute path, `repo:tag`, or `repo@digest`.
    pub fn canonical(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote {
                repository,
                digest: Some(d),
                ..
            } => format!("{}@{}", repository, d),
            Self::Remote { repository, tag, .. } => {
                format!("{}:{}", repository, tag.as_deref().unwrap_or("latest"))
            }
        }
    }

    /// Name used when the component does not declare one.
    pub fn derived_name(&self) -> Option<String> {
        match self {
            Self::Remote { repository, .. } => repository.rsplit('/').next().map(str::to_string),
            Self::Local(path) => {
                let is_file = path
                    .extension()
                    .is_some_and(|e| e == "yml" || e == "yaml");
                let dir = if is_file { path.parent()? } else { path.as_path() };
                dir.file_name().map(|n| n.to_string_lossy().to_string())
            }
        }
    }
}

impl fmt::Display for ComponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for part in path.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ============================================================================
// Loading
// ============================================================================

/// A parsed but unvalidated component plus the directory relative
/// dependency paths are anchored at.
#[derive(Debug, Clone)]
pub struct LoadedComponent {
    pub component: ComponentConfig,
    pub dir: Option<PathBuf>,
}

/// Reads component definitions for the resolver.
#[async_trait]
pub trait ComponentLoader: Send + Sync {
    async fn load(&self, reference: &ComponentRef) -> Result<LoadedComponent, ResolveError>;
}

/// Filesystem loader. Remote references are served from a local content
/// cache laid out as `<cache>/<repository>/<tag | sha256-hex>/component.yml`.
#[derive(Debug, Clone, Default)]
pub struct FsComponentLoader {
    cache_dir: Option<PathBuf>,
}

impl FsComponentLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(cache_dir.into()),
        }
    }

    fn location(&self, reference: &ComponentRef) -> Result<PathBuf, ResolveError> {
        match reference {
            ComponentRef::Local(path) => Ok(path.clone()),
            ComponentRef::Remote {
                repository,
                tag,
                digest,
            } => {
                let cache = self.cache_dir.as_ref().ok_or_else(|| ResolveError::Load {
                    reference: reference.canonical(),
                    message: "no component cache configured for remote references".to_string(),
                })?;
                let version = match (digest, tag) {
                    (Some(d), _) => d.replace(':', "-"),
                    (None, Some(t)) => t.clone(),
                    (None, None) => "latest".to_string(),
                };
                Ok(cache.join(repository).join(version))
            }
        }
    }
}

#[async_trait]
impl ComponentLoader for FsComponentLoader {
    async fn load(&self, reference: &ComponentRef) -> Result<LoadedComponent, ResolveError> {
        let location = self.location(reference)?;
        let file = if tokio::fs::metadata(&location)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            let mut found = None;
            for name in COMPONENT_FILES {
                let candidate = location.join(name);
                if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                    found = Some(candidate);
                    break;
                }
            }
            found.ok_or_else(|| ResolveError::NotFound {
                reference: reference.canonical(),
                location: location.join(COMPONENT_FILES[0]),
            })?
        } else {
            location.clone()
        };

        let content = tokio::fs::read_to_string(&file).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResolveError::NotFound {
                    reference: reference.canonical(),
                    location: file.clone(),
                }
            } else {
                ResolveError::Load {
                    reference: reference.canonical(),
                    message: e.to_string(),
                }
            }
        })?;
        let component = parser::parse_component(&content).map_err(|e| ResolveError::Load {
            reference: reference.canonical(),
            message: e.to_string(),
        })?;
        Ok(LoadedComponent {
            component,
            dir: file.parent().map(Path::to_path_buf),
        })
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// One component in a resolved tree.
#[derive(Debug, Clone)]
pub struct ResolvedComponent {
    pub name: String,
    pub component: ComponentConfig,
    /// Canonical reference it was loaded from
    pub source: String,
    pub kind: SourceKind,
    pub dir: Option<PathBuf>,
    /// The component's own graph
    pub graph: Graph,
    /// Dependency alias → resolved component name
    pub dependencies: IndexMap<String, String>,
}

/// Result of one top-level resolve call.
#[derive(Debug, Clone)]
pub struct ResolvedComponentGraph {
    /// Dependencies before dependents; the root is last
    pub order: Vec<String>,
    pub all: IndexMap<String, ResolvedComponent>,
}

impl ResolvedComponentGraph {
    pub fn root(&self) -> Option<&ResolvedComponent> {
        self.order.last().and_then(|name| self.all.get(name))
    }

    /// Builder holding every component in `order` with dependency links.
    pub fn builder(&self) -> Result<GraphBuilder, GraphError> {
        let mut builder = GraphBuilder::new();
        for name in &self.order {
            let Some(resolved) = self.all.get(name) else {
                continue;
            };
            builder.add_component(name, &resolved.component)?;
            for (alias, target) in &resolved.dependencies {
                builder.link_dependency(name, alias, target);
            }
        }
        Ok(builder)
    }

    /// Single graph spanning every resolved component.
    pub fn graph(&self) -> Result<Graph, GraphError> {
        self.builder()?.build()
    }
}

/// Expands component references into a [`ResolvedComponentGraph`].
#[derive(Clone)]
pub struct DependencyResolver {
    loader: Arc<dyn ComponentLoader>,
}

#[derive(Default)]
struct Walk {
    /// canonical → component name, for finished components
    done: HashMap<String, String>,
    /// (canonical, display name) of the active path
    stack: Vec<(String, String)>,
    /// name → canonical, for conflict detection
    names: HashMap<String, String>,
    order: Vec<String>,
    all: IndexMap<String, ResolvedComponent>,
    invalid: Vec<ValidationErrors>,
}

impl DependencyResolver {
    pub fn new(loader: Arc<dyn ComponentLoader>) -> Self {
        Self { loader }
    }

    /// Resolve `reference` and everything it depends on. Relative local
    /// references are anchored at the current directory.
    #[instrument(skip(self, cancel))]
    pub async fn resolve(
        &self,
        reference: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedComponentGraph, ResolveError> {
        let cwd = std::env::current_dir().map_err(|e| ResolveError::Load {
            reference: reference.to_string(),
            message: format!("cannot determine current directory: {}", e),
        })?;
        let root = ComponentRef::parse(reference)?.anchored(&cwd);

        let mut walk = Walk::default();
        self.visit(root, true, &mut walk, cancel).await?;

        if !walk.invalid.is_empty() {
            return Err(ResolveError::Invalid(walk.invalid));
        }
        info!(components = walk.order.len(), "resolved component tree");
        Ok(ResolvedComponentGraph {
            order: walk.order,
            all: walk.all,
        })
    }

    fn visit<'a>(
        &'a self,
        reference: ComponentRef,
        is_root: bool,
        walk: &'a mut Walk,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<String, ResolveError>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(ResolveError::Cancelled);
            }
            let canonical = reference.canonical();
            if let Some(name) = walk.done.get(&canonical) {
                debug!(reference = %canonical, "already resolved");
                return Ok(name.clone());
            }
            if let Some(start) = walk.stack.iter().position(|(c, _)| *c == canonical) {
                let mut path: Vec<String> =
                    walk.stack[start..].iter().map(|(_, n)| n.clone()).collect();
                path.push(walk.stack[start].1.clone());
                return Err(ResolveError::Cycle { path });
            }

            debug!(reference = %canonical, "loading component");
            let loaded = self.loader.load(&reference).await?;
            let component = loaded.component;

            let name = component
                .name
                .clone()
                .or_else(|| match (&reference, is_root) {
                    (ComponentRef::Remote { .. }, _) => reference.derived_name(),
                    (ComponentRef::Local(_), true) => Some("root".to_string()),
                    (ComponentRef::Local(_), false) => reference.derived_name(),
                })
                .unwrap_or_else(|| "root".to_string());
            if let Some(existing) = walk.names.get(&name) {
                if *existing != canonical {
                    return Err(ResolveError::NameConflict {
                        name,
                        first: existing.clone(),
                        second: canonical,
                    });
                }
            }
            walk.names.insert(name.clone(), canonical.clone());

            let errors = parser::validate_component(&component);
            let valid = errors.is_empty();
            if !valid {
                walk.invalid.push(ValidationErrors {
                    origin: format!("{} ({})", name, canonical),
                    errors,
                });
            }

            walk.stack.push((canonical.clone(), name.clone()));
            let base = loaded.dir.clone().unwrap_or_else(|| PathBuf::from("."));
            let mut dependencies = IndexMap::new();
            for (alias, raw) in &component.dependencies {
                // Malformed references were already reported by validation
                let Ok(dep) = ComponentRef::parse(raw) else {
                    continue;
                };
                let dep_name = self.visit(dep.anchored(&base), false, walk, cancel).await?;
                dependencies.insert(alias.clone(), dep_name);
            }
            walk.stack.pop();

            let graph = if valid {
                let mut builder = GraphBuilder::new();
                builder
                    .add_component(&name, &component)
                    .and_then(|_| builder.build())
                    .map_err(|source| ResolveError::Graph {
                        component: name.clone(),
                        source,
                    })?
            } else {
                Graph::default()
            };

            walk.done.insert(canonical.clone(), name.clone());
            walk.order.push(name.clone());
            walk.all.insert(
                name.clone(),
                ResolvedComponent {
                    name: name.clone(),
                    component,
                    source: canonical,
                    kind: reference.kind(),
                    dir: loaded.dir,
                    graph,
                    dependencies,
                },
            );
            Ok(name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory loader keyed by canonical reference, counting loads.
    #[derive(Default)]
    struct FakeLoader {
        components: HashMap<String, &'static str>,
        loads: Mutex<HashMap<String, usize>>,
    }

    impl FakeLoader {
        fn with(mut self, reference: &str, yaml: &'static str) -> Self {
            let canonical = ComponentRef::parse(reference).unwrap().canonical();
            self.components.insert(canonical, yaml);
            self
        }

        fn loads_of(&self, reference: &str) -> usize {
            let canonical = ComponentRef::parse(reference).unwrap().canonical();
            self.loads.lock().unwrap().get(&canonical).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ComponentLoader for FakeLoader {
        async fn load(&self, reference: &ComponentRef) -> Result<LoadedComponent, ResolveError> {
            let canonical = reference.canonical();
            *self.loads.lock().unwrap().entry(canonical.clone()).or_default() += 1;
            let yaml = self.components.get(&canonical).ok_or_else(|| ResolveError::NotFound {
                reference: canonical.clone(),
                location: PathBuf::from(&canonical),
            })?;
            Ok(LoadedComponent {
                component: parser::parse_component(yaml).unwrap(),
                dir: None,
            })
        }
    }

    fn resolver(loader: Arc<FakeLoader>) -> DependencyResolver {
        DependencyResolver::new(loader)
    }

    #[test]
    fn test_resolver_parse_references() {
        assert_eq!(
            ComponentRef::parse("./auth").unwrap(),
            ComponentRef::Local(PathBuf::from("./auth"))
        );
        assert_eq!(
            ComponentRef::parse("components/auth").unwrap().kind(),
            SourceKind::Remote
        );
        assert_eq!(
            ComponentRef::parse("registry.io:5000/org/auth:v1").unwrap(),
            ComponentRef::Remote {
                repository: "registry.io:5000/org/auth".to_string(),
                tag: Some("v1".to_string()),
                digest: None,
            }
        );
        let digest = format!("org/auth@sha256:{}", "a".repeat(64));
        assert_eq!(
            ComponentRef::parse(&digest).unwrap().canonical(),
            digest
        );
        assert_eq!(ComponentRef::parse("auth").unwrap().canonical(), "auth:latest");
        assert!(ComponentRef::parse("org/auth@sha256:nothex").is_err());
        assert!(ComponentRef::parse("Org/Auth:v1").is_err());
        assert!(ComponentRef::parse("  ").is_err());
        assert!(ComponentRef::parse("Auth").is_err());
    }

    #[test]
    fn test_resolver_anchor_normalises() {
        let r = ComponentRef::parse("../shared/./db").unwrap();
        assert_eq!(
            r.anchored(Path::new("/work/app")).canonical(),
            "/work/shared/db"
        );
        let abs = ComponentRef::parse("/opt/c").unwrap();
        assert_eq!(abs.anchored(Path::new("/x")).canonical(), "/opt/c");
    }

    #[test]
    fn test_resolver_derived_names() {
        assert_eq!(
            ComponentRef::parse("registry.io/org/billing:v2").unwrap().derived_name().as_deref(),
            Some("billing")
        );
        assert_eq!(
            ComponentRef::Local(PathBuf::from("/w/auth")).derived_name().as_deref(),
            Some("auth")
        );
        assert_eq!(
            ComponentRef::Local(PathBuf::from("/w/auth/component.yml")).derived_name().as_deref(),
            Some("auth")
        );
    }

    #[tokio::test]
    async fn test_resolver_shared_dependency_loaded_once() {
        let loader = Arc::new(
            FakeLoader::default()
                .with("org/root", "dependencies:\n  a: org/a\n  b: org/b\n")
                .with("org/a", "dependencies:\n  c: org/c\n")
                .with("org/b", "dependencies:\n  c: org/c:latest\n")
                .with("org/c", "databases:\n  main: { type: postgres }\n"),
        );
        let resolved = resolver(loader.clone())
            .resolve("org/root", &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(loader.loads_of("org/c"), 1);
        assert_eq!(resolved.order.iter().filter(|n| *n == "c").count(), 1);
        let pos = |n: &str| resolved.order.iter().position(|x| x == n).unwrap();
        assert!(pos("c") < pos("a"));
        assert!(pos("c") < pos("b"));
        assert_eq!(resolved.root().unwrap().name, "root");
        assert_eq!(resolved.all["a"].dependencies["c"], "c");
        assert_eq!(resolved.all["c"].graph.len(), 1);
    }

    #[tokio::test]
    async fn test_resolver_cycle_names_full_path() {
        let loader = Arc::new(
            FakeLoader::default()
                .with("org/x", "name: x\ndependencies:\n  y: org/y\n")
                .with("org/y", "name: y\ndependencies:\n  z: org/z\n")
                .with("org/z", "name: z\ndependencies:\n  x: org/x\n"),
        );
        let err = resolver(loader)
            .resolve("org/x", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ResolveError::Cycle { path } => assert_eq!(path, vec!["x", "y", "z", "x"]),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_resolver_validation_aggregated_across_tree() {
        let loader = Arc::new(
            FakeLoader::default()
                .with("org/root", "dependencies:\n  a: org/a\nroutes:\n  r: {}\n")
                .with("org/a", "databases:\n  main: {}\n"),
        );
        let err = resolver(loader)
            .resolve("org/root", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ResolveError::Invalid(all) => {
                assert_eq!(all.len(), 2);
                let text = ResolveError::Invalid(all).to_string();
                assert!(text.contains("route 'r' has no service"));
                assert!(text.contains("database 'main' has no type"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_resolver_missing_dependency() {
        let loader = Arc::new(FakeLoader::default().with("org/root", "dependencies:\n  a: org/gone\n"));
        let err = resolver(loader)
            .resolve("org/root", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_resolver_name_conflict() {
        let loader = Arc::new(
            FakeLoader::default()
                .with("org/root", "dependencies:\n  a: org/a\n  b: other/a\n")
                .with("org/a", "{}\n")
                .with("other/a", "{}\n"),
        );
        let err = resolver(loader)
            .resolve("org/root", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NameConflict { ref name, .. } if name == "a"));
    }

    #[tokio::test]
    async fn test_resolver_cancelled_before_load() {
        let loader = Arc::new(FakeLoader::default().with("org/root", "{}\n"));
        let token = CancellationToken::new();
        token.cancel();
        let err = resolver(loader.clone()).resolve("org/root", &token).await.unwrap_err();
        assert!(matches!(err, ResolveError::Cancelled));
        assert_eq!(loader.loads_of("org/root"), 0);
    }

    #[tokio::test]
    async fn test_resolver_filesystem_tree_and_merged_graph() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("app");
        let auth = dir.path().join("auth");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::create_dir_all(&auth).unwrap();
        std::fs::write(
            auth.join("component.yml"),
            "deployments:\n  api: { image: auth }\nservices:\n  api: { deployment: api }\n",
        )
        .unwrap();
        std::fs::write(
            app.join("component.yml"),
            r#"
name: app
dependencies:
  auth: ../auth
deployments:
  web:
    environment:
      AUTH: "${{ dependencies.auth.services.api.url }}"
"#,
        )
        .unwrap();

        let resolver = DependencyResolver::new(Arc::new(FsComponentLoader::new()));
        let resolved = resolver
            .resolve(&app.display().to_string(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resolved.order, vec!["auth", "app"]);
        assert_eq!(resolved.all["auth"].kind, SourceKind::Local);
        assert_eq!(resolved.all["auth"].source, auth.display().to_string());

        let merged = resolved.graph().unwrap();
        assert_eq!(merged.len(), 3);
        assert!(merged
            .get("app/deployment/web")
            .unwrap()
            .depends_on
            .contains("auth/service/api"));
    }

    #[tokio::test]
    async fn test_resolver_remote_from_cache() {
        let cache = tempfile::tempdir().unwrap();
        let entry = cache.path().join("org/billing/v2");
        std::fs::create_dir_all(&entry).unwrap();
        std::fs::write(entry.join("component.yml"), "buckets:\n  invoices: {}\n").unwrap();

        let resolver = DependencyResolver::new(Arc::new(FsComponentLoader::with_cache(cache.path())));
        let resolved = resolver
            .resolve("org/billing:v2", &CancellationToken::new())
            .await
            .unwrap();
        let root = resolved.root().unwrap();
        assert_eq!(root.name, "billing");
        assert_eq!(root.kind, SourceKind::Remote);
        assert_eq!(root.source, "org/billing:v2");
    }

    #[tokio::test]
    async fn test_resolver_remote_without_cache_fails() {
        let resolver = DependencyResolver::new(Arc::new(FsComponentLoader::new()));
        let err = resolver
            .resolve("org/billing:v2", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Load { .. }));
    }
}
