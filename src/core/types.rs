//! Declarative schema types for components and datacenters.
//!
//! A component is a bundle of typed resource declarations plus optional
//! dependencies on other components. A datacenter binds resource types to
//! provisioning modules ("hooks") and carries the execution policy.
//! All types derive Serialize/Deserialize for YAML roundtripping.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Ordered parameter map handed to modules.
pub type Inputs = IndexMap<String, Value>;

// ============================================================================
// Resource types
// ============================================================================

/// Every resource kind a component can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceType {
    Database,
    Bucket,
    EncryptionKey,
    Smtp,
    DockerBuild,
    Deployment,
    Function,
    Task,
    Service,
    Cronjob,
    Route,
    Secret,
    Observability,
}

impl ResourceType {
    pub const ALL: [ResourceType; 13] = [
        Self::Database,
        Self::Bucket,
        Self::EncryptionKey,
        Self::Smtp,
        Self::DockerBuild,
        Self::Deployment,
        Self::Function,
        Self::Task,
        Self::Service,
        Self::Cronjob,
        Self::Route,
        Self::Secret,
        Self::Observability,
    ];

    /// Key of the collection this type is declared under in a component file.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Database => "databases",
            Self::Bucket => "buckets",
            Self::EncryptionKey => "encryption_keys",
            Self::Smtp => "smtp",
            Self::DockerBuild => "builds",
            Self::Deployment => "deployments",
            Self::Function => "functions",
            Self::Task => "tasks",
            Self::Service => "services",
            Self::Cronjob => "cronjobs",
            Self::Route => "routes",
            Self::Secret => "secrets",
            Self::Observability => "observability",
        }
    }

    /// Accepts either the type name (`database`) or its collection key
    /// (`databases`) as used in reference expressions.
    pub fn from_qualifier(s: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.collection() == s || t.to_string() == s)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Database => write!(f, "database"),
            Self::Bucket => write!(f, "bucket"),
            Self::EncryptionKey => write!(f, "encryption-key"),
            Self::Smtp => write!(f, "smtp"),
            Self::DockerBuild => write!(f, "docker-build"),
            Self::Deployment => write!(f, "deployment"),
            Self::Function => write!(f, "function"),
            Self::Task => write!(f, "task"),
            Self::Service => write!(f, "service"),
            Self::Cronjob => write!(f, "cronjob"),
            Self::Route => write!(f, "route"),
            Self::Secret => write!(f, "secret"),
            Self::Observability => write!(f, "observability"),
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.to_string() == s)
            .ok_or_else(|| format!("unknown resource type: {}", s))
    }
}

// ============================================================================
// Component declaration
// ============================================================================

/// A component file: the declared resources of one deployable system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentConfig {
    /// Component name; derived from the reference when absent
    #[serde(default)]
    pub name: Option<String>,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared variables
    #[serde(default)]
    pub variables: IndexMap<String, VariableDecl>,

    /// Other components this one depends on (alias → reference)
    #[serde(default)]
    pub dependencies: IndexMap<String, String>,

    #[serde(default)]
    pub builds: IndexMap<String, BuildDecl>,

    #[serde(default)]
    pub databases: IndexMap<String, DatabaseDecl>,

    #[serde(default)]
    pub buckets: IndexMap<String, GenericDecl>,

    #[serde(default)]
    pub encryption_keys: IndexMap<String, EncryptionKeyDecl>,

    #[serde(default)]
    pub smtp: IndexMap<String, GenericDecl>,

    #[serde(default)]
    pub deployments: IndexMap<String, WorkloadDecl>,

    #[serde(default)]
    pub functions: IndexMap<String, WorkloadDecl>,

    #[serde(default)]
    pub tasks: IndexMap<String, WorkloadDecl>,

    #[serde(default)]
    pub services: IndexMap<String, ServiceDecl>,

    #[serde(default)]
    pub routes: IndexMap<String, RouteDecl>,

    #[serde(default)]
    pub cronjobs: IndexMap<String, CronjobDecl>,

    #[serde(default)]
    pub secrets: IndexMap<String, SecretDecl>,

    #[serde(default)]
    pub observability: IndexMap<String, GenericDecl>,
}

/// A declared component variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub sensitive: bool,
}

/// Container image build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub args: IndexMap<String, Value>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Managed database.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseDecl {
    /// Engine and version, e.g. `postgres:15`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Encryption key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionKeyDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Long-running or one-shot workload (deployment, function, task).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, Value>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Network service in front of a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDecl {
    /// Name of the deployment this service exposes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Ingress route to a service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteDecl {
    /// Name of the service this route targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Scheduled workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronjobDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub environment: IndexMap<String, Value>,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Secret value slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecretDecl {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,

    #[serde(flatten)]
    pub extra: Inputs,
}

/// Free-form declaration for types without well-known fields
/// (buckets, smtp, observability).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenericDecl {
    #[serde(flatten)]
    pub extra: Inputs,
}

/// One resource declaration flattened out of a component.
#[derive(Debug, Clone)]
pub struct Declaration<'a> {
    pub resource_type: ResourceType,
    pub name: &'a str,
    pub inputs: Inputs,
    /// Sibling resources named by typed fields (service → deployment, ...)
    pub field_refs: Vec<(ResourceType, String)>,
}

fn to_inputs<T: Serialize>(decl: &T) -> Inputs {
    match serde_json::to_value(decl) {
        Ok(Value::Object(map)) => map.into_iter().collect(),
        _ => Inputs::new(),
    }
}

fn no_refs<T>(_: &T) -> Vec<(ResourceType, String)> {
    Vec::new()
}

fn push_all<'a, T: Serialize>(
    out: &mut Vec<Declaration<'a>>,
    resource_type: ResourceType,
    decls: &'a IndexMap<String, T>,
    field_refs: impl Fn(&T) -> Vec<(ResourceType, String)>,
) {
    for (name, decl) in decls {
        out.push(Declaration {
            resource_type,
            name,
            inputs: to_inputs(decl),
            field_refs: field_refs(decl),
        });
    }
}

impl ComponentConfig {
    /// Flatten every typed collection into declarations, in a fixed
    /// type order and file order within each type.
    pub fn declarations(&self) -> Vec<Declaration<'_>> {
        let mut out = Vec::new();
        push_all(&mut out, ResourceType::DockerBuild, &self.builds, no_refs);
        push_all(&mut out, ResourceType::Database, &self.databases, no_refs);
        push_all(&mut out, ResourceType::Bucket, &self.buckets, no_refs);
        push_all(&mut out, ResourceType::EncryptionKey, &self.encryption_keys, no_refs);
        push_all(&mut out, ResourceType::Smtp, &self.smtp, no_refs);
        push_all(&mut out, ResourceType::Secret, &self.secrets, no_refs);
        push_all(&mut out, ResourceType::Deployment, &self.deployments, no_refs);
        push_all(&mut out, ResourceType::Function, &self.functions, no_refs);
        push_all(&mut out, ResourceType::Task, &self.tasks, no_refs);
        push_all(&mut out, ResourceType::Service, &self.services, |s| {
            s.deployment
                .iter()
                .map(|d| (ResourceType::Deployment, d.clone()))
                .collect()
        });
        push_all(&mut out, ResourceType::Route, &self.routes, |r| {
            r.service
                .iter()
                .map(|s| (ResourceType::Service, s.clone()))
                .collect()
        });
        push_all(&mut out, ResourceType::Cronjob, &self.cronjobs, no_refs);
        push_all(&mut out, ResourceType::Observability, &self.observability, no_refs);
        out
    }

    /// Names of all resources of the given type.
    pub fn names_of(&self, resource_type: ResourceType) -> Vec<&str> {
        self.declarations()
            .into_iter()
            .filter(|d| d.resource_type == resource_type)
            .map(|d| d.name)
            .collect()
    }

    /// Total number of declared resources.
    pub fn resource_count(&self) -> usize {
        self.declarations().len()
    }
}

// ============================================================================
// Datacenter
// ============================================================================

/// Datacenter file: hooks binding resource types to modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatacenterConfig {
    /// Datacenter name
    pub name: String,

    /// Optional description
    #[serde(default)]
    pub description: Option<String>,

    /// Values exposed to every module as defaults
    #[serde(default)]
    pub variables: Inputs,

    /// Execution policy
    #[serde(default)]
    pub policy: Policy,

    /// Backend settings
    #[serde(default)]
    pub plugins: PluginSettings,

    /// Resource hooks, matched in file order
    #[serde(default)]
    pub hooks: Vec<HookConfig>,
}

/// Maps a resource type (optionally scoped to one component) to a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookConfig {
    /// Resource type this hook provisions
    #[serde(rename = "type")]
    pub resource_type: ResourceType,

    /// Restrict to a single component
    #[serde(default)]
    pub component: Option<String>,

    /// Registered plugin name
    pub plugin: String,

    /// Module source: local directory or remote reference
    pub module: String,

    /// Default inputs merged beneath the node's own inputs
    #[serde(default)]
    pub inputs: Inputs,
}

impl HookConfig {
    pub fn matches(&self, resource_type: ResourceType, component: &str) -> bool {
        self.resource_type == resource_type
            && self.component.as_deref().is_none_or(|c| c == component)
    }
}

// ============================================================================
// Policy
// ============================================================================

/// Execution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Failure handling
    #[serde(default)]
    pub failure: FailurePolicy,

    /// Maximum concurrent module invocations within a batch
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Write provenance events on every run
    #[serde(default = "default_true")]
    pub tripwire: bool,

    /// Destroy resources that left the component definition
    #[serde(default = "default_true")]
    pub prune: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            failure: FailurePolicy::default(),
            parallelism: default_parallelism(),
            tripwire: true,
            prune: true,
        }
    }
}

fn default_parallelism() -> usize {
    4
}

fn default_true() -> bool {
    true
}

/// Failure handling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Finish the running batch, then start nothing new
    #[default]
    StopOnFirst,
    /// Keep going; only dependents of a failed node are blocked
    ContinueIndependent,
}

// ============================================================================
// Plugin settings
// ============================================================================

/// Process-lifetime configuration for the built-in backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub terraform: ToolSettings,

    #[serde(default = "ToolSettings::pulumi")]
    pub pulumi: ToolSettings,

    #[serde(default = "ToolSettings::native")]
    pub native: ToolSettings,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            terraform: ToolSettings::default(),
            pulumi: ToolSettings::pulumi(),
            native: ToolSettings::native(),
        }
    }
}

/// Binary and optional container image for one backend tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSettings {
    pub binary: String,

    /// Run the tool inside this container image instead of on the host
    #[serde(default)]
    pub image: Option<String>,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            image: None,
        }
    }
}

impl ToolSettings {
    fn pulumi() -> Self {
        Self {
            binary: "pulumi".to_string(),
            image: None,
        }
    }

    fn native() -> Self {
        Self {
            binary: "bash".to_string(),
            image: None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const COMPONENT: &str = r#"
name: app-a
variables:
  log_level:
    default: info
databases:
  main:
    type: "postgres:15"
deployments:
  api:
    image: nginx
    environment:
      DB_URL: "${{ databases.main.url }}"
services:
  api:
    deployment: api
    port: 8080
routes:
  public:
    service: api
    path: /
"#;

    #[test]
    fn test_types_component_parse() {
        let c: ComponentConfig = serde_yaml_ng::from_str(COMPONENT).unwrap();
        assert_eq!(c.name.as_deref(), Some("app-a"));
        assert_eq!(c.databases["main"].engine.as_deref(), Some("postgres:15"));
        assert_eq!(c.services["api"].port, Some(8080));
        assert_eq!(c.resource_count(), 4);
    }

    #[test]
    fn test_types_declarations_carry_inputs_and_field_refs() {
        let c: ComponentConfig = serde_yaml_ng::from_str(COMPONENT).unwrap();
        let decls = c.declarations();
        let db = decls.iter().find(|d| d.name == "main").unwrap();
        assert_eq!(db.resource_type, ResourceType::Database);
        assert_eq!(db.inputs["type"], Value::String("postgres:15".into()));

        let svc = decls
            .iter()
            .find(|d| d.resource_type == ResourceType::Service)
            .unwrap();
        assert_eq!(
            svc.field_refs,
            vec![(ResourceType::Deployment, "api".to_string())]
        );

        let route = decls
            .iter()
            .find(|d| d.resource_type == ResourceType::Route)
            .unwrap();
        assert_eq!(route.field_refs, vec![(ResourceType::Service, "api".to_string())]);
    }

    #[test]
    fn test_types_extra_fields_flatten_into_inputs() {
        let yaml = r#"
buckets:
  uploads:
    public: true
    versioning: { enabled: true }
"#;
        let c: ComponentConfig = serde_yaml_ng::from_str(yaml).unwrap();
        let decls = c.declarations();
        assert_eq!(decls[0].inputs["public"], Value::Bool(true));
        assert!(decls[0].inputs["versioning"].is_object());
    }

    #[test]
    fn test_types_resource_type_display_and_parse() {
        assert_eq!(ResourceType::EncryptionKey.to_string(), "encryption-key");
        assert_eq!(ResourceType::DockerBuild.to_string(), "docker-build");
        for t in ResourceType::ALL {
            assert_eq!(t.to_string().parse::<ResourceType>().unwrap(), t);
        }
        assert!("widget".parse::<ResourceType>().is_err());
    }

    #[test]
    fn test_types_from_qualifier_accepts_both_forms() {
        assert_eq!(
            ResourceType::from_qualifier("databases"),
            Some(ResourceType::Database)
        );
        assert_eq!(
            ResourceType::from_qualifier("database"),
            Some(ResourceType::Database)
        );
        assert_eq!(
            ResourceType::from_qualifier("builds"),
            Some(ResourceType::DockerBuild)
        );
        assert_eq!(ResourceType::from_qualifier("main"), None);
    }

    #[test]
    fn test_types_datacenter_defaults() {
        let yaml = r#"
name: local
hooks:
  - type: database
    plugin: terraform
    module: ./modules/postgres
"#;
        let dc: DatacenterConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(dc.policy.failure, FailurePolicy::StopOnFirst);
        assert_eq!(dc.policy.parallelism, 4);
        assert!(dc.policy.tripwire);
        assert_eq!(dc.plugins.terraform.binary, "terraform");
        assert_eq!(dc.plugins.pulumi.binary, "pulumi");
        assert_eq!(dc.plugins.native.binary, "bash");
        assert_eq!(dc.hooks[0].resource_type, ResourceType::Database);
    }

    #[test]
    fn test_types_hook_matching() {
        let hook = HookConfig {
            resource_type: ResourceType::Database,
            component: Some("app-a".to_string()),
            plugin: "terraform".to_string(),
            module: "./m".to_string(),
            inputs: Inputs::new(),
        };
        assert!(hook.matches(ResourceType::Database, "app-a"));
        assert!(!hook.matches(ResourceType::Database, "app-b"));
        assert!(!hook.matches(ResourceType::Bucket, "app-a"));
    }
}
