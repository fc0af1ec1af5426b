//! Persisted resource state and the store boundary.
//!
//! A datacenter owns environments, an environment owns component states and
//! a component state owns resource states keyed by node ID. The engine is
//! the only writer; every read-modify-write of one environment goes through
//! [`EnvironmentHandle`], which serializes it behind a per-environment lock.

use super::graph::Node;
use super::types::{Inputs, ResourceType};
use crate::plugins::OutputValue;
use crate::tripwire::eventlog::now_iso8601;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// State persistence failures.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid state file {}: {message}", .path.display())]
    Corrupt { path: PathBuf, message: String },

    #[error("cannot serialize state: {0}")]
    Serialize(String),
}

// ============================================================================
// State types
// ============================================================================

/// Lifecycle status of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Provisioning,
    Ready,
    Failed,
    Destroying,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

/// Persisted state of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Node ID (`component/type/name`)
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    pub component: String,
    pub status: ResourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub inputs: Inputs,
    #[serde(default)]
    pub outputs: IndexMap<String, OutputValue>,
    /// Opaque plugin state, stored byte-for-byte
    #[serde(default, with = "opaque", skip_serializing_if = "Option::is_none")]
    pub module_state: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Plugin that owns `module_state`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Module source the hook bound this node to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ResourceState {
    /// Fresh Pending state for a node scheduled for the first time.
    pub fn pending(node: &Node) -> Self {
        let now = now_iso8601();
        Self {
            id: node.id.clone(),
            name: node.name.clone(),
            resource_type: node.resource_type,
            component: node.component.clone(),
            status: ResourceStatus::Pending,
            status_reason: None,
            inputs: node.inputs.clone(),
            outputs: IndexMap::new(),
            module_state: None,
            inputs_hash: None,
            depends_on: node.depends_on.iter().cloned().collect(),
            plugin: None,
            module: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Move to `status` and stamp `updated_at`.
    pub fn transition(&mut self, status: ResourceStatus, reason: Option<String>) {
        self.status = status;
        self.status_reason = reason;
        self.updated_at = now_iso8601();
    }

    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }
}

/// Resources of one component in one environment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub name: String,
    #[serde(default)]
    pub resources: IndexMap<String, ResourceState>,
}

/// One environment: the unit the engine locks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub name: String,
    pub datacenter: String,
    #[serde(default)]
    pub components: IndexMap<String, ComponentState>,
    pub created_at: String,
    pub updated_at: String,
}

impl EnvironmentState {
    pub fn new(datacenter: &str, name: &str) -> Self {
        let now = now_iso8601();
        Self {
            name: name.to_string(),
            datacenter: datacenter.to_string(),
            components: IndexMap::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn resource(&self, component: &str, id: &str) -> Option<&ResourceState> {
        self.components.get(component)?.resources.get(id)
    }

    /// Find a resource by node ID in any component.
    pub fn find(&self, id: &str) -> Option<&ResourceState> {
        self.components.values().find_map(|c| c.resources.get(id))
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceState> {
        self.components.values().flat_map(|c| c.resources.values())
    }

    pub fn resource_count(&self) -> usize {
        self.components.values().map(|c| c.resources.len()).sum()
    }

    /// Insert or replace a resource, creating its component state.
    pub fn upsert(&mut self, state: ResourceState) {
        let component = self
            .components
            .entry(state.component.clone())
            .or_insert_with(|| ComponentState {
                name: state.component.clone(),
                resources: IndexMap::new(),
            });
        component.resources.insert(state.id.clone(), state);
        self.updated_at = now_iso8601();
    }

    /// Remove a resource; an emptied component state is removed with it.
    pub fn remove(&mut self, component: &str, id: &str) -> Option<ResourceState> {
        let entry = self.components.get_mut(component)?;
        let removed = entry.resources.shift_remove(id);
        if entry.resources.is_empty() {
            self.components.shift_remove(component);
        }
        if removed.is_some() {
            self.updated_at = now_iso8601();
        }
        removed
    }
}

/// A datacenter and the names of its environments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatacenterState {
    pub name: String,
    #[serde(default)]
    pub environments: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl DatacenterState {
    pub fn new(name: &str) -> Self {
        let now = now_iso8601();
        Self {
            name: name.to_string(),
            environments: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Addresses one resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    pub datacenter: String,
    pub environment: String,
    pub component: String,
    pub resource: String,
}

impl ResourceKey {
    pub fn new(datacenter: &str, environment: &str, component: &str, resource: &str) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            environment: environment.to_string(),
            component: component.to_string(),
            resource: resource.to_string(),
        }
    }
}

mod opaque {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

// ============================================================================
// Store boundary
// ============================================================================

/// Get/Save/Delete for datacenter, environment and resource state.
///
/// Implementations provide the datacenter and environment operations;
/// resource operations default to a read-modify-write of the environment
/// and must be called with that environment's lock held.
pub trait StateStore: Send + Sync {
    fn get_datacenter(&self, datacenter: &str) -> Result<Option<DatacenterState>, StateError>;
    fn save_datacenter(&self, state: &DatacenterState) -> Result<(), StateError>;
    /// Removes the datacenter and every environment it owns.
    fn delete_datacenter(&self, datacenter: &str) -> Result<(), StateError>;

    fn get_environment(
        &self,
        datacenter: &str,
        environment: &str,
    ) -> Result<Option<EnvironmentState>, StateError>;
    fn save_environment(&self, state: &EnvironmentState) -> Result<(), StateError>;
    fn delete_environment(&self, datacenter: &str, environment: &str) -> Result<(), StateError>;

    fn get_resource(&self, key: &ResourceKey) -> Result<Option<ResourceState>, StateError> {
        Ok(self
            .get_environment(&key.datacenter, &key.environment)?
            .and_then(|env| env.resource(&key.component, &key.resource).cloned()))
    }

    fn save_resource(&self, key: &ResourceKey, state: &ResourceState) -> Result<(), StateError> {
        let mut env = self
            .get_environment(&key.datacenter, &key.environment)?
            .unwrap_or_else(|| EnvironmentState::new(&key.datacenter, &key.environment));
        env.upsert(state.clone());
        self.save_environment(&env)
    }

    fn delete_resource(&self, key: &ResourceKey) -> Result<(), StateError> {
        if let Some(mut env) = self.get_environment(&key.datacenter, &key.environment)? {
            if env.remove(&key.component, &key.resource).is_some() {
                self.save_environment(&env)?;
            }
        }
        Ok(())
    }
}

/// One lock per datacenter record, held across its read-modify-write.
/// Environments of one datacenter are locked separately, so their
/// registrations would otherwise race on the shared record.
#[derive(Debug, Default)]
struct DatacenterLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DatacenterLocks {
    fn get(&self, datacenter: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(datacenter.to_string()).or_default().clone()
    }
}

/// Registers `environment` under its datacenter record, creating it.
fn register_environment(
    store: &dyn StateStore,
    locks: &DatacenterLocks,
    datacenter: &str,
    environment: &str,
) -> Result<(), StateError> {
    let lock = locks.get(datacenter);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
    let mut dc = store
        .get_datacenter(datacenter)?
        .unwrap_or_else(|| DatacenterState::new(datacenter));
    if !dc.environments.iter().any(|e| e == environment) {
        dc.environments.push(environment.to_string());
        dc.updated_at = now_iso8601();
        store.save_datacenter(&dc)?;
    }
    Ok(())
}

fn unregister_environment(
    store: &dyn StateStore,
    locks: &DatacenterLocks,
    datacenter: &str,
    environment: &str,
) -> Result<(), StateError> {
    let lock = locks.get(datacenter);
    let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(mut dc) = store.get_datacenter(datacenter)? {
        let before = dc.environments.len();
        dc.environments.retain(|e| e != environment);
        if dc.environments.len() != before {
            dc.updated_at = now_iso8601();
            store.save_datacenter(&dc)?;
        }
    }
    Ok(())
}

// ============================================================================
// File store
// ============================================================================

/// YAML files under one directory:
/// `<dir>/<datacenter>/datacenter.yaml` and
/// `<dir>/<datacenter>/<environment>/state.yaml`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
    registry: Arc<DatacenterLocks>,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: Arc::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn datacenter_path(&self, datacenter: &str) -> PathBuf {
        self.root.join(datacenter).join("datacenter.yaml")
    }

    pub fn environment_path(&self, datacenter: &str, environment: &str) -> PathBuf {
        self.root.join(datacenter).join(environment).join("state.yaml")
    }

    fn load<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_yaml_ng::from_str(&content)
            .map(Some)
            .map_err(|e| StateError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Atomic write: temp file + rename.
    fn store<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateError::Io { path, source }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io(parent))?;
        }
        let yaml = serde_yaml_ng::to_string(value).map_err(|e| StateError::Serialize(e.to_string()))?;
        let tmp_path = path.with_extension("yaml.tmp");
        std::fs::write(&tmp_path, &yaml).map_err(io(&tmp_path))?;
        std::fs::rename(&tmp_path, path).map_err(io(path))?;
        Ok(())
    }

    fn remove(path: &Path) -> Result<(), StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl StateStore for FileStateStore {
    fn get_datacenter(&self, datacenter: &str) -> Result<Option<DatacenterState>, StateError> {
        Self::load(&self.datacenter_path(datacenter))
    }

    fn save_datacenter(&self, state: &DatacenterState) -> Result<(), StateError> {
        Self::store(&self.datacenter_path(&state.name), state)
    }

    fn delete_datacenter(&self, datacenter: &str) -> Result<(), StateError> {
        if let Some(dc) = self.get_datacenter(datacenter)? {
            for env in &dc.environments {
                Self::remove(&self.environment_path(datacenter, env))?;
            }
        }
        Self::remove(&self.datacenter_path(datacenter))
    }

    fn get_environment(
        &self,
        datacenter: &str,
        environment: &str,
    ) -> Result<Option<EnvironmentState>, StateError> {
        Self::load(&self.environment_path(datacenter, environment))
    }

    fn save_environment(&self, state: &EnvironmentState) -> Result<(), StateError> {
        Self::store(&self.environment_path(&state.datacenter, &state.name), state)?;
        register_environment(self, &self.registry, &state.datacenter, &state.name)
    }

    fn delete_environment(&self, datacenter: &str, environment: &str) -> Result<(), StateError> {
        Self::remove(&self.environment_path(datacenter, environment))?;
        unregister_environment(self, &self.registry, datacenter, environment)
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    datacenters: Mutex<HashMap<String, DatacenterState>>,
    environments: Mutex<HashMap<(String, String), EnvironmentState>>,
    registry: DatacenterLocks,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn get_datacenter(&self, datacenter: &str) -> Result<Option<DatacenterState>, StateError> {
        let map = self.datacenters.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(datacenter).cloned())
    }

    fn save_datacenter(&self, state: &DatacenterState) -> Result<(), StateError> {
        let mut map = self.datacenters.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(state.name.clone(), state.clone());
        Ok(())
    }

    fn delete_datacenter(&self, datacenter: &str) -> Result<(), StateError> {
        self.environments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(dc, _), _| dc != datacenter);
        self.datacenters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(datacenter);
        Ok(())
    }

    fn get_environment(
        &self,
        datacenter: &str,
        environment: &str,
    ) -> Result<Option<EnvironmentState>, StateError> {
        let map = self.environments.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map
            .get(&(datacenter.to_string(), environment.to_string()))
            .cloned())
    }

    fn save_environment(&self, state: &EnvironmentState) -> Result<(), StateError> {
        self.environments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((state.datacenter.clone(), state.name.clone()), state.clone());
        register_environment(self, &self.registry, &state.datacenter, &state.name)
    }

    fn delete_environment(&self, datacenter: &str, environment: &str) -> Result<(), StateError> {
        self.environments
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&(datacenter.to_string(), environment.to_string()));
        unregister_environment(self, &self.registry, datacenter, environment)
    }
}

// ============================================================================
// Per-environment serialization
// ============================================================================

/// Hands out one async lock per (datacenter, environment).
#[derive(Debug, Default)]
pub struct EnvironmentLocks {
    locks: Mutex<HashMap<(String, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl EnvironmentLocks {
    pub fn get(&self, datacenter: &str, environment: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry((datacenter.to_string(), environment.to_string()))
            .or_default()
            .clone()
    }
}

/// One environment in one store; every access holds the environment lock.
#[derive(Clone)]
pub struct EnvironmentHandle {
    store: Arc<dyn StateStore>,
    lock: Arc<tokio::sync::Mutex<()>>,
    datacenter: String,
    environment: String,
}

impl EnvironmentHandle {
    pub fn new(
        store: Arc<dyn StateStore>,
        locks: &EnvironmentLocks,
        datacenter: &str,
        environment: &str,
    ) -> Self {
        Self {
            store,
            lock: locks.get(datacenter, environment),
            datacenter: datacenter.to_string(),
            environment: environment.to_string(),
        }
    }

    pub fn datacenter(&self) -> &str {
        &self.datacenter
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    fn key(&self, component: &str, id: &str) -> ResourceKey {
        ResourceKey::new(&self.datacenter, &self.environment, component, id)
    }

    /// Whole environment as currently stored.
    pub async fn snapshot(&self) -> Result<EnvironmentState, StateError> {
        let _guard = self.lock.lock().await;
        Ok(self
            .store
            .get_environment(&self.datacenter, &self.environment)?
            .unwrap_or_else(|| EnvironmentState::new(&self.datacenter, &self.environment)))
    }

    pub async fn get(&self, component: &str, id: &str) -> Result<Option<ResourceState>, StateError> {
        let _guard = self.lock.lock().await;
        self.store.get_resource(&self.key(component, id))
    }

    pub async fn put(&self, state: &ResourceState) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        self.store.save_resource(&self.key(&state.component, &state.id), state)
    }

    pub async fn remove(&self, component: &str, id: &str) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        self.store.delete_resource(&self.key(component, id))
    }

    /// Drop the environment record once it holds no resources.
    pub async fn remove_if_empty(&self) -> Result<bool, StateError> {
        let _guard = self.lock.lock().await;
        match self.store.get_environment(&self.datacenter, &self.environment)? {
            Some(env) if env.resource_count() == 0 => {
                self.store
                    .delete_environment(&self.datacenter, &self.environment)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
