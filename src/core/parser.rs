//! Component and datacenter loading and validation.
//!
//! Parses `component.yml` and `datacenter.yml` and validates structural
//! constraints. Validation collects every problem it finds instead of
//! stopping at the first:
//! - names are lowercase identifiers
//! - typed fields that name siblings point at existing resources
//! - dependency references parse
//! - `${{ ... }}` expressions are well formed and variables are declared

use super::expr;
use super::resolver::ComponentRef;
use super::types::*;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("name pattern is valid"));

/// One field-level problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Every problem found in one document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors {
    pub origin: String,
    pub errors: Vec<ValidationError>,
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} validation error(s)", self.origin, self.errors.len())?;
        for e in &self.errors {
            write!(f, "\n  - {}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }
}

/// Load failures.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parse error in {origin}: {message}")]
    Yaml { origin: String, message: String },

    #[error(transparent)]
    Invalid(#[from] ValidationErrors),
}

fn read(path: &Path) -> Result<String, ParseError> {
    std::fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })
}

// ============================================================================
// Components
// ============================================================================

/// Parse a component file from disk without validating it.
pub fn parse_component_file(path: &Path) -> Result<ComponentConfig, ParseError> {
    let content = read(path)?;
    parse_component_named(&content, &path.display().to_string())
}

/// Parse a component from a string.
pub fn parse_component(yaml: &str) -> Result<ComponentConfig, ParseError> {
    parse_component_named(yaml, "<inline>")
}

fn parse_component_named(yaml: &str, origin: &str) -> Result<ComponentConfig, ParseError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ParseError::Yaml {
        origin: origin.to_string(),
        message: e.to_string(),
    })
}

/// Parse and validate a component file. Returns every validation problem.
pub fn load_component(path: &Path) -> Result<ComponentConfig, ParseError> {
    let component = parse_component_file(path)?;
    let errors = validate_component(&component);
    if errors.is_empty() {
        Ok(component)
    } else {
        Err(ValidationErrors {
            origin: path.display().to_string(),
            errors,
        }
        .into())
    }
}

/// Validate a parsed component. Returns a list of errors (empty = valid).
pub fn validate_component(component: &ComponentConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Some(name) = &component.name {
        if !NAME.is_match(name) {
            errors.push(ValidationError::new(format!(
                "component name '{}' must match [a-z0-9][a-z0-9_-]*",
                name
            )));
        }
    }

    for name in component.variables.keys() {
        if !NAME.is_match(name) {
            errors.push(ValidationError::new(format!("variable name '{}' is invalid", name)));
        }
    }

    for (alias, reference) in &component.dependencies {
        if !NAME.is_match(alias) {
            errors.push(ValidationError::new(format!(
                "dependency alias '{}' is invalid",
                alias
            )));
        }
        if let Err(e) = ComponentRef::parse(reference) {
            errors.push(ValidationError::new(format!("dependency '{}': {}", alias, e)));
        }
    }

    for decl in component.declarations() {
        let label = format!("{} '{}'", decl.resource_type, decl.name);
        if !NAME.is_match(decl.name) {
            errors.push(ValidationError::new(format!("{} has an invalid name", label)));
        }
        validate_expressions(component, &label, &decl.inputs, &mut errors);
        for (ty, target) in &decl.field_refs {
            if !component.names_of(*ty).contains(&target.as_str()) {
                errors.push(ValidationError::new(format!(
                    "{} references unknown {} '{}'",
                    label, ty, target
                )));
            }
        }
    }

    // Type-specific required fields
    for (name, db) in &component.databases {
        if db.engine.as_deref().is_none_or(str::is_empty) {
            errors.push(ValidationError::new(format!("database '{}' has no type", name)));
        }
    }
    for (name, svc) in &component.services {
        if svc.deployment.is_none() {
            errors.push(ValidationError::new(format!(
                "service '{}' has no deployment",
                name
            )));
        }
        if svc.port == Some(0) {
            errors.push(ValidationError::new(format!("service '{}' has port 0", name)));
        }
    }
    for (name, route) in &component.routes {
        if route.service.is_none() {
            errors.push(ValidationError::new(format!("route '{}' has no service", name)));
        }
    }
    for (name, cron) in &component.cronjobs {
        match cron.schedule.as_deref() {
            None => errors.push(ValidationError::new(format!(
                "cronjob '{}' has no schedule",
                name
            ))),
            Some(s) => {
                let fields = s.split_whitespace().count();
                if fields != 5 && fields != 6 {
                    errors.push(ValidationError::new(format!(
                        "cronjob '{}' schedule '{}' must have 5 or 6 fields, got {}",
                        name, s, fields
                    )));
                }
            }
        }
    }
    for (name, build) in &component.builds {
        if build.context.is_none() {
            errors.push(ValidationError::new(format!("build '{}' has no context", name)));
        }
    }

    errors
}

fn validate_expressions(
    component: &ComponentConfig,
    label: &str,
    inputs: &Inputs,
    errors: &mut Vec<ValidationError>,
) {
    fn strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
        match value {
            Value::String(s) => out.push(s),
            Value::Array(items) => items.iter().for_each(|v| strings(v, out)),
            Value::Object(map) => map.values().for_each(|v| strings(v, out)),
            _ => {}
        }
    }

    let mut leaves = Vec::new();
    inputs.values().for_each(|v| strings(v, &mut leaves));
    for s in leaves {
        if expr::unclosed(s) > 0 {
            errors.push(ValidationError::new(format!(
                "{} has an unclosed expression in '{}'",
                label, s
            )));
        }
    }

    let mut found = Vec::new();
    inputs.values().for_each(|v| expr::scan(v, &mut found));
    for e in found {
        if !expr::is_valid_path(&e) {
            errors.push(ValidationError::new(format!(
                "{} has a malformed expression '{}'",
                label, e
            )));
            continue;
        }
        let segs = expr::segments(&e);
        match segs.as_slice() {
            ["variables", var, ..] if !component.variables.contains_key(*var) => {
                errors.push(ValidationError::new(format!(
                    "{} references undeclared variable '{}'",
                    label, var
                )));
            }
            ["dependencies", alias, ..] if !component.dependencies.contains_key(*alias) => {
                errors.push(ValidationError::new(format!(
                    "{} references undeclared dependency '{}'",
                    label, alias
                )));
            }
            ["dependencies", _, collection, _, ..]
                if ResourceType::from_qualifier(collection).is_none() =>
            {
                errors.push(ValidationError::new(format!(
                    "{} references unknown resource collection '{}'",
                    label, collection
                )));
            }
            ["dependencies", ..] if segs.len() < 4 => {
                errors.push(ValidationError::new(format!(
                    "{} has an incomplete dependency reference '{}'",
                    label, e
                )));
            }
            _ => {}
        }
    }
}

// ============================================================================
// Datacenters
// ============================================================================

/// Parse a datacenter file from disk without validating it.
pub fn parse_datacenter_file(path: &Path) -> Result<DatacenterConfig, ParseError> {
    let content = read(path)?;
    serde_yaml_ng::from_str(&content).map_err(|e| ParseError::Yaml {
        origin: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Parse a datacenter from a string.
pub fn parse_datacenter(yaml: &str) -> Result<DatacenterConfig, ParseError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| ParseError::Yaml {
        origin: "<inline>".to_string(),
        message: e.to_string(),
    })
}

/// Parse and validate a datacenter file. Relative local module paths in
/// hooks are rewritten against the file's directory.
pub fn load_datacenter(path: &Path) -> Result<DatacenterConfig, ParseError> {
    let mut dc = parse_datacenter_file(path)?;
    let errors = validate_datacenter(&dc);
    if !errors.is_empty() {
        return Err(ValidationErrors {
            origin: path.display().to_string(),
            errors,
        }
        .into());
    }
    let base = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    // Absolute, so the module string still reads as local once stored
    let base = std::path::absolute(base).unwrap_or_else(|_| base.to_path_buf());
    for hook in &mut dc.hooks {
        if hook.module.starts_with("./") || hook.module.starts_with("../") {
            hook.module = base.join(&hook.module).display().to_string();
        }
    }
    Ok(dc)
}

/// Validate a parsed datacenter. Returns a list of errors (empty = valid).
pub fn validate_datacenter(dc: &DatacenterConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if dc.name.is_empty() {
        errors.push(ValidationError::new("name must not be empty"));
    } else if !NAME.is_match(&dc.name) {
        errors.push(ValidationError::new(format!(
            "datacenter name '{}' must match [a-z0-9][a-z0-9_-]*",
            dc.name
        )));
    }

    if dc.policy.parallelism == 0 {
        errors.push(ValidationError::new("policy.parallelism must be at least 1"));
    }

    for (i, hook) in dc.hooks.iter().enumerate() {
        if hook.plugin.is_empty() {
            errors.push(ValidationError::new(format!("hook #{} has no plugin", i + 1)));
        }
        if hook.module.is_empty() {
            errors.push(ValidationError::new(format!("hook #{} has no module", i + 1)));
        }
        if let Some(j) = dc.hooks[..i]
            .iter()
            .position(|h| h.resource_type == hook.resource_type && h.component == hook.component)
        {
            errors.push(ValidationError::new(format!(
                "hook #{} ({}) is shadowed by hook #{}",
                i + 1,
                hook.resource_type,
                j + 1
            )));
        }
    }

    errors
}
