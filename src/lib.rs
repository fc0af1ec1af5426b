//! Strata: component orchestration over pluggable IaC backends.
//!
//! Components declare resources; a datacenter binds resource types to
//! Terraform, Pulumi or native modules. Strata resolves the component tree,
//! builds one dependency graph, and drives each module through
//! Preview/Apply/Destroy/Refresh in dependency order, recording state and
//! provenance per environment.

pub mod cli;
pub mod core;
pub mod plugins;
pub mod tripwire;
