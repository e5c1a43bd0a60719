//! Selector subjects
//!
//! A subject is the uniform view a selector evaluates against: the four
//! leaf-addressable fields for condition trees plus the full entity JSON
//! for expressions, tagged with its root name.

use keel_types::{Deployment, DeploymentVersion, Environment, Resource};
use serde_json::Value;
use std::collections::BTreeMap;

/// Entity view handed to the selector engine.
#[derive(Debug, Clone)]
pub struct SelectorSubject {
    /// Expression root name (`resource`, `environment`, ...)
    pub root: &'static str,

    /// Entity id
    pub id: String,

    /// Entity name (the tag, for versions)
    pub name: String,

    /// Entity kind
    pub kind: String,

    /// Metadata for `metadata` leaves
    pub metadata: BTreeMap<String, String>,

    /// Full entity JSON for expression evaluation
    pub json: Value,
}

impl SelectorSubject {
    pub fn resource(resource: &Resource) -> Self {
        Self {
            root: "resource",
            id: resource.id.to_string(),
            name: resource.name.clone(),
            kind: resource.kind.clone(),
            metadata: resource.metadata.clone(),
            json: serde_json::to_value(resource).unwrap_or(Value::Null),
        }
    }

    pub fn environment(environment: &Environment) -> Self {
        Self {
            root: "environment",
            id: environment.id.to_string(),
            name: environment.name.clone(),
            kind: "environment".to_string(),
            metadata: BTreeMap::new(),
            json: serde_json::to_value(environment).unwrap_or(Value::Null),
        }
    }

    pub fn deployment(deployment: &Deployment) -> Self {
        Self {
            root: "deployment",
            id: deployment.id.to_string(),
            name: deployment.name.clone(),
            kind: "deployment".to_string(),
            metadata: BTreeMap::new(),
            json: serde_json::to_value(deployment).unwrap_or(Value::Null),
        }
    }

    pub fn version(version: &DeploymentVersion) -> Self {
        Self {
            root: "version",
            id: version.id.to_string(),
            name: version.tag.clone(),
            kind: "deployment_version".to_string(),
            metadata: version.metadata.clone(),
            json: serde_json::to_value(version).unwrap_or(Value::Null),
        }
    }
}
