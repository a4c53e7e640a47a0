//! Plan nodes for resource fetches.
//!
//! A `GetPlan` is the immutable descriptor of one Get step, including the
//! custom resource types visible to it. Custom types form a chain that ends
//! at a base type provided by the workers themselves.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Resource configuration, possibly containing `((var))` references
pub type Source = serde_json::Map<String, Value>;

/// Fetch-time parameters
pub type Params = serde_json::Map<String, Value>;

/// A resource version, e.g. `{"ref": "abc123"}`
pub type Version = BTreeMap<String, String>;

/// Worker tags a step must be placed on
pub type Tags = Vec<String>;

/// Upper bound on custom type nesting before a chain is considered malformed
pub const MAX_TYPE_CHAIN_DEPTH: usize = 32;

/// Identifier of a plan node within a build
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(pub String);

impl PlanId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single metadata entry emitted by a resource script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

impl MetadataField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Version and metadata reported on a resource script's stdout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResult {
    #[serde(default)]
    pub version: Version,

    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

/// Descriptor of one Get step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    /// Name the fetched artifact is registered under
    pub name: String,

    /// Resource type: either a base type or the name of a custom type
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub params: Params,

    /// Version to fetch, already resolved by the planner
    #[serde(default)]
    pub version: Option<Version>,

    /// Pipeline resource this fetch belongs to; empty for anonymous fetches
    #[serde(default)]
    pub resource: String,

    #[serde(default)]
    pub tags: Tags,

    /// Custom resource types visible to this plan
    #[serde(default)]
    pub resource_types: VersionedResourceTypes,
}

impl GetPlan {
    /// Whether this fetch persists versions against a pipeline resource
    pub fn is_anonymous(&self) -> bool {
        self.resource.is_empty()
    }
}

/// A custom resource type pinned to a version of its own image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    pub name: String,

    /// The type this custom type's image is fetched with
    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub params: Params,

    #[serde(default)]
    pub tags: Tags,

    #[serde(default)]
    pub privileged: bool,

    #[serde(default)]
    pub version: Version,
}

impl VersionedResourceType {
    /// The image resource used to fetch this type's container image
    pub fn image_resource(&self) -> ImageResource {
        ImageResource {
            name: self.name.clone(),
            type_name: self.type_name.clone(),
            source: self.source.clone(),
            params: self.params.clone(),
            version: Some(self.version.clone()),
            tags: self.tags.clone(),
        }
    }
}

/// A resource whose output is used as a container image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageResource {
    pub name: String,

    #[serde(rename = "type")]
    pub type_name: String,

    #[serde(default)]
    pub source: Source,

    #[serde(default)]
    pub params: Params,

    #[serde(default)]
    pub version: Option<Version>,

    #[serde(default)]
    pub tags: Tags,
}

/// Errors raised while resolving a custom type chain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypeChainError {
    #[error("resource type is empty (referenced by '{referenced_by}')")]
    EmptyType { referenced_by: String },

    #[error("resource type '{name}' is based on '{base}', which is already part of its chain")]
    Cycle { name: String, base: String },

    #[error("resource type chain starting at '{start}' is deeper than {limit} levels")]
    TooDeep { start: String, limit: usize },
}

/// Ordered list of custom resource types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionedResourceTypes(pub Vec<VersionedResourceType>);

impl VersionedResourceTypes {
    pub fn new(types: Vec<VersionedResourceType>) -> Self {
        Self(types)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, VersionedResourceType> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, resource_type: VersionedResourceType) {
        self.0.push(resource_type);
    }

    /// Find a custom type by name
    pub fn lookup(&self, name: &str) -> Option<&VersionedResourceType> {
        self.0.iter().find(|t| t.name == name)
    }

    /// Copy of the list with every type named `name` removed
    pub fn without(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|t| t.name != name).cloned().collect())
    }

    /// The base type reached by walking the chain from `name`.
    ///
    /// Returns `name` itself when it is not a custom type.
    pub fn base_type(&self, name: &str) -> Result<String, TypeChainError> {
        self.walk(name).map(|(_, base)| base)
    }

    /// The custom types the chain from `name` passes through, in walk order
    pub fn chain_for(&self, name: &str) -> Result<Vec<VersionedResourceType>, TypeChainError> {
        self.walk(name)
            .map(|(chain, _)| chain.into_iter().cloned().collect())
    }

    /// Walks the chain with an exclusion list: each custom type is removed
    /// from consideration once visited, so a type named after its own base
    /// (e.g. `registry-image` of type `registry-image`) resolves to the base.
    fn walk(&self, name: &str) -> Result<(Vec<&VersionedResourceType>, String), TypeChainError> {
        let mut excluded: Vec<&str> = Vec::new();
        let mut chain = Vec::new();
        let mut current = name;
        let mut referenced_by = "plan";

        for _ in 0..=MAX_TYPE_CHAIN_DEPTH {
            if current.is_empty() {
                return Err(TypeChainError::EmptyType {
                    referenced_by: referenced_by.to_string(),
                });
            }

            let custom = self
                .0
                .iter()
                .find(|t| t.name == current && !excluded.contains(&t.name.as_str()));

            let Some(custom) = custom else {
                return Ok((chain, current.to_string()));
            };

            excluded.push(custom.name.as_str());
            chain.push(custom);

            let next = custom.type_name.as_str();
            if next != custom.name && excluded.contains(&next) {
                return Err(TypeChainError::Cycle {
                    name: custom.name.clone(),
                    base: next.to_string(),
                });
            }

            referenced_by = custom.name.as_str();
            current = next;
        }

        Err(TypeChainError::TooDeep {
            start: name.to_string(),
            limit: MAX_TYPE_CHAIN_DEPTH,
        })
    }
}

impl FromIterator<VersionedResourceType> for VersionedResourceTypes {
    fn from_iter<I: IntoIterator<Item = VersionedResourceType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(name: &str, base: &str) -> VersionedResourceType {
        VersionedResourceType {
            name: name.to_string(),
            type_name: base.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_base_type_of_builtin_is_itself() {
        let types = VersionedResourceTypes::new(vec![custom("a", "git")]);
        assert_eq!(types.base_type("git").unwrap(), "git");
    }

    #[test]
    fn test_base_type_walks_the_chain() {
        let types = VersionedResourceTypes::new(vec![
            custom("some-custom-type", "another-custom-type"),
            custom("another-custom-type", "registry-image"),
        ]);

        assert_eq!(types.base_type("some-custom-type").unwrap(), "registry-image");
        assert_eq!(
            types
                .chain_for("some-custom-type")
                .unwrap()
                .iter()
                .map(|t| t.name.as_str())
                .collect::<Vec<_>>(),
            vec!["some-custom-type", "another-custom-type"]
        );
    }

    #[test]
    fn test_type_overriding_base_of_same_name() {
        let types = VersionedResourceTypes::new(vec![custom("registry-image", "registry-image")]);
        assert_eq!(types.base_type("registry-image").unwrap(), "registry-image");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let types = VersionedResourceTypes::new(vec![custom("a", "b"), custom("b", "a")]);

        let err = types.base_type("a").unwrap_err();
        assert_eq!(
            err,
            TypeChainError::Cycle {
                name: "b".to_string(),
                base: "a".to_string()
            }
        );
    }

    #[test]
    fn test_empty_base_is_rejected() {
        let types = VersionedResourceTypes::new(vec![custom("a", "")]);
        assert!(matches!(
            types.base_type("a"),
            Err(TypeChainError::EmptyType { .. })
        ));
    }

    #[test]
    fn test_overly_deep_chain_is_rejected() {
        let types: VersionedResourceTypes = (0..=MAX_TYPE_CHAIN_DEPTH + 1)
            .map(|i| custom(&format!("t{}", i), &format!("t{}", i + 1)))
            .collect();

        assert!(matches!(
            types.base_type("t0"),
            Err(TypeChainError::TooDeep { .. })
        ));
    }

    #[test]
    fn test_without_removes_by_name() {
        let types = VersionedResourceTypes::new(vec![custom("a", "b"), custom("b", "git")]);
        let rest = types.without("a");

        assert_eq!(rest.len(), 1);
        assert!(rest.lookup("a").is_none());
        assert!(rest.lookup("b").is_some());
    }

    #[test]
    fn test_plan_yaml_parsing() {
        let yaml = r#"
name: repo
type: git
source:
  uri: https://example.com/repo.git
version:
  ref: abc123
resource: repo
tags: [linux]
resource_types:
  - name: slack
    type: registry-image
    source: { repository: slack-resource }
    privileged: true
"#;
        let plan: GetPlan = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(plan.type_name, "git");
        assert_eq!(plan.version.unwrap().get("ref"), Some(&"abc123".to_string()));
        assert!(!plan.resource.is_empty());
        assert!(plan.resource_types.lookup("slack").unwrap().privileged);
    }
}
