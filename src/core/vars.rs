//! `((var))` interpolation over JSON configuration.
//!
//! A string that is exactly one reference is replaced by the variable's
//! value (which may be an object or number); references embedded in a longer
//! string are replaced by their string form. `((name.field))` descends into
//! object-valued variables.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::domain::VersionedResourceTypes;
use crate::error::VarsError;

/// Source of variable values for a build
pub trait Variables: Send + Sync {
    /// Look up a variable by name (without fields)
    fn get(&self, name: &str) -> Option<Value>;
}

/// Fixed set of variables, e.g. from `--var` flags
#[derive(Debug, Clone, Default)]
pub struct StaticVariables(HashMap<String, Value>);

impl StaticVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }
}

impl Variables for StaticVariables {
    fn get(&self, name: &str) -> Option<Value> {
        self.0.get(name).cloned()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for StaticVariables {
    fn from(pairs: [(&str, &str); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
                .collect(),
        )
    }
}

/// Interpolate every `((var))` reference inside a JSON object
pub fn interpolate_map(
    map: &Map<String, Value>,
    vars: &dyn Variables,
) -> Result<Map<String, Value>, VarsError> {
    map.iter()
        .map(|(k, v)| Ok::<_, VarsError>((k.clone(), interpolate(v, vars)?)))
        .collect()
}

/// Interpolate the sources of a custom type chain.
///
/// Params are left as-is: they only matter when the type's image is fetched,
/// which interpolates them itself.
pub fn interpolate_type_sources(
    types: &VersionedResourceTypes,
    vars: &dyn Variables,
) -> Result<VersionedResourceTypes, VarsError> {
    types
        .iter()
        .map(|t| {
            let mut t = t.clone();
            t.source = interpolate_map(&t.source, vars)?;
            Ok::<_, VarsError>(t)
        })
        .collect()
}

/// Interpolate a single JSON value
pub fn interpolate(value: &Value, vars: &dyn Variables) -> Result<Value, VarsError> {
    match value {
        Value::String(s) => interpolate_string(s, vars),
        Value::Array(items) => items
            .iter()
            .map(|v| interpolate(v, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => interpolate_map(map, vars).map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Interpolate a plain string field such as a type name
pub fn interpolate_str(s: &str, vars: &dyn Variables) -> Result<String, VarsError> {
    match interpolate_string(s, vars)? {
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn interpolate_string(s: &str, vars: &dyn Variables) -> Result<Value, VarsError> {
    if let Some(reference) = whole_reference(s) {
        return resolve(reference, vars);
    }

    if !s.contains("((") {
        return Ok(Value::String(s.to_string()));
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find("((") {
        let Some(len) = rest[start + 2..].find("))") else {
            break;
        };
        out.push_str(&rest[..start]);

        let reference = &rest[start + 2..start + 2 + len];
        match resolve(reference.trim(), vars)? {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }

        rest = &rest[start + 2 + len + 2..];
    }
    out.push_str(rest);

    Ok(Value::String(out))
}

/// `Some(name)` if the whole string is one `((name))` reference
fn whole_reference(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("((")?.strip_suffix("))")?;
    if inner.contains("((") || inner.contains("))") {
        return None;
    }
    Some(inner.trim())
}

fn resolve(reference: &str, vars: &dyn Variables) -> Result<Value, VarsError> {
    let mut parts = reference.split('.');
    let name = parts.next().unwrap_or_default();

    let mut value = vars
        .get(name)
        .ok_or_else(|| VarsError::Undefined(name.to_string()))?;

    for field in parts {
        value = value
            .get(field)
            .cloned()
            .ok_or_else(|| VarsError::MissingField {
                var: name.to_string(),
                field: field.to_string(),
            })?;
    }

    Ok(value)
}
