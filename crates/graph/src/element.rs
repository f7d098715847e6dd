//! The element model
//!
//! An element is one declarative build unit: a kind, sources, dependencies
//! and configuration. Elements live for one invocation; their state is
//! in-process mutable and never persisted.

use crate::error::{GraphError, Result};
use crate::source::SourceDecl;
use serde::Deserialize;
use std::collections::BTreeMap;
use weir_cas::Digest;

/// Dependency edge kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DepType {
    /// Needed to build the dependent
    Build,
    /// Needed at runtime by the dependent
    Runtime,
    /// Both build and runtime
    #[default]
    All,
}

/// One dependency of an element declaration
#[derive(Debug, Clone, Deserialize)]
pub struct DependDecl {
    /// Element filename the dependency points at
    pub filename: String,

    /// Edge kind; `all` by default
    #[serde(default, rename = "type")]
    pub dep_type: DepType,
}

/// The declaration shape consumed from the configuration layer
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ElementDecl {
    /// Element plugin kind
    pub kind: String,

    /// Declared dependencies
    #[serde(default)]
    pub depends: Vec<DependDecl>,

    /// Source list
    #[serde(default)]
    pub sources: Vec<SourceDecl>,

    /// Kind-specific configuration
    #[serde(default)]
    pub config: serde_json::Value,

    /// Variables substituted inside the configuration
    #[serde(default)]
    pub variables: BTreeMap<String, String>,

    /// Opaque data copied into the artifact
    #[serde(default)]
    pub public: serde_json::Value,
}

/// Element lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    /// Sources have no refs yet
    Inconsistent,
    /// Refs are known but dependencies are not all cached yet
    Resolved,
    /// Refs are known but source content is not locally available
    FetchNeeded,
    /// Sources local, all build dependencies cached
    Buildable,
    /// Artifact exists locally under the strong key
    Cached,
    /// Assembly failed
    Failed,
}

/// Strong and weak cache keys of an element
#[derive(Debug, Clone, Default)]
pub struct ElementKeys {
    /// Key over dependency content
    pub strong: Option<String>,
    /// Key over dependency names only
    pub weak: Option<String>,
}

/// One resolved element in the graph
#[derive(Debug, Clone)]
pub struct Element {
    /// Declared element name (the filename)
    pub name: String,

    /// Normalized name used in artifact refs
    pub normal_name: String,

    /// Plugin kind
    pub kind: String,

    /// Configuration with all variables expanded
    pub config: serde_json::Value,

    /// Sources; refs filled in by tracking
    pub sources: Vec<SourceDecl>,

    /// Opaque public data
    pub public: serde_json::Value,

    /// Current lifecycle state
    pub state: ElementState,

    /// Computed cache keys
    pub keys: ElementKeys,

    /// Root digest of the staged source tree, set by fetch
    pub source_digest: Option<Digest>,
}

impl Element {
    /// Resolve a declaration into an element, expanding variables.
    pub fn from_decl(name: &str, decl: &ElementDecl) -> Result<Self> {
        if decl.kind.is_empty() {
            return Err(GraphError::load(format!("element '{name}' has no kind")));
        }

        let config = expand_variables(&decl.config, &decl.variables)
            .map_err(|e| GraphError::load(format!("in element '{name}': {e}")))?;

        Ok(Self {
            name: name.to_string(),
            normal_name: normal_name(name),
            kind: decl.kind.clone(),
            config,
            sources: decl.sources.clone(),
            public: decl.public.clone(),
            state: ElementState::Inconsistent,
            keys: ElementKeys::default(),
            source_digest: None,
        })
    }

    /// Whether every source has a resolved ref.
    #[must_use]
    pub fn sources_resolved(&self) -> bool {
        self.sources.iter().all(|s| s.source_ref.is_some())
    }

    /// Whether the element has failed.
    #[must_use]
    pub fn failed(&self) -> bool {
        self.state == ElementState::Failed
    }

    /// Whether the artifact is cached locally.
    #[must_use]
    pub fn cached(&self) -> bool {
        self.state == ElementState::Cached
    }
}

/// Normalize an element filename for artifact refs: path separators become
/// `-` and a trailing extension is stripped.
#[must_use]
pub fn normal_name(name: &str) -> String {
    let without_suffix = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => stem,
        _ => name,
    };
    without_suffix.replace('/', "-")
}

/// Expand `%{name}` references in every string of a configuration value.
fn expand_variables(
    value: &serde_json::Value,
    variables: &BTreeMap<String, String>,
) -> std::result::Result<serde_json::Value, String> {
    match value {
        serde_json::Value::String(s) => Ok(serde_json::Value::String(expand_string(s, variables)?)),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| expand_variables(v, variables))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok((k.clone(), expand_variables(v, variables)?)))
            .collect::<std::result::Result<serde_json::Map<_, _>, String>>()
            .map(serde_json::Value::Object),
        other => Ok(other.clone()),
    }
}

fn expand_string(
    input: &str,
    variables: &BTreeMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("%{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(format!("unterminated variable reference in '{input}'"));
        };
        let var_name = &after[..end];
        match variables.get(var_name) {
            Some(value) => out.push_str(value),
            None => return Err(format!("unknown variable '%{{{var_name}}}'")),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_names() {
        assert_eq!(normal_name("app/main.bst"), "app-main");
        assert_eq!(normal_name("base.bst"), "base");
        assert_eq!(normal_name("no-suffix"), "no-suffix");
    }

    #[test]
    fn variables_expand_in_nested_config() {
        let decl: ElementDecl = serde_json::from_value(serde_json::json!({
            "kind": "script",
            "config": {
                "commands": ["make install PREFIX=%{prefix}"],
                "nested": { "flag": "%{prefix}/bin" }
            },
            "variables": { "prefix": "/usr" }
        }))
        .unwrap();

        let element = Element::from_decl("app.bst", &decl).unwrap();
        assert_eq!(
            element.config["commands"][0],
            serde_json::json!("make install PREFIX=/usr")
        );
        assert_eq!(element.config["nested"]["flag"], serde_json::json!("/usr/bin"));
    }

    #[test]
    fn unknown_variable_is_a_load_error() {
        let decl: ElementDecl = serde_json::from_value(serde_json::json!({
            "kind": "script",
            "config": { "commands": ["%{nope}"] }
        }))
        .unwrap();

        assert!(matches!(
            Element::from_decl("app.bst", &decl),
            Err(GraphError::Load(_))
        ));
    }

    #[test]
    fn depend_decl_defaults_to_all() {
        let decl: DependDecl =
            serde_json::from_value(serde_json::json!({ "filename": "base.bst" })).unwrap();
        assert_eq!(decl.dep_type, DepType::All);

        let decl: DependDecl = serde_json::from_value(
            serde_json::json!({ "filename": "base.bst", "type": "build" }),
        )
        .unwrap();
        assert_eq!(decl.dep_type, DepType::Build);
    }

    #[test]
    fn missing_kind_is_rejected() {
        let decl = ElementDecl::default();
        assert!(Element::from_decl("x.bst", &decl).is_err());
    }
}
