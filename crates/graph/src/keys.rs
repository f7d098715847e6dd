//! Strong and weak cache key computation
//!
//! A cache key canonically serializes the element's kind, expanded
//! configuration, source refs, dependency identities and the target
//! platform. The strong key uses dependencies' strong keys; the weak key
//! uses only their names, so it survives content-equivalent dependency
//! rebuilds.

use crate::graph::{DepKind, Graph, Scope};
use crate::kinds::KindRegistry;
use crate::error::{GraphError, Result};
use petgraph::graph::NodeIndex;
use std::collections::HashSet;
use weir_core::key::{generate_key, Value};
use weir_core::CoreError;

/// Compute (and memoize) strong and weak keys for an element and all the
/// dependencies its keys are derived from.
pub fn compute_keys(graph: &mut Graph, kinds: &KindRegistry, node: NodeIndex) -> Result<()> {
    let mut visiting = HashSet::new();
    compute_recursive(graph, kinds, node, &mut visiting)
}

fn compute_recursive(
    graph: &mut Graph,
    kinds: &KindRegistry,
    node: NodeIndex,
    visiting: &mut HashSet<NodeIndex>,
) -> Result<()> {
    if graph.element(node).keys.strong.is_some() {
        return Ok(());
    }
    if !visiting.insert(node) {
        return Err(CoreError::cache_key(format!(
            "circular key dependency involving '{}'",
            graph.element(node).name
        ))
        .into());
    }

    let kind = kinds.get(&graph.element(node).kind)?.clone();

    // Dependencies contributing to the key: the BUILD scope always, direct
    // runtime dependencies when the kind says they affect behavior.
    let mut key_deps = graph.dependencies(node, Scope::Build);
    if kind.runtime_deps_in_key() {
        for dep in graph.direct_deps(node, DepKind::Runtime) {
            if !key_deps.contains(&dep) && dep != node {
                key_deps.push(dep);
            }
        }
    }

    for dep in &key_deps {
        compute_recursive(graph, kinds, *dep, visiting)?;
    }
    visiting.remove(&node);

    let element = graph.element(node);
    if !element.sources_resolved() {
        return Err(CoreError::cache_key(format!(
            "element '{}' has untracked sources",
            element.name
        ))
        .into());
    }

    let sources = Value::List(
        element
            .sources
            .iter()
            .map(|s| {
                Ok(Value::dict([
                    ("kind".to_string(), Value::str(&s.kind)),
                    (
                        "ref".to_string(),
                        Value::str(s.source_ref.as_deref().unwrap_or_default()),
                    ),
                ]))
            })
            .collect::<Result<Vec<_>>>()?,
    );

    let config = Value::try_from(element.config.clone()).map_err(GraphError::Core)?;

    let base = [
        ("kind".to_string(), Value::str(&element.kind)),
        ("config".to_string(), config),
        ("sources".to_string(), sources),
        ("arch".to_string(), Value::str(std::env::consts::ARCH)),
        ("os".to_string(), Value::str(std::env::consts::OS)),
    ];

    let strong_deps = Value::List(
        key_deps
            .iter()
            .map(|dep| {
                let dep_element = graph.element(*dep);
                let key = dep_element.keys.strong.clone().ok_or_else(|| {
                    CoreError::cache_key(format!(
                        "dependency '{}' has no strong key",
                        dep_element.name
                    ))
                })?;
                Ok(Value::dict([
                    ("name".to_string(), Value::str(&dep_element.name)),
                    ("key".to_string(), Value::Str(key)),
                ]))
            })
            .collect::<Result<Vec<_>>>()?,
    );
    let weak_deps = Value::List(
        key_deps
            .iter()
            .map(|dep| Value::str(&graph.element(*dep).name))
            .collect(),
    );

    let mut strong_input = base.to_vec();
    strong_input.push(("deps".to_string(), strong_deps));
    let mut weak_input = base.to_vec();
    weak_input.push(("deps".to_string(), weak_deps));

    let strong = generate_key(&Value::dict(strong_input)).map_err(GraphError::Core)?;
    let weak = generate_key(&Value::dict(weak_input)).map_err(GraphError::Core)?;

    let element = graph.element_mut(node);
    element.keys.strong = Some(strong);
    element.keys.weak = Some(weak);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementDecl;
    use std::collections::BTreeMap;

    fn graph_with(source_ref: &str, command: &str) -> Graph {
        let mut decls: BTreeMap<String, ElementDecl> = BTreeMap::new();
        decls.insert(
            "dep.bst".to_string(),
            serde_json::from_value(serde_json::json!({
                "kind": "import",
                "sources": [{ "kind": "local", "path": "src", "ref": source_ref }],
            }))
            .unwrap(),
        );
        decls.insert(
            "app.bst".to_string(),
            serde_json::from_value(serde_json::json!({
                "kind": "script",
                "depends": [{ "filename": "dep.bst", "type": "build" }],
                "config": { "commands": [command] },
            }))
            .unwrap(),
        );
        Graph::from_decls("proj", &decls).unwrap()
    }

    #[test]
    fn keys_are_deterministic() {
        let kinds = KindRegistry::with_builtins();

        let mut g1 = graph_with("aa/1", "make");
        let app1 = g1.node("app.bst").unwrap();
        compute_keys(&mut g1, &kinds, app1).unwrap();

        let mut g2 = graph_with("aa/1", "make");
        let app2 = g2.node("app.bst").unwrap();
        compute_keys(&mut g2, &kinds, app2).unwrap();

        assert_eq!(g1.element(app1).keys.strong, g2.element(app2).keys.strong);
        assert_eq!(g1.element(app1).keys.weak, g2.element(app2).keys.weak);
    }

    #[test]
    fn source_change_changes_both_keys() {
        let kinds = KindRegistry::with_builtins();

        let mut g1 = graph_with("aa/1", "make");
        let app1 = g1.node("app.bst").unwrap();
        compute_keys(&mut g1, &kinds, app1).unwrap();

        let mut g2 = graph_with("bb/2", "make");
        let app2 = g2.node("app.bst").unwrap();
        compute_keys(&mut g2, &kinds, app2).unwrap();

        // dep's content changed, so app's strong key moves...
        assert_ne!(g1.element(app1).keys.strong, g2.element(app2).keys.strong);
        // ...but its weak key only sees dependency names
        assert_eq!(g1.element(app1).keys.weak, g2.element(app2).keys.weak);
    }

    #[test]
    fn config_change_changes_the_weak_key_too() {
        let kinds = KindRegistry::with_builtins();

        let mut g1 = graph_with("aa/1", "make");
        let app1 = g1.node("app.bst").unwrap();
        compute_keys(&mut g1, &kinds, app1).unwrap();

        let mut g2 = graph_with("aa/1", "make -j4");
        let app2 = g2.node("app.bst").unwrap();
        compute_keys(&mut g2, &kinds, app2).unwrap();

        assert_ne!(g1.element(app1).keys.weak, g2.element(app2).keys.weak);
    }

    #[test]
    fn untracked_sources_fail_key_computation() {
        let mut decls: BTreeMap<String, ElementDecl> = BTreeMap::new();
        decls.insert(
            "a.bst".to_string(),
            serde_json::from_value(serde_json::json!({
                "kind": "import",
                "sources": [{ "kind": "local", "path": "src" }],
            }))
            .unwrap(),
        );
        let mut graph = Graph::from_decls("proj", &decls).unwrap();
        let a = graph.node("a.bst").unwrap();

        let kinds = KindRegistry::with_builtins();
        assert!(compute_keys(&mut graph, &kinds, a).is_err());
    }
}
