//! Element kinds
//!
//! A kind is a narrow capability set: validate configuration, contribute
//! to the cache key, and describe how the element assembles. Kinds are
//! registered factories keyed by their name string; the build queue
//! interprets the returned [`AssemblyPlan`].

use crate::element::Element;
use crate::error::{GraphError, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// How an element's artifact gets produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyPlan {
    /// The staged sources become the artifact as-is
    StageSources,

    /// The overlay of the staged build dependencies becomes the artifact
    Overlay,

    /// Run commands in the sandbox; the install root becomes the artifact
    Commands {
        /// Shell command lines, run in order
        commands: Vec<String>,
        /// Environment for the commands
        env: BTreeMap<String, String>,
        /// Path (relative to the sandbox root) collected as the artifact
        install_root: String,
    },

    /// No content of its own (aggregation-only elements)
    Empty,
}

/// Behavior contract of one element kind
pub trait ElementKind: Send + Sync {
    /// The registry key for this kind
    fn name(&self) -> &'static str;

    /// Validate configuration early, before any scheduling.
    fn preflight(&self, _element: &Element) -> Result<()> {
        Ok(())
    }

    /// Whether runtime dependencies affect this kind's output.
    fn runtime_deps_in_key(&self) -> bool {
        false
    }

    /// Describe how the element assembles.
    fn assembly(&self, element: &Element) -> Result<AssemblyPlan>;
}

/// `import`: stage the sources, nothing else
pub struct ImportKind;

impl ElementKind for ImportKind {
    fn name(&self) -> &'static str {
        "import"
    }

    fn preflight(&self, element: &Element) -> Result<()> {
        if element.sources.is_empty() {
            return Err(GraphError::load(format!(
                "import element '{}' has no sources",
                element.name
            )));
        }
        Ok(())
    }

    fn assembly(&self, _element: &Element) -> Result<AssemblyPlan> {
        Ok(AssemblyPlan::StageSources)
    }
}

/// `stack`: aggregate dependencies, produce nothing
pub struct StackKind;

impl ElementKind for StackKind {
    fn name(&self) -> &'static str {
        "stack"
    }

    fn assembly(&self, _element: &Element) -> Result<AssemblyPlan> {
        Ok(AssemblyPlan::Empty)
    }
}

/// `compose`: the overlay of the build dependencies becomes the artifact
pub struct ComposeKind;

impl ElementKind for ComposeKind {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn runtime_deps_in_key(&self) -> bool {
        true
    }

    fn assembly(&self, _element: &Element) -> Result<AssemblyPlan> {
        Ok(AssemblyPlan::Overlay)
    }
}

/// `script`: run configured commands over the staged tree
pub struct ScriptKind;

impl ScriptKind {
    fn commands(element: &Element) -> Result<Vec<String>> {
        let Some(commands) = element.config.get("commands") else {
            return Ok(Vec::new());
        };
        commands
            .as_array()
            .ok_or_else(|| GraphError::load("'commands' must be a list of strings"))?
            .iter()
            .map(|c| {
                c.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| GraphError::load("'commands' must be a list of strings"))
            })
            .collect()
    }
}

impl ElementKind for ScriptKind {
    fn name(&self) -> &'static str {
        "script"
    }

    fn preflight(&self, element: &Element) -> Result<()> {
        Self::commands(element).map(|_| ())
    }

    fn assembly(&self, element: &Element) -> Result<AssemblyPlan> {
        let env = match element.config.get("env") {
            Some(env) => env
                .as_object()
                .ok_or_else(|| GraphError::load("'env' must be a mapping"))?
                .iter()
                .map(|(k, v)| {
                    v.as_str()
                        .map(|s| (k.clone(), s.to_string()))
                        .ok_or_else(|| GraphError::load("'env' values must be strings"))
                })
                .collect::<Result<BTreeMap<_, _>>>()?,
            None => BTreeMap::new(),
        };

        let install_root = element
            .config
            .get("install-root")
            .and_then(|v| v.as_str())
            .unwrap_or("install")
            .to_string();

        Ok(AssemblyPlan::Commands {
            commands: Self::commands(element)?,
            env,
            install_root,
        })
    }
}

/// String-keyed registry of element kinds
pub struct KindRegistry {
    kinds: HashMap<&'static str, Arc<dyn ElementKind>>,
}

impl KindRegistry {
    /// Registry with the built-in kinds.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            kinds: HashMap::new(),
        };
        registry.register(Arc::new(ImportKind));
        registry.register(Arc::new(StackKind));
        registry.register(Arc::new(ComposeKind));
        registry.register(Arc::new(ScriptKind));
        registry
    }

    /// Register an additional kind.
    pub fn register(&mut self, kind: Arc<dyn ElementKind>) {
        self.kinds.insert(kind.name(), kind);
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Result<&Arc<dyn ElementKind>> {
        self.kinds
            .get(name)
            .ok_or_else(|| GraphError::load(format!("unknown element kind '{name}'")))
    }
}
