//! Error types for the element graph

use miette::Diagnostic;
use thiserror::Error;
use weir_cas::CasError;
use weir_core::CoreError;

/// Result type alias for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while loading declarations or traversing the graph
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    /// A declaration is invalid or references something unknown
    #[error("Invalid element declaration: {0}")]
    #[diagnostic(
        code(weir::graph::load),
        help("Check the element's kind, dependencies and variables")
    )]
    Load(String),

    /// A dependency cycle among build dependencies
    #[error("Circular build dependency involving '{element}'")]
    #[diagnostic(code(weir::graph::cycle))]
    Cycle {
        /// An element on the cycle
        element: String,
    },

    /// A referenced element does not exist
    #[error("No element named '{name}'")]
    #[diagnostic(code(weir::graph::unknown_element))]
    UnknownElement {
        /// The missing element name
        name: String,
    },

    /// Cache key inputs were not resolvable
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] CoreError),

    /// Local storage failed while staging or tracking sources
    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] CasError),
}

impl GraphError {
    /// Create a load error
    pub fn load(msg: impl Into<String>) -> Self {
        Self::Load(msg.into())
    }
}
