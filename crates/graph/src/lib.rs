//! Elements, dependencies and build planning for weir
//!
//! Elements form a DAG with build and runtime edges. This crate resolves
//! declarations into elements, computes their strong and weak cache keys,
//! tracks the per-element state machine, and produces depth-sorted build
//! plans for the scheduler.

pub mod element;
pub mod error;
pub mod graph;
pub mod keys;
pub mod kinds;
pub mod plan;
pub mod source;

pub use element::{DepType, DependDecl, Element, ElementDecl, ElementKeys, ElementState};
pub use error::{GraphError, Result};
pub use graph::{DepKind, Graph, Scope};
pub use keys::compute_keys;
pub use kinds::{AssemblyPlan, ElementKind, KindRegistry};
pub use plan::plan;
pub use source::{LocalSource, SourceDecl, SourceKind, SourceRegistry};
