//! Core types for the weir build orchestrator
//!
//! This crate carries what every other weir crate needs: the error
//! plumbing, the per-invocation [`CoreContext`], the deterministic
//! cache-key engine and the sandbox contract.

pub mod config;
pub mod context;
pub mod error;
pub mod key;
pub mod sandbox;

pub use config::{Config, QuotaConfig, RemoteSpecConfig};
pub use context::CoreContext;
pub use error::{CoreError, Result};
pub use sandbox::{HostSandbox, Mount, Sandbox, SandboxConfig, SandboxResult};
