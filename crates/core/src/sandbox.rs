//! The sandbox contract
//!
//! Build commands run against a staged directory tree through this trait.
//! Isolation backends (namespaces, containers) live outside this
//! repository; the in-tree [`HostSandbox`] runs commands directly on the
//! host and exists so the pipeline is exercisable end to end.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// A mount point inside the sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Mount a device filesystem at /dev
    Dev,
    /// Mount procfs at /proc
    Proc,
    /// Mount a tmpfs at the given destination
    Tmpfs {
        /// Mount destination inside the sandbox
        dest: PathBuf,
    },
    /// Bind-mount a host path
    Bind {
        /// Host source path
        src: PathBuf,
        /// Destination inside the sandbox
        dest: PathBuf,
        /// Whether the mount is read-only
        read_only: bool,
    },
}

/// Per-run sandbox configuration
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    /// Working directory inside the staged root
    pub cwd: PathBuf,

    /// Environment for the command
    pub env: BTreeMap<String, String>,

    /// Mount points; the staged root is mounted read-only by default and
    /// writable paths must appear here as writable binds
    pub mounts: Vec<Mount>,

    /// Whether network access is allowed (off by default)
    pub network: bool,

    /// Run as this uid/gid when the backend supports it
    pub uid_gid: Option<(u32, u32)>,
}

/// Outcome of one sandboxed command
#[derive(Debug, Clone)]
pub struct SandboxResult {
    /// Exit status of the command
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: Vec<u8>,
    /// Captured standard error
    pub stderr: Vec<u8>,
}

impl SandboxResult {
    /// Whether the command exited successfully
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs command vectors against a staged root directory.
///
/// A non-zero exit status is reported in the [`SandboxResult`], not as an
/// error; errors mean the sandbox itself could not run the command.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run one command vector rooted at `root`.
    async fn run(
        &self,
        root: &Path,
        config: &SandboxConfig,
        command: &[String],
    ) -> Result<SandboxResult>;
}

/// Sandbox that runs commands directly on the host.
///
/// No isolation is performed; mounts and uid/gid are ignored. The staged
/// root becomes the process working directory.
#[derive(Debug, Default)]
pub struct HostSandbox;

#[async_trait]
impl Sandbox for HostSandbox {
    async fn run(
        &self,
        root: &Path,
        config: &SandboxConfig,
        command: &[String],
    ) -> Result<SandboxResult> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CoreError::sandbox("empty command vector"))?;

        let cwd = if config.cwd.as_os_str().is_empty() {
            root.to_path_buf()
        } else {
            root.join(config.cwd.strip_prefix("/").unwrap_or(&config.cwd))
        };

        debug!(program = %program, cwd = %cwd.display(), "Running sandboxed command");

        let output = Command::new(program)
            .args(args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| CoreError::sandbox_io(format!("failed to spawn '{program}'"), e))?;

        Ok(SandboxResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> SandboxConfig {
        SandboxConfig {
            env: [("PATH".to_string(), "/usr/bin:/bin".to_string())]
                .into_iter()
                .collect(),
            ..SandboxConfig::default()
        }
    }

    #[tokio::test]
    async fn runs_command_in_root() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("marker"), b"here").unwrap();

        let sandbox = HostSandbox;
        let result = sandbox
            .run(
                tmp.path(),
                &config(),
                &["sh".to_string(), "-c".to_string(), "cat marker".to_string()],
            )
            .await
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, b"here");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let tmp = TempDir::new().unwrap();
        let sandbox = HostSandbox;
        let result = sandbox
            .run(
                tmp.path(),
                &config(),
                &["sh".to_string(), "-c".to_string(), "exit 42".to_string()],
            )
            .await
            .unwrap();

        assert_eq!(result.exit_code, 42);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn empty_command_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let sandbox = HostSandbox;
        assert!(sandbox.run(tmp.path(), &config(), &[]).await.is_err());
    }
}
