//! The Build queue: stage, assemble and commit artifacts

use super::{Disposition, Queue, QueueStatus};
use crate::context::{JobSpec, PipelineContext};
use crate::error::{Result, SchedError};
use crate::job::{JobFn, JobOutcome, JobResult, JobStatus};
use crate::resources::ResourceType;
use petgraph::graph::NodeIndex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use weir_artifact::{Artifact, LogEntry, ARTIFACT_VERSION};
use weir_cas::{required_blobs, CasTree, Digest, Directory, ImportSource};
use weir_core::SandboxConfig;
use weir_graph::{AssemblyPlan, ElementState, Graph, Scope};

/// Assembles elements whose build dependencies are all cached
pub struct BuildQueue;

impl Queue for BuildQueue {
    fn action_name(&self) -> &'static str {
        "Build"
    }

    fn resources(&self) -> &'static [ResourceType] {
        &[ResourceType::Process]
    }

    fn status(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) -> QueueStatus {
        let element = graph.element(node);
        let Some(strong) = &element.keys.strong else {
            return QueueStatus::Wait;
        };

        let name = ctx.artifact_name(graph.project(), element, strong);
        if ctx.cache.contains(&name) {
            return QueueStatus::Skip;
        }

        // All build dependencies must be cached and the sources staged
        let deps_cached = graph
            .dependencies(node, Scope::Build)
            .iter()
            .all(|dep| graph.element(*dep).state == ElementState::Cached);
        let sources_staged = element.sources.is_empty() || element.source_digest.is_some();

        if deps_cached && sources_staged {
            QueueStatus::Ready
        } else {
            QueueStatus::Wait
        }
    }

    fn process(&self, ctx: &Arc<PipelineContext>, spec: JobSpec) -> JobFn {
        let ctx = ctx.clone();
        Arc::new(move || {
            let ctx = ctx.clone();
            let spec = spec.clone();
            Box::pin(async move { assemble(ctx, spec).await })
        })
    }

    fn done(
        &mut self,
        graph: &mut Graph,
        node: NodeIndex,
        result: &JobResult,
        ctx: &PipelineContext,
    ) -> Disposition {
        match (&result.status, &result.outcome) {
            (JobStatus::Ok, Some(JobOutcome::Built { artifact_size })) => {
                // Feed the size estimate; the scheduler runs the real
                // cache-size check once the estimate crosses the quota.
                ctx.cache.usage().add_artifact_size(*artifact_size);
                info!(element = %graph.element(node).name, "Build complete");
                Disposition::Proceed
            }
            _ => {
                let element = graph.element_mut(node);
                element.state = ElementState::Failed;
                if let Some(error) = &result.error {
                    warn!(element = %element.name, error = %error, "Build failed");
                }
                Disposition::Failed
            }
        }
    }

    fn on_skip(&self, graph: &Graph, node: NodeIndex, ctx: &PipelineContext) {
        // A cache hit: advance the artifact's LRU position
        let element = graph.element(node);
        if let Some(strong) = &element.keys.strong {
            let name = ctx.artifact_name(graph.project(), element, strong);
            if let Err(e) = ctx.cache.update_mtime(&name) {
                warn!(artifact = %name, error = %e, "Could not touch artifact");
            }
        }
    }
}

/// Assemble one element: stage dependencies and sources, run the kind's
/// assembly, commit the artifact under the strong key and alias the weak
/// key to it.
async fn assemble(ctx: Arc<PipelineContext>, spec: JobSpec) -> Result<JobOutcome> {
    let element = &spec.element;
    let strong = element
        .keys
        .strong
        .clone()
        .ok_or_else(|| SchedError::internal("build scheduled without a strong key"))?;
    let weak = element
        .keys
        .weak
        .clone()
        .ok_or_else(|| SchedError::internal("build scheduled without a weak key"))?;

    let kind = ctx.kinds.get(&element.kind)?;
    let plan = kind.assembly(element)?;
    let store = ctx.store.clone();

    // Stage the BUILD-scope dependency artifacts, dependencies first, so
    // later dependencies overlay earlier ones.
    let mut staging = CasTree::new(store.clone());
    let staging_root = staging.root();
    for dep_name in &spec.dep_artifacts {
        let artifact = ctx.cache.lookup(dep_name)?;
        if let Some(files) = &artifact.files {
            let mut dep_tree = CasTree::open(store.clone(), files)?;
            let dep_root = dep_tree.root();
            staging.import(staging_root, ImportSource::Cas(&mut dep_tree, dep_root), None)?;
        }
    }

    let mut logs = Vec::new();
    let files_digest: Digest = match plan {
        AssemblyPlan::StageSources => element
            .source_digest
            .clone()
            .ok_or_else(|| SchedError::internal("import element with no staged sources"))?,

        AssemblyPlan::Overlay => staging.digest(staging_root)?,

        AssemblyPlan::Empty => Directory::default().store(&store)?,

        AssemblyPlan::Commands {
            commands,
            env,
            install_root,
        } => {
            run_commands(
                &ctx,
                &spec,
                &mut staging,
                staging_root,
                &commands,
                env,
                &install_root,
                &mut logs,
            )
            .await?
        }
    };

    let public_data = if element.public.is_null() {
        None
    } else {
        let bytes = serde_json::to_vec(&element.public)
            .map_err(|e| SchedError::internal(format!("unencodable public data: {e}")))?;
        Some(store.put_bytes(&bytes)?)
    };

    let artifact = Artifact {
        version: ARTIFACT_VERSION,
        strong_key: strong.clone(),
        weak_key: weak.clone(),
        files: Some(files_digest.clone()),
        buildtree: None,
        sources: element.source_digest.clone(),
        public_data,
        logs,
        build_deps: spec.dep_artifacts.iter().map(|n| n.element.clone()).collect(),
    };

    let name = ctx.artifact_name(&spec.project, element, &strong);
    {
        // One cache writer at a time
        let _cache_lock = ctx.cache_write.lock().await;
        ctx.cache.commit(&name, &artifact)?;
        ctx.cache.link_key(&name, &weak)?;
    }

    let mut artifact_size = artifact
        .encode()
        .map_err(SchedError::Artifact)?
        .len() as u64;
    for blob in required_blobs(&store, &files_digest)? {
        artifact_size += blob.size() as u64;
    }

    Ok(JobOutcome::Built { artifact_size })
}

#[allow(clippy::too_many_arguments)]
async fn run_commands(
    ctx: &Arc<PipelineContext>,
    spec: &JobSpec,
    staging: &mut CasTree,
    staging_root: weir_cas::NodeId,
    commands: &[String],
    env: BTreeMap<String, String>,
    install_root: &str,
    logs: &mut Vec<LogEntry>,
) -> Result<Digest> {
    let element = &spec.element;
    let store = ctx.store.clone();

    // Sources stage under build/, the install root starts empty
    let build_node = staging.descend(staging_root, &["build"], true)?;
    if let Some(source_digest) = &element.source_digest {
        let mut source_tree = CasTree::open(store.clone(), source_digest)?;
        let source_root = source_tree.root();
        staging.import(build_node, ImportSource::Cas(&mut source_tree, source_root), None)?;
    }
    staging.descend(staging_root, &[install_root], true)?;

    let scratch = tempfile::Builder::new()
        .prefix("build-")
        .tempdir_in(ctx.core.cache_dir().join("tmp"))
        .map_err(|e| weir_cas::CasError::io("tempdir", ctx.core.cache_dir().join("tmp"), e))?;
    staging.export_to(staging_root, scratch.path())?;

    let mut sandbox_env = env;
    sandbox_env
        .entry("PATH".to_string())
        .or_insert_with(|| "/usr/bin:/bin".to_string());
    sandbox_env.insert(
        "INSTALL_ROOT".to_string(),
        scratch.path().join(install_root).to_string_lossy().into_owned(),
    );
    sandbox_env.insert(
        "BUILD_ROOT".to_string(),
        scratch.path().join("build").to_string_lossy().into_owned(),
    );

    let sandbox_config = SandboxConfig {
        cwd: "build".into(),
        env: sandbox_env,
        mounts: Vec::new(),
        network: false,
        uid_gid: None,
    };

    let mut log = String::new();
    for command in commands {
        debug!(element = %element.name, command = %command, "Running build command");
        log.push_str(&format!("+ {command}\n"));

        let argv = [
            "sh".to_string(),
            "-c".to_string(),
            command.clone(),
        ];
        let result = ctx
            .sandbox
            .run(scratch.path(), &sandbox_config, &argv)
            .await?;

        log.push_str(&String::from_utf8_lossy(&result.stdout));
        log.push_str(&String::from_utf8_lossy(&result.stderr));

        if !result.success() {
            let log_path = preserve_log(ctx, spec, &log)?;
            return Err(SchedError::Build {
                element: element.name.clone(),
                exit_code: result.exit_code,
                log_path,
            });
        }
    }

    let log_digest = store.put_bytes(log.as_bytes())?;
    logs.push(LogEntry {
        name: "build".to_string(),
        digest: log_digest,
    });

    let mut output = CasTree::new(store);
    let output_root = output.root();
    output.import(
        output_root,
        ImportSource::Fs(&scratch.path().join(install_root)),
        None,
    )?;
    Ok(output.digest(output_root)?)
}

/// Preserve a failing job's log under the cache directory.
fn preserve_log(ctx: &PipelineContext, spec: &JobSpec, log: &str) -> Result<std::path::PathBuf> {
    let key = spec.element.keys.strong.as_deref().unwrap_or("unknown");
    let short_key = &key[..key.len().min(12)];
    let path = ctx
        .core
        .log_dir()
        .join(format!("{}-{short_key}-build.log", spec.element.normal_name));
    std::fs::write(&path, log)
        .map_err(|e| weir_cas::CasError::io("write", path.clone(), e))?;
    Ok(path)
}
