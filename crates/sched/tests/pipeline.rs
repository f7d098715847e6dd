//! End-to-end pipeline scenarios

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use weir_artifact::ArtifactName;
use weir_cas::{CasTree, EntryKind, ImportSource};
use weir_core::{Config, CoreContext, RemoteSpecConfig, Sandbox, SandboxConfig, SandboxResult};
use weir_graph::{ElementDecl, Graph};
use weir_sched::{build_pipeline, Outcome, PipelineContext, Scheduler};

fn decls_from_json(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, ElementDecl> {
    pairs
        .iter()
        .map(|(name, json)| {
            let decl: ElementDecl = serde_json::from_value(json.clone()).unwrap();
            ((*name).to_string(), decl)
        })
        .collect()
}

fn core_context(cache_dir: &Path, mutate: impl FnOnce(&mut Config)) -> Arc<CoreContext> {
    let mut config = Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..Config::default()
    };
    mutate(&mut config);
    Arc::new(CoreContext::new(config).unwrap())
}

fn stage_sources(project: &Path) {
    let files = project.join("files");
    fs::create_dir_all(files.join("bin")).unwrap();
    fs::write(files.join("a"), b"x\n").unwrap();
    fs::write(files.join("bin/hello"), b"#!/bin/sh\necho hello\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(files.join("bin/hello"), fs::Permissions::from_mode(0o755)).unwrap();
    }
}

fn import_decl() -> serde_json::Value {
    serde_json::json!({
        "kind": "import",
        "sources": [{ "kind": "local", "path": "files" }],
    })
}

async fn run_pipeline(
    ctx: &Arc<PipelineContext>,
    decls: &BTreeMap<String, ElementDecl>,
    targets: &[&str],
) -> (Graph, weir_sched::RunSummary) {
    let mut graph = Graph::from_decls("proj", decls).unwrap();
    let mut scheduler = Scheduler::standard(ctx.clone());
    let summary = scheduler.run(&mut graph, targets).await.unwrap();
    (graph, summary)
}

fn strong_name(ctx: &Arc<PipelineContext>, graph: &Graph, element: &str) -> ArtifactName {
    let node = graph.node(element).unwrap();
    let elem = graph.element(node);
    ctx.artifact_name("proj", elem, elem.keys.strong.as_ref().unwrap())
}

fn artifact_listing(ctx: &Arc<PipelineContext>, name: &ArtifactName) -> Vec<String> {
    let artifact = ctx.cache.lookup(name).unwrap();
    let mut tree = CasTree::open(ctx.store.clone(), artifact.files.as_ref().unwrap()).unwrap();
    let root = tree.root();
    tree.list_relative_paths(root).unwrap()
}

/// Scenario 1: build a leaf element with no dependencies.
#[tokio::test]
async fn build_leaf_element() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    stage_sources(project.path());

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();

    let decls = decls_from_json(&[("hello.bst", import_decl())]);
    let (graph, summary) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;

    assert_eq!(summary.outcome, Outcome::Success);
    assert_eq!(summary.processed_in("Build"), vec!["hello.bst"]);

    let name = strong_name(&ctx, &graph, "hello.bst");
    assert!(ctx.cache.contains(&name));
    assert_eq!(artifact_listing(&ctx, &name), vec!["a", "bin/hello"]);

    // Executable bit survived staging
    let artifact = ctx.cache.lookup(&name).unwrap();
    let mut tree = CasTree::open(ctx.store.clone(), artifact.files.as_ref().unwrap()).unwrap();
    let root = tree.root();
    assert!(matches!(
        tree.lookup(root, "bin/hello").unwrap(),
        Some(EntryKind::File {
            executable: true,
            ..
        })
    ));
}

/// Scenario 2: rebuilding with identical inputs is a cache hit.
#[tokio::test]
async fn rebuild_is_a_cache_hit() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    stage_sources(project.path());

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();
    let decls = decls_from_json(&[("hello.bst", import_decl())]);

    let (graph, first) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    assert_eq!(first.processed_in("Build"), vec!["hello.bst"]);
    let name = strong_name(&ctx, &graph, "hello.bst");

    // Backdate the ref so the LRU touch is observable
    let ref_path = cache.path().join("refs/heads").join(name.to_string());
    let old = SystemTime::now() - Duration::from_secs(3600);
    fs::OpenOptions::new()
        .write(true)
        .open(&ref_path)
        .unwrap()
        .set_modified(old)
        .unwrap();

    let (graph2, second) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    assert_eq!(second.outcome, Outcome::Success);
    assert!(second.processed_in("Build").is_empty());
    assert_eq!(second.skipped_in("Build"), vec!["hello.bst"]);

    // Same key, advanced mtime
    assert_eq!(strong_name(&ctx, &graph2, "hello.bst"), name);
    let touched = fs::metadata(&ref_path).unwrap().modified().unwrap();
    assert!(touched > old);
}

/// Scenario 3: a source change misses the cache; the old artifact stays.
#[tokio::test]
async fn source_change_is_a_cache_miss() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    stage_sources(project.path());

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();
    let decls = decls_from_json(&[("hello.bst", import_decl())]);

    let (graph1, _) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    let name1 = strong_name(&ctx, &graph1, "hello.bst");

    fs::write(project.path().join("files/a"), b"different\n").unwrap();

    let (graph2, summary) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    assert_eq!(summary.processed_in("Build"), vec!["hello.bst"]);
    let name2 = strong_name(&ctx, &graph2, "hello.bst");

    assert_ne!(name1.key, name2.key);
    assert!(ctx.cache.contains(&name1));
    assert!(ctx.cache.contains(&name2));
}

/// Scenario 4: push to a remote, drop the local copy, pull it back.
#[tokio::test]
async fn push_and_pull_round_trip() {
    let cache = TempDir::new().unwrap();
    let remote = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    stage_sources(project.path());

    let remote_url = format!("file://{}", remote.path().display());
    let core = core_context(cache.path(), |config| {
        config.remotes = vec![RemoteSpecConfig {
            url: remote_url,
            push: true,
        }];
    });
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();
    let decls = decls_from_json(&[("hello.bst", import_decl())]);

    let (graph, first) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    assert_eq!(first.processed_in("Build"), vec!["hello.bst"]);
    assert_eq!(first.processed_in("Push"), vec!["hello.bst"]);
    let name = strong_name(&ctx, &graph, "hello.bst");
    let original_listing = artifact_listing(&ctx, &name);

    // Forget the artifact locally
    ctx.cache.remove(&name.to_string()).unwrap();
    assert!(!ctx.cache.contains(&name));

    let (_, second) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;
    assert_eq!(second.outcome, Outcome::Success);
    assert_eq!(second.processed_in("Pull"), vec!["hello.bst"]);
    assert!(second.processed_in("Build").is_empty());

    assert!(ctx.cache.contains(&name));
    assert_eq!(artifact_listing(&ctx, &name), original_listing);
}

/// Scenario 5: composing two artifacts follows the overlay rule.
#[tokio::test]
async fn compose_two_artifacts() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    // First dependency: a file, an empty dir, a non-empty dir
    let one = project.path().join("one");
    fs::create_dir_all(one.join("ed")).unwrap();
    fs::create_dir_all(one.join("nd")).unwrap();
    fs::write(one.join("f"), b"from one\n").unwrap();
    fs::write(one.join("nd/keep"), b"keep me\n").unwrap();

    // Second dependency: collides on all three
    let two = project.path().join("two");
    fs::create_dir_all(two.join("ed")).unwrap();
    fs::create_dir_all(two.join("nd")).unwrap();
    fs::write(two.join("f"), b"from two\n").unwrap();

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();

    let decls = decls_from_json(&[
        (
            "one.bst",
            serde_json::json!({
                "kind": "import",
                "sources": [{ "kind": "local", "path": "one" }],
            }),
        ),
        (
            "two.bst",
            serde_json::json!({
                "kind": "import",
                "sources": [{ "kind": "local", "path": "two" }],
            }),
        ),
        (
            "c.bst",
            serde_json::json!({
                "kind": "compose",
                "depends": [
                    { "filename": "one.bst", "type": "build" },
                    { "filename": "two.bst", "type": "build" },
                ],
            }),
        ),
    ]);

    let (graph, summary) = run_pipeline(&ctx, &decls, &["c.bst"]).await;
    assert_eq!(summary.outcome, Outcome::Success);

    let name = strong_name(&ctx, &graph, "c.bst");
    let artifact = ctx.cache.lookup(&name).unwrap();
    let mut tree = CasTree::open(ctx.store.clone(), artifact.files.as_ref().unwrap()).unwrap();
    let root = tree.root();

    // The second dependency's file won
    let f_digest = weir_cas::Digest::from_bytes(b"from two\n");
    assert!(matches!(
        tree.lookup(root, "f").unwrap(),
        Some(EntryKind::File { digest, .. }) if digest == f_digest
    ));
    // The non-empty directory collision kept the first dependency's content
    assert!(tree.lookup(root, "nd/keep").unwrap().is_some());
    assert!(tree.lookup(root, "ed").unwrap().is_some());

    // The overlay reports the ignored collision when replayed directly
    let one_artifact = ctx
        .cache
        .lookup(&strong_name(&ctx, &graph, "one.bst"))
        .unwrap();
    let two_artifact = ctx
        .cache
        .lookup(&strong_name(&ctx, &graph, "two.bst"))
        .unwrap();
    let mut base = CasTree::open(ctx.store.clone(), one_artifact.files.as_ref().unwrap()).unwrap();
    let base_root = base.root();
    let mut overlay =
        CasTree::open(ctx.store.clone(), two_artifact.files.as_ref().unwrap()).unwrap();
    let overlay_root = overlay.root();
    let result = base
        .import(base_root, ImportSource::Cas(&mut overlay, overlay_root), None)
        .unwrap();
    assert_eq!(result.ignored, vec!["nd"]);
    assert!(result.overwritten.iter().any(|p| p == "f"));
    assert!(result.overwritten.iter().any(|p| p == "ed"));
}

/// Sandbox double that records how many commands run concurrently.
struct CountingSandbox {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait::async_trait]
impl Sandbox for CountingSandbox {
    async fn run(
        &self,
        _root: &Path,
        _config: &SandboxConfig,
        _command: &[String],
    ) -> weir_core::Result<SandboxResult> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(SandboxResult {
            exit_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Scenario 6: the PROCESS concurrency cap is respected.
#[tokio::test]
async fn build_concurrency_cap_is_respected() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let core = core_context(cache.path(), |config| config.builders = 2);
    let base_ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();

    let sandbox = Arc::new(CountingSandbox {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let ctx = Arc::new(PipelineContext {
        core: base_ctx.core.clone(),
        store: base_ctx.store.clone(),
        cache: base_ctx.cache.clone(),
        sandbox: sandbox.clone(),
        kinds: base_ctx.kinds.clone(),
        sources: base_ctx.sources.clone(),
        project_root: base_ctx.project_root.clone(),
        cache_write: tokio::sync::Mutex::new(()),
    });

    let pairs: Vec<(String, serde_json::Value)> = (0..5)
        .map(|i| {
            (
                format!("e{i}.bst"),
                serde_json::json!({
                    "kind": "script",
                    "config": { "commands": [format!("work {i}")] },
                }),
            )
        })
        .collect();
    let decls = decls_from_json(
        &pairs
            .iter()
            .map(|(n, j)| (n.as_str(), j.clone()))
            .collect::<Vec<_>>(),
    );

    let targets: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
    let (_, summary) = run_pipeline(&ctx, &decls, &targets).await;

    assert_eq!(summary.outcome, Outcome::Success);
    assert_eq!(summary.processed_in("Build").len(), 5);
    assert!(
        sandbox.max_seen.load(Ordering::SeqCst) <= 2,
        "saw {} concurrent builds with a cap of 2",
        sandbox.max_seen.load(Ordering::SeqCst)
    );
}

/// A failing build marks the element failed and dependents never build.
#[tokio::test]
async fn build_failure_fails_the_pipeline() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();

    let decls = decls_from_json(&[
        (
            "broken.bst",
            serde_json::json!({
                "kind": "script",
                "config": { "commands": ["exit 7"] },
            }),
        ),
        (
            "app.bst",
            serde_json::json!({
                "kind": "stack",
                "depends": [{ "filename": "broken.bst", "type": "build" }],
            }),
        ),
    ]);

    let (graph, summary) = run_pipeline(&ctx, &decls, &["app.bst"]).await;
    assert_eq!(summary.outcome, Outcome::Failure);
    assert!(summary.failed.contains(&"broken.bst".to_string()));

    // The dependent never produced an artifact
    let app = graph.node("app.bst").unwrap();
    assert!(graph.element(app).keys.strong.is_none() || {
        let name = strong_name(&ctx, &graph, "app.bst");
        !ctx.cache.contains(&name)
    });

    // The failing build's log was preserved
    let logs: Vec<_> = fs::read_dir(cache.path().join("logs"))
        .unwrap()
        .flatten()
        .collect();
    assert!(!logs.is_empty());
}

/// Cancellation before dispatch terminates cleanly.
#[tokio::test]
async fn cancellation_terminates() {
    let cache = TempDir::new().unwrap();
    let project = TempDir::new().unwrap();
    stage_sources(project.path());

    let core = core_context(cache.path(), |_| {});
    let ctx = build_pipeline(core, project.path().to_path_buf()).unwrap();
    ctx.core.cancel();

    let decls = decls_from_json(&[("hello.bst", import_decl())]);
    let (_, summary) = run_pipeline(&ctx, &decls, &["hello.bst"]).await;

    assert_eq!(summary.outcome, Outcome::Terminated);
    assert_eq!(summary.outcome.exit_code(), 3);
}
