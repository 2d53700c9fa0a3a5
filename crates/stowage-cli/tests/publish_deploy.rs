//! Publish and deploy against a filesystem store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use stowage_cli::ops::target::read_link;
use stowage_cli::ops::{
    ComponentStatus, Context, DeployRequest, OpError, PackRequest, PublishRequest, deploy,
    list_deployed_versions, pack, publish, status, switch_version, verify_deployment,
};
use stowage_core::storage::FilesystemBackend;
use stowage_core::{CancelToken, NullReporter, ProjectPaths, Settings, StorageSettings};
use stowage_schema::{Component, ReleaseVersion, layout};
use tempfile::TempDir;

struct TestContext {
    tmp: TempDir,
    ctx: Context,
}

impl TestContext {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("project");
        let store = tmp.path().join("store");
        std::fs::create_dir_all(&root).unwrap();
        let settings = Settings {
            storage: StorageSettings::filesystem(&store),
            ..Settings::default()
        };
        let ctx = Context::new(
            ProjectPaths::at(&root),
            settings,
            Arc::new(FilesystemBackend::new(&store)),
            Arc::new(NullReporter),
            CancelToken::new(),
        );
        Self { tmp, ctx }
    }

    fn store(&self) -> PathBuf {
        self.tmp.path().join("store")
    }

    fn target(&self) -> PathBuf {
        self.tmp.path().join("target")
    }

    fn stored(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.store(), |p, part| p.join(part))
    }

    /// Pack a directory holding `files` as `kind:version`.
    async fn pack(&self, kind: &str, version: &str, files: &[(&str, &[u8])]) -> Component {
        let src = self.ctx.paths.root.join("src").join(kind).join(version);
        for (name, data) in files {
            let path = src.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, data).unwrap();
        }
        let component = Component::new(kind, version);
        pack(&self.ctx, PackRequest::new(&src, component.clone()))
            .await
            .unwrap();
        component
    }

    async fn pack_simple(&self, kind: &str, version: &str) -> Component {
        let body = format!("{kind} {version}\n");
        self.pack(kind, version, &[("data.txt", body.as_bytes())]).await
    }

    async fn publish_release(&self, release: &str, components: Vec<Component>) {
        let result = publish(
            &self.ctx,
            PublishRequest::new(components).release(ReleaseVersion::new(release)),
        )
        .await
        .unwrap();
        assert!(result.success, "{:?}", result.error);
    }

    async fn deploy_release(&self, release: &str) -> stowage_cli::ops::DeployResult {
        deploy(
            &self.ctx,
            DeployRequest::release(ReleaseVersion::new(release), self.target()),
        )
        .await
        .unwrap()
    }
}

fn archive_key(ctx: &Context, component: &Component) -> String {
    let manifest = ctx.manifests().load_component(component).unwrap();
    layout::archive_key(component, &manifest.archive.filename)
}

fn local_archive(ctx: &Context, component: &Component) -> PathBuf {
    let manifest = ctx.manifests().load_component(component).unwrap();
    ctx.paths.archive_path(&manifest.archive.filename)
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn test_republish_transfers_nothing() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;

    let first = publish(&t.ctx, PublishRequest::new(vec![model.clone()]))
        .await
        .unwrap();
    assert!(first.success);
    assert!(first.bytes_transferred > 0);

    let second = publish(&t.ctx, PublishRequest::new(vec![model]))
        .await
        .unwrap();
    assert!(second.success);
    assert_eq!(second.bytes_transferred, 0);
    assert_eq!(second.components[0].status, ComponentStatus::AlreadyPublished);
}

#[tokio::test]
async fn test_atomic_publish_removes_everything_on_failure() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    let config = t.pack_simple("config", "1.0.0").await;
    std::fs::remove_file(local_archive(&t.ctx, &config)).unwrap();

    let result = publish(
        &t.ctx,
        PublishRequest::new(vec![model.clone(), config.clone()])
            .release(ReleaseVersion::new("2024.01.20")),
    )
    .await
    .unwrap();

    assert!(!result.success);
    assert!(matches!(result.failure, Some(OpError::ComponentNotFound(_))));
    assert_eq!(result.components[0].status, ComponentStatus::RolledBack);
    assert!(matches!(result.components[1].status, ComponentStatus::Failed { .. }));
    for c in [&model, &config] {
        assert!(!t.stored(&layout::manifest_key(c)).exists());
    }
    assert!(!t.stored(&archive_key(&t.ctx, &model)).exists());
    assert!(!t.stored(&layout::release_key(&ReleaseVersion::new("2024.01.20"))).exists());
    assert!(!t.ctx.paths.release_path(&ReleaseVersion::new("2024.01.20")).exists());
}

#[tokio::test]
async fn test_non_atomic_publish_keeps_successes() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    let config = t.pack_simple("config", "1.0.0").await;
    std::fs::remove_file(local_archive(&t.ctx, &config)).unwrap();

    let mut req = PublishRequest::new(vec![model.clone(), config]);
    req.atomic = false;
    let result = publish(&t.ctx, req).await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.components[0].status, ComponentStatus::Published { .. }));
    assert!(matches!(result.components[1].status, ComponentStatus::Failed { .. }));
    assert_eq!(result.succeeded(), vec![&model]);
    assert!(t.stored(&layout::manifest_key(&model)).exists());
    assert!(t.stored(&archive_key(&t.ctx, &model)).exists());
}

#[tokio::test]
async fn test_non_atomic_publish_skips_component_without_manifest() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    let config = t.pack_simple("config", "1.0.0").await;
    let runtime = t.pack_simple("runtime", "1.0.0").await;
    std::fs::remove_file(t.ctx.manifests().find_manifest(&config).unwrap()).unwrap();

    let mut req = PublishRequest::new(vec![model.clone(), config.clone(), runtime.clone()]);
    req.atomic = false;
    let result = publish(&t.ctx, req).await.unwrap();

    assert!(!result.success);
    assert!(matches!(result.failure, Some(OpError::ComponentNotFound(_))));
    let status_of = |c: &Component| {
        result
            .components
            .iter()
            .find(|o| &o.component == c)
            .map(|o| o.status.clone())
            .unwrap()
    };
    assert!(matches!(status_of(&model), ComponentStatus::Published { .. }));
    assert!(matches!(status_of(&runtime), ComponentStatus::Published { .. }));
    assert!(matches!(status_of(&config), ComponentStatus::Failed { .. }));

    for c in [&model, &runtime] {
        assert!(t.stored(&layout::manifest_key(c)).exists());
        assert!(t.stored(&archive_key(&t.ctx, c)).exists());
    }
    assert!(!t.stored(&layout::manifest_key(&config)).exists());
}

#[tokio::test]
async fn test_corrupt_archive_is_never_extracted() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    publish(&t.ctx, PublishRequest::new(vec![model.clone()]))
        .await
        .unwrap();

    let stored = t.stored(&archive_key(&t.ctx, &model));
    let mut bytes = std::fs::read(&stored).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&stored, bytes).unwrap();

    let result = deploy(&t.ctx, DeployRequest::component(model, t.target()))
        .await
        .unwrap();

    assert!(!result.success);
    assert!(matches!(result.failure, Some(OpError::ChecksumMismatch { .. })));
    assert!(!t.target().join("model").join("1.0.0").exists());
    assert!(!t.target().join(".stowage-deploy.json").exists());
}

#[tokio::test]
async fn test_failed_deploy_keeps_previous_release() {
    let t = TestContext::new();
    let v1 = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![v1]).await;
    assert!(t.deploy_release("2024.01.20").await.success);

    let v2 = t.pack_simple("model", "2.0.0").await;
    t.publish_release("2024.02.01", vec![v2.clone()]).await;

    // The stored manifest promises a file the archive does not contain.
    let manifest_path = t.stored(&layout::manifest_key(&v2));
    let mut doc: serde_json::Value = serde_json::from_str(&read(&manifest_path)).unwrap();
    doc["archive"]["files"]
        .as_array_mut()
        .unwrap()
        .push(serde_json::json!({ "path": "weights.bin", "size": 4 }));
    std::fs::write(&manifest_path, serde_json::to_vec(&doc).unwrap()).unwrap();

    let result = t.deploy_release("2024.02.01").await;
    assert!(!result.success);
    assert!(result.rolled_back);
    assert!(matches!(result.failure, Some(OpError::Verification(_))));

    assert_eq!(
        read_link(&t.target().join("model")).unwrap(),
        Path::new("releases/2024.01.20/model/1.0.0")
    );
    assert_eq!(read(&t.target().join("model/data.txt")), "model 1.0.0\n");
    assert!(!t.target().join("releases/2024.02.01").exists());

    let state = status(&t.target()).unwrap().unwrap();
    assert_eq!(state.release_version.as_deref(), Some("2024.01.20"));
    assert_eq!(list_deployed_versions(&t.target()).unwrap(), vec!["2024.01.20"]);
}

#[tokio::test]
async fn test_switch_between_deployed_releases() {
    let t = TestContext::new();
    let v1 = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![v1]).await;
    let v2 = t.pack_simple("model", "2.0.0").await;
    t.publish_release("2024.02.01", vec![v2]).await;

    assert!(t.deploy_release("2024.01.20").await.success);
    let second = t.deploy_release("2024.02.01").await;
    assert!(second.success);
    let state = second.state.unwrap();
    assert_eq!(state.previous_version.as_deref(), Some("2024.01.20"));
    assert_eq!(read(&t.target().join("model/data.txt")), "model 2.0.0\n");

    let state = switch_version(&t.target(), &ReleaseVersion::new("2024.01.20"), &NullReporter)
        .await
        .unwrap();
    assert_eq!(state.release_version.as_deref(), Some("2024.01.20"));
    assert_eq!(read(&t.target().join("model/data.txt")), "model 1.0.0\n");
    assert_eq!(
        list_deployed_versions(&t.target()).unwrap(),
        vec!["2024.01.20", "2024.02.01"]
    );
}

#[tokio::test]
async fn test_redeploy_reuses_extraction() {
    let t = TestContext::new();
    let v1 = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![v1]).await;

    assert!(t.deploy_release("2024.01.20").await.success);
    let again = t.deploy_release("2024.01.20").await;
    assert!(again.success);
    assert!(again.components[0].reused);
    assert!(again.state.unwrap().previous_version.is_none());
}

#[tokio::test]
async fn test_unknown_release_leaves_target_untouched() {
    let t = TestContext::new();
    let err = deploy(
        &t.ctx,
        DeployRequest::release(ReleaseVersion::new("1999.01.01"), t.target()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, OpError::ReleaseNotFound(_)));
    assert!(!t.target().exists());
}

#[tokio::test]
async fn test_pack_publish_deploy_end_to_end() {
    let t = TestContext::new();
    let weights = vec![7u8; 8 * 1024];
    let vocab = "token\n".repeat(256);
    let config = br#"{"layers": 12}"#;
    let model = t
        .pack(
            "model",
            "1.0.0",
            &[
                ("weights.bin", weights.as_slice()),
                ("vocab/tokens.txt", vocab.as_bytes()),
                ("config.json", config.as_slice()),
            ],
        )
        .await;

    t.publish_release("2024.01.20", vec![model.clone()]).await;
    assert!(t.stored(&layout::release_key(&ReleaseVersion::new("2024.01.20"))).exists());

    let mut req = DeployRequest::release(ReleaseVersion::new("2024.01.20"), t.target());
    req.verify_checksums = true;
    let result = deploy(&t.ctx, req).await.unwrap();
    assert!(result.success, "{:?}", result.error);

    let report = result.verification.unwrap();
    assert_eq!(report.files_expected, 3);
    assert_eq!(report.files_found, 3);

    let live = t.target().join("model");
    assert_eq!(std::fs::read(live.join("weights.bin")).unwrap(), weights);
    assert_eq!(read(&live.join("vocab/tokens.txt")), vocab);
    assert_eq!(std::fs::read(live.join("config.json")).unwrap(), config);

    assert_eq!(list_deployed_versions(&t.target()).unwrap(), vec!["2024.01.20"]);
    let state = status(&t.target()).unwrap().unwrap();
    assert_eq!(state.components.get("model").map(String::as_str), Some("1.0.0"));
    assert_eq!(
        state.paths.get("model").map(String::as_str),
        Some("releases/2024.01.20/model/1.0.0")
    );
}

#[tokio::test]
async fn test_release_with_path_like_component_is_rejected() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![model]).await;

    let outside = t.tmp.path().join("outside");
    let published = t.stored(&layout::release_key(&ReleaseVersion::new("2024.01.20")));
    let original: serde_json::Value = serde_json::from_str(&read(&published)).unwrap();

    for (release, kind) in [
        ("r1", outside.to_string_lossy().into_owned()),
        ("r2", "../outside".to_string()),
    ] {
        let mut doc = original.clone();
        doc["release"]["version"] = release.into();
        doc["components"][0]["type"] = kind.into();
        let key = layout::release_key(&ReleaseVersion::new(release));
        std::fs::write(t.stored(&key), serde_json::to_vec(&doc).unwrap()).unwrap();

        let err = deploy(
            &t.ctx,
            DeployRequest::release(ReleaseVersion::new(release), t.target()),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, OpError::Validation(_)), "{err}");
        assert_eq!(err.exit_code(), 3);
    }

    assert!(!outside.exists());
    assert!(!t.target().exists());
}

#[tokio::test]
async fn test_verify_flags_component_without_manifest() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![model]).await;
    assert!(t.deploy_release("2024.01.20").await.success);
    assert!(verify_deployment(&t.target(), true).await.unwrap().is_ok());

    let dir = t.target().join("releases/2024.01.20/model/1.0.0");
    std::fs::remove_file(dir.join(".manifest.json")).unwrap();

    let report = verify_deployment(&t.target(), false).await.unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.missing, vec!["model:1.0.0/.manifest.json"]);
}

#[tokio::test]
async fn test_verify_without_file_list_uses_cached_archive() {
    let t = TestContext::new();
    let model = t.pack_simple("model", "1.0.0").await;
    t.publish_release("2024.01.20", vec![model]).await;
    assert!(t.deploy_release("2024.01.20").await.success);

    let dir = t.target().join("releases/2024.01.20/model/1.0.0");
    let manifest_path = dir.join(".manifest.json");
    let mut doc: serde_json::Value = serde_json::from_str(&read(&manifest_path)).unwrap();
    doc["archive"].as_object_mut().unwrap().remove("files");
    std::fs::write(&manifest_path, serde_json::to_vec(&doc).unwrap()).unwrap();
    std::fs::remove_file(dir.join("data.txt")).unwrap();

    let report = verify_deployment(&t.target(), false).await.unwrap();
    assert_eq!(report.files_expected, 1);
    assert_eq!(report.missing.len(), 1);
    assert!(report.missing[0].ends_with("data.txt"), "{:?}", report.missing);
}
