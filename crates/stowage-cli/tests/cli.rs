//! End-to-end tests that run the stowage CLI binary.

use std::path::PathBuf;
use std::process::{Command, Output};

use tempfile::TempDir;

/// A project directory with its own filesystem store and deploy target.
struct TestContext {
    temp_dir: TempDir,
    project: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let project = temp_dir.path().join("project");
        let store = temp_dir.path().join("store");
        std::fs::create_dir_all(project.join("bundle")).unwrap();
        std::fs::write(
            project.join("stowage.toml"),
            format!("[storage]\nkind = \"filesystem\"\npath = '{}'\n", store.display()),
        )
        .unwrap();
        std::fs::write(project.join("bundle").join("app.cfg"), "threads = 4\n").unwrap();
        Self { temp_dir, project }
    }

    fn target(&self) -> PathBuf {
        self.temp_dir.path().join("target")
    }

    fn stow(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_stow"))
            .current_dir(&self.project)
            .env("HOME", self.temp_dir.path())
            .env_remove("RUST_LOG")
            .env_remove("STOWAGE_PROJECT")
            .args(args)
            .output()
            .expect("failed to run stow")
    }
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.stow(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
    assert!(stdout.contains("deploy"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    assert!(ctx.stow(&["--version"]).status.success());
}

#[test]
fn test_pack_publish_deploy() {
    let ctx = TestContext::new();
    let target = ctx.target();
    let target = target.to_str().unwrap();

    let out = ctx.stow(&["pack", "bundle", "-t", "config", "-V", "1.0.0", "--json"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let packed: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(packed["files"], 1);

    let out = ctx.stow(&["publish", "config:1.0.0", "-r", "2024.01.20"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let out = ctx.stow(&["deploy", "-r", "2024.01.20", "-T", target]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(
        std::fs::read_to_string(ctx.target().join("config").join("app.cfg")).unwrap(),
        "threads = 4\n"
    );

    let out = ctx.stow(&["versions", "-T", target, "--json"]);
    assert!(out.status.success());
    let versions: Vec<String> = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(versions, vec!["2024.01.20"]);

    let out = ctx.stow(&["status", "-T", target, "--verify", "--checksums"]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
}

#[test]
fn test_exit_codes() {
    let ctx = TestContext::new();
    let target = ctx.target();
    let target = target.to_str().unwrap();

    let out = ctx.stow(&["deploy", "-r", "2030.01.01", "-T", target]);
    assert_eq!(out.status.code(), Some(6));

    let out = ctx.stow(&["publish", "config:9.9.9"]);
    assert_eq!(out.status.code(), Some(6));

    let out = ctx.stow(&["pack", "bundle", "-t", "9bad", "-V", "1.0.0"]);
    assert_eq!(out.status.code(), Some(3));

    let out = ctx.stow(&["pack", "bundle", "-t", "config", "-V", "1.0.0"]);
    assert!(out.status.success());
    let out = ctx.stow(&["pack", "bundle", "-t", "config", "-V", "1.0.0"]);
    assert_eq!(out.status.code(), Some(7));
}
