//! Integration tests for Shipyard
//!
//! The CLI tests drive the built binary; the session tests run a full
//! session against the local namespace backend, a real git repository and
//! real shell commands.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a shipyard Command
fn shipyard() -> Command {
    cargo_bin_cmd!("shipyard")
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_shipyard_help() {
        shipyard()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("config"));
    }

    #[test]
    fn test_shipyard_version() {
        shipyard()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_serve_help_lists_flags() {
        shipyard()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--namespace-backend"));
    }

    #[test]
    fn test_serve_rejects_unknown_backend() {
        shipyard()
            .args(["serve", "--namespace-backend", "kubernetes"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("kubernetes"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        shipyard().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Config Command Tests
// =============================================================================

mod config_command {
    use super::*;

    #[test]
    fn test_config_show_without_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .env_remove("SHIPYARD_PORT")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No shipyard.toml found"))
            .stdout(predicate::str::contains("port = 3142"));
    }

    #[test]
    fn test_config_init_creates_file_once() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created shipyard.toml"));

        let content = fs::read_to_string(dir.path().join("shipyard.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("[deploy]"));

        shipyard()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("shipyard.toml"),
            "[execution]\ncommand_timeout_secs = 0\n\n[deploy]\ndomain_suffix = \".bad.\"\n",
        )
        .unwrap();

        shipyard()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"))
            .stdout(predicate::str::contains("command_timeout_secs"))
            .stdout(predicate::str::contains("domain_suffix"));
    }

    #[test]
    fn test_config_validate_clean_file() {
        let dir = TempDir::new().unwrap();
        shipyard()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success();
        shipyard()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_flag_selects_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[server]\nport = 4555\n").unwrap();

        shipyard()
            .env_remove("SHIPYARD_PORT")
            .args(["--config", path.to_str().unwrap(), "config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4555"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shipyard.toml"), "[server]\nport = 4555\n").unwrap();

        shipyard()
            .current_dir(dir.path())
            .env("SHIPYARD_PORT", "4666")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 4666"));
    }

    #[test]
    fn test_invalid_toml_fails() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("shipyard.toml"), "[server\nport = ").unwrap();

        shipyard()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse shipyard.toml"));
    }
}

// =============================================================================
// End-to-end Session Tests
// =============================================================================

mod session_flow {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use shipyard::config::ShipyardToml;
    use shipyard::session::protocol::{Envelope, Status};
    use shipyard::session::{ServerConfig, Services, Session, build_services};
    use tokio::sync::mpsc;

    /// Create a repository with one commit and return its hash.
    fn init_repo(dir: &Path) -> String {
        let repo = git2::Repository::init(dir).unwrap();
        fs::write(dir.join("main.py"), "app = object()\n").unwrap();
        fs::create_dir_all(dir.join("tests")).unwrap();
        fs::write(dir.join("tests/test_app.py"), "def test_ok():\n    assert True\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap()
            .to_string()
    }

    async fn services(workspace: &Path) -> Arc<Services> {
        let mut settings = ShipyardToml::default();
        settings.namespace.workspace_root = workspace.to_path_buf();
        settings.deploy.launch_grace_secs = 1;
        settings.execution.command_timeout_secs = 30;
        build_services(&ServerConfig::from_toml(settings))
            .await
            .unwrap()
    }

    async fn until(rx: &mut mpsc::Receiver<Envelope>, terminal: &[&str]) -> Vec<Envelope> {
        let mut frames = Vec::new();
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(20), rx.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("channel closed");
            let done = terminal.contains(&frame.message_type.as_str());
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    const NAMESPACE_SETUP: &str =
        r#"{"type":"namespace_setup","payload":{"projectId":"p1","projectType":"fastapi"}}"#;

    /// Deliver a client frame; an immediate reply goes out on the same stream
    /// as operation updates, as the socket loop does it.
    async fn deliver(session: &Session, tx: &mpsc::Sender<Envelope>, raw: &str) {
        if let Some(reply) = session.handle_text(raw) {
            tx.send(reply).await.unwrap();
        }
    }

    fn request(kind: &str, repo: &Path, commit: &str, extra: serde_json::Value) -> String {
        let mut payload = json!({
            "projectId": "p1",
            "projectType": "fastapi",
            "repoURL": repo.to_str().unwrap(),
            "commitHash": commit,
        });
        if let (Some(map), Some(extra)) = (payload.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                map.insert(k.clone(), v.clone());
            }
        }
        json!({ "type": kind, "payload": payload }).to_string()
    }

    #[tokio::test]
    async fn test_namespace_test_and_deploy_against_real_repository() {
        let origin = TempDir::new().unwrap();
        let commit = init_repo(origin.path());
        let workspace = TempDir::new().unwrap();
        let services = services(workspace.path()).await;
        let (tx, mut rx) = mpsc::channel(512);
        let session = Session::new(services.clone(), tx.clone());

        // Test before namespace: rejected outright.
        let early = request("test_request", origin.path(), &commit, json!({}));
        deliver(&session, &tx, &early).await;
        let frames = until(&mut rx, &["error"]).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload["code"], "namespace_required");

        // Namespace setup.
        deliver(&session, &tx, NAMESPACE_SETUP).await;
        let frames = until(&mut rx, &["namespace_complete", "error"]).await;
        assert_eq!(frames.last().unwrap().message_type, "namespace_complete");
        assert!(workspace.path().join("im-p1").is_dir());

        // Tests pass with a plain shell check.
        let test = request(
            "test_request",
            origin.path(),
            &commit,
            json!({ "testCommand": "test -f tests/test_app.py && echo collected 1 item" }),
        );
        deliver(&session, &tx, &test).await;
        let frames = until(&mut rx, &["test_complete", "error"]).await;
        let last = frames.last().unwrap();
        assert_eq!(last.message_type, "test_complete");
        assert_eq!(last.status, Status::Success);
        assert!(frames.iter().any(|f| {
            f.payload["update_type"] == "output"
                && f.payload["update_data"]["data"]["line"] == "collected 1 item"
        }));

        // Deploy the same commit: transition, launch, URL.
        let deploy = request(
            "deploy_request",
            origin.path(),
            &commit,
            json!({ "startCommand": "echo listening on $PORT; sleep 30" }),
        );
        deliver(&session, &tx, &deploy).await;
        let frames = until(&mut rx, &["deploy_complete", "error"]).await;
        let last = frames.last().unwrap();
        assert_eq!(last.message_type, "deploy_complete");
        assert_eq!(last.status, Status::Success);
        assert_eq!(last.payload["url"], "http://im-p1.shipyard.localhost");
        assert!(frames.iter().any(|f| {
            f.payload["update_type"] == "output"
                && f.payload["update_data"]["data"]["line"] == "listening on 8000"
        }));
        assert!(
            frames
                .iter()
                .any(|f| f.payload["update_type"] == "transition")
        );

        session.close();
        services.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_tests_end_in_error() {
        let origin = TempDir::new().unwrap();
        let commit = init_repo(origin.path());
        let workspace = TempDir::new().unwrap();
        let services = services(workspace.path()).await;
        let (tx, mut rx) = mpsc::channel(512);
        let session = Session::new(services.clone(), tx.clone());

        deliver(&session, &tx, NAMESPACE_SETUP).await;
        until(&mut rx, &["namespace_complete", "error"]).await;

        let test = request(
            "test_request",
            origin.path(),
            &commit,
            json!({ "testCommand": "echo 1 failed >&2; exit 1" }),
        );
        deliver(&session, &tx, &test).await;
        let frames = until(&mut rx, &["test_complete", "error"]).await;
        let error = frames
            .iter()
            .find(|f| f.payload["update_type"] == "error")
            .unwrap();
        assert_eq!(error.payload["update_data"]["data"]["code"], "tests_failed");
        assert_eq!(error.payload["update_data"]["data"]["step"], "run_tests");
        let last = frames.last().unwrap();
        assert_eq!(last.status, Status::Error);
        assert_eq!(last.payload["passed"], false);
    }

    #[tokio::test]
    async fn test_unknown_commit_fails_checkout() {
        let origin = TempDir::new().unwrap();
        init_repo(origin.path());
        let workspace = TempDir::new().unwrap();
        let services = services(workspace.path()).await;
        let (tx, mut rx) = mpsc::channel(512);
        let session = Session::new(services.clone(), tx.clone());

        deliver(&session, &tx, NAMESPACE_SETUP).await;
        until(&mut rx, &["namespace_complete", "error"]).await;

        let deploy = request("deploy_request", origin.path(), "0123456789abcdef", json!({}));
        deliver(&session, &tx, &deploy).await;
        let frames = until(&mut rx, &["deploy_complete", "error"]).await;
        let error = frames
            .iter()
            .find(|f| f.payload["update_type"] == "error")
            .unwrap();
        assert_eq!(error.payload["update_data"]["data"]["code"], "checkout_failed");
        let last = frames.last().unwrap();
        assert_eq!(last.status, Status::Error);
        assert!(last.payload.get("url").is_none());
    }
}
