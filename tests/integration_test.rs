#![allow(deprecated)]

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HASH: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// The binary with HOME pointed at a scratch directory.
fn vetscript(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vetscript").unwrap();
    cmd.env("HOME", home)
        .env_remove("VETSCRIPT_API_KEY")
        .env_remove("HTTPS_PROXY")
        .env_remove("RUST_LOG");
    cmd
}

fn json_stdout(output: &std::process::Output) -> serde_json::Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_version_flag() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("vetscript"));
}

#[test]
fn test_help_flag() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("remote script"))
        .stdout(predicate::str::contains("--offline"))
        .stdout(predicate::str::contains("--max-depth"))
        .stdout(predicate::str::contains("--proxy"));
}

#[test]
fn test_no_args_shows_usage() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("vetscript login"))
        .stdout(predicate::str::contains("vetscript <URL>"));
}

#[test]
fn test_config_without_file_shows_defaults() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Current Configuration"))
        .stdout(predicate::str::contains("not configured"));
}

#[test]
fn test_analyze_file_offline_json() {
    let home = TempDir::new().unwrap();
    let script = home.path().join("install.sh");
    fs::write(
        &script,
        "#!/bin/sh\necho hello\nbash <(curl -fsSL ${REPO_URL}/setup.sh)\n",
    )
    .unwrap();

    let output = vetscript(home.path())
        .args(["analyze", "--file"])
        .arg(&script)
        .args(["--offline", "--json"])
        .output()
        .unwrap();

    let report = json_stdout(&output);
    assert_eq!(report["riskScore"], 1);
    assert_eq!(report["billOfMaterials"]["remoteScripts"], serde_json::json!([]));
    assert!(home.path().join(".vetscript").join("audit.log").exists());
}

#[test]
fn test_analyze_missing_file_fails() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .args(["analyze", "--file", "/nonexistent/install.sh", "--offline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open"));
}

#[test]
fn test_invalid_url_scheme_fails() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .args(["ftp://example.com/install.sh", "--offline"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid URL scheme"));
}

#[test]
fn test_malformed_registry_fails() {
    let home = TempDir::new().unwrap();
    let script = home.path().join("install.sh");
    fs::write(&script, "echo hi\n").unwrap();
    let registry = home.path().join("known.json");
    fs::write(&registry, "{ not json").unwrap();

    vetscript(home.path())
        .args(["analyze", "--offline", "--file"])
        .arg(&script)
        .arg("--registry")
        .arg(&registry)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to parse registry"));
}

#[test]
fn test_registry_add_list_remove() {
    let home = TempDir::new().unwrap();
    let url = "https://example.com/install.sh";

    vetscript(home.path())
        .args(["registry", "add", url, "--hash", &HASH.to_uppercase()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Pinned"));

    vetscript(home.path())
        .args(["registry", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains(url))
        .stdout(predicate::str::contains(HASH));

    let stored = fs::read_to_string(home.path().join(".vetscript").join("known_scripts.json")).unwrap();
    assert!(stored.contains(HASH));

    vetscript(home.path())
        .args(["registry", "remove", url])
        .assert()
        .success();

    vetscript(home.path())
        .args(["registry", "remove", url])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not in the registry"));
}

#[test]
fn test_registry_add_rejects_bad_hash() {
    let home = TempDir::new().unwrap();
    vetscript(home.path())
        .args(["registry", "add", "https://example.com/a.sh", "--hash", "abc123"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid SHA-256 digest"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remote_chain_unverified_then_pinned() {
    let server = MockServer::start().await;
    let child_url = format!("{}/child.sh", server.uri());
    Mock::given(method("GET"))
        .and(path("/install.sh"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(format!("#!/bin/bash\nbash <(curl -fsSL {})\n", child_url)),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/child.sh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\necho child\n"))
        .mount(&server)
        .await;

    let home = TempDir::new().unwrap();
    let root_url = format!("{}/install.sh", server.uri());

    let output = vetscript(home.path())
        .args([root_url.as_str(), "--offline", "--json", "--no-proxy", "--retries", "1"])
        .output()
        .unwrap();
    let report = json_stdout(&output);
    assert_eq!(report["riskScore"], 6);
    let scripts = &report["billOfMaterials"]["remoteScripts"];
    assert_eq!(scripts[0]["url"], child_url.as_str());
    assert_eq!(scripts[0]["status"], "unverified");

    // Pin the child's current content, then re-run
    vetscript(home.path())
        .args(["registry", "add", child_url.as_str(), "--no-proxy"])
        .assert()
        .success();

    let output = vetscript(home.path())
        .args([root_url.as_str(), "--offline", "--json", "--no-proxy", "--retries", "1"])
        .output()
        .unwrap();
    let report = json_stdout(&output);
    assert_eq!(report["riskScore"], 1);
    assert_eq!(report["billOfMaterials"]["remoteScripts"][0]["status"], "verified");
}
