//! End-to-end tests of the `enclave` binary
//!
//! Every invocation opens the same temporary data directory, so state
//! carried between commands goes through the database.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    config: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.toml");
        let data_dir = dir.path().join("data");
        std::fs::write(
            &config,
            format!(
                "[core]\nlog_level = \"warn\"\ndata_dir = \"{}\"\n",
                data_dir.display().to_string().replace('\\', "/")
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn write(&self, name: &str, contents: &Value) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents.to_string()).unwrap();
        path
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_enclave"))
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn json(&self, args: &[&str]) -> Value {
        let mut all = vec!["--json"];
        all.extend_from_slice(args);
        let output = self.run(&all);
        assert!(
            output.status.success(),
            "enclave {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

fn package_json(version: &str) -> Value {
    json!({
        "manifest": {
            "id": "greeter",
            "name": "Greeter",
            "version": version,
            "author": "carol",
            "description": "Greets whoever it is given",
            "entry": "index.js",
            "tags": ["demo"],
            "permissions": [
                { "kind": "storage", "scope": "greeter", "description": "Remembers the last name" }
            ],
            "hooks": ["greet"]
        },
        "code": "await api.storage.set('name', input)\napi.storage.get('name')"
    })
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[test]
fn test_install_run_and_uninstall() {
    let ws = Workspace::new();
    let package = ws.write("greeter.json", &package_json("1.0.0"));

    let report = ws.json(&["validate", path_str(&package)]);
    assert_eq!(report["valid"], json!(true));

    let record = ws.json(&["install", path_str(&package)]);
    assert_eq!(record["status"], json!("installed"));

    let listed = ws.json(&["list"]);
    assert_eq!(listed["plugins"][0]["id"], json!("greeter"));
    assert_eq!(listed["plugins"][0]["isolation"], Value::Null);

    let run = ws.json(&["run", "greeter", "--input", "\"Ada\""]);
    assert_eq!(run["result"], json!("Ada"));

    let hits = ws.json(&["search", "greet"]);
    assert_eq!(hits[0]["pluginId"], json!("greeter"));

    let output = ws.run(&["uninstall", "greeter"]);
    assert!(output.status.success());
    let listed = ws.json(&["list"]);
    assert_eq!(listed["plugins"], json!([]));
}

#[test]
fn test_block_and_unblock() {
    let ws = Workspace::new();
    let package = ws.write("greeter.json", &package_json("1.0.0"));

    ws.json(&["block", "greeter", "--reason", "testing"]);
    let output = ws.run(&["install", path_str(&package)]);
    assert!(!output.status.success());

    let unblocked = ws.json(&["unblock", "greeter"]);
    assert_eq!(unblocked["unblocked"], json!(true));
    ws.json(&["install", path_str(&package)]);
}

#[test]
fn test_update_and_export() {
    let ws = Workspace::new();
    let v1 = ws.write("v1.json", &package_json("1.0.0"));
    let v2 = ws.write("v2.json", &package_json("1.2.0"));

    ws.json(&["install", path_str(&v1)]);
    let updated = ws.json(&["update", path_str(&v2)]);
    assert_eq!(updated["manifest"]["version"], json!("1.2.0"));

    let output = ws.run(&["update", path_str(&v2)]);
    assert!(!output.status.success());

    let export_path = ws.dir.path().join("export.json");
    let output = ws.run(&["export", "--output", path_str(&export_path)]);
    assert!(output.status.success());
    let snapshot: Value = serde_json::from_str(&std::fs::read_to_string(&export_path).unwrap()).unwrap();
    assert_eq!(snapshot["plugins"][0]["manifest"]["version"], json!("1.2.0"));
}

#[test]
fn test_rejects_unknown_status_filter() {
    let ws = Workspace::new();
    let output = ws.run(&["list", "--status", "sleeping"]);
    assert!(!output.status.success());
}
