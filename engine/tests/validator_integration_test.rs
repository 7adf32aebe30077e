use ed25519_dalek::{Signer, SigningKey};
use enclave_engine::clock::ManualClock;
use enclave_engine::config::{SandboxConfig, SecurityConfig};
use enclave_engine::message_bus::MessageBus;
use enclave_engine::security::integrity::{checksum, HashAlgorithm};
use enclave_engine::security::patterns::CodePatterns;
use enclave_engine::security::SecurityValidator;
use enclave_engine::storage::MemoryKvStore;
use sdk::types::{PluginPackage, Severity};
use serde_json::{json, Value};
use std::sync::Arc;

fn validator_with(config: SecurityConfig) -> SecurityValidator {
    SecurityValidator::new(
        config,
        &SandboxConfig::default(),
        Arc::new(CodePatterns::new().unwrap()),
        Arc::new(MemoryKvStore::new()),
        Arc::new(MessageBus::new()),
        Arc::new(ManualClock::new(1_000)),
    )
}

fn validator() -> SecurityValidator {
    validator_with(SecurityConfig::default())
}

fn manifest() -> Value {
    json!({
        "id": "weather",
        "name": "Weather",
        "version": "1.0.0",
        "author": "alice",
        "description": "Shows the forecast",
        "entry": "index.js",
        "permissions": [
            { "kind": "network", "scope": "api.weather.com", "description": "Fetches forecast data" }
        ]
    })
}

fn package(manifest: Value, code: &str) -> PluginPackage {
    PluginPackage::from_json(&json!({ "manifest": manifest, "code": code }).to_string()).unwrap()
}

const CODE: &str = "const city = config.city\nawait api.http.get('https://api.weather.com/today')";

#[tokio::test]
async fn test_clean_package_from_unknown_developer() {
    let report = validator().validate(&package(manifest(), CODE)).await;
    assert!(report.valid);
    assert_eq!(report.score, 95);
    assert!(report.issues.is_empty());
    assert!(report.warning("unknown_developer").is_some());
}

#[tokio::test]
async fn test_trusted_developer_gets_bonus() {
    let validator = validator();
    validator.add_trusted_developer("alice", None).await.unwrap();
    let report = validator.validate(&package(manifest(), CODE)).await;
    assert_eq!(report.score, 100);
    assert!(report.warnings.is_empty());
}

#[tokio::test]
async fn test_system_permission_is_critical() {
    let mut manifest = manifest();
    manifest["permissions"] = json!([
        { "kind": "system", "scope": "shell", "description": "Runs shell commands" }
    ]);
    let report = validator().validate(&package(manifest, CODE)).await;
    assert!(!report.valid);
    assert!(report.has_critical());
    assert_eq!(report.issue("system_permission").unwrap().severity, Severity::Critical);
}

#[tokio::test]
async fn test_dangerous_code_and_missing_fields() {
    let mut manifest = manifest();
    manifest["description"] = json!("");
    let report = validator()
        .validate(&package(manifest, "x = eval('1')\ny = document.cookie"))
        .await;
    assert!(!report.valid);
    assert!(report.issue("dynamic_code_evaluation").is_some());
    assert!(report.issue("missing_field").is_some());
    assert!(report.score < 60);
    assert!(!report.recommendations.is_empty());
}

#[tokio::test]
async fn test_wildcard_network_and_weak_justification() {
    let mut manifest = manifest();
    manifest["permissions"] = json!([{ "kind": "network", "scope": "*", "description": "web" }]);
    let report = validator().validate(&package(manifest, CODE)).await;
    assert!(report.valid);
    assert!(report.warning("wildcard_network").is_some());
    assert!(report.warning("weak_justification").is_some());
    assert_eq!(report.score, 100 - 5 - 3 - 5);
}

#[tokio::test]
async fn test_variant_mismatch_is_a_warning() {
    let mut manifest = manifest();
    manifest["isolationVariant"] = json!("dom");
    let report = validator().validate(&package(manifest, CODE)).await;
    assert!(report.valid);
    let warning = report.warning("isolation_variant_mismatch").unwrap();
    assert!(warning.message.contains("compute"));
}

#[tokio::test]
async fn test_incompatible_host_version() {
    let mut manifest = manifest();
    manifest["minHostVersion"] = json!("99.0.0");
    let report = validator().validate(&package(manifest, CODE)).await;
    assert!(report.issue("incompatible_host").is_some());
}

#[tokio::test]
async fn test_checksum_and_signature() {
    let signing_key = SigningKey::from_bytes(&[7u8; 32]);
    let public_key = format!("ed25519:{}", hex::encode(signing_key.verifying_key().to_bytes()));
    let validator = validator();
    validator
        .add_trusted_developer("alice", Some(public_key))
        .await
        .unwrap();

    let mut good = package(manifest(), CODE);
    good.checksum = Some(checksum(HashAlgorithm::Blake3, CODE.as_bytes()));
    let signature = signing_key.sign(CODE.as_bytes());
    good.signature = Some(format!("ed25519:{}", hex::encode(signature.to_bytes())));
    let report = validator.validate(&good).await;
    assert!(report.valid);
    assert_eq!(report.score, 100);

    let mut tampered = good.clone();
    tampered.code.push_str("\nconsole.log('extra')");
    let report = validator.validate(&tampered).await;
    assert!(!report.valid);
    assert!(report.issue("checksum_mismatch").is_some());
    assert!(report.issue("invalid_signature").is_some());
}

#[tokio::test]
async fn test_disallowed_files_and_vulnerable_dependencies() {
    let mut config = SecurityConfig::default();
    config
        .vulnerable_dependencies
        .insert("left-pad".to_string(), "<1.3.0".to_string());
    let validator = validator_with(config);

    let mut pkg = package(manifest(), CODE);
    pkg.files = vec![sdk::types::PackageFile {
        path: "bin/helper.EXE".to_string(),
        size: 100,
    }];
    pkg.dependencies.insert("left-pad".to_string(), "^1.1.0".to_string());

    let report = validator.validate(&pkg).await;
    assert!(!report.valid);
    assert!(report.issue("disallowed_file").is_some());
    assert!(report.warning("vulnerable_dependency").is_some());
}

#[tokio::test]
async fn test_blocked_id_short_circuits() {
    let validator = validator();
    validator.block("weather", "abuse").await.unwrap();
    let report = validator.validate(&package(manifest(), CODE)).await;
    assert!(!report.valid);
    assert_eq!(report.score, 0);
    assert_eq!(report.issues.len(), 1);
    assert!(report.issue("blocked_plugin").is_some());
}
