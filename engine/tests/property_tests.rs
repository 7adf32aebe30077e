use enclave_engine::api::http::host_matches;
use enclave_engine::clock::ManualClock;
use enclave_engine::config::{Config, SandboxConfig, SecurityConfig};
use enclave_engine::isolation::select_variant;
use enclave_engine::message_bus::MessageBus;
use enclave_engine::registry::{PluginRecord, Registry, RegistrySnapshot};
use enclave_engine::sandbox::parse;
use enclave_engine::security::patterns::{CodePatterns, DYNAMIC_EVALUATION};
use enclave_engine::security::SecurityValidator;
use enclave_engine::storage::MemoryKvStore;
use proptest::prelude::*;
use sdk::errors::EngineError;
use sdk::manifest::{ConfigSchema, IsolationVariant, Manifest, PermissionKind};
use sdk::types::{PluginPackage, PluginStatus, Severity, ValidationReport};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

fn permission_kind() -> impl Strategy<Value = PermissionKind> {
    prop::sample::select(PermissionKind::ALL.to_vec())
}

fn status() -> impl Strategy<Value = PluginStatus> {
    prop::sample::select(vec![
        PluginStatus::Installed,
        PluginStatus::Loading,
        PluginStatus::Enabled,
        PluginStatus::Disabled,
        PluginStatus::Error,
    ])
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn validate(package: &PluginPackage) -> ValidationReport {
    let validator = SecurityValidator::new(
        SecurityConfig::default(),
        &SandboxConfig::default(),
        Arc::new(CodePatterns::new().unwrap()),
        Arc::new(MemoryKvStore::new()),
        Arc::new(MessageBus::new()),
        Arc::new(ManualClock::new(1_000)),
    );
    runtime().block_on(validator.validate(package))
}

fn package_with(manifest: Value, code: &str) -> PluginPackage {
    PluginPackage::from_json(&json!({ "manifest": manifest, "code": code }).to_string()).unwrap()
}

fn clean_manifest() -> Value {
    json!({
        "id": "weather",
        "name": "Weather",
        "version": "1.0.0",
        "author": "alice",
        "description": "Shows the forecast for a city",
        "entry": "index.js",
        "permissions": [
            { "kind": "storage", "scope": "weather", "description": "Caches the last forecast" }
        ]
    })
}

fn registry() -> Registry {
    Registry::new(Arc::new(MemoryKvStore::new()), Arc::new(ManualClock::new(5_000)), 3)
}

proptest! {
    #[test]
    fn test_score_stays_in_range(
        id in "[ -~]{0,20}",
        name in "[ -~]{0,20}",
        version in "[0-9a-z.]{0,8}",
        author in "[a-z]{0,8}",
        kinds in prop::collection::vec((permission_kind(), "[ -~]{0,16}", any::<bool>()), 0..8),
        code in "[ -~\n]{0,300}",
    ) {
        let permissions: Vec<Value> = kinds
            .iter()
            .map(|(kind, description, required)| json!({
                "kind": kind,
                "scope": "*",
                "description": description,
                "required": required,
            }))
            .collect();
        let manifest = json!({
            "id": id,
            "name": name,
            "version": version,
            "author": author,
            "permissions": permissions,
        });
        let report = validate(&package_with(manifest, &code));
        prop_assert!(report.score <= 100);
        if report.has_critical() {
            prop_assert!(!report.valid);
        }
    }

    // Dynamic evaluation anywhere in otherwise clean code rejects the package
    #[test]
    fn test_eval_anywhere_is_rejected(
        lines in prop::collection::vec("[a-z]{1,6} = [0-9]{1,4}", 0..12),
        at in any::<prop::sample::Index>(),
        spacing in " {0,3}",
    ) {
        let mut lines = lines;
        let position = at.index(lines.len() + 1);
        lines.insert(position, format!("x = eval{}(\"1 + 1\")", spacing));
        let code = lines.join("\n");

        let report = validate(&package_with(clean_manifest(), &code));
        prop_assert!(!report.valid);
        let finding = report
            .issues
            .iter()
            .find(|i| i.code == DYNAMIC_EVALUATION);
        prop_assert!(finding.is_some(), "no evaluation finding in {:?}", code);
        prop_assert_eq!(finding.map(|f| f.severity), Some(Severity::Critical));
        let expected_suffix = format!("line {}", position + 1);
        prop_assert!(finding.is_some_and(|f| f.message.ends_with(&expected_suffix)));
    }

    // An exported registry imports into an empty one unchanged, except that
    // running plugins come back disabled
    #[test]
    fn test_export_import_preserves_records(
        plugins in prop::collection::btree_map(
            "[a-z][a-z0-9-]{0,10}[a-z0-9]",
            (status(), any::<i32>(), "[ -~]{0,24}"),
            0..8,
        ),
    ) {
        let rt = runtime();
        let source = registry();
        for (id, (status, level, code)) in &plugins {
            let manifest = Manifest::from_json(&json!({ "id": id, "name": id }).to_string()).unwrap();
            rt.block_on(source.insert(PluginRecord::new(manifest, code.clone(), *status, 1_000))).unwrap();
            let mut config = serde_json::Map::new();
            config.insert("level".into(), json!(level));
            rt.block_on(source.set_config(id, config)).unwrap();
        }

        let json = rt.block_on(source.export_json()).unwrap();
        let snapshot = RegistrySnapshot::from_json(&json).unwrap();
        let target = registry();
        let summary = rt.block_on(target.import(snapshot, false)).unwrap();
        prop_assert_eq!(summary.imported.len(), plugins.len());
        prop_assert!(summary.skipped.is_empty());

        let expected: Vec<PluginRecord> = rt
            .block_on(source.list())
            .into_iter()
            .map(|mut record| {
                if record.status.has_handle() {
                    record.status = PluginStatus::Disabled;
                }
                record
            })
            .collect();
        prop_assert_eq!(rt.block_on(target.list()), expected);
        let ids: BTreeSet<String> = plugins.keys().cloned().collect();
        prop_assert_eq!(summary.imported.into_iter().collect::<BTreeSet<_>>(), ids);
    }

    // Adding permissions never weakens the variant
    #[test]
    fn test_variant_is_monotonic(
        base in prop::collection::vec(permission_kind(), 0..6),
        extra in prop::collection::vec(permission_kind(), 0..6),
    ) {
        let mut wider = base.clone();
        wider.extend(extra);
        prop_assert!(select_variant(&base) <= select_variant(&wider));
    }

    #[test]
    fn test_dom_only_with_ui(kinds in prop::collection::vec(permission_kind(), 0..6)) {
        let variant = select_variant(&kinds);
        prop_assert_eq!(variant == IsolationVariant::Dom, kinds.contains(&PermissionKind::Ui));
    }

    #[test]
    fn test_nothing_returns_to_installed(from in status()) {
        prop_assert!(!from.can_transition_to(PluginStatus::Installed));
        prop_assert!(from.can_transition_to(PluginStatus::Error));
        prop_assert_eq!(
            from.can_transition_to(PluginStatus::Enabled),
            from == PluginStatus::Loading
        );
    }

    #[test]
    fn test_exact_host_scope(label in "[a-z][a-z0-9]{0,12}", tld in "(com|org|net)") {
        let host = format!("{}.{}", label, tld);
        prop_assert!(host_matches(&host, &host));
        let wildcard = format!("*.{}", host);
        let subdomain = format!("api.{}", host);
        let suffixed = format!("{}.evil.io", host);
        prop_assert!(host_matches(&wildcard, &subdomain));
        prop_assert!(!host_matches(&wildcard, &host));
        prop_assert!(!host_matches(&host, &suffixed));
    }

    #[test]
    fn test_assignments_parse(
        names in prop::collection::vec("[a-z][a-z_]{0,8}", 1..20),
        value in 0u32..100_000,
    ) {
        let names: Vec<String> = names
            .into_iter()
            .filter(|n| !["api", "config", "console", "let", "const", "var", "await", "true", "false", "null", "undefined"].contains(&n.as_str()))
            .collect();
        let code: String = names
            .iter()
            .map(|n| format!("let {} = {}\n", n, value))
            .collect();
        let program = parse(&code).unwrap();
        prop_assert_eq!(program.len(), names.len());
    }

    // One unsupported line rejects the whole unit and names that line
    #[test]
    fn test_unsupported_line_is_reported(prefix in 0usize..10, keyword in "(for|while|if|function|class)") {
        let mut code: String = (0..prefix).map(|i| format!("x{} = {}\n", i, i)).collect();
        code.push_str(&format!("{} (x) {{}}\n", keyword));
        match parse(&code) {
            Err(EngineError::UnsupportedStatement { line, .. }) => prop_assert_eq!(line, prefix + 1),
            other => prop_assert!(false, "expected rejection, got {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn test_integer_bounds(days in -50i64..50) {
        let schema: ConfigSchema = serde_json::from_value(json!({
            "days": { "type": "integer", "min": 1, "max": 14, "default": 3 }
        })).unwrap();
        let mut config = serde_json::Map::new();
        config.insert("days".into(), json!(days));
        prop_assert_eq!(schema.validate(&config).is_ok(), (1..=14).contains(&days));
    }

    #[test]
    fn test_config_log_level_round_trip(level in "error|warn|info|debug|trace") {
        let toml = format!("[core]\nlog_level = \"{}\"\n", level);
        let config: Config = toml::from_str(&toml).unwrap();
        let back: Config = toml::from_str(&toml::to_string(&config).unwrap()).unwrap();
        prop_assert_eq!(back.core.log_level, level);
    }
}
