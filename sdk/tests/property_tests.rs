use proptest::prelude::*;
use sdk::errors::{truncate, EngineError, HostErrorExt};
use sdk::manifest::{ConfigSchema, Manifest, PermissionKind, PluginConfig};
use sdk::types::PluginStatus;
use serde_json::json;

// Hints are static text and never echo plugin-supplied data
proptest! {
    #[test]
    fn test_error_user_hint_completeness(text in "\\PC*") {
        let errs = vec![
            EngineError::Config(text.clone()),
            EngineError::InvalidManifest(text.clone()),
            EngineError::CodeRejected(text.clone()),
            EngineError::Storage(text.clone()),
            EngineError::Isolation(text.clone()),
            EngineError::PluginNotFound(text.clone()),
            EngineError::unsupported_statement(1, &text),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            if text.len() > 8 {
                prop_assert!(!hint.contains(&text));
            }
        }
    }

    #[test]
    fn test_truncate_is_bounded(text in "\\PC{0,400}") {
        let short = truncate(&text);
        prop_assert!(short.chars().count() <= 123);
        if text.chars().count() <= 120 {
            prop_assert_eq!(short, text);
        }
    }
}

// Manifest JSON keeps every field across serialization
proptest! {
    #[test]
    fn test_manifest_roundtrip(
        id in "[a-z][a-z0-9-]{1,20}",
        major in 0u64..10,
        minor in 0u64..10,
        patch in 0u64..10,
        tags in prop::collection::vec("[a-z]{1,8}", 0..4),
        scope in "[a-z.]{1,20}",
    ) {
        let raw = json!({
            "id": id,
            "name": "Generated",
            "version": format!("{}.{}.{}", major, minor, patch),
            "author": "someone",
            "description": "generated plugin",
            "tags": tags,
            "entry": "main.js",
            "permissions": [{"kind": "storage", "scope": scope, "description": "keeps state"}]
        });

        let manifest: Manifest = serde_json::from_value(raw).unwrap();
        let json = manifest.to_json().unwrap();
        let parsed = Manifest::from_json(&json).unwrap();

        prop_assert_eq!(&parsed, &manifest);
        prop_assert!(parsed.requests(PermissionKind::Storage));
    }
}

// Migrated settings always validate against the new schema
proptest! {
    #[test]
    fn test_migrate_yields_valid_config(
        refresh in -100i64..200,
        units in "[a-z]{1,10}",
        stray in "[a-z]{1,6}",
    ) {
        let schema: ConfigSchema = serde_json::from_value(json!({
            "units": { "type": "string", "enum": ["metric", "imperial"], "default": "metric" },
            "refresh": { "type": "integer", "min": 1, "max": 60, "default": 10 }
        }))
        .unwrap();

        let mut old = PluginConfig::new();
        old.insert("refresh".into(), json!(refresh));
        old.insert("units".into(), json!(units));
        old.insert(format!("x_{}", stray), json!(true));

        let migrated = schema.migrate(&old);
        prop_assert!(schema.validate(&migrated).is_ok());
        prop_assert_eq!(migrated.len(), 2);
    }
}

fn any_status() -> impl Strategy<Value = PluginStatus> {
    prop_oneof![
        Just(PluginStatus::Installed),
        Just(PluginStatus::Loading),
        Just(PluginStatus::Enabled),
        Just(PluginStatus::Disabled),
        Just(PluginStatus::Error),
    ]
}

// Enabled is reachable only through loading
proptest! {
    #[test]
    fn test_enabled_only_from_loading(from in any_status()) {
        if from.can_transition_to(PluginStatus::Enabled) {
            prop_assert_eq!(from, PluginStatus::Loading);
        }
        prop_assert!(from.can_transition_to(PluginStatus::Error));
    }
}
