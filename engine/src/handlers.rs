//! Command handlers for CLI operations
//!
//! Each handler runs against a [`Host`]: the host database, an isolation
//! router built from the configuration and an initialized
//! [`PluginManager`]. Results are printed as text or, with `--json`, as one
//! JSON document on stdout.

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::clock::{format_millis, SystemClock};
use crate::config::Config;
use crate::db::Database;
use crate::isolation::IsolationRouter;
use crate::manager::{InstallOptions, PluginInstance, PluginManager, RunOutcome, UpdateOptions};
use crate::message_bus::{EventType, MessageBus};
use crate::security::patterns::CodePatterns;
use crate::storage::{KvStore, SqliteKvStore};
use sdk::errors::HostErrorExt;
use sdk::manifest::PluginConfig;
use sdk::types::{PluginPackage, PluginStatus, ValidationReport};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// A running host for the duration of one command
pub struct Host {
    manager: Arc<PluginManager>,
    database: Database,
}

impl Host {
    /// Open the database and start the plugin manager
    pub async fn open(config: &Config) -> Result<Self> {
        let database = Database::new(&config.database_path())
            .await
            .context("Failed to open database")?;
        let store: Arc<dyn KvStore> = Arc::new(SqliteKvStore::new(&database));

        let isolation = IsolationRouter::from_config(config, Arc::new(CodePatterns::new()?))?;
        let manager = Arc::new(PluginManager::new(
            config.clone(),
            store,
            Arc::new(isolation),
            Arc::new(MessageBus::new()),
            Arc::new(SystemClock),
        )?);
        manager
            .initialize()
            .await
            .context("Failed to initialize plugin manager")?;

        Ok(Self { manager, database })
    }

    pub fn manager(&self) -> &Arc<PluginManager> {
        &self.manager
    }

    /// Stop every context, keeping plugin statuses, and close the database
    pub async fn close(self) -> Result<()> {
        self.manager.suspend().await;
        drop(self.manager);
        self.database.close().await
    }
}

fn load_package(path: &Path) -> Result<PluginPackage> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read package {}", path.display()))?;
    PluginPackage::from_json(&contents)
        .with_context(|| format!("Invalid package {}", path.display()))
}

/// JSON when the text parses as JSON, a plain string otherwise
pub fn parse_value(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_report(report: &ValidationReport) {
    println!(
        "{}: {} (score {}/100)",
        report.plugin_id,
        if report.valid { "valid" } else { "rejected" },
        report.score
    );
    for issue in &report.issues {
        println!("  issue   [{}] {}: {}", issue.severity, issue.code, issue.message);
    }
    for warning in &report.warnings {
        println!("  warning [{}] {}: {}", warning.severity, warning.code, warning.message);
    }
    for recommendation in &report.recommendations {
        println!("  hint    {}", recommendation);
    }
}

fn print_instance_line(instance: &PluginInstance) {
    let record = &instance.record;
    println!(
        "  {:<24} {:<10} {:<9} {}",
        record.id, record.manifest.version, record.status, record.manifest.name
    );
}

fn print_outcomes(outcomes: &[RunOutcome], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for outcome in outcomes {
                match &outcome.result {
                    Ok(value) => println!("  {}: {}", outcome.plugin_id, value),
                    Err(e) => println!("  {}: error: {}", outcome.plugin_id, e),
                }
            }
        }
        OutputFormat::Json => {
            let results: Vec<Value> = outcomes
                .iter()
                .map(|o| match &o.result {
                    Ok(value) => json!({ "pluginId": o.plugin_id, "result": value }),
                    Err(e) => json!({
                        "pluginId": o.plugin_id,
                        "error": e.to_string(),
                        "kind": e.kind(),
                    }),
                })
                .collect();
            print_json(&results)?;
        }
    }
    Ok(())
}

pub async fn handle_validate(host: &Host, package: &Path, format: OutputFormat) -> Result<()> {
    let package = load_package(package)?;
    let report = host.manager.validate(&package).await;
    match format {
        OutputFormat::Text => print_report(&report),
        OutputFormat::Json => print_json(&report)?,
    }
    Ok(())
}

pub async fn handle_install(
    host: &Host,
    package: &Path,
    options: InstallOptions,
    format: OutputFormat,
) -> Result<()> {
    let package = load_package(package)?;
    let record = match host.manager.install(package, options).await {
        Ok(record) => record,
        Err(e) => bail!("{} ({})", e, e.user_hint()),
    };
    match format {
        OutputFormat::Text => println!(
            "Installed {} v{} ({})",
            record.id, record.manifest.version, record.status
        ),
        OutputFormat::Json => print_json(&record)?,
    }
    Ok(())
}

pub async fn handle_update(
    host: &Host,
    package: &Path,
    options: UpdateOptions,
    format: OutputFormat,
) -> Result<()> {
    let package = load_package(package)?;
    let id = package.manifest.id.clone();
    let record = host.manager.update(&id, package, options).await?;
    match format {
        OutputFormat::Text => println!("Updated {} to v{}", record.id, record.manifest.version),
        OutputFormat::Json => print_json(&record)?,
    }
    Ok(())
}

pub async fn handle_uninstall(host: &Host, id: &str, format: OutputFormat) -> Result<()> {
    host.manager.uninstall(id).await?;
    match format {
        OutputFormat::Text => println!("Uninstalled {}", id),
        OutputFormat::Json => print_json(&json!({ "uninstalled": id }))?,
    }
    Ok(())
}

/// Enable or disable a plugin and report its new status
pub async fn handle_toggle(host: &Host, id: &str, enable: bool, format: OutputFormat) -> Result<()> {
    if enable {
        host.manager.enable(id).await?;
    } else {
        host.manager.disable(id).await?;
    }
    let status = host
        .manager
        .status(id)
        .await
        .context("Plugin disappeared")?;
    match format {
        OutputFormat::Text => println!("{} is {}", id, status),
        OutputFormat::Json => print_json(&json!({ "id": id, "status": status }))?,
    }
    Ok(())
}

pub async fn handle_list(
    host: &Host,
    status: Option<&str>,
    category: Option<&str>,
    tag: Option<&str>,
    format: OutputFormat,
) -> Result<()> {
    let status: Option<PluginStatus> = status
        .map(|s| serde_json::from_value(Value::String(s.to_lowercase())))
        .transpose()
        .context("Unknown status (installed, loading, enabled, disabled, error)")?;

    let mut instances = match status {
        Some(status) => host.manager.list_by_status(status).await,
        None => host.manager.list().await,
    };
    if let Some(category) = category {
        let ids: Vec<String> = host
            .manager
            .registry()
            .by_category(category)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        instances.retain(|i| ids.contains(&i.record.id));
    }
    if let Some(tag) = tag {
        let ids: Vec<String> = host
            .manager
            .registry()
            .by_tag(tag)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        instances.retain(|i| ids.contains(&i.record.id));
    }

    match format {
        OutputFormat::Text => {
            if instances.is_empty() {
                println!("No plugins installed.");
            } else {
                println!("Installed Plugins:");
                println!();
                for instance in &instances {
                    print_instance_line(instance);
                }
            }
        }
        OutputFormat::Json => print_json(&json!({ "plugins": instances }))?,
    }
    Ok(())
}

pub async fn handle_info(host: &Host, id: &str, format: OutputFormat) -> Result<()> {
    let instance = host
        .manager
        .get(id)
        .await
        .with_context(|| format!("Plugin not found: {}", id))?;
    let blocked = host.manager.validator().is_blocked(id).await;

    match format {
        OutputFormat::Text => {
            let record = &instance.record;
            let manifest = &record.manifest;
            println!("{} v{}", manifest.name, manifest.version);
            println!("  id:          {}", record.id);
            println!("  author:      {}", manifest.author);
            println!("  category:    {}", manifest.category);
            println!("  tags:        {}", manifest.tags.join(", "));
            println!("  status:      {}{}", record.status, if blocked { " (blocked)" } else { "" });
            println!("  installed:   {}", format_millis(record.installed_at));
            if let Some(last) = record.last_active {
                println!("  last active: {}", format_millis(last));
            }
            println!("  permissions:");
            for permission in &manifest.permissions {
                println!(
                    "    {:<10} {:<24} {}",
                    permission.kind,
                    permission.scope,
                    if permission.required { "required" } else { "optional" }
                );
            }
            if !manifest.hook_names().is_empty() {
                println!("  hooks:       {}", manifest.hook_names().join(", "));
            }
            if let Some(info) = &instance.isolation {
                println!(
                    "  context:     {} {} ({}, {:?} backend)",
                    info.variant.as_str(),
                    info.context_id,
                    info.strength,
                    info.backend
                );
            }
        }
        OutputFormat::Json => print_json(&json!({ "plugin": instance, "blocked": blocked }))?,
    }
    Ok(())
}

pub async fn handle_search(host: &Host, query: &str, format: OutputFormat) -> Result<()> {
    let hits = host.manager.registry().search(query).await;
    match format {
        OutputFormat::Text => {
            if hits.is_empty() {
                println!("No plugins match '{}'.", query);
            }
            for hit in &hits {
                println!("  {:<24} score {}", hit.plugin_id, hit.score);
            }
        }
        OutputFormat::Json => {
            let hits: Vec<Value> = hits
                .iter()
                .map(|h| json!({ "pluginId": h.plugin_id, "score": h.score }))
                .collect();
            print_json(&hits)?;
        }
    }
    Ok(())
}

/// Enable the plugin if needed and run it once with `input`
pub async fn handle_run(host: &Host, id: &str, input: Option<&str>, format: OutputFormat) -> Result<()> {
    host.manager.enable(id).await?;
    let input = input.map(parse_value).unwrap_or(Value::Null);
    let result = host.manager.invoke(id, input).await?;
    match format {
        OutputFormat::Text => println!("{}", result),
        OutputFormat::Json => print_json(&json!({ "id": id, "result": result }))?,
    }
    Ok(())
}

/// Enable every installed plugin listening on `hook` and trigger it
pub async fn handle_hook(host: &Host, hook: &str, payload: Option<&str>, format: OutputFormat) -> Result<()> {
    for instance in host.manager.list().await {
        let record = &instance.record;
        let listens = record.manifest.hook_names().iter().any(|h| h == hook);
        if listens && record.status == PluginStatus::Disabled {
            host.manager.enable(&record.id).await?;
        }
    }
    let payload = payload.map(parse_value).unwrap_or(Value::Null);
    let outcomes = host.manager.trigger_hook(hook, payload).await;
    if outcomes.is_empty() && matches!(format, OutputFormat::Text) {
        println!("No enabled plugin listens on '{}'.", hook);
        return Ok(());
    }
    print_outcomes(&outcomes, format)
}

pub async fn handle_config(host: &Host, id: &str, set: &[String], format: OutputFormat) -> Result<()> {
    let record = host
        .manager
        .registry()
        .get(id)
        .await
        .with_context(|| format!("Plugin not found: {}", id))?;

    let config = if set.is_empty() {
        record.config
    } else {
        let mut config: PluginConfig = record.config;
        for assignment in set {
            let (key, value) = assignment
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got '{}'", assignment))?;
            config.insert(key.trim().to_string(), parse_value(value.trim()));
        }
        host.manager.update_config(id, config).await?.config
    };

    match format {
        OutputFormat::Text => {
            if config.is_empty() {
                println!("{} has no settings.", id);
            }
            for (key, value) in &config {
                println!("  {} = {}", key, value);
            }
        }
        OutputFormat::Json => print_json(&config)?,
    }
    Ok(())
}

pub async fn handle_backups(host: &Host, id: &str, format: OutputFormat) -> Result<()> {
    let backups = host.manager.registry().list_backups(id).await?;
    match format {
        OutputFormat::Text => {
            if backups.is_empty() {
                println!("No backups of {}.", id);
            }
            for backup in &backups {
                println!(
                    "  {}  {}  v{}  {} setting(s)",
                    backup.timestamp,
                    format_millis(backup.timestamp),
                    backup.version,
                    backup.config.len()
                );
            }
        }
        OutputFormat::Json => print_json(&backups)?,
    }
    Ok(())
}

pub async fn handle_restore(host: &Host, id: &str, timestamp: i64, format: OutputFormat) -> Result<()> {
    let record = host.manager.restore_config(id, timestamp).await?;
    match format {
        OutputFormat::Text => println!("Restored settings of {} from {}", id, format_millis(timestamp)),
        OutputFormat::Json => print_json(&record.config)?,
    }
    Ok(())
}

pub async fn handle_export(host: &Host, output: Option<&Path>) -> Result<()> {
    let json = host.manager.registry().export_json().await?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!("Registry exported to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

pub async fn handle_import(host: &Host, input: &Path, overwrite: bool, format: OutputFormat) -> Result<()> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let summary = host.manager.import_json(&json, overwrite).await?;
    match format {
        OutputFormat::Text => {
            println!("Imported {} plugin(s)", summary.imported.len());
            if !summary.skipped.is_empty() {
                println!("Skipped: {}", summary.skipped.join(", "));
            }
        }
        OutputFormat::Json => print_json(&json!({
            "imported": summary.imported,
            "skipped": summary.skipped,
        }))?,
    }
    Ok(())
}

pub async fn handle_violations(host: &Host, id: Option<&str>, format: OutputFormat) -> Result<()> {
    let violations = host.manager.validator().violations(id).await;
    match format {
        OutputFormat::Text => {
            if violations.is_empty() {
                println!("No violations recorded.");
            }
            for v in &violations {
                println!(
                    "  {}  {:<20} [{}] {}: {}{}",
                    format_millis(v.timestamp),
                    v.plugin_id,
                    v.severity,
                    v.kind,
                    v.description,
                    if v.blocked { " (blocked)" } else { "" }
                );
            }
        }
        OutputFormat::Json => print_json(&violations)?,
    }
    Ok(())
}

pub async fn handle_block(host: &Host, id: &str, reason: &str, format: OutputFormat) -> Result<()> {
    host.manager.validator().block(id, reason).await?;
    host.manager.disable(id).await.ok();
    match format {
        OutputFormat::Text => println!("Blocked {}", id),
        OutputFormat::Json => print_json(&json!({ "blocked": id }))?,
    }
    Ok(())
}

pub async fn handle_unblock(host: &Host, id: &str, format: OutputFormat) -> Result<()> {
    let was_blocked = host.manager.validator().unblock(id).await?;
    match format {
        OutputFormat::Text if was_blocked => println!("Unblocked {}", id),
        OutputFormat::Text => println!("{} was not blocked", id),
        OutputFormat::Json => print_json(&json!({ "id": id, "unblocked": was_blocked }))?,
    }
    Ok(())
}

pub async fn handle_trust_list(host: &Host, format: OutputFormat) -> Result<()> {
    let developers = host.manager.validator().trusted_developers().await;
    match format {
        OutputFormat::Text => {
            if developers.is_empty() {
                println!("No trusted developers.");
            }
            for developer in &developers {
                println!(
                    "  {:<24} {}",
                    developer.name,
                    developer.public_key.as_deref().unwrap_or("(no key)")
                );
            }
        }
        OutputFormat::Json => print_json(&developers)?,
    }
    Ok(())
}

pub async fn handle_trust_add(host: &Host, name: &str, key: Option<String>, format: OutputFormat) -> Result<()> {
    let developer = host.manager.validator().add_trusted_developer(name, key).await?;
    match format {
        OutputFormat::Text => println!("Trusted {}", developer.name),
        OutputFormat::Json => print_json(&developer)?,
    }
    Ok(())
}

pub async fn handle_trust_remove(host: &Host, name: &str, format: OutputFormat) -> Result<()> {
    let removed = host.manager.validator().remove_trusted_developer(name).await?;
    match format {
        OutputFormat::Text if removed => println!("{} is no longer trusted", name),
        OutputFormat::Text => println!("{} was not trusted", name),
        OutputFormat::Json => print_json(&json!({ "name": name, "removed": removed }))?,
    }
    Ok(())
}

/// Print bus events until Ctrl-C
pub async fn handle_serve(host: &Host, format: OutputFormat) -> Result<()> {
    let mut events = host.manager.bus().subscribe(EventType::All).await;
    let enabled = host.manager.enabled_plugins().await;
    eprintln!(
        "Enclave host running with {} enabled plugin(s). Press Ctrl-C to stop.",
        enabled.len()
    );

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                match format {
                    OutputFormat::Text => println!("{:?}", event),
                    OutputFormat::Json => println!(
                        "{}",
                        json!({
                            "type": format!("{:?}", event.event_type()),
                            "pluginId": event.plugin_id(),
                            "event": format!("{:?}", event),
                        })
                    ),
                }
            }
        }
    }
    eprintln!("Stopping...");
    Ok(())
}
