// Enclave plugin host
// Main entry point for the enclave binary

use clap::Parser;
use enclave_engine::cli::{Cli, Command, TrustAction};
use enclave_engine::config::Config;
use enclave_engine::handlers::{self, Host, OutputFormat};
use enclave_engine::isolation::run_worker;
use enclave_engine::manager::{InstallOptions, UpdateOptions};
use enclave_engine::sandbox::{ContextSettings, ExecutionLimits};
use enclave_engine::telemetry::{init_telemetry, init_telemetry_with_level, init_worker_telemetry};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Workers own stdout for frames and never read the host configuration
    if let Command::Worker(args) = cli.command {
        init_worker_telemetry();
        run_worker(ContextSettings {
            plugin_id: args.plugin_id,
            limits: ExecutionLimits {
                max_code_bytes: args.max_code_bytes,
                max_execution_ms: args.max_execution_ms,
                max_statements: args.max_statements,
                max_variable_bytes: args.max_variable_bytes,
            },
            reply_timeout: Duration::from_millis(args.reply_timeout_ms),
        })
        .await?;
        return Ok(());
    }

    init_telemetry();
    tracing::info!("Enclave v{}", enclave_engine::HOST_VERSION);

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // Only takes effect if RUST_LOG is not set
    init_telemetry_with_level(cli.log.as_deref().unwrap_or(&config.core.log_level));

    let host = Host::open(&config).await?;
    let result = run(&host, cli.command, format).await;
    host.close().await?;
    result
}

async fn run(host: &Host, command: Command, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        Command::Validate { package } => handlers::handle_validate(host, &package, format).await,

        Command::Install {
            package,
            force,
            skip_validation,
            enable,
        } => {
            let options = InstallOptions {
                skip_validation,
                force,
                enable_immediately: enable,
            };
            handlers::handle_install(host, &package, options, format).await
        }

        Command::Update {
            package,
            force,
            skip_validation,
        } => {
            let options = UpdateOptions {
                skip_validation,
                force,
            };
            handlers::handle_update(host, &package, options, format).await
        }

        Command::Uninstall { id } => handlers::handle_uninstall(host, &id, format).await,
        Command::Enable { id } => handlers::handle_toggle(host, &id, true, format).await,
        Command::Disable { id } => handlers::handle_toggle(host, &id, false, format).await,

        Command::List {
            status,
            category,
            tag,
        } => {
            handlers::handle_list(
                host,
                status.as_deref(),
                category.as_deref(),
                tag.as_deref(),
                format,
            )
            .await
        }

        Command::Info { id } => handlers::handle_info(host, &id, format).await,
        Command::Search { query } => handlers::handle_search(host, &query, format).await,
        Command::Run { id, input } => handlers::handle_run(host, &id, input.as_deref(), format).await,
        Command::Hook { name, payload } => {
            handlers::handle_hook(host, &name, payload.as_deref(), format).await
        }
        Command::Config { id, set } => handlers::handle_config(host, &id, &set, format).await,
        Command::Backups { id } => handlers::handle_backups(host, &id, format).await,
        Command::Restore { id, timestamp } => {
            handlers::handle_restore(host, &id, timestamp, format).await
        }
        Command::Export { output } => handlers::handle_export(host, output.as_deref()).await,
        Command::Import { input, overwrite } => {
            handlers::handle_import(host, &input, overwrite, format).await
        }
        Command::Violations { id } => handlers::handle_violations(host, id.as_deref(), format).await,
        Command::Block { id, reason } => handlers::handle_block(host, &id, &reason, format).await,
        Command::Unblock { id } => handlers::handle_unblock(host, &id, format).await,

        Command::Trust { action } => match action {
            TrustAction::List => handlers::handle_trust_list(host, format).await,
            TrustAction::Add { name, key } => handlers::handle_trust_add(host, &name, key, format).await,
            TrustAction::Remove { name } => handlers::handle_trust_remove(host, &name, format).await,
        },

        Command::Serve => {
            tracing::info!("Serving plugin host...");
            handlers::handle_serve(host, format).await
        }

        Command::Worker(_) => anyhow::bail!("worker runs before the host is opened"),
    }
}
