//! CLI interface for Enclave
//!
//! This module provides the command-line interface using clap's derive API.
//! Every command opens the host database, runs one manager operation and
//! exits; `serve` keeps the host running until interrupted.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Enclave plugin host
///
/// Installs, validates and runs untrusted plugins in isolated contexts that
/// can only reach the capabilities they were granted.
#[derive(Parser, Debug)]
#[command(name = "enclave")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the security validator on a package without installing it
    Validate {
        /// Package file (JSON)
        package: PathBuf,
    },

    /// Install a plugin package
    Install {
        /// Package file (JSON)
        package: PathBuf,

        /// Replace an installed plugin with the same id
        #[arg(long)]
        force: bool,

        /// Skip the security validator (blocked plugins are still refused)
        #[arg(long)]
        skip_validation: bool,

        /// Enable the plugin after installing it
        #[arg(long)]
        enable: bool,
    },

    /// Update an installed plugin from a newer package
    Update {
        /// Package file (JSON)
        package: PathBuf,

        /// Accept a version that is not newer than the installed one
        #[arg(long)]
        force: bool,

        /// Skip the security validator
        #[arg(long)]
        skip_validation: bool,
    },

    /// Remove a plugin and its stored data
    Uninstall {
        /// Plugin id
        id: String,
    },

    /// Enable a plugin
    Enable {
        /// Plugin id
        id: String,
    },

    /// Disable a plugin
    Disable {
        /// Plugin id
        id: String,
    },

    /// List installed plugins
    List {
        /// Only plugins with this status
        #[arg(long)]
        status: Option<String>,

        /// Only plugins in this category
        #[arg(long)]
        category: Option<String>,

        /// Only plugins carrying this tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Show one plugin
    Info {
        /// Plugin id
        id: String,
    },

    /// Search installed plugins by name, tags, category and description
    Search {
        /// Search text
        query: String,
    },

    /// Run a plugin's code with an input value
    Run {
        /// Plugin id
        id: String,

        /// Input bound as `input` (JSON, or a plain string)
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Run every plugin registered for a hook
    Hook {
        /// Hook name
        name: String,

        /// Payload bound as `payload` (JSON, or a plain string)
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Show or change plugin settings
    Config {
        /// Plugin id
        id: String,

        /// Setting to change, as key=value (value parsed as JSON when possible)
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// List config backups of a plugin
    Backups {
        /// Plugin id
        id: String,
    },

    /// Restore plugin settings from a backup
    Restore {
        /// Plugin id
        id: String,

        /// Backup timestamp (Unix milliseconds, see `backups`)
        timestamp: i64,
    },

    /// Export the registry as JSON
    Export {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Import a registry export
    Import {
        /// Export file
        input: PathBuf,

        /// Replace plugins that are already installed
        #[arg(long)]
        overwrite: bool,
    },

    /// Show recorded security violations
    Violations {
        /// Only violations of this plugin
        id: Option<String>,
    },

    /// Block a plugin id
    Block {
        /// Plugin id
        id: String,

        /// Reason recorded with the block
        #[arg(short, long, default_value = "blocked by operator")]
        reason: String,
    },

    /// Unblock a plugin id
    Unblock {
        /// Plugin id
        id: String,
    },

    /// Manage trusted developers
    Trust {
        #[command(subcommand)]
        action: TrustAction,
    },

    /// Keep the host running and print bus events until interrupted
    Serve,

    /// Serve one process isolation context over stdin/stdout
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Trusted developer actions
#[derive(Subcommand, Debug)]
pub enum TrustAction {
    /// List trusted developers
    List,

    /// Trust a developer
    Add {
        /// Developer name, as in manifests
        name: String,

        /// Ed25519 public key (`ed25519:<hex>` or hex)
        #[arg(long)]
        key: Option<String>,
    },

    /// Stop trusting a developer
    Remove {
        /// Developer name
        name: String,
    },
}

/// Settings the host passes to a worker process
#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub plugin_id: String,

    #[arg(long)]
    pub max_code_bytes: usize,

    #[arg(long)]
    pub max_execution_ms: u64,

    #[arg(long)]
    pub max_statements: usize,

    #[arg(long)]
    pub max_variable_bytes: usize,

    #[arg(long)]
    pub reply_timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_flags() {
        let cli = Cli::try_parse_from(["enclave", "install", "pkg.json", "--force", "--enable"]).unwrap();
        match cli.command {
            Command::Install {
                package,
                force,
                skip_validation,
                enable,
            } => {
                assert_eq!(package, PathBuf::from("pkg.json"));
                assert!(force);
                assert!(!skip_validation);
                assert!(enable);
            }
            _ => panic!("Expected Install command"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::try_parse_from(["enclave", "list", "--json", "--status", "enabled"]).unwrap();
        assert!(cli.json);
        assert!(matches!(cli.command, Command::List { status: Some(s), .. } if s == "enabled"));
    }

    #[test]
    fn test_config_set_is_repeatable() {
        let cli = Cli::try_parse_from([
            "enclave", "config", "weather", "--set", "units=\"metric\"", "--set", "days=3",
        ])
        .unwrap();
        match cli.command {
            Command::Config { id, set } => {
                assert_eq!(id, "weather");
                assert_eq!(set, vec!["units=\"metric\"", "days=3"]);
            }
            _ => panic!("Expected Config command"),
        }
    }

    #[test]
    fn test_worker_args() {
        let cli = Cli::try_parse_from([
            "enclave",
            "worker",
            "--plugin-id",
            "p",
            "--max-code-bytes",
            "100",
            "--max-execution-ms",
            "50",
            "--max-statements",
            "10",
            "--max-variable-bytes",
            "1000",
            "--reply-timeout-ms",
            "500",
        ])
        .unwrap();
        match cli.command {
            Command::Worker(args) => {
                assert_eq!(args.plugin_id, "p");
                assert_eq!(args.max_statements, 10);
                assert_eq!(args.reply_timeout_ms, 500);
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_trust_add() {
        let cli = Cli::try_parse_from(["enclave", "trust", "add", "alice", "--key", "abcd"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Trust {
                action: TrustAction::Add { key: Some(_), .. }
            }
        ));
    }
}
