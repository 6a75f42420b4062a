//! Clap CLI definitions for Hookwire.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  hookwire records add-user alice --password wonderland
  hookwire records serve               Run the records service
  hookwire evaluator serve             Run the evaluator service
  hookwire call log_in '\"alice\"' '\"wonderland\"' --confidential
  hookwire call get_results --named token='\"...\"'";

/// Hookwire: private RPC services over TCP.
#[derive(Parser)]
#[command(name = "hookwire", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true, default_value = "hookwire.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Records service: serve it or administer its store [*].
    #[command(subcommand)]
    Records(RecordsCommands),
    /// Evaluator service [*].
    #[command(subcommand)]
    Evaluator(EvaluatorCommands),
    /// Issue one remote call and print the JSON result.
    Call(CallArgs),
}

#[derive(Subcommand)]
pub enum RecordsCommands {
    /// Run the records service until interrupted.
    Serve,
    /// Add a user to the store file.
    AddUser {
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Remove a user from the store file.
    RemoveUser { username: String },
    /// Delete every user and result from the store file.
    Reset {
        /// Skip confirmation prompt.
        #[arg(long)]
        confirm: bool,
    },
    /// List users with their unit count and average mark.
    ListUsers {
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum EvaluatorCommands {
    /// Run the evaluator service until interrupted or the records service is lost.
    Serve,
}

#[derive(clap::Args)]
pub struct CallArgs {
    /// Remote procedure name.
    pub procedure: String,
    /// Positional arguments, each a JSON value.
    pub args: Vec<String>,
    /// Named argument as `key=<json>`. Repeatable.
    #[arg(long = "named", value_name = "KEY=JSON")]
    pub named: Vec<String>,
    /// Server address; defaults to `[client] addr` from the config.
    #[arg(long)]
    pub addr: Option<String>,
    /// Do not negotiate encryption.
    #[arg(long, conflicts_with = "confidential")]
    pub plain: bool,
    /// Refuse to send the call unencrypted.
    #[arg(long)]
    pub confidential: bool,
}
