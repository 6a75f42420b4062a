//! Hookwire CLI: run the records and evaluator services, administer the
//! record store, and issue ad-hoc calls.

mod cli;
mod cmd;
mod config;
mod ui;

use crate::cli::*;
use clap::Parser;
use std::process::ExitCode;

/// Trace to stderr so `hookwire call` output on stdout stays clean JSON.
fn init_tracing_stderr(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let loaded = config::read_config(&cli.config);
    init_tracing_stderr(loaded.log_level());
    let config = config::resolve_config(loaded, &cli.config);

    let result = match cli.command {
        Commands::Records(sub) => match sub {
            RecordsCommands::Serve => cmd::records::cmd_records_serve(&config.records),
            RecordsCommands::AddUser { username, password } => {
                cmd::records::cmd_records_add_user(&config.records, &username, &password)
            }
            RecordsCommands::RemoveUser { username } => {
                cmd::records::cmd_records_remove_user(&config.records, &username)
            }
            RecordsCommands::Reset { confirm } => cmd::records::cmd_records_reset(&config.records, confirm),
            RecordsCommands::ListUsers { json } => cmd::records::cmd_records_list_users(&config.records, json),
        },
        Commands::Evaluator(sub) => match sub {
            EvaluatorCommands::Serve => cmd::evaluator::cmd_evaluator_serve(&config.evaluator),
        },
        Commands::Call(args) => cmd::call::cmd_call(&config.client, args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            ui::error(&format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}
