//! `hookwire records ...`: serve the records service and administer its store file.

use super::{exit_code_for, runtime};
use crate::ui;
use anyhow::Context;
use hookwire_records::{RecordStore, RecordsService};
use hookwire_types::config::RecordsConfig;
use hookwire_wire::RpcServer;
use std::process::ExitCode;
use tracing::{error, info};

fn open_store(config: &RecordsConfig) -> anyhow::Result<RecordStore> {
    RecordStore::open(config.store_path.clone())
        .with_context(|| format!("opening record store {}", config.store_path.display()))
}

pub fn cmd_records_serve(config: &RecordsConfig) -> anyhow::Result<ExitCode> {
    let store = open_store(config)?;
    let service = RecordsService::new(store, config.service_tokens.clone());
    info!(
        users = service.user_count(),
        path = %config.store_path.display(),
        token_gate = !config.service_tokens.is_empty(),
        "Records store loaded"
    );

    let server = RpcServer::new(config.server.clone(), service.registry())?;
    let reason = runtime()?.block_on(server.serve_until_interrupt())?;

    if let Err(e) = service.save() {
        error!(error = %e, "Final save of the record store failed");
    }
    info!(%reason, "Records service stopped");
    Ok(exit_code_for(&reason))
}

pub fn cmd_records_add_user(config: &RecordsConfig, username: &str, password: &str) -> anyhow::Result<ExitCode> {
    let mut store = open_store(config)?;
    store
        .add_user(username, password)
        .with_context(|| format!("adding user '{username}'"))?;
    store.save()?;
    ui::success(&format!("Added user '{username}'"));
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_records_remove_user(config: &RecordsConfig, username: &str) -> anyhow::Result<ExitCode> {
    let mut store = open_store(config)?;
    store
        .remove_user(username)
        .with_context(|| format!("removing user '{username}'"))?;
    store.save()?;
    ui::success(&format!("Removed user '{username}'"));
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_records_reset(config: &RecordsConfig, confirm: bool) -> anyhow::Result<ExitCode> {
    let mut store = open_store(config)?;
    if store.is_empty() {
        println!("Nothing to reset: {} holds no users.", config.store_path.display());
        return Ok(ExitCode::SUCCESS);
    }

    if !confirm {
        println!(
            "  This will delete {} user(s) and all their results from {}",
            store.len(),
            config.store_path.display()
        );
        let answer = ui::prompt_input("  Are you sure? Type 'yes' to confirm: ");
        if answer != "yes" {
            println!("  Cancelled.");
            return Ok(ExitCode::FAILURE);
        }
    }

    let removed = store.clear();
    store.save()?;
    info!(removed, path = %config.store_path.display(), "Record store reset");
    ui::success(&format!("Removed {removed} user(s)"));
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_records_list_users(config: &RecordsConfig, json: bool) -> anyhow::Result<ExitCode> {
    let store = open_store(config)?;
    let summaries = store.summaries();

    if json {
        let rows: Vec<serde_json::Value> = summaries
            .iter()
            .map(|s| {
                serde_json::json!({
                    "username": s.username,
                    "units": s.units,
                    "average": s.average,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(ExitCode::SUCCESS);
    }

    ui::section(&format!("Users in {}", config.store_path.display()));
    if summaries.is_empty() {
        ui::hint("no users yet; add one with `hookwire records add-user <name> --password <pw>`");
    }
    for s in &summaries {
        let average = s
            .average
            .map(|a| format!("{a:.2}"))
            .unwrap_or_else(|| "-".to_string());
        ui::kv(&s.username, &format!("{} units, average {average}", s.units));
    }
    Ok(ExitCode::SUCCESS)
}
