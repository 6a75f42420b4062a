//! `hookwire evaluator serve`.

use super::{exit_code_for, runtime};
use hookwire_evaluator::EvaluatorService;
use hookwire_types::config::EvaluatorConfig;
use hookwire_wire::{RpcServer, ShutdownTrigger};
use std::process::ExitCode;
use tracing::{error, info};

pub fn cmd_evaluator_serve(config: &EvaluatorConfig) -> anyhow::Result<ExitCode> {
    if config.service_token.is_none() {
        info!("No service token configured; records calls are sent without one");
    }

    // Fired by the records client once its retries run out.
    let trigger = ShutdownTrigger::new();
    let service = EvaluatorService::new(config, trigger.clone());
    let server = RpcServer::new(config.server.clone(), service.registry())?.with_shutdown(trigger);

    info!(records = %config.records.addr, "Evaluator starting");
    let reason = runtime()?.block_on(server.serve_until_interrupt())?;

    if reason.is_fatal() {
        error!(%reason, "Evaluator stopped");
    } else {
        info!(%reason, sessions = service.sessions().len(), "Evaluator stopped");
    }
    Ok(exit_code_for(&reason))
}
