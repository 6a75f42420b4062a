//! `hookwire call`: one ad-hoc remote call.

use super::runtime;
use crate::cli::CallArgs;
use crate::ui;
use anyhow::{anyhow, Context};
use hookwire_types::config::ClientConfig;
use hookwire_types::error::RpcError;
use hookwire_types::protocol::EncryptionProtocol;
use hookwire_wire::{Call, RpcClient};
use serde_json::Value;
use std::process::ExitCode;

/// Exit status for each way a call can fail.
fn exit_code(err: &RpcError) -> u8 {
    match err {
        RpcError::InvalidHook(_) => 1,
        RpcError::Procedure(_) => 2,
        RpcError::Critical { .. } => 3,
        RpcError::Connection { .. } | RpcError::Timeout { .. } => 4,
        RpcError::RetriesExhausted { last, .. } => exit_code(last),
        _ => 5,
    }
}

/// Split `key=<json>`.
fn parse_named(raw: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("named argument '{raw}' must look like key=<json>"))?;
    if key.is_empty() {
        return Err(anyhow!("named argument '{raw}' has an empty key"));
    }
    let value = serde_json::from_str(value).with_context(|| format!("value of '{key}' is not valid JSON"))?;
    Ok((key.to_string(), value))
}

fn build_call(args: &CallArgs) -> anyhow::Result<Call> {
    let mut call = Call::new(args.procedure.as_str());
    for (i, raw) in args.args.iter().enumerate() {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("argument {} is not valid JSON: {raw}", i + 1))?;
        call = call.arg(value);
    }
    for raw in &args.named {
        let (key, value) = parse_named(raw)?;
        call = call.named(key, value);
    }
    if args.confidential {
        call = call.confidential();
    }
    Ok(call)
}

fn client_config(base: &ClientConfig, args: &CallArgs) -> ClientConfig {
    let mut config = base.clone();
    if let Some(addr) = &args.addr {
        config.addr = addr.clone();
    }
    if args.plain {
        config.protocol = EncryptionProtocol::None;
    }
    config
}

pub fn cmd_call(base: &ClientConfig, args: CallArgs) -> anyhow::Result<ExitCode> {
    let call = build_call(&args)?;
    let config = client_config(base, &args);

    let outcome = runtime()?.block_on(async move {
        let client = RpcClient::connect(config).await?;
        client.send(call).await
    });

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            ui::error(&e.to_string());
            Ok(ExitCode::from(exit_code(&e)))
        }
    }
}
