//! Command implementations by service.

pub mod call;
pub mod evaluator;
pub mod records;

use hookwire_wire::ShutdownReason;
use std::process::ExitCode;

pub(crate) fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Runtime::new()?)
}

/// Non-zero when the server stopped on a fatal reason.
pub(crate) fn exit_code_for(reason: &ShutdownReason) -> ExitCode {
    if reason.is_fatal() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
