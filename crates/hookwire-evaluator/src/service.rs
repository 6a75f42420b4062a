//! Evaluator hooks.
//!
//! The evaluator owns no records of its own. Every credential check and
//! results lookup is forwarded to the records service through a
//! [`RetryingClient`]; when that service stays unreachable the client fires
//! the evaluator's shutdown trigger.

use crate::eligibility::evaluate;
use crate::session::SessionTable;

use async_trait::async_trait;
use hookwire_types::config::EvaluatorConfig;
use hookwire_wire::{Args, Call, Hook, HookError, HookRegistry, RetryingClient, ShutdownTrigger};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

/// Named argument the records service expects its callers' token in.
const SERVICE_TOKEN_ARG: &str = "service_token";

struct Shared {
    sessions: SessionTable,
    records: RetryingClient,
    service_token: Option<String>,
    /// Send credentials only over an encrypted channel.
    confidential: bool,
}

impl Shared {
    fn records_call(&self, procedure: &str) -> Call {
        let mut call = Call::new(procedure);
        if let Some(token) = &self.service_token {
            call = call.named(SERVICE_TOKEN_ARG, token.as_str());
        }
        if self.confidential {
            call = call.confidential();
        }
        call
    }

    async fn forward(&self, call: Call) -> Result<Value, HookError> {
        self.records
            .send(call)
            .await
            .map_err(|e| HookError::failed(format!("records service: {e}")))
    }

    fn require_session(&self, token: &str) -> Result<String, HookError> {
        self.sessions
            .resolve(token)
            .ok_or_else(|| HookError::failed("invalid or expired session token"))
    }
}

/// The evaluator service: sessions plus a link to the records service.
#[derive(Clone)]
pub struct EvaluatorService {
    shared: Arc<Shared>,
}

impl EvaluatorService {
    /// `shutdown` is fired when the records service cannot be reached.
    pub fn new(config: &EvaluatorConfig, shutdown: ShutdownTrigger) -> Self {
        let records = RetryingClient::new(config.records.clone(), config.retry.clone()).with_shutdown(shutdown);
        Self {
            shared: Arc::new(Shared {
                sessions: SessionTable::new(config.token_bytes),
                records,
                service_token: config.service_token.clone(),
                confidential: config.records.protocol.is_encrypted(),
            }),
        }
    }

    /// `log_in`, `evaluate_eligibility`, `get_results` and `set_results`.
    pub fn registry(&self) -> HookRegistry {
        let mut registry = HookRegistry::new();
        registry
            .register("log_in", LogIn(Arc::clone(&self.shared)))
            .register("evaluate_eligibility", EvaluateEligibility(Arc::clone(&self.shared)))
            .register("get_results", GetResults(Arc::clone(&self.shared)))
            .register("set_results", SetResults(Arc::clone(&self.shared)));
        registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.shared.sessions
    }
}

/// `log_in(username, password) -> token | false`
struct LogIn(Arc<Shared>);

#[async_trait]
impl Hook for LogIn {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        let username: String = args.get(0, "username")?;
        let password: String = args.get(1, "password")?;

        let call = self.0.records_call("check_credentials").arg(username.as_str()).arg(password);
        let valid = self.0.forward(call).await?;
        if valid != Value::Bool(true) {
            info!(user = %username, "Rejected log in");
            return Ok(json!(false));
        }

        let token = self.0.sessions.issue(&username);
        info!(user = %username, "Issued session token");
        Ok(json!(token))
    }
}

/// `evaluate_eligibility(token, units) -> [username, average, top_12_average, evaluation] | null`
struct EvaluateEligibility(Arc<Shared>);

#[async_trait]
impl Hook for EvaluateEligibility {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        let token: String = args.get(0, "token")?;
        let Some(username) = self.0.sessions.resolve(&token) else {
            return Ok(Value::Null);
        };
        let units: Vec<(String, f64)> = args.get(1, "units")?;
        let marks: Vec<f64> = units.iter().map(|(_, mark)| *mark).collect();
        let evaluation = evaluate(&marks).map_err(|e| HookError::failed(e.to_string()))?;

        info!(
            user = %username,
            units = marks.len(),
            verdict = ?evaluation.verdict,
            "Evaluated eligibility"
        );
        Ok(json!([
            username,
            evaluation.average,
            evaluation.top_average,
            evaluation.verdict.message()
        ]))
    }
}

/// `get_results(token) -> [[unit_code, mark], ...]`
struct GetResults(Arc<Shared>);

#[async_trait]
impl Hook for GetResults {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        let token: String = args.get(0, "token")?;
        let username = self.0.require_session(&token)?;
        self.0.forward(self.0.records_call("get_results").arg(username)).await
    }
}

/// `set_results(token, results) -> null`
struct SetResults(Arc<Shared>);

#[async_trait]
impl Hook for SetResults {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        let token: String = args.get(0, "token")?;
        let results: Value = args.get(1, "results")?;
        let username = self.0.require_session(&token)?;
        self.0
            .forward(self.0.records_call("set_results").arg(username).arg(results))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwire_types::config::{ClientConfig, RetryConfig};
    use hookwire_wire::{CallEnvelope, ResultEnvelope};
    use serde_json::Map;

    fn offline_service() -> (EvaluatorService, ShutdownTrigger) {
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = dead.local_addr().unwrap().to_string();
        drop(dead);
        let config = EvaluatorConfig {
            records: ClientConfig::new(addr),
            retry: RetryConfig {
                max_attempts: 1,
                backoff_ms: 1,
            },
            ..EvaluatorConfig::default()
        };
        let trigger = ShutdownTrigger::new();
        (EvaluatorService::new(&config, trigger.clone()), trigger)
    }

    fn call(name: &str, args: Vec<Value>) -> CallEnvelope {
        CallEnvelope::new(name, args, Map::new())
    }

    #[tokio::test]
    async fn test_unknown_token_evaluates_to_null() {
        let (service, _) = offline_service();
        let result = service
            .registry()
            .dispatch(call("evaluate_eligibility", vec![json!("forged"), json!([["CITS1001", 80]])]))
            .await;
        assert_eq!(result, ResultEnvelope::Success(Value::Null));
    }

    #[tokio::test]
    async fn test_evaluate_with_session() {
        let (service, _) = offline_service();
        let token = service.sessions().issue("alice");
        let units: Vec<Value> = (0..12).map(|i| json!([format!("UNIT{i:04}"), 75])).collect();
        let result = service
            .registry()
            .dispatch(call("evaluate_eligibility", vec![json!(token), json!(units)]))
            .await;
        assert_eq!(
            result,
            ResultEnvelope::Success(json!(["alice", 75.0, 75.0, "QUALIFIED FOR HONOURS STUDY!"]))
        );

        let empty = service
            .registry()
            .dispatch(call("evaluate_eligibility", vec![json!(token), json!([])]))
            .await;
        assert!(matches!(empty, ResultEnvelope::ProcedureException(ref t) if t.contains("empty")));
    }

    #[tokio::test]
    async fn test_results_need_a_session() {
        let (service, trigger) = offline_service();
        let result = service.registry().dispatch(call("get_results", vec![json!("forged")])).await;
        assert!(matches!(result, ResultEnvelope::ProcedureException(ref t) if t.contains("session token")));
        // Rejected before any records call, so nothing was escalated.
        assert!(!trigger.is_fired());
    }

    #[tokio::test]
    async fn test_unreachable_records_fires_shutdown() {
        let (service, trigger) = offline_service();
        let result = service
            .registry()
            .dispatch(call("log_in", vec![json!("alice"), json!("wonderland")]))
            .await;
        assert!(matches!(result, ResultEnvelope::ProcedureException(ref t) if t.contains("records service")));
        assert!(trigger.reason().is_some_and(|r| r.is_fatal()));
    }
}
