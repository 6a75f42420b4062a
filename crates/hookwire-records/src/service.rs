//! Hooks exposing the record store over RPC.

use crate::store::{validate_results, verify_password, RecordStore, StoreError};

use async_trait::async_trait;
use hookwire_wire::{Args, Hook, HookError, HookRegistry};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

/// Named argument carrying the caller's service token.
pub const SERVICE_TOKEN_ARG: &str = "service_token";

impl From<StoreError> for HookError {
    fn from(e: StoreError) -> Self {
        HookError::failed(e.to_string())
    }
}

struct Shared {
    store: RwLock<RecordStore>,
    service_tokens: Vec<String>,
}

impl Shared {
    /// With no configured tokens every caller is accepted.
    fn authorize(&self, args: &Args) -> Result<(), HookError> {
        if self.service_tokens.is_empty() {
            return Ok(());
        }
        let presented = match args.named().get(SERVICE_TOKEN_ARG) {
            Some(Value::String(token)) => token.as_bytes(),
            _ => return Err(HookError::failed("unauthorized")),
        };
        let matched = self
            .service_tokens
            .iter()
            .fold(false, |acc, t| acc | bool::from(t.as_bytes().ct_eq(presented)));
        if matched {
            Ok(())
        } else {
            warn!("Records call with an unrecognised service token");
            Err(HookError::failed("unauthorized"))
        }
    }
}

/// The records service: owns the store and builds its hook table.
#[derive(Clone)]
pub struct RecordsService {
    shared: Arc<Shared>,
}

impl RecordsService {
    pub fn new(store: RecordStore, service_tokens: Vec<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store: RwLock::new(store),
                service_tokens,
            }),
        }
    }

    /// `check_credentials`, `get_results` and `set_results`.
    pub fn registry(&self) -> HookRegistry {
        let mut registry = HookRegistry::new();
        registry
            .register("check_credentials", CheckCredentials(Arc::clone(&self.shared)))
            .register("get_results", GetResults(Arc::clone(&self.shared)))
            .register("set_results", SetResults(Arc::clone(&self.shared)));
        registry
    }

    /// Number of users currently loaded.
    pub fn user_count(&self) -> usize {
        self.shared.store.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Flush the store to disk.
    pub fn save(&self) -> Result<(), StoreError> {
        self.shared.store.read().unwrap_or_else(|e| e.into_inner()).save()
    }
}

fn join_error(e: tokio::task::JoinError) -> HookError {
    HookError::failed(format!("blocking task failed: {e}"))
}

/// `check_credentials(username, password) -> bool`
struct CheckCredentials(Arc<Shared>);

#[async_trait]
impl Hook for CheckCredentials {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        self.0.authorize(&args)?;
        let username: String = args.get(0, "username")?;
        let password: String = args.get(1, "password")?;

        let stored = self
            .0
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .password_hash(&username);
        let Some(phc) = stored else {
            return Ok(json!(false));
        };
        let valid = tokio::task::spawn_blocking(move || verify_password(&phc, &password))
            .await
            .map_err(join_error)?;
        Ok(json!(valid))
    }
}

/// `get_results(username) -> [[unit_code, mark], ...]`
struct GetResults(Arc<Shared>);

#[async_trait]
impl Hook for GetResults {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        self.0.authorize(&args)?;
        let username: String = args.get(0, "username")?;
        let results = self
            .0
            .store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .results(&username)?;
        Ok(json!(results))
    }
}

/// `set_results(username, results) -> null`
struct SetResults(Arc<Shared>);

#[async_trait]
impl Hook for SetResults {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        self.0.authorize(&args)?;
        let username: String = args.get(0, "username")?;
        let raw: Value = args.get(1, "results")?;
        let results = validate_results(&raw)?;
        let count = results.len();

        let shared = Arc::clone(&self.0);
        let user = username.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let mut store = shared.store.write().unwrap_or_else(|e| e.into_inner());
            let previous = store.set_results(&user, results)?;
            if let Err(e) = store.save() {
                store.set_results(&user, previous)?;
                return Err(e);
            }
            Ok(())
        })
        .await
        .map_err(join_error)??;

        info!(user = %username, units = count, "Results updated");
        Ok(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookwire_wire::{CallEnvelope, ResultEnvelope};
    use serde_json::Map;

    fn service(tokens: Vec<String>) -> (tempfile::TempDir, RecordsService) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RecordStore::open(dir.path().join("students.json")).unwrap();
        store.add_user("alice", "wonderland").unwrap();
        (dir, RecordsService::new(store, tokens))
    }

    fn call(name: &str, args: Vec<Value>, token: Option<&str>) -> CallEnvelope {
        let mut kwargs = Map::new();
        if let Some(token) = token {
            kwargs.insert(SERVICE_TOKEN_ARG.into(), json!(token));
        }
        CallEnvelope::new(name, args, kwargs)
    }

    #[tokio::test]
    async fn test_check_credentials() {
        let (_dir, service) = service(vec![]);
        let registry = service.registry();
        let ok = registry
            .dispatch(call("check_credentials", vec![json!("alice"), json!("wonderland")], None))
            .await;
        assert_eq!(ok, ResultEnvelope::Success(json!(true)));
        let wrong = registry
            .dispatch(call("check_credentials", vec![json!("alice"), json!("nope")], None))
            .await;
        assert_eq!(wrong, ResultEnvelope::Success(json!(false)));
        let unknown = registry
            .dispatch(call("check_credentials", vec![json!("mallory"), json!("x")], None))
            .await;
        assert_eq!(unknown, ResultEnvelope::Success(json!(false)));
    }

    #[tokio::test]
    async fn test_set_then_get_persists() {
        let (dir, service) = service(vec![]);
        let registry = service.registry();
        let results = json!([["CITS1001", 80], ["CITS1402", 72.5]]);

        let set = registry
            .dispatch(call("set_results", vec![json!("alice"), results.clone()], None))
            .await;
        assert_eq!(set, ResultEnvelope::Success(Value::Null));

        let got = registry.dispatch(call("get_results", vec![json!("alice")], None)).await;
        assert_eq!(got, ResultEnvelope::Success(results.clone()));

        let reloaded = RecordStore::open(dir.path().join("students.json")).unwrap();
        assert_eq!(json!(reloaded.results("alice").unwrap()), results);
    }

    #[tokio::test]
    async fn test_invalid_results_rejected() {
        let (_dir, service) = service(vec![]);
        let registry = service.registry();
        let bad = registry
            .dispatch(call("set_results", vec![json!("alice"), json!([["CITS1001", 140]])], None))
            .await;
        assert!(matches!(bad, ResultEnvelope::ProcedureException(ref t) if t.contains("outside 0..=100")));

        let unknown = registry.dispatch(call("get_results", vec![json!("bob")], None)).await;
        assert!(matches!(unknown, ResultEnvelope::ProcedureException(ref t) if t.contains("unknown user")));
    }

    #[tokio::test]
    async fn test_service_token_enforced() {
        let (_dir, service) = service(vec!["evaluator-secret".into()]);
        let registry = service.registry();

        for token in [None, Some("guess")] {
            let denied = registry.dispatch(call("get_results", vec![json!("alice")], token)).await;
            assert!(matches!(denied, ResultEnvelope::ProcedureException(ref t) if t.contains("unauthorized")));
        }
        let allowed = registry
            .dispatch(call("get_results", vec![json!("alice")], Some("evaluator-secret")))
            .await;
        assert_eq!(allowed, ResultEnvelope::Success(json!([])));
    }
}
