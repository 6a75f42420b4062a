//! Hook registry: the server-side table of remotely callable procedures.
//!
//! A [`HookRegistry`] is built mutably before the server starts, then moved
//! into the server and shared behind an `Arc` for its lifetime. Dispatch
//! runs every hook on its own task so that a panic inside a hook becomes a
//! `ProcedureException` instead of taking the connection down.

use crate::crypto::HybridCapability;
use crate::message::{CallEnvelope, ResultEnvelope};
use async_trait::async_trait;
use hookwire_types::protocol::HANDSHAKE_PROCEDURE;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors a hook reports back to its caller.
///
/// These are rendered into the diagnostic of a `ProcedureException`; the
/// error value itself never crosses the wire.
#[derive(Debug, Error)]
pub enum HookError {
    /// A required argument was supplied neither positionally nor by name.
    #[error("missing argument '{name}' (position {index})")]
    MissingArgument { index: usize, name: String },
    /// An argument was present but had the wrong shape.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
    /// The procedure itself failed.
    #[error("{0}")]
    Failed(String),
}

impl HookError {
    pub fn failed(message: impl Into<String>) -> Self {
        HookError::Failed(message.into())
    }
}

/// Arguments of one call: positional values plus named values.
#[derive(Debug, Clone, Default)]
pub struct Args {
    positional: Vec<Value>,
    named: Map<String, Value>,
}

impl Args {
    pub fn new(positional: Vec<Value>, named: Map<String, Value>) -> Self {
        Self { positional, named }
    }

    pub fn positional(&self) -> &[Value] {
        &self.positional
    }

    pub fn named(&self) -> &Map<String, Value> {
        &self.named
    }

    /// Raw lookup: positional slot `index` first, then the named argument.
    pub fn raw(&self, index: usize, name: &str) -> Option<&Value> {
        self.positional.get(index).or_else(|| self.named.get(name))
    }

    /// Required typed argument.
    pub fn get<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, HookError> {
        self.opt(index, name)?.ok_or_else(|| HookError::MissingArgument {
            index,
            name: name.to_string(),
        })
    }

    /// Optional typed argument. Absent and `null` both yield `None`.
    pub fn opt<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, HookError> {
        match self.raw(index, name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| HookError::InvalidArgument {
                    name: name.to_string(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// A procedure callable by name from a remote client.
#[async_trait]
pub trait Hook: Send + Sync + 'static {
    async fn call(&self, args: Args) -> Result<Value, HookError>;
}

/// Adapter for synchronous closures.
struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(Args) -> Result<Value, HookError> + Send + Sync + 'static,
{
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        (self.0)(args)
    }
}

/// Name → procedure table.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn Hook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `hook`, replacing any previous binding.
    pub fn register(&mut self, name: impl Into<String>, hook: impl Hook) -> &mut Self {
        self.register_arc(name, Arc::new(hook))
    }

    pub fn register_arc(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>) -> &mut Self {
        let name = name.into();
        if self.hooks.insert(name.clone(), hook).is_some() {
            debug!(hook = %name, "Replaced existing hook binding");
        }
        self
    }

    /// Bind `name` to a synchronous closure.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Args) -> Result<Value, HookError> + Send + Sync + 'static,
    {
        self.register(name, FnHook(f))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.hooks.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Hook>> {
        self.hooks.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Install the built-in handshake procedure, overriding any application
    /// hook registered under the same name.
    pub(crate) fn install_handshake(&mut self, capability: HybridCapability) {
        if self.contains(HANDSHAKE_PROCEDURE) {
            warn!(
                hook = HANDSHAKE_PROCEDURE,
                "Application hook overrides the reserved handshake procedure; replacing it"
            );
        }
        self.hooks
            .insert(HANDSHAKE_PROCEDURE.to_string(), Arc::new(HandshakeHook { capability }));
    }

    /// Run `call` against the table.
    ///
    /// Unknown names yield `InvalidHook` without invoking anything. Errors and
    /// panics inside the hook yield `ProcedureException`.
    pub async fn dispatch(&self, call: CallEnvelope) -> ResultEnvelope {
        let Some(hook) = self.get(&call.procedure) else {
            return ResultEnvelope::InvalidHook;
        };
        let procedure = call.procedure;
        let args = Args::new(call.args, call.kwargs);
        let task = tokio::spawn(async move { hook.call(args).await });
        match task.await {
            Ok(Ok(value)) => ResultEnvelope::Success(value),
            Ok(Err(e)) => ResultEnvelope::ProcedureException(format!("{procedure}(): {e}")),
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    panic_message(join_err.into_panic())
                } else {
                    "task was cancelled".to_string()
                };
                ResultEnvelope::ProcedureException(format!("{procedure}() panicked: {reason}"))
            }
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hooks", &self.names())
            .finish()
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// `handshake(desired_protocol_id) -> [supported, public_key | null]`
struct HandshakeHook {
    capability: HybridCapability,
}

#[async_trait]
impl Hook for HandshakeHook {
    async fn call(&self, args: Args) -> Result<Value, HookError> {
        let desired: u64 = args.get(0, "protocol")?;
        let (supported, public_key) = self.capability.negotiate(desired);
        Ok(json!([supported, public_key]))
    }
}
