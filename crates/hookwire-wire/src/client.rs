//! RpcClient: dials a server once per call.
//!
//! [`RpcClient::connect`] performs the handshake and remembers the negotiated
//! protocol (and the server's public key for the hybrid protocol). Each call
//! then opens its own socket, writes one frame, reads one frame and closes.

use crate::crypto::{open_response, seal_request, RequestSecrets, ServerPublicKey};
use crate::message::{read_frame, write_frame, AuthLayer, CallEnvelope, CodecError, ResultEnvelope};

use hookwire_types::config::ClientConfig;
use hookwire_types::error::{Phase, RpcError, RpcResult};
use hookwire_types::protocol::{EncryptionProtocol, HANDSHAKE_PROCEDURE};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A call under construction.
#[derive(Debug, Clone)]
pub struct Call {
    procedure: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    confidential: bool,
}

impl Call {
    pub fn new(procedure: impl Into<String>) -> Self {
        Self {
            procedure: procedure.into(),
            args: Vec::new(),
            kwargs: Map::new(),
            confidential: false,
        }
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Append several positional arguments.
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    /// Set a named argument.
    pub fn named(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(key.into(), value.into());
        self
    }

    /// Refuse to send this call unless it can be encrypted.
    pub fn confidential(mut self) -> Self {
        self.confidential = true;
        self
    }

    pub fn procedure(&self) -> &str {
        &self.procedure
    }

    pub fn is_confidential(&self) -> bool {
        self.confidential
    }

    fn envelope(&self) -> CallEnvelope {
        CallEnvelope::new(self.procedure.clone(), self.args.clone(), self.kwargs.clone())
    }
}

/// A connected client. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RpcClient {
    config: Arc<ClientConfig>,
    protocol: EncryptionProtocol,
    server_key: Option<Arc<ServerPublicKey>>,
}

impl RpcClient {
    /// Handshake with the server at `config.addr`.
    ///
    /// If the server does not support `config.protocol` the client falls back
    /// to plaintext, unless `require_encryption` is set.
    pub async fn connect(config: ClientConfig) -> RpcResult<Self> {
        let mut client = Self {
            config: Arc::new(config),
            protocol: EncryptionProtocol::None,
            server_key: None,
        };
        let desired = client.config.protocol;

        let reply = client
            .send(Call::new(HANDSHAKE_PROCEDURE).arg(desired.id()))
            .await?;
        let (supported, public_key): (bool, Option<String>) = serde_json::from_value(reply)
            .map_err(|e| RpcError::violation(format!("malformed handshake reply: {e}")))?;

        match (desired, supported, public_key) {
            (EncryptionProtocol::None, true, _) => {}
            (EncryptionProtocol::Hybrid, true, Some(pem)) => {
                let key = ServerPublicKey::from_pem(&pem)
                    .map_err(|e| RpcError::violation(format!("server public key unusable: {e}")))?;
                client.protocol = EncryptionProtocol::Hybrid;
                client.server_key = Some(Arc::new(key));
            }
            (EncryptionProtocol::Hybrid, true, None) => {
                return Err(RpcError::violation("handshake accepted encryption without a public key"));
            }
            (_, false, _) => {
                if client.config.require_encryption {
                    return Err(RpcError::EncryptionUnavailable(desired));
                }
                warn!(
                    addr = %client.config.addr,
                    "Encryption protocol {} is unsupported by the server; falling back to {}. \
                     Confidential calls will be refused.",
                    desired,
                    EncryptionProtocol::None
                );
            }
        }

        debug!(addr = %client.config.addr, protocol = %client.protocol, "RPC: handshake complete");
        Ok(client)
    }

    /// The protocol calls actually travel under.
    pub fn protocol(&self) -> EncryptionProtocol {
        self.protocol
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Positional form: `call("add", vec![4.into(), 5.into()], Map::new())`.
    pub async fn call(&self, procedure: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> RpcResult<Value> {
        let mut call = Call::new(procedure).args(args);
        call.kwargs = kwargs;
        self.send(call).await
    }

    /// Send `call` and return its success payload.
    pub async fn send(&self, call: Call) -> RpcResult<Value> {
        if call.confidential && !self.protocol.is_encrypted() {
            return Err(RpcError::EncryptionUnavailable(EncryptionProtocol::Hybrid));
        }

        let envelope = call.envelope();
        trace!(addr = %self.config.addr, protocol = %self.protocol, "RPC: calling {}", envelope);

        let result = match (&self.server_key, self.protocol) {
            (Some(key), EncryptionProtocol::Hybrid) => self.send_hybrid(key, &envelope).await?,
            _ => self.send_plain(&envelope).await?,
        };

        match result {
            ResultEnvelope::Success(value) => Ok(value),
            ResultEnvelope::InvalidHook => Err(RpcError::InvalidHook(call.procedure)),
            ResultEnvelope::ProcedureException(trace) => Err(RpcError::Procedure(trace)),
            ResultEnvelope::CriticalError { hook_processed } => Err(RpcError::Critical {
                hook_processed: Some(hook_processed),
                detail: "server rejected the request envelope".to_string(),
            }),
        }
    }

    /// Send `call` and deserialize its payload as `T`.
    pub async fn call_as<T: DeserializeOwned>(&self, call: Call) -> RpcResult<T> {
        let procedure = call.procedure.clone();
        let value = self.send(call).await?;
        serde_json::from_value(value).map_err(|e| RpcError::UnexpectedPayload(format!("{procedure}(): {e}")))
    }

    /// Run `call` on a background task.
    pub fn spawn(&self, call: Call) -> PendingCall {
        let client = self.clone();
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let _ = tx.send(client.send(call).await);
        });
        PendingCall { rx: Some(rx), task }
    }

    async fn send_plain(&self, envelope: &CallEnvelope) -> RpcResult<ResultEnvelope> {
        let reply = self.exchange(&AuthLayer::plain(envelope.to_value())).await?;
        if reply.protocol != EncryptionProtocol::None.id() {
            return Err(RpcError::violation(format!(
                "reply used protocol id {} for a plaintext request",
                reply.protocol
            )));
        }
        decode_result(reply.payload)
    }

    async fn send_hybrid(&self, key: &ServerPublicKey, envelope: &CallEnvelope) -> RpcResult<ResultEnvelope> {
        let body = serde_json::to_vec(&envelope.to_value())
            .map_err(|e| RpcError::violation(format!("could not encode call: {e}")))?;
        let (layer, secrets) =
            seal_request(key, &body).map_err(|e| RpcError::violation(format!("could not encrypt call: {e}")))?;
        let reply = self.exchange(&layer).await?;
        self.open_hybrid_reply(&secrets, reply)
    }

    fn open_hybrid_reply(&self, secrets: &RequestSecrets, reply: AuthLayer) -> RpcResult<ResultEnvelope> {
        if reply.protocol == EncryptionProtocol::None.id() {
            // Envelope failures on the server come back in the clear.
            return match decode_result(reply.payload)? {
                critical @ ResultEnvelope::CriticalError { .. } => Ok(critical),
                _ => Err(RpcError::violation("plaintext reply to an encrypted request")),
            };
        }
        if reply.protocol != EncryptionProtocol::Hybrid.id() {
            return Err(RpcError::violation(format!(
                "reply used protocol id {} for an encrypted request",
                reply.protocol
            )));
        }
        let plaintext = open_response(secrets, &reply)
            .map_err(|e| RpcError::violation(format!("could not decrypt reply: {e}")))?;
        let value: Value = serde_json::from_slice(&plaintext)
            .map_err(|e| RpcError::violation(format!("decrypted reply is not JSON: {e}")))?;
        decode_result(value)
    }

    /// One socket lifecycle: connect, write one frame, read one frame.
    async fn exchange(&self, request: &AuthLayer) -> RpcResult<AuthLayer> {
        let addr = self.config.addr.as_str();
        let stream = tokio::time::timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| RpcError::Connection {
                addr: addr.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })?
            .map_err(|source| RpcError::Connection {
                addr: addr.to_string(),
                source,
            })?;
        let (mut reader, mut writer) = stream.into_split();

        tokio::time::timeout(self.config.send_timeout(), write_frame(&mut writer, request))
            .await
            .map_err(|_| RpcError::Timeout { phase: Phase::Sending })?
            .map_err(|e| match e {
                CodecError::Io(source) => RpcError::Connection {
                    addr: addr.to_string(),
                    source,
                },
                other => RpcError::violation(format!("could not encode request: {other}")),
            })?;

        tokio::time::timeout(
            self.config.receive_timeout(),
            read_frame(&mut reader, self.config.max_message_size),
        )
        .await
        .map_err(|_| RpcError::Timeout {
            phase: Phase::Receiving,
        })?
        .map_err(|e| RpcError::violation(format!("bad reply from {addr}: {e}")))
    }
}

fn decode_result(value: Value) -> RpcResult<ResultEnvelope> {
    ResultEnvelope::from_value(value).map_err(|e| RpcError::violation(e.to_string()))
}

/// A call running in the background.
#[derive(Debug)]
pub struct PendingCall {
    rx: Option<oneshot::Receiver<RpcResult<Value>>>,
    task: JoinHandle<()>,
}

impl PendingCall {
    /// Whether the result is ready (or has already been taken).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Take the result if it is ready. Returns `None` while the call is in
    /// flight and after the result has been taken once.
    pub fn try_take(&mut self) -> Option<RpcResult<Value>> {
        let rx = self.rx.as_mut()?;
        match rx.try_recv() {
            Ok(result) => {
                self.rx = None;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.rx = None;
                Some(Err(RpcError::violation("background call ended without a result")))
            }
        }
    }

    /// Wait for the result.
    pub async fn wait(mut self) -> RpcResult<Value> {
        match self.rx.take() {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(RpcError::violation("background call ended without a result"))),
            None => Err(RpcError::violation("result already taken")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HookRegistry;
    use crate::server::RpcServer;
    use hookwire_types::config::ServerConfig;
    use serde_json::json;

    #[test]
    fn test_call_builder() {
        let call = Call::new("set_results")
            .arg("alice")
            .arg(json!([["CITS1001", 80]]))
            .named("service_token", "t0k3n")
            .confidential();
        assert_eq!(call.procedure(), "set_results");
        assert!(call.is_confidential());
        assert_eq!(
            call.envelope().to_value(),
            json!(["set_results", ["alice", [["CITS1001", 80]]], {"service_token": "t0k3n"}])
        );
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = RpcClient::connect(ClientConfig::new(addr.to_string())).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_plain_server_fallback() {
        let mut registry = HookRegistry::new();
        registry.register_fn("ping", |_| Ok(json!("pong")));
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            encryption: false,
            ..ServerConfig::default()
        };
        let handle = RpcServer::new(config, registry).unwrap().start().await.unwrap();
        let addr = handle.local_addr().to_string();

        let client = RpcClient::connect(ClientConfig::new(addr.clone())).await.unwrap();
        assert_eq!(client.protocol(), EncryptionProtocol::None);
        assert_eq!(client.send(Call::new("ping")).await.unwrap(), json!("pong"));
        assert!(matches!(
            client.send(Call::new("ping").confidential()).await,
            Err(RpcError::EncryptionUnavailable(EncryptionProtocol::Hybrid))
        ));

        let strict = ClientConfig {
            require_encryption: true,
            ..ClientConfig::new(addr)
        };
        assert!(matches!(
            RpcClient::connect(strict).await,
            Err(RpcError::EncryptionUnavailable(_))
        ));
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_pending_call_polling() {
        let mut registry = HookRegistry::new();
        registry.register_fn("ping", |_| Ok(json!("pong")));
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".into(),
            encryption: false,
            ..ServerConfig::default()
        };
        let handle = RpcServer::new(config, registry).unwrap().start().await.unwrap();
        let client = RpcClient::connect(ClientConfig::new(handle.local_addr().to_string()))
            .await
            .unwrap();

        let mut pending = client.spawn(Call::new("ping"));
        let result = loop {
            if let Some(result) = pending.try_take() {
                break result;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        };
        assert_eq!(result.unwrap(), json!("pong"));
        assert!(pending.try_take().is_none());

        let awaited = client.spawn(Call::new("missing")).wait().await;
        assert!(matches!(awaited, Err(RpcError::InvalidHook(name)) if name == "missing"));
        handle.shutdown();
    }
}
