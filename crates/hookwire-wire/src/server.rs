//! RpcServer: TCP listener that answers exactly one call per connection.
//!
//! Each accepted connection is handed to a detached task that performs a
//! single read → decrypt → dispatch → encrypt → write cycle and closes. Any
//! failure in the envelope path is answered with a plaintext
//! `[0, [], [3, hook_processed]]` reply so the client always gets a status.
//!
//! Shutdown stops the accept loop and drops the listener; workers already
//! running are left to finish their cycle.

use crate::crypto::{open_request, seal_response, EnvelopeError, HybridCapability, NonceLedger, ServerKeys};
use crate::message::{read_frame, write_frame, AuthLayer, CallEnvelope, CodecError, ResultEnvelope};
use crate::registry::HookRegistry;
use crate::shutdown::{ShutdownReason, ShutdownTrigger};

use hookwire_types::config::ServerConfig;
use hookwire_types::protocol::{EncryptionProtocol, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Errors that prevent a server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not generate server keypair: {0}")]
    KeyGeneration(#[source] EnvelopeError),
}

/// Why one request could not be served normally.
#[derive(Debug, Error)]
enum RequestFailure {
    #[error("no request within {0} ms")]
    ReadTimeout(u64),
    #[error("bad frame: {0}")]
    Codec(#[from] CodecError),
    #[error("unsupported encryption protocol id {0}")]
    UnsupportedProtocol(u8),
    #[error("envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("replayed nonce {0}")]
    ReplayedNonce(String),
}

/// A failure plus whether the hook body had already run.
struct Rejection {
    failure: RequestFailure,
    hook_processed: bool,
}

impl From<RequestFailure> for Rejection {
    fn from(failure: RequestFailure) -> Self {
        Self {
            failure,
            hook_processed: false,
        }
    }
}

impl From<CodecError> for Rejection {
    fn from(e: CodecError) -> Self {
        RequestFailure::Codec(e).into()
    }
}

impl From<EnvelopeError> for Rejection {
    fn from(e: EnvelopeError) -> Self {
        RequestFailure::Envelope(e).into()
    }
}

/// State shared by every connection task.
struct ServerContext {
    config: ServerConfig,
    registry: Arc<HookRegistry>,
    capability: HybridCapability,
    ledger: NonceLedger,
}

/// An RPC server, configured but not yet listening.
pub struct RpcServer {
    context: Arc<ServerContext>,
    shutdown: ShutdownTrigger,
}

impl RpcServer {
    /// Freeze `registry`, install the handshake procedure and, when the
    /// hybrid protocol is enabled, generate the server keypair.
    pub fn new(config: ServerConfig, mut registry: HookRegistry) -> Result<Self, ServerError> {
        let capability = if config.encryption {
            let keys = ServerKeys::generate(config.rsa_bits).map_err(ServerError::KeyGeneration)?;
            HybridCapability::Available(Arc::new(keys))
        } else {
            HybridCapability::Unavailable
        };
        registry.install_handshake(capability.clone());

        Ok(Self {
            context: Arc::new(ServerContext {
                config,
                registry: Arc::new(registry),
                capability,
                ledger: NonceLedger::new(),
            }),
            shutdown: ShutdownTrigger::new(),
        })
    }

    /// Use an externally owned trigger, e.g. one a hook can fire.
    pub fn with_shutdown(mut self, trigger: ShutdownTrigger) -> Self {
        self.shutdown = trigger;
        self
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Whether the hybrid protocol is served.
    pub fn encryption_available(&self) -> bool {
        matches!(self.context.capability, HybridCapability::Available(_))
    }

    /// Bind the listener and spawn the accept loop.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let addr = self.context.config.listen_addr.clone();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            encryption = self.encryption_available(),
            hooks = ?self.context.registry.names(),
            "RPC: server listening"
        );

        let context = Arc::clone(&self.context);
        let shutdown = self.shutdown.clone();
        let accept_task = tokio::spawn(async move {
            Self::accept_loop(listener, context, shutdown).await;
        });

        Ok(ServerHandle {
            local_addr,
            shutdown: self.shutdown,
            accept_task,
        })
    }

    /// Run until Ctrl-C or until the shutdown trigger fires.
    pub async fn serve_until_interrupt(self) -> Result<ShutdownReason, ServerError> {
        let handle = self.start().await?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                handle.shutdown.fire(ShutdownReason::Interrupted);
            }
            _ = handle.shutdown.fired() => {}
        }
        Ok(handle.stopped().await)
    }

    async fn accept_loop(listener: TcpListener, context: Arc<ServerContext>, shutdown: ShutdownTrigger) {
        loop {
            tokio::select! {
                reason = shutdown.fired() => {
                    info!(%reason, "RPC: server no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = Arc::clone(&context);
                        tokio::spawn(async move {
                            Self::handle_connection(stream, peer, &context).await;
                        });
                    }
                    Err(e) => {
                        error!("RPC: accept error: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                },
            }
        }
        drop(listener);
    }

    /// One full request/response cycle on a fresh connection.
    async fn handle_connection(stream: TcpStream, peer: SocketAddr, context: &ServerContext) {
        let conn = Uuid::new_v4();
        debug!(%peer, %conn, "RPC: accepted connection");
        let (mut reader, mut writer) = stream.into_split();

        let reply = match Self::serve_request(&mut reader, peer, conn, context).await {
            Ok(layer) => layer,
            Err(rejection) => {
                error!(
                    %peer,
                    %conn,
                    hook_processed = rejection.hook_processed,
                    "RPC: {}: {}",
                    StatusCode::CriticalError.describe(),
                    rejection.failure
                );
                critical_reply(rejection.hook_processed)
            }
        };

        if let Err(e) = write_frame(&mut writer, &reply).await {
            debug!(%peer, %conn, "RPC: could not deliver reply: {}", e);
        }
        let _ = writer.shutdown().await;
    }

    async fn serve_request(
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        peer: SocketAddr,
        conn: Uuid,
        context: &ServerContext,
    ) -> Result<AuthLayer, Rejection> {
        let read_timeout = context.config.read_timeout();
        let layer = tokio::time::timeout(read_timeout, read_frame(reader, context.config.max_message_size))
            .await
            .map_err(|_| RequestFailure::ReadTimeout(context.config.read_timeout_ms))??;

        match EncryptionProtocol::from_id(layer.protocol) {
            Some(EncryptionProtocol::None) => {
                let call = CallEnvelope::from_value(layer.payload)?;
                let result = Self::dispatch(call, peer, conn, context).await;
                Ok(AuthLayer::plain(result.to_value()))
            }
            Some(EncryptionProtocol::Hybrid) => {
                let HybridCapability::Available(keys) = &context.capability else {
                    return Err(RequestFailure::UnsupportedProtocol(layer.protocol).into());
                };
                let opened = open_request(keys, &layer)?;
                if !context.ledger.record(opened.nonce) {
                    return Err(RequestFailure::ReplayedNonce(hex::encode(opened.nonce)).into());
                }
                let call_value: serde_json::Value =
                    serde_json::from_slice(&opened.plaintext).map_err(CodecError::from)?;
                let call = CallEnvelope::from_value(call_value)?;
                let result = Self::dispatch(call, peer, conn, context).await;

                let sealed = serde_json::to_vec(&result.to_value())
                    .map_err(|e| RequestFailure::Codec(e.into()))
                    .and_then(|body| {
                        seal_response(&opened.key, &opened.nonce, &body).map_err(RequestFailure::from)
                    });
                sealed.map_err(|failure| Rejection {
                    failure,
                    hook_processed: true,
                })
            }
            None => Err(RequestFailure::UnsupportedProtocol(layer.protocol).into()),
        }
    }

    async fn dispatch(call: CallEnvelope, peer: SocketAddr, conn: Uuid, context: &ServerContext) -> ResultEnvelope {
        info!(%peer, %conn, procedure = %call.procedure, args = call.args.len(), "RPC: call");
        // Arguments may carry credentials.
        trace!(%peer, %conn, "RPC: {}", call);
        let procedure = call.procedure.clone();
        let result = context.registry.dispatch(call).await;
        match &result {
            ResultEnvelope::Success(_) => {
                debug!(%peer, %conn, procedure = %procedure, "RPC: {}", result.status().describe());
            }
            ResultEnvelope::InvalidHook => {
                warn!(%peer, %conn, procedure = %procedure, "RPC: {}", result.status().describe());
            }
            ResultEnvelope::ProcedureException(trace) => {
                warn!(%peer, %conn, procedure = %procedure, "RPC: {}:\n{}", result.status().describe(), trace);
            }
            ResultEnvelope::CriticalError { .. } => {}
        }
        result
    }
}

/// Plaintext reply used whenever the envelope itself could not be handled.
fn critical_reply(hook_processed: bool) -> AuthLayer {
    AuthLayer::plain(ResultEnvelope::CriticalError { hook_processed }.to_value())
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: ShutdownTrigger,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    /// Actual bound address (useful when binding to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `true` until shutdown has been requested and the listener dropped.
    pub fn is_active(&self) -> bool {
        !self.shutdown.is_fired() && !self.accept_task.is_finished()
    }

    pub fn shutdown_trigger(&self) -> ShutdownTrigger {
        self.shutdown.clone()
    }

    /// Stop accepting connections. In-flight requests are not interrupted.
    pub fn shutdown(&self) {
        self.shutdown.fire(ShutdownReason::Requested);
    }

    /// Wait until the accept loop has exited and return why.
    pub async fn stopped(self) -> ShutdownReason {
        let reason = self.shutdown.fired().await;
        if let Err(e) = self.accept_task.await {
            error!("RPC: accept loop ended abnormally: {}", e);
        }
        reason
    }
}
