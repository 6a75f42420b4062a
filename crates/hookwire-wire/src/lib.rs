//! Hookwire RPC core: named procedure calls over TCP.
//!
//! One call per connection, carried in a length-prefixed JSON frame and
//! optionally protected by a hybrid RSA-OAEP / AES-256-CTR envelope.
//!
//! ## Architecture
//!
//! - **message**: wire codec and framing
//! - **crypto**: hybrid encryption envelope and the nonce ledger
//! - **registry**: name → hook table, dispatch, the built-in handshake
//! - **server**: accept loop, per-connection workers, shutdown
//! - **client**: handshake, call builder, per-call socket lifecycle
//! - **retry**: bounded retry with shutdown escalation for layered services

pub mod client;
pub mod crypto;
pub mod message;
pub mod registry;
pub mod retry;
pub mod server;
pub mod shutdown;

pub use client::{Call, PendingCall, RpcClient};
pub use message::{AuthLayer, CallEnvelope, ResultEnvelope};
pub use registry::{Args, Hook, HookError, HookRegistry};
pub use retry::RetryingClient;
pub use server::{RpcServer, ServerError, ServerHandle};
pub use shutdown::{ShutdownReason, ShutdownTrigger};
