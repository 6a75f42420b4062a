//! Wire codec.
//!
//! Every exchange is a single frame in each direction: a 4-byte big-endian
//! length header followed by a compact JSON body. The body is always an
//! [`AuthLayer`], whose payload is either a plaintext envelope or base64
//! ciphertext depending on the protocol id.

use hookwire_types::protocol::StatusCode;
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Errors from framing and envelope decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

/// Outermost layer of every message: `[protocol_id, [protocol_args...], payload]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthLayer {
    pub protocol: u8,
    pub protocol_args: Vec<String>,
    pub payload: Value,
}

impl AuthLayer {
    /// A protocol-0 layer around a plaintext envelope.
    pub fn plain(payload: Value) -> Self {
        Self {
            protocol: 0,
            protocol_args: Vec::new(),
            payload,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.protocol),
            Value::from(self.protocol_args.clone()),
            self.payload.clone(),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let (protocol, protocol_args, payload): (u8, Vec<String>, Value) =
            serde_json::from_value(value).map_err(|e| CodecError::Malformed {
                what: "auth layer",
                reason: e.to_string(),
            })?;
        Ok(Self {
            protocol,
            protocol_args,
            payload,
        })
    }
}

/// A request: `[procedure, [args...], {kwargs}]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CallEnvelope {
    pub procedure: String,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallEnvelope {
    pub fn new(procedure: impl Into<String>, args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self {
            procedure: procedure.into(),
            args,
            kwargs,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.procedure.clone()),
            Value::Array(self.args.clone()),
            Value::Object(self.kwargs.clone()),
        ])
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let (procedure, args, kwargs): (String, Vec<Value>, Map<String, Value>) =
            serde_json::from_value(value).map_err(|e| CodecError::Malformed {
                what: "call envelope",
                reason: e.to_string(),
            })?;
        Ok(Self {
            procedure,
            args,
            kwargs,
        })
    }
}

impl fmt::Display for CallEnvelope {
    /// Renders `name(arg1, arg2, key=value)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .args
            .iter()
            .map(|v| v.to_string())
            .chain(self.kwargs.iter().map(|(k, v)| format!("{k}={v}")))
            .collect();
        write!(f, "{}({})", self.procedure, rendered.join(", "))
    }
}

/// A response: `[status_code, payload]`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultEnvelope {
    Success(Value),
    InvalidHook,
    ProcedureException(String),
    CriticalError { hook_processed: bool },
}

impl ResultEnvelope {
    pub fn status(&self) -> StatusCode {
        match self {
            ResultEnvelope::Success(_) => StatusCode::Success,
            ResultEnvelope::InvalidHook => StatusCode::InvalidHook,
            ResultEnvelope::ProcedureException(_) => StatusCode::ProcedureException,
            ResultEnvelope::CriticalError { .. } => StatusCode::CriticalError,
        }
    }

    pub fn to_value(&self) -> Value {
        let payload = match self {
            ResultEnvelope::Success(v) => v.clone(),
            ResultEnvelope::InvalidHook => Value::Null,
            ResultEnvelope::ProcedureException(trace) => Value::String(trace.clone()),
            ResultEnvelope::CriticalError { hook_processed } => Value::Bool(*hook_processed),
        };
        Value::Array(vec![Value::from(self.status().code()), payload])
    }

    pub fn from_value(value: Value) -> Result<Self, CodecError> {
        let malformed = |reason: String| CodecError::Malformed {
            what: "result envelope",
            reason,
        };
        let (code, payload): (u64, Value) =
            serde_json::from_value(value).map_err(|e| malformed(e.to_string()))?;
        let status =
            StatusCode::from_code(code).ok_or_else(|| malformed(format!("unknown status code {code}")))?;
        Ok(match status {
            StatusCode::Success => ResultEnvelope::Success(payload),
            StatusCode::InvalidHook => ResultEnvelope::InvalidHook,
            StatusCode::ProcedureException => match payload {
                Value::String(trace) => ResultEnvelope::ProcedureException(trace),
                other => ResultEnvelope::ProcedureException(other.to_string()),
            },
            StatusCode::CriticalError => match payload {
                Value::Bool(hook_processed) => ResultEnvelope::CriticalError { hook_processed },
                other => return Err(malformed(format!("critical error flag must be a bool, got {other}"))),
            },
        })
    }
}

/// Encode an auth layer to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(layer: &AuthLayer) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(&layer.to_value())?;
    let len = u32::try_from(json.len()).map_err(|_| CodecError::MessageTooLarge {
        size: u32::MAX,
        max: u32::MAX,
    })?;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into an auth layer.
pub fn decode_layer(body: &[u8]) -> Result<AuthLayer, CodecError> {
    let value: Value = serde_json::from_slice(body)?;
    AuthLayer::from_value(value)
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, layer: &AuthLayer) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(layer)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, rejecting bodies over `max` before reading them.
pub async fn read_frame<R>(reader: &mut R, max: u32) -> Result<AuthLayer, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(CodecError::ConnectionClosed);
        }
        Err(e) => return Err(CodecError::Io(e)),
    }

    let len = decode_length(&header);
    if len > max {
        return Err(CodecError::MessageTooLarge { size: len, max });
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    decode_layer(&body)
}
