//! Protocol identifiers shared by both ends of a connection.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the procedure every server installs for encryption negotiation.
pub const HANDSHAKE_PROCEDURE: &str = "handshake";

/// Encryption protocols a call can travel under.
///
/// The numeric id is what goes on the wire as the first element of every
/// auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionProtocol {
    /// Plaintext.
    None,
    /// RSA-OAEP transported session key + AES-256-CTR payload.
    Hybrid,
}

impl EncryptionProtocol {
    /// Wire id of this protocol.
    pub fn id(self) -> u8 {
        match self {
            EncryptionProtocol::None => 0,
            EncryptionProtocol::Hybrid => 1,
        }
    }

    /// Look up a protocol by wire id.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(EncryptionProtocol::None),
            1 => Some(EncryptionProtocol::Hybrid),
            _ => None,
        }
    }

    /// Whether payloads under this protocol are confidential.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, EncryptionProtocol::None)
    }
}

impl fmt::Display for EncryptionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionProtocol::None => write!(f, "NULL"),
            EncryptionProtocol::Hybrid => write!(f, "AES_RSA_CTR"),
        }
    }
}

/// Status code carried as the first element of every result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatusCode {
    Success = 0,
    InvalidHook = 1,
    ProcedureException = 2,
    CriticalError = 3,
}

impl StatusCode {
    /// Look up a status by wire code.
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Success),
            1 => Some(StatusCode::InvalidHook),
            2 => Some(StatusCode::ProcedureException),
            3 => Some(StatusCode::CriticalError),
            _ => None,
        }
    }

    /// Wire code of this status.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// One-line description used in server logs.
    pub fn describe(self) -> &'static str {
        match self {
            StatusCode::Success => "ok",
            StatusCode::InvalidHook => "requested a procedure that isn't hooked",
            StatusCode::ProcedureException => "the called procedure raised an error",
            StatusCode::CriticalError => "client interacted without following protocol",
        }
    }
}
