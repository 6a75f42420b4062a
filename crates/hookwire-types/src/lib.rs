//! Core types for the Hookwire RPC substrate.
//!
//! This crate defines the data shared by the wire layer, the services built
//! on top of it, and the CLI: protocol identifiers, status codes, the client
//! error taxonomy, and configuration. It contains no I/O.

pub mod config;
pub mod error;
pub mod protocol;
