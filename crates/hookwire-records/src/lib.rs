//! Records service.
//!
//! A flat-file store of users (argon2-hashed passwords) and their unit
//! results, exposed as the `check_credentials`, `get_results` and
//! `set_results` hooks.

pub mod service;
pub mod store;

pub use service::{RecordsService, SERVICE_TOKEN_ARG};
pub use store::{RecordStore, StoreError, UnitResult, UserSummary};
