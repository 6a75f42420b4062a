//! Evaluator service.
//!
//! Authenticates users against the records service, hands out bearer tokens
//! and computes an honours-eligibility verdict from a list of unit marks.

pub mod eligibility;
pub mod service;
pub mod session;

pub use eligibility::{evaluate, Evaluation, Verdict};
pub use service::EvaluatorService;
pub use session::SessionTable;
