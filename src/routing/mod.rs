//! Provider selection: the pure strategy engine and the orchestrating router.
//!
//! [`strategy`] ranks eligible candidates from precomputed telemetry and is
//! free of I/O; [`router`] owns the registry, resolves credentials, performs
//! the fallback walk, and feeds telemetry and the ledger.

pub mod router;
pub mod strategy;

pub use router::{Router, RouterBuilder};
pub use strategy::{Candidate, RoutingRule, RuleCondition, RuleScope, Strategy};
