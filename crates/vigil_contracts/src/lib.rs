#![forbid(unsafe_code)]

pub mod common;
pub mod guard;

pub use common::{ContractViolation, CorrelationId, ReasonCodeId, SchemaVersion, Validate};
