#![forbid(unsafe_code)]

pub mod guard;

pub use guard::{GuardConfig, GuardRuntime, RuleDescriptor, rule_mesh};
