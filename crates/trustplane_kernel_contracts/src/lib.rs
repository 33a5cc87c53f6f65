#![forbid(unsafe_code)]

pub mod common;
pub mod context;
pub mod egress;
pub mod plan;
pub mod retrieval;
pub mod safety_case;
pub mod trace;

pub use common::{
    validate_token, ContractViolation, SchemaVersion, UnixTimeMs, Validate,
};
