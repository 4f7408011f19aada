//! CLI command implementations.

pub mod serve;
pub mod transitions;
