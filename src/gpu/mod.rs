//! Device naming.
//!
//! - [`device`]: Device identifiers (`cuda`, `cuda:1`, `cpu`, ...)

pub mod device;
