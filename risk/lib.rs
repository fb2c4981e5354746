#![deny(dead_code)]
#![deny(unused_imports)]

//! Operative-mortality risk inference.
//!
//! Fitted additive-model experts are sampled from their coefficient posteriors,
//! chained through lactate and albumin imputation when those markers are absent,
//! and reduced to a per-patient risk distribution.

pub mod aggregate;
pub mod assets;
pub mod basis;
pub mod config;
pub mod impute;
pub mod model;
pub mod pool;
pub mod sampler;
pub mod schema;
pub mod transform;
pub mod types;
pub mod winsor;
