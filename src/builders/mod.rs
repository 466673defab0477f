//! Builders to construct executor components from configuration.

pub mod limiter_builder;

pub use limiter_builder::build_rate_limiter;
