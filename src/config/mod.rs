//! Configuration models for the executor.

pub mod executor;

pub use executor::ExecutorConfig;
