//! Infrastructure layer: job persistence, scheduling and execution, config.

pub mod config;
pub mod jobs;

mod integration_tests;
