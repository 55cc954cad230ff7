//! CLI command implementations

pub mod app;
pub mod config;
pub mod device;
pub mod serve;
