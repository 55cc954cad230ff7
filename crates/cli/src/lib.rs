//! espota server library: configuration, logging, HTTP routing and the
//! server lock, shared by the `espota` binary and its integration tests.

pub mod config;
pub mod locks;
pub mod logging;
pub mod server;
pub mod util;

pub use config::Config;
pub use server::{router, AppState};
