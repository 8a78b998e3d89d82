//! Playrun daemon library
//!
//! This module provides the components behind `playrund`:
//! - REST handlers over the runner core
//! - Server-sent event streaming of live runs
//! - Configuration loading and server lifecycle

pub mod api;
pub mod config;
pub mod error;
pub mod server;

pub use api::create_router;
pub use config::DaemonConfig;
pub use error::{ApiError, DaemonError};
pub use server::Server;
