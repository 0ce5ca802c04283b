//! `nerfhub` Core Library
//!
//! Shared functionality for `nerfhub` components:
//! - Configuration resolution and hierarchy
//! - Tracing initialisation
//! - `SQLite` pool helpers for the coordination store
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
