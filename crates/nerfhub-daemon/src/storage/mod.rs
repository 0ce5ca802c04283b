//! `SQLite` coordination store for nerfhub.
//!
//! Holds the distributed locks, job progress and stop markers shared by the
//! control plane and every worker process that opens the same file.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
