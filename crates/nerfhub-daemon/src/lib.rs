//! nerfhub daemon library
//!
//! - Session server fanning viewer state out to WebSocket clients
//! - SQLite coordination store: cross-process lock, progress, stop requests
//! - Job launcher for thread jobs and viewer worker processes
//! - Control plane tying the launcher to the coordination store
//! - The viewer worker the control plane launches

pub mod control;
pub mod coordination;
pub mod launcher;
pub mod session;
pub mod storage;
pub mod viewer;
