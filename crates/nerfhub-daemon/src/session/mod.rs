//! Viewer session server.
//!
//! Accepts viewer clients over WebSocket, keeps one outbound queue per
//! client, replays the persistent broadcast buffer to late joiners and
//! dispatches incoming messages to registered handlers.

mod buffer;
mod handlers;
mod server;
mod transport;
mod types;

pub use buffer::BroadcastBuffer;
pub use handlers::{Handler, HandlerRegistry};
pub use server::{SessionHandle, SessionServer, SessionStream};
pub use types::{DispatchError, ServerConfig, ServerError, ServerStats, SessionId};
