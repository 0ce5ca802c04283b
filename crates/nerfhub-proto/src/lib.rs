//! nerfhub Protocol
//!
//! Messages exchanged between the session server and connected viewer
//! clients.
//!
//! This crate contains:
//! - `ViewerMessage`, the tagged union of application events
//! - `MessageKind`, the stable tag used for handler dispatch
//! - `Envelope`, a message plus its optional replay slot
//! - the JSON frame codec (`encode` / `decode`)

pub mod codec;
pub mod messages;

pub use codec::{CodecError, Decoded, decode, encode};
pub use messages::{
    Envelope, MessageKind, SlotId, TrainingState, UnknownKind, ViewerMessage,
};
