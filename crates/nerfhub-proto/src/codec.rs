//! JSON frame codec.
//!
//! A frame is a single JSON object:
//!
//! ```json
//! {"type": "scene_update", "payload": {...}, "slot": "scene"}
//! ```
//!
//! `slot` is omitted for transient messages. A frame whose `type` is not a
//! known [`MessageKind`] decodes to [`Decoded::Unknown`] so the connection
//! can skip it without losing its place in the stream.

use serde_json::{Map, Value};

use crate::messages::{Envelope, MessageKind, SlotId, ViewerMessage};

const TYPE_FIELD: &str = "type";
const SLOT_FIELD: &str = "slot";

/// Result of decoding one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Envelope),
    /// Well-formed frame with a tag this build does not know.
    Unknown { kind: String },
}

/// Frame codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("frame `slot` must be a string")]
    InvalidSlot,
}

/// Encode an envelope as a text frame.
pub fn encode(envelope: &Envelope) -> Result<String, CodecError> {
    let mut value = serde_json::to_value(&envelope.message)?;
    if let Some(slot) = &envelope.slot {
        let object = value.as_object_mut().ok_or(CodecError::NotAnObject)?;
        object.insert(SLOT_FIELD.to_string(), Value::String(slot.as_str().to_string()));
    }
    Ok(serde_json::to_string(&value)?)
}

/// Decode a text frame.
pub fn decode(frame: &str) -> Result<Decoded, CodecError> {
    let value: Value = serde_json::from_str(frame)?;
    let Value::Object(mut object) = value else {
        return Err(CodecError::NotAnObject);
    };

    let slot = take_slot(&mut object)?;

    let tag = match object.get(TYPE_FIELD) {
        Some(Value::String(tag)) => tag.clone(),
        _ => return Err(CodecError::MissingType),
    };
    if tag.parse::<MessageKind>().is_err() {
        return Ok(Decoded::Unknown { kind: tag });
    }

    let message: ViewerMessage = serde_json::from_value(Value::Object(object))?;
    Ok(Decoded::Message(Envelope { message, slot }))
}

fn take_slot(object: &mut Map<String, Value>) -> Result<Option<SlotId>, CodecError> {
    match object.remove(SLOT_FIELD) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(slot)) => Ok(Some(SlotId::from(slot))),
        Some(_) => Err(CodecError::InvalidSlot),
    }
}
