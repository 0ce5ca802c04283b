//! Application messages carried over the viewer channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Training lifecycle shown by viewer clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingState {
    Training,
    Paused,
    Completed,
}

/// Every event the server and clients exchange.
///
/// On the wire each variant is `{"type": "<kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ViewerMessage {
    /// Scene metadata after a checkpoint load or training step.
    SceneUpdate {
        step: u64,
        camera_count: u32,
        /// Axis-aligned scene bounds as `[min, max]`.
        #[serde(default)]
        scene_box: Option<[[f64; 3]; 2]>,
    },
    /// A GUI control changed value, in either direction.
    GuiUpdate {
        id: String,
        value: serde_json::Value,
    },
    /// Camera pose reported by a client.
    PositionUpdate {
        position: [f64; 3],
        wxyz: [f64; 4],
        fov: f64,
        aspect: f64,
    },
    TrainingStateUpdate {
        state: TrainingState,
    },
    /// A rendered frame.
    BackgroundImage {
        media_type: String,
        base64_data: String,
    },
    /// A camera path saved from a client, keyed by its file name.
    CameraPathPayload {
        camera_path_filename: String,
        camera_path: serde_json::Value,
    },
    /// Free-form status line (render resolution, step counter).
    StatusUpdate {
        eval_res: String,
        step: u64,
    },
}

impl ViewerMessage {
    /// Dispatch tag for this message.
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::SceneUpdate { .. } => MessageKind::SceneUpdate,
            Self::GuiUpdate { .. } => MessageKind::GuiUpdate,
            Self::PositionUpdate { .. } => MessageKind::PositionUpdate,
            Self::TrainingStateUpdate { .. } => MessageKind::TrainingStateUpdate,
            Self::BackgroundImage { .. } => MessageKind::BackgroundImage,
            Self::CameraPathPayload { .. } => MessageKind::CameraPathPayload,
            Self::StatusUpdate { .. } => MessageKind::StatusUpdate,
        }
    }
}

/// Stable type tag of a [`ViewerMessage`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    SceneUpdate,
    GuiUpdate,
    PositionUpdate,
    TrainingStateUpdate,
    BackgroundImage,
    CameraPathPayload,
    StatusUpdate,
}

impl MessageKind {
    pub const ALL: [Self; 7] = [
        Self::SceneUpdate,
        Self::GuiUpdate,
        Self::PositionUpdate,
        Self::TrainingStateUpdate,
        Self::BackgroundImage,
        Self::CameraPathPayload,
        Self::StatusUpdate,
    ];

    /// Wire spelling of the tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SceneUpdate => "scene_update",
            Self::GuiUpdate => "gui_update",
            Self::PositionUpdate => "position_update",
            Self::TrainingStateUpdate => "training_state_update",
            Self::BackgroundImage => "background_image",
            Self::CameraPathPayload => "camera_path_payload",
            Self::StatusUpdate => "status_update",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag that names no known [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKind(pub String);

impl fmt::Display for UnknownKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown message type: {}", self.0)
    }
}

impl std::error::Error for UnknownKind {}

impl FromStr for MessageKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}

/// Name of a replay slot in the broadcast buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SlotId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SlotId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A message as queued for delivery, optionally pinned to a replay slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: ViewerMessage,
    pub slot: Option<SlotId>,
}

impl Envelope {
    /// A live-only message; late joiners never see it.
    pub const fn transient(message: ViewerMessage) -> Self {
        Self {
            message,
            slot: None,
        }
    }

    /// A message retained as the latest value of `slot`.
    pub fn persistent(slot: impl Into<SlotId>, message: ViewerMessage) -> Self {
        Self {
            message,
            slot: Some(slot.into()),
        }
    }

    pub const fn kind(&self) -> MessageKind {
        self.message.kind()
    }
}

impl From<ViewerMessage> for Envelope {
    fn from(message: ViewerMessage) -> Self {
        Self::transient(message)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip_through_strings() {
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = "camera_frustum".parse::<MessageKind>().unwrap_err();
        assert_eq!(err, UnknownKind("camera_frustum".to_string()));
    }

    #[test]
    fn serde_tag_matches_kind_tag() {
        let msg = ViewerMessage::TrainingStateUpdate {
            state: TrainingState::Completed,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], msg.kind().as_str());
        assert_eq!(value["payload"]["state"], "completed");
    }
}
