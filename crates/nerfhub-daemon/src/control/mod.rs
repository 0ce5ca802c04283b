//! Control plane: export, render and viewer requests over the launcher
//! and the coordination store.

mod plane;
mod registry;
mod types;
mod workloads;

pub use plane::{ControlPlane, ControlSettings};
pub use registry::{ViewerEntry, ViewerRegistry};
pub use types::{
    ControlError, ControlResponse, ExportRequest, ExportResult, OutputFormat, RenderRequest,
    RenderResult, ResponseCode, StartViewerRequest, Trajectory, ViewerInfo,
};
pub use workloads::Workloads;
