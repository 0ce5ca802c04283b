//! Reconstruction workloads run by the control plane.

use std::path::PathBuf;

use crate::coordination::BlockingReporter;
use crate::launcher::JobError;

use super::types::{ExportRequest, RenderRequest, RenderResult};

/// The heavy computations behind export and render requests.
///
/// Called on a dedicated job thread. Implementations should report
/// progress through `reporter` at natural checkpoints and return as soon
/// as a report fails with a stop request; `?` does that, since
/// [`JobError`] converts from the reporter's error.
pub trait Workloads: Send + Sync + 'static {
    /// Export a point cloud; returns the written file.
    fn export_point_cloud(
        &self,
        request: &ExportRequest,
        num_points: u64,
        reporter: &BlockingReporter,
    ) -> Result<PathBuf, JobError>;

    fn render_trajectory(
        &self,
        request: &RenderRequest,
        reporter: &BlockingReporter,
    ) -> Result<RenderResult, JobError>;
}
