use std::path::Path;

use tracing::debug;

/// Downstream preview/thumbnail generation, consumed as a capability.
///
/// Both operations are fire-and-forget: the dispatcher never blocks on
/// them and never treats their failure as a download failure.
pub trait AssetSink: Send + Sync {
    /// Queue review-artifact generation for a completed file.
    fn queue_generation(&self, path: &Path);

    /// Drop any preview artifacts already produced for a cancelled job.
    fn purge_previews(&self, job_id: &str);
}

/// Default sink for deployments without a preview pipeline attached.
#[derive(Debug, Default)]
pub struct NullAssetSink;

impl AssetSink for NullAssetSink {
    fn queue_generation(&self, path: &Path) {
        debug!(path = %path.display(), "no asset sink attached, skipping preview generation");
    }

    fn purge_previews(&self, job_id: &str) {
        debug!(job = %job_id, "no asset sink attached, nothing to purge");
    }
}
