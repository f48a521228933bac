//! Submission counters: hits per route, time spent in each intake stage
//! (`upload_images`, `write_record`, `notify`, `submit_form`) and images
//! relayed versus dropped. Emitted as trace events under
//! `appraisal.metrics`; `RUST_LOG=appraisal.metrics=trace` shows them.

use tracing::trace;

pub fn inc_requests(route: &'static str) {
    trace!(
        target: "appraisal.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn stage_elapsed(stage: &'static str, elapsed_ms: u128) {
    trace!(
        target: "appraisal.metrics",
        stage = stage,
        elapsed_ms = elapsed_ms as u64,
        "stage_elapsed"
    );
}

/// One event per relay batch, after the last upload attempt.
pub fn images_relayed(succeeded: usize, failed: usize) {
    trace!(
        target: "appraisal.metrics",
        succeeded = succeeded as u64,
        failed = failed as u64,
        "images_relayed"
    );
}
