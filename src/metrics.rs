use crate::models::Retailer;
use crate::pipeline::RunOutcome;
use std::time::Duration;
use tracing::trace;

// Counters are emitted as trace events under one target; a subscriber can
// aggregate them by event name.

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

pub fn image_received(route: &'static str, mime: &str, encoded_bytes: usize) {
    trace!(
        target = "outfit.metrics",
        route,
        mime,
        encoded_bytes,
        "images_received_total_inc"
    );
}

/// `items` is `None` when the vision call failed.
pub fn decompose_elapsed(items: Option<usize>, elapsed: Duration) {
    trace!(
        target = "outfit.metrics",
        ok = items.is_some(),
        items = items.unwrap_or(0),
        elapsed_ms = millis(elapsed),
        "decompose_elapsed"
    );
}

pub fn previews_elapsed(links: usize, concurrency: usize, elapsed: Duration) {
    trace!(
        target = "outfit.metrics",
        links,
        concurrency,
        elapsed_ms = millis(elapsed),
        "previews_elapsed"
    );
}

pub fn run_settled(outcome: &RunOutcome, elapsed: Duration) {
    let elapsed_ms = millis(elapsed);
    match *outcome {
        RunOutcome::Completed {
            items,
            products,
            fallbacks,
        } => trace!(
            target = "outfit.metrics",
            items,
            products,
            fallbacks,
            elapsed_ms,
            "runs_completed_total_inc"
        ),
        RunOutcome::Failed => {
            trace!(target = "outfit.metrics", elapsed_ms, "runs_failed_total_inc")
        }
        RunOutcome::Abandoned => {
            trace!(target = "outfit.metrics", elapsed_ms, "runs_abandoned_total_inc")
        }
    }
}

pub fn preview_fallback(retailer: Retailer, reason: &'static str) {
    trace!(
        target = "outfit.metrics",
        retailer = retailer.name(),
        reason,
        "preview_fallback_total_inc"
    );
}

pub fn stylist_call(feature: &'static str, images: usize, ok: bool, elapsed: Duration) {
    trace!(
        target = "outfit.metrics",
        feature,
        images,
        ok,
        elapsed_ms = millis(elapsed),
        "stylist_calls_total_inc"
    );
}

pub fn sessions_expired(expired: usize, remaining: usize) {
    trace!(
        target = "outfit.metrics",
        expired,
        remaining,
        "sessions_expired_total_inc"
    );
}
