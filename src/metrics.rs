use tracing::trace;

// Lightweight metrics helpers that stay safe without a recorder installed.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "vitrine.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn tier_elapsed(tier: &'static str, elapsed_ms: u128) {
    trace!(
        target = "vitrine.metrics",
        tier = tier,
        elapsed_ms = elapsed_ms as u64,
        "tier_elapsed"
    );
}

pub fn tier_hit(tier: &'static str) {
    trace!(target = "vitrine.metrics", tier = tier, "tier_hit");
}
