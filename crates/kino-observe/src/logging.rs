use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `KINO_LOG` first, then
/// `RUST_LOG`, then a default.
///
/// Log field contract for pipeline workers:
/// - Always include `rank` and the worker id when available.
/// - Include `item` (the work-item index) on any per-item event.
/// - Include `group` on evaluator-chain events.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("KINO_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
