use converge::{Reconciler, ReconcilerConfig};
use converge_memory::MemoryCloud;
use std::sync::Arc;

/// Route reconciler logs to the test harness; `RUST_LOG=converge=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Short timeouts so failing waits end quickly
pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        create_timeout_ms: 5_000,
        update_timeout_ms: 5_000,
        delete_timeout_ms: 5_000,
        consistency_timeout_ms: 2_000,
        propagation_timeout_ms: 2_000,
        poll_interval_ms: 50,
        min_poll_interval_ms: 10,
        initial_delay_ms: 0,
        continuous_target_occurrence: 1,
    }
}

pub fn setup(cloud: MemoryCloud) -> (Arc<MemoryCloud>, Reconciler) {
    setup_with(cloud, fast_config())
}

pub fn setup_with(cloud: MemoryCloud, config: ReconcilerConfig) -> (Arc<MemoryCloud>, Reconciler) {
    init_tracing();
    let cloud = Arc::new(cloud);
    let reconciler = Reconciler::new(cloud.clone(), config);
    (cloud, reconciler)
}
