#![allow(dead_code)]

pub use replvisor_test_utils::builders;
pub use replvisor_test_utils::fake_backend::{FakeBackend, FakeBackendFactory, StartupStep};
pub use replvisor_test_utils::{init_tracing, with_timeout, CapturedOutput, Harness};

use std::time::Duration;

/// Poll `condition` every 10ms until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
