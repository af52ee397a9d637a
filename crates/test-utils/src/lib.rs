pub mod builders;
pub mod fake_backend;

use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

use replvisor::backend::InstanceId;
use replvisor::dispatch::CommandDispatcher;
use replvisor::output::{spawn_output_pump, ConsoleOutput};
use replvisor::supervisor::{RestartSupervisor, SupervisorOptions};

use crate::fake_backend::{FakeBackend, FakeBackendFactory};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// Console output collected in memory.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    text: Arc<Mutex<String>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        self.text.lock().unwrap().clone()
    }
}

impl ConsoleOutput for CapturedOutput {
    fn write(&mut self, text: &str) {
        self.text.lock().unwrap().push_str(text);
    }
}

/// A supervisor wired to fake backends and captured output.
pub struct Harness {
    pub supervisor: Arc<RestartSupervisor>,
    pub factory: Arc<FakeBackendFactory>,
    pub output: CapturedOutput,
}

impl Harness {
    /// Build (but do not start) a supervisor. `configure` runs before the
    /// first startup attempt can happen.
    pub fn new(options: SupervisorOptions, configure: impl FnOnce(&FakeBackendFactory)) -> Self {
        let output = CapturedOutput::default();
        let (sink, barrier) = spawn_output_pump(output.clone());
        let factory = Arc::new(FakeBackendFactory::new(sink));
        configure(&factory);

        let dispatcher = Arc::new(CommandDispatcher::new(barrier));
        let supervisor = Arc::new(RestartSupervisor::new(
            Arc::clone(&factory) as _,
            dispatcher,
            options,
        ));

        Self {
            supervisor,
            factory,
            output,
        }
    }

    /// Build and start a supervisor.
    pub fn started(options: SupervisorOptions, configure: impl FnOnce(&FakeBackendFactory)) -> Self {
        let harness = Self::new(options, configure);
        harness.supervisor.start().expect("supervisor start");
        harness
    }

    /// Wait for a current backend and return it.
    pub async fn current(&self) -> Arc<FakeBackend> {
        let id = self
            .supervisor
            .wait_for_instance(Duration::from_secs(5))
            .await
            .expect("no backend became current");
        self.backend(id)
    }

    /// Wait for a current backend other than `previous`.
    pub async fn replacement_of(&self, previous: InstanceId) -> Arc<FakeBackend> {
        let state = self
            .supervisor
            .wait_for_state(Duration::from_secs(5), |s| {
                s.current.is_some_and(|id| id != previous)
            })
            .await
            .expect("no replacement backend became current");
        self.backend(state.current.expect("current instance"))
    }

    pub fn backend(&self, id: InstanceId) -> Arc<FakeBackend> {
        self.factory.backend(id).expect("backend was created by the factory")
    }
}
