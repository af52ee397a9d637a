//! In-process fake backends.
//!
//! `FakeBackendFactory` hands out `FakeBackend`s that never spawn a process.
//! Tests drive them directly: make one crash or exit, fail its channel, or
//! script how startup attempts behave.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::debug;

use replvisor::backend::{BackendFactory, BackendHost, InstanceId, StartupError};
use replvisor::engine::{
    CallError, CallResult, ExecutionEngine, PendingCommand, RemoteError, ScopeHandle,
};
use replvisor::output::OutputSink;
use replvisor::transport::ChannelError;
use replvisor::types::BoxFuture;

/// How one startup attempt behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    Succeed,
    Fail,
    /// Never completes; only the startup timeout or a terminate ends it.
    Hang,
}

pub struct FakeBackendFactory {
    sink: OutputSink,
    script: Mutex<VecDeque<StartupStep>>,
    created: Mutex<Vec<Arc<FakeBackend>>>,
    attempts: AtomicUsize,
    overlapped: AtomicBool,
    output_delay: Mutex<Duration>,
}

impl FakeBackendFactory {
    pub fn new(sink: OutputSink) -> Self {
        Self {
            sink,
            script: Mutex::new(VecDeque::new()),
            created: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            output_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Queue startup behaviour for the next attempts. Once the script runs
    /// out every attempt succeeds.
    pub fn script(&self, steps: impl IntoIterator<Item = StartupStep>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Delay before a `print` command's output reaches the pump.
    pub fn set_output_delay(&self, delay: Duration) {
        *self.output_delay.lock().unwrap() = delay;
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn backends(&self) -> Vec<Arc<FakeBackend>> {
        self.created.lock().unwrap().clone()
    }

    pub fn backend(&self, id: InstanceId) -> Option<Arc<FakeBackend>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    /// True if a backend was ever created while an earlier one was not yet
    /// disposed.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }
}

impl BackendFactory for FakeBackendFactory {
    fn create(&self, id: InstanceId) -> BoxFuture<'_, Result<Arc<dyn BackendHost>, StartupError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(StartupStep::Succeed);
            debug!(instance = %id, ?step, "fake startup");

            match step {
                StartupStep::Succeed => {}
                StartupStep::Fail => {
                    return Err(StartupError::Spawn("scripted startup failure".to_string()));
                }
                StartupStep::Hang => std::future::pending::<()>().await,
            }

            let delay = *self.output_delay.lock().unwrap();
            let backend = Arc::new(FakeBackend::new(id, self.sink.clone(), delay));

            let mut created = self.created.lock().unwrap();
            if created.iter().any(|b| !b.is_disposed()) {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            created.push(Arc::clone(&backend));
            drop(created);

            Ok(backend as Arc<dyn BackendHost>)
        })
    }
}

pub struct FakeBackend {
    id: InstanceId,
    engine: Arc<FakeEngine>,
    exit: watch::Sender<Option<i32>>,
    channel: Arc<watch::Sender<Option<ChannelError>>>,
    terminate_codes: Mutex<Vec<i32>>,
    run_args: Mutex<Option<Vec<String>>>,
    disposed: AtomicBool,
}

impl FakeBackend {
    fn new(id: InstanceId, sink: OutputSink, output_delay: Duration) -> Self {
        let (exit, _) = watch::channel(None);
        let channel = Arc::new(watch::channel(None).0);
        let engine = Arc::new(FakeEngine::new(sink, output_delay, Arc::clone(&channel)));
        Self {
            id,
            engine,
            exit,
            channel,
            terminate_codes: Mutex::new(Vec::new()),
            run_args: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn fake_engine(&self) -> &Arc<FakeEngine> {
        &self.engine
    }

    /// The backend process exits on its own with `code`.
    pub fn exit(&self, code: i32) {
        self.fail_channel(ChannelError::Disconnected);
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(code);
            true
        });
    }

    /// The backend process dies abruptly.
    pub fn crash(&self) {
        self.exit(-1);
    }

    /// Break the channel without the process exiting.
    pub fn fail_channel(&self, err: ChannelError) {
        self.channel.send_if_modified(|failure| {
            if failure.is_some() {
                return false;
            }
            *failure = Some(err);
            true
        });
    }

    pub fn terminate_codes(&self) -> Vec<i32> {
        self.terminate_codes.lock().unwrap().clone()
    }

    pub fn run_args(&self) -> Option<Vec<String>> {
        self.run_args.lock().unwrap().clone()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

impl BackendHost for FakeBackend {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn engine(&self) -> Arc<dyn ExecutionEngine> {
        Arc::clone(&self.engine) as Arc<dyn ExecutionEngine>
    }

    fn default_scope(&self) -> ScopeHandle {
        ScopeHandle(1)
    }

    fn is_alive(&self) -> bool {
        !self.has_exited() && !self.is_disposed()
    }

    fn closed(&self) -> BoxFuture<'_, ChannelError> {
        let rx = self.channel.subscribe();
        Box::pin(channel_failed(rx))
    }

    fn run(&self, args: Vec<String>) -> BoxFuture<'_, i32> {
        *self.run_args.lock().unwrap() = Some(args);
        let mut exit = self.exit.subscribe();
        Box::pin(async move {
            let code = exit.wait_for(Option::is_some).await.ok().and_then(|c| *c);
            code.unwrap_or(-1)
        })
    }

    fn abort_command(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            if let Some(err) = self.channel.borrow().clone() {
                return Err(err);
            }
            self.engine.abort();
            Ok(())
        })
    }

    fn terminate(&self, exit_code: i32) {
        self.terminate_codes.lock().unwrap().push(exit_code);
        self.exit(exit_code);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exit(-1);
    }
}

/// Engine behind a `FakeBackend`.
///
/// Commands:
///
/// ```text
/// print TEXT    output TEXT (after the configured delay), value None
/// raise MSG     RuntimeError MSG
/// hang          block until aborted (Interrupted) or the channel fails
/// anything else value is the source text itself
/// ```
///
/// Member lookups: `""` lists `alpha` and `beta`, `hang` never answers until
/// the channel fails, anything else is a NameError.
pub struct FakeEngine {
    sink: OutputSink,
    output_delay: Duration,
    channel: Arc<watch::Sender<Option<ChannelError>>>,
    aborts: watch::Sender<u64>,
    abort_count: AtomicUsize,
    executed: Mutex<Vec<String>>,
    next_scope: AtomicU64,
}

impl FakeEngine {
    fn new(sink: OutputSink, output_delay: Duration, channel: Arc<watch::Sender<Option<ChannelError>>>) -> Self {
        Self {
            sink,
            output_delay,
            channel,
            aborts: watch::channel(0).0,
            abort_count: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
            next_scope: AtomicU64::new(2),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn abort_count(&self) -> usize {
        self.abort_count.load(Ordering::SeqCst)
    }

    fn abort(&self) {
        self.abort_count.fetch_add(1, Ordering::SeqCst);
        self.aborts.send_modify(|generation| *generation += 1);
    }

    fn check_channel(&self) -> Result<(), ChannelError> {
        match self.channel.borrow().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl ExecutionEngine for FakeEngine {
    fn execute(&self, pending: PendingCommand) -> BoxFuture<'_, CallResult<Option<String>>> {
        Box::pin(async move {
            self.check_channel()?;

            let id = pending.id;
            let source = pending.command.source().trim().to_string();
            self.executed.lock().unwrap().push(source.clone());

            if let Some(text) = source.strip_prefix("print ") {
                let sink = self.sink.clone();
                let text = format!("{text}\n");
                let delay = self.output_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    sink.text(text);
                    sink.flushed(id);
                });
                return Ok(None);
            }

            if let Some(message) = source.strip_prefix("raise ") {
                self.sink.flushed(id);
                return Err(CallError::Remote(RemoteError::runtime(message)));
            }

            if source == "hang" {
                let mut aborts = self.aborts.subscribe();
                let failed = channel_failed(self.channel.subscribe());
                return tokio::select! {
                    _ = aborts.changed() => {
                        self.sink.flushed(id);
                        Err(CallError::Remote(RemoteError::interrupted()))
                    }
                    err = failed => Err(CallError::Channel(err)),
                };
            }

            self.sink.flushed(id);
            Ok(Some(source))
        })
    }

    fn member_names(&self, expression: &str) -> BoxFuture<'_, CallResult<Vec<String>>> {
        let expression = expression.trim().to_string();
        Box::pin(async move {
            self.check_channel()?;
            if expression == "hang" {
                return Err(CallError::Channel(channel_failed(self.channel.subscribe()).await));
            }
            if expression.is_empty() {
                Ok(vec!["alpha".to_string(), "beta".to_string()])
            } else {
                Err(CallError::Remote(RemoteError::name_error(&expression)))
            }
        })
    }

    fn create_scope(&self) -> BoxFuture<'_, CallResult<ScopeHandle>> {
        Box::pin(async move {
            self.check_channel()?;
            Ok(ScopeHandle(self.next_scope.fetch_add(1, Ordering::SeqCst)))
        })
    }
}

async fn channel_failed(mut rx: watch::Receiver<Option<ChannelError>>) -> ChannelError {
    let failure = rx.wait_for(Option::is_some).await.ok().and_then(|f| f.clone());
    failure.unwrap_or(ChannelError::Disconnected)
}
