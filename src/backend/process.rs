// src/backend/process.rs

//! Backend hosted in a child process.
//!
//! Startup protocol:
//! 1. spawn `program args` with stdout/stderr piped (`kill_on_drop`),
//! 2. read `listening tcp://HOST:PORT` from the child's stdout,
//! 3. connect a channel to that address,
//! 4. `Hello` call, which returns the default scope.
//!
//! Dropping a half-finished launch kills the child, so the supervisor can
//! bound startup with a plain timeout.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::engine::{ExecutionEngine, RemoteEngine, ScopeHandle};
use crate::output::OutputSink;
use crate::transport::{self, ChannelAddress, ChannelError, ReplyBody, Request, RpcClient};
use crate::types::{lock, BoxFuture};

use super::{BackendFactory, BackendHost, InstanceId, StartupError};

/// Prefix of the handshake line a backend prints on stdout.
pub const HANDSHAKE_PREFIX: &str = "listening ";

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Idle lease on the channel.
    pub lease_timeout: Duration,
    /// Time a backend gets to exit after `terminate` before it is killed.
    pub terminate_grace: Duration,
}

impl ProcessOptions {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            lease_timeout: transport::DEFAULT_LEASE,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Spawns [`ProcessBackend`]s.
pub struct ProcessBackendFactory {
    options: ProcessOptions,
    sink: OutputSink,
}

impl ProcessBackendFactory {
    pub fn new(options: ProcessOptions, sink: OutputSink) -> Self {
        Self { options, sink }
    }
}

impl BackendFactory for ProcessBackendFactory {
    fn create(&self, id: InstanceId) -> BoxFuture<'_, Result<Arc<dyn BackendHost>, StartupError>> {
        Box::pin(async move {
            let backend = ProcessBackend::launch(id, &self.options, self.sink.clone()).await?;
            Ok(Arc::new(backend) as Arc<dyn BackendHost>)
        })
    }
}

pub struct ProcessBackend {
    id: InstanceId,
    client: Arc<RpcClient>,
    engine: Arc<RemoteEngine>,
    default_scope: ScopeHandle,
    child: Mutex<Option<Child>>,
    terminate_tx: watch::Sender<Option<i32>>,
    terminate_grace: Duration,
    disposed: AtomicBool,
}

impl ProcessBackend {
    async fn launch(id: InstanceId, options: &ProcessOptions, sink: OutputSink) -> Result<Self, StartupError> {
        info!(
            instance = %id,
            program = %options.program.display(),
            args = ?options.args,
            "spawning backend process"
        );

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| StartupError::Spawn(format!("{}: {e}", options.program.display())))?;

        // Always consume stderr so buffers don't fill; log at debug.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(instance = %id, "backend stderr: {}", line);
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StartupError::Handshake("backend stdout was not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let address = read_handshake(&mut lines).await?;

        // Anything the backend prints on stdout afterwards is not part of the
        // protocol; keep draining it.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(instance = %id, "backend stdout: {}", line);
            }
        });

        let client = Arc::new(transport::connect(&address, sink, options.lease_timeout).await?);
        let default_scope = match client.call(Request::Hello).await? {
            ReplyBody::Ready { default_scope } => default_scope,
            other => {
                return Err(StartupError::Handshake(format!(
                    "unexpected reply to hello: {other:?}"
                )));
            }
        };

        info!(instance = %id, %address, pid = ?child.id(), "backend ready");

        let (terminate_tx, _) = watch::channel(None);
        Ok(Self {
            id,
            engine: Arc::new(RemoteEngine::new(Arc::clone(&client))),
            client,
            default_scope,
            child: Mutex::new(Some(child)),
            terminate_tx,
            terminate_grace: options.terminate_grace,
            disposed: AtomicBool::new(false),
        })
    }

    async fn wait_terminate(&self) -> i32 {
        let mut rx = self.terminate_tx.subscribe();
        let code = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| *slot);
        code.unwrap_or(0)
    }

    /// Ask the backend to shut down and give it `terminate_grace` to do so
    /// before killing it.
    async fn stop_child(&self, child: &mut Child, exit_code: i32) -> std::io::Result<ExitStatus> {
        let graceful = async {
            if let Err(err) = self.client.call(Request::Shutdown { exit_code }).await {
                debug!(instance = %self.id, error = %err, "shutdown request failed");
            }
            child.wait().await
        };

        let result = timeout(self.terminate_grace, graceful).await;
        match result {
            Ok(status) => status,
            Err(_) => {
                warn!(
                    instance = %self.id,
                    grace = ?self.terminate_grace,
                    "backend did not exit in time; killing process"
                );
                child.kill().await?;
                child.wait().await
            }
        }
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    ChannelLost(ChannelError),
    Terminate(i32),
}

impl BackendHost for ProcessBackend {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn engine(&self) -> Arc<dyn ExecutionEngine> {
        Arc::clone(&self.engine) as Arc<dyn ExecutionEngine>
    }

    fn default_scope(&self) -> ScopeHandle {
        self.default_scope
    }

    fn is_alive(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.client.is_open()
    }

    fn closed(&self) -> BoxFuture<'_, ChannelError> {
        Box::pin(self.client.closed())
    }

    fn run(&self, args: Vec<String>) -> BoxFuture<'_, i32> {
        Box::pin(async move {
            let Some(mut child) = lock(&self.child).take() else {
                warn!(instance = %self.id, "run called on a backend that is not available");
                return -1;
            };

            // The start reply is raced against everything that ends the run,
            // so a backend that stops answering can still be terminated.
            let start = self.client.call(Request::Start { args });
            tokio::pin!(start);
            let mut starting = true;

            let ending = loop {
                tokio::select! {
                    reply = &mut start, if starting => {
                        starting = false;
                        match reply {
                            Ok(ReplyBody::Ack) => debug!(instance = %self.id, "backend started"),
                            Ok(other) => debug!(instance = %self.id, reply = ?other, "unexpected reply to start"),
                            Err(err) => debug!(instance = %self.id, error = %err, "start request failed"),
                        }
                    }
                    status = child.wait() => break Ending::Exited(status),
                    err = self.client.closed() => break Ending::ChannelLost(err),
                    code = self.wait_terminate() => break Ending::Terminate(code),
                }
            };

            let status = match ending {
                Ending::Exited(status) => status,
                Ending::ChannelLost(err) => {
                    warn!(instance = %self.id, error = %err, "backend channel failed; killing process");
                    match child.kill().await {
                        Ok(()) => child.wait().await,
                        Err(e) => Err(e),
                    }
                }
                Ending::Terminate(code) => {
                    info!(instance = %self.id, exit_code = code, "terminating backend");
                    self.stop_child(&mut child, code).await
                }
            };

            match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    warn!(instance = %self.id, error = %err, "could not collect backend exit status");
                    -1
                }
            }
        })
    }

    fn abort_command(&self) -> BoxFuture<'_, Result<(), ChannelError>> {
        Box::pin(async move {
            match self.client.call(Request::Abort).await? {
                ReplyBody::Ack => Ok(()),
                _ => Err(ChannelError::UnexpectedReply("abort")),
            }
        })
    }

    fn terminate(&self, exit_code: i32) {
        self.terminate_tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(exit_code);
                true
            } else {
                false
            }
        });
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(instance = %self.id, "disposing backend");
        self.client.close();
        if let Some(mut child) = lock(&self.child).take() {
            if let Err(err) = child.start_kill() {
                debug!(instance = %self.id, error = %err, "backend process already gone");
            }
        }
    }
}

async fn read_handshake<R>(lines: &mut Lines<BufReader<R>>) -> Result<ChannelAddress, StartupError>
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match line.trim().strip_prefix(HANDSHAKE_PREFIX) {
                Some(address) => return Ok(ChannelAddress::parse(address)?),
                None => debug!("backend stdout before handshake: {}", line),
            },
            Ok(None) => {
                return Err(StartupError::Handshake(
                    "backend exited before announcing its address".to_string(),
                ));
            }
            Err(e) => return Err(StartupError::Handshake(e.to_string())),
        }
    }
}
