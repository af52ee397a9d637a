// src/supervisor/runner.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::backend::{BackendFactory, BackendHost, InstanceId, StartupError};
use crate::dispatch::{CommandDispatcher, DispatchError};
use crate::transport::ChannelError;

use super::control::ControlRequest;
use super::state::{AfterExit, LoopCore, SupervisorState};
use super::SupervisorOptions;

/// The supervisor loop: create a backend, run it to completion, dispose it,
/// and start over unless told to stop.
///
/// The loop exclusively owns the current backend. Foreground requests arrive
/// on `control_rx` and are answered without ever blocking the loop on a
/// remote call: anything that talks to the backend is spawned.
pub(crate) struct SupervisorLoop {
    factory: Arc<dyn BackendFactory>,
    dispatcher: Arc<CommandDispatcher>,
    options: SupervisorOptions,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
    control_open: bool,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    core: LoopCore,
}

impl SupervisorLoop {
    pub(crate) fn new(
        factory: Arc<dyn BackendFactory>,
        dispatcher: Arc<CommandDispatcher>,
        options: SupervisorOptions,
        control_rx: mpsc::UnboundedReceiver<ControlRequest>,
        state_tx: Arc<watch::Sender<SupervisorState>>,
    ) -> Self {
        let core = LoopCore::new(options.exit_on_normal_exit);
        Self {
            factory,
            dispatcher,
            options,
            control_rx,
            control_open: true,
            state_tx,
            core,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            exit_on_normal_exit = self.options.exit_on_normal_exit,
            startup_timeout = ?self.options.startup_timeout,
            "supervisor loop started"
        );

        while !self.core.is_terminating() {
            let id = self.core.begin_attempt();
            self.publish();

            let Some(host) = self.launch(id).await else {
                if !self.core.is_terminating() {
                    self.pause(self.options.restart_delay).await;
                }
                continue;
            };

            self.core.instance_ready(id);
            self.publish();

            let exit_code = if self.core.is_terminating() {
                host.terminate(0);
                host.run(Vec::new()).await
            } else {
                info!(instance = %id, "backend instance is current");
                self.supervise(&host).await
            };

            host.dispose();
            let next = self.core.instance_exited(exit_code);
            self.publish();

            match next {
                AfterExit::Restart => info!(instance = %id, exit_code, "starting a replacement backend"),
                AfterExit::Stop => {
                    info!(instance = %id, exit_code, "backend will not be replaced");
                    break;
                }
            }
        }

        self.core.stopped();
        self.publish();
        info!("supervisor loop stopped");
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.core.state().clone());
    }

    /// Create a backend, bounded by the startup timeout. Returns `None` when
    /// startup failed or termination was requested meanwhile.
    async fn launch(&mut self, id: InstanceId) -> Option<Arc<dyn BackendHost>> {
        let factory = Arc::clone(&self.factory);
        let startup_timeout = self.options.startup_timeout;
        let create = tokio::time::timeout(startup_timeout, factory.create(id));
        tokio::pin!(create);

        loop {
            tokio::select! {
                created = &mut create => {
                    let err = match created {
                        Ok(Ok(host)) => return Some(host),
                        Ok(Err(err)) => err,
                        Err(_) => StartupError::TimedOut(startup_timeout),
                    };
                    warn!(instance = %id, error = %err, "backend startup failed");
                    return None;
                }
                request = self.control_rx.recv(), if self.control_open => {
                    self.handle_idle(request);
                    if self.core.is_terminating() {
                        info!(instance = %id, "terminate requested during startup; abandoning backend");
                        return None;
                    }
                }
            }
        }
    }

    /// Wait before the next startup attempt, still answering requests.
    async fn pause(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return,
                request = self.control_rx.recv(), if self.control_open => {
                    self.handle_idle(request);
                    if self.core.is_terminating() {
                        return;
                    }
                }
            }
        }
    }

    /// Run `host` until it exits, serving requests meanwhile.
    async fn supervise(&mut self, host: &Arc<dyn BackendHost>) -> i32 {
        let run = host.run(self.options.run_args.clone());
        tokio::pin!(run);

        loop {
            tokio::select! {
                exit_code = &mut run => {
                    if exit_code == 0 {
                        info!(instance = %host.id(), "backend exited normally");
                    } else {
                        warn!(instance = %host.id(), exit_code, "backend exited abnormally");
                    }
                    return exit_code;
                }
                request = self.control_rx.recv(), if self.control_open => {
                    self.handle_running(host, request);
                }
            }
        }
    }

    /// Requests while no backend is current.
    fn handle_idle(&mut self, request: Option<ControlRequest>) {
        let Some(request) = request else {
            self.control_closed();
            return;
        };

        match request {
            ControlRequest::BreakExecution => debug!("break requested with no current backend; ignoring"),
            ControlRequest::RestartConsole => debug!("restart requested with no current backend; ignoring"),
            ControlRequest::MemberNames { reply, .. } => {
                let _ = reply.send(Vec::new());
            }
            ControlRequest::Execute { reply, .. } => {
                let _ = reply.send(Err(DispatchError::Unreachable(ChannelError::NoBackend)));
            }
            ControlRequest::CreateScope { reply } => {
                let _ = reply.send(Err(DispatchError::Unreachable(ChannelError::NoBackend)));
            }
            ControlRequest::Terminate => self.begin_terminate(),
        }
    }

    /// Requests while `host` is running. Once termination was requested the
    /// host is no longer current and requests are treated as idle ones.
    fn handle_running(&mut self, host: &Arc<dyn BackendHost>, request: Option<ControlRequest>) {
        if self.core.current().is_none() {
            self.handle_idle(request);
            return;
        }

        let Some(request) = request else {
            self.control_closed();
            host.terminate(0);
            return;
        };

        match request {
            ControlRequest::BreakExecution => {
                let host = Arc::clone(host);
                tokio::spawn(async move {
                    if let Err(err) = host.abort_command().await {
                        debug!(instance = %host.id(), error = %err, "abort not delivered; backend likely gone");
                    }
                });
            }
            ControlRequest::RestartConsole => {
                if self.core.request_restart() {
                    info!(instance = %host.id(), "restart requested");
                    host.terminate(0);
                }
            }
            ControlRequest::MemberNames { expression, reply } => {
                let host = Arc::clone(host);
                let bound = self.options.member_lookup_timeout;
                tokio::spawn(async move {
                    let engine = host.engine();
                    let names = match timeout(bound, engine.member_names(&expression)).await {
                        Ok(Ok(names)) => names,
                        Ok(Err(err)) => {
                            debug!(instance = %host.id(), %expression, error = %err, "member lookup failed");
                            Vec::new()
                        }
                        Err(_) => {
                            debug!(instance = %host.id(), %expression, ?bound, "member lookup timed out");
                            Vec::new()
                        }
                    };
                    let _ = reply.send(names);
                });
            }
            ControlRequest::Execute { command, scope, reply } => {
                let host = Arc::clone(host);
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    let result = dispatcher.execute(host.as_ref(), command, scope).await;
                    let _ = reply.send(result);
                });
            }
            ControlRequest::CreateScope { reply } => {
                let host = Arc::clone(host);
                let dispatcher = Arc::clone(&self.dispatcher);
                tokio::spawn(async move {
                    let _ = reply.send(dispatcher.create_scope(host.as_ref()).await);
                });
            }
            ControlRequest::Terminate => {
                self.begin_terminate();
                host.terminate(0);
            }
        }
    }

    fn control_closed(&mut self) {
        debug!("all supervisor handles dropped; terminating");
        self.control_open = false;
        self.begin_terminate();
    }

    fn begin_terminate(&mut self) {
        if self.core.request_terminate() {
            info!("terminate requested");
            self.publish();
        }
    }
}
