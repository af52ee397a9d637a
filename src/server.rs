// src/server.rs

//! Backend side of the channel (`replvisor serve-backend`).
//!
//! Binds a listener, announces its address on stdout, accepts exactly one
//! connection from the supervisor and serves it until shutdown. Commands run
//! on their own tasks so that an `Abort` can reach a running command.

use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::backend::process::HANDSHAKE_PREFIX;
use crate::engine::{Action, CommandId, LineEngine, RemoteError, ScopeHandle};
use crate::transport::frame::{decode_frame, write_frame};
use crate::transport::{BackendFrame, CallId, ChannelAddress, ClientFrame, ReplyBody, Request};
use crate::types::lock;

/// Serve one supervisor connection on `bind`; returns the exit code the
/// backend process should exit with.
pub async fn serve(bind: &str) -> Result<i32> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding backend listener on {bind}"))?;
    let address = ChannelAddress::from_socket_addr(listener.local_addr()?);

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{HANDSHAKE_PREFIX}{address}")?;
        stdout.flush()?;
    }
    info!(%address, "backend listening");

    let (stream, peer) = listener
        .accept()
        .await
        .context("accepting supervisor connection")?;
    let _ = stream.set_nodelay(true);
    info!(%peer, "supervisor connected");

    Ok(serve_connection(stream).await)
}

/// Outgoing frames; `None` stops the writer once everything before it is out.
type FrameTx = mpsc::UnboundedSender<Option<BackendFrame>>;

struct Session {
    engine: Arc<Mutex<LineEngine>>,
    frames: FrameTx,
    /// Bumped on every `Abort`; running commands watch it.
    aborts: watch::Sender<u64>,
    exits: mpsc::UnboundedSender<i32>,
}

/// Serve frames from one connection until shutdown or EOF.
pub async fn serve_connection<S>(stream: S) -> i32
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (frames, mut frame_rx) = mpsc::unbounded_channel::<Option<BackendFrame>>();
    let writer = tokio::spawn(async move {
        while let Some(Some(frame)) = frame_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame).await {
                warn!(error = %e, "failed to write frame to supervisor");
                break;
            }
        }
    });

    let (exits, mut exit_rx) = mpsc::unbounded_channel();
    let (aborts, _) = watch::channel(0u64);
    let session = Session {
        engine: Arc::new(Mutex::new(LineEngine::new())),
        frames,
        aborts,
        exits,
    };

    let mut lines = BufReader::new(read_half).lines();
    let exit_code = loop {
        let next = tokio::select! {
            code = exit_rx.recv() => break code.unwrap_or(0),
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("supervisor closed the channel");
                break 0;
            }
            Err(e) => {
                warn!(error = %e, "failed to read from supervisor");
                break 1;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame = match decode_frame::<ClientFrame>(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "ignoring malformed frame");
                continue;
            }
        };

        if let Some(code) = session.handle(frame) {
            break code;
        }
    };

    let _ = session.frames.send(None);
    let _ = writer.await;
    exit_code
}

impl Session {
    /// Handle one request. Returns an exit code when the backend should stop.
    fn handle(&self, frame: ClientFrame) -> Option<i32> {
        let ClientFrame { call, request } = frame;
        debug!(call = call.0, ?request, "request");

        match request {
            Request::Hello => {
                let default_scope = lock(&self.engine).default_scope();
                self.reply(call, ReplyBody::Ready { default_scope });
            }
            Request::Start { args } => {
                let mut engine = lock(&self.engine);
                let scope = engine.default_scope();
                let body = match engine.bind(scope, "argv", args.join(" ")) {
                    Ok(()) => ReplyBody::Ack,
                    Err(err) => ReplyBody::Error(err),
                };
                drop(engine);
                self.reply(call, body);
            }
            Request::Execute {
                command,
                source,
                scope,
            } => {
                let job = Job {
                    call,
                    command,
                    source,
                    scope,
                    engine: Arc::clone(&self.engine),
                    frames: self.frames.clone(),
                    aborts: self.aborts.subscribe(),
                    exits: self.exits.clone(),
                };
                tokio::spawn(job.run());
            }
            Request::MemberNames { expression } => {
                let body = match lock(&self.engine).member_names(&expression) {
                    Ok(names) => ReplyBody::Names(names),
                    Err(err) => ReplyBody::Error(err),
                };
                self.reply(call, body);
            }
            Request::CreateScope => {
                let scope = lock(&self.engine).create_scope();
                self.reply(call, ReplyBody::Scope(scope));
            }
            Request::Abort => {
                self.aborts.send_modify(|generation| *generation += 1);
                self.reply(call, ReplyBody::Ack);
            }
            Request::Shutdown { exit_code } => {
                info!(exit_code, "shutdown requested");
                self.reply(call, ReplyBody::Ack);
                return Some(exit_code);
            }
        }
        None
    }

    fn reply(&self, call: CallId, body: ReplyBody) {
        let _ = self.frames.send(Some(BackendFrame::Reply { call, body }));
    }
}

/// One executing command.
struct Job {
    call: CallId,
    command: CommandId,
    source: String,
    scope: ScopeHandle,
    engine: Arc<Mutex<LineEngine>>,
    frames: FrameTx,
    aborts: watch::Receiver<u64>,
    exits: mpsc::UnboundedSender<i32>,
}

impl Job {
    async fn run(mut self) {
        let action = lock(&self.engine).evaluate(self.scope, &self.source);

        let mut exit = None;
        let body = match action {
            Err(err) => ReplyBody::Error(err),
            Ok(Action::Value(value)) => ReplyBody::Value(value),
            Ok(Action::Output(text)) => {
                let _ = self.frames.send(Some(BackendFrame::Output { text }));
                ReplyBody::Value(None)
            }
            Ok(Action::Sleep(duration)) => {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => ReplyBody::Value(None),
                    _ = self.aborts.changed() => ReplyBody::Error(RemoteError::interrupted()),
                }
            }
            Ok(Action::Exit(code)) => {
                exit = Some(code);
                ReplyBody::Value(None)
            }
            Ok(Action::Crash) => {
                warn!(command = %self.command, "crash requested; aborting backend process");
                std::process::abort();
            }
        };

        let _ = self.frames.send(Some(BackendFrame::Flushed {
            command: self.command,
        }));
        let _ = self.frames.send(Some(BackendFrame::Reply {
            call: self.call,
            body,
        }));

        if let Some(code) = exit {
            info!(exit_code = code, "exit requested by command");
            let _ = self.exits.send(code);
        }
    }
}
