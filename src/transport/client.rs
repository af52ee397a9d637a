// src/transport/client.rs

//! Supervisor side of a backend channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::output::OutputSink;
use crate::types::lock;

use super::frame::{decode_frame, write_frame};
use super::{BackendFrame, CallId, ChannelAddress, ChannelError, ClientFrame, ReplyBody, Request};

/// Open a channel to the backend listening at `address`.
///
/// Output and flush frames received on the channel are forwarded to `sink`.
/// The channel is considered failed if nothing arrives for `lease`.
pub async fn connect(
    address: &ChannelAddress,
    sink: OutputSink,
    lease: Duration,
) -> Result<RpcClient, ChannelError> {
    let stream = TcpStream::connect(address.authority())
        .await
        .map_err(|e| ChannelError::ConnectFailed {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
    let _ = stream.set_nodelay(true);

    debug!(%address, "channel connected");
    Ok(RpcClient::from_stream(address.clone(), stream, sink, lease))
}

/// State shared between the client handle and its reader/writer tasks.
struct Shared {
    pending: Mutex<HashMap<CallId, oneshot::Sender<ReplyBody>>>,
    failure: watch::Sender<Option<ChannelError>>,
}

impl Shared {
    /// Record the first failure and drop every pending reply slot, which
    /// wakes their callers.
    ///
    /// The failure is set while holding `pending` so a concurrent `call`
    /// either sees the failure or gets its slot drained here.
    fn fail(&self, err: ChannelError) {
        let mut pending = lock(&self.pending);
        self.failure.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(err);
                true
            } else {
                false
            }
        });
        pending.clear();
    }

    fn current_failure(&self) -> Option<ChannelError> {
        self.failure.borrow().clone()
    }

    fn deliver(&self, frame: BackendFrame, sink: &OutputSink) {
        match frame {
            BackendFrame::Reply { call, body } => match lock(&self.pending).remove(&call) {
                Some(slot) => {
                    let _ = slot.send(body);
                }
                None => debug!(call = call.0, "reply for unknown call dropped"),
            },
            BackendFrame::Output { text } => sink.text(text),
            BackendFrame::Flushed { command } => sink.flushed(command),
        }
    }
}

async fn wait_failed(rx: &mut watch::Receiver<Option<ChannelError>>) {
    let _ = rx.wait_for(Option::is_some).await;
}

/// Proxy for calls into a backend process.
///
/// Each call either returns the backend's reply or fails with a
/// [`ChannelError`]; it never hangs past the failure of the channel.
pub struct RpcClient {
    address: ChannelAddress,
    next_call: AtomicU64,
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    shared: Arc<Shared>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("address", &self.address)
            .field("failure", &self.shared.current_failure())
            .finish_non_exhaustive()
    }
}

impl RpcClient {
    /// Wrap an already-connected stream. Spawns the reader and writer tasks.
    pub fn from_stream<S>(address: ChannelAddress, stream: S, sink: OutputSink, lease: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (failure, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            failure,
        });

        tokio::spawn(write_loop(write_half, outgoing_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(read_half, Arc::clone(&shared), sink, lease));

        Self {
            address,
            next_call: AtomicU64::new(1),
            outgoing,
            shared,
        }
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.address
    }

    pub async fn call(&self, request: Request) -> Result<ReplyBody, ChannelError> {
        let call = CallId(self.next_call.fetch_add(1, Ordering::Relaxed));
        let (slot, reply) = oneshot::channel();

        {
            let mut pending = lock(&self.shared.pending);
            if let Some(err) = self.shared.current_failure() {
                return Err(err);
            }
            pending.insert(call, slot);
        }

        trace!(call = call.0, ?request, "sending call");
        if self.outgoing.send(ClientFrame { call, request }).is_err() {
            lock(&self.shared.pending).remove(&call);
            return Err(self.failure().unwrap_or(ChannelError::Disconnected));
        }

        reply
            .await
            .map_err(|_| self.failure().unwrap_or(ChannelError::Disconnected))
    }

    /// The failure that closed this channel, if it has failed.
    pub fn failure(&self) -> Option<ChannelError> {
        self.shared.current_failure()
    }

    pub fn is_open(&self) -> bool {
        self.failure().is_none()
    }

    /// Resolves once the channel has failed or been closed.
    pub async fn closed(&self) -> ChannelError {
        let mut rx = self.shared.failure.subscribe();
        let failure = rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|slot| slot.clone());
        failure.unwrap_or(ChannelError::Disconnected)
    }

    /// Tear the channel down. Pending and future calls fail with
    /// `ChannelError::Disconnected`.
    pub fn close(&self) {
        self.shared.fail(ChannelError::Disconnected);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop<R>(reader: R, shared: Arc<Shared>, sink: OutputSink, lease: Duration)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut failure = shared.failure.subscribe();

    let err = loop {
        let next = tokio::select! {
            _ = wait_failed(&mut failure) => return,
            next = timeout(lease, lines.next_line()) => next,
        };

        let line = match next {
            Err(_) => break ChannelError::LeaseExpired(lease),
            Ok(Err(e)) => break ChannelError::Io(e.to_string()),
            Ok(Ok(None)) => break ChannelError::Disconnected,
            Ok(Ok(Some(line))) => line,
        };

        if line.trim().is_empty() {
            continue;
        }

        match decode_frame::<BackendFrame>(&line) {
            Ok(frame) => shared.deliver(frame, &sink),
            Err(e) => break ChannelError::Serialization(e.to_string()),
        }
    };

    debug!(error = %err, "channel reader stopped");
    shared.fail(err);
}

async fn write_loop<W>(mut writer: W, mut outgoing: mpsc::UnboundedReceiver<ClientFrame>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    let mut failure = shared.failure.subscribe();

    loop {
        let frame = tokio::select! {
            _ = wait_failed(&mut failure) => break,
            frame = outgoing.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "channel writer failed");
            shared.fail(ChannelError::Io(e.to_string()));
            break;
        }
    }

    let _ = writer.shutdown().await;
}
