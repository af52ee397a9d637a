// src/transport/frame.rs

//! Wire frames exchanged over a backend channel.
//!
//! Every frame is one line of JSON. The supervisor sends [`ClientFrame`]s;
//! the backend answers with [`BackendFrame`]s. Output and flush markers are
//! not tied to a call: they are forwarded to the output pump independently
//! of call replies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::engine::{CommandId, RemoteError, ScopeHandle};

/// Correlates a request with its reply on one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Initial handshake; answered with `ReplyBody::Ready`.
    Hello,
    /// Start the backend session with the given arguments.
    Start { args: Vec<String> },
    Execute {
        command: CommandId,
        source: String,
        scope: ScopeHandle,
    },
    MemberNames { expression: String },
    CreateScope,
    /// Interrupt whatever command is currently executing.
    Abort,
    /// Orderly shutdown of the backend process.
    Shutdown { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReplyBody {
    Ready { default_scope: ScopeHandle },
    Ack,
    Value(Option<String>),
    Names(Vec<String>),
    Scope(ScopeHandle),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub call: CallId,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum BackendFrame {
    Reply { call: CallId, body: ReplyBody },
    Output { text: String },
    /// All output for `command` has been sent.
    Flushed { command: CommandId },
}

/// Serialize `frame` as a single line and write it out.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(frame).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

pub fn decode_frame<T: DeserializeOwned>(line: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(line)
}
