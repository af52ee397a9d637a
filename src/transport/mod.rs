// src/transport/mod.rs

//! Channel transport between the supervisor process and a backend process.
//!
//! - [`address`] parses the `tcp://HOST:PORT` addresses backends announce.
//! - [`frame`] defines the newline-delimited JSON frames on the wire.
//! - [`client`] is the supervisor side: an [`RpcClient`] that marshals calls
//!   to the backend and surfaces channel failure as a [`ChannelError`]
//!   instead of hanging.
//!
//! A channel failure is never an application error: remote code raising an
//! error comes back as a normal reply carrying a `RemoteError`.

use std::time::Duration;

use thiserror::Error;

pub mod address;
pub mod client;
pub mod frame;

pub use address::ChannelAddress;
pub use client::{connect, RpcClient};
pub use frame::{BackendFrame, CallId, ClientFrame, ReplyBody, Request};

/// Default idle lease on a channel.
///
/// A backend can sit idle for a long time between user commands; dropping
/// the channel on inactivity would look exactly like a crash.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Failure of the channel itself, as opposed to an error raised by remote code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("malformed channel address '{0}'")]
    MalformedAddress(String),

    #[error("could not connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("channel disconnected")]
    Disconnected,

    #[error("channel lease expired after {0:?} without traffic")]
    LeaseExpired(Duration),

    #[error("channel I/O failure: {0}")]
    Io(String),

    #[error("malformed frame on channel: {0}")]
    Serialization(String),

    #[error("unexpected reply to {0} request")]
    UnexpectedReply(&'static str),

    #[error("no backend is currently running")]
    NoBackend,
}
