// src/types.rs

use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Deserialize;

/// Boxed, sendable future used at the trait seams (backend hosts, engines).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What the supervisor does when a backend exits on its own.
///
/// - `Always`: start a replacement no matter how the backend exited. Only an
///   explicit terminate ends the supervisor (default behaviour).
/// - `OnFailure`: a backend that exits with status 0 ends the supervisor;
///   any other status starts a replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    Always,
    OnFailure,
}

impl RestartMode {
    pub fn exit_on_normal_exit(self) -> bool {
        matches!(self, RestartMode::OnFailure)
    }
}

impl Default for RestartMode {
    fn default() -> Self {
        RestartMode::Always
    }
}

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
