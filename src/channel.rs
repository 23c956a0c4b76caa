//! Per-channel synchronization state and the caller's join point.
//!
//! Every open channel owns a [`ChannelShared`]: the open condition (its own
//! mutex, so a stalled channel cannot block opens on other channels), the
//! close condition (a condvar waited on with the session mutex), the
//! captured fault, and the status record. The [`Waiter`] wraps the
//! background thread that owns the open handshake and carries the terminal
//! [`ExitStatus`].

use std::io::Write;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use crate::session::SessionError;
use crate::status::ExitStatus;

/// Lock, recovering from poisoning. The engine re-establishes its
/// invariants on the teardown path, so a panicked holder does not leave
/// state a later holder cannot repair.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The channel's local endpoints while the engine owns them: the stdin
/// source and the stdout/stderr sinks.
pub(crate) struct ChannelIo {
    pub(crate) stdin: Option<os_pipe::PipeReader>,
    pub(crate) stdout: Option<Box<dyn Write + Send>>,
    pub(crate) stderr: Option<Box<dyn Write + Send>>,
}

/// State shared between the session loop, the waiter thread and the caller.
pub(crate) struct ChannelShared {
    /// Open condition: set exactly once, on open confirmation, open failure
    /// or session teardown.
    opened: Mutex<bool>,
    open_cond: Condvar,
    /// Close condition, waited on with the session state mutex.
    pub(crate) close_cond: Condvar,
    fault: Mutex<Option<SessionError>>,
    status: Mutex<ExitStatus>,
    /// Endpoints handed back by the engine when the server refuses the
    /// open, so a retry reuses the same pipes.
    reclaim: Mutex<Option<ChannelIo>>,
}

impl ChannelShared {
    pub(crate) fn new() -> Self {
        Self {
            opened: Mutex::new(false),
            open_cond: Condvar::new(),
            close_cond: Condvar::new(),
            fault: Mutex::new(None),
            status: Mutex::new(ExitStatus::new()),
            reclaim: Mutex::new(None),
        }
    }

    /// One-shot wake for the open condition. Extra calls are no-ops.
    pub(crate) fn signal_open(&self) {
        let mut opened = lock(&self.opened);
        if *opened {
            return;
        }
        *opened = true;
        self.open_cond.notify_all();
    }

    /// Wake the waiter blocked on the close condition. Callers hold the
    /// session state mutex, so the waiter's registry re-check is ordered
    /// after whatever change prompted the wake.
    pub(crate) fn signal_close(&self) {
        self.close_cond.notify_all();
    }

    /// Block until the server confirmed or refused the channel (or the
    /// session shut down), then rethrow the captured fault if any.
    pub(crate) fn wait_open(&self) -> Result<(), SessionError> {
        let mut opened = lock(&self.opened);
        while !*opened {
            opened = self
                .open_cond
                .wait(opened)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(opened);
        match lock(&self.fault).clone() {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Capture a fault. The first capture wins; the value is surfaced by
    /// `wait_open` and by the waiter, never lost.
    pub(crate) fn set_fault(&self, err: SessionError) {
        let mut fault = lock(&self.fault);
        if fault.is_none() {
            *fault = Some(err);
        }
    }

    pub(crate) fn fault(&self) -> Option<SessionError> {
        lock(&self.fault).clone()
    }

    pub(crate) fn set_exit_code(&self, code: u32) {
        lock(&self.status).set_exit_code(code);
    }

    pub(crate) fn set_signal(&self, name: String, coredump: bool) {
        lock(&self.status).set_signal(name, coredump);
    }

    pub(crate) fn status_snapshot(&self) -> ExitStatus {
        lock(&self.status).clone()
    }

    pub(crate) fn put_reclaim(&self, io: ChannelIo) {
        *lock(&self.reclaim) = Some(io);
    }

    pub(crate) fn take_reclaim(&self) -> Option<ChannelIo> {
        lock(&self.reclaim).take()
    }
}

/// The caller's join point for one remote process.
///
/// Joining is idempotent: the first [`wait`](Self::wait) result is cached
/// and handed out again on later calls, and [`status`](Self::status) reads
/// the terminal record after a join.
pub struct Waiter {
    shared: Arc<ChannelShared>,
    inner: Mutex<WaiterInner>,
}

struct WaiterInner {
    handle: Option<JoinHandle<Result<ExitStatus, SessionError>>>,
    result: Option<Result<ExitStatus, SessionError>>,
}

impl Waiter {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        handle: JoinHandle<Result<ExitStatus, SessionError>>,
    ) -> Self {
        Self {
            shared,
            inner: Mutex::new(WaiterInner {
                handle: Some(handle),
                result: None,
            }),
        }
    }

    /// Block until the server confirmed or refused the channel, then
    /// rethrow the captured fault if one was recorded during the open.
    pub fn wait_open(&self) -> Result<(), SessionError> {
        self.shared.wait_open()
    }

    /// Block until the remote process has terminated and the channel is
    /// torn down, returning the terminal status or the captured fault.
    pub fn wait(&self) -> Result<ExitStatus, SessionError> {
        let mut inner = lock(&self.inner);
        if let Some(result) = &inner.result {
            return result.clone();
        }
        let result = match inner.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(SessionError::Io("waiter thread panicked".into()))),
            None => Err(SessionError::Io("waiter already joined".into())),
        };
        inner.result = Some(result.clone());
        result
    }

    /// The terminal status, available once [`wait`](Self::wait) has
    /// returned.
    pub fn status(&self) -> Option<ExitStatus> {
        let inner = lock(&self.inner);
        inner
            .result
            .as_ref()
            .map(|_| self.shared.status_snapshot())
    }

    /// Join quietly, discarding the result. Used by the open-retry driver
    /// after a refused open.
    pub(crate) fn reap(&self) {
        let _ = self.wait();
    }

    pub(crate) fn take_reclaimed_io(&self) -> Option<ChannelIo> {
        self.shared.take_reclaim()
    }
}
