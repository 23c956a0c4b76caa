//! Managed SSH session.
//!
//! One dedicated thread (the session loop) owns all transport I/O and
//! drives every open channel: it selects over the transport socket, the
//! stdin pumps and the wake pipe, decodes channel traffic into events and
//! routes bytes into the caller's pipes. Caller threads interact with it by
//! taking the channels mutex, touching shared state, and waking the loop
//! through the wake pipe.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::channel::{ChannelIo, ChannelShared, Waiter, lock};
use crate::command::{Command, is_valid_env_name};
use crate::logger::{Logger, TracingLogger};
use crate::pipe::{WakePipe, set_nonblocking};
use crate::pty::PtyRequest;
use crate::status::ExitStatus;
use crate::transport::{
    ChannelEvent, ChannelId, EXTENDED_DATA_STDERR, Transport, TransportError,
};

/// Bytes reserved for SSH framing when sizing stdin packets.
const HEADER_SLACK: usize = 512;
/// Floor for the stdin pump unit, whatever the remote advertises.
const MIN_PUMP_UNIT: usize = 1024;

/// Caller-facing errors.
///
/// `Clone` because a captured per-channel fault is surfaced at `wait_open`
/// or at waiter completion, whichever the caller reaches, without being
/// consumed by the first read.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The server refused the channel. Recovered locally by the open retry
    /// policy, then surfaced.
    #[error("cannot open channel (error code {code}): {description}")]
    ChannelOpenFailed { code: u32, description: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The session shut down before the channel completed.
    #[error("session closed")]
    SessionClosed,
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for SessionError {
    fn from(err: io::Error) -> Self {
        SessionError::Io(err.to_string())
    }
}

/// Everything a channel needs at open-confirmation time.
#[derive(Clone)]
pub(crate) struct ExecSpec {
    pub(crate) command_line: String,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) pty: Option<PtyRequest>,
}

impl ExecSpec {
    pub(crate) fn from_command(cmd: &Command) -> Self {
        Self {
            command_line: cmd.command_line(),
            env: cmd.env_pairs().to_vec(),
            pty: cmd.pty_request().cloned(),
        }
    }
}

/// Registry entry for one live channel.
struct ChannelEntry {
    shared: Arc<ChannelShared>,
    /// Pending until the server confirms the open.
    exec: Option<ExecSpec>,
    io: ChannelIo,
    logger: Arc<dyn Logger>,
    /// Stdin packet size, `max(1024, remote_max_packet - HEADER_SLACK)`.
    pump_unit: usize,
    /// The stdin source is in the loop's read set.
    pump_active: bool,
    eof_sent: bool,
}

/// State guarded by the channels mutex. The transport lives here so that
/// holding the mutex is what serializes all transport calls.
struct Shared {
    transport: Box<dyn Transport>,
    channels: HashMap<ChannelId, ChannelEntry>,
    /// Set by [`Session::close`].
    shutdown: bool,
    /// Set by the loop on exit; why the session is gone.
    dead: Option<SessionError>,
}

struct SessionInner {
    state: Mutex<Shared>,
    /// Signaled when a new channel is installed while the loop idles.
    channels_cond: Condvar,
    wake: WakePipe,
    loop_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a managed session. Cheap to clone; all clones drive the same
/// transport and loop.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Wrap a transport and start the session loop. The wake pipe is
    /// created here, unconditionally.
    pub fn new(transport: Box<dyn Transport>) -> Result<Self, SessionError> {
        let inner = Arc::new(SessionInner {
            state: Mutex::new(Shared {
                transport,
                channels: HashMap::new(),
                shutdown: false,
                dead: None,
            }),
            channels_cond: Condvar::new(),
            wake: WakePipe::new()?,
            loop_thread: Mutex::new(None),
        });
        let worker = Arc::clone(&inner);
        let handle = thread::spawn(move || {
            let reason = run_loop(&worker);
            teardown(&worker, reason);
        });
        *lock(&inner.loop_thread) = Some(handle);
        Ok(Self { inner })
    }

    /// Peer identity reported by the transport.
    pub fn peer(&self) -> String {
        lock(&self.inner.state).transport.peer()
    }

    /// True while the transport is up and the loop is running.
    pub fn is_open(&self) -> bool {
        let guard = lock(&self.inner.state);
        guard.dead.is_none() && guard.transport.is_open()
    }

    /// Stop the session loop and join it. Live channels observe a
    /// `SessionClosed` fault; every waiter still terminates. Idempotent.
    pub fn close(&self) {
        {
            let mut guard = lock(&self.inner.state);
            guard.shutdown = true;
        }
        self.inner.channels_cond.notify_all();
        self.inner.wake.wake();
        let handle = lock(&self.inner.loop_thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Open a channel and start its waiter thread. The waiter owns the
    /// open handshake; callers synchronize through the returned [`Waiter`].
    pub(crate) fn open_channel(
        &self,
        exec: ExecSpec,
        io: ChannelIo,
        logger: Arc<dyn Logger>,
    ) -> Waiter {
        let shared = Arc::new(ChannelShared::new());
        let inner = Arc::clone(&self.inner);
        let waiter_shared = Arc::clone(&shared);
        let handle =
            thread::spawn(move || waiter_body(&inner, &waiter_shared, exec, io, logger));
        Waiter::new(shared, handle)
    }

    /// The open-with-retry driver: open the channel, wait for the server's
    /// verdict, and retry refused opens per the command's policy, reusing
    /// the same caller-side pipes across attempts.
    pub(crate) fn spawn_command(
        &self,
        cmd: &Command,
        io: ChannelIo,
    ) -> Result<Waiter, SessionError> {
        let logger: Arc<dyn Logger> = cmd
            .shared_logger()
            .unwrap_or_else(|| Arc::new(TracingLogger));
        let exec = ExecSpec::from_command(cmd);
        let policy = cmd.retry_policy();
        let mut attempts_left = policy.retries;
        let mut io = io;
        loop {
            let waiter = self.open_channel(exec.clone(), io, Arc::clone(&logger));
            match waiter.wait_open() {
                Ok(()) => return Ok(waiter),
                Err(SessionError::ChannelOpenFailed { .. }) if attempts_left > 0 => {
                    attempts_left -= 1;
                    waiter.reap();
                    io = match waiter.take_reclaimed_io() {
                        Some(io) => io,
                        None => {
                            return Err(SessionError::Io(
                                "endpoints lost across refused open".into(),
                            ));
                        }
                    };
                    tracing::debug!(
                        "session: channel open refused, retrying in {:?} ({attempts_left} attempts left)",
                        policy.delay
                    );
                    thread::sleep(policy.delay);
                }
                Err(err) => {
                    waiter.reap();
                    return Err(err);
                }
            }
        }
    }
}

/// Body of the waiter thread: under the channels mutex, post the open,
/// install the registry entry and wake the loop; then wait on the close
/// condition for as long as the channel remains registered.
fn waiter_body(
    inner: &SessionInner,
    shared: &Arc<ChannelShared>,
    exec: ExecSpec,
    io: ChannelIo,
    logger: Arc<dyn Logger>,
) -> Result<ExitStatus, SessionError> {
    let mut guard = lock(&inner.state);
    if let Some(reason) = &guard.dead {
        let reason = reason.clone();
        shared.set_fault(reason.clone());
        shared.signal_open();
        return Err(reason);
    }
    let id = match guard.transport.open_session() {
        Ok(id) => id,
        Err(err) => {
            let err = SessionError::Transport(err);
            shared.set_fault(err.clone());
            shared.signal_open();
            return Err(err);
        }
    };
    guard.channels.insert(
        id,
        ChannelEntry {
            shared: Arc::clone(shared),
            exec: Some(exec),
            io,
            logger,
            pump_unit: 0,
            pump_active: false,
            eof_sent: false,
        },
    );
    inner.channels_cond.notify_all();
    inner.wake.wake();
    while guard.channels.contains_key(&id) && guard.dead.is_none() {
        guard = shared
            .close_cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner);
    }
    drop(guard);
    match shared.fault() {
        Some(fault) => Err(fault),
        None => Ok(shared.status_snapshot()),
    }
}

/// The session loop. Returns the reason the session ended, which teardown
/// records as the fault for any channel still live.
fn run_loop(inner: &SessionInner) -> SessionError {
    loop {
        let mut guard = lock(&inner.state);
        if guard.shutdown {
            return SessionError::SessionClosed;
        }
        match guard.transport.preprocess() {
            Ok(true) => {}
            Ok(false) => return SessionError::SessionClosed,
            Err(err) => return SessionError::Transport(err),
        }
        if guard.channels.is_empty() {
            // Idle between commands; a registering waiter signals us.
            let _idle = inner
                .channels_cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        // Watch sets: transport socket, active stdin pumps, wake pipe.
        let transport_fd = guard.transport.poll_fd();
        let wants_write = guard.transport.wants_write();
        let pump_fds: Vec<(ChannelId, RawFd)> = guard
            .channels
            .iter()
            .filter(|(_, entry)| entry.pump_active)
            .filter_map(|(id, entry)| entry.io.stdin.as_ref().map(|s| (*id, s.as_raw_fd())))
            .collect();
        drop(guard);

        let mut read_fds: Vec<RawFd> = vec![inner.wake.poll_fd()];
        read_fds.extend(transport_fd);
        read_fds.extend(pump_fds.iter().map(|(_, fd)| *fd));
        let write_fds: Vec<RawFd> = if wants_write {
            transport_fd.into_iter().collect()
        } else {
            Vec::new()
        };

        // The select runs without the mutex so callers can register
        // channels meanwhile; the wake pipe breaks us out when they do.
        let (ready_read, ready_write) = match select_fds(&read_fds, &write_fds) {
            Ok(ready) => ready,
            Err(err) => return SessionError::Io(err.to_string()),
        };

        let mut guard = lock(&inner.state);
        if guard.shutdown {
            return SessionError::SessionClosed;
        }
        inner.wake.drain();

        let readable = transport_fd.is_some_and(|fd| ready_read.contains(&fd));
        let writable = transport_fd.is_some_and(|fd| ready_write.contains(&fd));
        let mut events = Vec::new();
        let still_open = guard.transport.postprocess(readable, writable, &mut events);
        // Deliver whatever was decoded before acting on a closed or failed
        // transport, so final exit statuses are not lost.
        for event in events {
            handle_event(&mut guard, event);
        }
        match still_open {
            Ok(true) => {}
            Ok(false) => return SessionError::SessionClosed,
            Err(err) => return SessionError::Transport(err),
        }
        for (id, fd) in pump_fds {
            if ready_read.contains(&fd) {
                pump_stdin(&mut guard, id);
            }
        }
    }
}

/// Route one decoded channel event. Runs with the channels mutex held;
/// events for a channel arrive in order, and exit status precedes close.
fn handle_event(state: &mut Shared, event: ChannelEvent) {
    match event {
        ChannelEvent::OpenConfirmation { id, max_packet } => {
            let Some(entry) = state.channels.get(&id) else {
                tracing::debug!("session: open confirmation for unknown channel {id}");
                return;
            };
            let shared = Arc::clone(&entry.shared);
            if let Err(err) = confirm_open(state, id, max_packet) {
                // The channel is unusable mid-setup; close it out so the
                // waiter terminates.
                if let Some(entry) = state.channels.remove(&id) {
                    entry.shared.set_fault(err);
                    let _ = state.transport.force_close(id);
                    entry.shared.signal_close();
                }
            }
            shared.signal_open();
        }
        ChannelEvent::OpenFailed {
            id,
            code,
            description,
        } => {
            let Some(entry) = state.channels.remove(&id) else {
                return;
            };
            let msg = format!("cannot open channel (error code {code}): {description}");
            entry.logger.error(&msg);
            tracing::error!("session: {msg}");
            entry
                .shared
                .set_fault(SessionError::ChannelOpenFailed { code, description });
            entry.shared.put_reclaim(entry.io);
            entry.shared.signal_open();
            entry.shared.signal_close();
        }
        ChannelEvent::Data { id, data } => {
            let Some(entry) = state.channels.get_mut(&id) else {
                return;
            };
            entry.logger.stdout(&data);
            write_sink(&mut entry.io.stdout, &data, "stdout");
        }
        ChannelEvent::ExtendedData {
            id,
            data_type,
            data,
        } => {
            let Some(entry) = state.channels.get_mut(&id) else {
                return;
            };
            if data_type == EXTENDED_DATA_STDERR {
                entry.logger.stderr(&data);
                write_sink(&mut entry.io.stderr, &data, "stderr");
            } else {
                let msg = format!(
                    "unknown extended data type {data_type}, dropping {} bytes",
                    data.len()
                );
                entry.logger.warn(&msg);
                tracing::warn!("session: channel {id}: {msg}");
            }
        }
        ChannelEvent::ExitStatus { id, code } => {
            if let Some(entry) = state.channels.get(&id) {
                entry.shared.set_exit_code(code);
            }
        }
        ChannelEvent::ExitSignal {
            id,
            signal,
            coredump,
        } => {
            if let Some(entry) = state.channels.get(&id) {
                entry.shared.set_signal(signal, coredump);
            }
        }
        ChannelEvent::Eof { id } => {
            if let Some(entry) = state.channels.get_mut(&id) {
                // Dropping the sinks closes the caller-facing read ends.
                entry.io.stdout = None;
                entry.io.stderr = None;
            }
        }
        ChannelEvent::Close { id } => {
            let Some(mut entry) = state.channels.remove(&id) else {
                return;
            };
            entry.pump_active = false;
            entry.io.stdin = None;
            if !entry.eof_sent {
                // Defensive EOF; the channel is going away regardless.
                if let Err(err) = state.transport.send_eof(id) {
                    tracing::debug!("session: eof on closing channel {id}: {err}");
                }
            }
            entry.shared.signal_close();
        }
    }
}

/// Open-confirmation work: PTY, env, exec, logger init, stdin pump.
fn confirm_open(state: &mut Shared, id: ChannelId, max_packet: u32) -> Result<(), SessionError> {
    let Shared {
        transport,
        channels,
        ..
    } = state;
    let Some(entry) = channels.get_mut(&id) else {
        return Ok(());
    };
    let Some(exec) = entry.exec.take() else {
        return Ok(());
    };
    if let Some(pty) = &exec.pty {
        transport.request_pty(id, &pty.term, &pty.modes.encode())?;
    }
    for (name, value) in &exec.env {
        if !is_valid_env_name(name) {
            let msg = format!("skipping invalid env name {name:?}");
            entry.logger.warn(&msg);
            tracing::warn!("session: channel {id}: {msg}");
            continue;
        }
        // Servers whitelist env names; a rejected variable is silent and
        // that is deliberate policy.
        transport.send_env(id, name, value)?;
    }
    entry.logger.init(
        &transport.peer(),
        &exec.command_line,
        &exec.env,
        exec.pty.is_some(),
    );
    transport.send_exec(id, &exec.command_line)?;
    if let Some(stdin) = &entry.io.stdin {
        set_nonblocking(stdin.as_raw_fd())?;
        entry.pump_unit = (max_packet as usize)
            .saturating_sub(HEADER_SLACK)
            .max(MIN_PUMP_UNIT);
        entry.pump_active = true;
    }
    Ok(())
}

/// Forward up to one pump unit from the caller's stdin to the channel.
/// Reads are nonblocking partial reads; a slow producer never blocks the
/// loop.
fn pump_stdin(state: &mut Shared, id: ChannelId) {
    let Shared {
        transport,
        channels,
        ..
    } = state;
    let Some(entry) = channels.get_mut(&id) else {
        return;
    };
    if !entry.pump_active {
        return;
    }
    let read_result = {
        let Some(stdin) = entry.io.stdin.as_mut() else {
            return;
        };
        let mut buf = vec![0u8; entry.pump_unit.max(MIN_PUMP_UNIT)];
        stdin.read(&mut buf).map(|n| {
            buf.truncate(n);
            buf
        })
    };
    match read_result {
        Ok(buf) if buf.is_empty() => {
            // End of stream: deregister and tell the server no more input
            // is coming.
            entry.pump_active = false;
            entry.io.stdin = None;
            entry.eof_sent = true;
            if let Err(err) = transport.send_eof(id) {
                tracing::warn!("session: channel {id}: eof failed: {err}");
                entry.shared.set_fault(SessionError::Transport(err));
            }
        }
        Ok(buf) => {
            entry.logger.stdin(&buf);
            if let Err(err) = transport.send_data(id, &buf) {
                tracing::warn!("session: channel {id}: stdin forward failed: {err}");
                entry.shared.set_fault(SessionError::Transport(err));
                entry.pump_active = false;
                entry.io.stdin = None;
            }
        }
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
        Err(err) => {
            tracing::warn!("session: channel {id}: stdin read failed: {err}");
            entry.pump_active = false;
            entry.io.stdin = None;
            entry.eof_sent = true;
            let _ = transport.send_eof(id);
        }
    }
}

/// Write a delivered chunk into a caller sink. A sink whose reader went
/// away is dropped; caller-pipe errors never tear the session down.
fn write_sink(sink: &mut Option<Box<dyn Write + Send>>, data: &[u8], name: &str) {
    let Some(writer) = sink else {
        return;
    };
    let result = writer.write_all(data).and_then(|_| writer.flush());
    if let Err(err) = result {
        if err.kind() == io::ErrorKind::BrokenPipe {
            tracing::debug!("session: {name} reader gone, dropping sink");
        } else {
            tracing::warn!("session: {name} sink write failed: {err}");
        }
        *sink = None;
    }
}

/// Loop exit: record why, then signal open and close for every channel
/// still registered and force it closed, so no waiter is ever orphaned.
fn teardown(inner: &SessionInner, reason: SessionError) {
    let mut guard = lock(&inner.state);
    guard.dead = Some(reason.clone());
    let channels = mem::take(&mut guard.channels);
    for (id, entry) in channels {
        entry.shared.set_fault(reason.clone());
        entry.shared.signal_open();
        if let Err(err) = guard.transport.force_close(id) {
            tracing::debug!("session: force close of channel {id}: {err}");
        }
        entry.shared.signal_close();
    }
    tracing::debug!("session: loop exited: {reason}");
}

/// Blocking select with no timeout, retried on EINTR. Returns the ready
/// subsets of the given read and write sets.
fn select_fds(read_fds: &[RawFd], write_fds: &[RawFd]) -> io::Result<(Vec<RawFd>, Vec<RawFd>)> {
    loop {
        // SAFETY: an fd_set is plain data; FD_ZERO initializes it.
        let mut readset: libc::fd_set = unsafe { mem::zeroed() };
        let mut writeset: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readset);
            libc::FD_ZERO(&mut writeset);
        }
        let mut nfds: RawFd = 0;
        for &fd in read_fds {
            // SAFETY: fd is a valid open descriptor below FD_SETSIZE.
            unsafe { libc::FD_SET(fd, &mut readset) };
            nfds = nfds.max(fd + 1);
        }
        for &fd in write_fds {
            // SAFETY: as above.
            unsafe { libc::FD_SET(fd, &mut writeset) };
            nfds = nfds.max(fd + 1);
        }
        // SAFETY: both sets were initialized above; a null timeout blocks
        // until readiness.
        let ret = unsafe {
            libc::select(
                nfds,
                &mut readset,
                &mut writeset,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        // SAFETY: the sets were populated by the select call above.
        let ready_read = read_fds
            .iter()
            .copied()
            .filter(|&fd| unsafe { libc::FD_ISSET(fd, &readset) })
            .collect();
        let ready_write = write_fds
            .iter()
            .copied()
            .filter(|&fd| unsafe { libc::FD_ISSET(fd, &writeset) })
            .collect();
        return Ok((ready_read, ready_write));
    }
}
