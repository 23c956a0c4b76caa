//! Scripted transport double for engine tests.
//!
//! The mock plays the server side of the wire: opens are confirmed or
//! refused, an exec is answered with a scripted run, and a `cat` mode
//! echoes stdin packets back as stdout. Its poll fd is a real pipe, so the
//! session loop's select and wake machinery run unmodified under test. A
//! paired [`MockHandle`] drives the script from the test thread.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex};

use os_pipe::{PipeReader, PipeWriter};

use crate::channel::lock;
use crate::pipe::set_nonblocking;
use crate::transport::{ChannelEvent, ChannelId, EXTENDED_DATA_STDERR, Transport, TransportError};

/// One scripted server reaction to an exec.
#[derive(Clone)]
pub(crate) enum Action {
    Out(Vec<u8>),
    Err(Vec<u8>),
    Exit(u32),
    Signal(&'static str, bool),
    Eof,
    Close,
}

#[derive(Default)]
struct MockState {
    closed: bool,
    next_id: ChannelId,
    refuse_opens: u32,
    open_attempts: u32,
    scripts: HashMap<String, Vec<Action>>,
    echo_stdin: bool,
    echo_channels: Vec<ChannelId>,
    pending: VecDeque<ChannelEvent>,
    exec_log: Vec<String>,
    env_log: Vec<(String, String)>,
    pty_log: Vec<(String, Vec<u8>)>,
    eof_log: Vec<ChannelId>,
    forced_closed: Vec<ChannelId>,
}

const MOCK_MAX_PACKET: u32 = 32 * 1024;

fn push_actions(state: &mut MockState, id: ChannelId, actions: &[Action]) {
    for action in actions {
        state.pending.push_back(match action {
            Action::Out(data) => ChannelEvent::Data {
                id,
                data: data.clone(),
            },
            Action::Err(data) => ChannelEvent::ExtendedData {
                id,
                data_type: EXTENDED_DATA_STDERR,
                data: data.clone(),
            },
            Action::Exit(code) => ChannelEvent::ExitStatus { id, code: *code },
            Action::Signal(name, coredump) => ChannelEvent::ExitSignal {
                id,
                signal: (*name).to_string(),
                coredump: *coredump,
            },
            Action::Eof => ChannelEvent::Eof { id },
            Action::Close => ChannelEvent::Close { id },
        });
    }
}

pub(crate) struct MockTransport {
    state: Arc<Mutex<MockState>>,
    ready_read: PipeReader,
    ready_write: PipeWriter,
}

impl MockTransport {
    fn notify(&mut self) {
        match self.ready_write.write(&[1u8]) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("mock transport notify failed: {err}"),
        }
    }
}

impl Transport for MockTransport {
    fn peer(&self) -> String {
        "mock@testhost".to_string()
    }

    fn open_session(&mut self) -> Result<ChannelId, TransportError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(TransportError::Disconnected);
        }
        state.open_attempts += 1;
        state.next_id += 1;
        let id = state.next_id;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            state.pending.push_back(ChannelEvent::OpenFailed {
                id,
                code: 1,
                description: "administratively prohibited".to_string(),
            });
        } else {
            state.pending.push_back(ChannelEvent::OpenConfirmation {
                id,
                max_packet: MOCK_MAX_PACKET,
            });
        }
        drop(state);
        self.notify();
        Ok(id)
    }

    fn request_pty(
        &mut self,
        _id: ChannelId,
        term: &str,
        modes: &[u8],
    ) -> Result<(), TransportError> {
        lock(&self.state)
            .pty_log
            .push((term.to_string(), modes.to_vec()));
        Ok(())
    }

    fn send_env(
        &mut self,
        _id: ChannelId,
        name: &str,
        value: &str,
    ) -> Result<(), TransportError> {
        lock(&self.state)
            .env_log
            .push((name.to_string(), value.to_string()));
        Ok(())
    }

    fn send_exec(&mut self, id: ChannelId, command: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.exec_log.push(command.to_string());
        if state.echo_stdin {
            state.echo_channels.push(id);
        } else {
            // Unscripted commands succeed with no output.
            let actions = state.scripts.get(command).cloned().unwrap_or_else(|| {
                vec![Action::Exit(0), Action::Eof, Action::Close]
            });
            push_actions(&mut state, id, &actions);
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn send_data(&mut self, id: ChannelId, data: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.echo_channels.contains(&id) {
            state.pending.push_back(ChannelEvent::Data {
                id,
                data: data.to_vec(),
            });
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn send_eof(&mut self, id: ChannelId) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.eof_log.push(id);
        if state.echo_channels.contains(&id) {
            // cat exits once its input is exhausted.
            push_actions(&mut state, id, &[Action::Exit(0), Action::Eof, Action::Close]);
        }
        drop(state);
        self.notify();
        Ok(())
    }

    fn force_close(&mut self, id: ChannelId) -> Result<(), TransportError> {
        lock(&self.state).forced_closed.push(id);
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.ready_read.as_raw_fd())
    }

    fn is_open(&self) -> bool {
        !lock(&self.state).closed
    }

    fn preprocess(&mut self) -> Result<bool, TransportError> {
        Ok(!lock(&self.state).closed)
    }

    fn postprocess(
        &mut self,
        _readable: bool,
        _writable: bool,
        events: &mut Vec<ChannelEvent>,
    ) -> Result<bool, TransportError> {
        let mut byte = [0u8; 16];
        loop {
            match self.ready_read.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => return Err(TransportError::Io(err.to_string())),
            }
        }
        let mut state = lock(&self.state);
        events.extend(state.pending.drain(..));
        Ok(!state.closed)
    }
}

/// Test-side controls for a [`MockTransport`].
pub(crate) struct MockHandle {
    state: Arc<Mutex<MockState>>,
    ready_write: Mutex<PipeWriter>,
}

impl MockHandle {
    fn notify(&self) {
        match lock(&self.ready_write).write(&[1u8]) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(err) => panic!("mock handle notify failed: {err}"),
        }
    }

    /// Script the server's reaction to an exact command line.
    pub(crate) fn script(&self, command: &str, actions: Vec<Action>) {
        lock(&self.state).scripts.insert(command.to_string(), actions);
    }

    /// Refuse the next `n` channel opens.
    pub(crate) fn refuse_next_opens(&self, n: u32) {
        lock(&self.state).refuse_opens = n;
    }

    pub(crate) fn open_attempts(&self) -> u32 {
        lock(&self.state).open_attempts
    }

    /// Echo stdin packets back as stdout and exit 0 on EOF (a `cat`
    /// double). Applies to channels opened after the call.
    pub(crate) fn echo_stdin(&self, on: bool) {
        lock(&self.state).echo_stdin = on;
    }

    /// The id handed out by the most recent open.
    pub(crate) fn last_channel(&self) -> ChannelId {
        lock(&self.state).next_id
    }

    /// Deliver events out of band, as a server would mid-run.
    pub(crate) fn inject(&self, events: Vec<ChannelEvent>) {
        lock(&self.state).pending.extend(events);
        self.notify();
    }

    /// Kill the connection: the loop observes a closed transport on its
    /// next pass.
    pub(crate) fn disconnect(&self) {
        lock(&self.state).closed = true;
        self.notify();
    }

    pub(crate) fn exec_log(&self) -> Vec<String> {
        lock(&self.state).exec_log.clone()
    }

    pub(crate) fn env_log(&self) -> Vec<(String, String)> {
        lock(&self.state).env_log.clone()
    }

    pub(crate) fn pty_log(&self) -> Vec<(String, Vec<u8>)> {
        lock(&self.state).pty_log.clone()
    }

    pub(crate) fn eof_log(&self) -> Vec<ChannelId> {
        lock(&self.state).eof_log.clone()
    }

    pub(crate) fn forced_closed(&self) -> Vec<ChannelId> {
        lock(&self.state).forced_closed.clone()
    }
}

/// Build a connected transport/handle pair.
pub(crate) fn mock_pair() -> (Box<dyn Transport>, MockHandle) {
    let (ready_read, ready_write) = os_pipe::pipe().expect("pipe");
    set_nonblocking(ready_read.as_raw_fd()).expect("nonblocking read end");
    set_nonblocking(ready_write.as_raw_fd()).expect("nonblocking write end");
    let state = Arc::new(Mutex::new(MockState::default()));
    let handle = MockHandle {
        state: Arc::clone(&state),
        ready_write: Mutex::new(ready_write.try_clone().expect("clone write end")),
    };
    let transport = MockTransport {
        state,
        ready_read,
        ready_write,
    };
    (Box::new(transport), handle)
}
