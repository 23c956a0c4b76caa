//! The SSH transport surface consumed by the session engine.
//!
//! The transport owns connection setup, key exchange, authentication and
//! packet framing; this crate only drives it. The engine talks to it through
//! [`Transport`]: channel requests go down as method calls, decoded channel
//! traffic comes back up as [`ChannelEvent`]s from `postprocess`.

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Local identifier of a channel within one transport connection.
pub type ChannelId = u32;

/// Extended-data type carrying the remote stderr stream.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// Errors raised by the transport surface.
///
/// `Clone` so a captured per-channel fault can be surfaced at whichever
/// synchronization point the caller reaches first without being lost.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The underlying connection is gone.
    #[error("transport disconnected")]
    Disconnected,
    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Socket-level failure, flattened to keep the error clonable.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

/// A decoded channel-level message, produced by [`Transport::postprocess`].
///
/// Events for one channel are delivered in arrival order; the transport
/// guarantees that `ExitStatus`/`ExitSignal` precede `Close`.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The server confirmed the channel; `max_packet` is the largest data
    /// packet the remote side accepts.
    OpenConfirmation { id: ChannelId, max_packet: u32 },
    /// The server refused the channel.
    OpenFailed {
        id: ChannelId,
        code: u32,
        description: String,
    },
    /// Remote stdout bytes.
    Data { id: ChannelId, data: Vec<u8> },
    /// Out-of-band stream bytes; type [`EXTENDED_DATA_STDERR`] is stderr.
    ExtendedData {
        id: ChannelId,
        data_type: u32,
        data: Vec<u8>,
    },
    /// The remote process exited with a code.
    ExitStatus { id: ChannelId, code: u32 },
    /// The remote process was terminated by a signal.
    ExitSignal {
        id: ChannelId,
        signal: String,
        coredump: bool,
    },
    /// The remote side will send no more data on this channel.
    Eof { id: ChannelId },
    /// The channel is closed.
    Close { id: ChannelId },
}

impl ChannelEvent {
    /// The channel this event belongs to.
    pub fn channel_id(&self) -> ChannelId {
        match self {
            ChannelEvent::OpenConfirmation { id, .. }
            | ChannelEvent::OpenFailed { id, .. }
            | ChannelEvent::Data { id, .. }
            | ChannelEvent::ExtendedData { id, .. }
            | ChannelEvent::ExitStatus { id, .. }
            | ChannelEvent::ExitSignal { id, .. }
            | ChannelEvent::Eof { id }
            | ChannelEvent::Close { id } => *id,
        }
    }
}

/// Interface to the SSH library.
///
/// Exactly one thread calls into a transport at any moment; the session
/// engine enforces this with its channels mutex, so implementations need no
/// internal locking.
pub trait Transport: Send {
    /// Human-readable peer identity for logging, e.g. `user@host`.
    fn peer(&self) -> String;

    /// Post `CHANNEL_OPEN` for a session-type channel and return its local
    /// id. Confirmation or refusal arrives later as a [`ChannelEvent`].
    fn open_session(&mut self) -> Result<ChannelId, TransportError>;

    /// Send `pty-req` with the given terminal name and encoded mode string.
    fn request_pty(
        &mut self,
        id: ChannelId,
        term: &str,
        modes: &[u8],
    ) -> Result<(), TransportError>;

    /// Send an `env` request. Servers commonly whitelist names; a rejected
    /// variable is not reported back, which the engine treats as policy.
    fn send_env(&mut self, id: ChannelId, name: &str, value: &str)
    -> Result<(), TransportError>;

    /// Send an `exec` request with the assembled command line.
    fn send_exec(&mut self, id: ChannelId, command: &str) -> Result<(), TransportError>;

    /// Send a `data` packet on the channel.
    fn send_data(&mut self, id: ChannelId, data: &[u8]) -> Result<(), TransportError>;

    /// Send `channel-eof`.
    fn send_eof(&mut self, id: ChannelId) -> Result<(), TransportError>;

    /// Send `channel-close`, tolerating an already-closed channel.
    fn force_close(&mut self, id: ChannelId) -> Result<(), TransportError>;

    /// The socket fd to watch for readability, `None` when the transport is
    /// not fd-backed.
    fn poll_fd(&self) -> Option<RawFd>;

    /// True when outbound packets are queued and the socket belongs in the
    /// write set.
    fn wants_write(&self) -> bool {
        false
    }

    /// False once the connection is torn down.
    fn is_open(&self) -> bool;

    /// Housekeeping before the select. Returns `false` when the session is
    /// closed and the loop must exit.
    fn preprocess(&mut self) -> Result<bool, TransportError>;

    /// Service the socket after the select and decode inbound packets into
    /// `events`. Returns `false` when the session is closed.
    fn postprocess(
        &mut self,
        readable: bool,
        writable: bool,
        events: &mut Vec<ChannelEvent>,
    ) -> Result<bool, TransportError>;
}
