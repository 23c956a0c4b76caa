//! Child-process-with-pipes semantics over multiplexed SSH channels.
//!
//! This crate is the channel lifecycle and concurrency engine between a
//! pipe-style caller API and an SSH transport: a single session loop
//! services the transport for any number of concurrently open channels,
//! per-channel waiters surface exit statuses, and the popen/capture
//! façades hand callers ordinary byte-stream endpoints for the remote
//! process's stdin, stdout and stderr.
//!
//! The transport itself (connection setup, key exchange, authentication,
//! framing) is consumed through the [`Transport`] trait and is not part of
//! this crate.

mod channel;
mod command;
mod logger;
mod pipe;
mod popen;
mod pty;
mod session;
mod status;
#[cfg(test)]
mod testutil;
mod transport;

// Exit status record
pub use status::ExitStatus;

// Caller's per-command join point
pub use channel::Waiter;

// Command construction
pub use command::{Command, RedirectStream, RedirectTarget, RetryPolicy};

// PTY requests
pub use pty::{PtyMode, PtyModes, PtyRequest};

// Per-command logging hooks
pub use logger::{Logger, TracingLogger};

// Session engine
pub use session::{Session, SessionError};

// Transport interface
pub use transport::{
    ChannelEvent, ChannelId, EXTENDED_DATA_STDERR, Transport, TransportError,
};

// Re-export for convenience (the façade endpoints are plain pipes)
pub use os_pipe::{PipeReader, PipeWriter};
