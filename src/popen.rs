//! Pipe façades over the session engine.
//!
//! The popen variants allocate local pipe pairs, hand the inner ends to the
//! open-with-retry driver and yield the outer ends plus the [`Waiter`] to a
//! user block. The block owns its endpoints, so they are closed by the time
//! the façade returns on every path, including errors. The capture
//! variants run the canonical block: feed `stdin_data`, close stdin, read
//! the remaining streams to completion and return the collected bytes with
//! the exit status.

use std::io::{Read, Write};
use std::thread;

use os_pipe::{PipeReader, PipeWriter};

use crate::channel::{ChannelIo, Waiter};
use crate::command::Command;
use crate::session::{Session, SessionError};
use crate::status::ExitStatus;

impl Session {
    /// Run `cmd` with pipes on stdin and stdout. The block's value is
    /// returned once the remote process has exited.
    pub fn popen2<R>(
        &self,
        cmd: &Command,
        block: impl FnOnce(PipeWriter, PipeReader, &Waiter) -> R,
    ) -> Result<R, SessionError> {
        let (stdin_read, stdin_write) = os_pipe::pipe()?;
        let (stdout_read, stdout_write) = os_pipe::pipe()?;
        let io = ChannelIo {
            stdin: Some(stdin_read),
            stdout: Some(Box::new(stdout_write)),
            stderr: None,
        };
        let waiter = self.spawn_command(cmd, io)?;
        let value = block(stdin_write, stdout_read, &waiter);
        waiter.wait()?;
        Ok(value)
    }

    /// Like [`popen2`](Self::popen2), with remote stderr merged into the
    /// stdout stream in arrival order.
    pub fn popen2e<R>(
        &self,
        cmd: &Command,
        block: impl FnOnce(PipeWriter, PipeReader, &Waiter) -> R,
    ) -> Result<R, SessionError> {
        let (stdin_read, stdin_write) = os_pipe::pipe()?;
        let (stdout_read, stdout_write) = os_pipe::pipe()?;
        let merged = stdout_write.try_clone()?;
        let io = ChannelIo {
            stdin: Some(stdin_read),
            stdout: Some(Box::new(stdout_write)),
            stderr: Some(Box::new(merged)),
        };
        let waiter = self.spawn_command(cmd, io)?;
        let value = block(stdin_write, stdout_read, &waiter);
        waiter.wait()?;
        Ok(value)
    }

    /// Run `cmd` with pipes on stdin, stdout and stderr.
    pub fn popen3<R>(
        &self,
        cmd: &Command,
        block: impl FnOnce(PipeWriter, PipeReader, PipeReader, &Waiter) -> R,
    ) -> Result<R, SessionError> {
        let (stdin_read, stdin_write) = os_pipe::pipe()?;
        let (stdout_read, stdout_write) = os_pipe::pipe()?;
        let (stderr_read, stderr_write) = os_pipe::pipe()?;
        let io = ChannelIo {
            stdin: Some(stdin_read),
            stdout: Some(Box::new(stdout_write)),
            stderr: Some(Box::new(stderr_write)),
        };
        let waiter = self.spawn_command(cmd, io)?;
        let value = block(stdin_write, stdout_read, stderr_read, &waiter);
        waiter.wait()?;
        Ok(value)
    }

    /// Run `cmd` and collect its stdout.
    pub fn capture2(&self, cmd: &Command) -> Result<(Vec<u8>, ExitStatus), SessionError> {
        let stdin_data = cmd.stdin_bytes().map(<[u8]>::to_vec);
        self.popen2(cmd, |stdin, mut stdout, waiter| {
            let feeder = feed_stdin(stdin, stdin_data);
            let mut out = Vec::new();
            let read_result = stdout.read_to_end(&mut out);
            let _ = feeder.join();
            let status = waiter.wait()?;
            read_result.map_err(SessionError::from)?;
            Ok((out, status))
        })?
    }

    /// Run `cmd` and collect stdout and stderr merged in arrival order.
    pub fn capture2e(&self, cmd: &Command) -> Result<(Vec<u8>, ExitStatus), SessionError> {
        let stdin_data = cmd.stdin_bytes().map(<[u8]>::to_vec);
        self.popen2e(cmd, |stdin, mut merged, waiter| {
            let feeder = feed_stdin(stdin, stdin_data);
            let mut out = Vec::new();
            let read_result = merged.read_to_end(&mut out);
            let _ = feeder.join();
            let status = waiter.wait()?;
            read_result.map_err(SessionError::from)?;
            Ok((out, status))
        })?
    }

    /// Run `cmd` and collect stdout and stderr separately.
    #[allow(clippy::type_complexity)]
    pub fn capture3(
        &self,
        cmd: &Command,
    ) -> Result<(Vec<u8>, Vec<u8>, ExitStatus), SessionError> {
        let stdin_data = cmd.stdin_bytes().map(<[u8]>::to_vec);
        self.popen3(cmd, |stdin, mut stdout, mut stderr, waiter| {
            let feeder = feed_stdin(stdin, stdin_data);
            // Drain stderr on its own thread so neither pipe can fill up
            // and stall the session loop against our stdout read.
            let err_reader = thread::spawn(move || {
                let mut err = Vec::new();
                let result = stderr.read_to_end(&mut err);
                (err, result)
            });
            let mut out = Vec::new();
            let out_result = stdout.read_to_end(&mut out);
            let (err, err_result) = err_reader
                .join()
                .unwrap_or_else(|_| (Vec::new(), Ok(0)));
            let _ = feeder.join();
            let status = waiter.wait()?;
            out_result.map_err(SessionError::from)?;
            err_result.map_err(SessionError::from)?;
            Ok((out, err, status))
        })?
    }
}

/// Write the capture input to the remote stdin from its own thread, then
/// close it. Writing inline could deadlock against an unread output pipe;
/// this is the same shape as feeding a local child's stdin.
fn feed_stdin(mut stdin: PipeWriter, data: Option<Vec<u8>>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if let Some(data) = data
            && let Err(err) = stdin.write_all(&data)
        {
            // Server went away mid-write; the status tells the real story.
            tracing::debug!("capture: stdin write failed: {err}");
        }
    })
}
