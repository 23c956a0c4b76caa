//! Per-command logging hooks.
//!
//! Commands can observe their own lifecycle and traffic without touching the
//! engine's own `tracing` diagnostics. The four leveled methods are
//! required; the stream hooks have no-op default bodies, so an
//! implementation opts into exactly the callbacks it wants.

use std::fmt;

/// Observer attached to a single command.
pub trait Logger: Send + Sync {
    fn debug(&self, msg: &str);
    fn info(&self, msg: &str);
    fn warn(&self, msg: &str);
    fn error(&self, msg: &str);

    /// Fired once per channel open, before `exec` is sent.
    fn init(&self, peer: &str, command: &str, env: &[(String, String)], pty: bool) {
        let _ = (peer, command, env, pty);
    }

    /// A chunk forwarded from the caller's stdin to the channel.
    fn stdin(&self, data: &[u8]) {
        let _ = data;
    }

    /// A chunk delivered from the channel to the caller's stdout.
    fn stdout(&self, data: &[u8]) {
        let _ = data;
    }

    /// A chunk delivered from the channel's stderr stream.
    fn stderr(&self, data: &[u8]) {
        let _ = data;
    }
}

/// Default logger: routes the leveled methods onto `tracing` targets.
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, msg: &str) {
        tracing::debug!("{msg}");
    }

    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{msg}");
    }

    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }

    fn init(&self, peer: &str, command: &str, env: &[(String, String)], pty: bool) {
        tracing::debug!(
            "spawning on {peer}: {command} (env: {}, pty: {pty})",
            EnvList(env)
        );
    }
}

struct EnvList<'a>(&'a [(String, String)]);

impl fmt::Display for EnvList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("-");
        }
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
