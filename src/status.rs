//! Termination status of a remote process.
//!
//! The record starts empty and is filled in by the session loop when the
//! server delivers an `exit-status` or `exit-signal` request. Exactly one of
//! the two is set for a normally terminated process; both stay unset when
//! the channel died before termination info arrived.

use std::fmt;

use nix::sys::signal::Signal;

/// How a remote process ended.
///
/// Readable only after the channel's [`Waiter`](crate::Waiter) completes,
/// which happens after the last status-bearing callback has run.
#[derive(Debug, Clone, Default)]
pub struct ExitStatus {
    exit_code: Option<u32>,
    term_signal: Option<String>,
    coredump: bool,
}

impl ExitStatus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Exit code delivered by the server's `exit-status` request, 0..=255.
    pub fn exit_code(&self) -> Option<u32> {
        self.exit_code
    }

    /// Signal name delivered by the server's `exit-signal` request, without
    /// the `SIG` prefix (e.g. `QUIT`).
    pub fn term_signal(&self) -> Option<&str> {
        self.term_signal.as_deref()
    }

    /// Whether the remote process dumped core. Meaningful only when
    /// [`signaled`](Self::signaled); `None` otherwise.
    pub fn coredump(&self) -> Option<bool> {
        self.term_signal.as_ref().map(|_| self.coredump)
    }

    /// True when the process exited normally with a code.
    pub fn exited(&self) -> bool {
        self.exit_code.is_some()
    }

    /// True when the process was terminated by a signal.
    pub fn signaled(&self) -> bool {
        self.term_signal.is_some()
    }

    /// `Some(true)` when the process exited with code 0, `Some(false)` for a
    /// nonzero code, `None` when it was signaled or the status never
    /// arrived. Callers must be able to tell "exited 0" from "killed".
    pub fn success(&self) -> Option<bool> {
        self.exit_code.map(|code| code == 0)
    }

    /// The termination signal translated to the local system's signal
    /// number, `None` when the name has no local mapping.
    ///
    /// The translation goes through the local signal table, so the same
    /// remote signal can map to different numbers on different clients. The
    /// raw name stays available via [`term_signal`](Self::term_signal).
    pub fn signal_number(&self) -> Option<i32> {
        let name = self.term_signal.as_deref()?;
        Signal::iterator()
            .find(|sig| sig.as_str().strip_prefix("SIG") == Some(name))
            .map(|sig| sig as i32)
    }

    pub(crate) fn set_exit_code(&mut self, code: u32) {
        if self.exit_code.is_some() || self.term_signal.is_some() {
            tracing::warn!("exit status: ignoring duplicate exit-status {code}");
            return;
        }
        self.exit_code = Some(code);
    }

    pub(crate) fn set_signal(&mut self, name: String, coredump: bool) {
        if self.exit_code.is_some() || self.term_signal.is_some() {
            tracing::warn!("exit status: ignoring duplicate exit-signal {name}");
            return;
        }
        self.term_signal = Some(name);
        self.coredump = coredump;
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.exit_code, &self.term_signal) {
            (Some(code), _) => write!(f, "exit {code}"),
            (None, Some(name)) if self.coredump => write!(f, "signal {name} (core dumped)"),
            (None, Some(name)) => write!(f, "signal {name}"),
            (None, None) => write!(f, "uninitialized"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_status_is_uninitialized() {
        let status = ExitStatus::new();
        assert!(!status.exited());
        assert!(!status.signaled());
        assert_eq!(status.success(), None);
        assert_eq!(status.coredump(), None);
        assert_eq!(status.to_string(), "uninitialized");
    }

    #[test]
    fn exit_code_zero_is_success() {
        let mut status = ExitStatus::new();
        status.set_exit_code(0);
        assert!(status.exited());
        assert!(!status.signaled());
        assert_eq!(status.success(), Some(true));
        assert_eq!(status.to_string(), "exit 0");
    }

    #[test]
    fn nonzero_exit_code_is_failure() {
        let mut status = ExitStatus::new();
        status.set_exit_code(3);
        assert_eq!(status.success(), Some(false));
        assert_eq!(status.exit_code(), Some(3));
    }

    #[test]
    fn signaled_success_is_unknown() {
        let mut status = ExitStatus::new();
        status.set_signal("QUIT".to_string(), false);
        assert!(status.signaled());
        assert!(!status.exited());
        assert_eq!(status.success(), None);
        assert_eq!(status.coredump(), Some(false));
        assert_eq!(status.to_string(), "signal QUIT");
    }

    #[test]
    fn quit_translates_to_local_number() {
        let mut status = ExitStatus::new();
        status.set_signal("QUIT".to_string(), false);
        assert_eq!(status.signal_number(), Some(libc::SIGQUIT));
        assert_eq!(status.term_signal(), Some("QUIT"));
    }

    #[test]
    fn unknown_signal_name_is_kept_verbatim() {
        let mut status = ExitStatus::new();
        status.set_signal("NOSUCHSIG".to_string(), true);
        assert_eq!(status.signal_number(), None);
        assert_eq!(status.term_signal(), Some("NOSUCHSIG"));
        assert_eq!(status.to_string(), "signal NOSUCHSIG (core dumped)");
    }

    #[test]
    fn first_write_wins() {
        let mut status = ExitStatus::new();
        status.set_exit_code(0);
        status.set_signal("KILL".to_string(), false);
        status.set_exit_code(1);
        assert_eq!(status.exit_code(), Some(0));
        assert!(!status.signaled());
    }
}
