//! Remote command construction.
//!
//! A [`Command`] collects everything one remote invocation needs: the
//! program tokens, environment, shell redirections, PTY request, the
//! channel-open retry policy and an optional per-command logger. The
//! session turns it into a single command line for the server's `exec`
//! request; redirections are purely textual and interpreted by the remote
//! shell.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use shell_escape::unix::escape;

use crate::logger::Logger;
use crate::pty::PtyRequest;

/// Stream selector for a redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectStream {
    /// Remote stdin, rendered as `<`.
    Stdin,
    /// Remote stdout, rendered as `>`.
    Stdout,
    /// Remote stderr, rendered as `2>`.
    Stderr,
    /// A literal redirection operator used verbatim, e.g. `>>`.
    Operator(String),
}

impl RedirectStream {
    /// A verbatim operator selector.
    pub fn op(operator: impl Into<String>) -> Self {
        RedirectStream::Operator(operator.into())
    }

    fn operator(&self) -> &str {
        match self {
            RedirectStream::Stdin => "<",
            RedirectStream::Stdout => ">",
            RedirectStream::Stderr => "2>",
            RedirectStream::Operator(op) => op,
        }
    }
}

/// Destination of a redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Another file descriptor, rendered as `&N`.
    Fd(u32),
    /// A file path, shell-escaped.
    Path(String),
}

impl From<u32> for RedirectTarget {
    fn from(fd: u32) -> Self {
        RedirectTarget::Fd(fd)
    }
}

impl From<&str> for RedirectTarget {
    fn from(path: &str) -> Self {
        RedirectTarget::Path(path.to_string())
    }
}

impl From<String> for RedirectTarget {
    fn from(path: String) -> Self {
        RedirectTarget::Path(path)
    }
}

/// Channel-open retry policy: up to `retries` further attempts spaced by
/// `delay` after the first refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(1),
        }
    }
}

/// Builder for one remote invocation.
pub struct Command {
    tokens: Vec<String>,
    env: Vec<(String, String)>,
    redirects: Vec<(RedirectStream, RedirectTarget)>,
    pty: Option<PtyRequest>,
    retry: RetryPolicy,
    stdin_data: Option<Vec<u8>>,
    logger: Option<Arc<dyn Logger>>,
}

impl Command {
    /// Start from a program name or, if no further tokens are added, a
    /// complete command line taken verbatim.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            tokens: vec![program.into()],
            env: Vec::new(),
            redirects: Vec::new(),
            pty: None,
            retry: RetryPolicy::default(),
            stdin_data: None,
            logger: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.tokens.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add an environment variable, sent as an `env` request before exec.
    /// Pairs are sent in insertion order.
    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    /// Append a redirection. Redirections render after the command tokens in
    /// declaration order.
    pub fn redirect(
        mut self,
        stream: RedirectStream,
        target: impl Into<RedirectTarget>,
    ) -> Self {
        self.redirects.push((stream, target.into()));
        self
    }

    /// Request a PTY with default terminal name and modes.
    pub fn pty(mut self) -> Self {
        self.pty = Some(PtyRequest::default());
        self
    }

    /// Request a PTY with an explicit request.
    pub fn pty_with(mut self, request: PtyRequest) -> Self {
        self.pty = Some(request);
        self
    }

    /// Override the number of channel-open retries (default 5).
    pub fn retries(mut self, retries: u32) -> Self {
        self.retry.retries = retries;
        self
    }

    /// Override the delay between channel-open retries (default 1 s).
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.delay = delay;
        self
    }

    /// Bytes the capture façades write to the remote stdin before closing
    /// it. Ignored by the popen façades, where the caller owns stdin.
    pub fn stdin_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.stdin_data = Some(data.into());
        self
    }

    /// Attach a per-command [`Logger`].
    pub fn logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub(crate) fn env_pairs(&self) -> &[(String, String)] {
        &self.env
    }

    pub(crate) fn pty_request(&self) -> Option<&PtyRequest> {
        self.pty.as_ref()
    }

    pub(crate) fn shared_logger(&self) -> Option<Arc<dyn Logger>> {
        self.logger.clone()
    }

    pub(crate) fn stdin_bytes(&self) -> Option<&[u8]> {
        self.stdin_data.as_deref()
    }

    /// Assemble the command line: shell-join the tokens (a single token
    /// passes through verbatim), then append the redirections.
    pub(crate) fn command_line(&self) -> String {
        let mut line = if self.tokens.len() == 1 {
            self.tokens[0].clone()
        } else {
            let escaped: Vec<String> = self
                .tokens
                .iter()
                .map(|t| escape(Cow::Borrowed(t.as_str())).into_owned())
                .collect();
            escaped.join(" ")
        };
        for (stream, target) in &self.redirects {
            line.push(' ');
            line.push_str(stream.operator());
            match target {
                RedirectTarget::Fd(fd) => {
                    line.push('&');
                    line.push_str(&fd.to_string());
                }
                RedirectTarget::Path(path) => {
                    line.push_str(&escape(Cow::Borrowed(path.as_str())));
                }
            }
        }
        line
    }
}

/// Validate that a string is a valid environment variable name
/// (`[a-zA-Z_][a-zA-Z0-9_]*`). Servers whitelist accepted names anyway;
/// this keeps obviously malformed ones off the wire.
pub(crate) fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_is_verbatim() {
        let cmd = Command::new("echo hello; echo world");
        assert_eq!(cmd.command_line(), "echo hello; echo world");
    }

    #[test]
    fn multiple_tokens_are_shell_joined() {
        let cmd = Command::new("sh").arg("-c").arg("echo out; echo err 1>&2");
        assert_eq!(cmd.command_line(), "sh -c 'echo out; echo err 1>&2'");
    }

    #[test]
    fn redirect_grammar_matches_shell_syntax() {
        let cmd = Command::new("echo x")
            .redirect(RedirectStream::op(">>"), "/tmp/log")
            .redirect(RedirectStream::Stderr, 1u32);
        assert_eq!(cmd.command_line(), "echo x >>/tmp/log 2>&1");
    }

    #[test]
    fn stream_selectors_map_to_operators() {
        let cmd = Command::new("wc")
            .redirect(RedirectStream::Stdin, "/etc/passwd")
            .redirect(RedirectStream::Stdout, "/tmp/out")
            .redirect(RedirectStream::Stderr, "/dev/null");
        assert_eq!(
            cmd.command_line(),
            "wc </etc/passwd >/tmp/out 2>/dev/null"
        );
    }

    #[test]
    fn redirect_paths_are_shell_escaped() {
        let cmd = Command::new("ls").redirect(RedirectStream::Stdout, "/tmp/my log");
        assert_eq!(cmd.command_line(), "ls >'/tmp/my log'");
    }

    #[test]
    fn env_name_validation() {
        assert!(is_valid_env_name("PATH"));
        assert!(is_valid_env_name("_private"));
        assert!(is_valid_env_name("LC_ALL"));
        assert!(!is_valid_env_name("1BAD"));
        assert!(!is_valid_env_name("BAD-NAME"));
        assert!(!is_valid_env_name(""));
        assert!(!is_valid_env_name("A=B"));
    }

    #[test]
    fn retry_policy_defaults() {
        let policy = Command::new("true").retry_policy();
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(1));
    }
}
