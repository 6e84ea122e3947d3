//! Remote command execution with streamed, line-reassembled output.
//!
//! [`RemoteExecutor::run`] probes the control port, hands the command to the
//! [`Transport`], and turns the event stream into a [`RemoteCommandResult`].
//! Each invocation owns its own [`StreamHandler`], so line buffers are never
//! shared across hosts or commands.

use std::path::Path;

use tracing::{debug, instrument, warn};

use crate::core::lines::LineBuffer;
use crate::core::types::RemoteCommandResult;
use crate::error::InstallError;
use crate::io::probe::Probe;
use crate::io::transport::{ExecEvent, SessionOptions, Transport, TransportFailure};

/// Transport messages that mean the server rejected our credentials.
const AUTH_FAILURE_SIGNATURES: [&str; 4] = [
    "Permission denied (publickey",
    "AuthenticationFailed",
    "Too many authentication failures",
    "No more authentication methods",
];

pub fn is_auth_failure(message: &str) -> bool {
    let lowered = message.to_lowercase();
    AUTH_FAILURE_SIGNATURES
        .iter()
        .any(|signature| lowered.contains(&signature.to_lowercase()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives workflow output as soon as it is available.
pub trait OutputSink {
    /// One complete line of remote output.
    fn line(&self, host: &str, stream: OutputStream, line: &str);

    /// A workflow message (progress, per-host failures, status headers).
    fn message(&self, text: &str);
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    /// Forward lines to the sink only; leave the result's line lists empty.
    pub suppress_output_capture: bool,
    /// Capture lines without forwarding them to the sink.
    pub quiet: bool,
    pub stdin: Option<Vec<u8>>,
}

/// Where an invocation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    Connecting,
    Streaming,
    Completed,
    Signalled,
}

/// Folds transport events of one invocation into a result.
pub struct StreamHandler<'a> {
    host: &'a str,
    sink: &'a dyn OutputSink,
    capture: bool,
    forward: bool,
    stdout: LineBuffer,
    stderr: LineBuffer,
    state: ExecState,
    result: RemoteCommandResult,
}

impl<'a> StreamHandler<'a> {
    pub fn new(host: &'a str, sink: &'a dyn OutputSink, capture: bool) -> Self {
        Self {
            host,
            sink,
            capture,
            forward: true,
            stdout: LineBuffer::new(),
            stderr: LineBuffer::new(),
            state: ExecState::Connecting,
            result: RemoteCommandResult::default(),
        }
    }

    /// Stop forwarding lines to the sink.
    pub fn quiet(mut self) -> Self {
        self.forward = false;
        self
    }

    pub fn state(&self) -> ExecState {
        self.state
    }

    pub fn handle(&mut self, event: ExecEvent<'_>) {
        match event {
            ExecEvent::Start => self.state = ExecState::Streaming,
            ExecEvent::Stdout(chunk) => {
                let lines = self.stdout.push(chunk);
                self.emit(OutputStream::Stdout, lines);
            }
            ExecEvent::Stderr(chunk) => {
                let lines = self.stderr.push(chunk);
                self.emit(OutputStream::Stderr, lines);
            }
            ExecEvent::ExitCode(code) => {
                self.result.exit_code = Some(code);
                self.result.signal = None;
                self.state = ExecState::Completed;
            }
            ExecEvent::ExitSignal(signal) => {
                self.result.signal = Some(signal);
                self.result.exit_code = None;
                self.state = ExecState::Signalled;
            }
            ExecEvent::Finish => self.flush(),
        }
    }

    /// Flush partial lines and return the result.
    pub fn finish(mut self) -> RemoteCommandResult {
        self.flush();
        self.result
    }

    fn flush(&mut self) {
        if let Some(line) = self.stdout.finish() {
            self.emit(OutputStream::Stdout, vec![line]);
        }
        if let Some(line) = self.stderr.finish() {
            self.emit(OutputStream::Stderr, vec![line]);
        }
    }

    fn emit(&mut self, stream: OutputStream, lines: Vec<String>) {
        for line in lines {
            if self.forward {
                self.sink.line(self.host, stream, &line);
            }
            if self.capture {
                match stream {
                    OutputStream::Stdout => self.result.stdout_lines.push(line),
                    OutputStream::Stderr => self.result.stderr_lines.push(line),
                }
            }
        }
    }
}

/// Runs commands and uploads against hosts for one session configuration.
pub struct RemoteExecutor<'a> {
    transport: &'a dyn Transport,
    probe: &'a dyn Probe,
    sink: &'a dyn OutputSink,
    session: SessionOptions,
}

impl<'a> RemoteExecutor<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        probe: &'a dyn Probe,
        sink: &'a dyn OutputSink,
        session: SessionOptions,
    ) -> Self {
        Self {
            transport,
            probe,
            sink,
            session,
        }
    }

    pub fn sink(&self) -> &'a dyn OutputSink {
        self.sink
    }

    pub fn is_reachable(&self, host: &str) -> bool {
        self.probe.is_reachable(host)
    }

    pub fn ensure_reachable(&self, host: &str) -> Result<(), InstallError> {
        if self.probe.is_reachable(host) {
            Ok(())
        } else {
            warn!(host, port = self.session.port, "host not responding");
            Err(InstallError::Unreachable {
                host: host.to_string(),
            })
        }
    }

    /// Run `command` on `host`.
    ///
    /// A non-zero exit or a signal is a normal result; callers decide whether
    /// it fails their workflow.
    #[instrument(skip_all, fields(host = %host))]
    pub fn run(
        &self,
        host: &str,
        command: &str,
        opts: &CommandOptions,
    ) -> Result<RemoteCommandResult, InstallError> {
        self.ensure_reachable(host)?;

        let mut handler = StreamHandler::new(host, self.sink, !opts.suppress_output_capture);
        if opts.quiet {
            handler = handler.quiet();
        }
        self.transport
            .exec(
                host,
                command,
                opts.stdin.as_deref(),
                &self.session,
                &mut |event| handler.handle(event),
            )
            .map_err(|failure| self.classify(host, failure))?;

        let result = handler.finish();
        debug!(
            exit_code = ?result.exit_code,
            signal = ?result.signal,
            "remote command finished"
        );
        Ok(result)
    }

    /// Upload through the transport with the same probe and error mapping as [`Self::run`].
    #[instrument(skip_all, fields(host = %host, remote_path = %remote_path))]
    pub fn put(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), InstallError> {
        self.ensure_reachable(host)?;
        self.transport
            .put(host, local_path, remote_path, &self.session, on_progress)
            .map_err(|failure| self.classify(host, failure))
    }

    fn classify(&self, host: &str, failure: TransportFailure) -> InstallError {
        if is_auth_failure(&failure.message) {
            warn!(host, user = %self.session.user, "authentication failed");
            InstallError::Authentication {
                user: self.session.user.clone(),
                host: host.to_string(),
            }
        } else {
            warn!(host, message = %failure.message, "transport failure");
            InstallError::Transport {
                host: host.to_string(),
                message: failure.message,
            }
        }
    }
}
