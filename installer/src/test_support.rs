//! Scripted fakes for exercising workflows without a network.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use crate::io::executor::{OutputSink, OutputStream};
use crate::io::probe::Probe;
use crate::io::transfer::TransferObserver;
use crate::io::transport::{AuthMethod, ExecEvent, SessionOptions, Transport, TransportFailure};

/// Upload tick size, matching the SSH transport.
pub const PUT_CHUNK_BYTES: u64 = 64 * 1024;

pub fn test_session(user: &str) -> SessionOptions {
    SessionOptions {
        user: user.to_string(),
        port: 22,
        auth_methods: vec![AuthMethod::None, AuthMethod::Publickey],
        connect_timeout: Duration::from_secs(5),
        operation_timeout: None,
        session_timeout: Duration::from_secs(60),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Ending {
    Exit(i32),
    Signal(String),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Output {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Canned response for matching commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedReply {
    output: Vec<Output>,
    ending: Ending,
}

impl ScriptedReply {
    pub fn exit(code: i32) -> Self {
        Self {
            output: Vec::new(),
            ending: Ending::Exit(code),
        }
    }

    pub fn signal(name: &str) -> Self {
        Self {
            output: Vec::new(),
            ending: Ending::Signal(name.to_string()),
        }
    }

    /// Transport-level failure with `message`.
    pub fn failure(message: &str) -> Self {
        Self {
            output: Vec::new(),
            ending: Ending::Failure(message.to_string()),
        }
    }

    /// Append a stdout chunk (delivered as one event, line breaks anywhere).
    pub fn stdout(mut self, chunk: &str) -> Self {
        self.output.push(Output::Stdout(chunk.as_bytes().to_vec()));
        self
    }

    pub fn stderr(mut self, chunk: &str) -> Self {
        self.output.push(Output::Stderr(chunk.as_bytes().to_vec()));
        self
    }
}

struct Rule {
    host: Option<String>,
    needle: String,
    reply: ScriptedReply,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub host: String,
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutCall {
    pub host: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Exec(ExecCall),
    Put(PutCall),
}

/// Transport replaying canned replies and recording every call.
///
/// The first rule whose host matches (or is `None`) and whose needle occurs
/// in the command wins. Unmatched commands exit 0 silently.
#[derive(Default)]
pub struct ScriptedTransport {
    rules: Vec<Rule>,
    failing_puts: HashSet<String>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(mut self, host: Option<&str>, needle: &str, reply: ScriptedReply) -> Self {
        self.rules.push(Rule {
            host: host.map(str::to_string),
            needle: needle.to_string(),
            reply,
        });
        self
    }

    pub fn fail_puts_to(mut self, host: &str) -> Self {
        self.failing_puts.insert(host.to_string());
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Commands run on `host`, in order.
    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec(exec) if exec.host == host => Some(exec.command),
                _ => None,
            })
            .collect()
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Exec(exec) => Some(exec),
                Call::Put(_) => None,
            })
            .collect()
    }

    pub fn puts(&self) -> Vec<PutCall> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Put(put) => Some(put),
                Call::Exec(_) => None,
            })
            .collect()
    }

    /// Hosts touched by any call, in first-contact order.
    pub fn hosts_contacted(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for call in self.calls() {
            let host = match call {
                Call::Exec(exec) => exec.host,
                Call::Put(put) => put.host,
            };
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        hosts
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }

    fn find_reply(&self, host: &str, command: &str) -> Option<&ScriptedReply> {
        self.rules
            .iter()
            .find(|rule| {
                rule.host.as_deref().is_none_or(|h| h == host) && command.contains(&rule.needle)
            })
            .map(|rule| &rule.reply)
    }
}

impl Transport for ScriptedTransport {
    fn exec(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
        _session: &SessionOptions,
        on_event: &mut dyn FnMut(ExecEvent<'_>),
    ) -> Result<(), TransportFailure> {
        self.record(Call::Exec(ExecCall {
            host: host.to_string(),
            command: command.to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
        }));

        let default = ScriptedReply::exit(0);
        let reply = self.find_reply(host, command).unwrap_or(&default);
        if let Ending::Failure(message) = &reply.ending {
            return Err(TransportFailure::new(message.clone()));
        }

        on_event(ExecEvent::Start);
        for output in &reply.output {
            match output {
                Output::Stdout(bytes) => on_event(ExecEvent::Stdout(bytes)),
                Output::Stderr(bytes) => on_event(ExecEvent::Stderr(bytes)),
            }
        }
        match &reply.ending {
            Ending::Exit(code) => {
                on_event(ExecEvent::ExitCode(*code));
                on_event(ExecEvent::Finish);
            }
            Ending::Signal(name) => on_event(ExecEvent::ExitSignal(name.clone())),
            Ending::Failure(_) => {}
        }
        Ok(())
    }

    fn put(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
        _session: &SessionOptions,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportFailure> {
        let content = fs::read(local_path)
            .map_err(|e| TransportFailure::new(format!("read {}: {e}", local_path.display())))?;
        self.record(Call::Put(PutCall {
            host: host.to_string(),
            local_path: local_path.to_path_buf(),
            remote_path: remote_path.to_string(),
            content: content.clone(),
        }));
        if self.failing_puts.contains(host) {
            return Err(TransportFailure::new(format!(
                "{remote_path}: No space left on device"
            )));
        }

        let total = content.len() as u64;
        if total == 0 {
            on_progress(0, 0);
        }
        let mut sent = 0;
        while sent < total {
            sent = (sent + PUT_CHUNK_BYTES).min(total);
            on_progress(sent, total);
        }
        Ok(())
    }
}

/// Probe answering from a fixed set of unreachable hosts.
#[derive(Debug, Default)]
pub struct StaticProbe {
    unreachable: HashSet<String>,
}

impl StaticProbe {
    pub fn unreachable<'a>(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            unreachable: hosts.into_iter().map(str::to_string).collect(),
        }
    }
}

impl Probe for StaticProbe {
    fn is_reachable(&self, host: &str) -> bool {
        !self.unreachable.contains(host)
    }
}

/// Sink keeping everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<(String, OutputStream, String)>>,
    messages: Mutex<Vec<String>>,
}

impl RecordingSink {
    /// Lines from `host` across both streams, in arrival order.
    pub fn lines_for(&self, host: &str) -> Vec<String> {
        self.lines
            .lock()
            .expect("lines lock")
            .iter()
            .filter(|(h, _, _)| h == host)
            .map(|(_, _, line)| line.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("messages lock").clone()
    }
}

impl OutputSink for RecordingSink {
    fn line(&self, host: &str, stream: OutputStream, line: &str) {
        self.lines
            .lock()
            .expect("lines lock")
            .push((host.to_string(), stream, line.to_string()));
    }

    fn message(&self, text: &str) {
        self.messages
            .lock()
            .expect("messages lock")
            .push(text.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverEvent {
    Progress(String, u64, u64),
    Finishing(String),
    Finished(String),
}

#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ObserverEvent>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<ObserverEvent> {
        self.events.lock().expect("events lock").clone()
    }

    fn push(&self, event: ObserverEvent) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl TransferObserver for RecordingObserver {
    fn progress(&self, label: &str, sent: u64, total: u64) {
        self.push(ObserverEvent::Progress(label.to_string(), sent, total));
    }

    fn finishing(&self, label: &str) {
        self.push(ObserverEvent::Finishing(label.to_string()));
    }

    fn finished(&self, label: &str) {
        self.push(ObserverEvent::Finished(label.to_string()));
    }
}
