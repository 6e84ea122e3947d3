//! Transport backed by the platform `ssh` client.
//!
//! Authentication is delegated to the client and its agent: the installer
//! never handles key material. `BatchMode` guarantees the client fails
//! instead of prompting.
//!
//! The client's own exit status cannot tell a remote `exit 255` or a remote
//! signal from a connection failure, so commands run inside a wrapper that
//! reports the remote outcome as a stderr trailer (see
//! [`crate::core::remote_exit`]). Status 255 without a trailer is the only
//! transport failure.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus};
use std::time::Instant;

use tracing::{debug, instrument, warn};

use crate::core::remote_exit::{RemoteExit, TRAILER_SCRIPT, TrailerFilter};
use crate::io::process::{Chunk, Completion, StreamingChild, TailBuffer};
use crate::io::shell;
use crate::io::transport::{
    AuthMethod, ExecEvent, SessionOptions, Transport, TransportFailure,
};

/// Exit status the OpenSSH client uses for its own errors.
pub const SSH_FAILURE_STATUS: i32 = 255;

const STDERR_TAIL_BYTES: usize = 4096;
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Drives `ssh` as a child process, one invocation per operation.
#[derive(Debug, Clone)]
pub struct SshTransport {
    program: String,
    host_key_checking: String,
}

impl SshTransport {
    pub fn new(program: impl Into<String>, host_key_checking: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            host_key_checking: host_key_checking.into(),
        }
    }

    fn command(&self, host: &str, session: &SessionOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(ssh_args(host, session, &self.host_key_checking));
        cmd
    }

    fn spawn_failure(&self, err: std::io::Error) -> TransportFailure {
        TransportFailure::new(format!("spawn {}: {err}", self.program))
    }
}

/// Remote command line running `command` in its own shell, followed by the
/// exit trailer.
pub fn wrap_remote(command: &str) -> String {
    format!("sh -c {}; rc=$?; {TRAILER_SCRIPT}", shell::quote(command))
}

/// Client arguments up to and including the destination host.
pub fn ssh_args(host: &str, session: &SessionOptions, host_key_checking: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", session.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        format!("StrictHostKeyChecking={host_key_checking}"),
    ];

    let preferred: Vec<&str> = session
        .auth_methods
        .iter()
        .filter_map(|method| match method {
            // `none` is always attempted first by the client.
            AuthMethod::None => None,
            AuthMethod::Publickey => Some("publickey"),
            AuthMethod::Password => Some("password,keyboard-interactive"),
        })
        .collect();
    if !preferred.is_empty() {
        args.push("-o".to_string());
        args.push(format!("PreferredAuthentications={}", preferred.join(",")));
    }
    if !session.auth_methods.contains(&AuthMethod::Password) {
        args.push("-o".to_string());
        args.push("PasswordAuthentication=no".to_string());
        args.push("-o".to_string());
        args.push("KbdInteractiveAuthentication=no".to_string());
    }

    args.push("-p".to_string());
    args.push(session.port.to_string());
    args.push("-l".to_string());
    args.push(session.user.clone());
    args.push(host.to_string());
    args
}

impl Transport for SshTransport {
    #[instrument(skip_all, fields(host = %host))]
    fn exec(
        &self,
        host: &str,
        command: &str,
        stdin: Option<&[u8]>,
        session: &SessionOptions,
        on_event: &mut dyn FnMut(ExecEvent<'_>),
    ) -> Result<(), TransportFailure> {
        let mut cmd = self.command(host, session);
        cmd.arg(wrap_remote(command));

        let deadline = Instant::now() + session.command_deadline();
        let (child, child_stdin) =
            StreamingChild::spawn(cmd, stdin.is_some()).map_err(|e| self.spawn_failure(e))?;
        on_event(ExecEvent::Start);

        if let (Some(input), Some(mut pipe)) = (stdin, child_stdin) {
            // The remote side may exit without reading; that is not an error here.
            if let Err(e) = pipe.write_all(input) {
                debug!(err = %e, "remote command did not read stdin");
            }
        }

        let mut stderr_tail = TailBuffer::new(STDERR_TAIL_BYTES);
        let mut trailer = TrailerFilter::new();
        let completion = child
            .drive(deadline, |chunk| match chunk {
                Chunk::Stdout(bytes) => on_event(ExecEvent::Stdout(&bytes)),
                Chunk::Stderr(bytes) => {
                    let visible = trailer.push(&bytes);
                    if !visible.is_empty() {
                        stderr_tail.push(&visible);
                        on_event(ExecEvent::Stderr(&visible));
                    }
                }
            })
            .map_err(|e| TransportFailure::new(format!("wait for {}: {e}", self.program)))?;

        let (rest, remote_exit) = trailer.finish();
        if !rest.is_empty() {
            stderr_tail.push(&rest);
            on_event(ExecEvent::Stderr(&rest));
        }

        let status = match completion {
            Completion::TimedOut => {
                return Err(TransportFailure::new(format!(
                    "command on {host} exceeded {}s",
                    session.command_deadline().as_secs()
                )));
            }
            Completion::Exited(status) => status,
        };
        match (remote_exit, status.code()) {
            (Some(RemoteExit::Status(code)), _) => {
                on_event(ExecEvent::ExitCode(code));
                on_event(ExecEvent::Finish);
                Ok(())
            }
            (Some(RemoteExit::Signal(name)), _) => {
                on_event(ExecEvent::ExitSignal(name));
                Ok(())
            }
            (None, Some(SSH_FAILURE_STATUS)) => Err(TransportFailure::new(
                stderr_tail.message().unwrap_or_else(|| {
                    format!("{} exited with status {SSH_FAILURE_STATUS}", self.program)
                }),
            )),
            (None, Some(code)) => {
                debug!(code, "remote command ended without exit trailer");
                on_event(ExecEvent::ExitCode(code));
                on_event(ExecEvent::Finish);
                Ok(())
            }
            (None, None) => Err(TransportFailure::new(format!(
                "{} terminated by signal {}",
                self.program,
                signal_name(&status)
            ))),
        }
    }

    #[instrument(skip_all, fields(host = %host, remote_path = %remote_path))]
    fn put(
        &self,
        host: &str,
        local_path: &Path,
        remote_path: &str,
        session: &SessionOptions,
        on_progress: &mut dyn FnMut(u64, u64),
    ) -> Result<(), TransportFailure> {
        let mut file = File::open(local_path).map_err(|e| {
            TransportFailure::new(format!("open {}: {e}", local_path.display()))
        })?;
        let total = file
            .metadata()
            .map_err(|e| TransportFailure::new(format!("stat {}: {e}", local_path.display())))?
            .len();

        let mut cmd = self.command(host, session);
        cmd.arg(format!("cat > {}", shell::quote(remote_path)));

        let deadline = Instant::now() + session.command_deadline();
        let (child, stdin) = StreamingChild::spawn(cmd, true).map_err(|e| self.spawn_failure(e))?;
        let mut pipe = stdin.ok_or_else(|| TransportFailure::new("stdin was not piped"))?;

        let mut sent = 0u64;
        let mut buf = vec![0u8; UPLOAD_CHUNK_BYTES];
        let streamed: Result<(), String> = loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(format!("read {}: {e}", local_path.display())),
            };
            if let Err(e) = pipe.write_all(&buf[..n]) {
                break Err(format!("write to {host}: {e}"));
            }
            sent += n as u64;
            on_progress(sent, total);
        };
        if total == 0 {
            on_progress(0, 0);
        }
        drop(pipe);
        debug!(sent, total, "upload stream closed");

        let mut stderr_tail = TailBuffer::new(STDERR_TAIL_BYTES);
        let completion = child
            .drive(deadline, |chunk| {
                if let Chunk::Stderr(bytes) = chunk {
                    stderr_tail.push(&bytes);
                }
            })
            .map_err(|e| TransportFailure::new(format!("wait for {}: {e}", self.program)))?;

        match completion {
            Completion::TimedOut => Err(TransportFailure::new(format!(
                "upload to {host} exceeded {}s",
                session.command_deadline().as_secs()
            ))),
            Completion::Exited(status) if status.success() => {
                streamed.map_err(TransportFailure::new)
            }
            Completion::Exited(status) => {
                warn!(exit_code = ?status.code(), "upload failed");
                Err(TransportFailure::new(stderr_tail.message().unwrap_or_else(
                    || match streamed {
                        Err(message) => message,
                        Ok(()) => format!("upload to {host}:{remote_path} failed ({status})"),
                    },
                )))
            }
        }
    }
}

#[cfg(unix)]
fn signal_name(status: &ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(1) => "HUP".to_string(),
        Some(2) => "INT".to_string(),
        Some(3) => "QUIT".to_string(),
        Some(6) => "ABRT".to_string(),
        Some(9) => "KILL".to_string(),
        Some(13) => "PIPE".to_string(),
        Some(14) => "ALRM".to_string(),
        Some(15) => "TERM".to_string(),
        Some(other) => format!("SIG{other}"),
        None => "UNKNOWN".to_string(),
    }
}

#[cfg(not(unix))]
fn signal_name(_status: &ExitStatus) -> String {
    "UNKNOWN".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn session() -> SessionOptions {
        SessionOptions {
            user: "deploy".to_string(),
            port: 2222,
            auth_methods: vec![AuthMethod::None, AuthMethod::Publickey],
            connect_timeout: Duration::from_secs(60),
            operation_timeout: None,
            session_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn args_disable_prompts_and_passwords() {
        let args = ssh_args("web1", &session(), "accept-new");
        let joined = args.join(" ");
        assert!(joined.contains("BatchMode=yes"));
        assert!(joined.contains("ConnectTimeout=60"));
        assert!(joined.contains("PreferredAuthentications=publickey"));
        assert!(joined.contains("PasswordAuthentication=no"));
        assert!(joined.ends_with("-p 2222 -l deploy web1"));
    }

    /// Write an executable stand-in for the client into `dir`.
    #[cfg(unix)]
    fn write_client(dir: &Path, name: &str, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake ssh");
        let mut perms = std::fs::metadata(&path).expect("stat").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
        path.display().to_string()
    }

    /// Stand-in client: ignores every option and runs the last argument
    /// locally. Like OpenSSH, it exits 255 when the remote shell dies from a
    /// signal and passes any other status through.
    #[cfg(unix)]
    fn fake_ssh(dir: &Path) -> String {
        write_client(
            dir,
            "fake-ssh",
            "for last; do :; done\n\
             sh -c \"$last\"\n\
             rc=$?\n\
             if [ \"$rc\" -gt 128 ]; then exit 255; fi\n\
             exit \"$rc\"\n",
        )
    }

    #[cfg(unix)]
    struct Collected {
        result: Result<(), TransportFailure>,
        kinds: Vec<String>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    }

    #[cfg(unix)]
    fn collect_exec(transport: &SshTransport, command: &str, stdin: Option<&[u8]>) -> Collected {
        let mut kinds = Vec::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let result = transport.exec("web1", command, stdin, &session(), &mut |event| {
            match event {
                ExecEvent::Start => kinds.push("start".to_string()),
                ExecEvent::Stdout(bytes) => stdout.extend_from_slice(bytes),
                ExecEvent::Stderr(bytes) => stderr.extend_from_slice(bytes),
                ExecEvent::ExitCode(code) => kinds.push(format!("exit:{code}")),
                ExecEvent::ExitSignal(signal) => kinds.push(format!("signal:{signal}")),
                ExecEvent::Finish => kinds.push("finish".to_string()),
            }
        });
        Collected {
            result,
            kinds,
            stdout,
            stderr,
        }
    }

    #[test]
    fn wrapped_command_runs_in_its_own_shell() {
        let wrapped = wrap_remote("echo it's; exit 3");
        assert!(wrapped.starts_with("sh -c 'echo it'\\''s; exit 3'; rc=$?; "));
        assert!(wrapped.contains("installer-exit status"));
    }

    #[cfg(unix)]
    #[test]
    fn exec_streams_output_and_reports_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let run = collect_exec(&transport, "printf 'a\\nb'; echo oops >&2; exit 3", None);
        run.result.expect("exec");
        assert_eq!(run.kinds, vec!["start", "exit:3", "finish"]);
        assert_eq!(run.stdout, b"a\nb");
        assert_eq!(run.stderr, b"oops\n");
    }

    #[cfg(unix)]
    #[test]
    fn exec_forwards_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let run = collect_exec(&transport, "read line; echo got:$line", Some(b"pw\n"));
        run.result.expect("exec");
        assert_eq!(run.stdout, b"got:pw\n");
    }

    #[cfg(unix)]
    #[test]
    fn remote_exit_255_is_an_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let run = collect_exec(&transport, "echo installer failed >&2; exit 255", None);
        run.result.expect("exec");
        assert_eq!(run.kinds, vec!["start", "exit:255", "finish"]);
        assert_eq!(run.stderr, b"installer failed\n");
    }

    #[cfg(unix)]
    #[test]
    fn remote_signal_is_reported_without_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let run = collect_exec(&transport, "kill -TERM $$", None);
        run.result.expect("exec");
        assert_eq!(run.kinds, vec!["start", "signal:TERM"]);
        assert!(run.stderr.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn remote_stderr_mentioning_auth_is_ordinary_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let run = collect_exec(
            &transport,
            "echo 'git@forge: Permission denied (publickey).' >&2; exit 1",
            None,
        );
        run.result.expect("exec");
        assert_eq!(run.kinds, vec!["start", "exit:1", "finish"]);
        assert_eq!(run.stderr, b"git@forge: Permission denied (publickey).\n");
    }

    #[cfg(unix)]
    #[test]
    fn client_status_255_without_trailer_is_a_transport_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let client = write_client(
            temp.path(),
            "refusing-ssh",
            "echo 'deploy@web1: Permission denied (publickey).' >&2\nexit 255\n",
        );
        let transport = SshTransport::new(client, "accept-new");

        let run = collect_exec(&transport, "true", None);
        let failure = run.result.unwrap_err();
        assert!(failure.message.contains("Permission denied (publickey)"));
        assert_eq!(run.kinds, vec!["start"]);
    }

    #[cfg(unix)]
    #[test]
    fn killed_client_is_a_transport_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let client = write_client(temp.path(), "killed-ssh", "kill -TERM $$\n");
        let transport = SshTransport::new(client, "accept-new");

        let run = collect_exec(&transport, "true", None);
        let failure = run.result.unwrap_err();
        assert!(failure.message.contains("terminated by signal TERM"));
        assert_eq!(run.kinds, vec!["start"]);
    }

    #[test]
    fn exec_missing_client_is_a_transport_failure() {
        let transport = SshTransport::new("/nonexistent/ssh-client", "accept-new");
        let failure = transport
            .exec("web1", "true", None, &session(), &mut |_| {})
            .unwrap_err();
        assert!(failure.message.contains("spawn /nonexistent/ssh-client"));
    }

    #[cfg(unix)]
    #[test]
    fn put_streams_file_and_reports_progress() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let local = temp.path().join("payload.bin");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&local, &payload).expect("write payload");
        let remote = temp.path().join("uploaded copy.bin");

        let mut ticks = Vec::new();
        transport
            .put(
                "web1",
                &local,
                &remote.display().to_string(),
                &session(),
                &mut |sent, total| ticks.push((sent, total)),
            )
            .expect("put");

        assert_eq!(std::fs::read(&remote).expect("read upload"), payload);
        assert!(ticks.len() > 1);
        assert!(ticks.windows(2).all(|w| w[0].0 < w[1].0));
        assert_eq!(ticks.last(), Some(&(200_000, 200_000)));
    }

    #[cfg(unix)]
    #[test]
    fn put_into_missing_directory_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let transport = SshTransport::new(fake_ssh(temp.path()), "accept-new");

        let local = temp.path().join("payload.txt");
        std::fs::write(&local, "data").expect("write payload");
        let remote = temp.path().join("missing").join("payload.txt");

        let result = transport.put(
            "web1",
            &local,
            &remote.display().to_string(),
            &session(),
            &mut |_, _| {},
        );
        assert!(result.is_err());
    }
}
