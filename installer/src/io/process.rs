//! Helpers for driving child processes with a deadline and streamed output.

use std::io::{self, ErrorKind, Read};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Instant;

use tracing::{debug, warn};
use wait_timeout::ChildExt;

const READ_CHUNK_BYTES: usize = 8192;

/// Raw output fragment read from the child.
#[derive(Debug)]
pub enum Chunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// How a driven child ended.
#[derive(Debug)]
pub enum Completion {
    Exited(ExitStatus),
    /// Deadline passed; the child was killed.
    TimedOut,
}

/// Child whose stdout/stderr are drained by reader threads into one channel.
///
/// Reading concurrently avoids pipe deadlocks; forwarding through a channel
/// keeps every chunk callback on the caller's thread.
pub struct StreamingChild {
    child: Child,
    chunks: Receiver<Chunk>,
    readers: Vec<thread::JoinHandle<()>>,
}

impl StreamingChild {
    /// Spawn `cmd` with piped output. Returns the stdin pipe when requested.
    pub fn spawn(mut cmd: Command, pipe_stdin: bool) -> io::Result<(Self, Option<ChildStdin>)> {
        if pipe_stdin {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!("spawning child process");
        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take();

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), Chunk::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx, Chunk::Stderr));
        }

        Ok((
            Self {
                child,
                chunks: rx,
                readers,
            },
            stdin,
        ))
    }

    /// Forward chunks until both streams close and the child exits.
    ///
    /// Kills the child if `deadline` passes first.
    pub fn drive(mut self, deadline: Instant, mut on_chunk: impl FnMut(Chunk)) -> io::Result<Completion> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.chunks.recv_timeout(remaining) {
                Ok(chunk) => on_chunk(chunk),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => return self.kill(),
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.child.wait_timeout(remaining)? {
            Some(status) => {
                for reader in self.readers.drain(..) {
                    if reader.join().is_err() {
                        warn!("output reader thread panicked");
                    }
                }
                debug!(exit_code = ?status.code(), "child finished");
                Ok(Completion::Exited(status))
            }
            None => self.kill(),
        }
    }

    fn kill(mut self) -> io::Result<Completion> {
        warn!("deadline passed, killing child");
        self.child.kill()?;
        self.child.wait()?;
        // Readers are left detached: a grandchild may still hold the pipes.
        Ok(Completion::TimedOut)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    tx: Sender<Chunk>,
    wrap: fn(Vec<u8>) -> Chunk,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buf = [0u8; READ_CHUNK_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(wrap(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(err = %e, "failed to read child output");
                    break;
                }
            }
        }
    })
}

/// Keeps the last `limit` bytes of a stream, for failure messages.
#[derive(Debug)]
pub struct TailBuffer {
    bytes: Vec<u8>,
    limit: usize,
}

impl TailBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
        if self.bytes.len() > self.limit {
            let excess = self.bytes.len() - self.limit;
            self.bytes.drain(..excess);
        }
    }

    /// Non-empty lines of the tail joined with `; `, if any.
    pub fn message(&self) -> Option<String> {
        let text = String::from_utf8_lossy(&self.bytes);
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        (!lines.is_empty()).then(|| lines.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tail_keeps_last_bytes_and_joins_lines() {
        let mut tail = TailBuffer::new(16);
        tail.push(b"Warning: noise that is long\n");
        tail.push(b"\nbad key\n");
        assert_eq!(tail.message().as_deref(), Some("s long; bad key"));
        assert_eq!(TailBuffer::new(8).message(), None);
    }

    #[cfg(unix)]
    #[test]
    fn drive_forwards_both_streams_and_exit_status() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf out; printf err >&2; exit 4");
        let (child, stdin) = StreamingChild::spawn(cmd, false).expect("spawn");
        assert!(stdin.is_none());

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let completion = child
            .drive(Instant::now() + Duration::from_secs(10), |chunk| match chunk {
                Chunk::Stdout(bytes) => stdout.extend(bytes),
                Chunk::Stderr(bytes) => stderr.extend(bytes),
            })
            .expect("drive");

        match completion {
            Completion::Exited(status) => assert_eq!(status.code(), Some(4)),
            Completion::TimedOut => panic!("unexpected timeout"),
        }
        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");
    }

    #[cfg(unix)]
    #[test]
    fn drive_kills_child_past_deadline() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("exec sleep 30");
        let (child, _) = StreamingChild::spawn(cmd, false).expect("spawn");
        let started = Instant::now();
        let completion = child
            .drive(Instant::now() + Duration::from_millis(200), |_| {})
            .expect("drive");
        assert!(matches!(completion, Completion::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
