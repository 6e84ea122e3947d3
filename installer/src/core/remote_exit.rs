//! Remote exit reporting carried in-band on stderr.
//!
//! The `ssh` client folds the remote outcome into its own exit status: a
//! remote `exit 255` looks like a client error, and a remote signal makes the
//! client exit 255 too. The remote wrapper therefore prints a trailer line
//! naming the outcome as the very last thing on stderr, and [`TrailerFilter`]
//! strips it from the stream again.

/// Start of the trailer line. The leading unit separator keeps it apart from
/// ordinary output.
pub const TRAILER_MARKER: &[u8] = b"\x1finstaller-exit ";

/// How the remote command ended, as reported by the trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteExit {
    Status(i32),
    Signal(String),
}

/// Shell snippet run after the user command; expects its status in `$rc`.
///
/// Statuses above 128 that `kill -l` can name are reported as signals.
pub const TRAILER_SCRIPT: &str = "if [ \"$rc\" -gt 128 ] && sig=$(kill -l \"$rc\" 2>/dev/null); \
then printf '\\037installer-exit signal %s\\n' \"$sig\" >&2; \
else printf '\\037installer-exit status %s\\n' \"$rc\" >&2; fi";

/// Removes the trailer from a stderr byte stream.
///
/// Bytes that may begin the trailer are held back until they either stop
/// matching the marker or the stream ends.
#[derive(Debug, Default)]
pub struct TrailerFilter {
    held: Vec<u8>,
}

impl TrailerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the bytes that are certainly not trailer.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.held.extend_from_slice(chunk);

        let mut out = Vec::new();
        loop {
            let Some(at) = self.held.iter().position(|b| *b == TRAILER_MARKER[0]) else {
                out.append(&mut self.held);
                break;
            };
            out.extend(self.held.drain(..at));
            let n = self.held.len().min(TRAILER_MARKER.len());
            if self.held[..n] == TRAILER_MARKER[..n] {
                break;
            }
            out.push(self.held.remove(0));
        }
        out
    }

    /// End of stream: the remaining output and the parsed trailer, if any.
    pub fn finish(self) -> (Vec<u8>, Option<RemoteExit>) {
        let mut held = self.held;
        let last = held
            .windows(TRAILER_MARKER.len())
            .rposition(|window| window == TRAILER_MARKER);
        if let Some(at) = last {
            if let Some(exit) = parse_trailer(&held[at + TRAILER_MARKER.len()..]) {
                held.truncate(at);
                return (held, Some(exit));
            }
        }
        (held, None)
    }
}

fn parse_trailer(rest: &[u8]) -> Option<RemoteExit> {
    let text = std::str::from_utf8(rest).ok()?;
    let line = text.strip_suffix('\n').unwrap_or(text);
    if line.contains('\n') {
        return None;
    }
    match line.split_once(' ')? {
        ("status", code) => code.parse().ok().map(RemoteExit::Status),
        ("signal", name) if !name.is_empty() => Some(RemoteExit::Signal(
            name.strip_prefix("SIG").unwrap_or(name).to_string(),
        )),
        _ => None,
    }
}
