//! Terminal front-ends for workflow output and transfer progress.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::io::executor::{OutputSink, OutputStream};
use crate::io::transfer::TransferObserver;

const SPINNER_FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// Prints remote output and workflow messages as they arrive.
///
/// Remote stdout and messages go to stdout; remote stderr goes to stderr.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl OutputSink for ConsoleSink {
    fn line(&self, _host: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => println!("{line}"),
            OutputStream::Stderr => eprintln!("{line}"),
        }
    }

    fn message(&self, text: &str) {
        println!("{text}");
    }
}

/// Single-line progress display on stderr.
#[derive(Debug, Default)]
pub struct ConsoleObserver {
    frame: AtomicUsize,
}

impl ConsoleObserver {
    fn redraw(&self, text: &str) {
        let mut stderr = io::stderr().lock();
        // Progress output is best-effort; a closed terminal must not fail the upload.
        let _ = write!(stderr, "\r{text}\x1b[K");
        let _ = stderr.flush();
    }
}

impl TransferObserver for ConsoleObserver {
    fn progress(&self, label: &str, sent: u64, total: u64) {
        self.redraw(&format!("{label}: {:>3}%", percent(sent, total)));
    }

    fn finishing(&self, label: &str) {
        let frame = self.frame.fetch_add(1, Ordering::Relaxed) % SPINNER_FRAMES.len();
        self.redraw(&format!("{label}: finishing {}", SPINNER_FRAMES[frame]));
    }

    fn finished(&self, label: &str) {
        self.redraw(&format!("{label}: done\n"));
    }
}

/// Whole percent of `sent` over `total`, capped below 100 until the upload returns.
pub fn percent(sent: u64, total: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    (sent.saturating_mul(100) / total).min(99)
}
