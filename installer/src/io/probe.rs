//! Reachability probe for the SSH control port.
//!
//! Remote operations fail fast with "host not responding" instead of sitting
//! in the client's connection retries.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Answers whether a host currently accepts connections.
pub trait Probe {
    /// Never errors: every failure mode is `false`.
    fn is_reachable(&self, host: &str) -> bool;
}

/// TCP connect probe on a fixed port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Duration,
}

impl TcpProbe {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

impl Probe for TcpProbe {
    fn is_reachable(&self, host: &str) -> bool {
        is_reachable(host, self.port, self.timeout)
    }
}

/// Try to open a TCP connection to `host:port` within `timeout`.
///
/// Name resolution and connecting share the same budget. A successful
/// connection is closed immediately.
pub fn is_reachable(host: &str, port: u16, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    let Some(addrs) = resolve_within(host, port, timeout) else {
        debug!(host, port, "could not resolve host in time");
        return false;
    };

    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&addr, remaining) {
            Ok(_stream) => return true,
            Err(e) => debug!(host, %addr, err = %e, "connect failed"),
        }
    }
    false
}

/// Resolve on a helper thread so a slow resolver cannot exceed `timeout`.
fn resolve_within(host: &str, port: u16, timeout: Duration) -> Option<Vec<SocketAddr>> {
    let target = (host.to_string(), port);
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let resolved = target
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>());
        // The receiver is gone once the probe gave up; nothing to report then.
        let _ = tx.send(resolved);
    });

    match rx.recv_timeout(timeout) {
        Ok(Ok(addrs)) if !addrs.is_empty() => Some(addrs),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn listening_port_is_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert!(is_reachable("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT));
        assert!(TcpProbe::new(port, DEFAULT_PROBE_TIMEOUT).is_reachable("localhost"));
    }

    #[test]
    fn closed_port_is_unreachable_within_bound() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let started = Instant::now();
        assert!(!is_reachable("127.0.0.1", port, DEFAULT_PROBE_TIMEOUT));
        assert!(started.elapsed() < DEFAULT_PROBE_TIMEOUT + Duration::from_millis(500));
    }

    #[test]
    fn unresolvable_host_is_unreachable_within_bound() {
        let timeout = Duration::from_millis(300);
        let started = Instant::now();
        assert!(!is_reachable("no-such-host.invalid", 22, timeout));
        assert!(started.elapsed() < timeout + Duration::from_millis(500));
    }
}
