//! Newline-delimited TCP transport hosting the command router.
//!
//! Stands in for the wireless service layer: it delivers decoded command
//! strings to the router and carries notification lines back. One
//! connection is served at a time and every command runs to completion
//! before the next line is read, matching the board's single-threaded,
//! command-driven model.

use crate::error::NotifyError;
use crate::notify::Notifier;
use crate::router::CommandRouter;
use anyhow::{Context, Result};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

/// Notifier writing newline-terminated response lines to the peer.
pub struct TcpNotifier<'a> {
    stream: &'a TcpStream,
}

impl<'a> TcpNotifier<'a> {
    pub fn new(stream: &'a TcpStream) -> Self {
        Self { stream }
    }
}

impl Notifier for TcpNotifier<'_> {
    fn notify(&mut self, line: &str) -> Result<(), NotifyError> {
        let mut out = self.stream;
        out.write_all(line.as_bytes())
            .and_then(|_| out.write_all(b"\n"))
            .and_then(|_| out.flush())
            .map_err(classify)
    }
}

/// Separate the transport's transient exhaustion from permanent channel
/// loss; only the former is worth the governor's retry loop.
fn classify(e: std::io::Error) -> NotifyError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::OutOfMemory
        | ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::TimedOut => NotifyError::Transient(e.to_string()),
        _ => NotifyError::Permanent(e.to_string()),
    }
}

pub fn serve(bind: &str, router: &mut CommandRouter) -> Result<()> {
    let listener = TcpListener::bind(bind).with_context(|| format!("bind {}", bind))?;
    eprintln!("firmup listening on {bind}");

    for conn in listener.incoming() {
        match conn {
            Ok(stream) => {
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                eprintln!("conn from {peer}");
                if let Err(e) = handle_conn(&stream, router) {
                    eprintln!("connection error (possible client disconnect): {e}");
                }
            }
            Err(e) => {
                eprintln!("accept error: {e}");
            }
        }
    }
    Ok(())
}

fn handle_conn(stream: &TcpStream, router: &mut CommandRouter) -> Result<()> {
    let reader = BufReader::new(stream.try_clone().context("clone stream")?);
    for line in reader.lines() {
        let line = line.context("read command line")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut notifier = TcpNotifier::new(stream);
        router.handle(trimmed, &mut notifier);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oom_is_transient_everything_else_permanent() {
        let oom = std::io::Error::new(std::io::ErrorKind::OutOfMemory, "enobufs");
        assert!(matches!(classify(oom), NotifyError::Transient(_)));

        let gone = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "peer gone");
        assert!(matches!(classify(gone), NotifyError::Permanent(_)));
    }
}
