//! Operator console: stdin lines in, rendered results and node events out.
//!
//! Input is read on a dedicated OS thread because stdin reads block. Each
//! line goes through [`NodeHandle::submit`], concurrently with whatever the
//! node's event loop is doing.

use std::{
    io::{self, BufRead},
    thread,
};

use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::SubmitError,
    node::{NodeEvent, NodeHandle, Origin},
};

/// Starts the stdin reader. The thread ends when stdin is exhausted; the
/// node keeps running.
pub fn spawn_console(handle: NodeHandle) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = ?err, "failed to read console input");
                        break;
                    }
                };
                let input = line.trim();
                if input.is_empty() {
                    continue;
                }
                println!("{}", render_submission(&handle.submit(input)));
            }
            debug!("console input closed");
        })
}

/// Prints node events to stdout until the node goes away.
pub fn spawn_event_printer(mut events: broadcast::Receiver<NodeEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("{}", render_event(&event)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "console fell behind node events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

pub fn render_submission(result: &Result<String, SubmitError>) -> String {
    match result {
        Ok(output) => format!("=> {output}"),
        Err(err) => format!("!! {err}"),
    }
}

pub fn render_event(event: &NodeEvent) -> String {
    match event {
        NodeEvent::Connected {
            peer,
            origin: Origin::Dialed,
            ..
        } => format!("*** connected to {peer}"),
        NodeEvent::Connected {
            peer,
            origin: Origin::Accepted,
            ..
        } => format!("*** {peer} joined"),
        NodeEvent::Received {
            payload,
            result: Ok(_),
            ..
        } => format!("<< {}", String::from_utf8_lossy(payload)),
        NodeEvent::Received {
            payload,
            result: Err(err),
            ..
        } => format!("<< {} (error: {err})", String::from_utf8_lossy(payload)),
        NodeEvent::Disconnected { peer, reason, .. } => format!("*** {peer} left: {reason}"),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::error::{CloseReason, EvalError, TransportError};

    fn peer() -> std::net::SocketAddr {
        "127.0.0.1:4000".parse().expect("addr")
    }

    #[test]
    fn submissions() {
        assert_eq!(render_submission(&Ok("3".to_string())), "=> 3");
        assert_eq!(
            render_submission(&Err(SubmitError::Transport(TransportError::NotConnected))),
            "!! no upstream peer is connected"
        );
        assert_eq!(
            render_submission(&Err(EvalError::new("division by zero").into())),
            "!! evaluation failed: division by zero"
        );
    }

    #[test]
    fn events() {
        let dialed = NodeEvent::Connected {
            id: 1,
            peer: peer(),
            origin: Origin::Dialed,
        };
        assert_eq!(render_event(&dialed), "*** connected to 127.0.0.1:4000");

        let received = NodeEvent::Received {
            id: 1,
            payload: Bytes::from_static(b"3"),
            result: Ok("3".to_string()),
        };
        assert_eq!(render_event(&received), "<< 3");

        let failed = NodeEvent::Received {
            id: 1,
            payload: Bytes::from_static(b"(oops)"),
            result: Err(EvalError::new("unknown operator 'oops'")),
        };
        assert_eq!(render_event(&failed), "<< (oops) (error: unknown operator 'oops')");

        let gone = NodeEvent::Disconnected {
            id: 1,
            peer: peer(),
            reason: CloseReason::PeerClosed,
        };
        assert_eq!(render_event(&gone), "*** 127.0.0.1:4000 left: peer closed the connection");
    }
}
