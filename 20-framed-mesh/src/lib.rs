//! Length-prefixed message transport over TCP.
//!
//! Nodes exchange frames: a big-endian `u32` length that counts its own four
//! bytes, then an opaque payload. Each received payload is handed to an
//! evaluator and the result is routed back out. Each module focuses on a
//! concrete responsibility:
//!
//! - [`frame`] encodes and decodes frames on async streams.
//! - [`connection`] runs one peer's read and write tasks behind a cloneable
//!   handle with a FIFO write queue.
//! - [`acceptor`] and [`connector`] establish connections, the latter with
//!   exponential backoff.
//! - [`registry`] fans payloads out to a group and replays recent history to
//!   late joiners.
//! - [`node`] wires all of the above to an [`evaluator::Evaluator`].
//! - [`cli`] and [`console`] back the `framed_mesh` binary.
//!
//! Integration tests drive real loopback sockets through this crate.

pub mod acceptor;
pub mod cli;
pub mod connection;
pub mod connector;
pub mod console;
pub mod endpoint;
pub mod error;
pub mod evaluator;
pub mod frame;
pub mod node;
pub mod registry;
