//! respin: an asynchronous RESP client with endpoint failover.
//!
//! Commands are serialized into an output buffer, streamed to the server,
//! and matched to per-command callbacks in FIFO order. A [`Client`]
//! registers one master plus any number of replica endpoints and rotates
//! through the list on connect failures or server-side `MOVED`
//! redirections.
//!
//! Everything is single-threaded and cooperative: one [`EventLoop`]
//! drives any number of attached clients, and every callback fires on the
//! thread that calls [`EventLoop::pump`]. Per connection, at most one
//! receive and one send are in flight at any time, and commands may be
//! pipelined without limit.

pub mod config;
pub mod error;
pub mod resp;

mod client;
mod runtime;

pub use client::Client;
pub use error::{Error, ErrorKind};
pub use resp::{format_command, Reply, ReplyReader};
pub use runtime::{
    AsyncContext, ConnectCallback, DisconnectCallback, EventLoop, PumpFlags, ReplyCallback,
};
