//! Shared handle to an asynchronous connection.
//!
//! The loop, the application, and the descriptor slot all need to reach
//! the same context; [`Client`] is the cloneable handle that ties them
//! together. Everything is single-threaded: callbacks run on the thread
//! that pumps the loop, so no locking is involved.

use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use crate::error::Error;
use crate::runtime::context::{AsyncContext, ContextHandle, ReplyCallback};

/// Cloneable handle to one asynchronous connection.
#[derive(Clone)]
pub struct Client {
    inner: ContextHandle,
}

impl Client {
    /// An empty context with no endpoints.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(AsyncContext::init())),
        }
    }

    /// A context pre-loaded with one endpoint.
    ///
    /// A resolution failure is recorded on the context and reported again
    /// at attach time.
    pub fn connect(host: &str, port: u16) -> Self {
        let client = Self::new();
        if let Err(err) = client.inner.borrow_mut().add_endpoint(host, port) {
            warn!(host, port, error = %err, "endpoint resolution failed");
        }
        client
    }

    /// Append a replica endpoint to the failover list.
    pub fn add_endpoint(&self, host: &str, port: u16) -> Result<(), Error> {
        self.inner.borrow_mut().add_endpoint(host, port)
    }

    /// Submit a command; see [`AsyncContext::command_argv`].
    pub fn command_argv(&self, argv: &[&[u8]], cb: Option<ReplyCallback>) -> Result<(), Error> {
        self.inner.borrow_mut().command_argv(argv, cb)
    }

    /// Submit preformatted RESP bytes; see
    /// [`AsyncContext::formatted_command`].
    pub fn formatted_command(&self, cmd: &[u8], cb: Option<ReplyCallback>) -> Result<(), Error> {
        self.inner.borrow_mut().formatted_command(cmd, cb)
    }

    /// Request a clean shutdown; see [`AsyncContext::disconnect`].
    ///
    /// Inside a reply callback, call `disconnect` on the context argument
    /// instead of on a captured handle.
    pub fn disconnect(&self) {
        self.inner.borrow_mut().disconnect();
    }

    /// Last error recorded on the context.
    pub fn last_error(&self) -> Option<Error> {
        self.inner.borrow().err.clone()
    }

    pub(crate) fn handle(&self) -> &ContextHandle {
        &self.inner
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}
