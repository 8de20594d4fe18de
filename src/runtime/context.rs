//! Per-connection client state.
//!
//! The context carries everything that survives across completions for one
//! logical connection: flags, the output buffer, the reply reader, the
//! failover node list, the pending-callback queue, and the lifecycle
//! hooks. The event-loop slot cross-references the context through a
//! shared handle; the context keeps a non-owning [`SlotHandle`] back.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;
use bytes::BytesMut;

use crate::error::{Error, ErrorKind};
use crate::resp::{format_command, Reply, ReplyReader};
use crate::runtime::driver;
use crate::runtime::node::NodeList;
use crate::runtime::slot::SlotHandle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct ContextFlags: u8 {
        /// A write is in flight or scheduled; do not schedule another.
        const BLOCK = 1 << 0;
        /// The connection handshake has completed at least once.
        const CONNECTED = 1 << 1;
        /// Teardown requested; no new commands are accepted.
        const DISCONNECTING = 1 << 2;
        /// A user callback is on the stack; the final free is deferred.
        const IN_CALLBACK = 1 << 3;
        /// The context is being torn down for good.
        const FREEING = 1 << 4;
    }
}

/// Per-command callback. Invoked exactly once: with the matched reply, or
/// with `None` when the connection is torn down first.
pub type ReplyCallback = Box<dyn FnOnce(&mut AsyncContext, Option<Reply>)>;

/// Invoked once, when the first connect attempt succeeds or finally fails.
pub type ConnectCallback = Box<dyn FnOnce(&mut AsyncContext, Result<(), Error>)>;

/// Invoked once, when an established connection is torn down for good.
pub type DisconnectCallback = Box<dyn FnOnce(&mut AsyncContext, Result<(), Error>)>;

pub(crate) type ContextHandle = Rc<RefCell<AsyncContext>>;

/// State of one asynchronous connection.
pub struct AsyncContext {
    pub(crate) err: Option<Error>,
    pub(crate) flags: ContextFlags,
    /// Output buffer; commands accumulate here until a send is armed.
    pub(crate) obuf: BytesMut,
    /// Reply parser, allocated once the connection is established.
    pub(crate) reader: Option<ReplyReader>,
    pub(crate) nodes: NodeList,
    /// Slot reference, present while attached to a loop.
    pub(crate) event_data: Option<SlotHandle>,
    pub(crate) on_connect: Option<ConnectCallback>,
    pub(crate) on_disconnect: Option<DisconnectCallback>,
    /// Pending reply callbacks, one entry per submitted command.
    pub(crate) replies: VecDeque<Option<ReplyCallback>>,
}

impl AsyncContext {
    /// Writes stay blocked until the first connect completes.
    pub(crate) fn init() -> Self {
        Self {
            err: None,
            flags: ContextFlags::BLOCK,
            obuf: BytesMut::new(),
            reader: None,
            nodes: NodeList::default(),
            event_data: None,
            on_connect: None,
            on_disconnect: None,
            replies: VecDeque::new(),
        }
    }

    /// Last recorded error.
    pub fn error(&self) -> Option<&Error> {
        self.err.as_ref()
    }

    /// Whether the connection handshake has completed.
    pub fn is_connected(&self) -> bool {
        self.flags.contains(ContextFlags::CONNECTED)
    }

    pub(crate) fn set_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.err = Some(Error::new(kind, message));
    }

    /// Append a resolved endpoint to the failover list.
    pub fn add_endpoint(&mut self, host: &str, port: u16) -> Result<(), Error> {
        match self.nodes.add_endpoint(host, port) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.err = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Submit a command built from `argv`, one byte string per argument.
    ///
    /// The reply is matched to `cb` in FIFO order. Commands are rejected
    /// once a disconnect has been requested.
    pub fn command_argv(&mut self, argv: &[&[u8]], cb: Option<ReplyCallback>) -> Result<(), Error> {
        if self.flags.contains(ContextFlags::DISCONNECTING) {
            return Err(Error::other("context is disconnecting"));
        }
        format_command(&mut self.obuf, argv);
        self.enqueue(cb);
        Ok(())
    }

    /// Submit bytes the caller has already framed as RESP commands.
    pub fn formatted_command(&mut self, cmd: &[u8], cb: Option<ReplyCallback>) -> Result<(), Error> {
        if self.flags.contains(ContextFlags::DISCONNECTING) {
            return Err(Error::other("context is disconnecting"));
        }
        self.obuf.extend_from_slice(cmd);
        self.enqueue(cb);
        Ok(())
    }

    /// Register the callback and schedule a write when none is in flight.
    fn enqueue(&mut self, cb: Option<ReplyCallback>) {
        self.replies.push_back(cb);
        if !self.flags.contains(ContextFlags::BLOCK) {
            self.flags.insert(ContextFlags::BLOCK);
            if let Some(slot) = &self.event_data {
                slot.kick_write();
            }
        }
    }

    /// Request a clean shutdown: stop accepting commands, flush what is
    /// queued, and tear down once every pending reply has been dispatched.
    ///
    /// Inside a callback the teardown is deferred until the dispatch loop
    /// regains control. An unattached context with nothing pending is
    /// finalized immediately.
    pub fn disconnect(&mut self) {
        self.flags.insert(ContextFlags::DISCONNECTING);
        if self.flags.contains(ContextFlags::IN_CALLBACK) {
            return;
        }
        if self.event_data.is_none() && self.replies.is_empty() {
            driver::context_free(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::slot::{KickQueue, SlotHandle};

    #[test]
    fn commands_accumulate_in_the_output_buffer() {
        let mut ctx = AsyncContext::init();
        ctx.command_argv(&[b"PING"], None).unwrap();
        ctx.formatted_command(b"*1\r\n$4\r\nPING\r\n", None).unwrap();
        assert_eq!(&ctx.obuf[..], b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n");
        assert_eq!(ctx.replies.len(), 2);
    }

    #[test]
    fn submissions_kick_the_writer_only_when_unblocked() {
        let kicks = KickQueue::default();
        let mut ctx = AsyncContext::init();
        ctx.event_data = Some(SlotHandle::new(0, kicks.clone()));

        // still blocked: connect has not completed
        ctx.command_argv(&[b"PING"], None).unwrap();
        assert!(kicks.borrow().is_empty());

        ctx.flags.remove(ContextFlags::BLOCK);
        ctx.command_argv(&[b"PING"], None).unwrap();
        assert_eq!(kicks.borrow().len(), 1);
        assert!(ctx.flags.contains(ContextFlags::BLOCK));

        // a third submission rides on the scheduled write
        ctx.command_argv(&[b"PING"], None).unwrap();
        assert_eq!(kicks.borrow().len(), 1);
    }

    #[test]
    fn disconnecting_contexts_reject_new_commands() {
        let mut ctx = AsyncContext::init();
        ctx.flags.insert(ContextFlags::DISCONNECTING);
        assert!(ctx.command_argv(&[b"PING"], None).is_err());
        assert!(ctx.formatted_command(b"*1\r\n$4\r\nPING\r\n", None).is_err());
        assert!(ctx.obuf.is_empty());
        assert!(ctx.replies.is_empty());
    }

    #[test]
    fn disconnect_on_an_idle_unattached_context_finalizes_it() {
        let mut ctx = AsyncContext::init();
        ctx.nodes.add_endpoint("127.0.0.1", 6379).unwrap();
        ctx.disconnect();
        assert!(ctx.flags.contains(ContextFlags::FREEING));
        assert!(ctx.nodes.is_empty());
    }

    #[test]
    fn disconnect_inside_a_callback_is_deferred() {
        let mut ctx = AsyncContext::init();
        ctx.flags.insert(ContextFlags::IN_CALLBACK);
        ctx.disconnect();
        assert!(ctx.flags.contains(ContextFlags::DISCONNECTING));
        assert!(!ctx.flags.contains(ContextFlags::FREEING));
    }
}
