//! Per-descriptor event slots.
//!
//! A slot owns the registered stream plus the (at most) one in-flight
//! receive and one in-flight send for that descriptor. Slots live in a
//! fixed pool owned by the event loop; a context refers to its slot
//! through a [`SlotHandle`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bitflags::bitflags;
use bytes::BytesMut;
use mio::net::TcpStream;

use crate::runtime::context::ContextHandle;

bitflags! {
    /// Slot lifecycle mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SlotMask: u8 {
        /// Bound to a descriptor and dispatching completions.
        const ATTACHED = 1 << 0;
        /// The initial connect is armed and has not completed.
        const CONNECTING = 1 << 1;
        /// Detached; held until in-flight operations drain.
        const CLOSING = 1 << 2;
    }
}

/// An in-flight send: the bytes moved out of the context's output buffer
/// plus transmission progress.
#[derive(Debug)]
pub(crate) struct SendBuf {
    pub data: BytesMut,
    pub sent: usize,
}

/// One per-descriptor slot.
pub(crate) struct FileEvent {
    pub mask: SlotMask,
    /// Context cookie; completions are routed to this context.
    pub client: Option<ContextHandle>,
    pub stream: Option<TcpStream>,
    /// Receive buffer; present iff a receive is in flight.
    pub r_buf: Option<Vec<u8>>,
    /// Send buffer; present iff a send is in flight.
    pub w_buf: Option<SendBuf>,
    /// Readiness latches, cleared when the matching syscall reports
    /// `WouldBlock`.
    pub readable: bool,
    pub writable: bool,
}

impl FileEvent {
    pub fn vacant() -> Self {
        Self {
            mask: SlotMask::empty(),
            client: None,
            stream: None,
            r_buf: None,
            w_buf: None,
            readable: false,
            writable: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::vacant();
    }
}

/// Synthetic write completions posted from user code, drained by the pump
/// before it sleeps. Shared between the loop and its attached contexts.
pub(crate) type KickQueue = Rc<RefCell<VecDeque<usize>>>;

/// A context's non-owning reference to its slot.
#[derive(Clone, Debug)]
pub(crate) struct SlotHandle {
    index: usize,
    kicks: KickQueue,
}

impl SlotHandle {
    pub fn new(index: usize, kicks: KickQueue) -> Self {
        Self { index, kicks }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Post a synthetic write completion for this slot.
    pub fn kick_write(&self) {
        self.kicks.borrow_mut().push_back(self.index);
    }
}
