//! The completion pump.
//!
//! A fixed pool of descriptor slots, a readiness poller, and a queue of
//! synthetic completions. The pump turns readiness into completions: when
//! a slot's descriptor becomes ready, the armed operation's syscall runs
//! and the outcome is dispatched to the connection driver as a completion
//! carrying bytes and status. Per slot, at most one receive and one send
//! are armed at any time.

use std::io::{self, Read, Write};
use std::time::Duration;

use bitflags::bitflags;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use tracing::{trace, warn};

use crate::client::Client;
use crate::error::Error;
use crate::runtime::context::{ConnectCallback, ContextHandle, DisconnectCallback};
use crate::runtime::driver;
use crate::runtime::slot::{FileEvent, KickQueue, SlotHandle, SlotMask};

bitflags! {
    /// Flags accepted by [`EventLoop::pump`].
    ///
    /// `FILE` and `TIME` mirror the classic event-loop surface; this loop
    /// has no timer events, so only `DONT_WAIT` changes behavior.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PumpFlags: u8 {
        const FILE = 1 << 0;
        const TIME = 1 << 1;
        const DONT_WAIT = 1 << 2;
        const CALL_AFTER_SLEEP = 1 << 3;
        const ALL = Self::FILE.bits() | Self::TIME.bits();
    }
}

/// A completion to route to the driver.
enum Completion {
    Connect(io::Result<()>),
    Read(io::Result<usize>),
    Write(io::Result<usize>),
    /// Synthetic write completion posted from user code.
    Kick,
}

/// The next operation to drive on a ready slot.
enum Action {
    Connect,
    Recv,
    Send,
}

/// Outcome of one send attempt.
enum SendStep {
    Blocked,
    Progress,
    Done(io::Result<usize>),
}

/// Completion-driven event loop for a fixed pool of descriptors.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    slots: Vec<FileEvent>,
    /// Highest slot index in use; `None` when every slot is vacant.
    maxfd: Option<usize>,
    kicks: KickQueue,
}

impl EventLoop {
    /// A loop with a fixed pool of `setsize` descriptor slots.
    pub fn with_capacity(setsize: usize) -> Result<Self, Error> {
        let poll = Poll::new().map_err(|err| Error::io("event port", &err))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(setsize.max(8)),
            slots: (0..setsize).map(|_| FileEvent::vacant()).collect(),
            maxfd: None,
            kicks: KickQueue::default(),
        })
    }

    /// Number of descriptor slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Attach a client and begin connecting to its head node.
    ///
    /// Fails when the client is already attached, has no endpoints, or
    /// when no descriptor slot is free.
    pub fn attach(
        &mut self,
        client: &Client,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) -> Result<(), Error> {
        driver::attach(self, client.handle(), on_connect, on_disconnect)
    }

    /// Detach a client, flushing its pending callbacks with no reply.
    /// Detaching an unattached client is a no-op.
    pub fn detach(&mut self, client: &Client) {
        driver::detach(self, client.handle());
    }

    /// Process completions and return how many were dispatched.
    ///
    /// With `DONT_WAIT`, readiness is polled once and whatever is ready is
    /// dispatched. Otherwise the call blocks, dispatching until no
    /// registered descriptor remains.
    pub fn pump(&mut self, flags: PumpFlags) -> usize {
        let dont_wait = flags.contains(PumpFlags::DONT_WAIT);
        let mut processed = 0;

        loop {
            self.sweep_closing();
            processed += self.drain_kicks();

            let driven = self.drive_ready();
            processed += driven;
            if driven > 0 {
                continue;
            }

            if self.maxfd.is_none() {
                return processed;
            }

            let timeout = dont_wait.then(|| Duration::from_millis(0));
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "poll failed");
                    return processed;
                }
            }

            let mut any = false;
            for event in self.events.iter() {
                let Token(index) = event.token();
                if index >= self.slots.len() {
                    continue;
                }
                let slot = &mut self.slots[index];
                slot.readable |=
                    event.is_readable() || event.is_error() || event.is_read_closed();
                slot.writable |=
                    event.is_writable() || event.is_error() || event.is_write_closed();
                any = true;
            }
            if !any && dont_wait {
                return processed;
            }
        }
    }

    /// Reclaim slots whose cancelled operations have drained.
    fn sweep_closing(&mut self) {
        for slot in &mut self.slots {
            if slot.mask.contains(SlotMask::CLOSING) {
                slot.reset();
            }
        }
        self.shrink_maxfd();
    }

    /// Dispatch synthetic write completions posted from user code.
    fn drain_kicks(&mut self) -> usize {
        let mut processed = 0;
        loop {
            let index = self.kicks.borrow_mut().pop_front();
            let Some(index) = index else {
                break;
            };
            processed += self.dispatch(index, Completion::Kick);
        }
        processed
    }

    /// Run armed operations on ready slots, dispatching each outcome.
    fn drive_ready(&mut self) -> usize {
        let mut processed = 0;
        for index in 0..self.slots.len() {
            loop {
                let Some(action) = self.next_action(index) else {
                    break;
                };
                match action {
                    Action::Connect => {
                        let result = self.finish_connect(index);
                        processed += self.dispatch(index, Completion::Connect(result));
                    }
                    Action::Recv => match self.try_recv(index) {
                        None => break,
                        Some(result) => {
                            processed += self.dispatch(index, Completion::Read(result));
                        }
                    },
                    Action::Send => match self.try_send(index) {
                        SendStep::Blocked => break,
                        SendStep::Progress => {}
                        SendStep::Done(result) => {
                            processed += self.dispatch(index, Completion::Write(result));
                        }
                    },
                }
            }
        }
        processed
    }

    fn next_action(&self, index: usize) -> Option<Action> {
        let slot = &self.slots[index];
        if !slot.mask.contains(SlotMask::ATTACHED) || slot.stream.is_none() {
            return None;
        }
        if slot.mask.contains(SlotMask::CONNECTING) {
            return slot.writable.then_some(Action::Connect);
        }
        if slot.readable && slot.r_buf.is_some() {
            return Some(Action::Recv);
        }
        if slot.writable && slot.w_buf.is_some() {
            return Some(Action::Send);
        }
        None
    }

    /// Resolve the outcome of a completed non-blocking connect.
    fn finish_connect(&mut self, index: usize) -> io::Result<()> {
        let Some(stream) = self.slots[index].stream.as_ref() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no stream"));
        };
        match stream.take_error() {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// One receive attempt into the armed buffer. `None` means the socket
    /// would block; the readiness latch is cleared.
    fn try_recv(&mut self, index: usize) -> Option<io::Result<usize>> {
        let slot = &mut self.slots[index];
        let result = loop {
            let (stream, buf) = match (slot.stream.as_mut(), slot.r_buf.as_mut()) {
                (Some(stream), Some(buf)) => (stream, buf),
                _ => return None,
            };
            match stream.read(&mut buf[..]) {
                Ok(n) => break Some(Ok(n)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break None,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break Some(Err(err)),
            }
        };
        if result.is_none() {
            slot.readable = false;
        }
        result
    }

    /// One send attempt from the armed buffer. The completion is delivered
    /// only when the whole buffer has been handed to the kernel.
    fn try_send(&mut self, index: usize) -> SendStep {
        let slot = &mut self.slots[index];
        let step = loop {
            let (stream, pending) = match (slot.stream.as_mut(), slot.w_buf.as_mut()) {
                (Some(stream), Some(pending)) => (stream, pending),
                _ => return SendStep::Blocked,
            };
            match stream.write(&pending.data[pending.sent..]) {
                Ok(0) => {
                    break SendStep::Done(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "send returned 0",
                    )))
                }
                Ok(n) => {
                    pending.sent += n;
                    if pending.sent == pending.data.len() {
                        break SendStep::Done(Ok(pending.sent));
                    }
                    break SendStep::Progress;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break SendStep::Blocked,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => break SendStep::Done(Err(err)),
            }
        };
        if matches!(step, SendStep::Blocked) {
            slot.writable = false;
        }
        step
    }

    /// Route one completion to the connection driver. A failing handler
    /// sends the context through the teardown path.
    fn dispatch(&mut self, index: usize, completion: Completion) -> usize {
        let handle = {
            let slot = &self.slots[index];
            if !slot.mask.contains(SlotMask::ATTACHED) {
                return 0;
            }
            // a kick posted before a teardown must not poke a reconnecting
            // slot
            if matches!(completion, Completion::Kick) && slot.mask.contains(SlotMask::CONNECTING) {
                return 0;
            }
            match &slot.client {
                Some(handle) => handle.clone(),
                None => return 0,
            }
        };

        let mut ctx = handle.borrow_mut();
        let outcome = match completion {
            Completion::Connect(result) => driver::connect_event(self, &mut ctx, result),
            Completion::Read(result) => driver::read_event(self, &mut ctx, result),
            Completion::Write(result) => driver::write_event(self, &mut ctx, Some(result)),
            Completion::Kick => driver::write_event(self, &mut ctx, None),
        };
        if outcome.is_err() {
            driver::async_disconnect(self, &mut ctx, &handle);
        }
        1
    }

    /// Bind a stream to the first free slot, lowest index first.
    pub(crate) fn register(
        &mut self,
        mut stream: TcpStream,
        client: ContextHandle,
    ) -> Result<SlotHandle, Error> {
        for index in 0..self.slots.len() {
            if !self.slots[index].mask.is_empty() {
                continue;
            }
            if let Err(err) = self.poll.registry().register(
                &mut stream,
                Token(index),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                return Err(Error::io("can't attach event", &err));
            }
            let slot = &mut self.slots[index];
            slot.mask = SlotMask::ATTACHED;
            slot.client = Some(client);
            slot.stream = Some(stream);
            slot.readable = false;
            slot.writable = false;
            self.maxfd = Some(self.maxfd.map_or(index, |max| max.max(index)));
            trace!(slot = index, "descriptor registered");
            return Ok(SlotHandle::new(index, self.kicks.clone()));
        }
        Err(Error::other("can't attach event"))
    }

    /// Release a slot, closing its stream. With an operation still in
    /// flight the slot is parked as CLOSING until the pump reclaims it.
    pub(crate) fn deregister(&mut self, index: usize) {
        if let Some(mut stream) = self.slots[index].stream.take() {
            let _ = self.poll.registry().deregister(&mut stream);
        }
        let slot = &mut self.slots[index];
        slot.client = None;
        slot.readable = false;
        slot.writable = false;
        if !slot.mask.contains(SlotMask::CONNECTING)
            && slot.r_buf.is_none()
            && slot.w_buf.is_none()
        {
            slot.mask = SlotMask::empty();
            self.shrink_maxfd();
        } else {
            slot.mask = SlotMask::CLOSING;
        }
        trace!(slot = index, "descriptor released");
    }

    /// Walk `maxfd` down past vacant slots.
    fn shrink_maxfd(&mut self) {
        while let Some(top) = self.maxfd {
            if self.slots[top].mask.is_empty() {
                self.maxfd = top.checked_sub(1);
            } else {
                break;
            }
        }
    }

    pub(crate) fn slot(&self, index: usize) -> &FileEvent {
        &self.slots[index]
    }

    pub(crate) fn slot_mut(&mut self, index: usize) -> &mut FileEvent {
        &mut self.slots[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::AsyncContext;
    use std::cell::RefCell;
    use std::net::{TcpListener, TcpStream as StdTcpStream};
    use std::rc::Rc;

    fn handle() -> ContextHandle {
        Rc::new(RefCell::new(AsyncContext::init()))
    }

    fn connected_stream(listener: &TcpListener) -> TcpStream {
        let stream = StdTcpStream::connect(listener.local_addr().unwrap()).unwrap();
        stream.set_nonblocking(true).unwrap();
        TcpStream::from_std(stream)
    }

    #[test]
    fn register_prefers_the_lowest_free_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut el = EventLoop::with_capacity(4).unwrap();

        let s0 = el.register(connected_stream(&listener), handle()).unwrap();
        let s1 = el.register(connected_stream(&listener), handle()).unwrap();
        let s2 = el.register(connected_stream(&listener), handle()).unwrap();
        assert_eq!((s0.index(), s1.index(), s2.index()), (0, 1, 2));
        assert_eq!(el.maxfd, Some(2));

        el.deregister(1);
        let reused = el.register(connected_stream(&listener), handle()).unwrap();
        assert_eq!(reused.index(), 1);
    }

    #[test]
    fn registration_fails_when_the_pool_is_exhausted() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut el = EventLoop::with_capacity(1).unwrap();

        el.register(connected_stream(&listener), handle()).unwrap();
        let err = el
            .register(connected_stream(&listener), handle())
            .unwrap_err();
        assert!(err.message.contains("can't attach event"));
    }

    #[test]
    fn maxfd_walks_down_over_freed_slots() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut el = EventLoop::with_capacity(4).unwrap();

        el.register(connected_stream(&listener), handle()).unwrap();
        el.register(connected_stream(&listener), handle()).unwrap();
        el.register(connected_stream(&listener), handle()).unwrap();
        el.deregister(0);
        assert_eq!(el.maxfd, Some(2));
        el.deregister(2);
        assert_eq!(el.maxfd, Some(1));
        el.deregister(1);
        assert_eq!(el.maxfd, None);
    }

    #[test]
    fn closing_slots_are_held_until_the_pump_reclaims_them() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut el = EventLoop::with_capacity(2).unwrap();

        el.register(connected_stream(&listener), handle()).unwrap();
        el.slots[0].r_buf = Some(vec![0u8; 16]);
        el.deregister(0);
        assert_eq!(el.slots[0].mask, SlotMask::CLOSING);
        assert!(el.slots[0].r_buf.is_some());
        assert_eq!(el.maxfd, Some(0));

        // the parked slot is not considered free
        let next = el.register(connected_stream(&listener), handle()).unwrap();
        assert_eq!(next.index(), 1);

        el.pump(PumpFlags::ALL | PumpFlags::DONT_WAIT);
        assert!(el.slots[0].mask.is_empty());
        assert!(el.slots[0].r_buf.is_none());
    }
}
