//! Connection driver: the connect / read / write / teardown transitions.
//!
//! Completion handlers record failures on the context and signal the pump
//! through [`Failed`]; the pump responds by running the unified teardown
//! path, which either rotates to the next node or finalizes the context.

use std::io;

use bytes::BytesMut;
use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{Error, ErrorKind};
use crate::resp::{Reply, ReplyReader};
use crate::runtime::context::{
    AsyncContext, ConnectCallback, ContextFlags, ContextHandle, DisconnectCallback,
};
use crate::runtime::event_loop::EventLoop;
use crate::runtime::slot::{SendBuf, SlotMask};

/// Size of one in-flight receive buffer.
const READ_BUF_SIZE: usize = 16 * 1024;

/// The connection cannot continue; the caller runs the teardown path.
pub(crate) struct Failed;

pub(crate) type HandlerResult = Result<(), Failed>;

/// `connect(2)` on a non-blocking socket reports readiness later.
fn connect_in_progress(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EINPROGRESS)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Open a non-blocking TCP socket aimed at the next usable node, rotating
/// through the list until a connect is armed or the list is exhausted.
fn create_socket(ctx: &mut AsyncContext) -> Option<Socket> {
    loop {
        let Some(addr) = ctx.nodes.select_next() else {
            if ctx.err.is_none() {
                ctx.set_error(ErrorKind::Other, "no more node");
            }
            return None;
        };
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        {
            Ok(socket) => socket,
            Err(err) => {
                ctx.err = Some(Error::io("can't create socket", &err));
                return None;
            }
        };
        if let Err(err) = socket.set_nodelay(true) {
            ctx.err = Some(Error::io("setsockopt(TCP_NODELAY)", &err));
            continue;
        }
        if let Err(err) = socket.set_nonblocking(true) {
            ctx.err = Some(Error::io("set_nonblocking", &err));
            continue;
        }
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if connect_in_progress(&err) => {}
            Err(err) => {
                // socket is dropped here; charge the node and move on
                ctx.err = Some(Error::io("connect", &err));
                continue;
            }
        }
        debug!(%addr, "connect armed");
        return Some(socket);
    }
}

/// Start (or restart) an asynchronous connect for `ctx`.
pub(crate) fn connect(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    handle: &ContextHandle,
) -> HandlerResult {
    let Some(socket) = create_socket(ctx) else {
        return Err(Failed);
    };
    let stream = TcpStream::from_std(socket.into());
    let slot = match el.register(stream, handle.clone()) {
        Ok(slot) => slot,
        Err(err) => {
            ctx.err = Some(err);
            return Err(Failed);
        }
    };
    el.slot_mut(slot.index()).mask.insert(SlotMask::CONNECTING);
    ctx.event_data = Some(slot);
    ctx.flags.insert(ContextFlags::BLOCK);
    ctx.err = None;
    Ok(())
}

/// Completion of the initial connect.
pub(crate) fn connect_event(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    result: io::Result<()>,
) -> HandlerResult {
    let Some(index) = ctx.event_data.as_ref().map(|slot| slot.index()) else {
        return Err(Failed);
    };
    el.slot_mut(index).mask.remove(SlotMask::CONNECTING);

    if let Err(err) = result {
        ctx.err = Some(Error::io("connect", &err));
        return Err(Failed);
    }

    ctx.reader = Some(ReplyReader::new());
    handle_read(el, ctx, None)?;

    if !ctx.flags.contains(ContextFlags::CONNECTED) {
        ctx.flags.insert(ContextFlags::CONNECTED);
        debug!("connected");
        if let Some(hook) = ctx.on_connect.take() {
            let nested = ctx.flags.contains(ContextFlags::IN_CALLBACK);
            ctx.flags.insert(ContextFlags::IN_CALLBACK);
            hook(ctx, Ok(()));
            if !nested {
                ctx.flags.remove(ContextFlags::IN_CALLBACK);
            }
            if ctx.event_data.is_none() || ctx.flags.contains(ContextFlags::FREEING) {
                return Err(Failed);
            }
        }
    }

    // flush anything submitted before the handshake finished
    handle_write(el, ctx, None)?;

    ctx.nodes.reset_retries();
    Ok(())
}

/// Read-direction handler: feed a completed receive (if any) to the
/// reader, then keep a receive armed.
fn handle_read(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    completion: Option<io::Result<usize>>,
) -> HandlerResult {
    let Some(index) = ctx.event_data.as_ref().map(|slot| slot.index()) else {
        return Err(Failed);
    };

    if el.slot(index).r_buf.is_none() {
        // first call after connect: allocate the receive buffer
        el.slot_mut(index).r_buf = Some(vec![0u8; READ_BUF_SIZE]);
    } else {
        match completion {
            Some(Ok(0)) => ctx.set_error(ErrorKind::Eof, "server closed the connection"),
            Some(Ok(n)) => {
                let slot = el.slot_mut(index);
                if let (Some(buf), Some(reader)) = (slot.r_buf.as_ref(), ctx.reader.as_mut()) {
                    if let Err(err) = reader.feed(&buf[..n]) {
                        ctx.err = Some(err);
                    }
                }
            }
            Some(Err(err)) => ctx.err = Some(Error::io("recv", &err)),
            None => {}
        }
    }

    if ctx.err.is_some()
        || (ctx.flags.contains(ContextFlags::DISCONNECTING) && ctx.replies.is_empty())
    {
        el.slot_mut(index).r_buf = None;
        return Err(Failed);
    }

    // the buffer stays armed; the pump receives into it on readiness
    Ok(())
}

/// Write-direction handler: retire a completed send (if any), then move
/// the output buffer into the slot and arm the next send.
fn handle_write(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    completion: Option<io::Result<usize>>,
) -> HandlerResult {
    let Some(index) = ctx.event_data.as_ref().map(|slot| slot.index()) else {
        return Err(Failed);
    };

    if let Some(result) = completion {
        if let Some(pending) = el.slot_mut(index).w_buf.take() {
            match result {
                Ok(n) if n == pending.data.len() => {}
                Ok(_) => ctx.set_error(ErrorKind::Io, "send() partial"),
                Err(err) => ctx.err = Some(Error::io("send", &err)),
            }
        }
    }

    if ctx.err.is_some()
        || (ctx.flags.contains(ContextFlags::DISCONNECTING) && ctx.replies.is_empty())
    {
        return Err(Failed);
    }

    if !ctx.obuf.is_empty() {
        let data = ctx.obuf.split();
        el.slot_mut(index).w_buf = Some(SendBuf { data, sent: 0 });
        ctx.flags.insert(ContextFlags::BLOCK);
    } else {
        ctx.flags.remove(ContextFlags::BLOCK);
    }
    Ok(())
}

/// Drain complete replies and dispatch them to the pending callbacks.
fn process_callbacks(ctx: &mut AsyncContext) -> HandlerResult {
    loop {
        let next = match ctx.reader.as_mut() {
            Some(reader) => reader.get_reply(),
            None => return Err(Failed),
        };
        let reply = match next {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                // when disconnecting and nothing is owed, this is the cue
                // to really tear down
                if ctx.flags.contains(ContextFlags::DISCONNECTING) && ctx.replies.is_empty() {
                    return Err(Failed);
                }
                return Ok(());
            }
            Err(err) => {
                ctx.err = Some(err);
                return Err(Failed);
            }
        };

        if let Reply::Error(message) = &reply {
            // An error nobody asked for (connection refused server-side)
            // or a MOVED redirect ends this connection; charge the node.
            if ctx.replies.is_empty() || message.starts_with("MOVED") {
                if let Some(node) = ctx.nodes.head_mut() {
                    node.retry_count += 1;
                }
                warn!(error = %message, "server-side error, leaving node");
                let message = message.clone();
                ctx.set_error(ErrorKind::Other, message);
                return Err(Failed);
            }
        }

        match ctx.replies.pop_front() {
            Some(Some(callback)) => {
                let nested = ctx.flags.contains(ContextFlags::IN_CALLBACK);
                ctx.flags.insert(ContextFlags::IN_CALLBACK);
                callback(ctx, Some(reply));
                if !nested {
                    ctx.flags.remove(ContextFlags::IN_CALLBACK);
                }
            }
            // no callback registered for this reply; drop it
            _ => {}
        }
    }
}

/// Read completion entry point: ingest bytes, then dispatch replies.
pub(crate) fn read_event(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    completion: io::Result<usize>,
) -> HandlerResult {
    handle_read(el, ctx, Some(completion))?;
    process_callbacks(ctx)
}

/// Write completion entry point; `None` marks a synthetic kick.
pub(crate) fn write_event(
    el: &mut EventLoop,
    ctx: &mut AsyncContext,
    completion: Option<io::Result<usize>>,
) -> HandlerResult {
    handle_write(el, ctx, completion)
}

/// Invoke every pending callback with no reply, preserving the caller's
/// IN_CALLBACK state.
fn drain_pending(ctx: &mut AsyncContext) {
    let pending: Vec<_> = ctx.replies.drain(..).collect();
    let nested = ctx.flags.contains(ContextFlags::IN_CALLBACK);
    ctx.flags
        .insert(ContextFlags::IN_CALLBACK | ContextFlags::BLOCK);
    for callback in pending.into_iter().flatten() {
        callback(ctx, None);
    }
    if !nested {
        ctx.flags.remove(ContextFlags::IN_CALLBACK);
    }
}

/// Unified teardown: drain what the connection owes, close it, and either
/// rotate to the next node or finalize the context.
pub(crate) fn async_disconnect(el: &mut EventLoop, ctx: &mut AsyncContext, handle: &ContextHandle) {
    let entry_flags = ctx.flags;
    if entry_flags.intersects(ContextFlags::CONNECTED | ContextFlags::FREEING) {
        drain_pending(ctx);
        ctx.obuf = BytesMut::new();
        ctx.reader = None;
    }

    if let Some(slot) = ctx.event_data.take() {
        el.deregister(slot.index());
        if !ctx.flags.contains(ContextFlags::DISCONNECTING) || !ctx.replies.is_empty() {
            // involuntary drop: rotate to the next node before giving up
            if connect(el, ctx, handle).is_ok() {
                debug!("reconnecting");
                return;
            }
        }
    }

    if entry_flags.contains(ContextFlags::IN_CALLBACK) {
        // a dispatch frame still references the context
        return;
    }

    context_free(ctx);
}

/// Final teardown: flush callbacks, fire the lifecycle hook, clear state.
pub(crate) fn context_free(ctx: &mut AsyncContext) {
    ctx.flags
        .insert(ContextFlags::IN_CALLBACK | ContextFlags::DISCONNECTING | ContextFlags::FREEING);
    drain_pending(ctx);
    ctx.obuf = BytesMut::new();
    ctx.reader = None;

    let status = match &ctx.err {
        None => Ok(()),
        Some(err) => Err(err.clone()),
    };
    if !ctx.flags.contains(ContextFlags::CONNECTED) {
        if let Some(hook) = ctx.on_connect.take() {
            let err = ctx
                .err
                .clone()
                .unwrap_or_else(|| Error::other("connect failed"));
            hook(ctx, Err(err));
        }
    } else if let Some(hook) = ctx.on_disconnect.take() {
        hook(ctx, status);
    }

    ctx.on_connect = None;
    ctx.on_disconnect = None;
    ctx.nodes.clear();
    ctx.flags.remove(ContextFlags::IN_CALLBACK);
    debug!("context released");
}

/// Attach `handle` to the loop and start connecting to its head node.
pub(crate) fn attach(
    el: &mut EventLoop,
    handle: &ContextHandle,
    on_connect: Option<ConnectCallback>,
    on_disconnect: Option<DisconnectCallback>,
) -> Result<(), Error> {
    let mut ctx = handle.borrow_mut();
    if ctx.event_data.is_some() {
        return Err(Error::other("context already attached"));
    }
    if ctx.nodes.is_empty() {
        return Err(ctx
            .err
            .clone()
            .unwrap_or_else(|| Error::other("no endpoints registered")));
    }
    ctx.on_connect = on_connect;
    ctx.on_disconnect = on_disconnect;
    match connect(el, &mut ctx, handle) {
        Ok(()) => Ok(()),
        Err(Failed) => Err(ctx
            .err
            .clone()
            .unwrap_or_else(|| Error::other("connect failed"))),
    }
}

/// Force-detach `handle`: pending callbacks drain with no reply and the
/// context is finalized without firing the lifecycle hooks.
pub(crate) fn detach(el: &mut EventLoop, handle: &ContextHandle) {
    let mut ctx = handle.borrow_mut();
    if ctx.event_data.is_none() {
        return;
    }
    ctx.on_connect = None;
    ctx.on_disconnect = None;
    ctx.flags
        .insert(ContextFlags::DISCONNECTING | ContextFlags::FREEING);
    async_disconnect(el, &mut ctx, handle);
}
