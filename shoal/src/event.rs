use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::http::HttpMessage;
use crate::ws::WsMessage;
use std::cell::RefCell;
use std::rc::Rc;

/// Events delivered to a connection's handler. Payloads that borrow data are
/// only valid for the duration of the handler call.
#[derive(Debug)]
pub enum Event<'a> {
    /// Emitted to every connection once per loop iteration.
    Poll,
    /// A new connection was accepted on a listener; payload is the peer.
    Accept(Endpoint),
    /// A non-blocking connect resolved; `0` means success, any other value
    /// is the OS error code.
    Connect(i32),
    /// Bytes were appended to the recv buffer.
    Recv(usize),
    /// Bytes were drained from the send buffer.
    Send(usize),
    /// The socket is about to be freed.
    Close,
    /// A complete HTTP request is available.
    HttpRequest(&'a HttpMessage<'a>),
    /// A complete HTTP response is available.
    HttpReply(&'a HttpMessage<'a>),
    /// A WebSocket upgrade request arrived; the reply is sent after the
    /// handler returns unless it closed the connection or responded itself.
    WsHandshakeRequest(&'a HttpMessage<'a>),
    /// The WebSocket handshake completed; the connection now speaks frames.
    WsHandshakeDone,
    /// A reassembled WebSocket message.
    WsFrame(&'a WsMessage<'a>),
    /// The peer violated the protocol; `Close` follows.
    ProtocolError(&'a str),
}

/// Per-connection event callback. Shared (`Rc`) so accepted connections can
/// inherit their listener's handler.
pub type EventHandler = Rc<RefCell<dyn FnMut(&mut Connection, Event<'_>)>>;

/// Wraps a closure into an [`EventHandler`].
pub fn handler<F>(f: F) -> EventHandler
where
    F: FnMut(&mut Connection, Event<'_>) + 'static,
{
    Rc::new(RefCell::new(f))
}
