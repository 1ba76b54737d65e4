use crate::buffer::IoBuf;
use crate::endpoint::Endpoint;
use crate::event::{Event, EventHandler};
use crate::http::ProtoState;
use crate::logging::{self, Logger};
use crate::tls::{TlsConfig, TlsSession};
use crate::ws::WsRole;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::Ready;
use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::ops::{BitOr, BitOrAssign};
use std::rc::Rc;

pub type ConnId = usize;

/// Per-connection flag bitset. The manager owns `LISTENING`, `UDP`,
/// `CONNECTING` and `TLS_HANDSHAKE_DONE`; everything from
/// `FINISHED_SENDING_DATA` down is settable by handlers.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Flags(u16);

impl Flags {
    /// Passive listener; only accept events are serviced.
    pub const LISTENING: Flags = Flags(1 << 0);
    /// Datagram socket.
    pub const UDP: Flags = Flags(1 << 1);
    /// Non-blocking connect still pending.
    pub const CONNECTING: Flags = Flags(1 << 2);
    /// TLS session established; reads and writes go through the session.
    pub const TLS_HANDSHAKE_DONE: Flags = Flags(1 << 3);
    /// Close gracefully once the send buffer drains.
    pub const FINISHED_SENDING_DATA: Flags = Flags(1 << 4);
    /// Buffer output but do not write to the socket.
    pub const BUFFER_BUT_DONT_SEND: Flags = Flags(1 << 5);
    /// Close at the end of the current loop iteration.
    pub const CLOSE_IMMEDIATELY: Flags = Flags(1 << 6);
    /// Keeps a UDP pseudo-connection alive past its delivery iteration.
    pub const KEEP_ALIVE: Flags = Flags(1 << 7);
    pub const USER_1: Flags = Flags(1 << 8);
    pub const USER_2: Flags = Flags(1 << 9);
    pub const USER_3: Flags = Flags(1 << 10);
    pub const USER_4: Flags = Flags(1 << 11);

    /// Bits handlers are allowed to mutate.
    pub const USER_SETTABLE: Flags = Flags(
        Self::FINISHED_SENDING_DATA.0
            | Self::BUFFER_BUT_DONT_SEND.0
            | Self::CLOSE_IMMEDIATELY.0
            | Self::KEEP_ALIVE.0
            | Self::USER_1.0
            | Self::USER_2.0
            | Self::USER_3.0
            | Self::USER_4.0,
    );

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub(crate) fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    #[inline]
    pub(crate) fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// The socket behind a connection. UDP sockets are reference counted so the
/// pseudo-connections minted per datagram can answer through the listener's
/// socket.
pub(crate) enum Sock {
    Tcp(TcpStream),
    Listener(TcpListener),
    Udp(Rc<UdpSocket>),
    Closed,
}

/// One managed socket: descriptor, flags, the two I/O buffers, the user
/// handler and the optional protocol and TLS layers. Created by the manager
/// through `bind`, `connect`, `add_socket` or accept; destroyed by the
/// dispatcher when close conditions are observed.
pub struct Connection {
    pub(crate) id: ConnId,
    pub(crate) sock: Sock,
    pub(crate) flags: Flags,
    pub(crate) recv_buffer: IoBuf,
    pub(crate) send_buffer: IoBuf,
    pub(crate) handler: Option<EventHandler>,
    pub(crate) proto: Option<ProtoState>,
    pub(crate) ws_role: Option<WsRole>,
    pub(crate) ws_close_sent: bool,
    pub(crate) tls: Option<Box<dyn TlsSession>>,
    pub(crate) tls_config: Option<TlsConfig>,
    pub(crate) tls_want_write: bool,
    pub(crate) peer: Option<Endpoint>,
    pub(crate) local: Option<Endpoint>,
    pub(crate) last_io: u64,
    /// Interest currently registered with the poll. `None` for UDP
    /// pseudo-connections, which share their listener's registration.
    pub(crate) registered: Option<Ready>,
    /// Connect completion to report on the next iteration.
    pub(crate) pending_connect: Option<i32>,
    pub(crate) user_data: Option<Box<dyn Any>>,
    pub(crate) log: Logger,
}

impl Connection {
    pub(crate) fn new(sock: Sock, handler: Option<EventHandler>, log: Logger) -> Connection {
        Connection {
            id: 0,
            sock,
            flags: Flags::default(),
            recv_buffer: IoBuf::new(),
            send_buffer: IoBuf::new(),
            handler,
            proto: None,
            ws_role: None,
            ws_close_sent: false,
            tls: None,
            tls_config: None,
            tls_want_write: false,
            peer: None,
            local: None,
            last_io: 0,
            registered: None,
            pending_connect: None,
            user_data: None,
            log,
        }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Connection {
        Connection::new(
            Sock::Closed,
            None,
            Logger::root(logging::Discard, logging::o!()),
        )
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Sets user-settable flags; manager-owned bits are ignored.
    pub fn set_flags(&mut self, flags: Flags) {
        self.flags.insert(Flags(flags.0 & Flags::USER_SETTABLE.0));
    }

    /// Clears user-settable flags; manager-owned bits are ignored.
    pub fn clear_flags(&mut self, flags: Flags) {
        self.flags.remove(Flags(flags.0 & Flags::USER_SETTABLE.0));
    }

    #[inline]
    pub fn peer(&self) -> Option<Endpoint> {
        self.peer
    }

    #[inline]
    pub fn local(&self) -> Option<Endpoint> {
        self.local
    }

    /// Manager tick of the last successful read or write.
    #[inline]
    pub fn last_io(&self) -> u64 {
        self.last_io
    }

    #[inline]
    pub fn recv_buffer(&self) -> &IoBuf {
        &self.recv_buffer
    }

    #[inline]
    pub fn recv_buffer_mut(&mut self) -> &mut IoBuf {
        &mut self.recv_buffer
    }

    #[inline]
    pub fn send_buffer(&self) -> &IoBuf {
        &self.send_buffer
    }

    #[inline]
    pub fn send_buffer_mut(&mut self) -> &mut IoBuf {
        &mut self.send_buffer
    }

    pub fn set_handler(&mut self, handler: EventHandler) {
        self.handler = Some(handler);
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_ref().map(|data| &**data)
    }

    pub fn user_data_mut(&mut self) -> Option<&mut dyn Any> {
        self.user_data.as_mut().map(|data| &mut **data)
    }

    /// Queues bytes for transmission. TCP and TLS connections append to the
    /// send buffer and drain it from the readiness loop; UDP transmits
    /// immediately and returns the OS send count.
    pub fn send(&mut self, data: &[u8]) -> usize {
        if self.flags.contains(Flags::UDP) {
            return self.send_datagram(data);
        }

        self.send_buffer.append(data)
    }

    fn send_datagram(&mut self, data: &[u8]) -> usize {
        let peer = match self.peer {
            Some(peer) => SocketAddr::from(peer),
            None => return 0,
        };

        let sock = match &self.sock {
            Sock::Udp(sock) => sock,
            _ => return 0,
        };

        match sock.send_to(data, &peer) {
            Ok(count) => count,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => {
                logging::debug!(self.log, "datagram send failed";
                                "context" => "send",
                                "conn_id" => self.id,
                                "error" => %err);
                self.flags.insert(Flags::CLOSE_IMMEDIATELY);
                0
            }
        }
    }

    /// Invokes the connection's handler, if any, with the given event.
    pub(crate) fn deliver(&mut self, event: Event<'_>) {
        if let Some(handler) = self.handler.clone() {
            let mut callback = handler.borrow_mut();
            (&mut *callback)(self, event);
        }
    }
}

/// Formatted output appends to the send buffer, so `write!` and `writeln!`
/// provide printf-style sends.
impl io::Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.send(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
