//! The connection manager and its readiness loop. One manager owns a slot
//! table of connections and services accept, connect-completion, read,
//! write, close and periodic poll events from a single thread; the only
//! cross-thread surface is the wake-up channel.

use crate::connection::{ConnId, Connection, Flags, Sock};
use crate::endpoint::{self, Endpoint, Proto};
use crate::event::{Event, EventHandler};
use crate::http::{self, ProtoState};
use crate::logging::{self, Logger};
use crate::support::{SetupError, SetupResult};
use crate::tls::{TlsConfig, TlsHandshake, TlsIo, TlsProvider};
use crate::wakeup::{Broadcaster, WakeupQueue};
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Poll, PollOpt, Ready, Token};
use std::any::Any;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

// usize::MAX is mio's internal awaken token; stay clear of it.
const WAKEUP_TOKEN: Token = Token(usize::max_value() - 1);
/// Headroom reserved in the recv buffer ahead of every read.
const RECV_CHUNK: usize = 2048;
const DATAGRAM_MAX: usize = 65536;
const EVENTS_CAPACITY: usize = 1024;

/// Manager tick: unix seconds, stamped into `last_io` on every successful
/// read or write. A clock sitting before the epoch reads as zero instead of
/// tearing the loop down.
fn current_tick() -> u64 {
    SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// Owns the connections, the poll and the wake-up channel. All methods must
/// be called from the owning thread; see [`Broadcaster`] for the exception.
pub struct Manager {
    conns: Vec<Option<Connection>>,
    free: Vec<ConnId>,
    live: IndexSet<ConnId>,
    poll: Poll,
    events: Events,
    wakeup: WakeupQueue,
    broadcaster: Broadcaster,
    tls_provider: Option<Box<dyn TlsProvider>>,
    tick: u64,
    /// UDP pseudo-connections minted this iteration.
    udp_ephemeral: Vec<ConnId>,
    user_data: Option<Box<dyn Any>>,
    log: Logger,
}

impl Manager {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> io::Result<Manager> {
        let log = logging::component(log, "manager");
        let poll = Poll::new()?;
        let (wakeup, broadcaster) = WakeupQueue::new(&log);

        wakeup.register(&poll, WAKEUP_TOKEN)?;

        Ok(Manager {
            conns: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            wakeup,
            broadcaster,
            tls_provider: None,
            tick: current_tick(),
            udp_ephemeral: Vec::new(),
            user_data: None,
            log,
        })
    }

    /// The tick (unix seconds) computed by the latest `poll`.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Thread-safe handle for [`Broadcaster::broadcast`].
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    pub fn set_tls_provider(&mut self, provider: Box<dyn TlsProvider>) {
        self.tls_provider = Some(provider);
    }

    pub fn set_user_data(&mut self, data: Box<dyn Any>) {
        self.user_data = Some(data);
    }

    pub fn user_data(&self) -> Option<&dyn Any> {
        self.user_data.as_ref().map(|data| &**data)
    }

    pub fn conn(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(id).and_then(|slot| slot.as_ref())
    }

    pub fn conn_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.conns.get_mut(id).and_then(|slot| slot.as_mut())
    }

    /// Walks the live connections in creation order. `None` starts the
    /// iteration; the return value is `None` once exhausted.
    pub fn next(&self, prev: Option<ConnId>) -> Option<ConnId> {
        match prev {
            None => self.live.get_index(0).cloned(),
            Some(id) => {
                let (idx, _) = self.live.get_full(&id)?;
                self.live.get_index(idx + 1).cloned()
            }
        }
    }

    /// Creates a listening connection. TCP listeners accept streams; UDP
    /// listeners surface each datagram through a pseudo-connection.
    pub fn bind(&mut self, addr: &str, handler: EventHandler) -> SetupResult<ConnId> {
        let parsed = endpoint::parse(addr)?;

        let id = match parsed.proto {
            Proto::Tcp => {
                let listener = TcpListener::bind(&parsed.sa)?;
                let local = listener.local_addr()?;

                let mut conn =
                    Connection::new(Sock::Listener(listener), Some(handler), self.log.new(logging::o!()));
                conn.flags.insert(Flags::LISTENING);
                conn.local = Some(local.into());

                self.install(conn, Some(Ready::readable()))
            }
            Proto::Udp => {
                let sock = UdpSocket::bind(&parsed.sa)?;
                let local = sock.local_addr()?;

                let mut conn = Connection::new(
                    Sock::Udp(Rc::new(sock)),
                    Some(handler),
                    self.log.new(logging::o!()),
                );
                conn.flags.insert(Flags::LISTENING | Flags::UDP);
                conn.local = Some(local.into());

                self.install(conn, Some(Ready::readable()))
            }
        };

        logging::info!(self.log, "listener bound";
                       "context" => "bind",
                       "conn_id" => id,
                       "addr" => addr.to_string());

        Ok(id)
    }

    /// Starts a client connection. The host part is mandatory; named hosts
    /// resolve with a blocking lookup before the socket is created. The
    /// outcome arrives as a `Connect` event. A UDP connection accepts
    /// datagrams from its peer only.
    pub fn connect(&mut self, addr: &str, handler: EventHandler) -> SetupResult<ConnId> {
        let parsed = endpoint::parse(addr)?;

        if !parsed.explicit_host {
            return Err(SetupError::BadAddress(addr.to_string()));
        }

        let id = match parsed.proto {
            Proto::Tcp => {
                let stream = TcpStream::connect(&parsed.sa)?;

                let mut conn =
                    Connection::new(Sock::Tcp(stream), Some(handler), self.log.new(logging::o!()));
                conn.flags.insert(Flags::CONNECTING);
                conn.peer = Some(parsed.sa.into());

                self.install(conn, Some(Ready::writable()))
            }
            Proto::Udp => {
                let local = match parsed.sa {
                    SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
                    SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
                };
                let sock = UdpSocket::bind(&local)?;
                let bound = sock.local_addr()?;

                let mut conn = Connection::new(
                    Sock::Udp(Rc::new(sock)),
                    Some(handler),
                    self.log.new(logging::o!()),
                );
                conn.flags.insert(Flags::UDP);
                conn.peer = Some(parsed.sa.into());
                conn.local = Some(bound.into());
                conn.pending_connect = Some(0);

                self.install(conn, Some(Ready::readable()))
            }
        };

        logging::debug!(self.log, "connection started";
                        "context" => "connect",
                        "conn_id" => id,
                        "addr" => addr.to_string());

        Ok(id)
    }

    /// Wraps an externally acquired stream. The caller is responsible for
    /// the socket's prior state; the stream must be non-blocking.
    pub fn add_socket(&mut self, stream: TcpStream, handler: EventHandler) -> SetupResult<ConnId> {
        let mut conn = Connection::new(Sock::Tcp(stream), Some(handler), self.log.new(logging::o!()));

        if let Sock::Tcp(stream) = &conn.sock {
            conn.peer = stream.peer_addr().ok().map(Endpoint::from);
            conn.local = stream.local_addr().ok().map(Endpoint::from);
        }

        Ok(self.install(conn, Some(Ready::readable())))
    }

    /// Configures TLS on a connection. For listeners the certificate is
    /// validated now and sessions are minted per accepted connection; for
    /// clients the session is created immediately and the handshake runs
    /// once the connect completes.
    pub fn set_ssl(&mut self, id: ConnId, cert: Option<&str>, ca_cert: Option<&str>) -> Result<(), String> {
        let config = TlsConfig {
            cert: cert.map(String::from),
            ca_cert: ca_cert.map(String::from),
        };

        let is_listener = match self.conn(id) {
            Some(conn) => conn.flags.contains(Flags::LISTENING),
            None => return Err("unknown connection".to_string()),
        };

        let provider = match self.tls_provider.as_ref() {
            Some(provider) => provider,
            None => return Err("no TLS provider registered".to_string()),
        };

        if is_listener {
            // Fail fast on unusable certificates.
            provider.server_session(&config)?;

            let conn = self.conns[id].as_mut().expect("Connection checked above");
            conn.tls_config = Some(config);
        } else {
            let session = provider.client_session(&config)?;

            let conn = self.conns[id].as_mut().expect("Connection checked above");
            conn.tls = Some(session);
            conn.tls_config = Some(config);
        }

        Ok(())
    }

    /// Attaches the built-in HTTP/WebSocket protocol layer. On a listener
    /// the layer is inherited by every accepted connection.
    pub fn set_protocol_http_websocket(&mut self, id: ConnId) {
        if let Some(conn) = self.conn_mut(id) {
            conn.proto = Some(ProtoState::Http);
        }
    }

    /// Runs one readiness-loop iteration: waits up to `timeout_ms` for
    /// readiness, services the ready sockets, delivers `Poll` to every
    /// connection and applies the end-of-iteration close transitions.
    /// Returns the current tick.
    pub fn poll(&mut self, timeout_ms: i64) -> u64 {
        self.tick = current_tick();

        self.update_interests();

        let timeout = Duration::from_millis(timeout_ms.max(0) as u64);

        loop {
            match self.poll.poll(&mut self.events, Some(timeout)) {
                Ok(_) => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => panic!("Readiness poll failed: {}", err),
            }
        }

        // Connect completions that never entered CONNECTING (UDP) resolve
        // ahead of any I/O events.
        self.flush_pending_connects();

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.readiness()))
            .collect();

        for (token, readiness) in ready {
            if token == WAKEUP_TOKEN {
                self.handle_broadcasts();
                continue;
            }

            let id = token.0;

            // Read before write, so responses to just-received data can be
            // queued within the same iteration.
            if readiness.is_readable() {
                self.conn_readable(id);
            }

            if readiness.is_writable() {
                self.conn_writable(id);
            }
        }

        for id in self.live_ids() {
            if let Some(conn) = self.conns[id].as_mut() {
                conn.deliver(Event::Poll);
            }
        }

        // Pseudo-connections last one iteration unless kept alive.
        let ephemeral = std::mem::replace(&mut self.udp_ephemeral, Vec::new());
        for id in ephemeral {
            if let Some(conn) = self.conns[id].as_mut() {
                if !conn.flags.contains(Flags::KEEP_ALIVE) {
                    conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                }
            }
        }

        for id in self.live_ids() {
            let close = match self.conns[id].as_mut() {
                Some(conn) => {
                    if conn.flags.contains(Flags::CLOSE_IMMEDIATELY) {
                        true
                    } else if conn.flags.contains(Flags::FINISHED_SENDING_DATA)
                        && conn.send_buffer.is_empty()
                    {
                        conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                        false
                    } else {
                        false
                    }
                }
                None => false,
            };

            if close {
                self.close_conn(id);
            }
        }

        self.tick
    }

    fn live_ids(&self) -> Vec<ConnId> {
        self.live.iter().cloned().collect()
    }

    fn install(&mut self, mut conn: Connection, interest: Option<Ready>) -> ConnId {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };

        conn.id = id;

        if let Some(ready) = interest {
            match Self::register_sock(&self.poll, &conn.sock, id, ready) {
                Ok(()) => conn.registered = Some(ready),
                Err(err) => {
                    logging::warn!(self.log, "socket registration failed";
                                   "context" => "install",
                                   "conn_id" => id,
                                   "error" => %err);
                    conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                }
            }
        }

        self.live.insert(id);
        self.conns[id] = Some(conn);

        id
    }

    fn register_sock(poll: &Poll, sock: &Sock, id: ConnId, ready: Ready) -> io::Result<()> {
        match sock {
            Sock::Tcp(stream) => poll.register(stream, Token(id), ready, PollOpt::level()),
            Sock::Listener(listener) => poll.register(listener, Token(id), ready, PollOpt::level()),
            Sock::Udp(sock) => poll.register(&**sock, Token(id), ready, PollOpt::level()),
            Sock::Closed => Ok(()),
        }
    }

    fn reregister_sock(poll: &Poll, sock: &Sock, id: ConnId, ready: Ready) -> io::Result<()> {
        match sock {
            Sock::Tcp(stream) => poll.reregister(stream, Token(id), ready, PollOpt::level()),
            Sock::Listener(listener) => poll.reregister(listener, Token(id), ready, PollOpt::level()),
            Sock::Udp(sock) => poll.reregister(&**sock, Token(id), ready, PollOpt::level()),
            Sock::Closed => Ok(()),
        }
    }

    /// Rebuilds the readiness interest for every registered connection: the
    /// read set excludes `CONNECTING` sockets, the write set holds sockets
    /// that are connecting, have unheld send data, or whose TLS handshake
    /// wants to write.
    fn update_interests(&mut self) {
        for id in self.live_ids() {
            let desired = match self.conns[id].as_ref() {
                Some(conn) => match conn.registered {
                    Some(current) => {
                        let desired = Self::desired_interest(conn);
                        if desired == current {
                            continue;
                        }
                        desired
                    }
                    None => continue,
                },
                None => continue,
            };

            let conn = self.conns[id].as_mut().expect("Connection checked above");

            match Self::reregister_sock(&self.poll, &conn.sock, id, desired) {
                Ok(()) => conn.registered = Some(desired),
                Err(err) => {
                    logging::warn!(conn.log, "interest update failed";
                                   "context" => "poll",
                                   "conn_id" => id,
                                   "error" => %err);
                    conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                }
            }
        }
    }

    fn desired_interest(conn: &Connection) -> Ready {
        let mut ready = Ready::empty();

        if !conn.flags.contains(Flags::CONNECTING) {
            ready |= Ready::readable();
        }

        let wants_send = !conn.send_buffer.is_empty()
            && !conn.flags.contains(Flags::BUFFER_BUT_DONT_SEND)
            && !conn.flags.contains(Flags::LISTENING);

        if conn.flags.contains(Flags::CONNECTING) || wants_send || conn.tls_want_write {
            ready |= Ready::writable();
        }

        ready
    }

    fn conn_readable(&mut self, id: ConnId) {
        let flags = match self.conn(id) {
            Some(conn) => conn.flags,
            None => return,
        };

        if flags.contains(Flags::LISTENING) {
            if flags.contains(Flags::UDP) {
                self.udp_accept(id);
            } else {
                self.tcp_accept(id);
            }
            return;
        }

        if flags.contains(Flags::CONNECTING) {
            return;
        }

        if self.tls_pump(id) {
            return;
        }

        self.do_read(id);
    }

    fn conn_writable(&mut self, id: ConnId) {
        let flags = match self.conn(id) {
            Some(conn) => conn.flags,
            None => return,
        };

        if flags.contains(Flags::LISTENING) {
            return;
        }

        if flags.contains(Flags::CONNECTING) {
            self.finish_connect(id);
            return;
        }

        if self.tls_pump(id) {
            return;
        }

        if flags.contains(Flags::BUFFER_BUT_DONT_SEND) {
            return;
        }

        self.do_write(id);
    }

    /// Drives a pending TLS handshake. Returns true while the session is
    /// still handshaking, in which case no plaintext I/O may happen.
    fn tls_pump(&mut self, id: ConnId) -> bool {
        let conn = match self.conns[id].as_mut() {
            Some(conn) => conn,
            None => return false,
        };

        if conn.tls.is_none() || conn.flags.contains(Flags::TLS_HANDSHAKE_DONE) {
            return false;
        }

        let stream = match &mut conn.sock {
            Sock::Tcp(stream) => stream,
            _ => return false,
        };

        let session = conn.tls.as_mut().expect("Session checked above");

        match session.handshake(stream) {
            TlsHandshake::Done => {
                logging::debug!(conn.log, "tls handshake complete";
                                "context" => "tls",
                                "conn_id" => id);
                conn.flags.insert(Flags::TLS_HANDSHAKE_DONE);
                conn.tls_want_write = false;
            }
            TlsHandshake::WantRead => conn.tls_want_write = false,
            TlsHandshake::WantWrite => conn.tls_want_write = true,
            TlsHandshake::Failed(msg) => {
                logging::debug!(conn.log, "tls handshake failed";
                                "context" => "tls",
                                "conn_id" => id,
                                "error" => msg);
                conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
            }
        }

        true
    }

    fn finish_connect(&mut self, id: ConnId) {
        let code = {
            let conn = match self.conns[id].as_mut() {
                Some(conn) => conn,
                None => return,
            };

            conn.flags.remove(Flags::CONNECTING);

            match &conn.sock {
                Sock::Tcp(stream) => match stream.take_error() {
                    Ok(None) => 0,
                    Ok(Some(err)) => err.raw_os_error().unwrap_or(-1),
                    Err(err) => err.raw_os_error().unwrap_or(-1),
                },
                _ => 0,
            }
        };

        let tick = self.tick;
        let conn = self.conns[id].as_mut().expect("Connection checked above");

        logging::debug!(conn.log, "connect resolved";
                        "context" => "connect",
                        "conn_id" => id,
                        "code" => code);

        if code != 0 {
            conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
        } else {
            conn.last_io = tick;
        }

        conn.deliver(Event::Connect(code));
    }

    fn flush_pending_connects(&mut self) {
        for id in self.live_ids() {
            let code = match self.conns[id].as_mut() {
                Some(conn) => conn.pending_connect.take(),
                None => None,
            };

            if let Some(code) = code {
                let conn = self.conns[id].as_mut().expect("Connection checked above");

                if code != 0 {
                    conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                }

                conn.deliver(Event::Connect(code));
            }
        }
    }

    fn do_read(&mut self, id: ConnId) {
        enum Outcome {
            Nothing,
            Eof,
            Got(usize),
            Fatal(io::ErrorKind),
        }

        let outcome = {
            let conn = match self.conns[id].as_mut() {
                Some(conn) => conn,
                None => return,
            };

            let through_tls = conn.tls.is_some() && conn.flags.contains(Flags::TLS_HANDSHAKE_DONE);

            if through_tls {
                let stream = match &mut conn.sock {
                    Sock::Tcp(stream) => stream,
                    _ => return,
                };
                let session = conn.tls.as_mut().expect("Session checked above");

                let mut plain = [0u8; RECV_CHUNK];

                match session.read(stream, &mut plain) {
                    TlsIo::Done(0) | TlsIo::Closed => Outcome::Eof,
                    TlsIo::Done(count) => {
                        conn.recv_buffer.append(&plain[..count]);
                        Outcome::Got(count)
                    }
                    TlsIo::WantRead => {
                        conn.tls_want_write = false;
                        Outcome::Nothing
                    }
                    TlsIo::WantWrite => {
                        conn.tls_want_write = true;
                        Outcome::Nothing
                    }
                    TlsIo::Failed(msg) => {
                        logging::debug!(conn.log, "tls read failed";
                                        "context" => "read",
                                        "conn_id" => id,
                                        "error" => msg);
                        Outcome::Fatal(io::ErrorKind::Other)
                    }
                }
            } else {
                match &mut conn.sock {
                    Sock::Tcp(stream) => match conn.recv_buffer.ingress(stream, RECV_CHUNK) {
                        Ok(0) => Outcome::Eof,
                        Ok(count) => Outcome::Got(count),
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::Nothing,
                        Err(err) => Outcome::Fatal(err.kind()),
                    },
                    Sock::Udp(sock) => {
                        let mut datagram = [0u8; DATAGRAM_MAX];
                        match sock.recv_from(&mut datagram) {
                            Ok((count, from)) => {
                                // A connected UDP socket only speaks to its
                                // peer; datagrams from anyone else are dropped.
                                if conn.peer.map(SocketAddr::from) != Some(from) {
                                    logging::trace!(conn.log, "datagram from unexpected sender dropped";
                                                    "context" => "read",
                                                    "conn_id" => id,
                                                    "from" => %from);
                                    Outcome::Nothing
                                } else {
                                    conn.recv_buffer.append(&datagram[..count]);
                                    Outcome::Got(count)
                                }
                            }
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::Nothing,
                            Err(err) => Outcome::Fatal(err.kind()),
                        }
                    }
                    _ => Outcome::Nothing,
                }
            }
        };

        let tick = self.tick;
        let conn = self.conns[id].as_mut().expect("Connection serviced above");

        match outcome {
            Outcome::Nothing => (),
            Outcome::Eof => {
                conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
            }
            Outcome::Fatal(kind) => {
                logging::debug!(conn.log, "read failed";
                                "context" => "read",
                                "conn_id" => id,
                                "kind" => ?kind);
                conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
            }
            Outcome::Got(count) => {
                conn.last_io = tick;
                conn.deliver(Event::Recv(count));
                http::drive(conn);
            }
        }
    }

    fn do_write(&mut self, id: ConnId) {
        enum Outcome {
            Nothing,
            Sent(usize),
            Fatal(io::ErrorKind),
        }

        let outcome = {
            let conn = match self.conns[id].as_mut() {
                Some(conn) => conn,
                None => return,
            };

            if conn.send_buffer.is_empty() {
                Outcome::Nothing
            } else {
                let through_tls = conn.tls.is_some() && conn.flags.contains(Flags::TLS_HANDSHAKE_DONE);

                if through_tls {
                    let stream = match &mut conn.sock {
                        Sock::Tcp(stream) => stream,
                        _ => return,
                    };
                    let session = conn.tls.as_mut().expect("Session checked above");

                    match session.write(stream, conn.send_buffer.as_slice()) {
                        TlsIo::Done(0) => Outcome::Nothing,
                        TlsIo::Done(count) => {
                            conn.send_buffer.remove_head(count);
                            conn.tls_want_write = false;
                            Outcome::Sent(count)
                        }
                        TlsIo::WantRead => Outcome::Nothing,
                        TlsIo::WantWrite => {
                            conn.tls_want_write = true;
                            Outcome::Nothing
                        }
                        TlsIo::Closed => Outcome::Fatal(io::ErrorKind::ConnectionAborted),
                        TlsIo::Failed(msg) => {
                            logging::debug!(conn.log, "tls write failed";
                                            "context" => "write",
                                            "conn_id" => id,
                                            "error" => msg);
                            Outcome::Fatal(io::ErrorKind::Other)
                        }
                    }
                } else {
                    match &mut conn.sock {
                        Sock::Tcp(stream) => match conn.send_buffer.egress(stream) {
                            Ok(0) => Outcome::Nothing,
                            Ok(count) => Outcome::Sent(count),
                            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Outcome::Nothing,
                            Err(err) => Outcome::Fatal(err.kind()),
                        },
                        _ => Outcome::Nothing,
                    }
                }
            }
        };

        let tick = self.tick;
        let conn = self.conns[id].as_mut().expect("Connection serviced above");

        match outcome {
            Outcome::Nothing => (),
            Outcome::Fatal(kind) => {
                logging::debug!(conn.log, "write failed";
                                "context" => "write",
                                "conn_id" => id,
                                "kind" => ?kind);
                conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
            }
            Outcome::Sent(count) => {
                conn.last_io = tick;
                conn.deliver(Event::Send(count));
            }
        }
    }

    fn tcp_accept(&mut self, listener_id: ConnId) {
        loop {
            let accepted = {
                let conn = match self.conns[listener_id].as_ref() {
                    Some(conn) => conn,
                    None => return,
                };

                match &conn.sock {
                    Sock::Listener(listener) => listener.accept(),
                    _ => return,
                }
            };

            match accepted {
                Ok((stream, peer)) => self.adopt_accepted(listener_id, stream, peer),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "accept failed";
                                   "context" => "accept",
                                   "conn_id" => listener_id,
                                   "error" => %err);
                    break;
                }
            }
        }
    }

    fn adopt_accepted(&mut self, listener_id: ConnId, stream: TcpStream, peer: SocketAddr) {
        let (handler, inherit_proto, tls_config) = {
            let listener = self.conns[listener_id].as_ref().expect("Listener checked above");
            (
                listener.handler.clone(),
                listener.proto.is_some(),
                listener.tls_config.clone(),
            )
        };

        let mut conn = Connection::new(Sock::Tcp(stream), handler, self.log.new(logging::o!()));
        conn.peer = Some(peer.into());
        conn.last_io = self.tick;

        if inherit_proto {
            conn.proto = Some(ProtoState::Http);
        }

        if let Some(config) = tls_config {
            match self.tls_provider.as_ref() {
                Some(provider) => match provider.server_session(&config) {
                    Ok(session) => {
                        conn.tls = Some(session);
                        conn.tls_config = Some(config);
                    }
                    Err(msg) => {
                        logging::warn!(self.log, "tls session setup failed";
                                       "context" => "accept",
                                       "error" => msg);
                        conn.flags.insert(Flags::CLOSE_IMMEDIATELY);
                    }
                },
                None => conn.flags.insert(Flags::CLOSE_IMMEDIATELY),
            }
        }

        let id = self.install(conn, Some(Ready::readable()));

        logging::debug!(self.log, "connection accepted";
                        "context" => "accept",
                        "conn_id" => id,
                        "peer" => %peer);

        if let Some(conn) = self.conns[id].as_mut() {
            conn.deliver(Event::Accept(Endpoint::from(peer)));
        }
    }

    /// Surfaces each datagram as an ephemeral pseudo-connection sharing the
    /// listener's socket, so the handler can reply within the same event.
    fn udp_accept(&mut self, listener_id: ConnId) {
        let mut datagram = [0u8; DATAGRAM_MAX];

        loop {
            let received = {
                let conn = match self.conns[listener_id].as_ref() {
                    Some(conn) => conn,
                    None => return,
                };

                match &conn.sock {
                    Sock::Udp(sock) => sock.recv_from(&mut datagram),
                    _ => return,
                }
            };

            match received {
                Ok((count, from)) => {
                    let (handler, sock) = {
                        let listener =
                            self.conns[listener_id].as_ref().expect("Listener checked above");
                        let sock = match &listener.sock {
                            Sock::Udp(sock) => sock.clone(),
                            _ => return,
                        };
                        (listener.handler.clone(), sock)
                    };

                    let mut conn =
                        Connection::new(Sock::Udp(sock), handler, self.log.new(logging::o!()));
                    conn.flags.insert(Flags::UDP);
                    conn.peer = Some(from.into());
                    conn.last_io = self.tick;
                    conn.recv_buffer.append(&datagram[..count]);

                    let id = self.install(conn, None);
                    self.udp_ephemeral.push(id);

                    if let Some(conn) = self.conns[id].as_mut() {
                        conn.deliver(Event::Accept(Endpoint::from(from)));
                        conn.deliver(Event::Recv(count));
                        http::drive(conn);
                    }
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    logging::warn!(self.log, "datagram receive failed";
                                   "context" => "accept",
                                   "conn_id" => listener_id,
                                   "error" => %err);
                    break;
                }
            }
        }
    }

    fn handle_broadcasts(&mut self) {
        for mut msg in self.wakeup.drain() {
            for id in self.live_ids() {
                if let Some(conn) = self.conns[id].as_mut() {
                    (msg.callback)(conn, &msg.data);
                }
            }
        }
    }

    fn close_conn(&mut self, id: ConnId) {
        let mut conn = match self.conns[id].take() {
            Some(conn) => conn,
            None => return,
        };

        self.live.shift_remove(&id);

        logging::debug!(conn.log, "closing connection";
                        "context" => "close",
                        "conn_id" => id,
                        "recv_len" => conn.recv_buffer.len(),
                        "send_len" => conn.send_buffer.len());

        conn.deliver(Event::Close);

        if conn.registered.is_some() {
            let result = match &conn.sock {
                Sock::Tcp(stream) => self.poll.deregister(stream),
                Sock::Listener(listener) => self.poll.deregister(listener),
                Sock::Udp(sock) => self.poll.deregister(&**sock),
                Sock::Closed => Ok(()),
            };

            if let Err(err) = result {
                logging::warn!(self.log, "deregistration failed";
                               "context" => "close",
                               "conn_id" => id,
                               "error" => %err);
            }
        }

        self.free.push(id);
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        for id in self.live_ids() {
            self.close_conn(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::handler;
    use crate::tls::TlsSession;
    use std::cell::RefCell;
    use std::io::{Read, Write};
    use std::thread;

    type Tags = Rc<RefCell<Vec<String>>>;

    fn tags() -> Tags {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn has(tags: &Tags, tag: &str) -> bool {
        tags.borrow().iter().any(|entry| entry == tag)
    }

    #[test]
    fn test_tcp_echo() {
        let mut mgr = Manager::new(None).unwrap();

        let server_tags = tags();
        let server_inner = server_tags.clone();

        let srv = mgr
            .bind(
                "tcp://127.0.0.1:0",
                handler(move |conn, event| match event {
                    Event::Accept(_) => server_inner.borrow_mut().push("accept".to_string()),
                    Event::Recv(count) => {
                        server_inner.borrow_mut().push(format!("recv({})", count));
                        let data = conn.recv_buffer_mut().split_head(count);
                        conn.send(&data);
                    }
                    Event::Send(count) => server_inner.borrow_mut().push(format!("send({})", count)),
                    Event::Close => server_inner.borrow_mut().push("close".to_string()),
                    _ => (),
                }),
            )
            .unwrap();

        let port = mgr.conn(srv).unwrap().local().unwrap().port();

        let client_tags = tags();
        let client_inner = client_tags.clone();
        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();

        mgr.connect(
            &format!("tcp://127.0.0.1:{}", port),
            handler(move |conn, event| match event {
                Event::Connect(code) => {
                    client_inner.borrow_mut().push(format!("connect({})", code));
                    conn.send(b"hello");
                }
                Event::Recv(count) => {
                    client_inner.borrow_mut().push(format!("recv({})", count));
                    let data = conn.recv_buffer_mut().split_head(count);
                    got_inner.borrow_mut().extend(data);
                    conn.set_flags(Flags::CLOSE_IMMEDIATELY);
                }
                Event::Send(count) => client_inner.borrow_mut().push(format!("send({})", count)),
                Event::Close => client_inner.borrow_mut().push("close".to_string()),
                _ => (),
            }),
        )
        .unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if has(&server_tags, "close") && has(&client_tags, "close") {
                break;
            }
        }

        assert_eq!(&got.borrow()[..], b"hello");
        assert_eq!(
            *client_tags.borrow(),
            vec!["connect(0)", "send(5)", "recv(5)", "close"]
        );
        assert_eq!(
            *server_tags.borrow(),
            vec!["accept", "recv(5)", "send(5)", "close"]
        );
    }

    #[test]
    fn test_graceful_close_after_drain() {
        let mut mgr = Manager::new(None).unwrap();

        let server_tags = tags();
        let server_inner = server_tags.clone();

        let srv = mgr
            .bind(
                "tcp://127.0.0.1:0",
                handler(move |conn, event| match event {
                    Event::Accept(_) => {
                        server_inner.borrow_mut().push("accept".to_string());
                        conn.send(b"bye");
                        conn.set_flags(Flags::FINISHED_SENDING_DATA);
                    }
                    Event::Send(count) => server_inner.borrow_mut().push(format!("send({})", count)),
                    Event::Close => server_inner.borrow_mut().push("close".to_string()),
                    _ => (),
                }),
            )
            .unwrap();

        let port = mgr.conn(srv).unwrap().local().unwrap().port();

        let client_tags = tags();
        let client_inner = client_tags.clone();
        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();

        mgr.connect(
            &format!("tcp://127.0.0.1:{}", port),
            handler(move |conn, event| match event {
                Event::Recv(count) => {
                    let data = conn.recv_buffer_mut().split_head(count);
                    got_inner.borrow_mut().extend(data);
                }
                Event::Close => client_inner.borrow_mut().push("close".to_string()),
                _ => (),
            }),
        )
        .unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if has(&server_tags, "close") && has(&client_tags, "close") {
                break;
            }
        }

        assert_eq!(&got.borrow()[..], b"bye");
        assert_eq!(*server_tags.borrow(), vec!["accept", "send(3)", "close"]);
    }

    #[test]
    fn test_connect_refused_reports_error_then_close() {
        // Reserve a port, then free it so the connect has nothing to hit.
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            probe.local_addr().unwrap().port()
        };

        let mut mgr = Manager::new(None).unwrap();

        let client_tags = tags();
        let client_inner = client_tags.clone();

        mgr.connect(
            &format!("tcp://127.0.0.1:{}", port),
            handler(move |_conn, event| match event {
                Event::Connect(code) => client_inner.borrow_mut().push(format!("connect({})", code)),
                Event::Close => client_inner.borrow_mut().push("close".to_string()),
                _ => (),
            }),
        )
        .unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if has(&client_tags, "close") {
                break;
            }
        }

        let recorded = client_tags.borrow();
        assert_eq!(recorded.len(), 2);
        assert!(recorded[0].starts_with("connect("));
        assert_ne!(recorded[0], "connect(0)");
        assert_eq!(recorded[1], "close");
    }

    #[test]
    fn test_udp_roundtrip_and_pseudo_conn_lifetime() {
        let mut mgr = Manager::new(None).unwrap();

        let srv = mgr
            .bind(
                "udp://127.0.0.1:0",
                handler(move |conn, event| {
                    if let Event::Recv(count) = event {
                        let data = conn.recv_buffer_mut().split_head(count);
                        conn.send(&data);
                    }
                }),
            )
            .unwrap();

        let port = mgr.conn(srv).unwrap().local().unwrap().port();

        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();

        let cli = mgr
            .connect(
                &format!("udp://127.0.0.1:{}", port),
                handler(move |conn, event| match event {
                    Event::Connect(0) => {
                        assert_eq!(conn.send(b"dgram"), 5);
                    }
                    Event::Recv(count) => {
                        let data = conn.recv_buffer_mut().split_head(count);
                        got_inner.borrow_mut().extend(data);
                    }
                    _ => (),
                }),
            )
            .unwrap();

        // Datagrams from anyone but the connected peer must never surface.
        let cli_port = mgr.conn(cli).unwrap().local().unwrap().port();
        let stranger = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        stranger
            .send_to(b"spoof", ("127.0.0.1", cli_port))
            .unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if !got.borrow().is_empty() {
                break;
            }
        }

        assert_eq!(&got.borrow()[..], b"dgram");

        // The per-datagram pseudo-connection is gone; only the listener and
        // the client remain.
        let mut count = 0;
        let mut cursor = mgr.next(None);
        while let Some(id) = cursor {
            count += 1;
            cursor = mgr.next(Some(id));
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn test_broadcast_reaches_every_live_connection() {
        let mut mgr = Manager::new(None).unwrap();

        let accepts = tags();
        let accepts_inner = accepts.clone();

        mgr.bind(
            "tcp://127.0.0.1:0",
            handler(move |_conn, event| {
                if let Event::Accept(_) = event {
                    accepts_inner.borrow_mut().push("accept".to_string());
                }
            }),
        )
        .unwrap();

        let port = mgr.conn(mgr.next(None).unwrap()).unwrap().local().unwrap().port();

        let connects = tags();

        for _ in 0..2 {
            let connects_inner = connects.clone();
            mgr.connect(
                &format!("tcp://127.0.0.1:{}", port),
                handler(move |_conn, event| {
                    if let Event::Connect(0) = event {
                        connects_inner.borrow_mut().push("connect".to_string());
                    }
                }),
            )
            .unwrap();
        }

        for _ in 0..1000 {
            mgr.poll(5);
            if accepts.borrow().len() == 2 && connects.borrow().len() == 2 {
                break;
            }
        }

        let broadcaster = mgr.broadcaster();
        let sender = thread::spawn(move || {
            assert!(broadcaster.broadcast(
                |conn, data| {
                    // Hold the output so the assertion below can see it.
                    conn.set_flags(Flags::BUFFER_BUT_DONT_SEND);
                    conn.send(data);
                },
                b"ping".to_vec(),
            ));
        });
        sender.join().unwrap();

        let mut satisfied = false;

        for _ in 0..1000 {
            mgr.poll(5);

            let mut count = 0;
            let mut all = true;
            let mut cursor = mgr.next(None);

            while let Some(id) = cursor {
                count += 1;
                if mgr.conn(id).unwrap().send_buffer().as_slice() != b"ping" {
                    all = false;
                }
                cursor = mgr.next(Some(id));
            }

            // Listener, two clients, two accepted connections.
            if count == 5 && all {
                satisfied = true;
                break;
            }
        }

        assert!(satisfied, "broadcast payload missing on some connection");
    }

    #[test]
    fn test_add_socket_joins_the_loop() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let std_stream = std::net::TcpStream::connect(addr).unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let mut mgr = Manager::new(None).unwrap();

        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();

        mgr.add_socket(
            TcpStream::from_stream(std_stream).unwrap(),
            handler(move |conn, event| {
                if let Event::Recv(count) = event {
                    let data = conn.recv_buffer_mut().split_head(count);
                    got_inner.borrow_mut().extend(data);
                }
            }),
        )
        .unwrap();

        peer.write_all(b"raw").unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if !got.borrow().is_empty() {
                break;
            }
        }

        assert_eq!(&got.borrow()[..], b"raw");
    }

    #[test]
    fn test_next_iterates_in_creation_order() {
        let mut mgr = Manager::new(None).unwrap();

        let a = mgr.bind("tcp://127.0.0.1:0", handler(|_conn, _event| {})).unwrap();
        let b = mgr.bind("tcp://127.0.0.1:0", handler(|_conn, _event| {})).unwrap();
        let c = mgr.bind("tcp://127.0.0.1:0", handler(|_conn, _event| {})).unwrap();

        assert_eq!(mgr.next(None), Some(a));
        assert_eq!(mgr.next(Some(a)), Some(b));
        assert_eq!(mgr.next(Some(b)), Some(c));
        assert_eq!(mgr.next(Some(c)), None);
    }

    #[test]
    fn test_http_protocol_attach_and_inherit() {
        let mut mgr = Manager::new(None).unwrap();

        let uris = tags();
        let uris_inner = uris.clone();

        let srv = mgr
            .bind(
                "tcp://127.0.0.1:0",
                handler(move |conn, event| {
                    if let Event::HttpRequest(msg) = event {
                        if let crate::http::StartLine::Request { uri, .. } = msg.start {
                            uris_inner.borrow_mut().push(uri.to_string());
                        }
                        assert_eq!(msg.body, b"xyz");
                        conn.send(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
                        conn.set_flags(Flags::FINISHED_SENDING_DATA);
                    }
                }),
            )
            .unwrap();
        mgr.set_protocol_http_websocket(srv);

        let port = mgr.conn(srv).unwrap().local().unwrap().port();

        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();
        let closed = Rc::new(RefCell::new(false));
        let closed_inner = closed.clone();

        mgr.connect(
            &format!("tcp://127.0.0.1:{}", port),
            handler(move |conn, event| match event {
                Event::Connect(0) => {
                    conn.send(b"GET /a HTTP/1.1\r\nHost: h\r\nContent-Length: 3\r\n\r\nxyz");
                }
                Event::Recv(count) => {
                    let data = conn.recv_buffer_mut().split_head(count);
                    got_inner.borrow_mut().extend(data);
                }
                Event::Close => *closed_inner.borrow_mut() = true,
                _ => (),
            }),
        )
        .unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if *closed.borrow() {
                break;
            }
        }

        assert_eq!(*uris.borrow(), vec!["/a".to_string()]);
        let reply = String::from_utf8(got.borrow().clone()).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("ok"));
    }

    struct MockTlsProvider;

    impl TlsProvider for MockTlsProvider {
        fn server_session(&self, _config: &TlsConfig) -> Result<Box<dyn TlsSession>, String> {
            Ok(Box::new(MockSession {
                server: true,
                state: 0,
            }))
        }

        fn client_session(&self, _config: &TlsConfig) -> Result<Box<dyn TlsSession>, String> {
            Ok(Box::new(MockSession {
                server: false,
                state: 0,
            }))
        }
    }

    /// Toy handshake: the client sends `C`, the server answers `S`, then
    /// both sides pass bytes through unchanged. Enough to exercise the
    /// pumping and routing paths without a real provider.
    struct MockSession {
        server: bool,
        state: u8,
    }

    impl TlsSession for MockSession {
        fn handshake(&mut self, stream: &mut TcpStream) -> TlsHandshake {
            let mut byte = [0u8; 1];

            if self.server {
                match stream.read(&mut byte) {
                    Ok(1) if byte[0] == b'C' => match stream.write(b"S") {
                        Ok(1) => TlsHandshake::Done,
                        _ => TlsHandshake::Failed("short hello write".to_string()),
                    },
                    Ok(_) => TlsHandshake::Failed("bad client hello".to_string()),
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => TlsHandshake::WantRead,
                    Err(err) => TlsHandshake::Failed(err.to_string()),
                }
            } else {
                match self.state {
                    0 => match stream.write(b"C") {
                        Ok(1) => {
                            self.state = 1;
                            TlsHandshake::WantRead
                        }
                        Ok(_) => TlsHandshake::Failed("short hello write".to_string()),
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            TlsHandshake::WantWrite
                        }
                        Err(err) => TlsHandshake::Failed(err.to_string()),
                    },
                    _ => match stream.read(&mut byte) {
                        Ok(1) if byte[0] == b'S' => TlsHandshake::Done,
                        Ok(_) => TlsHandshake::Failed("bad server hello".to_string()),
                        Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                            TlsHandshake::WantRead
                        }
                        Err(err) => TlsHandshake::Failed(err.to_string()),
                    },
                }
            }
        }

        fn read(&mut self, stream: &mut TcpStream, buf: &mut [u8]) -> TlsIo {
            match stream.read(buf) {
                Ok(0) => TlsIo::Closed,
                Ok(count) => TlsIo::Done(count),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => TlsIo::WantRead,
                Err(err) => TlsIo::Failed(err.to_string()),
            }
        }

        fn write(&mut self, stream: &mut TcpStream, buf: &[u8]) -> TlsIo {
            match stream.write(buf) {
                Ok(count) => TlsIo::Done(count),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => TlsIo::WantWrite,
                Err(err) => TlsIo::Failed(err.to_string()),
            }
        }
    }

    #[test]
    fn test_tls_sessions_pump_then_echo() {
        let mut mgr = Manager::new(None).unwrap();
        mgr.set_tls_provider(Box::new(MockTlsProvider));

        let srv = mgr
            .bind(
                "tcp://127.0.0.1:0",
                handler(move |conn, event| {
                    if let Event::Recv(count) = event {
                        let data = conn.recv_buffer_mut().split_head(count);
                        conn.send(&data);
                    }
                }),
            )
            .unwrap();
        mgr.set_ssl(srv, Some("server.pem"), None).unwrap();

        let port = mgr.conn(srv).unwrap().local().unwrap().port();

        let got = Rc::new(RefCell::new(Vec::new()));
        let got_inner = got.clone();
        let closed = Rc::new(RefCell::new(false));
        let closed_inner = closed.clone();

        let cli = mgr
            .connect(
                &format!("tcp://127.0.0.1:{}", port),
                handler(move |conn, event| match event {
                    Event::Connect(0) => {
                        conn.send(b"tls hello");
                    }
                    Event::Recv(count) => {
                        let data = conn.recv_buffer_mut().split_head(count);
                        got_inner.borrow_mut().extend(data);
                        conn.set_flags(Flags::CLOSE_IMMEDIATELY);
                    }
                    Event::Close => *closed_inner.borrow_mut() = true,
                    _ => (),
                }),
            )
            .unwrap();
        mgr.set_ssl(cli, None, None).unwrap();

        for _ in 0..1000 {
            mgr.poll(5);
            if *closed.borrow() {
                break;
            }
        }

        assert_eq!(&got.borrow()[..], b"tls hello");
        assert!(mgr
            .conn(srv)
            .map(|conn| conn.flags().contains(Flags::LISTENING))
            .unwrap_or(false));
    }

    #[test]
    fn test_set_ssl_requires_provider() {
        let mut mgr = Manager::new(None).unwrap();

        let srv = mgr.bind("tcp://127.0.0.1:0", handler(|_conn, _event| {})).unwrap();

        let result = mgr.set_ssl(srv, Some("server.pem"), None);
        assert_eq!(result.unwrap_err(), "no TLS provider registered");
    }
}
