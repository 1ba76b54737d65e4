//! HTTP/1.1 message parsing and the built-in HTTP/WebSocket protocol
//! driver. `parse_http` is a pure function over a byte slice; the driver
//! consumes the recv buffer, synthesizes `HttpRequest`/`HttpReply` events
//! and handles the WebSocket upgrade in both directions.

use crate::connection::{Connection, Flags};
use crate::event::Event;
use crate::logging;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use crate::ws::{self, WsDecodeState, WsRole};

/// Upper bound on the number of headers in one message.
pub const MAX_HTTP_HEADERS: usize = 40;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// First line of a message; decides request versus response.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StartLine<'a> {
    Request {
        method: &'a str,
        uri: &'a str,
        proto: &'a str,
    },
    Response {
        proto: &'a str,
        code: u16,
        status: &'a str,
    },
}

/// A parsed HTTP message. All slices are views into the buffer handed to
/// [`parse_http`]; they are only valid while that buffer is untouched.
#[derive(Debug)]
pub struct HttpMessage<'a> {
    pub start: StartLine<'a>,
    pub headers: Vec<(&'a str, &'a str)>,
    pub body: &'a [u8],
    /// Whether the body carried in `body` is the whole message body.
    pub complete: bool,
}

impl<'a> HttpMessage<'a> {
    #[inline]
    pub fn is_request(&self) -> bool {
        match self.start {
            StartLine::Request { .. } => true,
            StartLine::Response { .. } => false,
        }
    }

    /// Case-insensitive header lookup returning the first match.
    pub fn header(&self, name: &str) -> Option<&'a str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| *value)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Declared body length, if a well-formed `Content-Length` is present.
    pub fn content_length(&self) -> Option<usize> {
        self.header("content-length")
            .and_then(|value| value.trim().parse::<usize>().ok())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|value| value.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// True for a request carrying the complete WebSocket upgrade triple.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.is_request()
            && self
                .header("upgrade")
                .map(|value| value.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && self
                .header("connection")
                .map(|value| {
                    value
                        .split(',')
                        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
                })
                .unwrap_or(false)
            && self.has_header("sec-websocket-key")
    }
}

/// Parses the start line and headers off the front of `buf`. Returns `Wait`
/// until the blank line terminating the headers has arrived; the `usize` in
/// the success case is the byte count of the consumed header section. The
/// returned message has an empty body; body extraction is the caller's
/// business, guided by the headers.
pub fn parse_http(buf: &[u8]) -> NetworkResult<(HttpMessage<'_>, usize)> {
    let head_end = match find_header_end(buf) {
        Some(end) => end,
        None => return Err(NetworkError::Wait),
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| NetworkError::Fatal(ErrorType::Protocol("header bytes not valid utf-8")))?;

    let mut lines = head.split("\r\n");

    let start_line = lines.next().unwrap_or("");
    let start = parse_start_line(start_line)?;

    let mut headers = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(' ') || line.starts_with('\t') {
            return Err(NetworkError::Fatal(ErrorType::Protocol(
                "obsolete header continuation",
            )));
        }

        let colon = line
            .find(':')
            .ok_or(NetworkError::Fatal(ErrorType::Protocol("malformed header")))?;

        if headers.len() == MAX_HTTP_HEADERS {
            return Err(NetworkError::Fatal(ErrorType::Protocol("too many headers")));
        }

        let name = &line[..colon];

        if name.is_empty() {
            return Err(NetworkError::Fatal(ErrorType::Protocol("empty header name")));
        }

        headers.push((name, line[colon + 1..].trim()));
    }

    let consumed = head_end + 2;

    let mut message = HttpMessage {
        start,
        headers,
        body: &buf[consumed..consumed],
        complete: false,
    };

    message.complete = match message.content_length() {
        Some(0) => true,
        Some(_) => false,
        None => message.is_request() && !message.is_chunked() && !message.has_header("content-length"),
    };

    Ok((message, consumed))
}

/// Byte offset of the blank line separating headers from the body, pointing
/// just past the final header CRLF.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 2)
}

fn parse_start_line(line: &str) -> NetworkResult<StartLine<'_>> {
    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or("");
    let second = parts.next().unwrap_or("");
    let third = parts.next().unwrap_or("");

    if first.starts_with("HTTP/") {
        let code = second
            .parse::<u16>()
            .map_err(|_| NetworkError::Fatal(ErrorType::Protocol("malformed status code")))?;

        return Ok(StartLine::Response {
            proto: first,
            code,
            status: third,
        });
    }

    if first.is_empty() || second.is_empty() || !third.starts_with("HTTP/") {
        return Err(NetworkError::Fatal(ErrorType::Protocol("malformed start line")));
    }

    Ok(StartLine::Request {
        method: first,
        uri: second,
        proto: third,
    })
}

/// base64(SHA-1(client_key ∥ GUID)), the RFC 6455 handshake digest.
pub fn websocket_accept_key(client_key: &str) -> String {
    use sha1::{Digest, Sha1};

    let mut digest = Sha1::new();
    digest.update(client_key.as_bytes());
    digest.update(WEBSOCKET_GUID.as_bytes());

    base64::encode(digest.finalize())
}

/// Protocol layer attached to a connection. `Http` parses messages until an
/// upgrade or a streaming body moves the connection on; `Passthrough` leaves
/// all further bytes to the raw `Recv` events.
pub(crate) enum ProtoState {
    Http,
    WsClientHandshake { key: String },
    Ws(WsDecodeState),
    Passthrough,
}

/// Outcome of one protocol-driver round.
pub(crate) enum Step {
    /// No further progress until more bytes arrive.
    Idle,
    /// Progress was made in the current state.
    Again,
    /// The connection moves to a new protocol state.
    Switch(ProtoState),
}

/// Runs the protocol layer over whatever the recv buffer holds. Invoked by
/// the dispatcher after every `Recv` delivery.
pub(crate) fn drive(conn: &mut Connection) {
    let mut state = match conn.proto.take() {
        Some(state) => state,
        None => return,
    };

    loop {
        let step = match &mut state {
            ProtoState::Http => drive_http(conn),
            ProtoState::WsClientHandshake { key } => drive_client_handshake(conn, key),
            ProtoState::Ws(decode) => ws::drive_frames(conn, decode),
            ProtoState::Passthrough => Step::Idle,
        };

        match step {
            Step::Idle => break,
            Step::Again => (),
            Step::Switch(next) => state = next,
        }
    }

    // A handler may have installed its own protocol state mid-drive; that
    // one wins.
    if conn.proto.is_none() {
        conn.proto = Some(state);
    }
}

/// Delivers `ProtocolError` and schedules the close.
pub(crate) fn protocol_failure(conn: &mut Connection, reason: &'static str) -> Step {
    logging::debug!(conn.log, "protocol violation";
                    "context" => "proto",
                    "conn_id" => conn.id,
                    "reason" => reason);

    conn.deliver(Event::ProtocolError(reason));
    conn.flags.insert(Flags::CLOSE_IMMEDIATELY);

    Step::Switch(ProtoState::Passthrough)
}

enum HttpPlan {
    Wait,
    Fail(&'static str),
    /// Headers plus a fixed-length body.
    Fixed { consumed: usize, length: usize },
    /// Headers only; the body streams through raw `Recv` events.
    Streaming { consumed: usize },
    Upgrade { consumed: usize, key: String },
}

fn drive_http(conn: &mut Connection) -> Step {
    let plan = match parse_http(conn.recv_buffer.as_slice()) {
        Err(NetworkError::Wait) => HttpPlan::Wait,
        Err(NetworkError::Fatal(ErrorType::Protocol(reason))) => HttpPlan::Fail(reason),
        Err(NetworkError::Fatal(_)) => HttpPlan::Fail("http parse error"),
        Ok((message, consumed)) => {
            if message.is_websocket_upgrade() {
                match message.header("sec-websocket-key") {
                    Some(key) => HttpPlan::Upgrade {
                        consumed,
                        key: key.to_string(),
                    },
                    None => HttpPlan::Fail("missing websocket key"),
                }
            } else if message.has_header("content-length") {
                match message.content_length() {
                    Some(length) => HttpPlan::Fixed { consumed, length },
                    None => HttpPlan::Fail("malformed content length"),
                }
            } else if message.is_chunked() || !message.is_request() {
                HttpPlan::Streaming { consumed }
            } else {
                HttpPlan::Fixed {
                    consumed,
                    length: 0,
                }
            }
        }
    };

    match plan {
        HttpPlan::Wait => Step::Idle,
        HttpPlan::Fail(reason) => protocol_failure(conn, reason),
        HttpPlan::Fixed { consumed, length } => {
            let total = consumed + length;

            if conn.recv_buffer.len() < total {
                return Step::Idle;
            }

            let detached = conn.recv_buffer.split_head(total);
            deliver_message(conn, &detached, consumed, true);

            Step::Again
        }
        HttpPlan::Streaming { consumed } => {
            let detached = conn.recv_buffer.split_head(consumed);
            deliver_message(conn, &detached, consumed, false);

            Step::Switch(ProtoState::Passthrough)
        }
        HttpPlan::Upgrade { consumed, key } => {
            logging::debug!(conn.log, "websocket upgrade requested";
                            "context" => "proto",
                            "conn_id" => conn.id);

            let detached = conn.recv_buffer.split_head(consumed);

            if let Ok((mut message, _)) = parse_http(&detached) {
                message.complete = true;
                conn.deliver(Event::WsHandshakeRequest(&message));
            }

            if conn.flags.contains(Flags::CLOSE_IMMEDIATELY) {
                return Step::Switch(ProtoState::Passthrough);
            }

            // The core answers unless the handler already queued a reply.
            if conn.send_buffer.is_empty() {
                send_handshake_accept(conn, &key);
            }

            conn.ws_role = Some(WsRole::Server);
            conn.deliver(Event::WsHandshakeDone);

            Step::Switch(ProtoState::Ws(WsDecodeState::default()))
        }
    }
}

fn drive_client_handshake(conn: &mut Connection, key: &str) -> Step {
    enum HandshakePlan {
        Wait,
        Fail(&'static str),
        Accept { consumed: usize },
    }

    let plan = match parse_http(conn.recv_buffer.as_slice()) {
        Err(NetworkError::Wait) => HandshakePlan::Wait,
        Err(NetworkError::Fatal(_)) => HandshakePlan::Fail("malformed handshake reply"),
        Ok((message, consumed)) => {
            let accepted = match message.start {
                StartLine::Response { code: 101, .. } => message
                    .header("sec-websocket-accept")
                    .map(|accept| accept == websocket_accept_key(key))
                    .unwrap_or(false),
                _ => false,
            };

            if accepted {
                HandshakePlan::Accept { consumed }
            } else {
                HandshakePlan::Fail("websocket handshake rejected")
            }
        }
    };

    match plan {
        HandshakePlan::Wait => Step::Idle,
        HandshakePlan::Fail(reason) => protocol_failure(conn, reason),
        HandshakePlan::Accept { consumed } => {
            conn.recv_buffer.remove_head(consumed);
            conn.deliver(Event::WsHandshakeDone);

            Step::Switch(ProtoState::Ws(WsDecodeState::default()))
        }
    }
}

fn deliver_message(conn: &mut Connection, detached: &[u8], consumed: usize, complete: bool) {
    if let Ok((mut message, _)) = parse_http(detached) {
        message.body = &detached[consumed..];
        message.complete = complete;

        logging::trace!(conn.log, "http message parsed";
                        "context" => "proto",
                        "conn_id" => conn.id,
                        "request" => message.is_request(),
                        "body_len" => message.body.len());

        if message.is_request() {
            conn.deliver(Event::HttpRequest(&message));
        } else {
            conn.deliver(Event::HttpReply(&message));
        }
    }
}

pub(crate) fn send_handshake_accept(conn: &mut Connection, key: &str) {
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        websocket_accept_key(key)
    );

    conn.send(response.as_bytes());
}

impl Connection {
    /// Sends the client side of the WebSocket handshake and arms the
    /// connection to validate the 101 reply. `extra_headers`, when present,
    /// must be complete CRLF-terminated header lines.
    pub fn send_websocket_handshake(&mut self, uri: &str, extra_headers: Option<&str>) {
        let nonce: [u8; 16] = rand::random();
        let key = base64::encode(&nonce);

        let host = self
            .peer
            .map(|peer| peer.to_string())
            .unwrap_or_else(String::new);

        let mut request = format!(
            "GET {} HTTP/1.1\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Host: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: {}\r\n",
            uri, host, key
        );

        if let Some(extra) = extra_headers {
            request.push_str(extra);
        }

        request.push_str("\r\n");

        self.send(request.as_bytes());
        self.ws_role = Some(WsRole::Client);
        self.proto = Some(ProtoState::WsClientHandshake { key });
    }
}
