//! RFC 6455 frame codec: a stateful decoder that reassembles fragmented
//! messages out of the recv buffer and a stateless encoder that prepends
//! frame headers, masking client-side.

use crate::connection::{Connection, Flags};
use crate::http::{protocol_failure, Step};
use crate::logging;
use crate::support::{ErrorType, NetworkError, NetworkResult};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use std::mem;

pub(crate) const MAX_HEADER_SIZE: usize = 14;

/// Frame opcode nibble.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xa,
}

impl Opcode {
    pub(crate) fn from_u4(value: u8) -> Option<Opcode> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xa => Some(Opcode::Pong),
            _ => None,
        }
    }

    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) >= 0x8
    }
}

/// Which side of the connection we are; decides masking direction.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WsRole {
    Server,
    Client,
}

/// A reassembled WebSocket message. For fragmented input the opcode is that
/// of the first fragment and `data` is the concatenated payload.
#[derive(Debug, Eq, PartialEq)]
pub struct WsMessage<'a> {
    pub opcode: Opcode,
    pub fin: bool,
    pub data: &'a [u8],
}

/// Decoder state while a fragmented message is in flight.
#[derive(Default)]
pub(crate) struct WsDecodeState {
    pub fragments: Vec<u8>,
    pub frag_opcode: Option<Opcode>,
}

#[derive(Debug)]
struct FrameHeader {
    fin: bool,
    opcode: Opcode,
    masked: bool,
    mask: [u8; 4],
    payload_len: usize,
    header_len: usize,
}

/// Parses one frame header off the front of `buf`. `Wait` until the full
/// header is present; framing violations are fatal.
fn parse_frame_header(buf: &[u8]) -> NetworkResult<FrameHeader> {
    if buf.len() < 2 {
        return Err(NetworkError::Wait);
    }

    if buf[0] & 0x70 != 0 {
        return Err(NetworkError::Fatal(ErrorType::Protocol("reserved bits set")));
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = Opcode::from_u4(buf[0] & 0x0f)
        .ok_or(NetworkError::Fatal(ErrorType::Protocol("unknown opcode")))?;

    let masked = buf[1] & 0x80 != 0;
    let code = (buf[1] & 0x7f) as usize;

    let (payload_len, mut header_len) = match code {
        126 => {
            if buf.len() < 4 {
                return Err(NetworkError::Wait);
            }
            let len = (&buf[2..4]).read_u16::<BigEndian>()? as usize;
            (len, 4)
        }
        127 => {
            if buf.len() < 10 {
                return Err(NetworkError::Wait);
            }
            let len = (&buf[2..10]).read_u64::<BigEndian>()? as usize;
            (len, 10)
        }
        len => (len, 2),
    };

    let mut mask = [0u8; 4];

    if masked {
        if buf.len() < header_len + 4 {
            return Err(NetworkError::Wait);
        }
        mask.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
    }

    Ok(FrameHeader {
        fin,
        opcode,
        masked,
        mask,
        payload_len,
        header_len,
    })
}

/// Encodes a frame header into `out`, returning its length. The encoder
/// never fragments, so FIN is always set.
fn encode_header(out: &mut [u8; MAX_HEADER_SIZE], opcode: Opcode, len: usize, mask: Option<[u8; 4]>) -> usize {
    let mut cursor = Cursor::new(&mut out[..]);
    let mask_bit = if mask.is_some() { 0x80u8 } else { 0 };

    cursor.write_u8(0x80 | opcode as u8).expect("Header write");

    if len < 126 {
        cursor.write_u8(mask_bit | len as u8).expect("Header write");
    } else if len <= 65535 {
        cursor.write_u8(mask_bit | 126).expect("Header write");
        cursor.write_u16::<BigEndian>(len as u16).expect("Header write");
    } else {
        cursor.write_u8(mask_bit | 127).expect("Header write");
        cursor.write_u64::<BigEndian>(len as u64).expect("Header write");
    }

    if let Some(mask) = mask {
        cursor.write_all(&mask).expect("Header write");
    }

    cursor.position() as usize
}

/// XORs the payload with the masking key. `offset` is the running payload
/// position, so multi-part payloads can share one key.
pub fn apply_mask(data: &mut [u8], mask: [u8; 4], offset: usize) {
    for (idx, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[(offset + idx) & 3];
    }
}

impl Connection {
    /// Appends one WebSocket frame to the send buffer: header immediately
    /// followed by payload, so concurrent queued frames never interleave.
    /// Client connections mask with a fresh random key per frame.
    pub fn send_websocket_frame(&mut self, opcode: Opcode, data: &[u8]) {
        self.send_websocket_framev(opcode, &[data]);
    }

    /// Same as [`send_websocket_frame`](Connection::send_websocket_frame),
    /// but all parts share a single header and masking key.
    pub fn send_websocket_framev(&mut self, opcode: Opcode, parts: &[&[u8]]) {
        let total: usize = parts.iter().map(|part| part.len()).sum();

        let mask = match self.ws_role {
            Some(WsRole::Client) => Some(rand::random::<[u8; 4]>()),
            _ => None,
        };

        if opcode == Opcode::Close {
            self.ws_close_sent = true;
        }

        let mut header = [0u8; MAX_HEADER_SIZE];
        let header_len = encode_header(&mut header, opcode, total, mask);

        self.send_buffer.reserve(header_len + total);
        self.send_buffer.append(&header[..header_len]);

        let payload_start = self.send_buffer.len();

        for part in parts {
            self.send_buffer.append(part);
        }

        if let Some(mask) = mask {
            apply_mask(&mut self.send_buffer.as_mut_slice()[payload_start..], mask, 0);
        }
    }
}

/// Decodes as many complete frames as the recv buffer holds, delivering
/// reassembled messages. Returns `Idle` when more bytes are needed.
pub(crate) fn drive_frames(conn: &mut Connection, state: &mut WsDecodeState) -> Step {
    loop {
        let header = match parse_frame_header(conn.recv_buffer.as_slice()) {
            Ok(header) => header,
            Err(NetworkError::Wait) => return Step::Idle,
            Err(NetworkError::Fatal(ErrorType::Protocol(reason))) => {
                return fail(conn, reason);
            }
            Err(NetworkError::Fatal(_)) => {
                return fail(conn, "websocket framing error");
            }
        };

        let total = header.header_len + header.payload_len;

        if conn.recv_buffer.len() < total {
            return Step::Idle;
        }

        match conn.ws_role {
            Some(WsRole::Server) if !header.masked => {
                return fail(conn, "unmasked frame from client");
            }
            Some(WsRole::Client) if header.masked => {
                return fail(conn, "masked frame from server");
            }
            _ => (),
        }

        let mut frame = conn.recv_buffer.split_head(total);
        let payload = &mut frame[header.header_len..];

        if header.masked {
            apply_mask(payload, header.mask, 0);
        }

        if header.opcode.is_control() {
            if !header.fin {
                return fail(conn, "fragmented control frame");
            }

            if header.payload_len > 125 {
                return fail(conn, "oversized control frame");
            }

            let message = WsMessage {
                opcode: header.opcode,
                fin: true,
                data: payload,
            };
            conn.deliver(crate::event::Event::WsFrame(&message));

            if header.opcode == Opcode::Close {
                logging::debug!(conn.log, "close frame received";
                                "context" => "websocket",
                                "conn_id" => conn.id);

                if !conn.ws_close_sent {
                    let reply = payload.to_vec();
                    conn.send_websocket_frame(Opcode::Close, &reply);
                }

                conn.flags.insert(Flags::FINISHED_SENDING_DATA);
            }
        } else if header.opcode == Opcode::Continuation {
            if state.frag_opcode.is_none() {
                return fail(conn, "continuation without start frame");
            }

            state.fragments.extend_from_slice(payload);

            if header.fin {
                let opcode = state.frag_opcode.take().expect("Fragment opcode must be set");
                let data = mem::replace(&mut state.fragments, Vec::new());

                let message = WsMessage {
                    opcode,
                    fin: true,
                    data: &data,
                };
                conn.deliver(crate::event::Event::WsFrame(&message));
            }
        } else {
            if state.frag_opcode.is_some() {
                return fail(conn, "data frame inside fragmented message");
            }

            if header.fin {
                let message = WsMessage {
                    opcode: header.opcode,
                    fin: true,
                    data: payload,
                };
                conn.deliver(crate::event::Event::WsFrame(&message));
            } else {
                state.frag_opcode = Some(header.opcode);
                state.fragments.extend_from_slice(payload);
            }
        }
    }
}

fn fail(conn: &mut Connection, reason: &'static str) -> Step {
    protocol_failure(conn, reason)
}
