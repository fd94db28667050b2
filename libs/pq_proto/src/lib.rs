//! Postgres protocol messages serialization-deserialization. See
//! <https://www.postgresql.org/docs/devel/protocol-message-formats.html>
//! on message formats.

pub mod framed;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;

// Proto versions
pub const PG_PROTOCOL_VERSION: u32 = 196608; // 3.0
pub const CANCEL_REQUEST_CODE: u32 = (1234 << 16) | 5678;
pub const NEGOTIATE_SSL_CODE: u32 = (1234 << 16) | 5679;

// Majority of the real startup packets are small; this just guards against
// malicious or broken frontends.
pub const MAX_STARTUP_PACKET_LENGTH: usize = 10000;

// An arbitrary cap on regular message bodies, way above anything a
// replication peer legitimately sends.
pub const MAX_MESSAGE_LENGTH: usize = 16 * 1024 * 1024;

pub const TEXT_OID: i32 = 25;
pub const INT4_OID: i32 = 23;
pub const INT8_OID: i32 = 20;

/// Postgres protocol violation: the bytes don't make sense as a message.
#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Invalid packet was received from the client (e.g. broken length).
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Failed to serialize a message.
    #[error("Failed to serialize message: {0}")]
    BadMessage(String),
}

/// The first packet a frontend sends: either a regular startup message with
/// name/value parameters, or one of the special request codes.
#[derive(Debug)]
pub enum FeStartupPacket {
    CancelRequest { backend_pid: u32, cancel_key: u32 },
    SslRequest,
    StartupMessage {
        major_version: u32,
        minor_version: u32,
        params: StartupMessageParams,
    },
}

/// Parameters of the startup message, in the order the frontend sent them.
#[derive(Debug, Default, Clone)]
pub struct StartupMessageParams {
    params: Vec<(String, String)>,
}

impl StartupMessageParams {
    /// Get parameter value by name, if it was present in the startup packet.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all name/value pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        self.params.push((name.to_owned(), value.to_owned()));
    }
}

/// Message sent by the frontend, after the startup handshake.
#[derive(Debug)]
pub enum FeMessage {
    Query(Bytes),
    Parse,
    Describe,
    Bind,
    Execute,
    Close,
    FunctionCall,
    Sync,
    Flush,
    CopyData(Bytes),
    CopyDone,
    CopyFail,
    Terminate,
}

impl FeStartupPacket {
    /// Parse startup packet from the given buffer. Returns `None` if the
    /// packet is not yet fully present in `buf`.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<FeStartupPacket>, ProtocolError> {
        // Startup packets are unusual: no type byte, just length + body.
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = (&buf[0..4]).get_u32() as usize;

        // The proposed replacement is `!(8..=MAX_STARTUP_PACKET_LENGTH).contains(&len)`,
        // which is less readable
        #[allow(clippy::manual_range_contains)]
        if len < 8 || len > MAX_STARTUP_PACKET_LENGTH {
            return Err(ProtocolError::Protocol(format!(
                "invalid startup packet message length {}",
                len
            )));
        }

        if buf.len() < len {
            return Ok(None);
        }
        let mut msg = buf.split_to(len).freeze();
        msg.advance(4); // consume the length

        let request_code = msg.get_u32();
        let message = match request_code {
            CANCEL_REQUEST_CODE => {
                if msg.remaining() != 8 {
                    return Err(ProtocolError::Protocol(
                        "CancelRequest message is malformed, backend PID / secret key missing"
                            .to_owned(),
                    ));
                }
                FeStartupPacket::CancelRequest {
                    backend_pid: msg.get_u32(),
                    cancel_key: msg.get_u32(),
                }
            }
            NEGOTIATE_SSL_CODE => FeStartupPacket::SslRequest,
            _ => {
                // The request code is a protocol version.
                let major_version = request_code >> 16;
                let minor_version = request_code & ((1 << 16) - 1);
                if major_version != PG_PROTOCOL_VERSION >> 16 {
                    return Err(ProtocolError::Protocol(format!(
                        "unsupported protocol version {}.{}",
                        major_version, minor_version
                    )));
                }

                // Parse null-terminated name/value pairs, with one extra null
                // terminating the list.
                let mut params = StartupMessageParams::default();
                let mut pairs = msg.clone();
                loop {
                    let name = get_cstr(&mut pairs)?;
                    if name.is_empty() {
                        if pairs.has_remaining() {
                            return Err(ProtocolError::Protocol(
                                "invalid startup packet layout: expected terminator as last byte"
                                    .to_owned(),
                            ));
                        }
                        break;
                    }
                    let value = get_cstr(&mut pairs)?;
                    params.params.push((
                        String::from_utf8(name.to_vec()).map_err(|_| {
                            ProtocolError::Protocol("non-UTF8 parameter name".to_owned())
                        })?,
                        String::from_utf8(value.to_vec()).map_err(|_| {
                            ProtocolError::Protocol("non-UTF8 parameter value".to_owned())
                        })?,
                    ));
                }

                FeStartupPacket::StartupMessage {
                    major_version,
                    minor_version,
                    params,
                }
            }
        };

        Ok(Some(message))
    }

    /// Serialize a startup message with the given parameters (frontend side).
    pub fn write_startup_message<'a, I>(buf: &mut BytesMut, params: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let len_pos = buf.len();
        buf.put_u32(0); // patched below
        buf.put_u32(PG_PROTOCOL_VERSION);
        for (name, value) in params {
            buf.put_slice(name.as_bytes());
            buf.put_u8(0);
            buf.put_slice(value.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        let len = buf.len() - len_pos;
        (&mut buf[len_pos..len_pos + 4]).put_u32(len as u32);
    }
}

impl FeMessage {
    /// Parse one message from the buffer. Returns `None` if the message is
    /// not yet fully present in `buf`.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<FeMessage>, ProtocolError> {
        let (tag, body) = match parse_raw_message(buf)? {
            Some(msg) => msg,
            None => return Ok(None),
        };

        let message = match tag {
            b'Q' => {
                // The query text is null-terminated.
                let mut query = body;
                if query.is_empty() || query[query.len() - 1] != 0 {
                    return Err(ProtocolError::Protocol(
                        "Query message is not null-terminated".to_owned(),
                    ));
                }
                query.truncate(query.len() - 1);
                FeMessage::Query(query)
            }
            b'P' => FeMessage::Parse,
            b'D' => FeMessage::Describe,
            b'E' => FeMessage::Execute,
            b'B' => FeMessage::Bind,
            b'C' => FeMessage::Close,
            b'F' => FeMessage::FunctionCall,
            b'S' => FeMessage::Sync,
            b'H' => FeMessage::Flush,
            b'd' => FeMessage::CopyData(body),
            b'c' => FeMessage::CopyDone,
            b'f' => FeMessage::CopyFail,
            b'X' => FeMessage::Terminate,
            tag => {
                return Err(ProtocolError::Protocol(format!(
                    "unknown message type: {}",
                    tag as char
                )))
            }
        };
        Ok(Some(message))
    }

    /// Serialize a frontend message (client side). Only the messages the
    /// replication frontend actually sends are supported.
    pub fn write(buf: &mut BytesMut, msg: &FeMessage) -> Result<(), ProtocolError> {
        match msg {
            FeMessage::Query(query) => {
                buf.put_u8(b'Q');
                write_body(buf, |buf| {
                    buf.put_slice(query);
                    buf.put_u8(0);
                });
            }
            FeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| buf.put_slice(data));
            }
            FeMessage::CopyDone => {
                buf.put_u8(b'c');
                write_body(buf, |_| {});
            }
            FeMessage::Terminate => {
                buf.put_u8(b'X');
                write_body(buf, |_| {});
            }
            other => {
                return Err(ProtocolError::BadMessage(format!(
                    "unsupported frontend message for serialization: {:?}",
                    other
                )))
            }
        }
        Ok(())
    }
}

/// Split one `tag + length + body` frame off `buf`, returning the tag and
/// the body (without the length word). `None` if not fully buffered yet.
pub fn parse_raw_message(buf: &mut BytesMut) -> Result<Option<(u8, Bytes)>, ProtocolError> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = (&buf[1..5]).get_u32() as usize;
    if len < 4 {
        return Err(ProtocolError::Protocol(format!(
            "invalid message length {} for tag {}",
            len, tag as char
        )));
    }
    if len - 4 > MAX_MESSAGE_LENGTH {
        return Err(ProtocolError::Protocol(format!(
            "message length {} for tag {} exceeds the limit",
            len, tag as char
        )));
    }

    let total = 1 + len;
    if buf.len() < total {
        return Ok(None);
    }
    let mut msg = buf.split_to(total).freeze();
    msg.advance(5);
    Ok(Some((tag, msg)))
}

fn get_cstr(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let pos = buf
        .iter()
        .position(|x| *x == 0)
        .ok_or_else(|| ProtocolError::Protocol("missing null terminator".to_owned()))?;
    let result = buf.split_to(pos);
    buf.advance(1); // drop the null
    Ok(result)
}

/// Backend message, the server-to-client direction.
#[derive(Debug)]
pub enum BeMessage<'a> {
    AuthenticationOk,
    BackendKeyData { pid: i32, cancel_key: i32 },
    CommandComplete(&'a [u8]),
    CopyBothResponse,
    CopyData(&'a [u8]),
    CopyDone,
    DataRow(&'a [Option<&'a [u8]>]),
    ErrorResponse(&'a str),
    KeepAlive(WalSndKeepAlive),
    ParameterStatus { name: &'a [u8], value: &'a [u8] },
    ReadyForQuery,
    RowDescription(&'a [RowDescriptor<'a>]),
    XLogData(XLogDataBody<'a>),
}

/// Single field description in RowDescription.
#[derive(Debug)]
pub struct RowDescriptor<'a> {
    pub name: &'a [u8],
    pub tableoid: i32,
    pub attnum: i16,
    pub typoid: i32,
    pub typlen: i16,
    pub typmod: i32,
    pub formatcode: i16,
}

impl Default for RowDescriptor<'_> {
    fn default() -> RowDescriptor<'static> {
        RowDescriptor {
            name: b"",
            tableoid: 0,
            attnum: 0,
            typoid: 0,
            typlen: 0,
            typmod: 0,
            formatcode: 0,
        }
    }
}

impl RowDescriptor<'_> {
    /// Convenience function to create a RowDescriptor message for a single text column
    pub fn text_col(name: &[u8]) -> RowDescriptor {
        RowDescriptor {
            name,
            tableoid: 0,
            attnum: 0,
            typoid: TEXT_OID,
            typlen: -1,
            typmod: 0,
            formatcode: 0,
        }
    }

    pub fn int4_col(name: &[u8]) -> RowDescriptor {
        RowDescriptor {
            name,
            tableoid: 0,
            attnum: 0,
            typoid: INT4_OID,
            typlen: 4,
            typmod: 0,
            formatcode: 0,
        }
    }
}

/// The 'w' CopyData payload: a chunk of WAL.
#[derive(Debug)]
pub struct XLogDataBody<'a> {
    pub wal_start: u64,
    pub wal_end: u64,
    pub timestamp: i64,
    pub data: &'a [u8],
}

/// The 'k' CopyData payload: sender keepalive.
#[derive(Debug)]
pub struct WalSndKeepAlive {
    pub wal_end: u64,
    pub timestamp: i64,
    pub request_reply: bool,
}

/// Call f() to write body of the message and prepend it with 4-byte len as
/// postgres requires.
fn write_body<F>(buf: &mut BytesMut, f: F)
where
    F: FnOnce(&mut BytesMut),
{
    let base = buf.len();
    buf.put_u32(0);

    f(buf);

    let size = buf.len() - base;
    (&mut buf[base..base + 4]).put_u32(size as u32);
}

/// Safe write of s into buf as cstring (String in the protocol).
fn write_cstr(s: impl AsRef<[u8]>, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let bytes = s.as_ref();
    if bytes.contains(&0) {
        return Err(ProtocolError::BadMessage(
            "string contains embedded null".to_owned(),
        ));
    }
    buf.put_slice(bytes);
    buf.put_u8(0);
    Ok(())
}

impl BeMessage<'_> {
    /// Serialize `message` to the given `buf`.
    pub fn write(buf: &mut BytesMut, message: &BeMessage) -> Result<(), ProtocolError> {
        match message {
            BeMessage::AuthenticationOk => {
                buf.put_u8(b'R');
                write_body(buf, |buf| {
                    buf.put_i32(0); // Specifies that the authentication was successful.
                });
            }

            BeMessage::BackendKeyData { pid, cancel_key } => {
                buf.put_u8(b'K');
                write_body(buf, |buf| {
                    buf.put_i32(*pid);
                    buf.put_i32(*cancel_key);
                });
            }

            BeMessage::CommandComplete(cmd) => {
                buf.put_u8(b'C');
                write_body(buf, |buf| {
                    buf.put_slice(cmd);
                    buf.put_u8(0);
                });
            }

            BeMessage::CopyBothResponse => {
                buf.put_u8(b'W');
                write_body(buf, |buf| {
                    // doesn't matter, used only for replication
                    buf.put_u8(0); // copy_is_binary
                    buf.put_i16(0); // numAttributes
                });
            }

            BeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| buf.put_slice(data));
            }

            BeMessage::CopyDone => {
                buf.put_u8(b'c');
                write_body(buf, |_| {});
            }

            BeMessage::DataRow(vals) => {
                buf.put_u8(b'D');
                write_body(buf, |buf| {
                    buf.put_u16(vals.len() as u16);
                    for val_opt in vals.iter() {
                        if let Some(val) = val_opt {
                            buf.put_u32(val.len() as u32);
                            buf.put_slice(val);
                        } else {
                            buf.put_i32(-1);
                        }
                    }
                });
            }

            BeMessage::ErrorResponse(error_msg) => {
                // 'E' signalizes ErrorResponse messages
                buf.put_u8(b'E');
                write_body(buf, |buf| {
                    buf.put_u8(b'S'); // severity
                    buf.put_slice(b"ERROR\0");

                    buf.put_u8(b'C'); // SQLSTATE error code
                    buf.put_slice(b"XX000\0"); // internal_error

                    buf.put_u8(b'M'); // the message
                    buf.put_slice(error_msg.as_bytes());
                    buf.put_u8(0);

                    buf.put_u8(0); // terminator
                });
            }

            BeMessage::KeepAlive(req) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_u8(b'k');
                    buf.put_u64(req.wal_end);
                    buf.put_i64(req.timestamp);
                    buf.put_u8(u8::from(req.request_reply));
                });
            }

            BeMessage::ParameterStatus { name, value } => {
                buf.put_u8(b'S');
                write_body(buf, |buf| {
                    buf.put_slice(name);
                    buf.put_u8(0);
                    buf.put_slice(value);
                    buf.put_u8(0);
                });
            }

            BeMessage::ReadyForQuery => {
                buf.put_u8(b'Z');
                write_body(buf, |buf| {
                    buf.put_u8(b'I'); // idle
                });
            }

            BeMessage::RowDescription(rows) => {
                buf.put_u8(b'T');
                let mut res = Ok(());
                write_body(buf, |buf| {
                    buf.put_i16(rows.len() as i16);
                    for row in rows.iter() {
                        res = write_cstr(row.name, buf);
                        if res.is_err() {
                            return;
                        }
                        buf.put_i32(row.tableoid);
                        buf.put_i16(row.attnum);
                        buf.put_i32(row.typoid);
                        buf.put_i16(row.typlen);
                        buf.put_i32(row.typmod);
                        buf.put_i16(row.formatcode);
                    }
                });
                res?;
            }

            BeMessage::XLogData(body) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_u8(b'w');
                    buf.put_u64(body.wal_start);
                    buf.put_u64(body.wal_end);
                    buf.put_i64(body.timestamp);
                    buf.put_slice(body.data);
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for FeStartupPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc: Cow<str> = match self {
            FeStartupPacket::SslRequest => "SslRequest".into(),
            FeStartupPacket::CancelRequest { .. } => "CancelRequest".into(),
            FeStartupPacket::StartupMessage {
                major_version,
                minor_version,
                ..
            } => format!("StartupMessage proto {}.{}", major_version, minor_version).into(),
        };
        write!(f, "{}", desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_startup(buf: &mut BytesMut, params: &[(&str, &str)]) {
        FeStartupPacket::write_startup_message(buf, params.iter().copied());
    }

    #[test]
    fn startup_packet_roundtrip() {
        let mut buf = BytesMut::new();
        push_startup(
            &mut buf,
            &[
                ("user", "replicator"),
                ("replication", "true"),
                ("application_name", "pg_default,spc_main"),
            ],
        );
        let packet = FeStartupPacket::parse(&mut buf).unwrap().unwrap();
        match packet {
            FeStartupPacket::StartupMessage { params, .. } => {
                assert_eq!(params.get("user"), Some("replicator"));
                assert_eq!(params.get("replication"), Some("true"));
                assert_eq!(params.get("application_name"), Some("pg_default,spc_main"));
                assert_eq!(params.get("database"), None);
            }
            other => panic!("unexpected packet {other}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn startup_packet_incomplete() {
        let mut buf = BytesMut::new();
        push_startup(&mut buf, &[("user", "replicator")]);
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(FeStartupPacket::parse(&mut partial).unwrap().is_none());
    }

    #[test]
    fn ssl_request_detected() {
        let mut buf = BytesMut::new();
        buf.put_u32(8);
        buf.put_u32(NEGOTIATE_SSL_CODE);
        let packet = FeStartupPacket::parse(&mut buf).unwrap().unwrap();
        assert!(matches!(packet, FeStartupPacket::SslRequest));
    }

    #[test]
    fn startup_packet_missing_terminator() {
        let mut buf = BytesMut::new();
        let body = b"user\0replicator\0"; // no list terminator
        buf.put_u32(4 + 4 + body.len() as u32);
        buf.put_u32(PG_PROTOCOL_VERSION);
        buf.put_slice(body);
        assert!(FeStartupPacket::parse(&mut buf).is_err());
    }

    #[test]
    fn query_message_roundtrip() {
        let mut buf = BytesMut::new();
        FeMessage::write(&mut buf, &FeMessage::Query("IDENTIFY_SYSTEM".into())).unwrap();
        match FeMessage::parse(&mut buf).unwrap().unwrap() {
            FeMessage::Query(q) => assert_eq!(&q[..], b"IDENTIFY_SYSTEM"),
            other => panic!("unexpected message {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn message_split_frame() {
        let mut full = BytesMut::new();
        FeMessage::write(&mut full, &FeMessage::CopyData(Bytes::from_static(b"abcdef")))
            .unwrap();
        // feed all but the last byte: not parseable yet
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(FeMessage::parse(&mut partial).unwrap().is_none());
        partial.put_u8(full[full.len() - 1]);
        match FeMessage::parse(&mut partial).unwrap().unwrap() {
            FeMessage::CopyData(data) => assert_eq!(&data[..], b"abcdef"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn be_message_length_backpatched() {
        use byteorder::{BigEndian, ByteOrder};
        let mut buf = BytesMut::new();
        BeMessage::write(
            &mut buf,
            &BeMessage::ParameterStatus {
                name: b"server_version",
                value: b"16.2",
            },
        )
        .unwrap();
        assert_eq!(buf[0], b'S');
        let len = BigEndian::read_u32(&buf[1..5]) as usize;
        assert_eq!(len + 1, buf.len());
    }

    #[test]
    fn xlog_data_layout() {
        use byteorder::{BigEndian, ByteOrder};
        let mut buf = BytesMut::new();
        BeMessage::write(
            &mut buf,
            &BeMessage::XLogData(XLogDataBody {
                wal_start: 0x0000000001500000,
                wal_end: 0x0000000001508000,
                timestamp: 42,
                data: b"wal bytes",
            }),
        )
        .unwrap();
        assert_eq!(buf[0], b'd');
        assert_eq!(buf[5], b'w');
        assert_eq!(BigEndian::read_u64(&buf[6..14]), 0x0000000001500000);
        assert_eq!(BigEndian::read_u64(&buf[14..22]), 0x0000000001508000);
        assert_eq!(BigEndian::read_i64(&buf[22..30]), 42);
        assert_eq!(&buf[30..], b"wal bytes");
    }
}
