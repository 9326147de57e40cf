//! CQL native-protocol frame codec.
//!
//! Covers the v3/v4 wire layout the proxy needs: the 9-byte frame header,
//! partial decoding of client requests (QUERY and PREPARE are parsed only as
//! far as the query string, EXECUTE only as far as the prepared id; the raw
//! frame is what gets forwarded), full encoding of the server replies the
//! proxy synthesizes (SUPPORTED, READY, RESULT, ERROR), and decoding of the
//! backend responses the control connection and pooled connections consume.
//!
//! Framing:
//!   [version u8] [flags u8] [stream i16 BE] [opcode u8] [length u32 BE] [body]
//!
//! Response frames carry the direction bit (0x80) in the version byte.

use std::io::{self, Read, Write};
use std::net::IpAddr;

use crate::error::{ProxyError, Result};

/// Highest protocol version the proxy speaks. Frames with a higher version
/// nibble are rejected per-frame with a protocol error.
pub const MAX_VERSION: u8 = 0x04;

/// Direction bit: set on server-to-client frames.
pub const DIRECTION_RESPONSE: u8 = 0x80;

/// Mask selecting the version nibble out of the version byte.
pub const VERSION_MASK: u8 = 0x7f;

/// Native-protocol cap on frame body size (256 MiB).
const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

pub mod opcode {
    pub const ERROR: u8 = 0x00;
    pub const STARTUP: u8 = 0x01;
    pub const READY: u8 = 0x02;
    pub const AUTHENTICATE: u8 = 0x03;
    pub const OPTIONS: u8 = 0x05;
    pub const SUPPORTED: u8 = 0x06;
    pub const QUERY: u8 = 0x07;
    pub const RESULT: u8 = 0x08;
    pub const PREPARE: u8 = 0x09;
    pub const EXECUTE: u8 = 0x0A;
    pub const REGISTER: u8 = 0x0B;
    pub const EVENT: u8 = 0x0C;
}

pub mod error_code {
    pub const SERVER_ERROR: i32 = 0x0000;
    pub const PROTOCOL_ERROR: i32 = 0x000A;
    pub const OVERLOADED: i32 = 0x1001;
    pub const INVALID: i32 = 0x2200;
}

mod result_kind {
    pub const VOID: i32 = 0x0001;
    pub const ROWS: i32 = 0x0002;
    pub const SET_KEYSPACE: i32 = 0x0003;
}

// ============================================================================
// Frame header and raw frame
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
    pub opcode: u8,
}

/// One frame with its body left opaque. This is the unit the proxy forwards
/// to backend sessions untouched.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: Header,
    pub body: Vec<u8>,
}

impl RawFrame {
    pub fn new(header: Header, body: Vec<u8>) -> Self {
        RawFrame { header, body }
    }

    /// Read one frame. Returns `Ok(None)` on a clean end-of-stream (no bytes
    /// read); a stream that ends mid-frame is an error.
    pub fn read_from(r: &mut impl Read) -> Result<Option<RawFrame>> {
        let mut header = [0u8; 9];
        let mut filled = 0;
        while filled < header.len() {
            match r.read(&mut header[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(None);
                    }
                    return Err(ProxyError::Frame("truncated frame header".to_string()));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
        if length > MAX_BODY_LEN {
            return Err(ProxyError::Frame(format!("frame body too large: {} bytes", length)));
        }

        let mut body = vec![0u8; length];
        r.read_exact(&mut body)?;

        Ok(Some(RawFrame {
            header: Header {
                version: header[0],
                flags: header[1],
                stream: i16::from_be_bytes([header[2], header[3]]),
                opcode: header[4],
            },
            body,
        }))
    }

    pub fn write_to(&self, w: &mut impl Write) -> Result<()> {
        let mut head = [0u8; 9];
        head[0] = self.header.version;
        head[1] = self.header.flags;
        head[2..4].copy_from_slice(&self.header.stream.to_be_bytes());
        head[4] = self.header.opcode;
        head[5..9].copy_from_slice(&(self.body.len() as u32).to_be_bytes());
        w.write_all(&head)?;
        w.write_all(&self.body)?;
        Ok(())
    }
}

// ============================================================================
// Primitive readers/writers
// ============================================================================

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Cursor { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ProxyError::Frame("truncated frame body".to_string()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String> {
        let n = self.u16()? as usize;
        utf8(self.take(n)?)
    }

    fn long_string(&mut self) -> Result<String> {
        let n = self.i32()?;
        if n < 0 {
            return Err(ProxyError::Frame("negative string length".to_string()));
        }
        utf8(self.take(n as usize)?)
    }

    fn string_list(&mut self) -> Result<Vec<String>> {
        let n = self.u16()? as usize;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.string()?);
        }
        Ok(out)
    }

    fn bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let n = self.i32()?;
        if n < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(n as usize)?.to_vec()))
    }

    fn short_bytes(&mut self) -> Result<Vec<u8>> {
        let n = self.u16()? as usize;
        Ok(self.take(n)?.to_vec())
    }
}

fn utf8(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ProxyError::Frame("invalid utf8 in frame".to_string()))
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_u16(out, s.len() as u16);
    out.extend_from_slice(s.as_bytes());
}

fn put_long_string(out: &mut Vec<u8>, s: &str) {
    put_i32(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, v: Option<&[u8]>) {
    match v {
        Some(v) => {
            put_i32(out, v.len() as i32);
            out.extend_from_slice(v);
        }
        None => put_i32(out, -1),
    }
}

fn put_short_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u16(out, v.len() as u16);
    out.extend_from_slice(v);
}

// ============================================================================
// Data types and column metadata
// ============================================================================

/// The subset of CQL data types the proxy encodes, plus enough structure to
/// decode whatever a backend puts in result metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Varchar,
    Int,
    Uuid,
    Inet,
    List(Box<DataType>),
    Set(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
    Custom(String),
    /// Parameterless type the proxy never synthesizes itself.
    Other(u16),
}

impl DataType {
    fn put(&self, out: &mut Vec<u8>) {
        match self {
            DataType::Custom(name) => {
                put_u16(out, 0x0000);
                put_string(out, name);
            }
            DataType::Int => put_u16(out, 0x0009),
            DataType::Uuid => put_u16(out, 0x000C),
            DataType::Varchar => put_u16(out, 0x000D),
            DataType::Inet => put_u16(out, 0x0010),
            DataType::List(elem) => {
                put_u16(out, 0x0020);
                elem.put(out);
            }
            DataType::Set(elem) => {
                put_u16(out, 0x0022);
                elem.put(out);
            }
            DataType::Map(k, v) => {
                put_u16(out, 0x0021);
                k.put(out);
                v.put(out);
            }
            DataType::Other(id) => put_u16(out, *id),
        }
    }

    fn read(c: &mut Cursor) -> Result<DataType> {
        let id = c.u16()?;
        Ok(match id {
            0x0000 => DataType::Custom(c.string()?),
            0x0009 => DataType::Int,
            0x000C => DataType::Uuid,
            0x000D => DataType::Varchar,
            0x0010 => DataType::Inet,
            0x0020 => DataType::List(Box::new(DataType::read(c)?)),
            0x0021 => DataType::Map(Box::new(DataType::read(c)?), Box::new(DataType::read(c)?)),
            0x0022 => DataType::Set(Box::new(DataType::read(c)?)),
            0x0030 | 0x0031 => {
                return Err(ProxyError::Frame(format!(
                    "unsupported result column type 0x{:04x}",
                    id
                )))
            }
            other => DataType::Other(other),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub data_type: DataType,
}

impl ColumnSpec {
    pub fn new(keyspace: &str, table: &str, name: &str, data_type: DataType) -> Self {
        ColumnSpec {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            name: name.to_string(),
            data_type,
        }
    }
}

/// One result row: per-column `[bytes]` values, `None` meaning null.
pub type Row = Vec<Option<Vec<u8>>>;

// ============================================================================
// Value encodings
// ============================================================================

pub fn encode_varchar(s: &str) -> Vec<u8> {
    s.as_bytes().to_vec()
}

pub fn encode_int(v: i32) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

pub fn encode_uuid(v: [u8; 16]) -> Vec<u8> {
    v.to_vec()
}

/// The `inet` column value carries only the address bytes, no port.
pub fn encode_inet(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// `list<varchar>` value encoding (v3+ layout: int count, then per-element
/// `[bytes]`).
pub fn encode_string_list(items: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    put_i32(&mut out, items.len() as i32);
    for item in items {
        put_bytes(&mut out, Some(item.as_bytes()));
    }
    out
}

// ============================================================================
// Client message decoding (server side)
// ============================================================================

/// A client request, decoded only as far as the proxy needs to dispatch it.
#[derive(Debug)]
pub enum ClientMessage {
    Options,
    Startup,
    Register,
    Prepare { query: String },
    Execute { id: Vec<u8> },
    Query { query: String },
    Other(u8),
}

pub fn decode_client_message(raw: &RawFrame) -> Result<ClientMessage> {
    let mut c = Cursor::new(&raw.body);
    Ok(match raw.header.opcode {
        opcode::OPTIONS => ClientMessage::Options,
        opcode::STARTUP => ClientMessage::Startup,
        opcode::REGISTER => ClientMessage::Register,
        opcode::PREPARE => ClientMessage::Prepare {
            query: c.long_string()?,
        },
        opcode::EXECUTE => ClientMessage::Execute {
            id: c.short_bytes()?,
        },
        opcode::QUERY => ClientMessage::Query {
            query: c.long_string()?,
        },
        other => ClientMessage::Other(other),
    })
}

// ============================================================================
// Response decoding (client side: control connection, pooled connections,
// and test clients)
// ============================================================================

#[derive(Debug)]
pub enum Response {
    Ready,
    Authenticate(String),
    Supported(Vec<(String, Vec<String>)>),
    Error { code: i32, message: String },
    Result(ResultBody),
    Other(u8),
}

#[derive(Debug)]
pub enum ResultBody {
    Void,
    SetKeyspace(String),
    Rows(Rows),
    Other(i32),
}

#[derive(Debug)]
pub struct Rows {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Row>,
}

impl Rows {
    /// Find a column's value in the first row by name.
    pub fn first_row_value(&self, name: &str) -> Option<&[u8]> {
        let idx = self.columns.iter().position(|c| c.name == name)?;
        self.rows.first()?.get(idx)?.as_deref()
    }
}

pub fn decode_response(raw: &RawFrame) -> Result<Response> {
    let mut c = Cursor::new(&raw.body);
    Ok(match raw.header.opcode {
        opcode::READY => Response::Ready,
        opcode::AUTHENTICATE => Response::Authenticate(c.string()?),
        opcode::SUPPORTED => {
            let n = c.u16()? as usize;
            let mut options = Vec::with_capacity(n);
            for _ in 0..n {
                let key = c.string()?;
                let values = c.string_list()?;
                options.push((key, values));
            }
            Response::Supported(options)
        }
        opcode::ERROR => Response::Error {
            code: c.i32()?,
            message: c.string()?,
        },
        opcode::RESULT => {
            let kind = c.i32()?;
            Response::Result(match kind {
                result_kind::VOID => ResultBody::Void,
                result_kind::SET_KEYSPACE => ResultBody::SetKeyspace(c.string()?),
                result_kind::ROWS => ResultBody::Rows(decode_rows(&mut c)?),
                other => ResultBody::Other(other),
            })
        }
        other => Response::Other(other),
    })
}

const ROWS_FLAG_GLOBAL_TABLES_SPEC: i32 = 0x0001;
const ROWS_FLAG_HAS_MORE_PAGES: i32 = 0x0002;
const ROWS_FLAG_NO_METADATA: i32 = 0x0004;

fn decode_rows(c: &mut Cursor) -> Result<Rows> {
    let flags = c.i32()?;
    let column_count = c.i32()?;
    if column_count < 0 {
        return Err(ProxyError::Frame("negative column count".to_string()));
    }
    if flags & ROWS_FLAG_HAS_MORE_PAGES != 0 {
        let _paging_state = c.bytes()?;
    }
    if flags & ROWS_FLAG_NO_METADATA != 0 {
        return Err(ProxyError::Frame("rows result without metadata".to_string()));
    }

    let global = if flags & ROWS_FLAG_GLOBAL_TABLES_SPEC != 0 {
        Some((c.string()?, c.string()?))
    } else {
        None
    };

    // Counts come off the wire; cap preallocation by what the remaining
    // body could actually hold so a corrupt length cannot demand gigabytes.
    let mut columns = Vec::with_capacity((column_count as usize).min(c.remaining() / 2));
    for _ in 0..column_count {
        let (keyspace, table) = match &global {
            Some((ks, table)) => (ks.clone(), table.clone()),
            None => (c.string()?, c.string()?),
        };
        let name = c.string()?;
        let data_type = DataType::read(c)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            data_type,
        });
    }

    let row_count = c.i32()?;
    if row_count < 0 {
        return Err(ProxyError::Frame("negative row count".to_string()));
    }
    // Each row carries at least a 4-byte length per column.
    let per_row = 4 * columns.len().max(1);
    let mut rows = Vec::with_capacity((row_count as usize).min(c.remaining() / per_row));
    for _ in 0..row_count {
        let mut row = Vec::with_capacity(columns.len());
        for _ in 0..columns.len() {
            row.push(c.bytes()?);
        }
        rows.push(row);
    }

    Ok(Rows { columns, rows })
}

// ============================================================================
// Response encoding (server side)
// ============================================================================

fn response_frame(version: u8, stream: i16, op: u8, body: Vec<u8>) -> RawFrame {
    RawFrame {
        header: Header {
            version: (version & VERSION_MASK) | DIRECTION_RESPONSE,
            flags: 0,
            stream,
            opcode: op,
        },
        body,
    }
}

pub fn ready_frame(version: u8, stream: i16) -> RawFrame {
    response_frame(version, stream, opcode::READY, Vec::new())
}

pub fn supported_frame(version: u8, stream: i16, options: &[(&str, &[&str])]) -> RawFrame {
    let mut body = Vec::new();
    put_u16(&mut body, options.len() as u16);
    for (key, values) in options {
        put_string(&mut body, key);
        put_u16(&mut body, values.len() as u16);
        for v in *values {
            put_string(&mut body, v);
        }
    }
    response_frame(version, stream, opcode::SUPPORTED, body)
}

pub fn error_frame(version: u8, stream: i16, code: i32, message: &str) -> RawFrame {
    let mut body = Vec::new();
    put_i32(&mut body, code);
    put_string(&mut body, message);
    response_frame(version, stream, opcode::ERROR, body)
}

pub fn void_result_frame(version: u8, stream: i16) -> RawFrame {
    let mut body = Vec::new();
    put_i32(&mut body, result_kind::VOID);
    response_frame(version, stream, opcode::RESULT, body)
}

pub fn rows_result_frame(version: u8, stream: i16, columns: &[ColumnSpec], rows: &[Row]) -> RawFrame {
    let mut body = Vec::new();
    put_i32(&mut body, result_kind::ROWS);
    // Per-column table spec; the proxy mixes synthesized column metadata so
    // the global-spec shortcut is not used.
    put_i32(&mut body, 0);
    put_i32(&mut body, columns.len() as i32);
    for col in columns {
        put_string(&mut body, &col.keyspace);
        put_string(&mut body, &col.table);
        put_string(&mut body, &col.name);
        col.data_type.put(&mut body);
    }
    put_i32(&mut body, rows.len() as i32);
    for row in rows {
        for value in row {
            put_bytes(&mut body, value.as_deref());
        }
    }
    response_frame(version, stream, opcode::RESULT, body)
}

// ============================================================================
// Request encoding (client side)
// ============================================================================

fn request_frame(version: u8, stream: i16, op: u8, body: Vec<u8>) -> RawFrame {
    RawFrame {
        header: Header {
            version: version & VERSION_MASK,
            flags: 0,
            stream,
            opcode: op,
        },
        body,
    }
}

pub fn startup_frame(version: u8, stream: i16) -> RawFrame {
    let mut body = Vec::new();
    put_u16(&mut body, 1);
    put_string(&mut body, "CQL_VERSION");
    put_string(&mut body, "3.0.0");
    request_frame(version, stream, opcode::STARTUP, body)
}

pub fn options_frame(version: u8, stream: i16) -> RawFrame {
    request_frame(version, stream, opcode::OPTIONS, Vec::new())
}

pub fn register_frame(version: u8, stream: i16, events: &[&str]) -> RawFrame {
    let mut body = Vec::new();
    put_u16(&mut body, events.len() as u16);
    for event in events {
        put_string(&mut body, event);
    }
    request_frame(version, stream, opcode::REGISTER, body)
}

/// QUERY with consistency ONE and no optional parameters.
pub fn query_frame(version: u8, stream: i16, query: &str) -> RawFrame {
    let mut body = Vec::new();
    put_long_string(&mut body, query);
    put_u16(&mut body, 0x0001); // consistency ONE
    body.push(0x00); // no flags
    request_frame(version, stream, opcode::QUERY, body)
}

pub fn prepare_frame(version: u8, stream: i16, query: &str) -> RawFrame {
    let mut body = Vec::new();
    put_long_string(&mut body, query);
    request_frame(version, stream, opcode::PREPARE, body)
}

pub fn execute_frame(version: u8, stream: i16, id: &[u8]) -> RawFrame {
    let mut body = Vec::new();
    put_short_bytes(&mut body, id);
    put_u16(&mut body, 0x0001); // consistency ONE
    body.push(0x00); // no flags
    request_frame(version, stream, opcode::EXECUTE, body)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod frame_tests {
    use super::*;
    use std::io::Cursor as IoCursor;
    use std::net::Ipv4Addr;

    #[test]
    fn test_raw_frame_roundtrip() {
        let frame = query_frame(4, 17, "SELECT * FROM system.local");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();

        let decoded = RawFrame::read_from(&mut IoCursor::new(buf)).unwrap().unwrap();
        assert_eq!(decoded.header, frame.header);
        assert_eq!(decoded.body, frame.body);
        assert_eq!(decoded.header.stream, 17);
        assert_eq!(decoded.header.opcode, opcode::QUERY);
    }

    #[test]
    fn test_read_clean_eof_returns_none() {
        let empty: Vec<u8> = Vec::new();
        let got = RawFrame::read_from(&mut IoCursor::new(empty)).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_read_truncated_header_is_error() {
        let buf = vec![0x04, 0x00, 0x00]; // 3 of 9 header bytes
        let err = RawFrame::read_from(&mut IoCursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProxyError::Frame(_)));
    }

    #[test]
    fn test_read_truncated_body_is_error() {
        let frame = query_frame(4, 1, "SELECT 1");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        buf.truncate(buf.len() - 2);
        let err = RawFrame::read_from(&mut IoCursor::new(buf)).unwrap_err();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn test_decode_query_partial() {
        let frame = query_frame(4, 3, "USE ks1");
        match decode_client_message(&frame).unwrap() {
            ClientMessage::Query { query } => assert_eq!(query, "USE ks1"),
            other => panic!("expected Query, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_execute_partial() {
        let frame = execute_frame(4, 5, &[0xDE, 0xAD]);
        match decode_client_message(&frame).unwrap() {
            ClientMessage::Execute { id } => assert_eq!(id, vec![0xDE, 0xAD]),
            other => panic!("expected Execute, got {:?}", other),
        }
    }

    #[test]
    fn test_supported_roundtrip() {
        let frame = supported_frame(4, 9, &[("CQL_VERSION", &["3.0.0"]), ("COMPRESSION", &[])]);
        assert_eq!(frame.header.version, 0x84);
        match decode_response(&frame).unwrap() {
            Response::Supported(options) => {
                assert_eq!(options.len(), 2);
                assert_eq!(options[0].0, "CQL_VERSION");
                assert_eq!(options[0].1, vec!["3.0.0".to_string()]);
                assert!(options[1].1.is_empty());
            }
            other => panic!("expected Supported, got {:?}", other),
        }
    }

    #[test]
    fn test_error_roundtrip() {
        let frame = error_frame(3, -1, error_code::OVERLOADED, "Proxy: Too many requests");
        match decode_response(&frame).unwrap() {
            Response::Error { code, message } => {
                assert_eq!(code, error_code::OVERLOADED);
                assert_eq!(message, "Proxy: Too many requests");
            }
            other => panic!("expected Error, got {:?}", other),
        }
    }

    #[test]
    fn test_rows_result_roundtrip() {
        let columns = vec![
            ColumnSpec::new("system", "local", "key", DataType::Varchar),
            ColumnSpec::new("system", "local", "rpc_address", DataType::Inet),
            ColumnSpec::new("system", "local", "tokens", DataType::List(Box::new(DataType::Varchar))),
        ];
        let row: Row = vec![
            Some(encode_varchar("local")),
            Some(encode_inet(IpAddr::V4(Ipv4Addr::LOCALHOST))),
            None,
        ];
        let frame = rows_result_frame(4, 21, &columns, &[row.clone()]);

        match decode_response(&frame).unwrap() {
            Response::Result(ResultBody::Rows(rows)) => {
                assert_eq!(rows.columns, columns);
                assert_eq!(rows.rows, vec![row]);
                assert_eq!(rows.first_row_value("key"), Some(&b"local"[..]));
                assert_eq!(rows.first_row_value("tokens"), None);
            }
            other => panic!("expected Rows, got {:?}", other),
        }
    }

    #[test]
    fn test_rows_result_with_lying_counts_is_rejected() {
        // A rows body whose row count promises far more data than the body
        // holds must fail as truncated, not allocate for the claimed count.
        let mut body = Vec::new();
        put_i32(&mut body, result_kind::ROWS);
        put_i32(&mut body, 0); // flags
        put_i32(&mut body, 1); // column count
        put_string(&mut body, "system");
        put_string(&mut body, "local");
        put_string(&mut body, "key");
        DataType::Varchar.put(&mut body);
        put_i32(&mut body, i32::MAX); // row count, with no row data following
        let raw = RawFrame::new(
            Header {
                version: 0x84,
                flags: 0,
                stream: 1,
                opcode: opcode::RESULT,
            },
            body,
        );
        let err = decode_response(&raw).unwrap_err();
        assert!(matches!(err, ProxyError::Frame(_)));

        // Same for a column count the body cannot hold.
        let mut body = Vec::new();
        put_i32(&mut body, result_kind::ROWS);
        put_i32(&mut body, 0);
        put_i32(&mut body, i32::MAX);
        let raw = RawFrame::new(
            Header {
                version: 0x84,
                flags: 0,
                stream: 2,
                opcode: opcode::RESULT,
            },
            body,
        );
        assert!(decode_response(&raw).is_err());
    }

    #[test]
    fn test_void_result() {
        let frame = void_result_frame(4, 2);
        assert!(matches!(
            decode_response(&frame).unwrap(),
            Response::Result(ResultBody::Void)
        ));
    }

    #[test]
    fn test_value_encodings() {
        assert_eq!(encode_int(0), vec![0, 0, 0, 0]);
        assert_eq!(encode_int(1), vec![0, 0, 0, 1]);
        assert_eq!(encode_varchar("dc1"), b"dc1".to_vec());
        assert_eq!(
            encode_inet(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))),
            vec![127, 0, 0, 1]
        );

        // list<varchar> ["0"]: count 1, then one 1-byte element
        assert_eq!(
            encode_string_list(&["0"]),
            vec![0, 0, 0, 1, 0, 0, 0, 1, b'0']
        );
    }

    #[test]
    fn test_startup_body_is_string_map() {
        let frame = startup_frame(4, 0);
        let mut c = Cursor::new(&frame.body);
        assert_eq!(c.u16().unwrap(), 1);
        assert_eq!(c.string().unwrap(), "CQL_VERSION");
        assert_eq!(c.string().unwrap(), "3.0.0");
    }
}
