// Event records handed from share validation to the flusher.
//
// Wire layout, little-endian throughout:
//   RecordHeader (24 bytes)
//   u16 worker_len, worker bytes
//   u16 field_count
//   per field: u8 name_len, name bytes, u8 tag, value
// Values: u64/i64/f64 are 8 bytes, bool is 1 byte, str is u16 len + bytes.

use crate::error::{DecodeError, EncodeError};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current record layout version.
pub const RECORD_VERSION: u16 = 1;

/// Fixed prefix of every record. `#[repr(C)]` so the in-memory layout and
/// the wire offsets agree.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordHeader {
    /// Length of the whole record including this header.
    pub total_len: u32,
    pub version: u16,
    pub kind: u16,
    pub timestamp_ns: u64,
    pub connection_id: u64,
}

pub const HEADER_LEN: usize = std::mem::size_of::<RecordHeader>();

impl RecordHeader {
    fn write(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.total_len.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.kind.to_le_bytes());
        out[8..16].copy_from_slice(&self.timestamp_ns.to_le_bytes());
        out[16..24].copy_from_slice(&self.connection_id.to_le_bytes());
    }

    /// Parse the header at the start of `buf`.
    pub fn read(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_LEN {
            return Err(DecodeError::Truncated(buf.len()));
        }
        Ok(Self {
            total_len: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            version: u16::from_le_bytes([buf[4], buf[5]]),
            kind: u16::from_le_bytes([buf[6], buf[7]]),
            timestamp_ns: u64::from_le_bytes(le8(&buf[8..16])),
            connection_id: u64::from_le_bytes(le8(&buf[16..24])),
        })
    }
}

fn le8(b: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[..8]);
    out
}

/// What happened on the connection.
#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    ShareAccepted = 1,
    ShareRejected = 2,
    Connected = 3,
    Disconnected = 4,
    Authorized = 5,
    BlockFound = 6,
    DifficultyChanged = 7,
}

impl EventKind {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            1 => EventKind::ShareAccepted,
            2 => EventKind::ShareRejected,
            3 => EventKind::Connected,
            4 => EventKind::Disconnected,
            5 => EventKind::Authorized,
            6 => EventKind::BlockFound,
            7 => EventKind::DifficultyChanged,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ShareAccepted => "share_accepted",
            EventKind::ShareRejected => "share_rejected",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Authorized => "authorized",
            EventKind::BlockFound => "block_found",
            EventKind::DifficultyChanged => "difficulty_changed",
        }
    }
}

const TAG_U64: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_F64: u8 = 3;
const TAG_BOOL: u8 = 4;
const TAG_STR: u8 = 5;

/// A borrowed field value. Nothing here owns heap memory, so building an
/// event on the hot path costs no allocation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum FieldValue<'a> {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(&'a str),
}

impl FieldValue<'_> {
    fn encoded_len(&self) -> usize {
        match self {
            FieldValue::U64(_) | FieldValue::I64(_) | FieldValue::F64(_) => 8,
            FieldValue::Bool(_) => 1,
            FieldValue::Str(s) => 2 + s.len(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Field<'a> {
    pub name: &'a str,
    pub value: FieldValue<'a>,
}

impl<'a> Field<'a> {
    pub const fn new(name: &'a str, value: FieldValue<'a>) -> Self {
        Self { name, value }
    }
}

/// A fully described event, ready to be encoded into a pool item.
#[derive(Copy, Clone, Debug)]
pub struct Event<'a> {
    pub kind: EventKind,
    pub timestamp_ns: u64,
    pub connection_id: u64,
    pub worker: &'a str,
    pub fields: &'a [Field<'a>],
}

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

impl<'a> Event<'a> {
    /// Event stamped with the current wall clock and no fields.
    pub fn new(kind: EventKind, connection_id: u64, worker: &'a str) -> Self {
        Self {
            kind,
            timestamp_ns: now_ns(),
            connection_id,
            worker,
            fields: &[],
        }
    }

    pub fn with_fields(mut self, fields: &'a [Field<'a>]) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_timestamp(mut self, timestamp_ns: u64) -> Self {
        self.timestamp_ns = timestamp_ns;
        self
    }

    /// Exact size of the encoded record.
    pub fn encoded_len(&self) -> usize {
        let fields: usize = self
            .fields
            .iter()
            .map(|f| 1 + f.name.len() + 1 + f.value.encoded_len())
            .sum();
        HEADER_LEN + 2 + self.worker.len() + 2 + fields
    }

    /// Encode into `out`, returning the number of bytes written.
    pub fn encode_into(&self, out: &mut [u8]) -> Result<usize, EncodeError> {
        if self.worker.len() > u16::MAX as usize {
            return Err(EncodeError::StringTooLong);
        }
        if self.fields.len() > u16::MAX as usize {
            return Err(EncodeError::TooManyFields);
        }
        let needed = self.encoded_len();
        if needed > out.len() || needed > u32::MAX as usize {
            return Err(EncodeError::TooLarge {
                needed,
                available: out.len(),
            });
        }
        for f in self.fields {
            if f.name.len() > u8::MAX as usize {
                return Err(EncodeError::FieldName);
            }
            if let FieldValue::Str(s) = f.value {
                if s.len() > u16::MAX as usize {
                    return Err(EncodeError::StringTooLong);
                }
            }
        }

        RecordHeader {
            total_len: needed as u32,
            version: RECORD_VERSION,
            kind: self.kind as u16,
            timestamp_ns: self.timestamp_ns,
            connection_id: self.connection_id,
        }
        .write(out);

        let mut w = Writer {
            buf: out,
            pos: HEADER_LEN,
        };
        w.put_str16(self.worker);
        w.put(&(self.fields.len() as u16).to_le_bytes());
        for f in self.fields {
            w.put(&[f.name.len() as u8]);
            w.put(f.name.as_bytes());
            match f.value {
                FieldValue::U64(v) => {
                    w.put(&[TAG_U64]);
                    w.put(&v.to_le_bytes());
                }
                FieldValue::I64(v) => {
                    w.put(&[TAG_I64]);
                    w.put(&v.to_le_bytes());
                }
                FieldValue::F64(v) => {
                    w.put(&[TAG_F64]);
                    w.put(&v.to_le_bytes());
                }
                FieldValue::Bool(v) => {
                    w.put(&[TAG_BOOL]);
                    w.put(&[v as u8]);
                }
                FieldValue::Str(s) => {
                    w.put(&[TAG_STR]);
                    w.put_str16(s);
                }
            }
        }
        debug_assert_eq!(w.pos, needed);
        Ok(needed)
    }
}

/// Bounds were checked against `encoded_len` before any write.
struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl Writer<'_> {
    #[inline]
    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    #[inline]
    fn put_str16(&mut self, s: &str) {
        self.put(&(s.len() as u16).to_le_bytes());
        self.put(s.as_bytes());
    }
}

/// Owned field value produced by the decoder.
#[derive(Clone, Debug, PartialEq)]
pub enum OwnedValue {
    U64(u64),
    I64(i64),
    F64(f64),
    Bool(bool),
    Str(String),
}

/// A record read back from a sink.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedEvent {
    pub kind: EventKind,
    pub timestamp_ns: u64,
    pub connection_id: u64,
    pub worker: String,
    pub fields: Vec<(String, OwnedValue)>,
}

impl DecodedEvent {
    pub fn field(&self, name: &str) -> Option<&OwnedValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Decode one complete record. `buf` must hold exactly the record.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let header = RecordHeader::read(buf)?;
        if header.version != RECORD_VERSION {
            return Err(DecodeError::Version(header.version));
        }
        if header.total_len as usize != buf.len() {
            return Err(DecodeError::Length {
                declared: header.total_len as usize,
                actual: buf.len(),
            });
        }
        let kind = EventKind::from_u16(header.kind).ok_or(DecodeError::Kind(header.kind))?;

        let mut r = Reader {
            buf,
            pos: HEADER_LEN,
        };
        let worker = r.str16()?;
        let count = r.u16()?;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name_len = r.take(1)?[0] as usize;
            let name = r.utf8(name_len)?;
            let tag = r.take(1)?[0];
            let value = match tag {
                TAG_U64 => OwnedValue::U64(u64::from_le_bytes(le8(r.take(8)?))),
                TAG_I64 => OwnedValue::I64(i64::from_le_bytes(le8(r.take(8)?))),
                TAG_F64 => OwnedValue::F64(f64::from_le_bytes(le8(r.take(8)?))),
                TAG_BOOL => OwnedValue::Bool(r.take(1)?[0] != 0),
                TAG_STR => OwnedValue::Str(r.str16()?),
                other => return Err(DecodeError::Tag(other)),
            };
            fields.push((name, value));
        }
        if r.pos != buf.len() {
            return Err(DecodeError::Length {
                declared: buf.len(),
                actual: r.pos,
            });
        }

        Ok(Self {
            kind,
            timestamp_ns: header.timestamp_ns,
            connection_id: header.connection_id,
            worker,
            fields,
        })
    }
}

struct Reader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> Reader<'b> {
    fn take(&mut self, n: usize) -> Result<&'b [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated(self.pos));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn utf8(&mut self, n: usize) -> Result<String, DecodeError> {
        let b = self.take(n)?;
        std::str::from_utf8(b)
            .map(str::to_owned)
            .map_err(|_| DecodeError::Utf8)
    }

    fn str16(&mut self) -> Result<String, DecodeError> {
        let n = self.u16()? as usize;
        self.utf8(n)
    }
}

/// Split a byte stream of back-to-back records, as written by
/// `WriterSink`, into individual records.
pub fn split_records(mut stream: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while !stream.is_empty() {
        let header = RecordHeader::read(stream).map_err(|_| DecodeError::Truncated(offset))?;
        let len = header.total_len as usize;
        if len < HEADER_LEN || len > stream.len() {
            return Err(DecodeError::Truncated(offset));
        }
        out.push(&stream[..len]);
        stream = &stream[len..];
        offset += len;
    }
    Ok(out)
}
