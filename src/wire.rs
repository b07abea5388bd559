//! DNS wire-format codec: header, question section and answer records.
//!
//! ```text
//!                                 1  1  1  1  1  1
//!   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                      ID                       |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    QDCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ANCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    NSCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! |                    ARCOUNT                    |
//! +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
//! ```

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

/// QR=1, RD=1, RA=1, RCODE=0: the standard "response, no error" header.
pub const FLAGS_RESPONSE: u16 = 0x8180;
pub const RCODE_MASK: u16 = 0x000F;

/// Compression pointers may chain; anything deeper than this is hostile.
const MAX_POINTER_HOPS: usize = 8;
/// A 14-bit pointer cannot reference offsets beyond this.
const MAX_POINTER_OFFSET: usize = 0x3FFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: {0} bytes, need at least {HEADER_LEN}")]
    TooShort(usize),
    #[error("packet truncated mid-field")]
    Truncated,
    #[error("compression pointer to invalid offset {0}")]
    BadPointer(usize),
    #[error("compression pointer chain exceeds {MAX_POINTER_HOPS} hops")]
    PointerLoop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    /// Unparsed payload, re-encoded verbatim when relaying upstream answers.
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: RData,
}

/// A DNS message. Authority and additional sections are counted but never
/// populated by this server; only their counts are carried through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Message {
    pub fn rcode(&self) -> u16 {
        self.flags & RCODE_MASK
    }
}

/// Serialize a message. QDCOUNT/ANCOUNT are taken from the section lengths,
/// never from stored counts, so they cannot disagree with the sections.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);

    buf.put_u16(msg.id);
    buf.put_u16(msg.flags);
    buf.put_u16(msg.questions.len() as u16);
    buf.put_u16(msg.answers.len() as u16);
    buf.put_u16(msg.authority_count);
    buf.put_u16(msg.additional_count);

    // Offsets of names already written, so later owners compress against
    // the real location instead of assuming everything sits at byte 12.
    let mut name_offsets: HashMap<String, u16> = HashMap::new();

    for q in &msg.questions {
        put_name(&mut buf, &q.name, &mut name_offsets);
        buf.put_u16(q.qtype);
        buf.put_u16(q.qclass);
    }

    for rr in &msg.answers {
        put_name(&mut buf, &rr.name, &mut name_offsets);
        buf.put_u16(rr.rtype);
        buf.put_u16(rr.rclass);
        buf.put_u32(rr.ttl);
        match &rr.rdata {
            RData::A(addr) => {
                buf.put_u16(4);
                buf.put_slice(&addr.octets());
            }
            RData::Raw(data) => {
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
        }
    }

    buf.to_vec()
}

fn put_name(buf: &mut BytesMut, name: &str, offsets: &mut HashMap<String, u16>) {
    if !name.is_empty() {
        let key = name.to_ascii_lowercase();
        if let Some(&off) = offsets.get(&key) {
            buf.put_u16(0xC000 | off);
            return;
        }
        if buf.len() <= MAX_POINTER_OFFSET {
            offsets.insert(key, buf.len() as u16);
        }
        for label in name.split('.').filter(|l| !l.is_empty()) {
            buf.put_u8(label.len() as u8);
            buf.put_slice(label.as_bytes());
        }
    }
    buf.put_u8(0);
}

/// Parse a message. Section parsing is best-effort: if the declared counts
/// exceed what the buffer actually holds, the entries parsed so far are
/// returned rather than an error. Only a header under 12 bytes fails.
pub fn decode(data: &[u8]) -> Result<Message, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }

    let id = read_u16(data, 0);
    let flags = read_u16(data, 2);
    let qdcount = read_u16(data, 4);
    let ancount = read_u16(data, 6);
    let nscount = read_u16(data, 8);
    let arcount = read_u16(data, 10);

    let mut offset = HEADER_LEN;

    let mut questions = Vec::new();
    for _ in 0..qdcount {
        match decode_question(data, offset) {
            Ok((q, next)) => {
                questions.push(q);
                offset = next;
            }
            Err(_) => break,
        }
    }

    let mut answers = Vec::new();
    for _ in 0..ancount {
        match decode_record(data, offset) {
            Ok((rr, next)) => {
                answers.push(rr);
                offset = next;
            }
            Err(_) => break,
        }
    }

    Ok(Message {
        id,
        flags,
        questions,
        answers,
        authority_count: nscount,
        additional_count: arcount,
    })
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    ((data[offset] as u16) << 8) | (data[offset + 1] as u16)
}

fn decode_question(data: &[u8], offset: usize) -> Result<(Question, usize), DecodeError> {
    let (name, offset) = decode_name(data, offset)?;
    if offset + 4 > data.len() {
        return Err(DecodeError::Truncated);
    }
    let qtype = read_u16(data, offset);
    let qclass = read_u16(data, offset + 2);
    Ok((
        Question {
            name,
            qtype,
            qclass,
        },
        offset + 4,
    ))
}

fn decode_record(data: &[u8], offset: usize) -> Result<(ResourceRecord, usize), DecodeError> {
    let (name, offset) = decode_name(data, offset)?;
    if offset + 10 > data.len() {
        return Err(DecodeError::Truncated);
    }
    let rtype = read_u16(data, offset);
    let rclass = read_u16(data, offset + 2);
    let ttl = ((read_u16(data, offset + 4) as u32) << 16) | read_u16(data, offset + 6) as u32;
    let rdlen = read_u16(data, offset + 8) as usize;
    let rdata_start = offset + 10;
    if rdata_start + rdlen > data.len() {
        return Err(DecodeError::Truncated);
    }
    let raw = &data[rdata_start..rdata_start + rdlen];

    let rdata = if rtype == TYPE_A && rclass == CLASS_IN && rdlen == 4 {
        RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    } else {
        RData::Raw(raw.to_vec())
    };

    Ok((
        ResourceRecord {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        },
        rdata_start + rdlen,
    ))
}

/// Read a possibly-compressed name starting at `start`. Returns the dotted
/// string and the offset just past the name in the original byte stream.
///
/// Pointer chains are capped at `MAX_POINTER_HOPS`, so decoding terminates
/// for any input; a pointer at or past its own position is rejected outright.
fn decode_name(data: &[u8], start: usize) -> Result<(String, usize), DecodeError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos).ok_or(DecodeError::Truncated)? as usize;
        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1).ok_or(DecodeError::Truncated)? as usize;
            let target = ((len & 0x3F) << 8) | low;
            if resume.is_none() {
                resume = Some(pos + 2);
            }
            if target >= pos {
                return Err(DecodeError::BadPointer(target));
            }
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DecodeError::PointerLoop);
            }
            pos = target;
        } else if len == 0 {
            pos += 1;
            break;
        } else {
            let end = pos + 1 + len;
            if end > data.len() {
                return Err(DecodeError::Truncated);
            }
            labels.push(String::from_utf8_lossy(&data[pos + 1..end]).into_owned());
            pos = end;
        }
    }

    Ok((labels.join("."), resume.unwrap_or(pos)))
}
