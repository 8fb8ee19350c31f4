//! DNS wire codec, RFC 1035 section 4 plus RFC 6891 OPT parsing.
//!
//! Names are kept in both forms: the parsed dotted string and the original
//! wire bytes. Responses replay the stored wire bytes verbatim; the codec
//! never synthesizes new compression pointers. Synthesized answers
//! back-reference the question at offset 12 with the `0xC00C` pointer.

use std::collections::HashSet;
use std::fmt;

use crate::error::{Error, Result};

/// Pointer to the question name in a standard single-question message.
pub const COMPRESSED_QUESTION_PTR: [u8; 2] = [0xC0, 0x0C];

pub const CLASS_IN: u16 = 1;

const HEADER_SIZE: usize = 12;
const MAX_COMPRESSION_JUMPS: usize = 5;
const MAX_LABEL_LEN: u8 = 63;
const MAX_NAME_LEN: usize = 253;

/// Record type. Kept open: upstream responses carry types this server
/// never synthesizes (SOA authorities in negative answers, for one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DnsType(pub u16);

impl DnsType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const OPT: Self = Self(41);
}

impl fmt::Display for DnsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            1 => write!(f, "A"),
            2 => write!(f, "NS"),
            5 => write!(f, "CNAME"),
            6 => write!(f, "SOA"),
            12 => write!(f, "PTR"),
            15 => write!(f, "MX"),
            16 => write!(f, "TXT"),
            28 => write!(f, "AAAA"),
            41 => write!(f, "OPT"),
            other => write!(f, "TYPE{}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Rcode {
    Success = 0,
    FormatError = 1,
    ServerFailure = 2,
    NameFailure = 3,
}

impl TryFrom<u16> for Rcode {
    type Error = u16;

    fn try_from(value: u16) -> std::result::Result<Self, u16> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::FormatError),
            2 => Ok(Self::ServerFailure),
            3 => Ok(Self::NameFailure),
            other => Err(other),
        }
    }
}

/// The 12-byte message header. Flag layout, high bit first:
/// `QR | Opcode(4) | AA | TC | RD | RA | Z(3) | RCODE(4)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DnsHeader {
    pub id: u16,
    pub flags: u16,
}

impl DnsHeader {
    pub fn qr(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// True marks the message as a response.
    pub fn set_qr(&mut self, qr: bool) {
        if qr {
            self.flags |= 0x8000;
        } else {
            self.flags &= 0x7FFF;
        }
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0x0F) as u8
    }

    pub fn set_opcode(&mut self, opcode: u8) {
        self.flags = (self.flags & 0x87FF) | ((opcode as u16 & 0x0F) << 11);
    }

    pub fn set_aa(&mut self, aa: bool) {
        if aa {
            self.flags |= 0x0400;
        } else {
            self.flags &= 0xFBFF;
        }
    }

    pub fn set_tc(&mut self, tc: bool) {
        if tc {
            self.flags |= 0x0200;
        } else {
            self.flags &= 0xFDFF;
        }
    }

    pub fn rd(&self) -> bool {
        self.flags & 0x0100 != 0
    }

    pub fn set_rd(&mut self, rd: bool) {
        if rd {
            self.flags |= 0x0100;
        } else {
            self.flags &= 0xFEFF;
        }
    }

    pub fn ra(&self) -> bool {
        self.flags & 0x0080 != 0
    }

    pub fn set_ra(&mut self, ra: bool) {
        if ra {
            self.flags |= 0x0080;
        } else {
            self.flags &= 0xFF7F;
        }
    }

    pub fn set_z(&mut self, z: u8) {
        self.flags = (self.flags & 0xFF8F) | ((z as u16 & 0x07) << 4);
    }

    pub fn rcode(&self) -> u16 {
        self.flags & 0x000F
    }

    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.flags = (self.flags & 0xFFF0) | rcode as u16;
    }
}

#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub name: Vec<u8>,
    pub parsed_name: String,
    pub qtype: DnsType,
    pub class: u16,
}

#[derive(Debug, Clone)]
pub struct DnsRecord {
    /// Original wire-format name, possibly ending in a compression pointer.
    pub name: Vec<u8>,
    pub parsed_name: String,
    pub rtype: DnsType,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
    /// Decoded target for name-valued RDATA (CNAME, NS, PTR).
    pub parsed_rdata: String,
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.parsed_name, self.rtype, self.class, self.ttl
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authorities: Vec<DnsRecord>,
    pub additionals: Vec<DnsRecord>,
}

impl DnsMessage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::PacketTooShort(data.len()));
        }

        let mut message = DnsMessage::new();
        message.header.id = u16::from_be_bytes([data[0], data[1]]);
        message.header.flags = u16::from_be_bytes([data[2], data[3]]);

        let qd_count = u16::from_be_bytes([data[4], data[5]]);
        let an_count = u16::from_be_bytes([data[6], data[7]]);
        let ns_count = u16::from_be_bytes([data[8], data[9]]);
        let ar_count = u16::from_be_bytes([data[10], data[11]]);

        // Nearly all real-world traffic carries a single question; more
        // than one is answered with FORMERR.
        if qd_count > 1 {
            return Err(Error::TooManyQuestions);
        }

        let mut offset = HEADER_SIZE;

        for _ in 0..qd_count {
            let (parsed_name, name, next) = parse_name_with_wire(data, offset)?;
            offset = next;

            let type_class = data.get(offset..offset + 4).ok_or_else(|| {
                Error::PacketMalformed("insufficient data for question type and class".to_string())
            })?;
            message.questions.push(DnsQuestion {
                name,
                parsed_name,
                qtype: DnsType(u16::from_be_bytes([type_class[0], type_class[1]])),
                class: u16::from_be_bytes([type_class[2], type_class[3]]),
            });
            offset += 4;
        }

        for _ in 0..an_count {
            let (record, next) = parse_record(data, offset)?;
            message.answers.push(record);
            offset = next;
        }

        for _ in 0..ns_count {
            let (record, next) = parse_record(data, offset)?;
            message.authorities.push(record);
            offset = next;
        }

        for _ in 0..ar_count {
            let (record, next) = parse_record(data, offset)?;
            message.additionals.push(record);
            offset = next;
        }

        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(512);

        buffer.extend_from_slice(&self.header.id.to_be_bytes());
        buffer.extend_from_slice(&self.header.flags.to_be_bytes());
        buffer.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        buffer.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for question in &self.questions {
            buffer.extend_from_slice(&question.name);
            buffer.extend_from_slice(&question.qtype.0.to_be_bytes());
            buffer.extend_from_slice(&question.class.to_be_bytes());
        }

        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            encode_record(&mut buffer, record);
        }

        buffer
    }
}

fn encode_record(buffer: &mut Vec<u8>, record: &DnsRecord) {
    buffer.extend_from_slice(&record.name);
    buffer.extend_from_slice(&record.rtype.0.to_be_bytes());
    buffer.extend_from_slice(&record.class.to_be_bytes());
    buffer.extend_from_slice(&record.ttl.to_be_bytes());
    buffer.extend_from_slice(&(record.rdata.len() as u16).to_be_bytes());
    buffer.extend_from_slice(&record.rdata);
}

/// Encodes a dotted domain into wire format: length-prefixed labels
/// terminated by the root byte.
pub fn wire_name(domain: &str) -> Vec<u8> {
    if domain.is_empty() || domain == "." {
        return vec![0];
    }

    let domain = domain.strip_suffix('.').unwrap_or(domain);
    let mut result = Vec::with_capacity(domain.len() + 2);

    for label in domain.split('.') {
        if label.is_empty() {
            continue;
        }
        let label = &label.as_bytes()[..label.len().min(MAX_LABEL_LEN as usize)];
        result.push(label.len() as u8);
        result.extend_from_slice(label);
    }
    result.push(0);
    result
}

/// Decodes a possibly-compressed name. Returns the dotted string and the
/// offset of the data following the name; after a compression jump that is
/// the position right behind the first pointer.
pub fn parse_name(data: &[u8], start: usize) -> Result<(String, usize)> {
    let mut name = String::new();
    let mut offset = start;
    let mut resume_at = None;
    let mut jumps = 0;
    let mut visited: HashSet<usize> = HashSet::new();

    loop {
        let length = *data.get(offset).ok_or_else(|| {
            Error::PacketMalformed("unexpected end of data while parsing name".to_string())
        })?;

        if length & 0xC0 == 0xC0 {
            let low = *data.get(offset + 1).ok_or_else(|| {
                Error::PacketMalformed("incomplete compression pointer".to_string())
            })?;
            let pointer = ((length as usize & 0x3F) << 8) | low as usize;

            // Pointers may only reach backwards; this also rules out
            // self-references.
            if pointer >= offset {
                return Err(Error::PacketMalformed(format!(
                    "compression pointer {} at offset {} does not point backwards",
                    pointer, offset
                )));
            }
            if !visited.insert(pointer) {
                return Err(Error::PacketMalformed(
                    "compression pointer loop detected".to_string(),
                ));
            }
            jumps += 1;
            if jumps > MAX_COMPRESSION_JUMPS {
                return Err(Error::PacketMalformed(
                    "too many compression jumps".to_string(),
                ));
            }

            if resume_at.is_none() {
                resume_at = Some(offset + 2);
            }
            offset = pointer;
            continue;
        }

        offset += 1;

        if length == 0 {
            break;
        }

        if length > MAX_LABEL_LEN {
            return Err(Error::PacketMalformed(format!(
                "invalid label length {} (max {})",
                length, MAX_LABEL_LEN
            )));
        }

        let label = data.get(offset..offset + length as usize).ok_or_else(|| {
            Error::PacketMalformed("label extends beyond packet".to_string())
        })?;

        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        offset += length as usize;

        if name.len() > MAX_NAME_LEN {
            return Err(Error::PacketMalformed("domain name too long".to_string()));
        }
    }

    Ok((name, resume_at.unwrap_or(offset)))
}

/// Decodes a name and also captures its original wire bytes, up to and
/// including the first compression pointer.
pub fn parse_name_with_wire(data: &[u8], start: usize) -> Result<(String, Vec<u8>, usize)> {
    let (parsed, next) = parse_name(data, start)?;

    let mut wire = Vec::new();
    let mut pos = start;
    while let Some(&length) = data.get(pos) {
        if length & 0xC0 == 0xC0 {
            wire.extend_from_slice(&data[pos..pos + 2]);
            break;
        }

        wire.push(length);
        pos += 1;

        if length == 0 {
            break;
        }

        if pos + length as usize <= data.len() {
            wire.extend_from_slice(&data[pos..pos + length as usize]);
            pos += length as usize;
        } else {
            break;
        }
    }

    Ok((parsed, wire, next))
}

fn parse_record(data: &[u8], start: usize) -> Result<(DnsRecord, usize)> {
    let (parsed_name, name, mut offset) = parse_name_with_wire(data, start)?;

    let fixed = data.get(offset..offset + 10).ok_or_else(|| {
        Error::PacketMalformed(format!(
            "insufficient data for resource record at offset {}",
            offset
        ))
    })?;

    let rtype = DnsType(u16::from_be_bytes([fixed[0], fixed[1]]));

    // OPT reinterprets the fixed fields: class carries the requestor's UDP
    // payload size, TTL the extended RCODE and flags, and the name is root.
    if rtype == DnsType::OPT {
        let payload_size = u16::from_be_bytes([fixed[2], fixed[3]]);
        let extended_info = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rd_length = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
        offset += 10;

        let rdata = data.get(offset..offset + rd_length).ok_or_else(|| {
            Error::PacketMalformed(format!(
                "OPT record data extends beyond packet at offset {}",
                offset
            ))
        })?;
        offset += rd_length;

        return Ok((
            DnsRecord {
                name: Vec::new(),
                parsed_name: String::new(),
                rtype,
                class: payload_size,
                ttl: extended_info,
                rdata: rdata.to_vec(),
                parsed_rdata: String::new(),
            },
            offset,
        ));
    }

    let class = u16::from_be_bytes([fixed[2], fixed[3]]);
    let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
    let rd_length = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
    offset += 10;

    let rdata = data.get(offset..offset + rd_length).ok_or_else(|| {
        Error::PacketMalformed(format!(
            "resource record data extends beyond packet at offset {} (rdlength {})",
            offset, rd_length
        ))
    })?;

    // Name-valued RDATA may itself be compressed, so decode it against the
    // whole message. Failures leave the raw bytes intact.
    let parsed_rdata = if rtype == DnsType::CNAME || rtype == DnsType::NS || rtype == DnsType::PTR {
        parse_name(data, offset)
            .map(|(target, _)| target)
            .unwrap_or_default()
    } else {
        String::new()
    };

    let record = DnsRecord {
        name,
        parsed_name,
        rtype,
        class,
        ttl,
        rdata: rdata.to_vec(),
        parsed_rdata,
    };

    Ok((record, offset + rd_length))
}
