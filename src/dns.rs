/// DNS wire codec for the data plane
///
/// Decodes the header and the first question of a query and emits the
/// synthesized negative answer for denied names. Everything past the
/// question section (EDNS/OPT included) is left untouched; forwarded
/// responses pass through verbatim apart from the id rewrite.
use bitstream_io::{BigEndian, BitRead, BitReader, BitWrite, BitWriter};
use thiserror::Error;

pub const DNS_PORT: u16 = 53;
pub const HEADER_LEN: usize = 12;
pub const RCODE_NXDOMAIN: u8 = 3;

const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsCodecError {
    #[error("truncated DNS header")]
    TruncatedHeader,
    #[error("truncated question section")]
    TruncatedQuestion,
    #[error("unsupported question count: {0}")]
    UnsupportedQuestionCount(u16),
    #[error("invalid DNS label")]
    InvalidLabel,
    #[error("compressed name in question")]
    CompressedName,
    #[error("packet is not a query")]
    NotAQuery,
}

impl From<std::io::Error> for DnsCodecError {
    fn from(_: std::io::Error) -> Self {
        DnsCodecError::TruncatedHeader
    }
}

/// The first (and only) question of a client query, plus the header
/// fields needed to synthesize a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub id: u16,
    pub opcode: u8,
    pub rd: bool,
    /// Lowercased, without trailing dot.
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
    /// Raw question section bytes, echoed into responses.
    wire_question: Vec<u8>,
}

impl Question {
    /// Decode the header and first question of a DNS query.
    pub fn parse(payload: &[u8]) -> Result<Question, DnsCodecError> {
        if payload.len() < HEADER_LEN {
            return Err(DnsCodecError::TruncatedHeader);
        }

        let mut reader = BitReader::endian(payload, BigEndian);
        let id = reader.read_var::<u16>(16)?;
        let qr = reader.read_var::<u8>(1)? == 1;
        let opcode = reader.read_var::<u8>(4)?;
        let _aa = reader.read_var::<u8>(1)?;
        let _tc = reader.read_var::<u8>(1)?;
        let rd = reader.read_var::<u8>(1)? == 1;
        let _ra = reader.read_var::<u8>(1)?;
        let _z = reader.read_var::<u8>(3)?;
        let _rcode = reader.read_var::<u8>(4)?;
        let qdcount = reader.read_var::<u16>(16)?;
        let _ancount = reader.read_var::<u16>(16)?;
        let _nscount = reader.read_var::<u16>(16)?;
        let _arcount = reader.read_var::<u16>(16)?;

        if qr {
            return Err(DnsCodecError::NotAQuery);
        }
        if qdcount != 1 {
            return Err(DnsCodecError::UnsupportedQuestionCount(qdcount));
        }

        let (name, question_end) = read_name(payload, HEADER_LEN)?;

        let qtype_end = question_end + 4;
        let fixed = payload
            .get(question_end..qtype_end)
            .ok_or(DnsCodecError::TruncatedQuestion)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Ok(Question {
            id,
            opcode,
            rd,
            name,
            qtype,
            qclass,
            wire_question: payload[HEADER_LEN..qtype_end].to_vec(),
        })
    }

    /// Synthesize the negative answer for a denied name: RCODE 3,
    /// QR=1, RA=1, question echoed, no records.
    pub fn nxdomain_response(&self) -> Result<Vec<u8>, DnsCodecError> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + self.wire_question.len());
        let mut writer = BitWriter::endian(&mut bytes, BigEndian);

        writer.write_var::<u16>(16, self.id)?;
        writer.write_var::<u8>(1, 1)?; // qr
        writer.write_var::<u8>(4, self.opcode)?;
        writer.write_var::<u8>(1, 0)?; // aa
        writer.write_var::<u8>(1, 0)?; // tc
        writer.write_var::<u8>(1, self.rd as u8)?;
        writer.write_var::<u8>(1, 1)?; // ra
        writer.write_var::<u8>(3, 0)?; // z
        writer.write_var::<u8>(4, RCODE_NXDOMAIN)?;
        writer.write_var::<u16>(16, 1)?; // qdcount
        writer.write_var::<u16>(16, 0)?; // ancount
        writer.write_var::<u16>(16, 0)?; // nscount
        writer.write_var::<u16>(16, 0)?; // arcount

        bytes.extend_from_slice(&self.wire_question);
        Ok(bytes)
    }
}

/// Read an uncompressed name starting at `offset`, returning the
/// lowercased dotted form and the offset past the terminating zero.
fn read_name(payload: &[u8], offset: usize) -> Result<(String, usize), DnsCodecError> {
    let mut name = String::new();
    let mut pos = offset;

    loop {
        let len = *payload.get(pos).ok_or(DnsCodecError::TruncatedQuestion)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xC0 == 0xC0 {
            return Err(DnsCodecError::CompressedName);
        }
        if len > MAX_LABEL_LEN {
            return Err(DnsCodecError::InvalidLabel);
        }

        let label = payload
            .get(pos + 1..pos + 1 + len)
            .ok_or(DnsCodecError::TruncatedQuestion)?;

        if !name.is_empty() {
            name.push('.');
        }
        for &b in label {
            name.push(b.to_ascii_lowercase() as char);
        }
        if name.len() > MAX_NAME_LEN {
            return Err(DnsCodecError::InvalidLabel);
        }

        pos += 1 + len;
    }

    Ok((name, pos))
}

/// The id of a DNS message, if the buffer is long enough to carry one.
pub fn message_id(payload: &[u8]) -> Option<u16> {
    let bytes = payload.get(0..2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Patch the id of an already-encoded DNS message in place.
pub fn rewrite_id(payload: &mut [u8], id: u16) {
    if let Some(bytes) = payload.get_mut(0..2) {
        bytes.copy_from_slice(&id.to_be_bytes());
    }
}
