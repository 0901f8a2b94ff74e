//! DNS message parsing and construction.
//!
//! Only the parts of RFC 1035 framing the proxy needs are implemented: the
//! fixed header, the question section, and a question-only response used to
//! deny a query. Compressed names are rejected rather than followed.

use thiserror::Error;

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// QR bit of the flags field.
pub const FLAG_RESPONSE: u16 = 1 << 15;

const MAX_LABEL_LEN: usize = 63;

/// Maximum wire length of an encoded name, length octets and root included.
const MAX_NAME_LEN: usize = 255;

const POINTER_MASK: u8 = 0xC0;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("DNS header too short: {0} bytes")]
    MalformedHeader(usize),
    #[error("malformed label at offset {offset}")]
    MalformedLabel { offset: usize },
    #[error("compression pointer at offset {offset} is not supported")]
    UnsupportedCompression { offset: usize },
    #[error("label too long: {len} bytes (limit {limit})")]
    LabelTooLong { len: usize, limit: usize },
    #[error("question truncated at offset {offset}")]
    MalformedQuestion { offset: usize },
    #[error("too many questions for one message: {0}")]
    TooManyQuestions(usize),
    #[error("character {0:?} cannot be encoded in a label")]
    InvalidCharacter(char),
}

/// The fixed 12-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub id: u16,
    pub flags: u16,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl Header {
    /// Read a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, DnsError> {
        if data.len() < HEADER_LEN {
            return Err(DnsError::MalformedHeader(data.len()));
        }

        let field = |i: usize| u16::from_be_bytes([data[i], data[i + 1]]);

        Ok(Self {
            id: field(0),
            flags: field(2),
            qdcount: field(4),
            ancount: field(6),
            nscount: field(8),
            arcount: field(10),
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_RESPONSE != 0
    }

    fn write(&self, buf: &mut Vec<u8>) {
        for field in [
            self.id,
            self.flags,
            self.qdcount,
            self.ancount,
            self.nscount,
            self.arcount,
        ] {
            buf.extend_from_slice(&field.to_be_bytes());
        }
    }
}

/// A DNS question section entry.
///
/// Label bytes map one-to-one onto `char`s (Latin-1) and case is kept as
/// received. Labels are joined with `.`, so a label that itself contains a
/// 0x2E byte is split in two when the name is re-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A decoded query: header plus question section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
}

impl Message {
    /// Decode the header and exactly `qdcount` questions from raw bytes.
    ///
    /// Anything after the question section is not inspected.
    pub fn decode(data: &[u8]) -> Result<Self, DnsError> {
        let header = Header::parse(data)?;
        let mut reader = Reader {
            data,
            pos: HEADER_LEN,
        };

        let mut questions = Vec::with_capacity(header.qdcount as usize);
        for _ in 0..header.qdcount {
            let name = reader.read_name()?;
            let qtype = reader.read_u16()?;
            let qclass = reader.read_u16()?;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        Ok(Self { header, questions })
    }

    /// Build the deny response for this query.
    pub fn deny_response(&self) -> Result<Vec<u8>, DnsError> {
        encode_deny_response(&self.header, &self.questions)
    }
}

/// Encode a question-only response that carries no records.
///
/// The transaction ID comes from `query`; the flags are exactly the QR bit and
/// all counts are derived from `questions`.
pub fn encode_deny_response(query: &Header, questions: &[Question]) -> Result<Vec<u8>, DnsError> {
    let qdcount = u16::try_from(questions.len())
        .map_err(|_| DnsError::TooManyQuestions(questions.len()))?;

    let header = Header {
        id: query.id,
        flags: FLAG_RESPONSE,
        qdcount,
        ..Header::default()
    };

    let mut data = Vec::with_capacity(512);
    header.write(&mut data);

    for q in questions {
        encode_name(&mut data, &q.name)?;
        data.extend_from_slice(&q.qtype.to_be_bytes());
        data.extend_from_slice(&q.qclass.to_be_bytes());
    }

    Ok(data)
}

/// Append `name` as length-prefixed labels followed by the root label.
///
/// The empty name is the root and encodes to a single zero octet.
fn encode_name(buf: &mut Vec<u8>, name: &str) -> Result<(), DnsError> {
    let start = buf.len();

    if !name.is_empty() {
        for label in name.split('.') {
            let bytes = label
                .chars()
                .map(|c| u8::try_from(c).map_err(|_| DnsError::InvalidCharacter(c)))
                .collect::<Result<Vec<u8>, _>>()?;

            if bytes.is_empty() {
                return Err(DnsError::MalformedLabel {
                    offset: buf.len() - start,
                });
            }
            if bytes.len() > MAX_LABEL_LEN {
                return Err(DnsError::LabelTooLong {
                    len: bytes.len(),
                    limit: MAX_LABEL_LEN,
                });
            }

            buf.push(bytes.len() as u8);
            buf.extend_from_slice(&bytes);
        }
    }
    buf.push(0);

    let encoded = buf.len() - start;
    if encoded > MAX_NAME_LEN {
        return Err(DnsError::LabelTooLong {
            len: encoded,
            limit: MAX_NAME_LEN,
        });
    }

    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn read_u16(&mut self) -> Result<u16, DnsError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or(DnsError::MalformedQuestion { offset: self.pos })?;
        self.pos += 2;

        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    // RFC 1035 4.1.2: a name is a sequence of labels, each a length octet and
    // that many octets, terminated by the zero-length root label.
    fn read_name(&mut self) -> Result<String, DnsError> {
        let mut name = String::new();

        loop {
            let offset = self.pos;
            let len = *self
                .data
                .get(offset)
                .ok_or(DnsError::MalformedLabel { offset })?;

            if len == 0 {
                self.pos += 1;
                return Ok(name);
            }
            if len & POINTER_MASK == POINTER_MASK {
                return Err(DnsError::UnsupportedCompression { offset });
            }
            // 0x40 and 0x80 prefixes are reserved label types.
            if len as usize > MAX_LABEL_LEN {
                return Err(DnsError::MalformedLabel { offset });
            }

            let label = self
                .data
                .get(offset + 1..offset + 1 + len as usize)
                .ok_or(DnsError::MalformedLabel { offset })?;

            if !name.is_empty() {
                name.push('.');
            }
            name.extend(label.iter().map(|&b| b as char));
            self.pos = offset + 1 + len as usize;
        }
    }
}
