//! EXTH (extended metadata) records.
//!
//! The EXTH block sits right after the MOBI header in record 0:
//!
//! ```text
//! "EXTH" | length: u32 | count: u32 | count × (type: u32, length: u32, payload) | zero padding
//! ```
//!
//! `length` covers the 12-byte block header and the records but not the
//! padding to the next 4-byte boundary. Every edit here rebuilds the block,
//! splices it back into record 0 and moves the full-name offset by the size
//! difference, since the full name is stored after the EXTH block.

use bstr::ByteSlice;
use tracing::debug;

use crate::error::{Error, Result};

use super::headers::{EXTH_PRESENT, Encoding, MobiHeader, NULL_INDEX, offsets};
use super::pdb::be_u32;

pub const EXTH_MAGIC: &[u8; 4] = b"EXTH";

const BLOCK_HEADER_LEN: usize = 12;
const RECORD_HEADER_LEN: usize = 8;

/// Well-known EXTH record types.
pub mod keys {
    pub const AUTHOR: u32 = 100;
    pub const PUBLISHER: u32 = 101;
    pub const DESCRIPTION: u32 = 103;
    pub const ISBN: u32 = 104;
    pub const SUBJECT: u32 = 105;
    pub const PUBLISHED: u32 = 106;
    pub const RIGHTS: u32 = 109;
    pub const SOURCE: u32 = 112;
    pub const ASIN: u32 = 113;
    pub const START_OFFSET: u32 = 116;
    pub const KF8_BOUNDARY: u32 = 121;
    pub const KF8_RESOURCE_COUNT: u32 = 125;
    pub const KF8_COVER_URI: u32 = 129;
    pub const COVER_OFFSET: u32 = 201;
    pub const THUMBNAIL_OFFSET: u32 = 202;
    pub const CONTENT_TYPE: u32 = 501;
    pub const TITLE: u32 = 503;
    pub const CDE_ASIN: u32 = 504;
    pub const LANGUAGE: u32 = 524;
}

fn padded(len: usize) -> usize {
    len.div_ceil(4) * 4
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExthRecord {
    pub kind: u32,
    pub data: Vec<u8>,
}

/// Decoded EXTH block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExthBlock {
    pub records: Vec<ExthRecord>,
}

impl ExthBlock {
    /// Parse a block starting at `data[0]`. Returns the block and the number
    /// of bytes it occupies including padding.
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < BLOCK_HEADER_LEN {
            return Err(Error::InvalidMobi("EXTH header too short".into()));
        }
        if &data[0..4] != EXTH_MAGIC {
            return Err(Error::InvalidMobi("Invalid EXTH signature".into()));
        }

        let declared_len = be_u32(data, 4).unwrap_or(0) as usize;
        let record_count = be_u32(data, 8).unwrap_or(0) as usize;

        let mut records = Vec::with_capacity(record_count.min(1024));
        let mut pos = BLOCK_HEADER_LEN;
        for i in 0..record_count {
            let (Some(kind), Some(record_len)) = (be_u32(data, pos), be_u32(data, pos + 4)) else {
                return Err(Error::InvalidMobi(format!(
                    "EXTH record {i} of {record_count} runs past the end of the header"
                )));
            };
            let record_len = record_len as usize;
            if record_len < RECORD_HEADER_LEN || pos + record_len > data.len() {
                return Err(Error::InvalidMobi(format!(
                    "EXTH record {i} (type {kind}) has bad length {record_len}"
                )));
            }
            records.push(ExthRecord {
                kind,
                data: data[pos + RECORD_HEADER_LEN..pos + record_len].to_vec(),
            });
            pos += record_len;
        }

        // Some writers count the padding in the length field, so compare padded sizes.
        if padded(declared_len) != padded(pos) {
            return Err(Error::InvalidMobi(format!(
                "EXTH length {declared_len} does not match {record_count} records ({pos} bytes)"
            )));
        }

        let region = padded(pos).min(data.len());
        Ok((Self { records }, region))
    }

    /// Block length as stored in the length field.
    pub fn encoded_len(&self) -> usize {
        BLOCK_HEADER_LEN
            + self
                .records
                .iter()
                .map(|r| RECORD_HEADER_LEN + r.data.len())
                .sum::<usize>()
    }

    /// Serialize, zero padded to a 4-byte boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.encoded_len();
        let mut out = Vec::with_capacity(padded(len));
        out.extend_from_slice(EXTH_MAGIC);
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out.extend_from_slice(&(self.records.len() as u32).to_be_bytes());
        for record in &self.records {
            out.extend_from_slice(&record.kind.to_be_bytes());
            out.extend_from_slice(&((RECORD_HEADER_LEN + record.data.len()) as u32).to_be_bytes());
            out.extend_from_slice(&record.data);
        }
        out.resize(padded(len), 0);
        out
    }

    /// Payloads of all records of type `kind`, in file order.
    pub fn values(&self, kind: u32) -> impl Iterator<Item = &[u8]> {
        self.records
            .iter()
            .filter(move |r| r.kind == kind)
            .map(|r| r.data.as_slice())
    }

    pub fn first(&self, kind: u32) -> Option<&[u8]> {
        self.values(kind).next()
    }

    fn position(&self, kind: u32) -> Option<usize> {
        self.records.iter().position(|r| r.kind == kind)
    }
}

/// Where the EXTH block of a record 0 lives.
struct ExthSpan {
    header: MobiHeader,
    start: usize,
    len: usize,
}

fn locate(record0: &[u8]) -> Result<(ExthSpan, Option<ExthBlock>)> {
    let header = MobiHeader::parse(record0)?;
    if header.header_length == 0 {
        return Err(Error::InvalidMobi("record 0 has no MOBI header".into()));
    }
    let start = header.exth_offset();
    if start > record0.len() {
        return Err(Error::InvalidMobi(format!(
            "MOBI header length {} runs past record 0",
            header.header_length
        )));
    }
    if !header.has_exth() {
        return Ok((ExthSpan { header, start, len: 0 }, None));
    }
    let (block, len) = ExthBlock::parse(&record0[start..])?;
    Ok((ExthSpan { header, start, len }, Some(block)))
}

/// Decode the EXTH block of record 0, if it has one.
pub fn parse_exth(record0: &[u8]) -> Result<Option<ExthBlock>> {
    locate(record0).map(|(_, block)| block)
}

/// Rebuild record 0 after `edit` has changed its EXTH block.
fn rewrite<F>(record0: &[u8], edit: F) -> Result<Vec<u8>>
where
    F: FnOnce(&mut ExthBlock),
{
    let (span, block) = locate(record0)?;
    let mut block = block.unwrap_or_default();
    edit(&mut block);

    if !span.header.has_exth() && span.start < offsets::EXTH_FLAGS + 4 {
        return Err(Error::InvalidMobi(
            "MOBI header too short to carry EXTH flags".into(),
        ));
    }

    let encoded = block.to_bytes();
    let old_end = span.start + span.len;
    let delta = encoded.len() as i64 - span.len as i64;

    let mut out = Vec::with_capacity(record0.len() + encoded.len());
    out.extend_from_slice(&record0[..span.start]);
    out.extend_from_slice(&encoded);
    out.extend_from_slice(&record0[old_end..]);

    let flags = span.header.exth_flags | EXTH_PRESENT;
    out[offsets::EXTH_FLAGS..offsets::EXTH_FLAGS + 4].copy_from_slice(&flags.to_be_bytes());

    // The full name follows the EXTH block.
    let title_offset = span.header.title_offset as usize;
    if title_offset >= old_end && span.start >= offsets::TITLE_OFFSET + 4 {
        let moved = (title_offset as i64 + delta) as u32;
        out[offsets::TITLE_OFFSET..offsets::TITLE_OFFSET + 4].copy_from_slice(&moved.to_be_bytes());
    }

    Ok(out)
}

/// All payloads stored under `key`, in file order.
pub fn read_exth(record0: &[u8], key: u32) -> Result<Vec<Vec<u8>>> {
    Ok(parse_exth(record0)?
        .map(|block| block.values(key).map(<[u8]>::to_vec).collect())
        .unwrap_or_default())
}

/// Append a new record, creating the EXTH block if needed.
pub fn add_exth(record0: &[u8], key: u32, value: &[u8]) -> Result<Vec<u8>> {
    debug!(key, len = value.len(), "adding EXTH record");
    rewrite(record0, |block| {
        block.records.push(ExthRecord {
            kind: key,
            data: value.to_vec(),
        });
    })
}

/// Overwrite the first record stored under `key`.
///
/// Same-length payloads are replaced in place; otherwise the record is
/// removed and appended again. Without a record for `key`, or when it already
/// holds `value`, record 0 comes back unchanged.
pub fn write_exth(record0: &[u8], key: u32, value: &[u8]) -> Result<Vec<u8>> {
    let (_, block) = locate(record0)?;
    let Some((position, current)) = block
        .as_ref()
        .and_then(|b| b.position(key).map(|p| (p, b.records[p].data.as_slice())))
    else {
        debug!(key, "no EXTH record to overwrite");
        return Ok(record0.to_vec());
    };
    // Keeps the block byte-identical, including a length field that counts padding.
    if current == value {
        return Ok(record0.to_vec());
    }
    debug!(key, len = value.len(), "overwriting EXTH record");
    rewrite(record0, |block| {
        if block.records[position].data.len() == value.len() {
            block.records[position].data.copy_from_slice(value);
        } else {
            block.records.remove(position);
            block.records.push(ExthRecord {
                kind: key,
                data: value.to_vec(),
            });
        }
    })
}

/// Remove the first record stored under `key`, if any.
pub fn delete_exth(record0: &[u8], key: u32) -> Result<Vec<u8>> {
    let (_, block) = locate(record0)?;
    let Some(position) = block.as_ref().and_then(|b| b.position(key)) else {
        return Ok(record0.to_vec());
    };
    debug!(key, "deleting EXTH record");
    rewrite(record0, |block| {
        block.records.remove(position);
    })
}

/// How [`add_or_update_exth`] applies a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExthEdit {
    /// No record with the key exists yet.
    Append,
    /// Replace the first record with the key.
    Overwrite,
}

impl ExthEdit {
    pub fn plan(record0: &[u8], key: u32) -> Result<Self> {
        let exists = parse_exth(record0)?.is_some_and(|block| block.first(key).is_some());
        Ok(if exists {
            ExthEdit::Overwrite
        } else {
            ExthEdit::Append
        })
    }

    pub fn apply(self, record0: &[u8], key: u32, value: &[u8]) -> Result<Vec<u8>> {
        match self {
            ExthEdit::Append => add_exth(record0, key, value),
            ExthEdit::Overwrite => write_exth(record0, key, value),
        }
    }
}

/// Set `key` to `value`: overwrite when present, append otherwise.
pub fn add_or_update_exth(record0: &[u8], key: u32, value: &[u8]) -> Result<Vec<u8>> {
    ExthEdit::plan(record0, key)?.apply(record0, key, value)
}

/// Common EXTH fields decoded to text.
#[derive(Debug, Default)]
pub struct ExthMetadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub asin: Option<String>,
    pub source: Option<String>,
    pub subjects: Vec<String>,
    pub pub_date: Option<String>,
    pub rights: Option<String>,
    pub content_type: Option<String>,
    pub cover_offset: Option<u32>,
    pub thumbnail_offset: Option<u32>,
    pub language: Option<String>,
    pub kf8_boundary: Option<u32>,
}

impl ExthMetadata {
    pub fn from_block(block: &ExthBlock, encoding: Encoding) -> Self {
        let decode = |bytes: &[u8]| -> String {
            let text = match encoding {
                Encoding::Cp1252 => encoding_rs::WINDOWS_1252.decode(bytes).0,
                _ => bytes.to_str_lossy(),
            };
            text.trim().to_string()
        };
        let index = |bytes: &[u8]| -> Option<u32> {
            be_u32(bytes, 0).filter(|&val| val != NULL_INDEX)
        };

        let mut exth = ExthMetadata::default();
        for record in &block.records {
            let content = record.data.as_slice();
            match record.kind {
                keys::AUTHOR => exth.authors.push(decode(content)),
                keys::PUBLISHER => exth.publisher = Some(decode(content)),
                keys::DESCRIPTION => exth.description = Some(decode(content)),
                keys::ISBN => exth.isbn = Some(decode(content)),
                keys::SUBJECT => {
                    for subject in decode(content).split(';') {
                        let s = subject.trim().to_string();
                        if !s.is_empty() {
                            exth.subjects.push(s);
                        }
                    }
                }
                keys::PUBLISHED => exth.pub_date = Some(decode(content)),
                keys::RIGHTS => exth.rights = Some(decode(content)),
                keys::SOURCE => exth.source = Some(decode(content)),
                // 113 wins over 504 when both are present.
                keys::ASIN => exth.asin = Some(decode(content)),
                keys::CDE_ASIN => {
                    if block.first(keys::ASIN).is_none() {
                        exth.asin = Some(decode(content));
                    }
                }
                keys::KF8_BOUNDARY => exth.kf8_boundary = index(content),
                keys::COVER_OFFSET => exth.cover_offset = index(content),
                keys::THUMBNAIL_OFFSET => exth.thumbnail_offset = index(content),
                keys::CONTENT_TYPE => exth.content_type = Some(decode(content)),
                keys::TITLE => exth.title = Some(decode(content)),
                keys::LANGUAGE => exth.language = Some(decode(content)),
                _ => {}
            }
        }
        exth
    }
}
