use tracing::debug;

use crate::error::{Error, Result};

use super::pdb::{Ident, PalmDb, be_u16, be_u32};

pub const NULL_INDEX: u32 = 0xFFFFFFFF;

/// Marker at the start of the section after record 0 in Print Replica books.
pub const PRINT_REPLICA_MARKER: &[u8; 4] = b"%MOP";

/// Byte offsets of record 0 fields (PalmDOC header + MOBI header).
pub mod offsets {
    /// The MOBI header starts after the 16-byte PalmDOC header.
    pub const MOBI_HEADER_BASE: usize = 16;
    pub const RECORD_COUNT: usize = 0x08;
    pub const ENCRYPTION: usize = 0x0C;
    pub const HEADER_LENGTH: usize = 0x14;
    pub const MOBI_TYPE: usize = 0x18;
    pub const CODEPAGE: usize = 0x1C;
    pub const UNIQUE_ID: usize = 0x20;
    pub const VERSION: usize = 0x24;
    pub const TITLE_OFFSET: usize = 0x54;
    pub const TITLE_LENGTH: usize = 0x58;
    pub const FIRST_RESOURCE: usize = 0x6C;
    pub const HUFF_RECORD: usize = 0x70;
    pub const EXTH_FLAGS: usize = 0x80;
    /// KF8 only; MOBI7 stores the first/last content u16 pair here.
    pub const FDST_INDEX: usize = 0xC0;
    pub const LAST_CONTENT: usize = 0xC2;
    pub const FCIS_INDEX: usize = 0xC8;
    pub const FLIS_INDEX: usize = 0xD0;
    pub const SRCS_INDEX: usize = 0xE0;
    pub const SRCS_COUNT: usize = 0xE4;
    pub const DATP_INDEX: usize = 0x100;

    /// End of the fixed fields every MOBI header carries.
    pub const FIXED_END: usize = 0x28;
}

/// EXTH flag bit meaning "an EXTH block follows the MOBI header".
pub const EXTH_PRESENT: u32 = 0x40;

/// MOBI Header (Record 0)
#[derive(Debug, Clone)]
pub struct MobiHeader {
    pub compression: Compression,
    pub text_record_count: u16,
    pub text_record_size: u16,
    pub encryption: u16,
    pub header_length: u32,
    pub mobi_type: u32,
    pub encoding: Encoding,
    pub unique_id: u32,
    pub mobi_version: u32,
    pub title_offset: u32,
    pub title_length: u32,
    pub title: String,
    pub first_resource_index: u32,
    pub huff_record_index: u32,
    pub exth_flags: u32,
    pub last_content_index: u16,
    pub fdst_index: u32,
    pub fcis_index: u32,
    pub flis_index: u32,
    pub srcs_index: u32,
    pub srcs_count: u32,
    pub datp_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compression {
    None,
    PalmDoc,
    Huffman,
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    Cp1252,
    Utf8,
    Unknown(u32),
}

impl MobiHeader {
    /// Decode record 0.
    ///
    /// A record shorter than the fixed MOBI fields is a bare PalmDOC header
    /// (`TEXtREAd` books); [`HeaderInspector`] rejects it for `BOOKMOBI`.
    /// Optional fields past the end of the record read as absent.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < offsets::MOBI_HEADER_BASE {
            return Err(Error::InvalidMobi("MOBI header too short".into()));
        }

        let compression = match be_u16(data, 0).unwrap_or(0) {
            1 => Compression::None,
            2 => Compression::PalmDoc,
            0x4448 => Compression::Huffman, // "DH"
            n => Compression::Unknown(n),
        };
        let text_record_count = be_u16(data, offsets::RECORD_COUNT).unwrap_or(0);
        let text_record_size = be_u16(data, 0x0A).unwrap_or(0);
        let encryption = be_u16(data, offsets::ENCRYPTION).unwrap_or(0);

        // PalmDOC header, possibly followed by a few unused bytes
        if data.len() < offsets::FIXED_END {
            return Ok(Self {
                compression,
                text_record_count,
                text_record_size,
                encryption,
                header_length: 0,
                mobi_type: 0,
                encoding: Encoding::Cp1252,
                unique_id: 0,
                mobi_version: 1,
                title_offset: 0,
                title_length: 0,
                title: String::new(),
                first_resource_index: NULL_INDEX,
                huff_record_index: NULL_INDEX,
                exth_flags: 0,
                last_content_index: 0xFFFF,
                fdst_index: NULL_INDEX,
                fcis_index: NULL_INDEX,
                flis_index: NULL_INDEX,
                srcs_index: NULL_INDEX,
                srcs_count: 0,
                datp_index: NULL_INDEX,
            });
        }

        let fixed = |offset| be_u32(data, offset).unwrap_or(0);
        let header_length = fixed(offsets::HEADER_LENGTH);
        let mobi_type = fixed(offsets::MOBI_TYPE);
        let unique_id = fixed(offsets::UNIQUE_ID);
        let mobi_version = fixed(offsets::VERSION);

        let encoding = match fixed(offsets::CODEPAGE) {
            1252 => Encoding::Cp1252,
            65001 => Encoding::Utf8,
            n => Encoding::Unknown(n),
        };

        // Fields past the end of the MOBI header are not part of it, even
        // when the record has bytes there (EXTH, title).
        let header_end = (offsets::MOBI_HEADER_BASE + header_length as usize).min(data.len());
        let header = &data[..header_end];
        let index = |offset| be_u32(header, offset).unwrap_or(NULL_INDEX);

        let title_offset = be_u32(header, offsets::TITLE_OFFSET).unwrap_or(0);
        let title_length = be_u32(header, offsets::TITLE_LENGTH).unwrap_or(0);
        let title = data
            .get(title_offset as usize..)
            .and_then(|rest| rest.get(..title_length as usize))
            .filter(|_| title_offset > 0)
            .map(|bytes| String::from_utf8_lossy(bytes).to_string())
            .unwrap_or_default();

        Ok(Self {
            compression,
            text_record_count,
            text_record_size,
            encryption,
            header_length,
            mobi_type,
            encoding,
            unique_id,
            mobi_version,
            title_offset,
            title_length,
            title,
            first_resource_index: index(offsets::FIRST_RESOURCE),
            huff_record_index: index(offsets::HUFF_RECORD),
            exth_flags: be_u32(header, offsets::EXTH_FLAGS).unwrap_or(0),
            last_content_index: be_u16(header, offsets::LAST_CONTENT).unwrap_or(0xFFFF),
            fdst_index: index(offsets::FDST_INDEX),
            fcis_index: index(offsets::FCIS_INDEX),
            flis_index: index(offsets::FLIS_INDEX),
            srcs_index: index(offsets::SRCS_INDEX),
            srcs_count: be_u32(header, offsets::SRCS_COUNT).unwrap_or(0),
            datp_index: index(offsets::DATP_INDEX),
        })
    }

    pub fn has_exth(&self) -> bool {
        self.exth_flags & EXTH_PRESENT != 0
    }

    /// Offset of the EXTH block within record 0.
    pub fn exth_offset(&self) -> usize {
        offsets::MOBI_HEADER_BASE + self.header_length as usize
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption != 0
    }
}

/// Structural queries about the MOBI header stored in one section.
#[derive(Debug)]
pub struct HeaderInspector<'d, 'a> {
    db: &'d PalmDb<'a>,
    index: usize,
    header: MobiHeader,
}

impl<'d, 'a> HeaderInspector<'d, 'a> {
    pub fn new(db: &'d PalmDb<'a>, index: usize) -> Result<Self> {
        let record = db.section(index)?;
        if db.ident() == Ident::BOOKMOBI && record.len() < offsets::FIXED_END {
            return Err(Error::InvalidMobi(format!(
                "section {index} is too short for a MOBI header ({} bytes)",
                record.len()
            )));
        }
        let header = MobiHeader::parse(record)?;
        debug!(
            index,
            version = header.mobi_version,
            encryption = header.encryption,
            "decoded MOBI header"
        );
        Ok(Self { db, index, header })
    }

    pub fn header(&self) -> &MobiHeader {
        &self.header
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn version(&self) -> u32 {
        self.header.mobi_version
    }

    pub fn is_encrypted(&self) -> bool {
        self.header.is_encrypted()
    }

    /// Print Replica books store a `%MOP` record right after the header.
    pub fn is_print_replica(&self) -> bool {
        self.db
            .section(self.index + 1)
            .is_ok_and(|next| next.starts_with(PRINT_REPLICA_MARKER))
    }

    /// Standalone KF8: either a KF8 header found past section 0, or a version 8 header.
    pub fn is_kf8(&self) -> bool {
        self.index != 0 || self.header.mobi_version == 8
    }

    /// Joint MOBI7/KF8 book: a `BOUNDARY` section exists and this header is not KF8.
    pub fn is_joint_file(&self) -> bool {
        self.header.mobi_version != 8 && self.db.find_boundary().is_some()
    }
}
