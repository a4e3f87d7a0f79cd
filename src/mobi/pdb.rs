//! PalmDB container: section table parsing and reassembly.
//!
//! A MOBI file is a Palm database. The first 78 bytes hold the database name,
//! attributes, the 8-byte type/creator identifier at 0x3C and the section
//! count at 76. An array of 8-byte entries (offset, attributes/unique id)
//! follows, then a short gap, then the sections themselves.

use std::borrow::Cow;
use std::fmt;
use std::ops::Range;

use bstr::BStr;
use tracing::debug;

use crate::error::{Error, Result};

/// Length of the fixed PalmDB header that precedes the section table.
pub const PDB_HEADER_LEN: usize = 78;

const IDENT_OFFSET: usize = 0x3C;
const UNIQUE_ID_SEED: usize = 68;
const NUM_SECTIONS: usize = 76;
const ENTRY_LEN: usize = 8;

/// Content of the section that separates the MOBI7 and KF8 halves of a joint file.
pub const BOUNDARY_MARKER: &[u8; 8] = b"BOUNDARY";

/// Read a big-endian u16, `None` if it would run past the end of `data`.
pub(crate) fn be_u16(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read a big-endian u32, `None` if it would run past the end of `data`.
pub(crate) fn be_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The 8-byte type/creator identifier of a Palm database.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ident(pub [u8; 8]);

impl Ident {
    pub const BOOKMOBI: Ident = Ident(*b"BOOKMOBI");
    pub const TEXTREAD: Ident = Ident(*b"TEXtREAd");

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BStr::new(&self.0))
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({:?})", BStr::new(&self.0))
    }
}

/// What the leading bytes of a file say it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    /// Starts with `PK`: an ePub (or other zip), no section table.
    ZipArchive,
    /// Starts with `TPZ`: Amazon Topaz, not supported.
    Topaz,
    /// A Palm database with the given type/creator identifier.
    PalmDoc(Ident),
    /// Too short to carry an identifier.
    Unrecognized,
}

impl FormatTag {
    pub fn sniff(data: &[u8]) -> Self {
        if data.starts_with(b"PK") {
            return FormatTag::ZipArchive;
        }
        if data.starts_with(b"TPZ") {
            return FormatTag::Topaz;
        }
        match data.get(IDENT_OFFSET..IDENT_OFFSET + 8) {
            Some(ident) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(ident);
                FormatTag::PalmDoc(Ident(bytes))
            }
            None => FormatTag::Unrecognized,
        }
    }
}

/// Section offsets of a Palm database.
///
/// Holds one entry per section plus a trailing entry equal to the file length,
/// so section `i` always spans `offsets[i]..offsets[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionTable {
    offsets: Vec<usize>,
}

impl SectionTable {
    /// Parse and validate the section table of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let count = be_u16(data, NUM_SECTIONS)
            .ok_or_else(|| Error::InvalidMobi("PDB header too short".into()))?
            as usize;

        let table_end = PDB_HEADER_LEN + count * ENTRY_LEN;
        if data.len() < table_end {
            return Err(Error::InvalidMobi(format!(
                "PDB section table truncated ({count} sections, {} bytes)",
                data.len()
            )));
        }

        let mut offsets = Vec::with_capacity(count + 1);
        for i in 0..count {
            let offset = be_u32(data, PDB_HEADER_LEN + i * ENTRY_LEN)
                .ok_or_else(|| Error::InvalidMobi("PDB section table truncated".into()))?;
            offsets.push(offset as usize);
        }
        offsets.push(data.len());

        if let Some(&first) = offsets.first()
            && count > 0
            && first < table_end
        {
            return Err(Error::InvalidMobi(format!(
                "section 0 starts at {first}, inside the section table"
            )));
        }
        for (i, pair) in offsets.windows(2).enumerate() {
            if pair[0] > pair[1] {
                return Err(Error::InvalidMobi(format!(
                    "section {i} offset {} is past the next offset {}",
                    pair[0], pair[1]
                )));
            }
        }

        debug!(sections = count, file_len = data.len(), "parsed section table");
        Ok(Self { offsets })
    }

    pub fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Byte range of section `index`.
    pub fn range(&self, index: usize) -> Result<Range<usize>> {
        if index >= self.len() {
            return Err(Error::InvalidMobi(format!(
                "section {index} out of range ({} sections)",
                self.len()
            )));
        }
        Ok(self.offsets[index]..self.offsets[index + 1])
    }

    /// Length in bytes of section `index`.
    pub fn section_len(&self, index: usize) -> Option<usize> {
        self.range(index).ok().map(|r| r.len())
    }
}

/// A parsed Palm database borrowing the file bytes.
#[derive(Debug, Clone)]
pub struct PalmDb<'a> {
    data: &'a [u8],
    ident: Ident,
    table: SectionTable,
}

impl<'a> PalmDb<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let ident = match FormatTag::sniff(data) {
            FormatTag::PalmDoc(ident) => ident,
            FormatTag::ZipArchive => {
                return Err(Error::UnsupportedFormat(
                    "zip archive has no section table".into(),
                ));
            }
            FormatTag::Topaz => {
                return Err(Error::UnsupportedFormat("Topaz books are not supported".into()));
            }
            FormatTag::Unrecognized => {
                return Err(Error::InvalidMobi("file too short for PDB header".into()));
            }
        };
        let table = SectionTable::parse(data)?;
        Ok(Self { data, ident, table })
    }

    pub fn ident(&self) -> Ident {
        self.ident
    }

    /// Database name (bytes 0-31, null-terminated).
    pub fn name(&self) -> String {
        let name = &self.data[..32];
        let end = name.iter().position(|&b| b == 0).unwrap_or(32);
        String::from_utf8_lossy(&name[..end]).to_string()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn table(&self) -> &SectionTable {
        &self.table
    }

    pub fn num_sections(&self) -> usize {
        self.table.len()
    }

    pub fn section(&self, index: usize) -> Result<&'a [u8]> {
        let range = self.table.range(index)?;
        Ok(&self.data[range])
    }

    pub fn sections(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        (0..self.num_sections()).filter_map(move |i| self.section(i).ok())
    }

    /// The fixed 78-byte header.
    pub fn header_prefix(&self) -> &'a [u8] {
        &self.data[..PDB_HEADER_LEN]
    }

    /// Bytes between the end of the section table and the first section.
    pub fn gap(&self) -> &'a [u8] {
        let table_end = PDB_HEADER_LEN + self.num_sections() * ENTRY_LEN;
        let first = self
            .table
            .range(0)
            .map(|r| r.start)
            .unwrap_or(self.data.len());
        &self.data[table_end..first]
    }

    /// Index of the first 8-byte `BOUNDARY` section, if any.
    pub fn find_boundary(&self) -> Option<usize> {
        (0..self.num_sections()).find(|&i| {
            self.table.section_len(i) == Some(BOUNDARY_MARKER.len())
                && self.section(i).is_ok_and(|s| s == BOUNDARY_MARKER)
        })
    }

    /// All sections as borrowed slices, ready to be edited and reassembled.
    pub fn to_sections(&self) -> Vec<Cow<'a, [u8]>> {
        self.sections().map(Cow::Borrowed).collect()
    }

    /// A builder that reuses this database's header prefix and gap.
    pub fn builder(&self) -> PdbBuilder<'a> {
        PdbBuilder::new(self.header_prefix(), self.gap())
    }
}

/// Assembles a Palm database from a header prefix and a list of sections.
///
/// Offsets are recomputed from scratch and each entry gets unique id `2 * i`,
/// the numbering Kindle tools write.
#[derive(Debug, Clone)]
pub struct PdbBuilder<'a> {
    prefix: Cow<'a, [u8]>,
    gap: Cow<'a, [u8]>,
    sections: Vec<Cow<'a, [u8]>>,
}

impl<'a> PdbBuilder<'a> {
    pub fn new(prefix: impl Into<Cow<'a, [u8]>>, gap: impl Into<Cow<'a, [u8]>>) -> Self {
        Self {
            prefix: prefix.into(),
            gap: gap.into(),
            sections: Vec::new(),
        }
    }

    pub fn push(&mut self, section: impl Into<Cow<'a, [u8]>>) -> &mut Self {
        self.sections.push(section.into());
        self
    }

    pub fn extend<I>(&mut self, sections: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<Cow<'a, [u8]>>,
    {
        self.sections.extend(sections.into_iter().map(Into::into));
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        if self.prefix.len() < PDB_HEADER_LEN {
            return Err(Error::InvalidMobi("PDB header too short".into()));
        }
        let count = self.sections.len();
        let count_u16 = u16::try_from(count)
            .map_err(|_| Error::InvalidMobi(format!("too many sections ({count})")))?;

        let table_end = PDB_HEADER_LEN + count * ENTRY_LEN;
        let body_len: usize = self.sections.iter().map(|s| s.len()).sum();
        let total = table_end + self.gap.len() + body_len;
        if total > u32::MAX as usize {
            return Err(Error::InvalidMobi(format!("container too large ({total} bytes)")));
        }

        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&self.prefix[..PDB_HEADER_LEN]);
        let seed = (2 * count + 1) as u32;
        out[UNIQUE_ID_SEED..UNIQUE_ID_SEED + 4].copy_from_slice(&seed.to_be_bytes());
        out[NUM_SECTIONS..NUM_SECTIONS + 2].copy_from_slice(&count_u16.to_be_bytes());

        let mut offset = table_end + self.gap.len();
        for (i, section) in self.sections.iter().enumerate() {
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&((2 * i) as u32).to_be_bytes());
            offset += section.len();
        }
        out.extend_from_slice(&self.gap);
        for section in &self.sections {
            out.extend_from_slice(section);
        }
        Ok(out)
    }
}

/// Replace section `index` with `section`, shifting every later offset.
pub fn replace_section(data: &[u8], index: usize, section: &[u8]) -> Result<Vec<u8>> {
    let db = PalmDb::parse(data)?;
    db.table.range(index)?;
    let mut sections = db.to_sections();
    sections[index] = Cow::Borrowed(section);
    db.builder().extend(sections).build()
}

/// Make section `index` zero-length while keeping its table entry.
pub fn null_section(data: &[u8], index: usize) -> Result<Vec<u8>> {
    replace_section(data, index, &[])
}

/// Delete the inclusive section range `first..=last`.
pub fn delete_sections(data: &[u8], first: usize, last: usize) -> Result<Vec<u8>> {
    let db = PalmDb::parse(data)?;
    if first > last || last >= db.num_sections() {
        return Err(Error::InvalidMobi(format!(
            "cannot delete sections {first}..={last} of {}",
            db.num_sections()
        )));
    }
    let mut sections = db.to_sections();
    sections.drain(first..=last);
    db.builder().extend(sections).build()
}

/// Copy sections `first..=last` of `source` into `target` before section `at`.
pub fn insert_sections(
    source: &[u8],
    first: usize,
    last: usize,
    target: &[u8],
    at: usize,
) -> Result<Vec<u8>> {
    let src = PalmDb::parse(source)?;
    let dst = PalmDb::parse(target)?;
    if first > last || last >= src.num_sections() || at > dst.num_sections() {
        return Err(Error::InvalidMobi(format!(
            "cannot insert sections {first}..={last} at {at}"
        )));
    }
    let mut sections = dst.to_sections();
    let inserted = (first..=last)
        .map(|i| src.section(i).map(Cow::Borrowed))
        .collect::<Result<Vec<_>>>()?;
    sections.splice(at..at, inserted);
    dst.builder().extend(sections).build()
}
