//! Synthetic Kindle containers for integration tests.
//!
//! Real books are large and copyrighted, so tests assemble minimal ones: a
//! record 0 with the MOBI fields the splitter and classifier read, followed
//! by small marker sections whose bytes are easy to recognise.

#![allow(dead_code)]

use mobikit::mobi::{BOUNDARY_MARKER, EOF_RECORD, NULL_INDEX, PDB_HEADER_LEN, PdbBuilder};

pub const HEADER_LENGTH: u32 = 0x108;
pub const TITLE: &[u8] = b"Joint Book";

pub const IMAGE: &[u8] = b"\xFF\xD8\xFF\xE0 jpeg bytes";
pub const RESC: &[u8] = b"RESC\x00\x00\x00\x10spine data";
pub const FONT: &[u8] = b"FONT\x00\x00\x00\x20font data";
pub const SRCS: &[u8] = b"SRCS\x00\x00\x00\x10PK\x03\x04source zip";

fn put16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn put32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Builder for a record 0 with a full-size MOBI header.
#[derive(Debug, Clone)]
pub struct Record0 {
    pub version: u32,
    pub encryption: u16,
    pub first_resource: u32,
    /// Written at 0xC2 when `fdst` is `None` (MOBI7 layout).
    pub last_content: u16,
    /// Written at 0xC0 when set (KF8 layout).
    pub fdst: Option<u32>,
    pub huff: u32,
    pub fcis: u32,
    pub flis: u32,
    pub datp: u32,
    pub srcs: u32,
    pub srcs_count: u32,
    /// EXTH flags; 0x40 is added when there are EXTH records.
    pub flags: u32,
    pub exth: Vec<(u32, Vec<u8>)>,
    pub title: Vec<u8>,
}

impl Record0 {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            encryption: 0,
            first_resource: NULL_INDEX,
            last_content: 0xFFFF,
            fdst: None,
            huff: NULL_INDEX,
            fcis: NULL_INDEX,
            flis: NULL_INDEX,
            datp: NULL_INDEX,
            srcs: NULL_INDEX,
            srcs_count: 0,
            flags: 0x10,
            exth: Vec::new(),
            title: TITLE.to_vec(),
        }
    }

    pub fn exth(mut self, kind: u32, data: impl AsRef<[u8]>) -> Self {
        self.exth.push((kind, data.as_ref().to_vec()));
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut rec = vec![0u8; 16 + HEADER_LENGTH as usize];
        put16(&mut rec, 0x00, 2);
        put16(&mut rec, 0x08, 2);
        put16(&mut rec, 0x0A, 4096);
        put16(&mut rec, 0x0C, self.encryption);
        rec[0x10..0x14].copy_from_slice(b"MOBI");
        put32(&mut rec, 0x14, HEADER_LENGTH);
        put32(&mut rec, 0x18, 2);
        put32(&mut rec, 0x1C, 65001);
        put32(&mut rec, 0x20, 0x1234_5678);
        put32(&mut rec, 0x24, self.version);
        put32(&mut rec, 0x6C, self.first_resource);
        put32(&mut rec, 0x70, self.huff);
        match self.fdst {
            Some(fdst) => put32(&mut rec, 0xC0, fdst),
            None => {
                put16(&mut rec, 0xC0, 1);
                put16(&mut rec, 0xC2, self.last_content);
            }
        }
        put32(&mut rec, 0xC8, self.fcis);
        put32(&mut rec, 0xD0, self.flis);
        put32(&mut rec, 0xE0, self.srcs);
        put32(&mut rec, 0xE4, self.srcs_count);
        put32(&mut rec, 0x100, self.datp);

        let mut flags = self.flags;
        if !self.exth.is_empty() {
            flags |= 0x40;
            let body_len: usize = self.exth.iter().map(|(_, d)| 8 + d.len()).sum();
            rec.extend_from_slice(b"EXTH");
            rec.extend_from_slice(&((12 + body_len) as u32).to_be_bytes());
            rec.extend_from_slice(&(self.exth.len() as u32).to_be_bytes());
            for (kind, data) in &self.exth {
                rec.extend_from_slice(&kind.to_be_bytes());
                rec.extend_from_slice(&((8 + data.len()) as u32).to_be_bytes());
                rec.extend_from_slice(data);
            }
            while rec.len() % 4 != 0 {
                rec.push(0);
            }
        }
        put32(&mut rec, 0x80, flags);

        let title_offset = rec.len() as u32;
        put32(&mut rec, 0x54, title_offset);
        put32(&mut rec, 0x58, self.title.len() as u32);
        rec.extend_from_slice(&self.title);
        rec.extend_from_slice(&[0, 0]);
        rec
    }
}

/// Assemble a Palm database with the given identifier.
pub fn container(ident: &[u8; 8], sections: &[Vec<u8>]) -> Vec<u8> {
    let mut prefix = vec![0u8; PDB_HEADER_LEN];
    prefix[..10].copy_from_slice(b"Joint_Book");
    prefix[0x3C..0x44].copy_from_slice(ident);
    let mut builder = PdbBuilder::new(prefix, vec![0u8; 2]);
    builder.extend(sections.iter().map(|s| s.as_slice()));
    builder.build().unwrap()
}

/// A single-header BOOKMOBI book: `record0` followed by `rest`.
pub fn standalone(record0: &Record0, rest: &[&[u8]]) -> Vec<u8> {
    let mut sections = vec![record0.build()];
    sections.extend(rest.iter().map(|s| s.to_vec()));
    container(b"BOOKMOBI", &sections)
}

/// A `TEXtREAd` book with a bare 16-byte PalmDOC header.
pub fn textread() -> Vec<u8> {
    let mut header = vec![0u8; 16];
    put16(&mut header, 0, 1);
    put16(&mut header, 8, 1);
    put16(&mut header, 0x0A, 4096);
    container(b"TEXtREAd", &[header, b"plain text".to_vec()])
}

/// Joint MOBI7/KF8 layout:
///
/// ```text
///  0 MOBI7 record 0      9 KF8 record 0
///  1 text               10 text
///  2 text               11 text
///  3 image              12 FDST
///  4 RESC               13 FLIS
///  5 FONT               14 FCIS
///  6 FLIS               15 EOF
///  7 FCIS
///  8 BOUNDARY
/// ```
#[derive(Debug, Clone)]
pub struct JointBook {
    pub mobi7: Record0,
    pub kf8: Record0,
}

pub const KF8_START: usize = 9;

impl JointBook {
    pub fn new() -> Self {
        let mut mobi7 = Record0::new(6)
            .exth(113, b"B00TEST123")
            .exth(121, (KF8_START as u32).to_be_bytes())
            .exth(129, b"kindle:embed:0001");
        mobi7.first_resource = 3;
        mobi7.last_content = 5;
        mobi7.flis = 6;
        mobi7.fcis = 7;
        mobi7.flags = 0x1810;

        let mut kf8 = Record0::new(8)
            .exth(116, 1u32.to_be_bytes())
            .exth(125, 0u32.to_be_bytes())
            .exth(116, 2u32.to_be_bytes());
        kf8.first_resource = 3;
        kf8.fdst = Some(3);
        kf8.flis = 4;
        kf8.fcis = 5;

        Self { mobi7, kf8 }
    }

    pub fn sections(&self) -> Vec<Vec<u8>> {
        vec![
            self.mobi7.build(),
            b"mobi7 text 1".to_vec(),
            b"mobi7 text 2".to_vec(),
            IMAGE.to_vec(),
            RESC.to_vec(),
            FONT.to_vec(),
            b"FLIS\x00\x00\x00\x08mobi7".to_vec(),
            b"FCIS\x00\x00\x00\x14mobi7".to_vec(),
            BOUNDARY_MARKER.to_vec(),
            self.kf8.build(),
            b"kf8 text 1".to_vec(),
            b"kf8 text 2".to_vec(),
            b"FDST\x00\x00\x00\x0Ckf8".to_vec(),
            b"FLIS\x00\x00\x00\x08kf8".to_vec(),
            b"FCIS\x00\x00\x00\x14kf8".to_vec(),
            EOF_RECORD.to_vec(),
        ]
    }

    pub fn build(&self) -> Vec<u8> {
        container(b"BOOKMOBI", &self.sections())
    }
}

impl Default for JointBook {
    fn default() -> Self {
        Self::new()
    }
}

/// A standalone KF8 book without EXTH 501.
pub fn kf8_book() -> Vec<u8> {
    let record0 = Record0::new(8).exth(113, b"B00KF8ONLY");
    standalone(&record0, &[b"kf8 text", EOF_RECORD])
}

/// A standalone MOBI7 book.
pub fn mobi7_book() -> Vec<u8> {
    standalone(&Record0::new(6), &[b"mobi7 text", EOF_RECORD])
}
