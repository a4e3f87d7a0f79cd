//! Split a joint MOBI7/KF8 book into two standalone books.
//!
//! Kindlegen output carries both formats in one Palm database: the MOBI7
//! sections, an 8-byte `BOUNDARY` section, then the KF8 sections starting
//! with their own record 0. Images live only in the MOBI7 half and the KF8
//! header addresses them through its first-resource index, so they are copied
//! over when the halves are separated.

use std::borrow::Cow;
use std::ops::RangeInclusive;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::exth::{delete_exth, keys, read_exth, write_exth};
use super::headers::{HeaderInspector, MobiHeader, NULL_INDEX, offsets};
use super::pdb::{Ident, PalmDb, be_u32};

/// The 4-byte record that ends a Kindle book.
pub const EOF_RECORD: &[u8; 4] = b"\xe9\x8e\r\n";

/// Flag bits kept on the MOBI7 half (drops shared-resource and font bits).
const MOBI7_FLAG_MASK: u32 = 0x07FF;
/// Flag bits kept on the KF8 half.
const KF8_FLAG_MASK: u32 = 0x1FFF;
const KF8_SHARED_RESOURCES: u32 = 0x0800;

/// The two books produced by [`split`].
#[derive(Debug, Clone)]
pub struct SplitResult {
    mobi7: Vec<u8>,
    kf8: Vec<u8>,
}

impl SplitResult {
    /// The legacy MOBI7 book.
    pub fn result7(&self) -> &[u8] {
        &self.mobi7
    }

    /// The standalone KF8 (AZW3) book.
    pub fn result8(&self) -> &[u8] {
        &self.kf8
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.mobi7, self.kf8)
    }
}

/// Split a joint MOBI7/KF8 container at its `BOUNDARY` section.
pub fn split(data: &[u8]) -> Result<SplitResult> {
    let db = PalmDb::parse(data)?;
    if db.ident() != Ident::BOOKMOBI {
        return Err(Error::UnsupportedFormat(format!(
            "cannot split a {} book",
            db.ident()
        )));
    }

    let boundary = db.find_boundary().ok_or_else(|| {
        Error::InvalidMobi("no BOUNDARY section, not a joint MOBI/KF8 file".into())
    })?;
    let kf8_start = boundary + 1;
    if boundary == 0 || kf8_start >= db.num_sections() {
        return Err(Error::InvalidMobi(format!(
            "BOUNDARY at section {boundary} of {} leaves no room for both headers",
            db.num_sections()
        )));
    }

    let header = HeaderInspector::new(&db, 0)?.header().clone();
    if header.mobi_version == 8 {
        return Err(Error::UnsupportedFormat(
            "version 8 header: standalone KF8, not a joint file".into(),
        ));
    }
    check_boundary_record(db.section(0)?, kf8_start)?;

    debug!(
        boundary,
        sections = db.num_sections(),
        "splitting joint MOBI/KF8 file"
    );

    let mobi7 = build_mobi7(&db, &header, boundary)?;
    let kf8 = build_kf8(&db, &header, kf8_start)?;
    Ok(SplitResult { mobi7, kf8 })
}

/// EXTH 121 names the KF8 record 0 too; the marker section wins if they disagree.
fn check_boundary_record(record0: &[u8], kf8_start: usize) -> Result<()> {
    let declared = read_exth(record0, keys::KF8_BOUNDARY)?
        .first()
        .and_then(|value| be_u32(value, 0));
    if let Some(declared) = declared
        && declared != NULL_INDEX
        && declared as usize != kf8_start
    {
        warn!(
            declared,
            found = kf8_start,
            "EXTH 121 disagrees with the BOUNDARY section"
        );
    }
    Ok(())
}

/// Sections `first_resource..=last_content` of the MOBI7 half.
///
/// Without a last-content index the range stops before the first of the
/// FCIS/FLIS/DATP/HUFF sections.
fn resource_range(header: &MobiHeader, limit: usize) -> Option<RangeInclusive<usize>> {
    let first = header.first_resource_index;
    if first == NULL_INDEX || first == 0 {
        return None;
    }

    let mut last = u32::from(header.last_content_index);
    if header.last_content_index == 0xFFFF {
        let lowest = [
            header.fcis_index,
            header.flis_index,
            header.datp_index,
            header.huff_record_index,
        ]
        .into_iter()
        .filter(|&index| index > 0 && index < 0xFFFF)
        .min()?;
        last = lowest - 1;
    }

    let first = first as usize;
    let last = (last as usize).min(limit.checked_sub(1)?);
    (first <= last).then_some(first..=last)
}

/// Overwrite a u32 field of the MOBI header when the header is long enough to hold it.
fn patch_u32(record0: &mut [u8], header: &MobiHeader, offset: usize, value: u32) {
    if offset + 4 <= header.exth_offset().min(record0.len()) {
        record0[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }
}

fn build_mobi7(db: &PalmDb<'_>, header: &MobiHeader, boundary: usize) -> Result<Vec<u8>> {
    let mut sections = db.to_sections();
    let ends_with_eof = sections.last().is_some_and(|s| s.as_ref() == EOF_RECORD);
    sections.truncate(boundary);
    if ends_with_eof && sections.last().is_none_or(|s| s.as_ref() != EOF_RECORD) {
        sections.push(Cow::Borrowed(EOF_RECORD));
    }

    let mut record0 = write_exth(&sections[0], keys::KF8_BOUNDARY, &NULL_INDEX.to_be_bytes())?;
    record0 = write_exth(&record0, keys::KF8_COVER_URI, b"")?;
    patch_u32(
        &mut record0,
        header,
        offsets::EXTH_FLAGS,
        header.exth_flags & MOBI7_FLAG_MASK,
    );

    // MOBI7 readers have no use for RESC/FONT; keep the entries so image indices hold.
    if let Some(range) = resource_range(header, boundary) {
        for i in range {
            if sections[i].starts_with(b"RESC") || sections[i].starts_with(b"FONT") {
                debug!(section = i, "dropping KF8-only resource from MOBI7 half");
                sections[i] = Cow::Borrowed(&[]);
            }
        }
    }

    // Kindlegen's copy of the source archive. Emptied rather than removed so
    // the FLIS/FCIS indices after it stay put.
    if header.srcs_index != NULL_INDEX && header.srcs_count > 0 {
        let first = (header.srcs_index as usize).max(1);
        let end = (header.srcs_index as usize)
            .saturating_add(header.srcs_count as usize)
            .min(boundary);
        if first < end {
            sections[first..end].fill(Cow::Borrowed(&[]));
            debug!(first, end, "dropped SRCS sections from MOBI7 half");
        }
        patch_u32(&mut record0, header, offsets::SRCS_INDEX, NULL_INDEX);
        patch_u32(&mut record0, header, offsets::SRCS_COUNT, 0);
    }

    sections[0] = Cow::Owned(record0);
    db.builder().extend(sections).build()
}

fn build_kf8(db: &PalmDb<'_>, mobi7: &MobiHeader, kf8_start: usize) -> Result<Vec<u8>> {
    let mut sections = db.to_sections().split_off(kf8_start);
    if sections[0].len() < offsets::FIXED_END {
        return Err(Error::InvalidMobi(format!(
            "KF8 header at section {kf8_start} is too short ({} bytes)",
            sections[0].len()
        )));
    }
    let mut record0 = sections[0].to_vec();
    let header = MobiHeader::parse(&record0)?;
    if header.mobi_version != 8 {
        warn!(version = header.mobi_version, "KF8 header does not say version 8");
    }

    let target = header.first_resource_index;
    if let Some(range) = resource_range(mobi7, kf8_start - 1)
        && target != NULL_INDEX
        && target > 0
    {
        let at = target as usize;
        if at <= sections.len() {
            let shared = range
                .clone()
                .map(|i| db.section(i).map(Cow::Borrowed))
                .collect::<Result<Vec<_>>>()?;
            let count = shared.len() as u32;
            sections.splice(at..at, shared);
            debug!(
                first = range.start(),
                last = range.end(),
                at,
                "copied shared resources into KF8 half"
            );

            for (offset, index) in [
                (offsets::FDST_INDEX, header.fdst_index),
                (offsets::FCIS_INDEX, header.fcis_index),
                (offsets::FLIS_INDEX, header.flis_index),
                (offsets::DATP_INDEX, header.datp_index),
                (offsets::HUFF_RECORD, header.huff_record_index),
            ] {
                if index != NULL_INDEX && index >= target {
                    let shifted = index.checked_add(count).ok_or_else(|| {
                        Error::InvalidMobi(format!(
                            "KF8 section index {index:#x} overflows when shifted by {count}"
                        ))
                    })?;
                    patch_u32(&mut record0, &header, offset, shifted);
                }
            }
            record0 = write_exth(&record0, keys::KF8_RESOURCE_COUNT, &count.to_be_bytes())?;
        } else {
            warn!(at, sections = sections.len(), "KF8 first resource index is past the end");
        }
    }

    // Kindlegen sometimes carries the MOBI7 start offset over; the last one is the KF8 one.
    let starts = read_exth(&record0, keys::START_OFFSET)?.len();
    for _ in 1..starts {
        record0 = delete_exth(&record0, keys::START_OFFSET)?;
    }

    patch_u32(
        &mut record0,
        &header,
        offsets::EXTH_FLAGS,
        (header.exth_flags & KF8_FLAG_MASK) | KF8_SHARED_RESOURCES,
    );

    sections[0] = Cow::Owned(record0);
    db.builder().extend(sections).build()
}
