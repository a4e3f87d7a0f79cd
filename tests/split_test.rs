//! Joint MOBI7/KF8 splitting on synthetic kindlegen-style books.

mod common;

use common::{FONT, IMAGE, JointBook, KF8_START, RESC, Record0, SRCS, container};
use mobikit::mobi::{
    BOUNDARY_MARKER, EOF_RECORD, HeaderInspector, MobiHeader, NULL_INDEX, PalmDb, keys, read_exth,
};
use mobikit::{BookKind, Classification, Error, split};

fn record0(data: &[u8]) -> Vec<u8> {
    PalmDb::parse(data).unwrap().section(0).unwrap().to_vec()
}

fn exth_u32(record0: &[u8], key: u32) -> Vec<u32> {
    read_exth(record0, key)
        .unwrap()
        .iter()
        .map(|v| u32::from_be_bytes(v[..4].try_into().unwrap()))
        .collect()
}

// ============================================================================
// Both halves
// ============================================================================

#[test]
fn test_split_yields_mobi7_and_kf8() {
    let result = split(&JointBook::new().build()).unwrap();

    let mobi7 = Classification::of(result.result7()).unwrap();
    assert_eq!(mobi7.kind, BookKind::StandaloneMobi7);
    assert_eq!(mobi7.version, 6);
    assert!(!mobi7.joint);

    let kf8 = Classification::of(result.result8()).unwrap();
    assert_eq!(kf8.kind, BookKind::StandaloneKf8);
    assert_eq!(kf8.version, 8);
    assert!(kf8.kf8);
}

#[test]
fn test_split_halves_have_no_boundary() {
    let result = split(&JointBook::new().build()).unwrap();
    for half in [result.result7(), result.result8()] {
        let db = PalmDb::parse(half).unwrap();
        assert_eq!(db.find_boundary(), None);
        assert!(db.sections().all(|s| s != BOUNDARY_MARKER));
    }
}

#[test]
fn test_split_keeps_titles_readable() {
    let result = split(&JointBook::new().build()).unwrap();
    for half in [result.result7(), result.result8()] {
        let header = MobiHeader::parse(&record0(half)).unwrap();
        assert_eq!(header.title, "Joint Book");
    }
}

#[test]
fn test_split_keeps_palm_database_name() {
    let data = JointBook::new().build();
    let result = split(&data).unwrap();
    assert_eq!(PalmDb::parse(result.result7()).unwrap().name(), "Joint_Book");
    assert_eq!(PalmDb::parse(result.result8()).unwrap().name(), "Joint_Book");
}

// ============================================================================
// MOBI7 half
// ============================================================================

#[test]
fn test_mobi7_half_sections() {
    let book = JointBook::new();
    let original = book.sections();
    let result = split(&book.build()).unwrap();
    let db = PalmDb::parse(result.result7()).unwrap();

    // Everything before BOUNDARY, plus a fresh EOF record.
    assert_eq!(db.num_sections(), KF8_START);
    assert_eq!(db.section(KF8_START - 1).unwrap(), EOF_RECORD);
    for i in [1, 2, 3, 6, 7] {
        assert_eq!(db.section(i).unwrap(), original[i].as_slice(), "section {i}");
    }
    assert_eq!(db.section(3).unwrap(), IMAGE);
}

#[test]
fn test_mobi7_half_drops_kf8_resources() {
    let result = split(&JointBook::new().build()).unwrap();
    let db = PalmDb::parse(result.result7()).unwrap();
    assert!(db.section(4).unwrap().is_empty());
    assert!(db.section(5).unwrap().is_empty());
}

#[test]
fn test_mobi7_half_exth_fixups() {
    let result = split(&JointBook::new().build()).unwrap();
    let rec0 = record0(result.result7());

    assert_eq!(exth_u32(&rec0, keys::KF8_BOUNDARY), vec![NULL_INDEX]);
    assert_eq!(read_exth(&rec0, keys::KF8_COVER_URI).unwrap(), vec![Vec::<u8>::new()]);
    assert_eq!(read_exth(&rec0, keys::ASIN).unwrap(), vec![b"B00TEST123".to_vec()]);

    let header = MobiHeader::parse(&rec0).unwrap();
    assert_eq!(header.exth_flags, 0x1850 & 0x07FF);
    assert!(header.has_exth());
}

#[test]
fn test_mobi7_half_without_eof_stays_without() {
    let book = JointBook::new();
    let mut sections = book.sections();
    sections.pop();
    let result = split(&container(b"BOOKMOBI", &sections)).unwrap();
    let db = PalmDb::parse(result.result7()).unwrap();
    assert_eq!(db.num_sections(), KF8_START - 1);
}

#[test]
fn test_mobi7_half_drops_source_archive() {
    // A declared count running past BOUNDARY only empties what lies before it.
    for count in [1, 100] {
        let mut book = JointBook::new();
        book.mobi7.srcs = 8;
        book.mobi7.srcs_count = count;
        let mut sections = book.sections();
        sections.insert(8, SRCS.to_vec());
        let result = split(&container(b"BOOKMOBI", &sections)).unwrap();

        let db = PalmDb::parse(result.result7()).unwrap();
        assert_eq!(db.num_sections(), KF8_START + 1);
        assert!(db.section(8).unwrap().is_empty());
        assert!(db.section(6).unwrap().starts_with(b"FLIS"));
        assert!(db.section(7).unwrap().starts_with(b"FCIS"));
        assert_eq!(db.section(KF8_START).unwrap(), EOF_RECORD);

        let header = MobiHeader::parse(db.section(0).unwrap()).unwrap();
        assert_eq!(header.srcs_index, NULL_INDEX);
        assert_eq!(header.srcs_count, 0);
        assert_eq!(header.flis_index, 6);

        for half in [result.result7(), result.result8()] {
            let db = PalmDb::parse(half).unwrap();
            assert!(db.sections().all(|s| !s.starts_with(b"SRCS")));
        }
    }
}

#[test]
fn test_mobi7_half_without_source_archive_keeps_fields() {
    let result = split(&JointBook::new().build()).unwrap();
    let header = MobiHeader::parse(&record0(result.result7())).unwrap();
    assert_eq!(header.srcs_index, NULL_INDEX);
    assert_eq!(header.srcs_count, 0);
}

// ============================================================================
// KF8 half
// ============================================================================

#[test]
fn test_kf8_half_receives_shared_resources() {
    let result = split(&JointBook::new().build()).unwrap();
    let db = PalmDb::parse(result.result8()).unwrap();

    assert_eq!(db.num_sections(), 10);
    assert_eq!(db.section(1).unwrap(), b"kf8 text 1");
    assert_eq!(db.section(3).unwrap(), IMAGE);
    assert_eq!(db.section(4).unwrap(), RESC);
    assert_eq!(db.section(5).unwrap(), FONT);
    assert!(db.section(6).unwrap().starts_with(b"FDST"));
    assert_eq!(db.section(9).unwrap(), EOF_RECORD);
}

#[test]
fn test_kf8_half_indices_shifted() {
    let result = split(&JointBook::new().build()).unwrap();
    let db = PalmDb::parse(result.result8()).unwrap();
    let header = MobiHeader::parse(db.section(0).unwrap()).unwrap();

    assert_eq!(header.first_resource_index, 3);
    assert_eq!(header.fdst_index, 6);
    assert_eq!(header.flis_index, 7);
    assert_eq!(header.fcis_index, 8);
    assert_eq!(header.datp_index, NULL_INDEX);
    assert_eq!(header.huff_record_index, NULL_INDEX);

    assert!(db.section(header.fdst_index as usize).unwrap().starts_with(b"FDST"));
    assert!(db.section(header.flis_index as usize).unwrap().starts_with(b"FLIS"));
    assert!(db.section(header.fcis_index as usize).unwrap().starts_with(b"FCIS"));
}

#[test]
fn test_kf8_half_exth_fixups() {
    let result = split(&JointBook::new().build()).unwrap();
    let rec0 = record0(result.result8());

    assert_eq!(exth_u32(&rec0, keys::KF8_RESOURCE_COUNT), vec![3]);
    assert_eq!(exth_u32(&rec0, keys::START_OFFSET), vec![2]);

    let header = MobiHeader::parse(&rec0).unwrap();
    assert_eq!(header.exth_flags, 0x50 | 0x0800);
}

#[test]
fn test_resource_range_from_fcis_when_last_content_unknown() {
    let mut book = JointBook::new();
    book.mobi7.last_content = 0xFFFF;
    let result = split(&book.build()).unwrap();
    let db = PalmDb::parse(result.result8()).unwrap();

    // FLIS at 6 ends the range, so 3..=5 are copied as before.
    assert_eq!(db.num_sections(), 10);
    assert_eq!(db.section(5).unwrap(), FONT);
}

#[test]
fn test_no_resources_copied_without_first_resource() {
    let mut book = JointBook::new();
    book.mobi7.first_resource = NULL_INDEX;
    let result = split(&book.build()).unwrap();
    let db = PalmDb::parse(result.result8()).unwrap();

    assert_eq!(db.num_sections(), 7);
    let header = MobiHeader::parse(db.section(0).unwrap()).unwrap();
    assert_eq!(header.fdst_index, 3);
    // Nothing inserted, so EXTH 125 keeps its old value.
    assert_eq!(exth_u32(db.section(0).unwrap(), keys::KF8_RESOURCE_COUNT), vec![0]);
}

// ============================================================================
// Malformed or non-joint input
// ============================================================================

#[test]
fn test_disagreeing_exth_121_still_splits() {
    let mut book = JointBook::new();
    book.mobi7.exth[1].1 = 42u32.to_be_bytes().to_vec();
    let result = split(&book.build()).unwrap();
    let kf8 = Classification::of(result.result8()).unwrap();
    assert_eq!(kf8.version, 8);
}

#[test]
fn test_version_8_header_with_boundary_is_not_joint() {
    let book = JointBook::new();
    let mut sections = book.sections();
    sections[0] = Record0::new(8).build();
    let data = container(b"BOOKMOBI", &sections);

    let db = PalmDb::parse(&data).unwrap();
    let inspector = HeaderInspector::new(&db, 0).unwrap();
    assert!(!inspector.is_joint_file());
    assert!(matches!(split(&data), Err(Error::UnsupportedFormat(_))));
}

#[test]
fn test_boundary_as_last_section_is_invalid() {
    let data = container(
        b"BOOKMOBI",
        &[Record0::new(6).build(), b"text".to_vec(), BOUNDARY_MARKER.to_vec()],
    );
    assert!(matches!(split(&data), Err(Error::InvalidMobi(_))));
}

#[test]
fn test_short_kf8_header_is_invalid() {
    let book = JointBook::new();
    let mut sections = book.sections();
    sections[KF8_START] = vec![0u8; 20];
    let data = container(b"BOOKMOBI", &sections);
    assert!(matches!(split(&data), Err(Error::InvalidMobi(_))));
}

#[test]
fn test_kf8_index_overflow_is_invalid() {
    let mut book = JointBook::new();
    book.kf8.fdst = Some(0xFFFF_FFFE);
    assert!(matches!(split(&book.build()), Err(Error::InvalidMobi(_))));
}

#[test]
fn test_textread_cannot_be_split() {
    assert!(matches!(
        split(&common::textread()),
        Err(Error::UnsupportedFormat(_))
    ));
}
