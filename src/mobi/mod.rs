mod exth;
mod headers;
mod pdb;
mod split;

pub use exth::{
    EXTH_MAGIC, ExthBlock, ExthEdit, ExthMetadata, ExthRecord, add_exth, add_or_update_exth,
    delete_exth, keys, parse_exth, read_exth, write_exth,
};
pub use headers::{
    Compression, EXTH_PRESENT, Encoding, HeaderInspector, MobiHeader, NULL_INDEX,
    PRINT_REPLICA_MARKER, offsets,
};
pub use pdb::{
    BOUNDARY_MARKER, FormatTag, Ident, PDB_HEADER_LEN, PalmDb, PdbBuilder, SectionTable,
    delete_sections, insert_sections, null_section, replace_section,
};
pub use split::{EOF_RECORD, SplitResult, split};
