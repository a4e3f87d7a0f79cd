//! # mobikit
//!
//! Inspect, edit and split Kindle MOBI/KF8 container files.
//!
//! ## Features
//!
//! - Read the Palm database section table and MOBI headers of `.mobi`/`.azw3` files
//! - Read, add, overwrite and delete EXTH metadata records
//! - Split joint MOBI7/KF8 books (kindlegen output) into two standalone books
//! - Classify an input file and run the matching conversion, using kindlegen
//!   and a KindleUnpack-compatible unpacker where needed
//!
//! ## Quick Start
//!
//! ```no_run
//! use mobikit::{amend_kf8, split};
//!
//! let joint = std::fs::read("book.mobi")?;
//! let (mobi7, kf8) = split(&joint)?.into_parts();
//! std::fs::write("MOBI-book.mobi", mobi7)?;
//! std::fs::write("KF8-book.azw3", amend_kf8(&kf8)?)?;
//! # Ok::<(), mobikit::Error>(())
//! ```
//!
//! ## Processing a file
//!
//! ```no_run
//! use std::path::Path;
//! use mobikit::{Config, MobiProcessor};
//!
//! let mut book = MobiProcessor::open("book.azw3", Config::default())?;
//! println!("{}", book.kind());
//! book.process(Path::new("out"))?;
//! # Ok::<(), mobikit::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod mobi;
pub mod processor;
pub mod tools;

pub use config::{Config, EpubVersion};
pub use error::{Error, Result};
pub use mobi::{
    ExthBlock, ExthMetadata, FormatTag, HeaderInspector, MobiHeader, PalmDb, SplitResult,
    add_exth, add_or_update_exth, read_exth, split, write_exth,
};
pub use processor::{
    Action, BookKind, Classification, MobiProcessor, Outcome, OutputFormat, amend_kf8,
    output_path, write_asin_kf8,
};
pub use tools::{CommandUnpacker, Kindlegen, Unpacker};
