//! Classify an input book and run the matching conversion.
//!
//! [`Classification::of`] decides what a file is from its leading bytes and
//! record 0. Each [`BookKind`] maps to exactly one [`Action`], which
//! [`MobiProcessor::process`] carries out.

use std::borrow::Cow;
use std::fmt;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::mobi::{
    ExthMetadata, FormatTag, HeaderInspector, Ident, MobiHeader, PalmDb, add_or_update_exth,
    keys, parse_exth, read_exth, replace_section, split,
};
use crate::tools::{CommandUnpacker, Kindlegen, Unpacker};

const EPUB_MIMETYPE: &str = "application/epub+zip";

/// What an input file turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BookKind {
    EpubArchive,
    /// `TEXtREAd` PalmDOC book.
    LegacyPlainText,
    StandaloneKf8,
    StandaloneMobi7,
    JointMobiKf8,
    PrintReplica,
    Encrypted,
    Unrecognized,
}

/// The work done for each [`BookKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Compile with kindlegen, split, fix up the KF8 half.
    ConvertToAzw3,
    /// Full extraction through the unpacker.
    Unpack,
    /// Write the KF8 book as `<base>.azw3`.
    ExtractAzw3,
    /// Write `MOBI-<base>.mobi` and `KF8-<base>.azw3`.
    SplitJoint,
    /// Unpack, then find the PDF the unpacker produced.
    ExtractPdf,
    Reject,
}

impl BookKind {
    pub fn action(self) -> Action {
        match self {
            BookKind::EpubArchive => Action::ConvertToAzw3,
            BookKind::LegacyPlainText | BookKind::StandaloneMobi7 => Action::Unpack,
            BookKind::StandaloneKf8 => Action::ExtractAzw3,
            BookKind::JointMobiKf8 => Action::SplitJoint,
            BookKind::PrintReplica => Action::ExtractPdf,
            BookKind::Encrypted | BookKind::Unrecognized => Action::Reject,
        }
    }
}

impl fmt::Display for BookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BookKind::EpubArchive => "ePub archive",
            BookKind::LegacyPlainText => "PalmDOC text (TEXtREAd)",
            BookKind::StandaloneKf8 => "KF8 (AZW3)",
            BookKind::StandaloneMobi7 => "MOBI7",
            BookKind::JointMobiKf8 => "joint MOBI7/KF8",
            BookKind::PrintReplica => "Print Replica",
            BookKind::Encrypted => "encrypted (DRM)",
            BookKind::Unrecognized => "unrecognized",
        };
        f.write_str(name)
    }
}

/// The flags computed for a file and the state picked from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: BookKind,
    pub tag: FormatTag,
    /// MOBI version of record 0; 0 when there is no Palm database.
    pub version: u32,
    pub encrypted: bool,
    pub print_replica: bool,
    pub kf8: bool,
    pub joint: bool,
}

impl Classification {
    fn bare(kind: BookKind, tag: FormatTag) -> Self {
        Self {
            kind,
            tag,
            version: 0,
            encrypted: false,
            print_replica: false,
            kf8: false,
            joint: false,
        }
    }

    /// Classify a file from its bytes.
    ///
    /// Zip archives are recognised without building a section table. A Palm
    /// database other than `BOOKMOBI`/`TEXtREAd` is [`BookKind::Unrecognized`];
    /// a malformed one is an error.
    pub fn of(data: &[u8]) -> Result<Self> {
        let tag = FormatTag::sniff(data);
        let ident = match tag {
            FormatTag::ZipArchive => return Ok(Self::bare(BookKind::EpubArchive, tag)),
            FormatTag::PalmDoc(ident) if ident == Ident::BOOKMOBI || ident == Ident::TEXTREAD => {
                ident
            }
            _ => return Ok(Self::bare(BookKind::Unrecognized, tag)),
        };

        let db = PalmDb::parse(data)?;
        let inspector = HeaderInspector::new(&db, 0)?;
        let mut class = Self::bare(BookKind::LegacyPlainText, tag);
        class.version = inspector.version();
        class.encrypted = inspector.is_encrypted();
        if ident == Ident::TEXTREAD {
            return Ok(class);
        }

        class.print_replica = inspector.is_print_replica();
        class.kf8 = inspector.is_kf8();
        class.joint = inspector.is_joint_file();
        class.kind = if class.encrypted {
            BookKind::Encrypted
        } else if class.print_replica {
            BookKind::PrintReplica
        } else if class.joint {
            BookKind::JointMobiKf8
        } else if class.kf8 {
            BookKind::StandaloneKf8
        } else {
            BookKind::StandaloneMobi7
        };
        debug!(?class, "classified book");
        Ok(class)
    }

    /// Why a [`Action::Reject`] book cannot be processed.
    pub fn rejection(&self) -> Option<String> {
        match self.kind {
            BookKind::Encrypted => Some("book is DRM-encrypted".to_string()),
            BookKind::Unrecognized => Some(match self.tag {
                FormatTag::Topaz => "Topaz books are not supported".to_string(),
                FormatTag::PalmDoc(ident) => {
                    format!("unrecognized Kindle/MOBI format (identifier {ident})")
                }
                _ => "unrecognized Kindle/MOBI format".to_string(),
            }),
            _ => None,
        }
    }
}

/// The files an [`Action`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Azw3(PathBuf),
    /// The unpacker wrote into this directory.
    Unpacked(PathBuf),
    Split { mobi7: PathBuf, kf8: PathBuf },
    Pdf(PathBuf),
}

/// Which half of a Kindle book an output file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Mobi7,
    Kf8,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Mobi7 => "mobi",
            OutputFormat::Kf8 => "azw3",
        }
    }
}

/// `<outdir>/<prefix><base>.mobi` or `.azw3`.
pub fn output_path(outdir: &Path, prefix: &str, base: &str, format: OutputFormat) -> PathBuf {
    outdir.join(format!("{prefix}{base}.{}", format.extension()))
}

/// Mark a KF8 container as an ebook (EXTH 501 = `EBOK`).
pub fn amend_kf8(container: &[u8]) -> Result<Vec<u8>> {
    let db = PalmDb::parse(container)?;
    let record0 = add_or_update_exth(db.section(0)?, keys::CONTENT_TYPE, b"EBOK")?;
    replace_section(container, 0, &record0)
}

/// Store `asin` under both EXTH 113 and 504.
pub fn write_asin_kf8(container: &[u8], asin: &[u8]) -> Result<Vec<u8>> {
    let db = PalmDb::parse(container)?;
    let mut record0 = add_or_update_exth(db.section(0)?, keys::ASIN, asin)?;
    record0 = add_or_update_exth(&record0, keys::CDE_ASIN, asin)?;
    replace_section(container, 0, &record0)
}

/// Write through a temporary file in the destination directory, then rename.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    info!(path = %path.display(), bytes = data.len(), "wrote");
    Ok(())
}

/// One input book plus the preferences and tools used to process it.
pub struct MobiProcessor<U = CommandUnpacker> {
    input: PathBuf,
    data: Vec<u8>,
    classification: Classification,
    config: Config,
    unpacker: U,
}

impl MobiProcessor<CommandUnpacker> {
    /// Read and classify `input`, unpacking with the configured program.
    pub fn open(input: impl Into<PathBuf>, config: Config) -> Result<Self> {
        let unpacker = CommandUnpacker::new(&config.unpacker_path);
        Self::with_unpacker(input, config, unpacker)
    }
}

impl<U: Unpacker> MobiProcessor<U> {
    pub fn with_unpacker(input: impl Into<PathBuf>, config: Config, unpacker: U) -> Result<Self> {
        let input = input.into();
        let data = fs::read(&input)?;
        let classification = Classification::of(&data)?;
        info!(input = %input.display(), kind = %classification.kind, "opened book");
        Ok(Self {
            input,
            data,
            classification,
            config,
            unpacker,
        })
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn kind(&self) -> BookKind {
        self.classification.kind
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn unpacker(&self) -> &U {
        &self.unpacker
    }

    /// File name of the input without its extension.
    pub fn base_name(&self) -> Result<String> {
        self.input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .ok_or_else(|| {
                Error::Config(format!("{} has no file name", self.input.display()))
            })
    }

    fn require(&self, allowed: &[BookKind], what: &str) -> Result<()> {
        if allowed.contains(&self.kind()) {
            return Ok(());
        }
        Err(Error::UnsupportedFormat(format!(
            "cannot {what} a {} book",
            self.kind()
        )))
    }

    fn unpack_into(&self, outdir: &Path) -> Result<()> {
        fs::create_dir_all(outdir)?;
        self.unpacker.unpack(
            &self.input,
            outdir,
            self.config.epub_version,
            self.config.use_hd_images,
        )
    }

    /// Unpack a Print Replica book and return the PDF it contained.
    pub fn extract_pdf(&self, outdir: &Path) -> Result<PathBuf> {
        self.require(&[BookKind::PrintReplica], "extract a PDF from")?;
        self.unpack_into(outdir)?;

        let mut pdfs: Vec<PathBuf> = fs::read_dir(outdir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
            })
            .collect();
        pdfs.sort();
        match pdfs.into_iter().next() {
            Some(pdf) => Ok(pdf),
            None => Err(Error::MissingArtifact(
                outdir.join(format!("{}.pdf", self.base_name()?)),
            )),
        }
    }

    /// Full extraction of a MOBI7 or PalmDOC book.
    pub fn unpack_mobi(&self, outdir: &Path) -> Result<()> {
        self.require(
            &[
                BookKind::LegacyPlainText,
                BookKind::StandaloneMobi7,
                BookKind::StandaloneKf8,
                BookKind::JointMobiKf8,
            ],
            "unpack",
        )?;
        self.unpack_into(outdir)
    }

    /// Full extraction that must leave `<outdir>/mobi8/<base>.epub`.
    pub fn unpack_epub(&self, outdir: &Path) -> Result<PathBuf> {
        self.require(
            &[BookKind::StandaloneKf8, BookKind::JointMobiKf8],
            "unpack an ePub from",
        )?;
        self.unpack_into(outdir)?;
        let epub = outdir
            .join("mobi8")
            .join(format!("{}.epub", self.base_name()?));
        if !epub.is_file() {
            return Err(Error::MissingArtifact(epub));
        }
        Ok(epub)
    }

    /// The KF8 container of this book: the KF8 half of a joint file, or the file itself.
    fn kf8_container(&self) -> Result<Cow<'_, [u8]>> {
        match self.kind() {
            BookKind::JointMobiKf8 => Ok(Cow::Owned(split(&self.data)?.into_parts().1)),
            BookKind::StandaloneKf8 => Ok(Cow::Borrowed(&self.data)),
            _ => Err(Error::UnsupportedFormat(format!(
                "{} book has no KF8 part",
                self.kind()
            ))),
        }
    }

    /// Write the KF8 book as `<outdir>/<base>.azw3`.
    pub fn extract_azw3(&self, outdir: &Path) -> Result<PathBuf> {
        let kf8 = amend_kf8(&self.kf8_container()?)?;
        let path = output_path(outdir, "", &self.base_name()?, OutputFormat::Kf8);
        write_atomic(&path, &kf8)?;
        Ok(path)
    }

    /// Split a joint book into `MOBI-<base>.mobi` and `KF8-<base>.azw3`.
    pub fn write_split(&self, outdir: &Path) -> Result<(PathBuf, PathBuf)> {
        self.require(&[BookKind::JointMobiKf8], "split")?;
        let base = self.base_name()?;
        let (mobi7, kf8) = split(&self.data)?.into_parts();
        let kf8 = amend_kf8(&kf8)?;

        let mobi7_path = output_path(outdir, "MOBI-", &base, OutputFormat::Mobi7);
        let kf8_path = output_path(outdir, "KF8-", &base, OutputFormat::Kf8);
        write_atomic(&mobi7_path, &mobi7)?;
        if let Err(e) = write_atomic(&kf8_path, &kf8) {
            // Leave either both halves or neither.
            if let Err(cleanup) = fs::remove_file(&mobi7_path) {
                warn!(path = %mobi7_path.display(), %cleanup, "could not remove MOBI7 half");
            }
            return Err(e);
        }
        Ok((mobi7_path, kf8_path))
    }

    /// Rewrite the input file in place with EXTH 501 set to `EBOK`.
    pub fn amend_azw3(&mut self) -> Result<PathBuf> {
        self.require(&[BookKind::StandaloneKf8], "amend")?;
        let amended = amend_kf8(&self.data)?;
        write_atomic(&self.input, &amended)?;
        self.data = amended;
        Ok(self.input.clone())
    }

    /// Compile an ePub with kindlegen and keep the fixed-up KF8 half as `<outdir>/<base>.azw3`.
    pub fn convert_to_azw3(&self, outdir: &Path) -> Result<PathBuf> {
        self.require(&[BookKind::EpubArchive], "convert")?;
        probe_epub(&self.data)?;
        let kindlegen = Kindlegen::new(self.config.kindlegen()?);
        let base = self.base_name()?;

        fs::create_dir_all(outdir)?;
        let workdir = tempfile::Builder::new()
            .prefix(".mobikit-")
            .tempdir_in(outdir)?;
        let epub = workdir.path().join(format!("{base}.epub"));
        fs::write(&epub, &self.data)?;

        let compiled = kindlegen.compile(&epub, &format!("{base}.mobi"))?;
        let mobi = fs::read(&compiled).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::MissingArtifact(compiled.clone()),
            _ => e.into(),
        })?;

        let class = Classification::of(&mobi)?;
        let kf8 = match class.kind {
            BookKind::JointMobiKf8 => split(&mobi)?.into_parts().1,
            BookKind::StandaloneKf8 => mobi,
            other => {
                return Err(Error::UnsupportedFormat(format!(
                    "kindlegen produced a {other} book"
                )));
            }
        };

        let path = output_path(outdir, "", &base, OutputFormat::Kf8);
        write_atomic(&path, &amend_kf8(&kf8)?)?;
        Ok(path)
    }

    /// The ASIN in EXTH 113, or 504 when 113 is absent.
    pub fn asin(&self) -> Result<Option<String>> {
        let db = PalmDb::parse(&self.data)?;
        let record0 = db.section(0)?;
        let mut values = read_exth(record0, keys::ASIN)?;
        if values.is_empty() {
            values = read_exth(record0, keys::CDE_ASIN)?;
        }
        Ok(values
            .into_iter()
            .next()
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    /// Rewrite the input file in place with `asin` in EXTH 113 and 504.
    ///
    /// Joint books are refused: only the MOBI7 header would change.
    pub fn set_asin(&mut self, asin: &str) -> Result<PathBuf> {
        self.require(
            &[BookKind::StandaloneKf8, BookKind::StandaloneMobi7],
            "set the ASIN of",
        )?;
        let updated = write_asin_kf8(&self.data, asin.as_bytes())?;
        write_atomic(&self.input, &updated)?;
        self.data = updated;
        Ok(self.input.clone())
    }

    /// Decoded EXTH metadata, when record 0 carries an EXTH block.
    pub fn metadata(&self) -> Result<Option<ExthMetadata>> {
        if !matches!(self.classification.tag, FormatTag::PalmDoc(Ident::BOOKMOBI)) {
            return Ok(None);
        }
        let db = PalmDb::parse(&self.data)?;
        let record0 = db.section(0)?;
        let header = MobiHeader::parse(record0)?;
        Ok(parse_exth(record0)?.map(|block| ExthMetadata::from_block(&block, header.encoding)))
    }

    /// Run the action for this book's kind.
    pub fn process(&mut self, outdir: &Path) -> Result<Outcome> {
        let action = self.kind().action();
        debug!(?action, kind = %self.kind(), "processing");
        match action {
            Action::ConvertToAzw3 => self.convert_to_azw3(outdir).map(Outcome::Azw3),
            Action::Unpack => {
                self.unpack_mobi(outdir)?;
                Ok(Outcome::Unpacked(outdir.to_path_buf()))
            }
            Action::ExtractAzw3 => self.extract_azw3(outdir).map(Outcome::Azw3),
            Action::SplitJoint => {
                let (mobi7, kf8) = self.write_split(outdir)?;
                Ok(Outcome::Split { mobi7, kf8 })
            }
            Action::ExtractPdf => self.extract_pdf(outdir).map(Outcome::Pdf),
            Action::Reject => Err(Error::UnsupportedFormat(
                self.classification
                    .rejection()
                    .unwrap_or_else(|| self.kind().to_string()),
            )),
        }
    }
}

/// Check that an ePub is a readable zip with the expected `mimetype` entry.
fn probe_epub(data: &[u8]) -> Result<()> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mimetype = match archive.by_name("mimetype") {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            Some(contents)
        }
        Err(zip::result::ZipError::FileNotFound) => None,
        Err(e) => return Err(e.into()),
    };
    if mimetype.as_deref().map(str::trim) != Some(EPUB_MIMETYPE) {
        warn!(?mimetype, "ePub has no {EPUB_MIMETYPE} mimetype entry");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_one_action() {
        assert_eq!(BookKind::EpubArchive.action(), Action::ConvertToAzw3);
        assert_eq!(BookKind::LegacyPlainText.action(), Action::Unpack);
        assert_eq!(BookKind::StandaloneMobi7.action(), Action::Unpack);
        assert_eq!(BookKind::StandaloneKf8.action(), Action::ExtractAzw3);
        assert_eq!(BookKind::JointMobiKf8.action(), Action::SplitJoint);
        assert_eq!(BookKind::PrintReplica.action(), Action::ExtractPdf);
        assert_eq!(BookKind::Encrypted.action(), Action::Reject);
        assert_eq!(BookKind::Unrecognized.action(), Action::Reject);
    }

    #[test]
    fn test_zip_is_epub_without_table() {
        let class = Classification::of(b"PK\x03\x04 not really a zip").unwrap();
        assert_eq!(class.kind, BookKind::EpubArchive);
        assert_eq!(class.tag, FormatTag::ZipArchive);
        assert!(!class.kf8 && !class.joint && !class.encrypted);
    }

    #[test]
    fn test_topaz_and_short_files_are_unrecognized() {
        let class = Classification::of(b"TPZ0 topaz").unwrap();
        assert_eq!(class.kind, BookKind::Unrecognized);
        assert_eq!(class.rejection().unwrap(), "Topaz books are not supported");

        let class = Classification::of(b"tiny").unwrap();
        assert_eq!(class.kind, BookKind::Unrecognized);
    }

    #[test]
    fn test_unknown_identifier_is_unrecognized() {
        let mut data = vec![0u8; 100];
        data[0x3C..0x44].copy_from_slice(b"DataPlkr");
        let class = Classification::of(&data).unwrap();
        assert_eq!(class.kind, BookKind::Unrecognized);
        assert!(class.rejection().unwrap().contains("DataPlkr"));
    }

    #[test]
    fn test_output_path() {
        let outdir = Path::new("/out");
        assert_eq!(
            output_path(outdir, "MOBI-", "book", OutputFormat::Mobi7),
            PathBuf::from("/out/MOBI-book.mobi")
        );
        assert_eq!(
            output_path(outdir, "", "book", OutputFormat::Kf8),
            PathBuf::from("/out/book.azw3")
        );
    }

    #[test]
    fn test_probe_rejects_non_zip() {
        assert!(matches!(probe_epub(b"PK garbage"), Err(Error::Zip(_))));
    }

    #[test]
    fn test_atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("book.azw3");
        std::fs::write(&path, b"old").unwrap();
        write_atomic(&path, b"new contents").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new contents");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
