//! mobikit - Kindle book splitter and fix-up tool

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mobikit::{Config, MobiProcessor, Outcome};

#[derive(Parser)]
#[command(name = "mobikit")]
#[command(version, about = "Inspect, split and fix up Kindle books", long_about = None)]
#[command(after_help = "EXAMPLES:
    mobikit info book.azw3             Show container flags and metadata
    mobikit split book.mobi            Write MOBI-book.mobi and KF8-book.azw3
    mobikit convert book.epub -o out   Compile with kindlegen, keep the KF8 half
    mobikit asin book.azw3 --set B00X  Set the ASIN in place")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Preferences file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress output messages
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show what a file is and its EXTH metadata
    Info { input: PathBuf },
    /// Run the action picked for the file
    Process {
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,
    },
    /// Split a joint MOBI7/KF8 book
    Split {
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,
    },
    /// Write the KF8 part as <name>.azw3, or amend an .azw3 in place
    Azw3 {
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,
        /// Only set the content type of INPUT in place
        #[arg(long)]
        in_place: bool,
    },
    /// Full extraction through the unpacker
    Unpack {
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,
        /// Require the unpacked ePub (KF8 books)
        #[arg(long)]
        epub: bool,
    },
    /// Convert an ePub to AZW3 with kindlegen
    Convert {
        input: PathBuf,
        #[arg(short, long, value_name = "DIR")]
        outdir: Option<PathBuf>,
    },
    /// Print the ASIN, or set it with --set
    Asin {
        input: PathBuf,
        #[arg(long, value_name = "ASIN")]
        set: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> mobikit::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let quiet = cli.quiet;
    let outdir_for = |input: &Path, outdir: Option<PathBuf>| {
        outdir.unwrap_or_else(|| config.output_dir(input))
    };

    match cli.command {
        Command::Info { input } => show_info(&input, config.clone()),
        Command::Process { input, outdir } => {
            let outdir = outdir_for(&input, outdir);
            let mut book = MobiProcessor::open(&input, config.clone())?;
            let outcome = book.process(&outdir)?;
            if !quiet {
                report(&outcome);
            }
            Ok(())
        }
        Command::Split { input, outdir } => {
            let outdir = outdir_for(&input, outdir);
            let book = MobiProcessor::open(&input, config.clone())?;
            let (mobi7, kf8) = book.write_split(&outdir)?;
            if !quiet {
                report(&Outcome::Split { mobi7, kf8 });
            }
            Ok(())
        }
        Command::Azw3 {
            input,
            outdir,
            in_place,
        } => {
            let outdir = outdir_for(&input, outdir);
            let mut book = MobiProcessor::open(&input, config.clone())?;
            let path = if in_place {
                book.amend_azw3()?
            } else {
                book.extract_azw3(&outdir)?
            };
            if !quiet {
                report(&Outcome::Azw3(path));
            }
            Ok(())
        }
        Command::Unpack {
            input,
            outdir,
            epub,
        } => {
            let outdir = outdir_for(&input, outdir);
            let book = MobiProcessor::open(&input, config.clone())?;
            if epub {
                let path = book.unpack_epub(&outdir)?;
                if !quiet {
                    println!("ePub: {}", path.display());
                }
            } else {
                book.unpack_mobi(&outdir)?;
                if !quiet {
                    report(&Outcome::Unpacked(outdir));
                }
            }
            Ok(())
        }
        Command::Convert { input, outdir } => {
            let outdir = outdir_for(&input, outdir);
            let book = MobiProcessor::open(&input, config.clone())?;
            let path = book.convert_to_azw3(&outdir)?;
            if !quiet {
                report(&Outcome::Azw3(path));
            }
            Ok(())
        }
        Command::Asin { input, set } => {
            let mut book = MobiProcessor::open(&input, config.clone())?;
            match set {
                Some(asin) => {
                    book.set_asin(&asin)?;
                    if !quiet {
                        println!("ASIN set to {asin} in {}", input.display());
                    }
                }
                None => match book.asin()? {
                    Some(asin) => println!("{asin}"),
                    None if !quiet => println!("(no ASIN)"),
                    None => {}
                },
            }
            Ok(())
        }
    }
}

fn show_info(path: &Path, config: Config) -> mobikit::Result<()> {
    let book = MobiProcessor::open(path, config)?;
    let class = book.classification();

    println!("File: {}", path.display());
    println!("Kind: {}", class.kind);
    if class.version > 0 {
        println!("MOBI version: {}", class.version);
    }
    println!("Encrypted: {}", class.encrypted);
    println!("Print Replica: {}", class.print_replica);
    println!("KF8: {}", class.kf8);
    println!("Joint MOBI/KF8: {}", class.joint);
    if let Some(reason) = class.rejection() {
        println!("Cannot process: {reason}");
    }

    if let Some(meta) = book.metadata()? {
        if let Some(ref title) = meta.title {
            println!("Title: {title}");
        }
        if !meta.authors.is_empty() {
            println!("Authors: {}", meta.authors.join(", "));
        }
        if let Some(ref publisher) = meta.publisher {
            println!("Publisher: {publisher}");
        }
        if let Some(ref language) = meta.language {
            println!("Language: {language}");
        }
        if let Some(ref asin) = meta.asin {
            println!("ASIN: {asin}");
        }
        if let Some(ref content_type) = meta.content_type {
            println!("Content type: {content_type}");
        }
    }

    Ok(())
}

fn report(outcome: &Outcome) {
    match outcome {
        Outcome::Azw3(path) => println!("AZW3: {}", path.display()),
        Outcome::Unpacked(dir) => println!("Unpacked into {}", dir.display()),
        Outcome::Split { mobi7, kf8 } => {
            println!("MOBI7: {}", mobi7.display());
            println!("KF8: {}", kf8.display());
        }
        Outcome::Pdf(path) => println!("PDF: {}", path.display()),
    }
}
