use std::io;
use std::path::PathBuf;

use anyhow::*;
use camino::Utf8PathBuf;
use log::*;
use structopt::*;

use fileio::*;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "probe",
    about = "Reads a file through its pipeline (gzip, bzip2, tar, zip) into the void"
)]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Change to the given directory before perfoming any operations.
    #[structopt(short = "C", long)]
    directory: Option<PathBuf>,

    /// Start reading here (negative counts back from the end)
    #[structopt(short, long, default_value = "0", allow_hyphen_values = true)]
    offset: i64,

    /// Stop reading after this many bytes (0 for the rest of the file)
    #[structopt(short, long, default_value = "0")]
    limit: u64,

    /// Ignore the file's extensions
    #[structopt(short, long)]
    raw: bool,

    /// Prints archive members instead of reading them.
    #[structopt(short = "n", long)]
    dry_run: bool,

    /// Check the file's SHA-256 (or a prefix of it) before reading.
    #[structopt(long)]
    sha256: Option<String>,

    #[structopt(name("file"))]
    path: Utf8PathBuf,
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    if let Some(chto) = &args.directory {
        std::env::set_current_dir(chto)
            .with_context(|| format!("Couldn't set working directory to {}", chto.display()))?;
    }

    if let Some(want) = &args.sha256 {
        let (dir, name) = match (args.path.parent(), args.path.file_name()) {
            (Some(dir), Some(name)) => (dir, name),
            _ => bail!("{} doesn't name a file", args.path),
        };
        let dir = if dir.as_str().is_empty() { "." } else { dir.as_str() };
        verify_file(&DirFs::new(dir), name, &[HashChecksum::sha256(want.as_str()).prefix()])
            .with_context(|| format!("Couldn't verify {}", args.path))?;
        info!("{} matches {}", args.path, want);
    }

    let file = OsFile::open(&args.path).with_context(|| format!("Couldn't open {}", args.path))?;
    let options = ReadOptions {
        offset: args.offset,
        limit: args.limit,
        raw: args.raw,
        ..Default::default()
    };
    let mut reader = Reader::open(file, options, true).context("Couldn't build pipeline")?;

    let probed = probe(&mut reader, args.dry_run);
    let closed = reader.close().context("Couldn't close pipeline");
    probed.and(closed)
}

fn probe(reader: &mut Reader, dry_run: bool) -> Result<()> {
    if reader.zip_enabled() {
        let comment = reader.zip_comment()?;
        if !comment.is_empty() {
            info!("Comment: {}", comment);
        }
        for (index, header) in reader.iter_index_zip_files()? {
            println!("{}\t{}", header.size, header.name);
            if dry_run || header.is_dir() {
                continue;
            }
            let mut entry = reader.zip_open_index(index)?;
            io::copy(&mut entry, &mut io::sink())
                .with_context(|| format!("Couldn't read {}", header.name))?;
        }
        return Ok(());
    }

    if reader.tar_enabled() {
        while let Some(header) = reader.tar_next()? {
            println!("{}\t{}", header.size, header.name);
            if dry_run || header.is_dir() {
                continue;
            }
            reader
                .write_to(&mut io::sink())
                .with_context(|| format!("Couldn't read {}", header.name))?;
        }
        return Ok(());
    }

    let read = reader.write_to(&mut io::sink())?;
    println!("{}\t{}", read, reader.stat()?.name);
    Ok(())
}
