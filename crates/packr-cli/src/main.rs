use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use packr_hash::HashAlgorithm;
use packr_pack::{Indexer, IndexerOptions};

/// Read size per append; aligned with a comfortable pipe buffer.
const CHUNK_SIZE: usize = 256 * 1024;

#[derive(Parser)]
#[command(
    name = "packr",
    about = "Index a git packfile: write a verified copy and its .idx companion",
    version
)]
struct Cli {
    /// Pack stream to index; "-" reads standard input
    input: PathBuf,

    /// Directory the pack and index files are written into
    #[arg(long, short, default_value = ".")]
    dir: PathBuf,

    /// Hash algorithm (sha1 or sha256)
    #[arg(long, default_value = "sha1")]
    hash: String,

    /// Flush files to stable storage before publishing them
    #[arg(long)]
    fsync: bool,

    /// Report progress counters on standard error
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let algorithm = HashAlgorithm::from_name(&cli.hash)
        .with_context(|| format!("unknown hash algorithm '{}'", cli.hash))?;

    let options = IndexerOptions { algorithm, fsync: cli.fsync, ..Default::default() };
    let mut indexer = Indexer::new(&cli.dir, options)
        .with_context(|| format!("cannot create indexer in '{}'", cli.dir.display()))?;

    if cli.verbose {
        indexer.set_progress_observer(Box::new(|p| {
            eprint!(
                "\rreceived {}/{} objects ({} bytes), indexed {} deltas",
                p.received_objects, p.total_objects, p.received_bytes, p.indexed_deltas
            );
            ControlFlow::Continue(())
        }));
    }

    let mut reader: Box<dyn Read> = if cli.input.as_os_str() == "-" {
        Box::new(io::stdin().lock())
    } else {
        Box::new(
            File::open(&cli.input)
                .with_context(|| format!("cannot open '{}'", cli.input.display()))?,
        )
    };

    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).context("reading pack stream")?;
        if n == 0 {
            break;
        }
        indexer.append(&buf[..n]).context("indexing pack stream")?;
    }

    let name = indexer.commit().context("committing pack")?;
    if cli.verbose {
        eprintln!();
    }
    println!("pack-{name}");

    Ok(())
}
