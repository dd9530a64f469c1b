//! DocStore CLI - load, inspect and query segment files

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use docstore_core::executor::ThreadPoolExecutor;
use docstore_core::index::IndexFile;
use docstore_core::{Lid, LidInfo, WriteableFileChunk, WriterConfig};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "docstore", version, about = "DocStore segment file tool")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append stdin lines to a segment, one entry per line
    Load {
        #[arg(long)]
        base: PathBuf,
        /// Writer configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the index header and chunk records
    Dump {
        #[arg(long)]
        base: PathBuf,
    },
    /// Print the payload stored for a lid
    Get {
        #[arg(long)]
        base: PathBuf,
        #[arg(long)]
        lid: Lid,
    },
    /// Print segment statistics as JSON
    Stats {
        #[arg(long)]
        base: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let stdout = io::stdout();
    let mut out = io::BufWriter::new(stdout.lock());
    match cli.command {
        Commands::Load { base, config } => {
            let config = match config {
                Some(path) => WriterConfig::from_json_file(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => WriterConfig::default(),
            };
            cmd_load(&base, config, io::stdin().lock(), &mut out)?
        }
        Commands::Dump { base } => cmd_dump(&base, &mut out)?,
        Commands::Get { base, lid } => cmd_get(&base, lid, &mut out)?,
        Commands::Stats { base } => cmd_stats(&base, &mut out)?,
    }
    out.flush()?;
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_segment(base: &Path, config: WriterConfig) -> anyhow::Result<WriteableFileChunk> {
    let executor = Arc::new(ThreadPoolExecutor::new(
        config.compression_threads,
        "docstore-compress",
    )?);
    debug!(threads = executor.threads(), "executor.started");
    let segment = WriteableFileChunk::open(base, 0, config, executor, None)
        .with_context(|| format!("opening segment {}", base.display()))?;
    Ok(segment)
}

/// Open a segment that must already exist
fn open_existing(base: &Path) -> anyhow::Result<WriteableFileChunk> {
    if !idx_path(base).exists() {
        bail!("no segment at {}", base.display());
    }
    open_segment(base, WriterConfig::default())
}

fn idx_path(base: &Path) -> PathBuf {
    let mut path: OsString = base.as_os_str().to_owned();
    path.push(".idx");
    PathBuf::from(path)
}

fn cmd_load(
    base: &Path,
    config: WriterConfig,
    input: impl BufRead,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let segment = open_segment(base, config)?;
    let first_serial = segment.serial_num();

    let mut count = 0u64;
    for (line_no, line) in input.lines().enumerate() {
        let line = line?;
        let lid = Lid::try_from(line_no).context("too many lines for a lid")?;
        segment.append(first_serial + line_no as u64 + 1, lid, line.as_bytes())?;
        count += 1;
    }

    segment.flush(true, segment.serial_num())?;
    segment.freeze()?;
    info!(entries = count, serial_num = segment.serial_num(), "load.done");
    writeln!(
        out,
        "loaded {} entries, {} bytes on disk",
        count,
        segment.disk_footprint()
    )?;
    Ok(())
}

fn cmd_dump(base: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let path = idx_path(base);
    let index =
        IndexFile::read(&path).with_context(|| format!("reading index {}", path.display()))?;

    writeln!(out, "version:     {}", index.header.version)?;
    writeln!(out, "created:     {}", index.header.created.to_rfc3339())?;
    writeln!(out, "description: {}", index.header.description)?;
    if index.valid_len != index.file_len {
        writeln!(
            out,
            "torn tail:   {} of {} bytes valid",
            index.valid_len, index.file_len
        )?;
    }
    writeln!(out, "chunks:      {}", index.records.len())?;
    for record in &index.records {
        let meta = record.meta;
        writeln!(
            out,
            "chunk {:>6}  offset {:>10}  size {:>8}  entries {:>6}  last_serial {}",
            meta.chunk_id, meta.offset, meta.size, meta.entry_count, meta.last_serial
        )?;
    }
    Ok(())
}

fn cmd_get(base: &Path, lid: Lid, out: &mut dyn Write) -> anyhow::Result<()> {
    let segment = open_existing(base)?;
    let mut lid_map: BTreeMap<Lid, LidInfo> = BTreeMap::new();
    segment.update_lid_map(&mut lid_map, 0);

    let Some(info) = lid_map.get(&lid) else {
        bail!("lid {} not found", lid);
    };
    let mut buf = Vec::new();
    match segment.read(lid, *info, &mut buf)? {
        Some(_) => {
            out.write_all(&buf)?;
            writeln!(out)?;
            Ok(())
        }
        None => bail!("lid {} missing from chunk {}", lid, info.chunk_id),
    }
}

fn cmd_stats(base: &Path, out: &mut dyn Write) -> anyhow::Result<()> {
    let segment = open_existing(base)?;
    serde_json::to_writer_pretty(&mut *out, &segment.stats())?;
    writeln!(out)?;
    Ok(())
}
