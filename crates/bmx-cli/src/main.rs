#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use bmx::{
    BTreeValueIndex, BitPage, BitmapIndex, BitmapPage, BufferPool, BytePageDevice, ColumnStore,
    CompressedBitPage, FileByteDevice, IndexOptions, IndexStats, PageCache, RowId, RowSource,
    ScanEntry,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Flags shared by every command.
#[derive(Debug, Default)]
struct Flags {
    compressed: bool,
    json: bool,
    config: Option<PathBuf>,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Log to stderr, filtered by `RUST_LOG` (errors only when unset).
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };
    let (positional, flags) = split_flags(args)?;

    match command.as_str() {
        "load" => {
            let [data, image] = positional.as_slice() else {
                bail!("load requires <data> <image>");
            };
            load_cmd(Path::new(data), Path::new(image), &flags)
        }
        "query" => {
            let [data, low, high] = positional.as_slice() else {
                bail!("query requires <data> <low> <high>");
            };
            query_cmd(Path::new(data), parse_bound(low), parse_bound(high), &flags)
        }
        "stats" => {
            let [data] = positional.as_slice() else {
                bail!("stats requires <data>");
            };
            stats_cmd(Path::new(data), &flags)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("bmx\n");
    println!("USAGE:");
    println!("  bmx load <data> <image> [--compressed] [--config <file.json>] [--json]");
    println!("  bmx query <data> <low|-> <high|-> [--compressed] [--config <file.json>] [--json]");
    println!("  bmx stats <data> [--compressed] [--config <file.json>] [--json]");
    println!();
    println!("<data> holds one column value per line; the line number is the row id.");
}

fn split_flags(mut args: impl Iterator<Item = String>) -> Result<(Vec<String>, Flags)> {
    let mut positional = Vec::new();
    let mut flags = Flags::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--compressed" => flags.compressed = true,
            "--json" => flags.json = true,
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a path");
                };
                flags.config = Some(PathBuf::from(path));
            }
            other if other.starts_with("--") => bail!("unknown flag: {other}"),
            _ => positional.push(arg),
        }
    }
    Ok((positional, flags))
}

/// `-` leaves a range bound open.
fn parse_bound(raw: &str) -> Option<String> {
    (raw != "-").then(|| raw.to_owned())
}

fn load_options(flags: &Flags) -> Result<IndexOptions> {
    let Some(path) = &flags.config else {
        return Ok(IndexOptions::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config {}", path.display()))
}

/// Column values in line order, paired with their 1-based line numbers.
/// Blank lines carry no value but still advance the row id.
fn read_column(data: &Path) -> Result<Vec<(RowId, String)>> {
    let text = std::fs::read_to_string(data)
        .with_context(|| format!("failed to read data file {}", data.display()))?;
    Ok(text
        .lines()
        .zip(1_u64..)
        .filter(|(line, _)| !line.trim().is_empty())
        .map(|(line, number)| (RowId(number), line.trim().to_owned()))
        .collect())
}

/// Append every row to a fresh column store and index its value.
fn build<P: BitmapPage>(
    data: &Path,
    cache: Box<dyn PageCache>,
    options: IndexOptions,
) -> Result<BitmapIndex<String, P>> {
    let column = read_column(data)?;
    let store = Arc::new(ColumnStore::new(options.column));
    let mut index = BitmapIndex::with_parts(
        cache,
        BTreeValueIndex::new(),
        Arc::clone(&store) as Arc<dyn RowSource>,
        options,
    );
    for (row, value) in column {
        let pos = store.append(row)?;
        index
            .insert(value, pos)
            .with_context(|| format!("failed to index row {row}"))?;
    }
    info!(
        target: "bmx::index",
        rows = store.row_count(),
        values = index.values().len(),
        kind = %P::KIND,
        "column indexed"
    );
    Ok(index)
}

fn in_memory<P: BitmapPage>(data: &Path, options: IndexOptions) -> Result<BitmapIndex<String, P>> {
    let cache = BufferPool::in_memory(options.device, options.cache)?;
    build(data, Box::new(cache), options)
}

fn load_cmd(data: &Path, image: &Path, flags: &Flags) -> Result<()> {
    let options = load_options(flags)?;
    let dev = FileByteDevice::create(image, options.device)
        .with_context(|| format!("failed to create image {}", image.display()))?;
    let cache = Box::new(BufferPool::new(BytePageDevice::new(dev)?, options.cache)?);
    let stats = if flags.compressed {
        persist(&build::<CompressedBitPage>(data, cache, options)?)?
    } else {
        persist(&build::<BitPage>(data, cache, options)?)?
    };
    print_stats(&stats, flags.json)
}

fn persist<P: BitmapPage>(index: &BitmapIndex<String, P>) -> Result<IndexStats> {
    index.validate().context("index failed validation")?;
    index.flush().context("failed to flush image")?;
    Ok(index.stats()?)
}

fn query_cmd(data: &Path, low: Option<String>, high: Option<String>, flags: &Flags) -> Result<()> {
    let options = load_options(flags)?;
    let matches = if flags.compressed {
        collect_matches(&in_memory::<CompressedBitPage>(data, options)?, low, high)?
    } else {
        collect_matches(&in_memory::<BitPage>(data, options)?, low, high)?
    };

    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&matches).context("serialize output")?
        );
    } else {
        for entry in &matches {
            println!("{}\t{}\t{}", entry.value, entry.position, entry.row_id);
        }
        println!("{} matches", matches.len());
    }
    Ok(())
}

fn collect_matches<P: BitmapPage>(
    index: &BitmapIndex<String, P>,
    low: Option<String>,
    high: Option<String>,
) -> Result<Vec<ScanEntry<String>>> {
    let mut scan = index.scan(low, high);
    let mut out = Vec::new();
    while let Some(entry) = scan.get_next()? {
        out.push(entry);
    }
    scan.close();
    Ok(out)
}

fn stats_cmd(data: &Path, flags: &Flags) -> Result<()> {
    let options = load_options(flags)?;
    let stats = if flags.compressed {
        in_memory::<CompressedBitPage>(data, options)?.stats()?
    } else {
        in_memory::<BitPage>(data, options)?.stats()?
    };
    print_stats(&stats, flags.json)
}

fn print_stats(stats: &IndexStats, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(stats).context("serialize output")?
        );
        return Ok(());
    }
    println!("bmx index");
    println!("kind: {}", stats.kind);
    println!("column: {}", stats.column);
    println!("distinct_values: {}", stats.distinct_values);
    println!("pages: {}", stats.pages);
    println!("empty_pages: {}", stats.empty_pages);
    println!("ones: {}", stats.ones);
    println!("max_span: {}", stats.max_span);
    println!(
        "cache: hits={} misses={} evictions={} writebacks={} allocated_pages={}",
        stats.cache.hits,
        stats.cache.misses,
        stats.cache.evictions,
        stats.cache.writebacks,
        stats.cache.allocated_pages
    );
    Ok(())
}
