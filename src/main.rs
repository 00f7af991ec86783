//! blockscope - disk usage analysis with hard-link-aware accounting.
//!
//! Usage:
//!   blockscope scan [PATH]         Scan a directory and print a usage tree
//!   blockscope export [PATH]       Stream a scan into a JSON dump
//!   blockscope import FILE         Rebuild a tree from a dump ("-" = stdin)
//!   blockscope --help              Show help

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Context, Result};
use tracing_subscriber::EnvFilter;

use blockscope_core::util::blocks_to_bytes;
use blockscope_core::{EntryId, ScanConfig, Tree, TreeBuilder};
use blockscope_dump::{import_file, JsonExporter};
use blockscope_scan::{scan_root, ProgressTracker};

#[derive(Parser)]
#[command(
    name = "blockscope",
    version,
    about = "Terminal disk usage analyzer",
    long_about = "blockscope walks a directory tree, aggregates apparent size and \
                  allocated blocks with correct hard-link accounting, and exchanges \
                  its tree with the version-1.2 JSON dump format."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Scanner options shared by `scan` and `export`.
#[derive(Args, Debug, Clone)]
struct ScanOpts {
    /// Stay on the filesystem of the scanned directory
    #[arg(short = 'x', long)]
    same_fs: bool,

    /// Follow symlinks whose target is not a directory
    #[arg(short = 'L', long)]
    follow_symlinks: bool,

    /// Skip directories tagged with CACHEDIR.TAG
    #[arg(long)]
    exclude_caches: bool,

    /// Skip Linux pseudo-filesystems (procfs, sysfs, cgroup, ...)
    #[arg(long)]
    exclude_kernfs: bool,

    /// Exclude entries matching PATTERN (fnmatch glob, repeatable)
    #[arg(long = "exclude", value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Read exclude patterns from FILE, one per line
    #[arg(long, value_name = "FILE")]
    exclude_from: Option<PathBuf>,

    /// Capture uid/gid/mode/mtime per entry
    #[arg(short = 'e', long)]
    extended: bool,
}

/// Display options shared by `scan` and `import`.
#[derive(Args, Debug, Clone, Copy)]
struct DisplayOpts {
    /// Maximum tree depth to display
    #[arg(short, long, default_value = "3")]
    depth: u32,

    /// Number of entries to show per directory
    #[arg(short = 'n', long, default_value = "10")]
    top: usize,

    /// Rank and total by apparent size instead of disk usage
    #[arg(short, long)]
    apparent: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Scan a directory and print a usage summary
    Scan {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        #[command(flatten)]
        scan: ScanOpts,

        #[command(flatten)]
        display: DisplayOpts,
    },

    /// Scan a directory, streaming the JSON dump as it goes
    Export {
        /// Path to scan
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        scan: ScanOpts,
    },

    /// Read a JSON dump and print a usage summary
    Import {
        /// Dump file, or "-" for stdin
        file: PathBuf,

        #[command(flatten)]
        display: DisplayOpts,
    },
}

fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Scan {
            path,
            scan,
            display,
        } => run_scan(&path, &scan, display),
        Command::Export { path, output, scan } => run_export(&path, output, &scan),
        Command::Import { file, display } => run_import(&file, display),
    }
}

impl ScanOpts {
    fn to_config(&self) -> Result<ScanConfig> {
        let mut patterns = self.exclude.clone();
        if let Some(file) = &self.exclude_from {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Cannot read exclude file {}", file.display()))?;
            patterns.extend(
                text.lines()
                    .filter(|l| !l.is_empty())
                    .map(str::to_string),
            );
        }
        Ok(ScanConfig::builder()
            .same_fs(self.same_fs)
            .follow_symlinks(self.follow_symlinks)
            .exclude_caches(self.exclude_caches)
            .exclude_kernfs(self.exclude_kernfs)
            .exclude_patterns(patterns)
            .extended(self.extended)
            .build()?)
    }
}

/// Scan into memory and print the usage tree.
fn run_scan(path: &PathBuf, opts: &ScanOpts, display: DisplayOpts) -> Result<()> {
    let config = opts.to_config()?;

    eprintln!("Scanning {}...", path.display());
    let mut progress = ProgressTracker::new();
    let mut builder = TreeBuilder::new(config.extended);
    scan_root(path, &mut builder, &config, &mut progress).context("Scan failed")?;
    let tree = builder.finish();

    print_summary(&tree, display, Some(&progress));
    Ok(())
}

/// Scan straight into the dump writer; the tree is never materialized.
fn run_export(path: &PathBuf, output: Option<PathBuf>, opts: &ScanOpts) -> Result<()> {
    let config = opts.to_config()?;

    let out: Box<dyn Write> = match &output {
        Some(p) => Box::new(File::create(p).with_context(|| format!("Cannot create {}", p.display()))?),
        None => Box::new(io::stdout().lock()),
    };
    let mut exporter = JsonExporter::new(BufWriter::new(out)).context("Cannot write dump")?;

    eprintln!("Scanning {}...", path.display());
    let mut progress = ProgressTracker::new();
    scan_root(path, &mut exporter, &config, &mut progress).context("Scan failed")?;
    exporter.finish().context("Cannot write dump")?;

    if let Some(p) = output {
        eprintln!(
            "Exported {} items to {} in {:.2}s",
            progress.items_scanned(),
            p.display(),
            progress.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

/// Rebuild a tree from a dump and print the usage tree.
fn run_import(file: &PathBuf, display: DisplayOpts) -> Result<()> {
    let mut builder = TreeBuilder::new(true);
    import_file(file, &mut builder)
        .with_context(|| format!("Cannot import {}", file.display()))?;
    let tree = builder.finish();

    print_summary(&tree, display, None);
    Ok(())
}

fn print_summary(tree: &Tree, display: DisplayOpts, progress: Option<&ProgressTracker>) {
    let Some(root) = tree.root() else {
        println!("Empty tree.");
        return;
    };
    let total = entry_bytes(tree, root, display.apparent);
    let items = tree
        .entry(root)
        .as_dir()
        .map(|d| d.items)
        .unwrap_or_default();

    println!();
    println!("{}", "─".repeat(60));
    println!(
        " {} - {}",
        String::from_utf8_lossy(tree.entry(root).name()),
        format_size(total)
    );
    println!(" {items} items");
    if let Some(p) = progress {
        println!(" Scanned in {:.2}s", p.elapsed().as_secs_f64());
    }
    println!("{}", "─".repeat(60));
    println!();

    print_node(tree, root, 0, display, total);
}

/// Print a node and its heaviest children with a usage bar.
fn print_node(tree: &Tree, id: EntryId, depth: u32, display: DisplayOpts, total: u64) {
    let entry = tree.entry(id);
    let bytes = entry_bytes(tree, id, display.apparent);
    let ratio = if total > 0 {
        bytes as f64 / total as f64 * 100.0
    } else {
        0.0
    };

    let mut flags = String::new();
    if let Some(f) = entry.as_file() {
        if f.err {
            flags.push_str(" [!]");
        }
        if f.excluded {
            flags.push_str(" [excluded]");
        }
        if f.other_fs {
            flags.push_str(" [other fs]");
        }
        if f.kernfs {
            flags.push_str(" [kernfs]");
        }
    }
    if let Some(d) = entry.as_dir() {
        if d.err {
            flags.push_str(" [!]");
        } else if d.suberr {
            flags.push_str(" [.!]");
        }
    }

    let name = String::from_utf8_lossy(entry.name());
    println!(
        "{}{}{:<40} {:>10} {:>5.1}% {}",
        "  ".repeat(depth as usize),
        if entry.is_dir() { "▼ " } else { "  " },
        truncate(&format!("{}{}", name, if entry.is_dir() { "/" } else { "" }), 40),
        format_size(bytes),
        ratio,
        make_bar(ratio / 100.0, 10) + &flags
    );

    if entry.is_dir() && depth < display.depth {
        let mut children: Vec<EntryId> = tree.children(id).collect();
        children.sort_by(|&a, &b| {
            entry_bytes(tree, b, display.apparent).cmp(&entry_bytes(tree, a, display.apparent))
        });
        let remaining = children.len().saturating_sub(display.top);

        for child in children.into_iter().take(display.top) {
            print_node(tree, child, depth + 1, display, total);
        }
        if remaining > 0 {
            println!("{}  ... and {} more", "  ".repeat((depth + 1) as usize), remaining);
        }
    }
}

fn entry_bytes(tree: &Tree, id: EntryId, apparent: bool) -> u64 {
    let entry = tree.entry(id);
    if apparent {
        entry.size
    } else {
        blocks_to_bytes(entry.blocks)
    }
}

/// Create a simple ASCII bar.
fn make_bar(ratio: f64, width: usize) -> String {
    let filled = (ratio * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}

/// Format size in human-readable form.
fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 1).collect();
        format!("{cut}…")
    }
}
