use clap::{Parser, Subcommand};
use indumpco::repack::{repack_blocks, rewrite_index};
use indumpco::writer::{create_dump, CreateOptions};
use indumpco::extract::extract_dump_to;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "indumpco", version, about = "Incremental dump compressor")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress stdin into a new dump directory
    Create {
        outdir: PathBuf,
        /// Prior dump directories whose blocks may be hard-linked into the new dump
        #[arg(short, long)]
        reuse: Vec<PathBuf>,
        /// File of digests (one per line) stored elsewhere; matching segments
        /// are indexed but not written
        #[arg(long)]
        remote_segs: Option<PathBuf>,
        #[arg(short, long, default_value_t = num_cpus::get())]
        threads: usize,
    },
    /// Restore a dump directory to stdout
    Extract {
        dumpdir: PathBuf,
        /// Extra block directories searched after the dump's own blocks/
        #[arg(short, long)]
        blocks: Vec<PathBuf>,
        #[arg(short, long, default_value_t = num_cpus::get())]
        threads: usize,
    },
    /// Regroup adjacent z-blocks into jointly compressed x-blocks
    Repack {
        index: PathBuf,
        blockdir: PathBuf,
        /// Print an index rewritten to name the x-blocks, instead of repacking
        #[arg(long)]
        rewrite_index: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Cli::parse().command {
        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { outdir, reuse, remote_segs, threads } => {
            let opts = CreateOptions { reuse_dumps: reuse, remote_segs_file: remote_segs, threads };
            let stats = create_dump(std::io::stdin(), &outdir, &opts)?;
            println!(
                "Created: {}  ({} segments: {} new, {} linked, {} remote)",
                outdir.display(),
                stats.segments,
                stats.new_blocks,
                stats.linked_blocks,
                stats.remote_segments,
            );
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { dumpdir, blocks, threads } => {
            let stdout = std::io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            extract_dump_to(&dumpdir, &blocks, threads, &mut out)?;
            out.flush()?;
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack { index, blockdir, rewrite_index: rewrite } => {
            if rewrite {
                let stdout = std::io::stdout();
                let mut out = BufWriter::new(stdout.lock());
                rewrite_index(&index, &blockdir, &mut out)?;
                out.flush()?;
            } else {
                for report in repack_blocks(&index, &blockdir)? {
                    println!(
                        "{}  ratio {:.3}  {}",
                        report.group_sum,
                        report.ratio,
                        if report.repacked { "repacked" } else { "kept" },
                    );
                }
            }
        }
    }

    Ok(())
}
