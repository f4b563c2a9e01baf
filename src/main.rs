use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use diskdiff::volume::host::HostDiskProvider;
use diskdiff::{
    apply_diff, create_diff, ApplyRequest, CompareRequest, ComparisonPolicy, DiskFormat, EngineConfig, PartitionPair,
};

#[derive(Parser)]
#[command(name = "diskdiff", about = "Disk image differ and patcher")]
struct Cli {
    /// Log debug output
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct PartitionArgs {
    /// Compare a single partition index on both sides
    #[arg(long, conflicts_with_all = ["old_partition", "new_partition"])]
    partition: Option<usize>,
    /// Partition index on the old (or base) image
    #[arg(long, requires = "new_partition")]
    old_partition: Option<usize>,
    /// Partition index on the new (or diff) image
    #[arg(long, requires = "old_partition")]
    new_partition: Option<usize>,
}

impl PartitionArgs {
    fn pair(&self) -> Option<PartitionPair> {
        match (self.partition, self.old_partition, self.new_partition) {
            (Some(index), _, _) => Some(PartitionPair::same(index)),
            (None, Some(old), Some(new)) => Some(PartitionPair { old, new }),
            _ => None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the differences between two disk images to a new image
    Compare {
        /// Path to the old (original) image
        #[arg(long)]
        old: PathBuf,
        /// Path to the new (updated) image
        #[arg(long)]
        new: PathBuf,
        /// Output path for the diff image
        #[arg(long, short)]
        output: PathBuf,
        /// Replace the output image if it exists
        #[arg(long)]
        overwrite: bool,
        #[command(flatten)]
        partitions: PartitionArgs,
        /// name-only, date-time-only, binary-only, full or journaled
        #[arg(long, default_value = "date-time-only")]
        policy: ComparisonPolicy,
        /// Container format of the output image (vhd or vhdx)
        #[arg(long, default_value = "vhd")]
        format: DiskFormat,
        /// Unchanged lines kept around each hunk
        #[arg(long, default_value_t = 0)]
        context: usize,
    },
    /// Apply a diff image to a base image
    Apply {
        /// Path to the base image
        #[arg(long)]
        base: PathBuf,
        /// Path to the diff image
        #[arg(long)]
        diff: PathBuf,
        /// Write the result here instead of patching the base in place
        #[arg(long, short)]
        output: Option<PathBuf>,
        /// Create the output as a differencing child of the base
        #[arg(long, requires = "output")]
        differencing: bool,
        #[command(flatten)]
        partitions: PartitionArgs,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let provider = HostDiskProvider::new();

    match cli.command {
        Commands::Compare {
            old,
            new,
            output,
            overwrite,
            partitions,
            policy,
            format,
            context,
        } => {
            println!("Comparing images...");
            println!("  Old: {}", old.display());
            println!("  New: {}", new.display());
            println!("  Output: {}", output.display());
            println!("  Policy: {policy}");

            let request = CompareRequest {
                overwrite,
                partitions: partitions.pair(),
                policy,
                format,
                config: EngineConfig {
                    context_lines: context,
                    ..EngineConfig::default()
                },
                ..CompareRequest::new(&old, &new, &output)
            };

            let start = Instant::now();
            let summary = create_diff(&provider, &request)
                .await
                .with_context(|| format!("Failed to compare {} with {}", old.display(), new.display()))?;
            let elapsed = start.elapsed();

            println!("\nDiff image created successfully!");
            println!("  Partitions: {}", summary.partitions);
            println!("  Files copied: {}", summary.files_copied);
            println!("  Files diffed: {}", summary.files_diffed);
            println!("  Files unchanged: {}", summary.files_dropped);
            println!("  Hives diffed: {}", summary.hives_diffed);
            println!("  Hives relocated: {}", summary.hives_relocated);
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            base,
            diff,
            output,
            differencing,
            partitions,
        } => {
            println!("Applying diff...");
            println!("  Base: {}", base.display());
            println!("  Diff: {}", diff.display());
            if let Some(output) = &output {
                println!("  Output: {}", output.display());
            }

            let request = ApplyRequest {
                output,
                differencing,
                partitions: partitions.pair(),
                ..ApplyRequest::new(&base, &diff)
            };

            let start = Instant::now();
            let summary = apply_diff(&provider, &request)
                .await
                .with_context(|| format!("Failed to apply {} to {}", diff.display(), base.display()))?;
            let elapsed = start.elapsed();

            println!("\nDiff applied successfully!");
            println!("  Target: {}", summary.target.display());
            println!("  Partitions: {}", summary.partitions);
            println!("  Files copied: {}", summary.files_copied);
            println!("  Files patched: {}", summary.files_patched);
            println!("  Files overwritten: {}", summary.files_overwritten);
            println!("  Hives applied: {}", summary.hives_applied);
            println!("  Hives copied: {}", summary.hives_copied);
            if summary.hives_partial > 0 {
                println!("  Hives partially applied: {}", summary.hives_partial);
            }
            if summary.hives_skipped > 0 {
                println!("  Hives skipped: {}", summary.hives_skipped);
            }
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
    }

    Ok(())
}
