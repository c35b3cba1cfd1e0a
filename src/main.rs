//! CLI entry point for `emlxconv`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

use emlxconv::config::{self, Config};
use emlxconv::export::eml::{convert_file_to_path, eml_file_name, ConversionReport};

#[derive(Parser)]
#[command(
    name = "emlxconv",
    version,
    about = "Convert Apple Mail .emlx and .partial.emlx files to .eml"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert containers to .eml files
    Convert {
        /// .emlx or .partial.emlx files
        #[arg(required = true, value_name = "FILES")]
        files: Vec<PathBuf>,
        /// Output directory
        #[arg(short, long)]
        output: PathBuf,
        /// Keep going on missing attachments and failed files
        #[arg(long)]
        ignore_errors: bool,
        /// Skip messages flagged as deleted
        #[arg(long)]
        skip_deleted: bool,
        /// Print a JSON report instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Convert {
            files,
            output,
            ignore_errors,
            skip_deleted,
            json,
        } => cmd_convert(&config, &files, &output, ignore_errors, skip_deleted, json),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "emlxconv.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Outcome of one input file, as reported in `--json` mode.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum FileOutcome {
    Converted {
        source: PathBuf,
        output: PathBuf,
        #[serde(flatten)]
        report: ConversionReport,
    },
    Skipped {
        source: PathBuf,
        reason: String,
    },
    Failed {
        source: PathBuf,
        error: String,
    },
}

/// Convert every file into `output`, one `.eml` per container.
fn cmd_convert(
    config: &Config,
    files: &[PathBuf],
    output: &Path,
    ignore_errors: bool,
    skip_deleted: bool,
    json: bool,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(output)?;

    let mut options = config.convert_options();
    options.tolerant |= ignore_errors;
    options.skip_deleted |= skip_deleted;

    let start = Instant::now();
    let mut outcomes = Vec::with_capacity(files.len());

    for source in files {
        let dest = output.join(eml_file_name(source)?);
        match convert_file_to_path(source, &dest, &options) {
            Ok(report) => {
                for warning in &report.warnings {
                    tracing::warn!(path = %source.display(), "{warning}");
                }
                outcomes.push(FileOutcome::Converted {
                    source: source.clone(),
                    output: dest,
                    report,
                });
            }
            Err(e) if e.is_skip() => {
                tracing::info!(path = %source.display(), "Skipping deleted message");
                outcomes.push(FileOutcome::Skipped {
                    source: source.clone(),
                    reason: e.to_string(),
                });
            }
            Err(e) if options.tolerant => {
                tracing::error!(path = %source.display(), error = %e, "Conversion failed");
                outcomes.push(FileOutcome::Failed {
                    source: source.clone(),
                    error: e.to_string(),
                });
            }
            Err(e) => {
                anyhow::bail!(
                    "{}: {e}\n  (rerun with --ignore-errors to skip failing files)",
                    source.display()
                );
            }
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        print_summary(&outcomes, output, start.elapsed());
    }
    Ok(())
}

/// Print a human-readable summary of a conversion run.
fn print_summary(outcomes: &[FileOutcome], output: &Path, elapsed: std::time::Duration) {
    use humansize::{format_size, BINARY};

    let mut converted = 0usize;
    let mut skipped = 0usize;
    let mut failed = 0usize;
    let mut warnings = 0usize;
    let mut bytes = 0u64;
    for outcome in outcomes {
        match outcome {
            FileOutcome::Converted { report, .. } => {
                converted += 1;
                warnings += report.warnings.len();
                bytes += report.bytes_written;
            }
            FileOutcome::Skipped { .. } => skipped += 1,
            FileOutcome::Failed { .. } => failed += 1,
        }
    }

    println!();
    println!("  {:<20} {}", "Output", output.display());
    println!("  {:<20} {}", "Converted", converted);
    println!("  {:<20} {}", "Skipped (deleted)", skipped);
    println!("  {:<20} {}", "Failed", failed);
    println!("  {:<20} {}", "Warnings", warnings);
    println!("  {:<20} {}", "Written", format_size(bytes, BINARY));
    println!("  {:<20} {:.2?}", "Time", elapsed);

    for outcome in outcomes {
        if let FileOutcome::Failed { source, error } = outcome {
            println!("    {}: {error}", source.display());
        }
    }
    println!();
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "emlxconv", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}
