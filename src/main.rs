use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use fuzzpatch::{apply_patch_set, read_patch, FileReport, PatchConfig, PatchError};
use log::{error, info, warn, Level, LevelFilter};
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// GNU patch's default fuzz: up to two mismatched context lines per hunk edge.
const DEFAULT_FUZZ: u32 = 2;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    // 2. Call the main logic function.
    //    All complex logic and error handling is inside `run`.
    if let Err(e) = run(args) {
        // 3. Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    // --- Argument Validation ---
    if !args.target_dir.is_dir() {
        return Err(anyhow!(
            "Target directory '{}' not found or is not a directory.",
            args.target_dir.display()
        ));
    }

    setup_logging(&args);

    // --- Patch Parsing ---
    let file = File::open(&args.patch_file)
        .with_context(|| format!("Failed to open patch file '{}'", args.patch_file.display()))?;
    let set = read_patch(file)
        .with_context(|| format!("Failed to read patch file '{}'", args.patch_file.display()))?;

    if set.diffs.is_empty() {
        info!("No file diffs found in the input; nothing to do.");
        return Ok(());
    }

    info!("Found {} file diff(s) to apply.", set.diffs.len());
    if set.is_workspace {
        info!(
            "Workspace patch: {} project group(s), project names become path prefixes.",
            set.projects.len()
        );
    }
    if set.is_git {
        info!("Git-style headers detected (hint: such patches usually need -p1).");
    }
    if args.reverse {
        info!("Applying in reverse.");
    }
    if args.fuzz > 0 {
        info!("Fuzz ceiling: {} context line(s) per hunk edge.", args.fuzz);
    } else {
        info!("Exact matching (fuzz 0).");
    }

    let config = PatchConfig::builder()
        .reversed(args.reverse)
        .fuzz(args.fuzz)
        .ignore_whitespace(args.ignore_whitespace)
        .strip_prefix_segments(args.strip)
        .build();

    // --- Core Patching Logic ---
    let report = apply_patch_set(&set, &args.target_dir, &config, args.dry_run, None);

    let mut success_count = 0;
    let mut fail_count = 0;
    for (path, result) in &report.results {
        match result {
            Ok(file_report) => {
                if file_report.applied_cleanly() {
                    success_count += 1;
                    info!("{} {}", "patched:".green().bold(), path.display());
                } else {
                    fail_count += 1;
                    error!("--- FAILED to apply patch for: {}", path.display());
                    log_failure_details(file_report);
                }
            }
            Err(e) => {
                // A "hard" error occurred (e.g., I/O error, path traversal).
                // Path traversal aborts; everything else is reported per file.
                if matches!(e, PatchError::PathTraversal(_)) {
                    return Err(anyhow!("{}", e)).with_context(|| {
                        format!(
                            "A fatal error occurred while applying patch for: {}",
                            path.display()
                        )
                    });
                }
                fail_count += 1;
                error!("--- ERROR applying patch for {}: {}", path.display(), e);
            }
        }
    }

    // --- Final Summary ---
    info!("\n--- Summary ---");
    info!("Successful files: {}", success_count);
    info!("Failed files:     {}", fail_count);
    if args.dry_run {
        info!("DRY RUN completed. No files were modified.");
    }

    if fail_count > 0 {
        warn!("Review the log for errors. Some files may be in a partially patched state.");
        // Return an error to set a non-zero exit code.
        return Err(anyhow!("Completed with {} failed file(s).", fail_count));
    }

    Ok(())
}

// --- Helper Functions ---

/// Logs why a file did not apply cleanly.
fn log_failure_details(report: &FileReport) {
    if let Some(problem) = &report.problem {
        warn!("  - {}", problem);
    }
    if report.failed_hunks > 0 {
        warn!(
            "  - {}/{} hunk(s) did not match",
            report.failed_hunks, report.total_hunks
        );
    }
    if let Some(rej) = &report.reject_file {
        warn!("  - rejected hunks written to '{}'", rej.display());
    }
}

/// Sets up the global logger with colored output.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };
    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Apply unified, context, or workspace patches to a directory, tolerating drifted context.",
    long_about = "Parses unified diffs, context diffs, and multi-project workspace patches, then applies \
them to a target directory. Hunks whose surrounding context has drifted are still applied when they \
match within the configured fuzz; hunks that fail are written to <file>.rej."
)]
struct Args {
    /// Path to the patch file.
    patch_file: PathBuf,
    /// Path to the target directory to apply the patch in.
    target_dir: PathBuf,
    /// Apply the patch in reverse (undo a previously applied patch).
    #[arg(short = 'R', long = "reverse")]
    reverse: bool,
    /// Maximum mismatched context lines tolerated per hunk edge.
    #[arg(
        short = 'F',
        long,
        default_value_t = DEFAULT_FUZZ,
        help = "Maximum mismatched context lines tolerated per hunk edge. 0 requires exact context."
    )]
    fuzz: u32,
    /// Strip this many leading path segments from patch paths.
    #[arg(short = 'p', long = "strip", default_value_t = 0)]
    strip: usize,
    /// Compare context lines ignoring all whitespace.
    #[arg(long)]
    ignore_whitespace: bool,
    /// If set, show what would be done, but don't modify any files.
    #[arg(
        short = 'n',
        long,
        help = "Show what would be done, but don't modify files."
    )]
    dry_run: bool,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace."
    )]
    verbose: u8,
}
