use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use indicatif::{ProgressBar, ProgressStyle};
use sd_recovery_core::{
    collect_doctor_info, describe_device, device_inventory, human_bytes, ConfirmationSummary,
    Confirmer, DeviceSafetyChecker, Diskutil, ErrorKind, PhotoRec, RecoveryContext,
    RecoveryError, RecoveryOptions, RecoveryPolicy, RecoverySessionMachine, SessionReport,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "sd-recovery",
    version,
    about = "Recover deleted JPEG images from SD cards and disk images with PhotoRec."
)]
struct Cli {
    /// Raise the default log level to debug (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List devices and whether they pass the safety checks.
    Devices(DevicesArgs),
    /// Recover JPEG images from a device or disk image.
    Recover(RecoverArgs),
    /// Verify PhotoRec is installed and report its version.
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct PolicyArgs {
    /// JSON policy file with heuristic thresholds.
    #[arg(long, value_name = "FILE")]
    policy: Option<PathBuf>,

    /// Largest device (in GB) considered removable media.
    #[arg(long, value_name = "GB")]
    max_size_gb: Option<u64>,
}

#[derive(Debug, Args)]
struct DevicesArgs {
    #[command(flatten)]
    policy: PolicyArgs,

    /// Print the inventory as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct RecoverArgs {
    /// Device path (e.g. /dev/disk4) or disk image (.img, .dmg, .iso).
    target: String,

    /// Output directory. Defaults to ./recovered_<timestamp>.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Paranoid scan: slower, recovers more fragments.
    #[arg(long)]
    thorough: bool,

    /// Skip JPEG validation of recovered files.
    #[arg(long)]
    no_validate: bool,

    /// Override failed safety checks and skip confirmation. Dangerous.
    #[arg(long)]
    force: bool,

    /// Skip the confirmation prompt.
    #[arg(short, long)]
    yes: bool,

    /// PhotoRec binary to use instead of searching PATH.
    #[arg(long, value_name = "PATH")]
    photorec: Option<PathBuf>,

    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// PhotoRec binary to use instead of searching PATH.
    #[arg(long, value_name = "PATH")]
    photorec: Option<PathBuf>,
}

struct PromptConfirmer;

impl Confirmer for PromptConfirmer {
    fn confirm(&self, summary: &ConfirmationSummary) -> bool {
        println!("\n{}", summary.render());
        match Confirm::new()
            .with_prompt("Proceed with recovery?")
            .default(false)
            .interact()
        {
            Ok(answer) => answer,
            Err(err) => {
                warn!(%err, "confirmation prompt failed");
                false
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Devices(args) => run_devices_command(args),
        Commands::Recover(args) => run_recover_command(args),
        Commands::Check(args) => Ok(run_check_command(args)),
    }
}

fn run_devices_command(args: DevicesArgs) -> Result<i32> {
    let policy = load_policy(&args.policy)?;
    let ctx = RecoveryContext::new(policy);
    let checker = DeviceSafetyChecker::from_policy(ctx.policy());
    let inventory = device_inventory(&Diskutil::new(&ctx), &checker)?;

    if args.json {
        let payload =
            serde_json::to_string_pretty(&inventory).context("failed to serialize devices")?;
        println!("{payload}");
        return Ok(0);
    }

    if inventory.is_empty() {
        println!("No devices found.");
        return Ok(0);
    }
    println!("Detected devices: {}", inventory.len());
    for entry in &inventory {
        println!();
        println!("{}", describe_device(&entry.device));
        match &entry.verdict.reason {
            None => println!("Safety: OK"),
            Some(reason) => println!("Safety: UNSAFE ({reason})"),
        }
    }
    Ok(0)
}

fn run_recover_command(args: RecoverArgs) -> Result<i32> {
    let policy = load_policy(&args.policy)?;
    let cancel_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&cancel_flag);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;
    let ctx = RecoveryContext::with_cancel_flag(policy, cancel_flag);

    let photorec = match PhotoRec::locate(args.photorec.as_deref(), &ctx) {
        Ok(photorec) => photorec,
        Err(err) => return Ok(report_failure(&err)),
    };
    match photorec.version() {
        Ok(version) => info!(%version, path = %photorec.binary().display(), "using PhotoRec"),
        Err(err) => warn!(%err, "could not determine PhotoRec version"),
    }

    if args.force {
        warn!("--force given: safety checks may be overridden and confirmation is skipped");
    }
    let options = RecoveryOptions {
        target: args.target,
        output_dir: args.output,
        thorough: args.thorough,
        validate: !args.no_validate,
        override_safety: args.force,
        skip_confirmation: args.force || args.yes,
        ..RecoveryOptions::default()
    };

    let devices = Diskutil::new(&ctx);
    let confirmer = PromptConfirmer;
    let mut machine = RecoverySessionMachine::new(&ctx, options, &devices, &photorec, &confirmer)
        .with_progress(print_progress)
        .with_file_progress(organize_progress());
    let code = match machine.run() {
        Ok(report) => {
            print_report(&report);
            0
        }
        Err(err) => report_failure(&err),
    };
    Ok(code)
}

fn run_check_command(args: CheckArgs) -> i32 {
    let ctx = RecoveryContext::default();
    let info = collect_doctor_info(args.photorec.as_deref(), &ctx);
    println!("OS: {} ({})", info.os, info.arch);
    let code = match &info.tool {
        Some(tool) => {
            println!("PhotoRec: {} (version {})", tool.path, tool.version);
            0
        }
        None => {
            println!("PhotoRec: not available");
            1
        }
    };
    for note in info.notes {
        println!("Note: {note}");
    }
    code
}

fn load_policy(args: &PolicyArgs) -> Result<RecoveryPolicy> {
    let mut policy = match &args.policy {
        Some(path) => RecoveryPolicy::load(path)?,
        None => RecoveryPolicy::default(),
    };
    if let Some(max_size_gb) = args.max_size_gb {
        policy.max_device_size_gb = max_size_gb;
    }
    policy.validate()?;
    Ok(policy)
}

fn print_progress(line: &str) {
    if line.contains("Pass") || line.contains('%') {
        println!("  {line}");
    }
}

/// The bar is created on the first tick, once the file count is known.
fn organize_progress() -> impl FnMut(usize, usize) {
    let mut bar: Option<ProgressBar> = None;
    move |done, total| {
        let bar = bar.get_or_insert_with(|| {
            let bar = ProgressBar::new(total as u64);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("[Organize] [{bar:40.yellow/black}] {pos}/{len} files")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
            );
            bar
        });
        bar.set_position(done as u64);
        if done >= total {
            bar.finish();
        }
    }
}

fn print_report(report: &SessionReport) {
    let counts = &report.counts;
    println!();
    println!("Recovery complete! Output: {}", report.output_dir.display());
    println!("PhotoRec reported {} file(s).", report.files_reported);
    println!(
        "Organized {} file(s): {} valid, {} suspicious, {} invalid, {} total.",
        counts.total,
        counts.valid,
        counts.suspicious,
        counts.invalid,
        human_bytes(counts.total_bytes)
    );
    if report.copy_failures > 0 {
        println!("Skipped {} file(s) that could not be copied.", report.copy_failures);
    }
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }
    println!(
        "Summary: {}",
        report_path(&report.output_dir, "recovery_log.txt").display()
    );
}

fn report_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join("metadata").join(name)
}

fn report_failure(err: &RecoveryError) -> i32 {
    match err.kind() {
        ErrorKind::Interrupted => eprintln!("Recovery interrupted by user"),
        ErrorKind::Declined => eprintln!("Recovery cancelled by user"),
        ErrorKind::UnsafeDevice => {
            eprintln!("Recovery failed: {err}");
            eprintln!("Use a disk image file (.img) for testing, or override with --force");
        }
        _ => eprintln!("Recovery failed: {err}"),
    }
    err.exit_code()
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
