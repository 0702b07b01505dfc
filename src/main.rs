//! tweakex - Locate and extract injected dylibs from application bundles.
//!
//! Extract the injected libraries of one or more bundles, or list and
//! inspect what an executable links against.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde_json::json;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use tweakex::macho::{cpu_type_from_name, filetype_name, ParsedExecutable, HOST_CPU_TYPE};
use tweakex::util::format_size;
use tweakex::{
    DylibClass, ExtractionConfig, ExtractionCoordinator, ExtractionReport, ExtractionStatus,
    LoadCommandParser,
};

/// Locate and extract injected dylibs from iOS and macOS application bundles.
#[derive(Parser, Debug)]
#[command(name = "tweakex")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy the injected dylibs of one or more bundles to a staging directory
    Extract {
        /// Bundle root directories (e.g. "Payload/Demo.app")
        #[arg(required = true)]
        bundles: Vec<PathBuf>,

        /// Staging root; each bundle gets its own subdirectory
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Architecture preferred in fat executables (e.g. "arm64", "x86_64")
        #[arg(short, long)]
        arch: Option<String>,

        /// Print the reports as JSON
        #[arg(long)]
        json: bool,

        /// Verbosity level (0=quiet, 1=warnings, 2=info, 3=debug)
        #[arg(short, long, default_value = "1")]
        verbosity: u8,

        /// Number of parallel jobs (default: number of CPUs)
        #[arg(short, long)]
        jobs: Option<usize>,
    },

    /// Classify the dylib references of a bundle's main executable
    List {
        /// Bundle root directory
        bundle: PathBuf,

        /// Show system and first-party libraries too
        #[arg(long)]
        all: bool,

        /// Architecture preferred in fat executables
        #[arg(short, long)]
        arch: Option<String>,

        /// Print the classification as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the header, slices and load commands of an executable
    Inspect {
        /// Bundle root directory or Mach-O file
        path: PathBuf,

        /// Architecture preferred in fat executables
        #[arg(short, long)]
        arch: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Extract {
            bundles,
            output,
            arch,
            json,
            verbosity,
            jobs,
        } => {
            setup_logging(verbosity);
            cmd_extract(bundles, output, arch, json, jobs)
        }
        Commands::List {
            bundle,
            all,
            arch,
            json,
        } => {
            setup_logging(1);
            cmd_list(bundle, all, arch, json)
        }
        Commands::Inspect { path, arch } => {
            setup_logging(1);
            cmd_inspect(path, arch)
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Maps an `--arch` value to a CPU type, defaulting to the host's.
fn preferred_cpu(arch: Option<&str>) -> Result<Option<u32>> {
    match arch {
        Some(name) => match cpu_type_from_name(name) {
            Some(cpu) => Ok(Some(cpu)),
            None => bail!("Unknown architecture '{}'", name),
        },
        None => Ok(HOST_CPU_TYPE),
    }
}

fn class_label(class: DylibClass) -> &'static str {
    match class {
        DylibClass::System => "system",
        DylibClass::Injected => "injected",
        DylibClass::FirstParty => "first-party",
        DylibClass::Unresolved(_) => "unresolved",
    }
}

fn cmd_extract(
    bundles: Vec<PathBuf>,
    output: Option<PathBuf>,
    arch: Option<String>,
    json: bool,
    jobs: Option<usize>,
) -> Result<()> {
    let start = Instant::now();

    let mut config = ExtractionConfig::default().with_preferred_cpu(preferred_cpu(arch.as_deref())?);
    if let Some(output) = output {
        config = config.with_staging_root(output);
    }
    info!("Staging root: {}", config.staging_root.display());
    let coordinator = ExtractionCoordinator::new(config);

    // Configure thread pool
    if let Some(n) = jobs {
        rayon::ThreadPoolBuilder::new()
            .num_threads(n)
            .build_global()
            .ok();
    }

    let progress = if json || bundles.len() == 1 {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(bundles.len() as u64)
    };
    progress.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let results: Vec<_> = bundles
        .par_iter()
        .map(|bundle| {
            let result = coordinator.extract_injected_dylibs(bundle);
            progress.inc(1);
            (bundle, result)
        })
        .collect();

    progress.finish_and_clear();

    let failures = results.iter().filter(|(_, r)| r.is_err()).count();

    if json {
        let entries: Vec<_> = results
            .iter()
            .map(|(bundle, result)| match result {
                Ok(report) => json!({ "bundle": bundle, "report": report }),
                Err(e) => json!({ "bundle": bundle, "error": e.to_string() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for (bundle, result) in &results {
            match result {
                Ok(report) => print_report(report),
                Err(e) => error!("{}: {}", bundle.display(), e),
            }
        }
    }

    info!(
        "Processed {}/{} bundles in {:.2}s",
        results.len() - failures,
        results.len(),
        start.elapsed().as_secs_f64()
    );

    if failures > 0 {
        bail!("{} of {} bundles failed", failures, results.len());
    }

    Ok(())
}

fn print_report(report: &ExtractionReport) {
    println!(
        "{} ({}): {} extracted, {} failed, {} unresolved",
        report.bundle.root.display(),
        report.slice.arch_name(),
        report.extracted_count(),
        report.failed_count(),
        report.unresolved.len()
    );

    for dylib in &report.extracted {
        match (&dylib.status, &dylib.destination) {
            (ExtractionStatus::Extracted, Some(destination)) => println!(
                "  {:>8}  {} -> {}",
                format_size(dylib.size),
                dylib.recorded_path,
                destination.display()
            ),
            (ExtractionStatus::Failed(e), _) => println!("  {:>8}  {}", "failed", e),
            (ExtractionStatus::Extracted, None) => {}
        }
    }

    for warning in &report.unresolved {
        println!("  {:>8}  {} ({})", "missing", warning.path, warning.reason);
    }

    if report.extracted_count() > 0 {
        println!("  staging: {}", report.staging_dir.display());
    }
}

fn cmd_list(bundle: PathBuf, all: bool, arch: Option<String>, json: bool) -> Result<()> {
    let coordinator = ExtractionCoordinator::new(
        ExtractionConfig::default().with_preferred_cpu(preferred_cpu(arch.as_deref())?),
    );
    let inspection = coordinator
        .inspect(&bundle)
        .with_context(|| format!("Failed to inspect bundle: {}", bundle.display()))?;

    let shown: Vec<_> = inspection
        .candidates
        .iter()
        .filter(|c| all || matches!(c.class, DylibClass::Injected | DylibClass::Unresolved(_)))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }

    if shown.is_empty() {
        warn!("No injected or unresolved dylibs in {}", bundle.display());
    }

    for candidate in shown {
        let detail = match (candidate.class, &candidate.resolved) {
            (DylibClass::Unresolved(reason), _) => reason.to_string(),
            (_, Some(resolved)) => inspection
                .bundle
                .relative(resolved)
                .unwrap_or(resolved)
                .display()
                .to_string(),
            (_, None) => String::new(),
        };
        println!(
            "{:<12} {:<21} {}  {}",
            class_label(candidate.class),
            candidate.entry.kind.command_name(),
            candidate.entry.path,
            detail
        );
    }

    Ok(())
}

fn cmd_inspect(path: PathBuf, arch: Option<String>) -> Result<()> {
    let cpu = preferred_cpu(arch.as_deref())?;

    let executable_path = if path.is_dir() {
        tweakex::locate_main_executable(&path)
            .with_context(|| format!("Failed to locate executable in: {}", path.display()))?
    } else {
        path
    };

    let parsed = LoadCommandParser::new()
        .with_preferred_cpu(cpu)
        .parse_file(&executable_path)
        .with_context(|| format!("Failed to parse: {}", executable_path.display()))?;

    print_executable(&executable_path, &parsed);
    Ok(())
}

fn print_executable(path: &Path, parsed: &ParsedExecutable) {
    let header = &parsed.header;
    let flags: Vec<_> = header.flags.iter_names().map(|(name, _)| name).collect();

    println!("Mach-O Executable Information");
    println!("=============================");
    println!("Path:         {}", path.display());
    println!("File size:    {}", format_size(parsed.file_size));
    println!("Container:    {}", if parsed.is_fat { "fat" } else { "thin" });
    println!(
        "Architecture: {} ({}-bit, {:?} endian)",
        header.arch_name(),
        if header.is_64 { 64 } else { 32 },
        header.endian
    );
    println!("File type:    {}", filetype_name(header.filetype));
    println!("Commands:     {} ({} bytes)", header.ncmds, header.sizeofcmds);
    println!("Flags:        {}", flags.join(" | "));
    if let Some(install_name) = &parsed.install_name {
        println!("Install name: {}", install_name);
    }

    if parsed.is_fat {
        println!("\nSlices:");
        for (i, slice) in parsed.slices.iter().enumerate() {
            println!(
                "  [{:2}] {:<9} {:#010x} ({:>8}){}",
                i,
                slice.arch_name(),
                slice.offset,
                format_size(slice.size),
                if *slice == parsed.slice { " *" } else { "" }
            );
        }
    }

    if !parsed.rpaths.is_empty() {
        println!("\nSearch paths:");
        for rpath in &parsed.rpaths {
            println!("  {}", rpath);
        }
    }

    println!("\nDylibs:");
    for entry in &parsed.entries {
        println!(
            "  [{:3}] {:<21} {} (current {}, compat {})",
            entry.index,
            entry.kind.command_name(),
            entry.path,
            entry.current_version,
            entry.compatibility_version
        );
    }
}
