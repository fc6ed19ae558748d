//! Command-line front-end for the isolate sandbox launcher.
//!
//! Owns argument parsing, help text, and verbosity only (§6) — every
//! provisioning decision lives in `isolate_core`. This binary's only job
//! is to read a `Policy`, build a host backend, drive the orchestrator,
//! and report the one-line diagnostic §7 mandates on failure.

mod detect;

use std::path::PathBuf;

use clap::Parser;
use isolate_core::host::HostPrimitives;
use isolate_core::launcher;
use isolate_core::policy::{self, Policy};
use isolate_core::Orchestrator;

const USAGE: &str = "\
usage: isolate [-c FILE] [-v] [-n] <binary> [args...]
       isolate -d <binary> [-o FILE]
       isolate -h

  -c FILE   capability document path (default: <binary>.caps)
  -v        verbose stderr
  -n        dry-run: parse and print the resolved policy, do not provision
  -d        write a draft capability document for <binary>
  -o FILE   output path for -d (default: <binary>.caps)
  -h        this message";

#[derive(Parser, Debug)]
#[command(disable_help_flag = true, disable_version_flag = true)]
struct Cli {
    #[arg(short = 'c')]
    capability_file: Option<PathBuf>,

    #[arg(short = 'v')]
    verbose: bool,

    #[arg(short = 'n')]
    dry_run: bool,

    #[arg(short = 'd')]
    detect: bool,

    #[arg(short = 'o')]
    output: Option<PathBuf>,

    #[arg(short = 'h')]
    help: bool,

    /// `<binary> [args...]`, consumed verbatim starting at the payload.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    rest: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    if cli.help {
        eprintln!("{USAGE}");
        // §6: -h exits non-zero even though it's not an error per se.
        return 1;
    }

    init_tracing(cli.verbose);

    if cli.rest.is_empty() {
        eprintln!("isolate: missing <binary> argument\n{USAGE}");
        return 1;
    }
    let binary_path = PathBuf::from(&cli.rest[0]);

    if cli.detect {
        let output = cli
            .output
            .unwrap_or_else(|| default_capability_path(&binary_path));
        return match detect::write_draft(&binary_path, &output) {
            Ok(()) => {
                eprintln!("isolate: wrote draft capability document to {}", output.display());
                0
            }
            Err(e) => {
                eprintln!("isolate: detection failed: {e}");
                1
            }
        };
    }

    run_sandbox(&cli.rest, cli.capability_file, cli.dry_run)
}

fn run_sandbox(argv: &[String], capability_file: Option<PathBuf>, dry_run: bool) -> i32 {
    let binary_path = PathBuf::from(&argv[0]);
    let capability_path = capability_file.unwrap_or_else(|| default_capability_path(&binary_path));

    let policy = match load_policy(&capability_path) {
        Ok(policy) => policy,
        Err(diagnostic) => {
            eprintln!("isolate: {diagnostic}");
            return 1;
        }
    };

    if dry_run {
        match serde_json::to_string_pretty(&policy) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("isolate: failed to render policy: {e}"),
        }
        return 0;
    }

    if let Err(e) = launcher::check_privilege() {
        eprintln!("isolate: {e}");
        if let Some(suggestion) = e.suggestion() {
            eprintln!("isolate: {suggestion}");
        }
        return 1;
    }

    #[cfg(target_os = "linux")]
    let host: Box<dyn HostPrimitives> = Box::new(isolate_core::host::linux::LinuxHost::new());
    #[cfg(not(target_os = "linux"))]
    let host: Box<dyn HostPrimitives> = Box::new(isolate_core::host::null::NullHost::new());

    let host: &'static dyn HostPrimitives = Box::leak(host);
    let mut orchestrator = Orchestrator::new(host);

    let (ctx, journal) = match orchestrator.provision(&policy, &binary_path) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("isolate: {e}");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("isolate: {suggestion}");
            }
            return 1;
        }
    };
    let journal: &'static isolate_core::journal::Journal = Box::leak(Box::new(journal));

    let guard = match isolate_core::guard::ExitGuard::install(host, journal) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("isolate: failed to install signal guard: {e}");
            journal.rollback(host);
            return 1;
        }
    };

    let cmd = launcher::build_payload_command(host, &ctx, argv);
    let result = launcher::spawn_and_reap_with(cmd, |pid| guard.set_child_pid(pid));

    // The payload has exited (or never started) either way by this
    // point — this is the on-exit reaper: tear the sandbox down exactly
    // once regardless of which of the two outcomes above occurred.
    // Rollback is idempotent, so racing the signal thread here is safe.
    journal.rollback(host);
    guard.disarm();

    match result {
        Ok(status) => launcher::exit_code_from_status(status),
        Err(e) => {
            eprintln!("isolate: {e}");
            1
        }
    }
}

/// Parses the named document; a missing *default* path is a recoverable
/// condition handled before this is called (see [`load_policy`]'s single
/// caller), so this always treats its input as explicit.
fn load_policy(path: &PathBuf) -> Result<Policy, String> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "capability document not found, using default policy");
        return Ok(Policy::default());
    }
    policy::parse_file(path).map_err(|e| e.to_string())
}

fn default_capability_path(binary_path: &PathBuf) -> PathBuf {
    let mut path = binary_path.clone();
    let mut file_name = path.file_name().unwrap_or_default().to_os_string();
    file_name.push(".caps");
    path.set_file_name(file_name);
    path
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}
