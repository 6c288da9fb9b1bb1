//! barevm CLI tool
//!
//! Runs a raw 64-bit code blob on KVM until it halts.

use std::path::PathBuf;
use std::process;

use clap::Parser;
use log::{info, warn};

use barevm::loader::parse_entry_offset;
use barevm::{ExitDispatcher, LaunchConfig, LaunchReport, Launcher, PagingMode, Result};

#[derive(Parser, Debug)]
#[command(name = "barevm", version)]
#[command(about = "Run a raw x86-64 code blob in long mode on KVM", long_about = None)]
struct Cli {
    /// Raw binary loaded at guest address 0x10000
    #[arg(value_name = "PAYLOAD")]
    payload: PathBuf,

    /// Entry point offset into the payload, in hex (default 0)
    #[arg(value_name = "ENTRY_OFFSET", value_parser = parse_offset)]
    entry_offset: Option<u64>,

    /// Page table layout: huge (1 GiB of 2 MiB pages) or normal (4 KiB pages)
    #[arg(long, value_name = "MODE", default_value = "huge")]
    paging: PagingMode,

    /// Dump registers after every handled exit
    #[arg(long)]
    trace_exits: bool,

    /// Do not dump the top of the stack when the guest stops
    #[arg(long)]
    no_stack_dump: bool,
}

fn parse_offset(s: &str) -> std::result::Result<u64, String> {
    parse_entry_offset(s).map_err(|e| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}

fn run(cli: Cli) -> Result<LaunchReport> {
    match barevm::backend_name() {
        Some(name) if barevm::is_supported() => info!("hypervisor: {name}"),
        Some(name) => warn!("hypervisor: {name} (device node missing)"),
        None => warn!("no hypervisor backend on this platform"),
    }

    let config = LaunchConfig::builder(cli.payload)
        .entry_offset(cli.entry_offset.unwrap_or(0))
        .paging(cli.paging)
        .trace_exits(cli.trace_exits)
        .stack_dump(!cli.no_stack_dump)
        .build()?;

    let mut launcher = Launcher::new(config)?;
    launcher.run(&mut ExitDispatcher::new())
}
