use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use kdeps::commands::wait::{self, WaitArgs};

#[cfg(all(
	target_os = "linux",
	feature = "mimalloc",
	not(feature = "system-alloc")
))]
#[global_allocator]
static GLOBAL: mimallocator::Mimalloc = mimallocator::Mimalloc;

/// Block until the Kubernetes resources a workload depends on are ready.
///
/// Exits with 0 once every dependency is ready, and with a non-zero code on timeout
/// or error.
#[derive(Parser)]
#[command(name = "kdeps")]
#[command(version = env!("KDEPS_VERSION"))]
struct Cli {
	#[command(flatten)]
	wait: WaitArgs,
}

fn main() -> Result<ExitCode> {
	let cli = Cli::parse();
	wait::run(cli.wait)
}
