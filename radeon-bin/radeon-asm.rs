// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! radeon-asm: Assemble AMD OpenCL 2.0 binaries from the source radeon-disasm prints.

use anyhow::{Context, Result};
use argh::FromArgs;
use owo_colors::{OwoColorize, Stream};
use radeon_bin::{AssemblerOptions, Error, GpuDeviceType};
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(FromArgs)]
/// Assemble an AMD OpenCL 2.0 binary
struct Args {
	#[argh(positional)]
	/// assembler source
	file: PathBuf,

	#[argh(option, short = 'o', default = "PathBuf::from(\"a.out\")")]
	/// output binary (default a.out)
	output: PathBuf,

	#[argh(option, short = 'g')]
	/// device type, unless the source names one with .gpu
	gpu_type: Option<String>,

	#[argh(option)]
	/// driver version, unless the source sets one with .driver_version
	driver_version: Option<u32>,

	#[argh(switch, short = 'v')]
	/// log debug output to stderr
	verbose: bool,
}

fn init_logging(verbose: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
	tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_filter(filter))
		.init();
}

fn run(args: &Args) -> Result<bool> {
	let device = match &args.gpu_type {
		Some(name) => Some(GpuDeviceType::from_name(name).with_context(|| format!("unknown GPU device type '{name}'"))?),
		None => None,
	};
	let source = std::fs::read_to_string(&args.file).with_context(|| format!("reading {}", args.file.display()))?;
	let options = AssemblerOptions {
		device,
		driver_version: args.driver_version,
	};
	let file = args.file.display();
	let assembled = match radeon_bin::assemble(&source, &options) {
		Ok(assembled) => assembled,
		Err(Error::Assembly(failure)) => {
			for diagnostic in &failure.diagnostics {
				eprintln!("{file}:{}: {} {}", diagnostic.line, "error:".if_supports_color(Stream::Stderr, |t| t.red()), diagnostic.message);
			}
			return Ok(false);
		}
		Err(error) => return Err(error.into()),
	};
	for warning in &assembled.warnings {
		eprintln!("{file}:{}: {} {}", warning.line, "warning:".if_supports_color(Stream::Stderr, |t| t.yellow()), warning.message);
	}
	std::fs::write(&args.output, &assembled.binary).with_context(|| format!("writing {}", args.output.display()))?;
	Ok(true)
}

fn main() -> ExitCode {
	let args: Args = argh::from_env();
	init_logging(args.verbose);
	match run(&args) {
		Ok(true) => ExitCode::SUCCESS,
		Ok(false) => ExitCode::FAILURE,
		Err(error) => {
			eprintln!("{}: {error:#}", "error".if_supports_color(Stream::Stderr, |t| t.red()));
			ExitCode::FAILURE
		}
	}
}
