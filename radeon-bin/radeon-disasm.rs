// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! radeon-disasm: Disassemble AMD Catalyst, OpenCL 2.0 and Gallium GPU binaries.

use anyhow::{Context, Result, bail};
use argh::FromArgs;
use owo_colors::{OwoColorize, Stream};
use radeon_bin::{DisasmFlags, DisasmOptions, GpuArchitecture, GpuDeviceType};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

#[derive(FromArgs)]
/// Disassemble AMD GPU compute binaries into assembler source
struct Args {
	#[argh(positional)]
	/// binaries to disassemble
	files: Vec<PathBuf>,

	#[argh(switch, short = 'm')]
	/// print compile options, driver info and kernel metadata
	metadata: bool,

	#[argh(switch, short = 'd')]
	/// dump global and kernel data
	data: bool,

	#[argh(switch, short = 'c')]
	/// print CAL notes of legacy kernels
	calnotes: bool,

	#[argh(switch, short = 'C')]
	/// print OpenCL 2.0 kernel setup and metadata as .config blocks
	config: bool,

	#[argh(switch, short = 's')]
	/// print OpenCL 2.0 stubs, setups and sampler init data
	setup: bool,

	#[argh(switch, short = 'f')]
	/// print float interpretation of literals
	floats: bool,

	#[argh(switch, short = 'H')]
	/// print instruction bytes before each instruction
	hex_code: bool,

	#[argh(switch, short = 'a')]
	/// print everything
	all: bool,

	#[argh(switch, short = 'r')]
	/// treat input files as raw code
	raw: bool,

	#[argh(option, short = 'g')]
	/// device type for Gallium binaries and raw code
	gpu_type: Option<String>,

	#[argh(option, short = 'A')]
	/// architecture (GCN1.0, GCN1.1, GCN1.2) for Gallium binaries and raw code
	arch: Option<String>,

	#[argh(switch)]
	/// decode float literals the way old assemblers encoded them
	buggy_fp_lit: bool,

	#[argh(switch, short = 'v')]
	/// log debug output to stderr
	verbose: bool,
}

impl Args {
	fn flags(&self) -> DisasmFlags {
		let mut flags = if self.all { DisasmFlags::ALL } else { DisasmFlags::DUMP_CODE };
		for (enabled, flag) in [
			(self.metadata, DisasmFlags::METADATA),
			(self.data, DisasmFlags::DUMP_DATA),
			(self.calnotes, DisasmFlags::CAL_NOTES),
			(self.config, DisasmFlags::CONFIG),
			(self.setup, DisasmFlags::SETUP),
			(self.floats, DisasmFlags::FLOAT_LITS),
			(self.hex_code, DisasmFlags::HEX_CODE),
			(self.buggy_fp_lit, DisasmFlags::BUGGY_FP_LIT),
		] {
			flags.set(flag, enabled || flags.contains(flag));
		}
		flags
	}

	fn device(&self) -> Result<GpuDeviceType> {
		match (&self.gpu_type, &self.arch) {
			(Some(name), _) => GpuDeviceType::from_name(name).with_context(|| format!("unknown GPU device type '{name}'")),
			(None, Some(name)) => GpuArchitecture::from_name(name)
				.map(GpuArchitecture::lowest_device)
				.with_context(|| format!("unknown GPU architecture '{name}'")),
			(None, None) => Ok(radeon_bin::DEFAULT_UNTAGGED_DEVICE),
		}
	}
}

fn init_logging(verbose: bool) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "warn" }));
	tracing_subscriber::registry()
		.with(tracing_subscriber::fmt::layer().with_writer(io::stderr).with_filter(filter))
		.init();
}

fn disassemble_file(path: &Path, options: &DisasmOptions) -> Result<Vec<u8>> {
	let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
	let mut listing = Vec::new();
	radeon_bin::disassemble(&data, options, &mut listing)?;
	Ok(listing)
}

fn run(args: &Args) -> Result<bool> {
	if args.files.is_empty() {
		bail!("no input files");
	}
	let options = DisasmOptions {
		flags: args.flags(),
		device: args.device()?,
		raw: args.raw,
	};
	let mut stdout = io::stdout().lock();
	let mut all_ok = true;
	for path in &args.files {
		match disassemble_file(path, &options) {
			Ok(listing) => {
				writeln!(stdout, "/* Disassembling '{}' */", path.display())?;
				stdout.write_all(&listing)?;
			}
			Err(error) => {
				all_ok = false;
				writeln!(stdout, "/* ERROR for '{}' */", path.display())?;
				stdout.flush()?;
				eprintln!("{}: {error:#}", "error".if_supports_color(Stream::Stderr, |t| t.red()));
			}
		}
	}
	stdout.flush()?;
	Ok(all_ok)
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
