// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

use crate::kernel_config::KernelConfig;
use std::io::{self, Write};

/// Writes a kernel's `.config` block; every pseudo-op maps back onto one builder operation.
pub fn write_config(out: &mut impl Write, config: &KernelConfig) -> io::Result<()> {
	writeln!(out, "    .config")?;
	writeln!(out, "        .dims {}", config.dims)?;
	if config.reqd_work_group_size != [0; 3] {
		let [x, y, z] = config.reqd_work_group_size;
		writeln!(out, "        .cws {x}, {y}, {z}")?;
	}
	writeln!(out, "        .sgprsnum {}", config.used_sgprs)?;
	writeln!(out, "        .vgprsnum {}", config.used_vgprs)?;
	writeln!(out, "        .floatmode 0x{:02x}", config.float_mode)?;
	if config.priority != 0 {
		writeln!(out, "        .priority {}", config.priority)?;
	}
	if config.exceptions != 0 {
		writeln!(out, "        .exceptions 0x{:02x}", config.exceptions)?;
	}
	if config.local_size != 0 {
		writeln!(out, "        .localsize {}", config.local_size)?;
	}
	if config.scratch_buffer_size != 0 {
		writeln!(out, "        .scratchbuffer {}", config.scratch_buffer_size)?;
	}
	if config.pgm_rsrc1 != 0 {
		writeln!(out, "        .pgmrsrc1 0x{:08x}", config.pgm_rsrc1)?;
	}
	if config.pgm_rsrc2 != 0 {
		writeln!(out, "        .pgmrsrc2 0x{:08x}", config.pgm_rsrc2)?;
	}
	let switches = [
		(config.ieee_mode, ".ieeemode"),
		(config.dx10_clamp, ".dx10clamp"),
		(config.debug_mode, ".debugmode"),
		(config.privileged_mode, ".privmode"),
		(config.tg_size, ".tgsize"),
		(config.use_setup, ".usesetup"),
		(config.use_sizes, ".usesizes"),
		(config.use_enqueue, ".useenqueue"),
	];
	for (_, directive) in switches.iter().filter(|(enabled, _)| *enabled) {
		writeln!(out, "        {directive}")?;
	}
	if !config.samplers.is_empty() {
		let samplers: Vec<String> = config.samplers.iter().map(|sampler| format!("0x{sampler:x}")).collect();
		writeln!(out, "        .sampler {}", samplers.join(", "))?;
	}
	for arg in &config.args {
		writeln!(out, "        .arg {arg}")?;
	}
	Ok(())
}
