// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! AMD GPU compute binary toolkit.
//!
//! Parses the Catalyst (legacy), OpenCL 2.0 and Gallium containers, lowers them into a flat
//! disassembly input and renders that as assembler source. The assembler side builds OpenCL 2.0
//! binaries back from such source.
//!
//! ```text
//! bytes -> container::parse -> lower::lower -> render::Disassembler -> text
//! text  -> asm::assemble (builder -> generator)                     -> bytes
//! ```

pub mod asm;
mod bytes;
pub mod calnote;
pub mod container;
pub mod device;
pub mod elf;
pub mod error;
pub mod generator;
pub mod kernel_config;
pub mod lower;
pub mod render;

pub use asm::{Assembled, AssemblerOptions, AssemblyError, Diagnostic, assemble};
pub use device::{GpuArchitecture, GpuDeviceType};
pub use error::{Error, Result};
pub use lower::DisasmInput;
pub use render::{DisasmFlags, Disassembler};

use lower::LowerOptions;
use std::io::Write;
use tracing::instrument;

/// Gallium containers and raw code carry no device code.
pub const DEFAULT_UNTAGGED_DEVICE: GpuDeviceType = GpuDeviceType::CapeVerde;

#[derive(Debug, Clone, Copy)]
pub struct DisasmOptions {
	pub flags: DisasmFlags,
	/// Device of Gallium containers and raw code.
	pub device: GpuDeviceType,
	/// Treat the whole buffer as code instead of probing for a container.
	pub raw: bool,
}

impl Default for DisasmOptions {
	fn default() -> Self {
		Self {
			flags: DisasmFlags::ALL,
			device: DEFAULT_UNTAGGED_DEVICE,
			raw: false,
		}
	}
}

/// Parses, lowers and renders one binary.
#[instrument(level = "debug", skip(data, out), fields(size = data.len()))]
pub fn disassemble(data: &[u8], options: &DisasmOptions, out: &mut impl Write) -> Result<()> {
	let input = if options.raw {
		lower::lower_raw(options.device, data)
	} else {
		let container = container::parse(data, options.device)?;
		lower::lower(
			&container,
			LowerOptions {
				cal_notes: options.flags.contains(DisasmFlags::CAL_NOTES),
			},
		)?
	};
	let result = Disassembler::new(&input, options.flags).disassemble(out);
	result
}

#[cfg(test)]
mod tests {
	use super::*;

	fn listing(data: &[u8], options: &DisasmOptions) -> String {
		let mut out = Vec::new();
		disassemble(data, options, &mut out).unwrap();
		String::from_utf8(out).unwrap()
	}

	#[test]
	fn raw_code_uses_the_requested_device() {
		let options = DisasmOptions {
			flags: DisasmFlags::DUMP_CODE,
			device: GpuDeviceType::Hawaii,
			raw: true,
		};
		assert_eq!(listing(&[0, 0, 0x81, 0xbf], &options), ".rawcode\n.gpu Hawaii\n.text\n        .int 0xbf810000\n");
	}

	#[test]
	fn assembled_binary_disassembles() {
		let source = ".amdcl2\n.gpu Bonaire\n.kernel k\n.config\n.dims x\n.text\n.int 0xbf810000\n";
		let binary = assemble(source, &AssemblerOptions::default()).unwrap().binary;
		let text = listing(&binary, &DisasmOptions::default());
		assert!(text.starts_with(".amdcl2\n.gpu Bonaire\n"), "{text}");
		assert!(text.contains(".kernel k\n"), "{text}");
		assert!(text.contains("/*bf810000*/ .int 0xbf810000"), "{text}");
	}

	#[test]
	fn garbage_is_rejected() {
		let mut out = Vec::new();
		assert!(disassemble(b"not a binary", &DisasmOptions::default(), &mut out).is_err());
	}
}
