// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Renders a [`DisasmInput`] as assembler source.
//!
//! Output is line oriented and deterministic: the same input and flags always produce the same
//! bytes. Whatever the sink rejects is returned as [`Error::Io`](crate::Error::Io).

pub mod config;
pub mod data;
pub mod isa;

pub use isa::{CodeSection, Instruction, IsaDecoder, Operand, RawWordDecoder};

use crate::calnote::CalNoteKind;
use crate::error::Result;
use crate::kernel_config::KernelConfig;
use crate::lower::{AmdInput, CalNoteInput, Cl2Input, Cl2KernelInput, DisasmInput, GalliumInput, RawCodeInput};
use bitflags::bitflags;
use std::io::Write;
use tracing::debug;

bitflags! {
	/// What a listing includes.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct DisasmFlags: u32 {
		/// Compile options, driver info, kernel headers and metadata.
		const METADATA = 1;
		const DUMP_DATA = 1 << 1;
		const DUMP_CODE = 1 << 2;
		/// CL2 stubs, setups and sampler init data.
		const SETUP = 1 << 3;
		const CAL_NOTES = 1 << 4;
		/// CL2 kernels whose setup and metadata decode are shown as `.config` blocks.
		const CONFIG = 1 << 5;
		/// Instruction bytes as a leading comment.
		const HEX_CODE = 1 << 6;
		/// Float interpretation of literals as a trailing comment.
		const FLOAT_LITS = 1 << 7;
		/// Passed through to decoders that model the old literal encoding bug.
		const BUGGY_FP_LIT = 1 << 8;
		const ALL = Self::METADATA.bits()
			| Self::DUMP_DATA.bits()
			| Self::DUMP_CODE.bits()
			| Self::SETUP.bits()
			| Self::CAL_NOTES.bits()
			| Self::HEX_CODE.bits()
			| Self::FLOAT_LITS.bits();
	}
}

pub struct Disassembler<'i, 'a> {
	input: &'i DisasmInput<'a>,
	flags: DisasmFlags,
	decoder: Box<dyn IsaDecoder + 'i>,
}

impl<'i, 'a> Disassembler<'i, 'a> {
	/// Uses [`RawWordDecoder`] for code.
	pub fn new(input: &'i DisasmInput<'a>, flags: DisasmFlags) -> Self {
		Self {
			input,
			flags,
			decoder: Box::new(RawWordDecoder),
		}
	}

	pub fn with_decoder(mut self, decoder: impl IsaDecoder + 'i) -> Self {
		self.decoder = Box::new(decoder);
		self
	}

	pub fn disassemble(&self, out: &mut impl Write) -> Result<()> {
		let format = match self.input {
			DisasmInput::Amd(_) => ".amd",
			DisasmInput::AmdCl2(_) => ".amdcl2",
			DisasmInput::Gallium(_) => ".gallium",
			DisasmInput::RawCode(_) => ".rawcode",
		};
		writeln!(out, "{format}")?;
		writeln!(out, ".gpu {}", self.input.device())?;
		debug!(format, flags = ?self.flags, "rendering listing");
		match self.input {
			DisasmInput::Amd(input) => self.write_amd(out, input),
			DisasmInput::AmdCl2(input) => self.write_cl2(out, input),
			DisasmInput::Gallium(input) => self.write_gallium(out, input),
			DisasmInput::RawCode(input) => self.write_raw(out, input),
		}
	}

	fn has(&self, flag: DisasmFlags) -> bool {
		self.flags.contains(flag)
	}

	fn write_code(&self, out: &mut impl Write, section: &CodeSection<'_>) -> Result<()> {
		isa::write_code(out, self.decoder.as_ref(), self.flags, section)?;
		Ok(())
	}

	fn write_amd(&self, out: &mut impl Write, input: &AmdInput<'_>) -> Result<()> {
		writeln!(out, "{}", if input.is_64bit { ".64bit" } else { ".32bit" })?;
		if self.has(DisasmFlags::METADATA) {
			writeln!(out, ".compile_options \"{}\"", data::escape(&input.compile_options))?;
			writeln!(out, ".driver_info \"{}\"", data::escape(&input.driver_info))?;
		}
		if self.has(DisasmFlags::DUMP_DATA) && !input.global_data.is_empty() {
			writeln!(out, ".data")?;
			data::write_bytes(out, &input.global_data, false)?;
		}

		for (index, kernel) in input.kernels.iter().enumerate() {
			writeln!(out, ".kernel \"{}\"", data::escape(kernel.name.as_bytes()))?;
			if self.has(DisasmFlags::METADATA) {
				if let Some(header) = kernel.header.as_deref().filter(|header| !header.is_empty()) {
					writeln!(out, "    .header")?;
					data::write_bytes(out, header, true)?;
				}
				if let Some(metadata) = kernel.metadata.as_deref().filter(|metadata| !metadata.is_empty()) {
					writeln!(out, "    .metadata")?;
					data::write_long_string(out, metadata, true)?;
				}
			}
			if self.has(DisasmFlags::DUMP_DATA) {
				if let Some(kernel_data) = kernel.data.as_deref().filter(|kernel_data| !kernel_data.is_empty()) {
					writeln!(out, "    .kerneldata")?;
					data::write_bytes(out, kernel_data, true)?;
				}
			}
			if self.has(DisasmFlags::CAL_NOTES) {
				for note in &kernel.cal_notes {
					write_cal_note(out, note)?;
				}
			}
			if self.has(DisasmFlags::DUMP_CODE) {
				if let Some(code) = kernel.code.as_deref().filter(|code| !code.is_empty()) {
					writeln!(out, "    .text")?;
					self.write_code(
						out,
						&CodeSection {
							code,
							id: index,
							named_labels: &[],
							relocations: &[],
						},
					)?;
				}
			}
		}
		Ok(())
	}

	fn write_cl2(&self, out: &mut impl Write, input: &Cl2Input<'_>) -> Result<()> {
		writeln!(out, ".driver_version {}", input.driver_version)?;
		if self.has(DisasmFlags::METADATA) {
			writeln!(out, ".compile_options \"{}\"", data::escape(&input.compile_options))?;
			writeln!(out, ".acl_version \"{}\"", data::escape(&input.acl_version))?;
		}
		if self.has(DisasmFlags::SETUP) {
			if let Some(sampler_init) = input.sampler_init.as_deref().filter(|init| !init.is_empty()) {
				writeln!(out, ".samplerinit")?;
				data::write_bytes(out, sampler_init, false)?;
			}
		}
		if self.has(DisasmFlags::DUMP_DATA) {
			if let Some(global_data) = input.global_data.as_deref().filter(|global| !global.is_empty()) {
				writeln!(out, ".globaldata")?;
				writeln!(out, ".gdata:")?;
				data::write_bytes(out, global_data, false)?;
				for (offset, sampler) in &input.sampler_relocs {
					writeln!(out, "    .samplerreloc {offset}, {sampler}")?;
				}
			}
			if let Some(rw_data) = input.rw_data.as_deref().filter(|rw| !rw.is_empty()) {
				writeln!(out, ".data")?;
				writeln!(out, ".ddata:")?;
				data::write_bytes(out, rw_data, false)?;
			}
			if input.bss_size != 0 {
				writeln!(out, ".section .bss align={}", input.bss_alignment)?;
				writeln!(out, ".bdata:")?;
				writeln!(out, "    .skip {}", input.bss_size)?;
			}
		}

		let new_inner = input.driver_version >= crate::device::CL2_NEW_DRIVER_VERSION;
		for (index, kernel) in input.kernels.iter().enumerate() {
			writeln!(out, ".kernel {}", kernel.name)?;
			match self.decodable_config(kernel, new_inner) {
				Some(config) => config::write_config(out, &config)?,
				None => self.write_cl2_records(out, kernel)?,
			}
			if self.has(DisasmFlags::DUMP_CODE) {
				if let Some(code) = kernel.code.as_deref().filter(|code| !code.is_empty()) {
					writeln!(out, "    .text")?;
					self.write_code(
						out,
						&CodeSection {
							code,
							id: index,
							named_labels: &[],
							relocations: &kernel.relocations,
						},
					)?;
				}
			}
		}
		Ok(())
	}

	/// The kernel's configuration when `.config` can stand in for its raw records.
	fn decodable_config(&self, kernel: &Cl2KernelInput<'_>, new_inner: bool) -> Option<KernelConfig> {
		if !self.has(DisasmFlags::CONFIG) || kernel.isa_metadata.as_deref().is_some_and(|isa| !isa.is_empty()) {
			return None;
		}
		let config = KernelConfig::decode(&kernel.name, kernel.setup.as_deref()?, kernel.metadata.as_deref()?)?;
		let stub_matches = match kernel.stub.as_deref() {
			None => new_inner,
			Some(stub) => !new_inner && stub == config.encode_stub().as_slice(),
		};
		stub_matches.then_some(config)
	}

	fn write_cl2_records(&self, out: &mut impl Write, kernel: &Cl2KernelInput<'_>) -> Result<()> {
		if self.has(DisasmFlags::METADATA) {
			if let Some(metadata) = kernel.metadata.as_deref().filter(|metadata| !metadata.is_empty()) {
				writeln!(out, "    .metadata")?;
				data::write_bytes(out, metadata, true)?;
			}
			if let Some(isa_metadata) = kernel.isa_metadata.as_deref().filter(|isa| !isa.is_empty()) {
				writeln!(out, "    .isametadata")?;
				data::write_bytes(out, isa_metadata, true)?;
			}
		}
		if self.has(DisasmFlags::SETUP) {
			if let Some(stub) = kernel.stub.as_deref().filter(|stub| !stub.is_empty()) {
				writeln!(out, "    .stub")?;
				data::write_bytes(out, stub, true)?;
			}
			if let Some(setup) = kernel.setup.as_deref().filter(|setup| !setup.is_empty()) {
				writeln!(out, "    .setup")?;
				data::write_bytes(out, setup, true)?;
			}
		}
		Ok(())
	}

	fn write_gallium(&self, out: &mut impl Write, input: &GalliumInput<'_>) -> Result<()> {
		writeln!(out, "{}", if input.is_64bit { ".64bit" } else { ".32bit" })?;
		if self.has(DisasmFlags::DUMP_DATA) {
			if let Some(global_data) = input.global_data.as_deref().filter(|global| !global.is_empty()) {
				writeln!(out, ".rodata")?;
				data::write_bytes(out, global_data, false)?;
			}
		}

		let mut labels = Vec::with_capacity(input.kernels.len());
		for kernel in &input.kernels {
			writeln!(out, ".kernel {}", kernel.name)?;
			if self.has(DisasmFlags::METADATA) {
				writeln!(out, "    .args")?;
				for arg in &kernel.args {
					writeln!(
						out,
						"        .arg {}, {}, {}, {}, {}, {}",
						arg.kind.name(),
						arg.size,
						arg.target_size,
						arg.target_align,
						if arg.sign_extended { "sext" } else { "zext" },
						arg.semantic.name()
					)?;
				}
				writeln!(out, "    .proginfo")?;
				for entry in &kernel.prog_info {
					writeln!(out, "        .entry 0x{:08x}, 0x{:08x}", entry.address, entry.value)?;
				}
			}
			labels.push((kernel.offset as usize, kernel.name.to_string()));
		}

		if self.has(DisasmFlags::DUMP_CODE) && !input.code.is_empty() {
			writeln!(out, ".text")?;
			self.write_code(
				out,
				&CodeSection {
					code: &input.code,
					id: 0,
					named_labels: &labels,
					relocations: &[],
				},
			)?;
		}
		Ok(())
	}

	fn write_raw(&self, out: &mut impl Write, input: &RawCodeInput<'_>) -> Result<()> {
		if self.has(DisasmFlags::DUMP_CODE) {
			writeln!(out, ".text")?;
			self.write_code(
				out,
				&CodeSection {
					code: &input.code,
					id: 0,
					named_labels: &[],
					relocations: &[],
				},
			)?;
		}
		Ok(())
	}
}

/// Fixed-size records of a note, followed by a byte dump of whatever does not fill a record.
fn write_records(out: &mut impl Write, data: &[u8], stride: usize, mut line: impl FnMut(&[u8]) -> String) -> Result<()> {
	let whole = data.len() / stride * stride;
	for record in data[..whole].chunks_exact(stride) {
		writeln!(out, "        {}", line(record))?;
	}
	data::write_bytes(out, &data[whole..], true)?;
	Ok(())
}

fn word(record: &[u8], index: usize) -> u32 {
	let at = index * 4;
	u32::from_le_bytes([record[at], record[at + 1], record[at + 2], record[at + 3]])
}

fn write_cal_note(out: &mut impl Write, note: &CalNoteInput<'_>) -> Result<()> {
	let size = (note.header.desc_size as usize).min(note.data.len());
	let data = &note.data[..size];
	let Some(kind) = CalNoteKind::from_code(note.header.kind) else {
		writeln!(out, "    .calnote 0x{:x}", note.header.kind)?;
		data::write_bytes(out, data, true)?;
		return Ok(());
	};

	let directive = kind.directive();
	match kind {
		CalNoteKind::EarlyExit | CalNoteKind::CondOut | CalNoteKind::UavOpMask | CalNoteKind::UavMailboxSize if size == 4 => {
			writeln!(out, "    {directive} {}", word(data, 0))?;
			return Ok(());
		}
		_ => writeln!(out, "    {directive}")?,
	}
	match kind {
		CalNoteKind::ProgInfo => write_records(out, data, 8, |entry| format!(".entry 0x{:08x}, 0x{:08x}", word(entry, 0), word(entry, 1))),
		CalNoteKind::Inputs
		| CalNoteKind::Outputs
		| CalNoteKind::GlobalBuffers
		| CalNoteKind::ScratchBuffers
		| CalNoteKind::PersistentBuffers => Ok(data::write_words_and_tail(out, data, true)?),
		CalNoteKind::Float32Consts | CalNoteKind::Int32Consts | CalNoteKind::Bool32Consts => {
			write_records(out, data, 8, |segment| format!(".segment {}, {}", word(segment, 0), word(segment, 1)))
		}
		CalNoteKind::InputSamplers => write_records(out, data, 8, |sampler| format!(".sampler {}, 0x{:x}", word(sampler, 0), word(sampler, 1))),
		CalNoteKind::ConstantBuffers => write_records(out, data, 8, |mask| format!(".cbmask {}, {}", word(mask, 0), word(mask, 1))),
		CalNoteKind::Uav => write_records(out, data, 16, |uav| {
			format!(".entry {}, {}, {}, {}", word(uav, 0), word(uav, 1), word(uav, 2), word(uav, 3))
		}),
		CalNoteKind::EarlyExit
		| CalNoteKind::CondOut
		| CalNoteKind::UavOpMask
		| CalNoteKind::UavMailboxSize
		| CalNoteKind::SubConstantBuffers => Ok(data::write_bytes(out, data, true)?),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::calnote::CalNoteHeader;
	use crate::container::gallium::{GalliumArg, GalliumArgSemantic, GalliumArgType, ProgInfoEntry};
	use crate::device::GpuDeviceType;
	use crate::lower::{AmdKernelInput, GalliumKernelInput};
	use std::borrow::Cow;

	fn render(input: &DisasmInput<'_>, flags: DisasmFlags) -> String {
		let mut out = Vec::new();
		Disassembler::new(input, flags).disassemble(&mut out).unwrap();
		String::from_utf8(out).unwrap()
	}

	fn note(kind: u32, data: Vec<u8>) -> CalNoteInput<'static> {
		CalNoteInput {
			header: CalNoteHeader::new(kind, data.len() as u32),
			data: Cow::Owned(data),
		}
	}

	fn words(values: &[u32]) -> Vec<u8> {
		values.iter().flat_map(|value| value.to_le_bytes()).collect()
	}

	fn note_text(note: &CalNoteInput<'_>) -> String {
		let mut out = Vec::new();
		write_cal_note(&mut out, note).unwrap();
		String::from_utf8(out).unwrap()
	}

	#[test]
	fn cal_note_scalars_and_records() {
		assert_eq!(note_text(&note(8, words(&[121]))), "    .earlyexit 121\n");
		assert_eq!(note_text(&note(17, Vec::new())), "    .uavopmask\n");
		assert_eq!(note_text(&note(16, words(&[1, 2, 3, 4, 9]))), "    .uav\n        .entry 1, 2, 3, 4\n        .byte 0x09, 0x00, 0x00, 0x00\n");
		assert_eq!(note_text(&note(7, words(&[4, 8]))), "    .boolconsts\n        .segment 4, 8\n");
		assert_eq!(note_text(&note(0x40, vec![1, 2])), "    .calnote 0x40\n        .byte 0x01, 0x02\n");
	}

	#[test]
	fn cal_note_size_limits_data() {
		let mut truncated = note(2, words(&[7, 7]));
		truncated.header.desc_size = 5;
		assert_eq!(note_text(&truncated), "    .inputs\n        .int 0x00000007\n        .byte 0x07\n");
	}

	#[test]
	fn legacy_flags_select_sections() {
		let input = DisasmInput::Amd(AmdInput {
			device: GpuDeviceType::Pitcairn,
			is_64bit: false,
			driver_info: Cow::Borrowed(b"drv"),
			compile_options: Cow::Borrowed(b""),
			global_data: Cow::Borrowed(&[1, 2]),
			kernels: vec![AmdKernelInput {
				name: Cow::Borrowed("k"),
				code: Some(Cow::Borrowed(&[1, 0, 0, 0])),
				..Default::default()
			}],
		});
		assert_eq!(render(&input, DisasmFlags::DUMP_CODE), ".amd\n.gpu Pitcairn\n.32bit\n.kernel \"k\"\n    .text\n        .int 0x00000001\n");
		assert_eq!(
			render(&input, DisasmFlags::METADATA | DisasmFlags::DUMP_DATA),
			".amd\n.gpu Pitcairn\n.32bit\n.compile_options \"\"\n.driver_info \"drv\"\n.data\n    .byte 0x01, 0x02\n.kernel \"k\"\n"
		);
	}

	#[test]
	fn gallium_listing() {
		let input = DisasmInput::Gallium(GalliumInput {
			device: GpuDeviceType::Bonaire,
			is_64bit: false,
			global_data: None,
			code: Cow::Borrowed(&[0, 0, 0, 0, 1, 0, 0, 0]),
			kernels: vec![GalliumKernelInput {
				name: Cow::Borrowed("fill"),
				prog_info: [ProgInfoEntry { address: 0xb848, value: 0x40 }; 3],
				offset: 4,
				args: vec![GalliumArg {
					kind: GalliumArgType::Global,
					size: 8,
					target_size: 8,
					target_align: 8,
					sign_extended: false,
					semantic: GalliumArgSemantic::General,
				}],
			}],
		});
		assert_eq!(
			render(&input, DisasmFlags::METADATA | DisasmFlags::DUMP_CODE),
			".gallium\n.gpu Bonaire\n.32bit\n.kernel fill\n    .args\n        .arg global, 8, 8, 8, zext, general\n    .proginfo\n\
			 \x20       .entry 0x0000b848, 0x00000040\n        .entry 0x0000b848, 0x00000040\n        .entry 0x0000b848, 0x00000040\n\
			 .text\n        .int 0x00000000\nfill:\n        .int 0x00000001\n"
		);
	}

	#[test]
	fn raw_code_without_code_flag_is_just_the_header() {
		let input = crate::lower::lower_raw(GpuDeviceType::Tonga, &[1, 2, 3]);
		assert_eq!(render(&input, DisasmFlags::METADATA), ".rawcode\n.gpu Tonga\n");
		assert_eq!(render(&input, DisasmFlags::DUMP_CODE), ".rawcode\n.gpu Tonga\n.text\n        .byte 0x01, 0x02, 0x03\n");
	}

	#[test]
	fn cl2_config_replaces_raw_records() {
		let config = KernelConfig {
			used_sgprs: 10,
			used_vgprs: 4,
			..KernelConfig::default()
		};
		let kernel = Cl2KernelInput {
			name: Cow::Borrowed("k0"),
			metadata: Some(Cow::Owned(config.encode_metadata("k0"))),
			setup: Some(Cow::Owned(config.encode_setup())),
			..Default::default()
		};
		let input = DisasmInput::AmdCl2(Cl2Input {
			device: GpuDeviceType::Bonaire,
			driver_version: 191205,
			compile_options: Cow::Borrowed(b""),
			acl_version: Cow::Borrowed(b""),
			global_data: None,
			rw_data: None,
			bss_alignment: 0,
			bss_size: 0,
			sampler_init: None,
			sampler_relocs: Vec::new(),
			kernels: vec![kernel],
		});
		let with_config = render(&input, DisasmFlags::CONFIG);
		assert!(with_config.contains(".kernel k0\n    .config\n        .dims xyz\n        .sgprsnum 10\n"));
		let raw = render(&input, DisasmFlags::SETUP);
		assert!(raw.starts_with(".amdcl2\n.gpu Bonaire\n.driver_version 191205\n.kernel k0\n    .setup\n        .byte 0x01"));
	}
}
