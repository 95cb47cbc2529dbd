// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Catalyst ("legacy") containers and their per-kernel CAL inner binaries.

use super::{KernelRecord, NameIndex};
use crate::bytes;
use crate::calnote::{CalNoteHeader, parse_cal_notes};
use crate::device::{self, GpuDeviceType};
use crate::elf::{self, PT_NOTE};
use crate::error::{Result, malformed};
use goblin::elf::Elf;
use tracing::{debug, instrument};

/// Program header type carrying the CAL encoding dictionary.
pub const PT_CAL_ENCODING_DICTIONARY: u32 = 0x7000_0002;
pub const CAL_ENCODING_ENTRY_SIZE: usize = 20;

const SYMBOL_PREFIX: &str = "__OpenCL_";
pub const COMPILER_OPTIONS_SYMBOL: &str = "__OpenCL_compiler_options";

pub struct AmdContainer<'a> {
	pub data: &'a [u8],
	pub device: GpuDeviceType,
	pub is_64bit: bool,
	/// `.comment` contents.
	pub driver_info: &'a [u8],
	pub compile_options: &'a [u8],
	/// `.data` contents, empty when absent.
	pub global_data: &'a [u8],
	/// Kernel metadata in symbol order; this is the authoritative kernel list.
	pub metadata: Vec<KernelRecord<'a>>,
	pub headers: Vec<KernelRecord<'a>>,
	pub inner_binaries: Vec<CalInnerBinary<'a>>,
	header_index: NameIndex,
	inner_index: NameIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalEncoding {
	pub machine: u32,
	pub kind: u32,
	pub offset: usize,
	pub size: usize,
	pub flags: u32,
}

#[derive(Debug, Clone, Copy)]
struct InnerSection<'a> {
	name: &'a str,
	offset: usize,
	data: &'a [u8],
}

/// CAL inner binary: an ELF32 image holding one or more encodings (one per target device).
pub struct CalInnerBinary<'a> {
	pub name: &'a str,
	pub data: &'a [u8],
	pub encodings: Vec<CalEncoding>,
	sections: Vec<InnerSection<'a>>,
	/// `(offset, size)` of every `PT_NOTE` segment.
	note_segments: Vec<(usize, usize)>,
}

fn kernel_symbol<'s>(name: &'s str, suffix: &str) -> Option<&'s str> {
	name.strip_prefix(SYMBOL_PREFIX)?.strip_suffix(suffix).filter(|kernel| !kernel.is_empty())
}

impl<'a> AmdContainer<'a> {
	#[instrument(level = "debug", skip_all)]
	pub fn parse(data: &'a [u8]) -> Result<Self> {
		let elf = Elf::parse(data)?;
		let device = device::resolve_legacy(elf.header.e_machine)?;

		let mut metadata = Vec::new();
		let mut headers = Vec::new();
		let mut inner = Vec::new();
		let mut compile_options: &[u8] = &[];
		for sym in elf.syms.iter() {
			let name = elf::symbol_name(&elf, &sym);
			if name == COMPILER_OPTIONS_SYMBOL {
				compile_options = elf::symbol_bytes(data, &elf, &sym)?;
			} else if let Some(kernel) = kernel_symbol(name, "_metadata") {
				metadata.push(KernelRecord {
					name: kernel,
					data: elf::symbol_bytes(data, &elf, &sym)?,
				});
			} else if let Some(kernel) = kernel_symbol(name, "_header") {
				headers.push(KernelRecord {
					name: kernel,
					data: elf::symbol_bytes(data, &elf, &sym)?,
				});
			} else if let Some(kernel) = kernel_symbol(name, "_kernel") {
				inner.push((kernel, elf::symbol_bytes(data, &elf, &sym)?));
			}
		}

		let inner_binaries = inner
			.into_iter()
			.map(|(name, bytes)| CalInnerBinary::parse(name, bytes))
			.collect::<Result<Vec<_>>>()?;
		let driver_info = elf::named_section_bytes(data, &elf, ".comment")?.unwrap_or_default();
		let global_data = elf::named_section_bytes(data, &elf, ".data")?.unwrap_or_default();
		debug!(%device, kernels = metadata.len(), inner = inner_binaries.len(), "parsed legacy container");

		Ok(Self {
			data,
			device,
			is_64bit: elf.is_64,
			driver_info,
			compile_options,
			global_data,
			header_index: NameIndex::new(headers.iter().map(|record| record.name)),
			inner_index: NameIndex::new(inner_binaries.iter().map(|binary| binary.name)),
			metadata,
			headers,
			inner_binaries,
		})
	}

	pub fn kernel_names(&self) -> impl Iterator<Item = &'a str> + '_ {
		self.metadata.iter().map(|record| record.name)
	}

	/// Kernel header for the `position`-th kernel, tolerating reordered header symbols.
	pub fn header(&self, position: usize, name: &str) -> Option<&KernelRecord<'a>> {
		super::resolve_record(&self.headers, &self.header_index, position, name, |record| record.name)
	}

	pub fn inner_binary(&self, position: usize, name: &str) -> Option<&CalInnerBinary<'a>> {
		super::resolve_record(&self.inner_binaries, &self.inner_index, position, name, |binary| binary.name)
	}
}

impl<'a> CalInnerBinary<'a> {
	pub fn parse(name: &'a str, data: &'a [u8]) -> Result<Self> {
		let elf = Elf::parse(data)?;
		if elf.is_64 {
			return Err(malformed(format!("CAL inner binary of kernel '{name}' is not ELF32")));
		}

		let mut encodings = Vec::new();
		let mut note_segments = Vec::new();
		for phdr in &elf.program_headers {
			let offset = elf::to_usize(phdr.p_offset)?;
			let size = elf::to_usize(phdr.p_filesz)?;
			match phdr.p_type {
				PT_CAL_ENCODING_DICTIONARY => {
					let dictionary = bytes::slice(data, offset, size, "CAL encoding dictionary")?;
					for entry in dictionary.chunks_exact(CAL_ENCODING_ENTRY_SIZE) {
						encodings.push(CalEncoding {
							machine: bytes::u32_at(entry, 0, "CAL encoding machine")?,
							kind: bytes::u32_at(entry, 4, "CAL encoding type")?,
							offset: bytes::u32_at(entry, 8, "CAL encoding offset")? as usize,
							size: bytes::u32_at(entry, 12, "CAL encoding size")? as usize,
							flags: bytes::u32_at(entry, 16, "CAL encoding flags")?,
						});
					}
				}
				PT_NOTE => note_segments.push((offset, size)),
				_ => {}
			}
		}

		let sections = elf
			.section_headers
			.iter()
			.map(|shdr| {
				Ok(InnerSection {
					name: elf::section_name(&elf, shdr),
					offset: elf::to_usize(shdr.sh_offset)?,
					data: elf::section_bytes(data, shdr)?,
				})
			})
			.collect::<Result<Vec<_>>>()?;

		Ok(Self {
			name,
			data,
			encodings,
			sections,
			note_segments,
		})
	}

	/// First encoding whose machine code maps to `device`.
	pub fn select_encoding(&self, device: GpuDeviceType) -> Result<&CalEncoding> {
		self.encodings
			.iter()
			.find(|encoding| device::resolve_cal_inner(encoding.machine).is_ok_and(|found| found == device))
			.ok_or_else(|| malformed(format!("can't find suitable CAL encoding entry for kernel '{}'", self.name)))
	}

	fn section_in(&self, encoding: &CalEncoding, name: &str) -> Option<&'a [u8]> {
		let end = encoding.offset + encoding.size;
		self.sections
			.iter()
			.find(|section| section.name == name && section.offset >= encoding.offset && section.offset + section.data.len() <= end)
			.map(|section| section.data)
	}

	pub fn code(&self, encoding: &CalEncoding) -> Option<&'a [u8]> {
		self.section_in(encoding, ".text")
	}

	pub fn kernel_data(&self, encoding: &CalEncoding) -> Option<&'a [u8]> {
		self.section_in(encoding, ".data")
	}

	/// CAL notes stored in note segments inside the encoding.
	pub fn notes(&self, encoding: &CalEncoding) -> Result<Vec<(CalNoteHeader, &'a [u8])>> {
		let end = encoding.offset + encoding.size;
		let mut notes = Vec::new();
		for &(offset, size) in &self.note_segments {
			if offset >= encoding.offset && offset + size <= end {
				let segment = bytes::slice(self.data, offset, size, "CAL note segment")?;
				notes.extend(parse_cal_notes(segment)?);
			}
		}
		Ok(notes)
	}
}
