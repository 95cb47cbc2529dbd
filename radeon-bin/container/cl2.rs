// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! AMD OpenCL 2.0 containers.
//!
//! The main binary is an ELF64 carrying per-kernel metadata in `.rodata` and the inner binary in
//! `.text`. Drivers before 1912.05 wrote a flat inner blob (stub, setup and code per kernel);
//! newer drivers write an ELF64 with HSA-style sections and relocations.

use super::{KernelRecord, NameIndex};
use crate::bytes;
use crate::device::{self, CL2_NEW_DRIVER_VERSION, GpuDeviceType};
use crate::elf::{self, ELF_MAGIC};
use crate::error::{Result, malformed};
use goblin::elf::Elf;
use tracing::{debug, instrument};

pub const DRIVER_NOTE_NAME: &[u8] = b"AMD";
pub const DRIVER_NOTE_TYPE: u32 = 1;
/// Assumed for containers without a driver note whose inner binary is not ELF.
pub const OLD_DEFAULT_DRIVER_VERSION: u32 = 180005;

pub const KERNEL_SETUP_SIZE: usize = 256;
pub const STT_AMDGPU_HSA_KERNEL: u8 = 10;
pub const STT_SAMPLER: u8 = 12;

pub const TEXT_SECTION: &str = ".hsatext";
pub const GLOBAL_DATA_SECTION: &str = ".hsadata_readonly_agent";
pub const RW_DATA_SECTION: &str = ".hsadata_global_agent";
pub const BSS_SECTION: &str = ".hsabss_global_agent";
pub const SAMPLER_INIT_SECTION: &str = ".hsaimage_samplerinit";

pub const COMPILER_OPTIONS_SYMBOL: &str = "__OpenCL_compiler_options";

pub fn metadata_symbol(kernel: &str) -> String {
	format!("__OpenCL_&__OpenCL_{kernel}_kernel_metadata")
}

pub fn isa_metadata_symbol(kernel: &str) -> String {
	format!("__ISA_&__OpenCL_{kernel}_kernel_metadata")
}

pub fn kernel_symbol(kernel: &str) -> String {
	format!("&__OpenCL_{kernel}_kernel")
}

fn strip_symbol<'s>(name: &'s str, prefix: &str, suffix: &str) -> Option<&'s str> {
	name.strip_prefix(prefix)?.strip_suffix(suffix).filter(|kernel| !kernel.is_empty())
}

pub struct Cl2Container<'a> {
	pub data: &'a [u8],
	pub device: GpuDeviceType,
	pub driver_version: u32,
	/// `.comment` contents.
	pub acl_version: &'a [u8],
	pub compile_options: &'a [u8],
	/// Kernel metadata in symbol order; this is the authoritative kernel list.
	pub metadata: Vec<KernelRecord<'a>>,
	pub isa_metadata: Vec<KernelRecord<'a>>,
	isa_index: NameIndex,
	pub inner: Option<Cl2Inner<'a>>,
}

pub enum Cl2Inner<'a> {
	Old(OldInnerBinary<'a>),
	New(NewInnerBinary<'a>),
}

/// One kernel's pieces inside an inner binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerKernel<'a> {
	pub name: &'a str,
	/// Old format only.
	pub stub: Option<&'a [u8]>,
	pub setup: &'a [u8],
	pub code: &'a [u8],
	/// Offset of `code` within the inner text.
	pub code_offset: usize,
}

pub struct OldInnerBinary<'a> {
	pub data: &'a [u8],
	pub kernels: Vec<InnerKernel<'a>>,
	index: NameIndex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocSymbol {
	pub section: usize,
	pub value: u64,
	pub kind: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRelocation {
	pub offset: u64,
	pub kind: u32,
	pub addend: i64,
	pub symbol: RelocSymbol,
}

pub struct NewInnerBinary<'a> {
	pub data: &'a [u8],
	pub text: &'a [u8],
	pub global_data: Option<&'a [u8]>,
	pub rw_data: Option<&'a [u8]>,
	pub sampler_init: Option<&'a [u8]>,
	pub bss_size: u64,
	pub bss_alignment: u64,
	pub kernels: Vec<InnerKernel<'a>>,
	index: NameIndex,
	/// Relocations applying to the text section, in file order.
	pub text_relocs: Vec<RawRelocation>,
	/// Relocations applying to the global data section (sampler references).
	pub global_data_relocs: Vec<RawRelocation>,
	pub global_data_section: Option<usize>,
	pub rw_data_section: Option<usize>,
	pub bss_section: Option<usize>,
	pub sampler_init_section: Option<usize>,
}

fn driver_version(data: &[u8], elf: &Elf<'_>, inner: Option<&[u8]>) -> Result<u32> {
	if let Some(notes) = elf::named_section_bytes(data, elf, ".note")? {
		for note in elf::parse_notes(notes)? {
			if note.name == DRIVER_NOTE_NAME && note.kind == DRIVER_NOTE_TYPE {
				return bytes::u32_at(note.desc, 0, "driver version note");
			}
		}
	}
	Ok(match inner {
		Some(inner) if !inner.starts_with(ELF_MAGIC) => OLD_DEFAULT_DRIVER_VERSION,
		_ => CL2_NEW_DRIVER_VERSION,
	})
}

impl<'a> Cl2Container<'a> {
	#[instrument(level = "debug", skip_all)]
	pub fn parse(data: &'a [u8]) -> Result<Self> {
		let elf = Elf::parse(data)?;
		let inner_bytes = elf::named_section_bytes(data, &elf, ".text")?.filter(|text| !text.is_empty());
		let driver_version = driver_version(data, &elf, inner_bytes)?;
		let device = device::resolve_cl2(elf.header.e_flags, driver_version)?;

		let mut metadata = Vec::new();
		let mut isa_metadata = Vec::new();
		let mut compile_options: &[u8] = &[];
		for sym in elf.syms.iter() {
			let name = elf::symbol_name(&elf, &sym);
			if name == COMPILER_OPTIONS_SYMBOL {
				compile_options = elf::symbol_bytes(data, &elf, &sym)?;
			} else if let Some(kernel) = strip_symbol(name, "__OpenCL_&__OpenCL_", "_kernel_metadata") {
				metadata.push(KernelRecord {
					name: kernel,
					data: elf::symbol_bytes(data, &elf, &sym)?,
				});
			} else if let Some(kernel) = strip_symbol(name, "__ISA_&__OpenCL_", "_kernel_metadata") {
				isa_metadata.push(KernelRecord {
					name: kernel,
					data: elf::symbol_bytes(data, &elf, &sym)?,
				});
			}
		}

		let inner = match inner_bytes {
			None => None,
			Some(inner) if driver_version >= CL2_NEW_DRIVER_VERSION => Some(Cl2Inner::New(NewInnerBinary::parse(inner)?)),
			Some(inner) => Some(Cl2Inner::Old(OldInnerBinary::parse(&elf, inner)?)),
		};
		let acl_version = elf::named_section_bytes(data, &elf, ".comment")?.unwrap_or_default();
		debug!(%device, driver_version, kernels = metadata.len(), new_inner = matches!(inner, Some(Cl2Inner::New(_))), "parsed CL2 container");

		Ok(Self {
			data,
			device,
			driver_version,
			acl_version,
			compile_options,
			isa_index: NameIndex::new(isa_metadata.iter().map(|record| record.name)),
			metadata,
			isa_metadata,
			inner,
		})
	}

	pub fn kernel_names(&self) -> impl Iterator<Item = &'a str> + '_ {
		self.metadata.iter().map(|record| record.name)
	}

	pub fn isa_metadata(&self, position: usize, name: &str) -> Option<&KernelRecord<'a>> {
		super::resolve_record(&self.isa_metadata, &self.isa_index, position, name, |record| record.name)
	}

	pub fn has_new_inner(&self) -> bool {
		matches!(self.inner, Some(Cl2Inner::New(_)))
	}
}

impl<'a> Cl2Inner<'a> {
	pub fn kernel(&self, position: usize, name: &str) -> Option<&InnerKernel<'a>> {
		let (kernels, index) = match self {
			Self::Old(inner) => (&inner.kernels, &inner.index),
			Self::New(inner) => (&inner.kernels, &inner.index),
		};
		super::resolve_record(kernels, index, position, name, |kernel| kernel.name)
	}
}

impl<'a> OldInnerBinary<'a> {
	/// Kernel regions are located through `&__OpenCL_<name>_kernel` symbols of the main binary.
	fn parse(elf: &Elf<'a>, inner: &'a [u8]) -> Result<Self> {
		let text_index = elf::find_section(elf, ".text");
		let mut kernels = Vec::new();
		for sym in elf.syms.iter() {
			if Some(sym.st_shndx) != text_index {
				continue;
			}
			let Some(name) = strip_symbol(elf::symbol_name(elf, &sym), "&__OpenCL_", "_kernel") else {
				continue;
			};
			let start = elf::to_usize(sym.st_value)?;
			let region = bytes::slice(inner, start, elf::to_usize(sym.st_size)?, "kernel region")?;
			let stub_size = bytes::u32_at(region, 0, "kernel stub size")? as usize;
			let stub = bytes::slice(region, 0, stub_size, "kernel stub")?;
			let setup = bytes::slice(region, stub_size, KERNEL_SETUP_SIZE, "kernel setup")?;
			let code = &region[stub_size + KERNEL_SETUP_SIZE..];
			kernels.push(InnerKernel {
				name,
				stub: Some(stub),
				setup,
				code,
				code_offset: start + stub_size + KERNEL_SETUP_SIZE,
			});
		}
		Ok(Self {
			data: inner,
			index: NameIndex::new(kernels.iter().map(|kernel| kernel.name)),
			kernels,
		})
	}
}

fn relocations_for(elf: &Elf<'_>, target: Option<usize>) -> Result<Vec<RawRelocation>> {
	let Some(target) = target else {
		return Ok(Vec::new());
	};
	let mut relocs = Vec::new();
	for (section, relocations) in &elf.shdr_relocs {
		if elf.section_headers[*section].sh_info as usize != target {
			continue;
		}
		for reloc in relocations.iter() {
			let sym = elf
				.syms
				.get(reloc.r_sym)
				.ok_or_else(|| malformed(format!("relocation refers to missing symbol {}", reloc.r_sym)))?;
			relocs.push(RawRelocation {
				offset: reloc.r_offset,
				kind: reloc.r_type,
				addend: reloc.r_addend.unwrap_or(0),
				symbol: RelocSymbol {
					section: sym.st_shndx,
					value: sym.st_value,
					kind: sym.st_type(),
				},
			});
		}
	}
	Ok(relocs)
}

impl<'a> NewInnerBinary<'a> {
	pub fn parse(data: &'a [u8]) -> Result<Self> {
		let elf = Elf::parse(data)?;
		if !elf.is_64 {
			return Err(malformed("CL2 inner binary is not ELF64"));
		}
		let text_section = elf::find_section(&elf, TEXT_SECTION);
		let text = match text_section {
			Some(index) => elf::section_bytes(data, &elf.section_headers[index])?,
			None => &[],
		};
		let global_data_section = elf::find_section(&elf, GLOBAL_DATA_SECTION);
		let rw_data_section = elf::find_section(&elf, RW_DATA_SECTION);
		let bss_section = elf::find_section(&elf, BSS_SECTION);
		let sampler_init_section = elf::find_section(&elf, SAMPLER_INIT_SECTION);
		let section = |index: Option<usize>| -> Result<Option<&'a [u8]>> {
			index.map(|index| elf::section_bytes(data, &elf.section_headers[index])).transpose()
		};

		let mut kernels = Vec::new();
		for sym in elf.syms.iter() {
			if sym.st_type() != STT_AMDGPU_HSA_KERNEL {
				continue;
			}
			let Some(name) = strip_symbol(elf::symbol_name(&elf, &sym), "&__OpenCL_", "_kernel") else {
				continue;
			};
			if Some(sym.st_shndx) != text_section {
				return Err(malformed(format!("kernel symbol of '{name}' is not in {TEXT_SECTION}")));
			}
			let start = elf::to_usize(sym.st_value)?;
			let body = bytes::slice(text, start, elf::to_usize(sym.st_size)?, "kernel code")?;
			if body.len() < KERNEL_SETUP_SIZE {
				return Err(malformed(format!("kernel '{name}' is shorter than its setup")));
			}
			kernels.push(InnerKernel {
				name,
				stub: None,
				setup: &body[..KERNEL_SETUP_SIZE],
				code: &body[KERNEL_SETUP_SIZE..],
				code_offset: start + KERNEL_SETUP_SIZE,
			});
		}

		let (bss_size, bss_alignment) = bss_section
			.map(|index| (elf.section_headers[index].sh_size, elf.section_headers[index].sh_addralign))
			.unwrap_or((0, 0));

		Ok(Self {
			data,
			text,
			global_data: section(global_data_section)?,
			rw_data: section(rw_data_section)?,
			sampler_init: section(sampler_init_section)?,
			bss_size,
			bss_alignment,
			index: NameIndex::new(kernels.iter().map(|kernel| kernel.name)),
			kernels,
			text_relocs: relocations_for(&elf, text_section)?,
			global_data_relocs: relocations_for(&elf, global_data_section)?,
			global_data_section,
			rw_data_section,
			bss_section,
			sampler_init_section,
		})
	}
}
