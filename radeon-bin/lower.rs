// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Flat disassembly input and the lowering from parsed containers.
//!
//! The input types hold `Cow` spans: lowered binaries borrow from the container buffer, while
//! hand-built inputs (tests, synthesised listings) own their bytes.

use crate::calnote::CalNoteHeader;
use crate::container::cl2::{RawRelocation, STT_SAMPLER};
use crate::container::gallium::{GalliumArg, ProgInfoEntry};
use crate::container::{AmdContainer, Cl2Container, Cl2Inner, Container, GalliumContainer};
use crate::device::GpuDeviceType;
use crate::error::{Result, malformed};
use std::borrow::Cow;
use tracing::{instrument, trace};

pub type Bytes<'a> = Cow<'a, [u8]>;

pub enum DisasmInput<'a> {
	Amd(AmdInput<'a>),
	AmdCl2(Cl2Input<'a>),
	Gallium(GalliumInput<'a>),
	RawCode(RawCodeInput<'a>),
}

impl DisasmInput<'_> {
	pub fn device(&self) -> GpuDeviceType {
		match self {
			Self::Amd(input) => input.device,
			Self::AmdCl2(input) => input.device,
			Self::Gallium(input) => input.device,
			Self::RawCode(input) => input.device,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmdInput<'a> {
	pub device: GpuDeviceType,
	pub is_64bit: bool,
	pub driver_info: Bytes<'a>,
	pub compile_options: Bytes<'a>,
	pub global_data: Bytes<'a>,
	pub kernels: Vec<AmdKernelInput<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AmdKernelInput<'a> {
	pub name: Cow<'a, str>,
	pub metadata: Option<Bytes<'a>>,
	pub header: Option<Bytes<'a>>,
	pub data: Option<Bytes<'a>>,
	pub code: Option<Bytes<'a>>,
	pub cal_notes: Vec<CalNoteInput<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalNoteInput<'a> {
	pub header: CalNoteHeader,
	pub data: Bytes<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
	/// Low 32 bits of the address.
	Low32,
	High32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
	GlobalData,
	RwData,
	Bss,
}

impl RelocTarget {
	/// Symbol the listing defines at the start of the target section.
	pub fn symbol(self) -> &'static str {
		match self {
			Self::GlobalData => ".gdata",
			Self::RwData => ".ddata",
			Self::Bss => ".bdata",
		}
	}
}

/// Relocation inside one kernel's code; `offset` is relative to the code start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cl2Relocation {
	pub offset: usize,
	pub kind: RelocKind,
	pub target: RelocTarget,
	pub addend: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cl2Input<'a> {
	pub device: GpuDeviceType,
	pub driver_version: u32,
	pub compile_options: Bytes<'a>,
	pub acl_version: Bytes<'a>,
	pub global_data: Option<Bytes<'a>>,
	pub rw_data: Option<Bytes<'a>>,
	pub bss_alignment: u64,
	pub bss_size: u64,
	pub sampler_init: Option<Bytes<'a>>,
	/// `(offset in global data, sampler index)`.
	pub sampler_relocs: Vec<(usize, usize)>,
	pub kernels: Vec<Cl2KernelInput<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cl2KernelInput<'a> {
	pub name: Cow<'a, str>,
	pub metadata: Option<Bytes<'a>>,
	pub isa_metadata: Option<Bytes<'a>>,
	pub stub: Option<Bytes<'a>>,
	pub setup: Option<Bytes<'a>>,
	pub code: Option<Bytes<'a>>,
	pub relocations: Vec<Cl2Relocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalliumInput<'a> {
	pub device: GpuDeviceType,
	pub is_64bit: bool,
	pub global_data: Option<Bytes<'a>>,
	pub code: Bytes<'a>,
	pub kernels: Vec<GalliumKernelInput<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalliumKernelInput<'a> {
	pub name: Cow<'a, str>,
	pub prog_info: [ProgInfoEntry; 3],
	pub offset: u32,
	pub args: Vec<GalliumArg>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCodeInput<'a> {
	pub device: GpuDeviceType,
	pub code: Bytes<'a>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LowerOptions {
	/// Collect CAL notes of legacy kernels.
	pub cal_notes: bool,
}

pub fn lower<'a>(container: &Container<'a>, options: LowerOptions) -> Result<DisasmInput<'a>> {
	Ok(match container {
		Container::Amd(container) => DisasmInput::Amd(lower_amd(container, options)?),
		Container::AmdCl2(container) => DisasmInput::AmdCl2(lower_cl2(container)?),
		Container::Gallium(container) => DisasmInput::Gallium(lower_gallium(container)),
	})
}

pub fn lower_raw(device: GpuDeviceType, code: &[u8]) -> DisasmInput<'_> {
	DisasmInput::RawCode(RawCodeInput {
		device,
		code: Cow::Borrowed(code),
	})
}

#[instrument(level = "debug", skip_all)]
pub fn lower_amd<'a>(container: &AmdContainer<'a>, options: LowerOptions) -> Result<AmdInput<'a>> {
	let mut kernels = Vec::with_capacity(container.metadata.len());
	for (i, info) in container.metadata.iter().enumerate() {
		let mut kernel = AmdKernelInput {
			name: Cow::Borrowed(info.name),
			metadata: Some(Cow::Borrowed(info.data)),
			header: container.header(i, info.name).map(|header| Cow::Borrowed(header.data)),
			..Default::default()
		};
		if let Some(inner) = container.inner_binary(i, info.name) {
			let encoding = inner.select_encoding(container.device)?;
			kernel.code = inner.code(encoding).map(Cow::Borrowed);
			kernel.data = inner.kernel_data(encoding).map(Cow::Borrowed);
			if options.cal_notes {
				kernel.cal_notes = inner
					.notes(encoding)?
					.into_iter()
					.map(|(header, data)| CalNoteInput {
						header,
						data: Cow::Borrowed(data),
					})
					.collect();
			}
		}
		kernels.push(kernel);
	}

	Ok(AmdInput {
		device: container.device,
		is_64bit: container.is_64bit,
		driver_info: Cow::Borrowed(container.driver_info),
		compile_options: Cow::Borrowed(container.compile_options),
		global_data: Cow::Borrowed(container.global_data),
		kernels,
	})
}

#[instrument(level = "debug", skip_all)]
pub fn lower_cl2<'a>(container: &Cl2Container<'a>) -> Result<Cl2Input<'a>> {
	let mut input = Cl2Input {
		device: container.device,
		driver_version: container.driver_version,
		compile_options: Cow::Borrowed(container.compile_options),
		acl_version: Cow::Borrowed(container.acl_version),
		global_data: None,
		rw_data: None,
		bss_alignment: 0,
		bss_size: 0,
		sampler_init: None,
		sampler_relocs: Vec::new(),
		kernels: Vec::new(),
	};

	if let Some(Cl2Inner::New(inner)) = &container.inner {
		input.global_data = inner.global_data.map(Cow::Borrowed);
		input.rw_data = inner.rw_data.map(Cow::Borrowed);
		input.sampler_init = inner.sampler_init.map(Cow::Borrowed);
		input.bss_alignment = inner.bss_alignment;
		input.bss_size = inner.bss_size;
		for reloc in &inner.global_data_relocs {
			if reloc.symbol.kind != STT_SAMPLER {
				return Err(malformed("wrong sampler symbol"));
			}
			if Some(reloc.symbol.section) != inner.sampler_init_section {
				return Err(malformed("wrong section for sampler symbol"));
			}
			if reloc.symbol.value & 7 != 0 {
				return Err(malformed("wrong value of sampler symbol"));
			}
			input.sampler_relocs.push((reloc.offset as usize, (reloc.symbol.value >> 3) as usize));
		}
	}

	if container.metadata.is_empty() {
		return Ok(input);
	}

	let mut code_offsets = Vec::with_capacity(container.metadata.len());
	for (i, info) in container.metadata.iter().enumerate() {
		let mut kernel = Cl2KernelInput {
			name: Cow::Borrowed(info.name),
			metadata: Some(Cow::Borrowed(info.data)),
			isa_metadata: container.isa_metadata(i, info.name).map(|record| Cow::Borrowed(record.data)),
			..Default::default()
		};
		let inner_kernel = container.inner.as_ref().and_then(|inner| inner.kernel(i, info.name));
		if let Some(inner_kernel) = inner_kernel {
			kernel.stub = inner_kernel.stub.map(Cow::Borrowed);
			kernel.setup = Some(Cow::Borrowed(inner_kernel.setup));
			kernel.code = Some(Cow::Borrowed(inner_kernel.code));
		}
		code_offsets.push(inner_kernel.map(|inner_kernel| (inner_kernel.code_offset, inner_kernel.code.len())));
		input.kernels.push(kernel);
	}

	if let Some(Cl2Inner::New(inner)) = &container.inner {
		let mut relocs = inner.text_relocs.clone();
		relocs.sort_by_key(|reloc| reloc.offset);
		let sections = [
			(inner.global_data_section, RelocTarget::GlobalData),
			(inner.rw_data_section, RelocTarget::RwData),
			(inner.bss_section, RelocTarget::Bss),
		];
		assign_relocations(&relocs, &code_offsets, &sections, &mut input.kernels)?;
	}

	Ok(input)
}

/// Hands each kernel the relocations whose offsets fall inside `[code_start, code_start + code_size]`.
/// `relocs` must be sorted by offset; kernels are walked in code order.
fn assign_relocations(
	relocs: &[RawRelocation],
	code_offsets: &[Option<(usize, usize)>],
	sections: &[(Option<usize>, RelocTarget)],
	kernels: &mut [Cl2KernelInput<'_>],
) -> Result<()> {
	let mut order: Vec<(usize, usize, usize)> = code_offsets
		.iter()
		.enumerate()
		.filter_map(|(i, range)| range.map(|(start, size)| (start, size, i)))
		.collect();
	order.sort_unstable();

	let mut next = 0;
	for (code_start, code_size, kernel) in order {
		if relocs.get(next).is_some_and(|reloc| (reloc.offset as usize) < code_start) {
			return Err(malformed("code relocation offset outside kernel code"));
		}
		let code_end = code_start + code_size;
		while let Some(reloc) = relocs.get(next) {
			let offset = reloc.offset as usize;
			if offset > code_end {
				break;
			}
			let target = sections
				.iter()
				.find(|(section, _)| *section == Some(reloc.symbol.section))
				.map(|(_, target)| *target)
				.ok_or_else(|| malformed("symbol is not placed in global data, rw data or bss"))?;
			let kind = match reloc.kind {
				1 => RelocKind::Low32,
				2 => RelocKind::High32,
				other => return Err(malformed(format!("unknown relocation type {other}"))),
			};
			let addend = reloc.addend.wrapping_add(reloc.symbol.value as i64);
			trace!(kernel, offset, ?target, ?kind, addend, "assigned relocation");
			kernels[kernel].relocations.push(Cl2Relocation {
				offset: offset - code_start,
				kind,
				target,
				addend,
			});
			next += 1;
		}
	}

	if next != relocs.len() {
		return Err(malformed("code relocation offset outside kernel code"));
	}
	Ok(())
}

#[instrument(level = "debug", skip_all)]
pub fn lower_gallium<'a>(container: &GalliumContainer<'a>) -> GalliumInput<'a> {
	GalliumInput {
		device: container.device,
		is_64bit: container.is_64bit,
		global_data: container.global_data.map(Cow::Borrowed),
		code: Cow::Borrowed(container.code),
		kernels: container
			.kernels
			.iter()
			.enumerate()
			.map(|(i, kernel)| GalliumKernelInput {
				name: Cow::Borrowed(kernel.name),
				prog_info: container.kernel_prog_info(i),
				offset: kernel.offset,
				args: kernel.args.clone(),
			})
			.collect(),
	}
}
