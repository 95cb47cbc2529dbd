// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Gallium (Mesa clover) containers: a length-prefixed kernel table and section list wrapping an
//! ELF that holds the code.

use crate::bytes::{self, Cursor};
use crate::device::GpuDeviceType;
use crate::elf;
use crate::error::{Result, malformed};
use goblin::elf::Elf;
use tracing::{debug, instrument};

pub const PROG_INFO_ENTRIES_PER_KERNEL: usize = 3;
const SECTION_TEXT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalliumArgType {
	Scalar,
	Constant,
	Global,
	Local,
	Image2dRd,
	Image2dWr,
	Image3dRd,
	Image3dWr,
	Sampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GalliumArgSemantic {
	General,
	GridDimension,
	GridOffset,
	ImageSize,
	ImageFormat,
}

impl GalliumArgType {
	fn from_code(code: u32) -> Option<Self> {
		Some(match code {
			0 => Self::Scalar,
			1 => Self::Constant,
			2 => Self::Global,
			3 => Self::Local,
			4 => Self::Image2dRd,
			5 => Self::Image2dWr,
			6 => Self::Image3dRd,
			7 => Self::Image3dWr,
			8 => Self::Sampler,
			_ => return None,
		})
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::Scalar => "scalar",
			Self::Constant => "constant",
			Self::Global => "global",
			Self::Local => "local",
			Self::Image2dRd => "image2d_rd",
			Self::Image2dWr => "image2d_wr",
			Self::Image3dRd => "image3d_rd",
			Self::Image3dWr => "image3d_wr",
			Self::Sampler => "sampler",
		}
	}
}

impl GalliumArgSemantic {
	fn from_code(code: u32) -> Option<Self> {
		Some(match code {
			0 => Self::General,
			1 => Self::GridDimension,
			2 => Self::GridOffset,
			3 => Self::ImageSize,
			4 => Self::ImageFormat,
			_ => return None,
		})
	}

	pub fn name(self) -> &'static str {
		match self {
			Self::General => "general",
			Self::GridDimension => "griddim",
			Self::GridOffset => "gridoffset",
			Self::ImageSize => "imgsize",
			Self::ImageFormat => "imgformat",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalliumArg {
	pub kind: GalliumArgType,
	pub size: u32,
	pub target_size: u32,
	pub target_align: u32,
	pub sign_extended: bool,
	pub semantic: GalliumArgSemantic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgInfoEntry {
	pub address: u32,
	pub value: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GalliumKernel<'a> {
	pub name: &'a str,
	pub section_id: u32,
	pub offset: u32,
	pub args: Vec<GalliumArg>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GalliumSection<'a> {
	pub id: u32,
	pub kind: u32,
	pub data: &'a [u8],
}

pub struct GalliumContainer<'a> {
	pub device: GpuDeviceType,
	pub kernels: Vec<GalliumKernel<'a>>,
	pub sections: Vec<GalliumSection<'a>>,
	pub is_64bit: bool,
	pub code: &'a [u8],
	/// `.rodata` of the embedded ELF.
	pub global_data: Option<&'a [u8]>,
	/// `.AMDGPU.config` entries, three per kernel.
	pub prog_info: Vec<ProgInfoEntry>,
}

impl<'a> GalliumContainer<'a> {
	#[instrument(level = "debug", skip_all)]
	pub fn parse(data: &'a [u8], device: GpuDeviceType) -> Result<Self> {
		let mut cursor = Cursor::new(data);
		let kernel_count = cursor.u32("kernel count")?;
		let mut kernels = Vec::new();
		for _ in 0..kernel_count {
			let name_len = cursor.u32("kernel name length")? as usize;
			let name = std::str::from_utf8(cursor.bytes(name_len, "kernel name")?).map_err(|_| malformed("kernel name is not UTF-8"))?;
			let section_id = cursor.u32("kernel section")?;
			let offset = cursor.u32("kernel offset")?;
			let arg_count = cursor.u32("argument count")?;
			let mut args = Vec::new();
			for _ in 0..arg_count {
				let kind = cursor.u32("argument type")?;
				let size = cursor.u32("argument size")?;
				let target_size = cursor.u32("argument target size")?;
				let target_align = cursor.u32("argument target alignment")?;
				let sign_extended = cursor.u32("argument extension")? != 0;
				let semantic = cursor.u32("argument semantic")?;
				args.push(GalliumArg {
					kind: GalliumArgType::from_code(kind).ok_or_else(|| malformed(format!("unknown argument type {kind}")))?,
					size,
					target_size,
					target_align,
					sign_extended,
					semantic: GalliumArgSemantic::from_code(semantic).ok_or_else(|| malformed(format!("unknown argument semantic {semantic}")))?,
				});
			}
			kernels.push(GalliumKernel {
				name,
				section_id,
				offset,
				args,
			});
		}

		let section_count = cursor.u32("section count")?;
		let mut sections = Vec::new();
		for _ in 0..section_count {
			let id = cursor.u32("section id")?;
			let kind = cursor.u32("section type")?;
			let size = cursor.u32("section size")?;
			let data_size = cursor.u32("section data size")?;
			if size != data_size.wrapping_add(4) {
				return Err(malformed(format!("section {id} size {size} does not match data size {data_size}")));
			}
			let data = cursor.bytes(data_size as usize, "section data")?;
			sections.push(GalliumSection { id, kind, data });
		}
		if cursor.remaining() != 0 {
			debug!(trailing = cursor.remaining(), at = cursor.position(), "ignoring trailing bytes");
		}

		let elf_bytes = sections
			.iter()
			.find(|section| section.kind == SECTION_TEXT)
			.ok_or_else(|| malformed("no text section"))?
			.data;
		let elf = Elf::parse(elf_bytes)?;
		let code = elf::named_section_bytes(elf_bytes, &elf, ".text")?.ok_or_else(|| malformed("no .text in embedded ELF"))?;
		let global_data = elf::named_section_bytes(elf_bytes, &elf, ".rodata")?;
		let prog_info = elf::named_section_bytes(elf_bytes, &elf, ".AMDGPU.config")?
			.unwrap_or_default()
			.chunks_exact(8)
			.map(|entry| {
				Ok(ProgInfoEntry {
					address: bytes::u32_at(entry, 0, "proginfo address")?,
					value: bytes::u32_at(entry, 4, "proginfo value")?,
				})
			})
			.collect::<Result<Vec<_>>>()?;
		debug!(kernels = kernels.len(), sections = sections.len(), "parsed Gallium container");

		Ok(Self {
			device,
			kernels,
			sections,
			is_64bit: elf.is_64,
			code,
			global_data,
			prog_info,
		})
	}

	/// The three `.AMDGPU.config` entries of the `position`-th kernel; missing entries are zero.
	pub fn kernel_prog_info(&self, position: usize) -> [ProgInfoEntry; PROG_INFO_ENTRIES_PER_KERNEL] {
		let mut entries = [ProgInfoEntry::default(); PROG_INFO_ENTRIES_PER_KERNEL];
		for (i, entry) in entries.iter_mut().enumerate() {
			if let Some(found) = self.prog_info.get(position * PROG_INFO_ENTRIES_PER_KERNEL + i) {
				*entry = *found;
			}
		}
		entries
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use crate::bytes::put_u32;
	use crate::elf::{ElfBuilder, SHF_ALLOC, SHF_EXECINSTR, SectionSpec};

	pub(crate) fn gallium_image(code: &[u8], rodata: &[u8]) -> Vec<u8> {
		let mut builder = ElfBuilder::new(false, 0);
		builder.add_section(SectionSpec::progbits(".text", SHF_ALLOC | SHF_EXECINSTR, code.to_vec()));
		builder.add_section(SectionSpec::progbits(".rodata", SHF_ALLOC, rodata.to_vec()));
		let mut config = Vec::new();
		for value in [0xb848, 0x00c0_0040, 0xb84c, 0x0000_0090, 0xb860, 0] {
			put_u32(&mut config, value);
		}
		builder.add_section(SectionSpec::progbits(".AMDGPU.config", 0, config));
		let elf = builder.build();

		let mut out = Vec::new();
		put_u32(&mut out, 1);
		put_u32(&mut out, 4);
		out.extend_from_slice(b"fill");
		put_u32(&mut out, 0);
		put_u32(&mut out, 8);
		put_u32(&mut out, 2);
		for arg in [[2, 8, 8, 8, 0, 0], [0, 4, 4, 4, 1, 1]] {
			for value in arg {
				put_u32(&mut out, value);
			}
		}
		put_u32(&mut out, 1);
		put_u32(&mut out, 0);
		put_u32(&mut out, SECTION_TEXT);
		put_u32(&mut out, elf.len() as u32 + 4);
		put_u32(&mut out, elf.len() as u32);
		out.extend_from_slice(&elf);
		out
	}

	#[test]
	fn parses_kernel_table_and_embedded_elf() {
		let image = gallium_image(&[0u8; 16], &[5; 4]);
		let container = GalliumContainer::parse(&image, GpuDeviceType::Pitcairn).unwrap();
		assert_eq!(container.kernels.len(), 1);
		let kernel = &container.kernels[0];
		assert_eq!((kernel.name, kernel.offset), ("fill", 8));
		assert_eq!(kernel.args[0].kind, GalliumArgType::Global);
		assert!(kernel.args[1].sign_extended);
		assert_eq!(kernel.args[1].semantic, GalliumArgSemantic::GridDimension);
		assert_eq!(container.code.len(), 16);
		assert_eq!(container.global_data, Some(&[5u8; 4][..]));
		assert_eq!(container.kernel_prog_info(0)[1], ProgInfoEntry { address: 0xb84c, value: 0x90 });
		assert_eq!(container.kernel_prog_info(1)[0], ProgInfoEntry::default());
	}

	#[test]
	fn rejects_bad_section_size() {
		let mut image = gallium_image(&[0u8; 4], &[]);
		// kernel table: 4 + (4 + 4 + 12) + 2 * 24 = 72; section count, id and type follow
		let size_pos = 72 + 12;
		image[size_pos] ^= 1;
		assert!(GalliumContainer::parse(&image, GpuDeviceType::Pitcairn).is_err());
	}
}
