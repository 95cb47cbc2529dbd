// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Declarative CL2 kernel configuration and its binary forms.
//!
//! A [`KernelConfig`] encodes to two records: the 256-byte kernel setup that precedes the code
//! in the inner binary, and the metadata record stored in the main binary's `.rodata`. Decoding
//! only succeeds when re-encoding the result reproduces both records byte for byte, so a
//! disassembled `.config` block always assembles back to the same binary.

use crate::bytes::{self, put_u32, set_u16, set_u32, set_u64};
use bitflags::bitflags;
use std::fmt;

pub const SETUP_SIZE: usize = 256;
pub const METADATA_HEADER_SIZE: usize = 168;
pub const METADATA_ARG_SIZE: usize = 88;
/// Size of the stub the generator writes ahead of each kernel in pre-1912.05 inner binaries.
pub const STUB_SIZE: usize = 16;
/// Hidden arguments (global offsets, printf buffer, queue pointers) ahead of the user ones.
pub const HIDDEN_KERNARG_SIZE: u32 = 48;
pub const MAX_LOCAL_SIZE: u64 = 32768;

const SETUP_PGM_RSRC1: usize = 48;
const SETUP_PGM_RSRC2: usize = 52;
const SETUP_PROPERTIES: usize = 56;
const SETUP_SCRATCH_SIZE: usize = 60;
const SETUP_LOCAL_SIZE: usize = 64;
const SETUP_KERNARG_SIZE: usize = 72;
const SETUP_SGPRS: usize = 84;
const SETUP_VGPRS: usize = 86;

const PROPERTY_USE_SETUP: u32 = 1;
const PROPERTY_USE_SIZES: u32 = 2;
const PROPERTY_USE_ENQUEUE: u32 = 4;

bitflags! {
	/// Work-group dimensions a kernel uses.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
	pub struct Dimensions: u8 {
		const X = 1;
		const Y = 2;
		const Z = 4;
	}
}

impl Dimensions {
	/// Parses a `.dims` operand such as `xyz` or `XZ`.
	pub fn parse(text: &str) -> Option<Self> {
		let mut dims = Self::empty();
		for c in text.chars() {
			dims |= match c.to_ascii_lowercase() {
				'x' => Self::X,
				'y' => Self::Y,
				'z' => Self::Z,
				_ => return None,
			};
		}
		(!dims.is_empty()).then_some(dims)
	}
}

impl fmt::Display for Dimensions {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		for (flag, c) in [(Self::X, 'x'), (Self::Y, 'y'), (Self::Z, 'z')] {
			if self.contains(flag) {
				write!(f, "{c}")?;
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
	Global = 1,
	Constant = 2,
	Local = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageAccess {
	ReadOnly = 1,
	WriteOnly = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
	Value { size: u32 },
	Pointer { space: AddressSpace, align: u32 },
	Sampler,
	Image { access: ImageAccess },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelArg {
	pub name: String,
	pub type_name: String,
	pub kind: ArgKind,
}

impl AddressSpace {
	pub fn name(self) -> &'static str {
		match self {
			Self::Global => "global",
			Self::Constant => "constant",
			Self::Local => "local",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Some(match name {
			"global" => Self::Global,
			"constant" => Self::Constant,
			"local" => Self::Local,
			_ => return None,
		})
	}

	fn from_code(code: u32) -> Option<Self> {
		Some(match code {
			1 => Self::Global,
			2 => Self::Constant,
			3 => Self::Local,
			_ => return None,
		})
	}
}

impl ImageAccess {
	pub fn name(self) -> &'static str {
		match self {
			Self::ReadOnly => "read_only",
			Self::WriteOnly => "write_only",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		Some(match name {
			"read_only" => Self::ReadOnly,
			"write_only" => Self::WriteOnly,
			_ => return None,
		})
	}

	fn from_code(code: u32) -> Option<Self> {
		Some(match code {
			1 => Self::ReadOnly,
			2 => Self::WriteOnly,
			_ => return None,
		})
	}
}

impl ArgKind {
	fn code(self) -> u32 {
		match self {
			Self::Value { .. } => 0,
			Self::Pointer { .. } => 1,
			Self::Sampler => 2,
			Self::Image { .. } => 3,
		}
	}

	/// Bytes the argument occupies in the kernarg segment and their alignment.
	fn kernarg_slot(self) -> (u32, u32) {
		match self {
			Self::Value { size } => (size, size.next_power_of_two().clamp(4, 16)),
			Self::Pointer { .. } | Self::Sampler | Self::Image { .. } => (8, 8),
		}
	}
}

/// Operands of the `.arg` pseudo-op: `NAME, "TYPE", KIND[, PARAM]`.
impl fmt::Display for KernelArg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}, \"{}\", ", self.name, crate::render::data::escape(self.type_name.as_bytes()))?;
		match self.kind {
			ArgKind::Value { size } => write!(f, "value, {size}"),
			ArgKind::Pointer { space, align: 0 } => write!(f, "{}", space.name()),
			ArgKind::Pointer { space, align } => write!(f, "{}, {align}", space.name()),
			ArgKind::Sampler => write!(f, "sampler"),
			ArgKind::Image { access } => write!(f, "image, {}", access.name()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelConfig {
	pub dims: Dimensions,
	pub reqd_work_group_size: [u32; 3],
	pub used_sgprs: u32,
	pub used_vgprs: u32,
	/// Extra bits ORed into the computed PGM_RSRC1.
	pub pgm_rsrc1: u32,
	/// Extra bits ORed into the computed PGM_RSRC2.
	pub pgm_rsrc2: u32,
	pub float_mode: u8,
	pub local_size: u32,
	pub scratch_buffer_size: u32,
	pub priority: u8,
	pub exceptions: u8,
	pub debug_mode: bool,
	pub dx10_clamp: bool,
	pub ieee_mode: bool,
	pub privileged_mode: bool,
	pub tg_size: bool,
	pub use_setup: bool,
	pub use_sizes: bool,
	pub use_enqueue: bool,
	pub samplers: Vec<u32>,
	pub args: Vec<KernelArg>,
}

impl Default for KernelConfig {
	fn default() -> Self {
		Self {
			dims: Dimensions::all(),
			reqd_work_group_size: [0; 3],
			used_sgprs: 0,
			used_vgprs: 0,
			pgm_rsrc1: 0,
			pgm_rsrc2: 0,
			float_mode: 0xc0,
			local_size: 0,
			scratch_buffer_size: 0,
			priority: 0,
			exceptions: 0,
			debug_mode: false,
			dx10_clamp: false,
			ieee_mode: false,
			privileged_mode: false,
			tg_size: false,
			use_setup: false,
			use_sizes: false,
			use_enqueue: false,
			samplers: Vec::new(),
			args: Vec::new(),
		}
	}
}

fn register_blocks(count: u32, granule: u32) -> u32 {
	count.max(1).div_ceil(granule) - 1
}

impl KernelConfig {
	pub fn user_sgprs(&self) -> u32 {
		// private segment buffer and kernarg pointer, then the optional dispatch and queue pointers
		6 + 2 * u32::from(self.use_setup) + 2 * u32::from(self.use_enqueue)
	}

	pub fn kernarg_size(&self) -> u32 {
		self.args.iter().fold(HIDDEN_KERNARG_SIZE, |offset, arg| {
			let (size, align) = arg.kind.kernarg_slot();
			offset.next_multiple_of(align) + size
		})
	}

	fn computed_pgm_rsrc1(&self) -> u32 {
		register_blocks(self.used_vgprs, 4)
			| register_blocks(self.used_sgprs, 8) << 6
			| u32::from(self.priority & 3) << 10
			| u32::from(self.float_mode) << 12
			| u32::from(self.privileged_mode) << 20
			| u32::from(self.dx10_clamp) << 21
			| u32::from(self.debug_mode) << 22
			| u32::from(self.ieee_mode) << 23
	}

	fn computed_pgm_rsrc2(&self) -> u32 {
		let tidig = if self.dims.contains(Dimensions::Z) {
			2
		} else if self.dims.contains(Dimensions::Y) {
			1
		} else {
			0
		};
		u32::from(self.scratch_buffer_size != 0)
			| (self.user_sgprs() & 0x1f) << 1
			| u32::from(self.dims.contains(Dimensions::X)) << 7
			| u32::from(self.dims.contains(Dimensions::Y)) << 8
			| u32::from(self.dims.contains(Dimensions::Z)) << 9
			| u32::from(self.tg_size) << 10
			| tidig << 11
			| (self.local_size.div_ceil(512) & 0x1ff) << 15
			| u32::from(self.exceptions & 0x7f) << 24
	}

	pub fn pgm_rsrc1_value(&self) -> u32 {
		self.computed_pgm_rsrc1() | self.pgm_rsrc1
	}

	pub fn pgm_rsrc2_value(&self) -> u32 {
		self.computed_pgm_rsrc2() | self.pgm_rsrc2
	}

	fn properties(&self) -> u32 {
		(if self.use_setup { PROPERTY_USE_SETUP } else { 0 })
			| (if self.use_sizes { PROPERTY_USE_SIZES } else { 0 })
			| (if self.use_enqueue { PROPERTY_USE_ENQUEUE } else { 0 })
	}

	pub fn encode_setup(&self) -> Vec<u8> {
		let mut setup = vec![0u8; SETUP_SIZE];
		set_u16(&mut setup, 0, 1);
		set_u64(&mut setup, 16, SETUP_SIZE as u64);
		set_u32(&mut setup, SETUP_PGM_RSRC1, self.pgm_rsrc1_value());
		set_u32(&mut setup, SETUP_PGM_RSRC2, self.pgm_rsrc2_value());
		set_u32(&mut setup, SETUP_PROPERTIES, self.properties());
		set_u32(&mut setup, SETUP_SCRATCH_SIZE, self.scratch_buffer_size);
		set_u32(&mut setup, SETUP_LOCAL_SIZE, self.local_size);
		set_u64(&mut setup, SETUP_KERNARG_SIZE, u64::from(self.kernarg_size()));
		set_u16(&mut setup, SETUP_SGPRS, self.used_sgprs as u16);
		set_u16(&mut setup, SETUP_VGPRS, self.used_vgprs as u16);
		setup
	}

	/// `{stub size, kernarg size, 0, 0}`; only pre-1912.05 inner binaries carry stubs.
	pub fn encode_stub(&self) -> Vec<u8> {
		let mut stub = vec![0u8; STUB_SIZE];
		set_u32(&mut stub, 0, STUB_SIZE as u32);
		set_u32(&mut stub, 4, self.kernarg_size());
		stub
	}

	pub fn encode_metadata(&self, kernel_name: &str) -> Vec<u8> {
		let mut out = vec![0u8; METADATA_HEADER_SIZE];
		set_u32(&mut out, 0, METADATA_HEADER_SIZE as u32);
		for (i, size) in self.reqd_work_group_size.iter().enumerate() {
			set_u32(&mut out, 12 + 4 * i, *size);
		}
		set_u32(&mut out, 24, kernel_name.len() as u32);
		set_u32(&mut out, 28, self.samplers.len() as u32);
		set_u32(&mut out, 32, self.args.len() as u32);

		for arg in &self.args {
			let mut entry = vec![0u8; METADATA_ARG_SIZE];
			set_u32(&mut entry, 0, METADATA_ARG_SIZE as u32);
			set_u32(&mut entry, 4, arg.name.len() as u32);
			set_u32(&mut entry, 8, arg.type_name.len() as u32);
			set_u32(&mut entry, 12, arg.kind.code());
			match arg.kind {
				ArgKind::Value { size } => set_u32(&mut entry, 16, size),
				ArgKind::Pointer { space, align } => {
					set_u32(&mut entry, 16, 8);
					set_u32(&mut entry, 20, space as u32);
					set_u32(&mut entry, 24, align);
				}
				ArgKind::Sampler => set_u32(&mut entry, 16, 8),
				ArgKind::Image { access } => {
					set_u32(&mut entry, 16, 8);
					set_u32(&mut entry, 28, access as u32);
				}
			}
			out.extend_from_slice(&entry);
		}

		out.extend_from_slice(kernel_name.as_bytes());
		out.push(0);
		for arg in &self.args {
			out.extend_from_slice(arg.name.as_bytes());
			out.push(0);
			out.extend_from_slice(arg.type_name.as_bytes());
			out.push(0);
		}
		for sampler in &self.samplers {
			put_u32(&mut out, *sampler);
		}
		let total = out.len() as u32;
		set_u32(&mut out, 4, total);
		out
	}

	/// Recovers the configuration behind a setup and metadata record pair, or `None` when the
	/// records are not exactly what [`encode_setup`](Self::encode_setup) and
	/// [`encode_metadata`](Self::encode_metadata) would produce.
	pub fn decode(kernel_name: &str, setup: &[u8], metadata: &[u8]) -> Option<Self> {
		let config = Self::decode_fields(setup, metadata).ok()?;
		(config.encode_setup() == setup && config.encode_metadata(kernel_name) == metadata).then_some(config)
	}

	fn decode_fields(setup: &[u8], metadata: &[u8]) -> crate::Result<Self> {
		if setup.len() != SETUP_SIZE {
			return Err(crate::error::malformed("kernel setup has wrong size"));
		}
		let rsrc1 = bytes::u32_at(setup, SETUP_PGM_RSRC1, "PGM_RSRC1")?;
		let rsrc2 = bytes::u32_at(setup, SETUP_PGM_RSRC2, "PGM_RSRC2")?;
		let properties = bytes::u32_at(setup, SETUP_PROPERTIES, "setup properties")?;
		let dims = Dimensions::from_bits_truncate((rsrc2 >> 7 & 7) as u8);
		if dims.is_empty() {
			return Err(crate::error::malformed("kernel uses no dimensions"));
		}

		let mut config = Self {
			dims,
			used_sgprs: u32::from(bytes::u16_at(setup, SETUP_SGPRS, "SGPR count")?),
			used_vgprs: u32::from(bytes::u16_at(setup, SETUP_VGPRS, "VGPR count")?),
			float_mode: (rsrc1 >> 12) as u8,
			local_size: bytes::u32_at(setup, SETUP_LOCAL_SIZE, "local size")?,
			scratch_buffer_size: bytes::u32_at(setup, SETUP_SCRATCH_SIZE, "scratch size")?,
			priority: (rsrc1 >> 10 & 3) as u8,
			exceptions: (rsrc2 >> 24 & 0x7f) as u8,
			debug_mode: rsrc1 & 1 << 22 != 0,
			dx10_clamp: rsrc1 & 1 << 21 != 0,
			ieee_mode: rsrc1 & 1 << 23 != 0,
			privileged_mode: rsrc1 & 1 << 20 != 0,
			tg_size: rsrc2 & 1 << 10 != 0,
			use_setup: properties & PROPERTY_USE_SETUP != 0,
			use_sizes: properties & PROPERTY_USE_SIZES != 0,
			use_enqueue: properties & PROPERTY_USE_ENQUEUE != 0,
			..Self::default()
		};
		config.pgm_rsrc1 = rsrc1 & !config.computed_pgm_rsrc1();
		config.pgm_rsrc2 = rsrc2 & !config.computed_pgm_rsrc2();

		let header_size = bytes::u32_at(metadata, 0, "metadata header size")? as usize;
		if header_size != METADATA_HEADER_SIZE {
			return Err(crate::error::malformed("unexpected metadata header size"));
		}
		for (i, size) in config.reqd_work_group_size.iter_mut().enumerate() {
			*size = bytes::u32_at(metadata, 12 + 4 * i, "required work-group size")?;
		}
		let name_len = bytes::u32_at(metadata, 24, "kernel name length")? as usize;
		let sampler_count = bytes::u32_at(metadata, 28, "sampler count")? as usize;
		let arg_count = bytes::u32_at(metadata, 32, "argument count")? as usize;

		let mut strings = METADATA_HEADER_SIZE
			.checked_add(arg_count.checked_mul(METADATA_ARG_SIZE).ok_or_else(|| crate::error::malformed("argument count overflow"))?)
			.ok_or_else(|| crate::error::malformed("argument count overflow"))?;
		strings += name_len + 1;
		let mut take_string = |len: usize, what: &str| -> crate::Result<String> {
			let raw = bytes::slice(metadata, strings, len, what)?;
			strings += len + 1;
			String::from_utf8(raw.to_vec()).map_err(|_| crate::error::malformed(format!("{what} is not UTF-8")))
		};
		for i in 0..arg_count {
			let entry = bytes::slice(metadata, METADATA_HEADER_SIZE + i * METADATA_ARG_SIZE, METADATA_ARG_SIZE, "argument entry")?;
			let name = take_string(bytes::u32_at(entry, 4, "argument name length")? as usize, "argument name")?;
			let type_name = take_string(bytes::u32_at(entry, 8, "argument type length")? as usize, "argument type name")?;
			let size = bytes::u32_at(entry, 16, "argument size")?;
			let kind = match bytes::u32_at(entry, 12, "argument kind")? {
				0 => ArgKind::Value { size },
				1 => ArgKind::Pointer {
					space: AddressSpace::from_code(bytes::u32_at(entry, 20, "address space")?)
						.ok_or_else(|| crate::error::malformed("unknown address space"))?,
					align: bytes::u32_at(entry, 24, "pointer alignment")?,
				},
				2 => ArgKind::Sampler,
				3 => ArgKind::Image {
					access: ImageAccess::from_code(bytes::u32_at(entry, 28, "image access")?)
						.ok_or_else(|| crate::error::malformed("unknown image access"))?,
				},
				other => return Err(crate::error::malformed(format!("unknown argument kind {other}"))),
			};
			config.args.push(KernelArg { name, type_name, kind });
		}
		for i in 0..sampler_count {
			config.samplers.push(bytes::u32_at(metadata, strings + 4 * i, "sampler value")?);
		}
		Ok(config)
	}
}
