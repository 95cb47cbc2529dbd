// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Writes AMD OpenCL 2.0 containers from assembled state.
//!
//! The output is what [`Cl2Container::parse`](crate::container::cl2::Cl2Container::parse) reads:
//! a main ELF64 carrying the driver note, ACL version, per-kernel metadata and compile options,
//! with the inner binary in its `.text`. Driver versions from 191205 on get an ELF64 inner binary
//! with HSA sections and relocations; older ones get the flat `stub || setup || code` layout.

use crate::bytes;
use crate::container::cl2::{
	BSS_SECTION, COMPILER_OPTIONS_SYMBOL, DRIVER_NOTE_TYPE, GLOBAL_DATA_SECTION, RW_DATA_SECTION, SAMPLER_INIT_SECTION, STT_AMDGPU_HSA_KERNEL,
	STT_SAMPLER, TEXT_SECTION, isa_metadata_symbol, kernel_symbol, metadata_symbol,
};
use crate::device::{self, CL2_NEW_DRIVER_VERSION, GpuDeviceType};
use crate::elf::{self, EM_AMDGPU, ElfBuilder, RelaSpec, SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SectionSpec, SymbolSpec};
use crate::error::{Error, Result};
use crate::kernel_config::{KernelConfig, SETUP_SIZE};
use crate::lower::{Cl2Relocation, RelocKind, RelocTarget};
use std::borrow::Cow;
use std::collections::HashMap;
use tracing::{debug, instrument};

const STT_NOTYPE: u8 = 0;
const STT_OBJECT: u8 = 1;
const STT_FUNC: u8 = 2;
const KERNEL_ALIGN: usize = 256;
const SAMPLER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraSection {
	pub name: String,
	pub data: Vec<u8>,
}

/// Raw kernel records as written in the source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelRecords {
	pub metadata: Vec<u8>,
	pub isa_metadata: Option<Vec<u8>>,
	pub setup: Option<Vec<u8>>,
	pub stub: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelBody {
	Config(KernelConfig),
	Records(KernelRecords),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cl2KernelOutput {
	pub name: String,
	pub body: KernelBody,
	pub code: Vec<u8>,
	/// Offsets are relative to the start of `code`.
	pub relocations: Vec<Cl2Relocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cl2Output {
	pub device: GpuDeviceType,
	pub driver_version: u32,
	pub acl_version: Vec<u8>,
	pub compile_options: Vec<u8>,
	pub global_data: Vec<u8>,
	pub rw_data: Option<Vec<u8>>,
	pub bss_size: u64,
	pub bss_alignment: u64,
	pub sampler_init: Option<Vec<u8>>,
	/// `(offset in global data, sampler index)` pairs.
	pub sampler_relocs: Vec<(usize, usize)>,
	pub kernels: Vec<Cl2KernelOutput>,
	/// Extra sections of the main binary.
	pub extra_sections: Vec<ExtraSection>,
	/// Extra sections of the inner binary.
	pub inner_extra_sections: Vec<ExtraSection>,
}

fn unsupported(reason: impl Into<String>) -> Error {
	Error::Generate(reason.into())
}

/// A kernel's records with any `.config` already encoded.
struct KernelParts<'o> {
	name: &'o str,
	metadata: Cow<'o, [u8]>,
	isa_metadata: Option<&'o [u8]>,
	setup: Cow<'o, [u8]>,
	stub: Option<Cow<'o, [u8]>>,
	code: &'o [u8],
	relocations: &'o [Cl2Relocation],
}

impl<'o> KernelParts<'o> {
	fn new(kernel: &'o Cl2KernelOutput, old_inner: bool) -> Result<Self> {
		let name = kernel.name.as_str();
		let (metadata, isa_metadata, setup, stub) = match &kernel.body {
			KernelBody::Config(config) => (
				Cow::Owned(config.encode_metadata(name)),
				None,
				Cow::Owned(config.encode_setup()),
				old_inner.then(|| Cow::Owned(config.encode_stub())),
			),
			KernelBody::Records(records) => {
				let setup = records
					.setup
					.as_deref()
					.ok_or_else(|| unsupported(format!("kernel '{name}' needs a .setup or .config")))?;
				if setup.len() != SETUP_SIZE {
					return Err(unsupported(format!("setup of kernel '{name}' is {} bytes, expected {SETUP_SIZE}", setup.len())));
				}
				let stub = match (old_inner, records.stub.as_deref()) {
					(true, Some(stub)) => {
						let declared = bytes::u32_at(stub, 0, "stub size").ok().map(|size| size as usize);
						if declared != Some(stub.len()) {
							return Err(unsupported(format!("stub of kernel '{name}' does not start with its own size")));
						}
						Some(Cow::Borrowed(stub))
					}
					(true, None) => return Err(unsupported(format!("kernel '{name}' needs a .stub for driver versions before {CL2_NEW_DRIVER_VERSION}"))),
					(false, Some(_)) => {
						return Err(unsupported(format!("kernel '{name}' has a .stub, which only driver versions before {CL2_NEW_DRIVER_VERSION} store")));
					}
					(false, None) => None,
				};
				(Cow::Borrowed(records.metadata.as_slice()), records.isa_metadata.as_deref(), Cow::Borrowed(setup), stub)
			}
		};
		Ok(Self {
			name,
			metadata,
			isa_metadata,
			setup,
			stub,
			code: &kernel.code,
			relocations: &kernel.relocations,
		})
	}
}

#[instrument(level = "debug", skip_all)]
pub fn generate(output: &Cl2Output) -> Result<Vec<u8>> {
	let flags = device::cl2_device_code(output.device, output.driver_version).ok_or_else(|| {
		unsupported(format!("{} has no CL2 device code for driver version {}", output.device, output.driver_version))
	})?;
	let new_inner = output.driver_version >= CL2_NEW_DRIVER_VERSION;
	let parts = output.kernels.iter().map(|kernel| KernelParts::new(kernel, !new_inner)).collect::<Result<Vec<_>>>()?;
	let (inner, regions) = if new_inner { (new_inner_binary(output, &parts)?, Vec::new()) } else { old_inner_binary(output, &parts)? };
	debug!(device = %output.device, driver_version = output.driver_version, kernels = parts.len(), new_inner, "generating CL2 container");

	let mut builder = ElfBuilder::new(true, EM_AMDGPU).flags(flags);
	let mut note = Vec::new();
	elf::encode_note(&mut note, "AMD", DRIVER_NOTE_TYPE, &output.driver_version.to_le_bytes());
	builder.add_section(SectionSpec::note(".note", note));
	builder.add_section(SectionSpec::progbits(".comment", 0, output.acl_version.clone()));

	let mut rodata = Vec::new();
	let mut rodata_symbols = Vec::new();
	let mut place = |name: String, data: &[u8]| {
		rodata_symbols.push((name, rodata.len() as u64, data.len() as u64));
		rodata.extend_from_slice(data);
	};
	for part in &parts {
		place(metadata_symbol(part.name), &part.metadata);
		if let Some(isa_metadata) = part.isa_metadata {
			place(isa_metadata_symbol(part.name), isa_metadata);
		}
	}
	place(COMPILER_OPTIONS_SYMBOL.to_string(), &output.compile_options);
	let rodata_index = builder.add_section(SectionSpec::progbits(".rodata", SHF_ALLOC, rodata));
	for (name, value, size) in rodata_symbols {
		builder.add_symbol(SymbolSpec {
			name,
			section: rodata_index,
			value,
			size,
			kind: STT_OBJECT,
		});
	}

	let text_index = builder.add_section(SectionSpec::progbits(".text", SHF_ALLOC | SHF_EXECINSTR, inner));
	for (name, start, size) in regions {
		builder.add_symbol(SymbolSpec {
			name: kernel_symbol(name),
			section: text_index,
			value: start as u64,
			size: size as u64,
			kind: STT_FUNC,
		});
	}
	for extra in &output.extra_sections {
		builder.add_section(SectionSpec::progbits(&extra.name, 0, extra.data.clone()));
	}
	Ok(builder.build())
}

/// Pre-191205 layout: one `stub || setup || code` region per kernel, located by main binary symbols.
fn old_inner_binary<'o>(output: &Cl2Output, parts: &[KernelParts<'o>]) -> Result<(Vec<u8>, Vec<(&'o str, usize, usize)>)> {
	if !output.global_data.is_empty()
		|| output.rw_data.is_some()
		|| output.bss_size != 0
		|| output.sampler_init.is_some()
		|| !output.inner_extra_sections.is_empty()
	{
		return Err(unsupported(format!("driver versions before {CL2_NEW_DRIVER_VERSION} have no inner data sections")));
	}
	let mut inner = Vec::new();
	let mut regions = Vec::with_capacity(parts.len());
	for part in parts {
		if !part.relocations.is_empty() {
			return Err(unsupported(format!("kernel '{}' has relocations, which need driver version {CL2_NEW_DRIVER_VERSION}", part.name)));
		}
		inner.resize(bytes::align_up(inner.len(), KERNEL_ALIGN), 0);
		let start = inner.len();
		inner.extend_from_slice(part.stub.as_deref().unwrap_or_default());
		inner.extend_from_slice(&part.setup);
		inner.extend_from_slice(part.code);
		regions.push((part.name, start, inner.len() - start));
	}
	Ok((inner, regions))
}

fn new_inner_binary(output: &Cl2Output, parts: &[KernelParts<'_>]) -> Result<Vec<u8>> {
	let mut builder = ElfBuilder::new(true, EM_AMDGPU);
	let mut text = Vec::new();
	let mut starts = Vec::with_capacity(parts.len());
	for part in parts {
		text.resize(bytes::align_up(text.len(), KERNEL_ALIGN), 0);
		starts.push(text.len());
		text.extend_from_slice(&part.setup);
		text.extend_from_slice(part.code);
	}
	let text_index = builder.add_section(SectionSpec::progbits(TEXT_SECTION, SHF_ALLOC | SHF_EXECINSTR, text).with_align(KERNEL_ALIGN as u64));

	let global_index = (!output.global_data.is_empty() || !output.sampler_relocs.is_empty())
		.then(|| builder.add_section(SectionSpec::progbits(GLOBAL_DATA_SECTION, SHF_ALLOC, output.global_data.clone()).with_align(8)));
	let rw_index = output
		.rw_data
		.as_ref()
		.map(|data| builder.add_section(SectionSpec::progbits(RW_DATA_SECTION, SHF_ALLOC | SHF_WRITE, data.clone()).with_align(8)));
	let bss_index = (output.bss_size != 0).then(|| builder.add_section(SectionSpec::nobits(BSS_SECTION, output.bss_size, output.bss_alignment)));
	let sampler_index = output
		.sampler_init
		.as_ref()
		.map(|data| builder.add_section(SectionSpec::progbits(SAMPLER_INIT_SECTION, SHF_ALLOC, data.clone()).with_align(8)));
	for extra in &output.inner_extra_sections {
		builder.add_section(SectionSpec::progbits(&extra.name, 0, extra.data.clone()));
	}

	for (part, &start) in parts.iter().zip(&starts) {
		builder.add_symbol(SymbolSpec {
			name: kernel_symbol(part.name),
			section: text_index,
			value: start as u64,
			size: (part.setup.len() + part.code.len()) as u64,
			kind: STT_AMDGPU_HSA_KERNEL,
		});
	}

	let mut section_symbols: HashMap<RelocTarget, usize> = HashMap::new();
	let mut text_relas = Vec::new();
	for (part, &start) in parts.iter().zip(&starts) {
		for reloc in part.relocations {
			if reloc.offset + 4 > part.code.len() {
				return Err(unsupported(format!("relocation at {:#x} lies outside the code of kernel '{}'", reloc.offset, part.name)));
			}
			let (section, section_name) = match reloc.target {
				RelocTarget::GlobalData => (global_index, GLOBAL_DATA_SECTION),
				RelocTarget::RwData => (rw_index, RW_DATA_SECTION),
				RelocTarget::Bss => (bss_index, BSS_SECTION),
			};
			let section = section.ok_or_else(|| unsupported(format!("relocation against {} but that section is empty", reloc.target.symbol())))?;
			let symbol = *section_symbols.entry(reloc.target).or_insert_with(|| {
				builder.add_symbol(SymbolSpec {
					name: format!("__hsa_section{section_name}"),
					section,
					value: 0,
					size: 0,
					kind: STT_NOTYPE,
				})
			});
			text_relas.push(RelaSpec {
				offset: (start + SETUP_SIZE + reloc.offset) as u64,
				symbol,
				kind: match reloc.kind {
					RelocKind::Low32 => 1,
					RelocKind::High32 => 2,
				},
				addend: reloc.addend,
			});
		}
	}
	if !text_relas.is_empty() {
		builder.add_rela(".rela.hsatext", text_index, &text_relas);
	}

	if !output.sampler_relocs.is_empty() {
		let (Some(global_index), Some(sampler_index), Some(sampler_init)) = (global_index, sampler_index, output.sampler_init.as_ref()) else {
			return Err(unsupported("sampler relocations need a .samplerinit section"));
		};
		let mut sampler_symbols: HashMap<usize, usize> = HashMap::new();
		let mut relas = Vec::with_capacity(output.sampler_relocs.len());
		for &(offset, sampler) in &output.sampler_relocs {
			if offset + SAMPLER_SIZE > output.global_data.len() {
				return Err(unsupported(format!("sampler relocation at {offset:#x} lies outside the global data")));
			}
			if (sampler + 1) * SAMPLER_SIZE > sampler_init.len() {
				return Err(unsupported(format!("sampler {sampler} is not in the sampler init section")));
			}
			let symbol = *sampler_symbols.entry(sampler).or_insert_with(|| {
				builder.add_symbol(SymbolSpec {
					name: format!("__hsa_sampler{sampler}"),
					section: sampler_index,
					value: (sampler * SAMPLER_SIZE) as u64,
					size: SAMPLER_SIZE as u64,
					kind: STT_SAMPLER,
				})
			});
			relas.push(RelaSpec {
				offset: offset as u64,
				symbol,
				kind: 1,
				addend: 0,
			});
		}
		builder.add_rela(".rela.hsadata_readonly_agent", global_index, &relas);
	}
	Ok(builder.build())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::container::cl2::{Cl2Container, Cl2Inner};
	use crate::lower::lower_cl2;

	fn output(driver_version: u32, kernels: Vec<Cl2KernelOutput>) -> Cl2Output {
		Cl2Output {
			device: GpuDeviceType::Bonaire,
			driver_version,
			acl_version: b"AMD-COMP-LIB-v0.8 (0.0.SC_BUILD_NUMBER)".to_vec(),
			compile_options: b"-O2".to_vec(),
			global_data: Vec::new(),
			rw_data: None,
			bss_size: 0,
			bss_alignment: 0,
			sampler_init: None,
			sampler_relocs: Vec::new(),
			kernels,
			extra_sections: Vec::new(),
			inner_extra_sections: Vec::new(),
		}
	}

	fn config_kernel(name: &str, code: Vec<u8>) -> Cl2KernelOutput {
		Cl2KernelOutput {
			name: name.to_string(),
			body: KernelBody::Config(KernelConfig {
				used_sgprs: 16,
				used_vgprs: 8,
				..KernelConfig::default()
			}),
			code,
			relocations: Vec::new(),
		}
	}

	#[test]
	fn new_inner_with_data_relocations_and_samplers() {
		let mut out = output(191205, vec![config_kernel("first", vec![0x11; 12]), config_kernel("second", vec![0x22; 8])]);
		out.global_data = vec![7; 24];
		out.rw_data = Some(vec![1, 2, 3, 4]);
		out.bss_size = 100;
		out.bss_alignment = 32;
		out.sampler_init = Some(vec![0; 16]);
		out.sampler_relocs = vec![(8, 1)];
		out.kernels[1].relocations = vec![
			Cl2Relocation {
				offset: 0,
				kind: RelocKind::Low32,
				target: RelocTarget::GlobalData,
				addend: 16,
			},
			Cl2Relocation {
				offset: 4,
				kind: RelocKind::High32,
				target: RelocTarget::Bss,
				addend: 0,
			},
		];
		let image = generate(&out).unwrap();

		let container = Cl2Container::parse(&image).unwrap();
		assert_eq!(container.device, GpuDeviceType::Bonaire);
		assert_eq!(container.driver_version, 191205);
		assert_eq!(container.compile_options, b"-O2");
		assert!(matches!(container.inner, Some(Cl2Inner::New(_))));

		let input = lower_cl2(&container).unwrap();
		assert_eq!(input.global_data.as_deref(), Some(&[7u8; 24][..]));
		assert_eq!(input.rw_data.as_deref(), Some(&[1u8, 2, 3, 4][..]));
		assert_eq!((input.bss_size, input.bss_alignment), (100, 32));
		assert_eq!(input.sampler_relocs, [(8, 1)]);
		let names: Vec<&str> = input.kernels.iter().map(|kernel| kernel.name.as_ref()).collect();
		assert_eq!(names, ["first", "second"]);
		assert_eq!(input.kernels[0].code.as_deref(), Some(&[0x11u8; 12][..]));
		assert!(input.kernels[0].relocations.is_empty());
		assert_eq!(input.kernels[1].relocations, out.kernels[1].relocations);
		assert!(input.kernels[1].stub.is_none());

		let KernelBody::Config(config) = &out.kernels[0].body else { unreachable!() };
		assert_eq!(
			KernelConfig::decode("first", input.kernels[0].setup.as_deref().unwrap(), input.kernels[0].metadata.as_deref().unwrap()).as_ref(),
			Some(config)
		);
	}

	#[test]
	fn old_inner_carries_stubs() {
		let out = output(180005, vec![config_kernel("k", vec![0xab; 4])]);
		let image = generate(&out).unwrap();
		let container = Cl2Container::parse(&image).unwrap();
		assert_eq!(container.driver_version, 180005);
		let input = lower_cl2(&container).unwrap();
		let KernelBody::Config(config) = &out.kernels[0].body else { unreachable!() };
		assert_eq!(input.kernels[0].stub.as_deref(), Some(config.encode_stub().as_slice()));
		assert_eq!(input.kernels[0].code.as_deref(), Some(&[0xabu8; 4][..]));
	}

	#[test]
	fn raw_records_pass_through() {
		let setup = vec![5u8; SETUP_SIZE];
		let kernel = Cl2KernelOutput {
			name: "raw".into(),
			body: KernelBody::Records(KernelRecords {
				metadata: b"opaque metadata".to_vec(),
				isa_metadata: Some(vec![1, 2]),
				setup: Some(setup.clone()),
				stub: None,
			}),
			code: vec![0; 4],
			relocations: Vec::new(),
		};
		let image = generate(&output(191205, vec![kernel])).unwrap();
		let input = lower_cl2(&Cl2Container::parse(&image).unwrap()).unwrap();
		assert_eq!(input.kernels[0].metadata.as_deref(), Some(&b"opaque metadata"[..]));
		assert_eq!(input.kernels[0].isa_metadata.as_deref(), Some(&[1u8, 2][..]));
		assert_eq!(input.kernels[0].setup.as_deref(), Some(setup.as_slice()));
	}

	#[test]
	fn unrepresentable_state_is_rejected() {
		let mut short_setup = output(191205, vec![config_kernel("k", Vec::new())]);
		short_setup.kernels[0].body = KernelBody::Records(KernelRecords {
			setup: Some(vec![0; 16]),
			..KernelRecords::default()
		});
		assert!(matches!(generate(&short_setup), Err(Error::Generate(_))));

		let mut old_with_data = output(180005, Vec::new());
		old_with_data.global_data = vec![1];
		assert!(generate(&old_with_data).is_err());

		let mut dangling = output(191205, vec![config_kernel("k", vec![0; 8])]);
		dangling.kernels[0].relocations.push(Cl2Relocation {
			offset: 0,
			kind: RelocKind::Low32,
			target: RelocTarget::RwData,
			addend: 0,
		});
		assert!(generate(&dangling).is_err());

		let mut samplers = output(191205, Vec::new());
		samplers.global_data = vec![0; 8];
		samplers.sampler_relocs = vec![(0, 0)];
		assert!(generate(&samplers).is_err());
	}
}
