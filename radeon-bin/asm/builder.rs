// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Section and kernel-configuration state of an AMD OpenCL 2.0 source being assembled.
//!
//! Sections belong to a scope: the global scope owns the main binary's data and extra sections,
//! the inner scope the inner binary's extra sections, and each kernel its code plus either a
//! `.config` block or raw `.metadata`/`.isametadata`/`.setup`/`.stub` records. Switching scope or
//! section saves the section being left and the register allocation of a kernel's code section.

use super::pseudo_ops::{ConfigBool, ConfigValue};
use crate::device::GpuDeviceType;
use crate::generator::{Cl2KernelOutput, Cl2Output, ExtraSection, KernelBody, KernelRecords};
use crate::kernel_config::{Dimensions, KernelArg, KernelConfig, MAX_LOCAL_SIZE};
use crate::lower::{Cl2Relocation, RelocTarget};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type SectionId = usize;
pub type KernelId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BuildError(pub String);

type BuildResult<T> = std::result::Result<T, BuildError>;

fn fail<T>(message: impl Into<String>) -> BuildResult<T> {
	Err(BuildError(message.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelScope {
	Global,
	Inner,
	Kernel(KernelId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
	Code,
	/// Global (read-only) data.
	Data,
	RwData,
	Bss,
	SamplerInit,
	Config,
	Metadata,
	IsaMetadata,
	Setup,
	Stub,
	Extra,
}

impl SectionKind {
	pub fn is_writable(self) -> bool {
		self != Self::Config
	}

	/// The relocation target code refers to this section through.
	pub fn reloc_target(self) -> Option<RelocTarget> {
		match self {
			Self::Data => Some(RelocTarget::GlobalData),
			Self::RwData => Some(RelocTarget::RwData),
			Self::Bss => Some(RelocTarget::Bss),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Section {
	pub kernel: KernelScope,
	pub kind: SectionKind,
	/// Position among the extra sections of the section's binary.
	pub elf_id: Option<u32>,
	pub name: Option<String>,
	pub content: Vec<u8>,
	pub alignment: u64,
	pub relocations: Vec<Cl2Relocation>,
}

impl Section {
	fn new(kernel: KernelScope, kind: SectionKind, name: Option<&str>) -> Self {
		Self {
			kernel,
			kind,
			elf_id: None,
			name: name.map(str::to_string),
			content: Vec::new(),
			alignment: 0,
			relocations: Vec::new(),
		}
	}
}

/// Register counts the instruction encoder has seen allocated in the current code section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterUsage {
	pub sgprs: u32,
	pub vgprs: u32,
	pub flags: u32,
}

/// The instruction encoder's register bookkeeping, saved per kernel while other sections are open.
pub trait RegisterAllocator {
	fn allocated(&self) -> RegisterUsage;
	fn set_allocated(&mut self, usage: RegisterUsage);
}

/// Allocation state for sources without an instruction encoder: it only remembers what it is given.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterCounter {
	usage: RegisterUsage,
}

impl RegisterAllocator for RegisterCounter {
	fn allocated(&self) -> RegisterUsage {
		self.usage
	}

	fn set_allocated(&mut self, usage: RegisterUsage) {
		self.usage = usage;
	}
}

#[derive(Debug)]
struct KernelState {
	name: String,
	code_section: SectionId,
	config_section: Option<SectionId>,
	metadata_section: Option<SectionId>,
	isa_metadata_section: Option<SectionId>,
	setup_section: Option<SectionId>,
	stub_section: Option<SectionId>,
	saved_section: SectionId,
	registers: RegisterUsage,
	arg_names: HashSet<String>,
	config: KernelConfig,
}

impl KernelState {
	fn has_records(&self) -> bool {
		self.metadata_section.is_some() || self.isa_metadata_section.is_some() || self.setup_section.is_some() || self.stub_section.is_some()
	}
}

pub struct AmdCl2Builder {
	device: GpuDeviceType,
	default_driver_version: u32,
	registers: Box<dyn RegisterAllocator>,
	sections: Vec<Section>,
	kernels: Vec<KernelState>,
	current_kernel: KernelScope,
	current_section: SectionId,
	saved_section: SectionId,
	inner_saved_section: SectionId,
	rodata_section: Option<SectionId>,
	data_section: Option<SectionId>,
	bss_section: Option<SectionId>,
	sampler_init_section: Option<SectionId>,
	extra_sections: HashMap<String, SectionId>,
	inner_extra_sections: HashMap<String, SectionId>,
	extra_count: u32,
	inner_extra_count: u32,
	driver_version: Option<u32>,
	acl_version: Option<Vec<u8>>,
	compile_options: Vec<u8>,
	sampler_relocs: Vec<(usize, usize)>,
}

impl AmdCl2Builder {
	/// Starts in the global scope with the global data section open.
	pub fn new(device: GpuDeviceType, default_driver_version: u32, registers: Box<dyn RegisterAllocator>) -> Self {
		Self {
			device,
			default_driver_version,
			registers,
			sections: vec![Section::new(KernelScope::Global, SectionKind::Data, Some(".rodata"))],
			kernels: Vec::new(),
			current_kernel: KernelScope::Global,
			current_section: 0,
			saved_section: 0,
			inner_saved_section: 0,
			rodata_section: Some(0),
			data_section: None,
			bss_section: None,
			sampler_init_section: None,
			extra_sections: HashMap::new(),
			inner_extra_sections: HashMap::new(),
			extra_count: 0,
			inner_extra_count: 0,
			driver_version: None,
			acl_version: None,
			compile_options: Vec::new(),
			sampler_relocs: Vec::new(),
		}
	}

	pub fn device(&self) -> GpuDeviceType {
		self.device
	}

	pub fn set_device(&mut self, device: GpuDeviceType) {
		self.device = device;
	}

	pub fn current_kernel(&self) -> KernelScope {
		self.current_kernel
	}

	pub fn current_section(&self) -> SectionId {
		self.current_section
	}

	pub fn section(&self, id: SectionId) -> &Section {
		&self.sections[id]
	}

	pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
		&mut self.sections[id]
	}

	pub fn kernel_id(&self, name: &str) -> Option<KernelId> {
		self.kernels.iter().position(|kernel| kernel.name == name)
	}

	pub fn kernel_name(&self, id: KernelId) -> &str {
		&self.kernels[id].name
	}

	pub fn registers(&self) -> &dyn RegisterAllocator {
		self.registers.as_ref()
	}

	pub fn registers_mut(&mut self) -> &mut dyn RegisterAllocator {
		self.registers.as_mut()
	}

	fn in_code_section(&self) -> Option<KernelId> {
		match self.current_kernel {
			KernelScope::Kernel(id) if self.kernels[id].code_section == self.current_section => Some(id),
			_ => None,
		}
	}

	fn save_current_registers(&mut self) {
		if let Some(id) = self.in_code_section() {
			self.kernels[id].registers = self.registers.allocated();
		}
	}

	fn restore_current_registers(&mut self) {
		if let Some(id) = self.in_code_section() {
			self.registers.set_allocated(self.kernels[id].registers);
		}
	}

	fn save_current_section(&mut self) {
		match self.current_kernel {
			KernelScope::Global => self.saved_section = self.current_section,
			KernelScope::Inner => self.inner_saved_section = self.current_section,
			KernelScope::Kernel(id) => self.kernels[id].saved_section = self.current_section,
		}
	}

	fn enter(&mut self, kernel: KernelScope, section: SectionId) {
		self.save_current_registers();
		self.save_current_section();
		self.current_kernel = kernel;
		self.current_section = section;
		self.restore_current_registers();
	}

	/// Adds a kernel with an empty code section and makes that section current.
	pub fn add_kernel(&mut self, name: &str) -> KernelId {
		let id = self.kernels.len();
		let code_section = self.sections.len();
		self.sections.push(Section::new(KernelScope::Kernel(id), SectionKind::Code, Some(".text")));
		self.kernels.push(KernelState {
			name: name.to_string(),
			code_section,
			config_section: None,
			metadata_section: None,
			isa_metadata_section: None,
			setup_section: None,
			stub_section: None,
			saved_section: code_section,
			registers: RegisterUsage::default(),
			arg_names: HashSet::new(),
			config: KernelConfig::default(),
		});
		self.save_current_registers();
		self.save_current_section();
		self.current_kernel = KernelScope::Kernel(id);
		self.current_section = code_section;
		self.registers.set_allocated(RegisterUsage::default());
		id
	}

	/// Creates the section `name` in `scope` and makes it current. `.rodata`, `.data` and `.bss`
	/// of the global or inner scope are the global data sections; any other name in a kernel
	/// scope becomes an extra section of the inner binary.
	pub fn add_section(&mut self, name: &str, scope: KernelScope) -> BuildResult<SectionId> {
		let id = self.sections.len();
		let outer = matches!(scope, KernelScope::Global | KernelScope::Inner);
		let singleton = match name {
			".rodata" if outer => Some((SectionKind::Data, &mut self.rodata_section)),
			".data" if outer => Some((SectionKind::RwData, &mut self.data_section)),
			".bss" if outer => Some((SectionKind::Bss, &mut self.bss_section)),
			_ => None,
		};
		let (section, scope) = match singleton {
			Some((kind, slot)) => {
				if slot.is_some() {
					return fail(format!("section '{name}' already exists"));
				}
				*slot = Some(id);
				(Section::new(KernelScope::Global, kind, Some(name)), KernelScope::Global)
			}
			None => {
				let (map, count, scope) = match scope {
					KernelScope::Global => (&mut self.extra_sections, &mut self.extra_count, KernelScope::Global),
					_ => (&mut self.inner_extra_sections, &mut self.inner_extra_count, KernelScope::Inner),
				};
				if map.contains_key(name) {
					return fail(format!("section '{name}' already exists"));
				}
				map.insert(name.to_string(), id);
				let mut section = Section::new(scope, SectionKind::Extra, Some(name));
				section.elf_id = Some(*count);
				*count += 1;
				(section, scope)
			}
		};
		self.sections.push(section);
		self.enter(scope, id);
		Ok(id)
	}

	/// Looks `name` up the way the current scope sees it.
	pub fn section_id(&self, name: &str) -> Option<SectionId> {
		match self.current_kernel {
			KernelScope::Global => match name {
				".rodata" => self.rodata_section,
				".data" => self.data_section,
				".bss" => self.bss_section,
				_ => self.extra_sections.get(name).copied(),
			},
			KernelScope::Inner => self.inner_extra_sections.get(name).copied(),
			KernelScope::Kernel(id) if name == ".text" => Some(self.kernels[id].code_section),
			KernelScope::Kernel(_) => self.inner_extra_sections.get(name).copied(),
		}
	}

	/// Switches to the section `name`, creating it in the current scope when it does not exist.
	pub fn open_section(&mut self, name: &str) -> BuildResult<SectionId> {
		match self.section_id(name) {
			Some(id) => {
				self.set_current_section(id)?;
				Ok(id)
			}
			None => self.add_section(name, self.current_kernel),
		}
	}

	/// Enters `scope`, returning to the section it was last left in. Returns the scope that was
	/// current before, for callers that switch back afterwards.
	pub fn set_current_kernel(&mut self, scope: KernelScope) -> BuildResult<KernelScope> {
		let section = match scope {
			KernelScope::Global => self.saved_section,
			KernelScope::Inner => self.inner_saved_section,
			KernelScope::Kernel(id) => match self.kernels.get(id) {
				Some(kernel) => kernel.saved_section,
				None => return fail(format!("kernel id {id} out of range")),
			},
		};
		let previous = self.current_kernel;
		self.enter(scope, section);
		Ok(previous)
	}

	pub fn set_current_section(&mut self, id: SectionId) -> BuildResult<()> {
		let Some(section) = self.sections.get(id) else {
			return fail(format!("section id {id} out of range"));
		};
		self.enter(section.kernel, id);
		Ok(())
	}

	fn global_section(&mut self, kind: SectionKind) -> SectionId {
		let (slot, name) = match kind {
			SectionKind::Data => (self.rodata_section, Some(".rodata")),
			SectionKind::RwData => (self.data_section, Some(".data")),
			SectionKind::Bss => (self.bss_section, Some(".bss")),
			_ => (self.sampler_init_section, None),
		};
		if let Some(id) = slot {
			return id;
		}
		let id = self.sections.len();
		self.sections.push(Section::new(KernelScope::Global, kind, name));
		match kind {
			SectionKind::Data => self.rodata_section = Some(id),
			SectionKind::RwData => self.data_section = Some(id),
			SectionKind::Bss => self.bss_section = Some(id),
			_ => self.sampler_init_section = Some(id),
		}
		id
	}

	/// `.globaldata`, `.rwdata`, `.bssdata` and `.samplerinit`.
	pub fn go_to_global(&mut self, kind: SectionKind) -> BuildResult<()> {
		if !matches!(kind, SectionKind::Data | SectionKind::RwData | SectionKind::Bss | SectionKind::SamplerInit) {
			return fail("not a global data section");
		}
		let id = self.global_section(kind);
		self.set_current_section(id)
	}

	pub fn go_to_inner(&mut self) -> BuildResult<()> {
		self.set_current_kernel(KernelScope::Inner).map(drop)
	}

	fn current_kernel_id(&self, what: &str) -> BuildResult<KernelId> {
		match self.current_kernel {
			KernelScope::Kernel(id) => Ok(id),
			_ => fail(format!("{what} can be defined only inside kernel")),
		}
	}

	/// `.metadata`, `.isametadata`, `.setup` and `.stub`: raw records, unavailable once `.config` was used.
	pub fn go_to_record(&mut self, kind: SectionKind) -> BuildResult<()> {
		let what = match kind {
			SectionKind::Metadata => "metadata",
			SectionKind::IsaMetadata => "ISA metadata",
			SectionKind::Setup => "setup",
			SectionKind::Stub => "stub",
			_ => return fail("not a kernel record section"),
		};
		let id = self.current_kernel_id(what)?;
		if self.kernels[id].config_section.is_some() {
			return fail(format!("{what} can't be defined if configuration was defined"));
		}
		let next = self.sections.len();
		let kernel = &mut self.kernels[id];
		let slot = match kind {
			SectionKind::Metadata => &mut kernel.metadata_section,
			SectionKind::IsaMetadata => &mut kernel.isa_metadata_section,
			SectionKind::Setup => &mut kernel.setup_section,
			_ => &mut kernel.stub_section,
		};
		let section = match *slot {
			Some(section) => section,
			None => {
				*slot = Some(next);
				self.sections.push(Section::new(KernelScope::Kernel(id), kind, None));
				next
			}
		};
		self.set_current_section(section)
	}

	/// `.config`: the declarative alternative to the raw records.
	pub fn go_to_config(&mut self) -> BuildResult<()> {
		let id = self.current_kernel_id("kernel config")?;
		if self.kernels[id].has_records() {
			return fail("config can't be defined if metadata, setup or stub sections exist");
		}
		let section = match self.kernels[id].config_section {
			Some(section) => section,
			None => {
				let section = self.sections.len();
				self.sections.push(Section::new(KernelScope::Kernel(id), SectionKind::Config, None));
				self.kernels[id].config_section = Some(section);
				section
			}
		};
		self.set_current_section(section)
	}

	fn config_state(&mut self, what: &str) -> BuildResult<&mut KernelState> {
		match self.current_kernel {
			KernelScope::Kernel(id) if self.sections[self.current_section].kind == SectionKind::Config => Ok(&mut self.kernels[id]),
			_ => fail(format!("illegal place of {what}")),
		}
	}

	fn config(&mut self) -> BuildResult<&mut KernelConfig> {
		Ok(&mut self.config_state("configuration pseudo-op")?.config)
	}

	/// Sets a numeric field. Over-wide exceptions, float mode and priority are masked and
	/// reported through the returned warning.
	pub fn set_config_value(&mut self, target: ConfigValue, value: u64) -> BuildResult<Option<String>> {
		let arch = self.device.architecture();
		self.config()?;
		let masked = |bits: u32| -> (u64, Option<String>) {
			let mask = (1u64 << bits) - 1;
			let warning = (value > mask).then(|| format!("value {value:#x} truncated to {bits} bits ({:#x})", value & mask));
			(value & mask, warning)
		};
		let (value, warning) = match target {
			ConfigValue::SgprsNum if value > u64::from(arch.max_sgprs()) => {
				return fail(format!("used SGPRs number out of range (0-{})", arch.max_sgprs()));
			}
			ConfigValue::VgprsNum if value > u64::from(arch.max_vgprs()) => {
				return fail(format!("used VGPRs number out of range (0-{})", arch.max_vgprs()));
			}
			ConfigValue::LocalSize if value > MAX_LOCAL_SIZE => {
				return fail(format!("local size out of range (0-{MAX_LOCAL_SIZE})"));
			}
			ConfigValue::Exceptions => masked(7),
			ConfigValue::FloatMode => masked(8),
			ConfigValue::Priority => masked(2),
			ConfigValue::PgmRsrc1 | ConfigValue::PgmRsrc2 | ConfigValue::ScratchBuffer => match u32::try_from(value) {
				Ok(_) => (value, None),
				Err(_) => return fail(format!("value {value:#x} does not fit in 32 bits")),
			},
			_ => (value, None),
		};
		let config = self.config()?;
		// every branch above bounded the value to its field's width
		match target {
			ConfigValue::SgprsNum => config.used_sgprs = value as u32,
			ConfigValue::VgprsNum => config.used_vgprs = value as u32,
			ConfigValue::PgmRsrc1 => config.pgm_rsrc1 = value as u32,
			ConfigValue::PgmRsrc2 => config.pgm_rsrc2 = value as u32,
			ConfigValue::FloatMode => config.float_mode = value as u8,
			ConfigValue::LocalSize => config.local_size = value as u32,
			ConfigValue::ScratchBuffer => config.scratch_buffer_size = value as u32,
			ConfigValue::Priority => config.priority = value as u8,
			ConfigValue::Exceptions => config.exceptions = value as u8,
		}
		Ok(warning)
	}

	pub fn set_config_bool(&mut self, target: ConfigBool) -> BuildResult<()> {
		let config = self.config()?;
		let field = match target {
			ConfigBool::DebugMode => &mut config.debug_mode,
			ConfigBool::Dx10Clamp => &mut config.dx10_clamp,
			ConfigBool::IeeeMode => &mut config.ieee_mode,
			ConfigBool::PrivMode => &mut config.privileged_mode,
			ConfigBool::TgSize => &mut config.tg_size,
			ConfigBool::UseEnqueue => &mut config.use_enqueue,
			ConfigBool::UseSetup => &mut config.use_setup,
			ConfigBool::UseSizes => &mut config.use_sizes,
		};
		*field = true;
		Ok(())
	}

	pub fn set_dims(&mut self, dims: Dimensions) -> BuildResult<()> {
		self.config()?.dims = dims;
		Ok(())
	}

	pub fn set_cws(&mut self, sizes: [u32; 3]) -> BuildResult<()> {
		self.config()?.reqd_work_group_size = sizes;
		Ok(())
	}

	pub fn add_samplers(&mut self, samplers: &[u32]) -> BuildResult<()> {
		self.config()?.samplers.extend_from_slice(samplers);
		Ok(())
	}

	pub fn add_arg(&mut self, arg: KernelArg) -> BuildResult<()> {
		let state = self.config_state("kernel argument")?;
		if !state.arg_names.insert(arg.name.clone()) {
			return fail(format!("kernel argument '{}' is already defined", arg.name));
		}
		state.config.args.push(arg);
		Ok(())
	}

	/// `.setupargs`: the hidden setup arguments are always laid out ahead of the user ones, so
	/// this only checks placement.
	pub fn setup_args(&mut self) -> BuildResult<()> {
		let state = self.config_state("configuration pseudo-op")?;
		if !state.config.args.is_empty() {
			return fail("setup arguments must precede kernel arguments");
		}
		Ok(())
	}

	pub fn set_driver_version(&mut self, version: u32) {
		self.driver_version = Some(version);
	}

	/// The declared driver version, or the assembler's default.
	pub fn driver_version(&self) -> u32 {
		self.driver_version.unwrap_or(self.default_driver_version)
	}

	pub fn set_acl_version(&mut self, version: Vec<u8>) {
		self.acl_version = Some(version);
	}

	pub fn set_compile_options(&mut self, options: Vec<u8>) {
		self.compile_options = options;
	}

	/// Records that the 8 bytes at `offset` of the global data refer to sampler `sampler` of the
	/// sampler init section.
	pub fn add_sampler_reloc(&mut self, offset: usize, sampler: usize) {
		self.sampler_relocs.push((offset, sampler));
	}

	fn take_section(&mut self, id: Option<SectionId>) -> Option<Vec<u8>> {
		id.map(|id| std::mem::take(&mut self.sections[id].content))
	}

	/// Hands the collected state to the binary generator.
	pub fn finish(mut self) -> Cl2Output {
		let driver_version = self.driver_version();
		let kernels = std::mem::take(&mut self.kernels);
		let kernels = kernels
			.into_iter()
			.map(|kernel| {
				let body = match kernel.config_section {
					Some(_) => KernelBody::Config(kernel.config),
					None => KernelBody::Records(KernelRecords {
						metadata: self.take_section(kernel.metadata_section).unwrap_or_default(),
						isa_metadata: self.take_section(kernel.isa_metadata_section),
						setup: self.take_section(kernel.setup_section),
						stub: self.take_section(kernel.stub_section),
					}),
				};
				let code = &mut self.sections[kernel.code_section];
				Cl2KernelOutput {
					name: kernel.name,
					body,
					code: std::mem::take(&mut code.content),
					relocations: std::mem::take(&mut code.relocations),
				}
			})
			.collect();

		let (bss_size, bss_alignment) = match self.bss_section {
			Some(id) => (self.sections[id].content.len() as u64, self.sections[id].alignment),
			None => (0, 0),
		};
		let extras = |scope: KernelScope, sections: &mut [Section]| -> Vec<ExtraSection> {
			let mut extras: Vec<(u32, ExtraSection)> = sections
				.iter_mut()
				.filter(|section| section.kind == SectionKind::Extra && section.kernel == scope)
				.map(|section| {
					(
						section.elf_id.unwrap_or_default(),
						ExtraSection {
							name: section.name.clone().unwrap_or_default(),
							data: std::mem::take(&mut section.content),
						},
					)
				})
				.collect();
			extras.sort_by_key(|(elf_id, _)| *elf_id);
			extras.into_iter().map(|(_, extra)| extra).collect()
		};
		let extra_sections = extras(KernelScope::Global, self.sections.as_mut_slice());
		let inner_extra_sections = extras(KernelScope::Inner, self.sections.as_mut_slice());

		Cl2Output {
			device: self.device,
			driver_version,
			acl_version: self.acl_version.take().unwrap_or_default(),
			compile_options: std::mem::take(&mut self.compile_options),
			global_data: self.take_section(self.rodata_section).unwrap_or_default(),
			rw_data: self.take_section(self.data_section),
			bss_size,
			bss_alignment,
			sampler_init: self.take_section(self.sampler_init_section),
			sampler_relocs: std::mem::take(&mut self.sampler_relocs),
			kernels,
			extra_sections,
			inner_extra_sections,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kernel_config::ArgKind;
	use std::cell::RefCell;
	use std::rc::Rc;

	/// Allocator whose state the test can inspect after handing it to the builder.
	#[derive(Clone, Default)]
	struct SharedRegisters(Rc<RefCell<RegisterUsage>>);

	impl RegisterAllocator for SharedRegisters {
		fn allocated(&self) -> RegisterUsage {
			*self.0.borrow()
		}

		fn set_allocated(&mut self, usage: RegisterUsage) {
			*self.0.borrow_mut() = usage;
		}
	}

	fn builder() -> AmdCl2Builder {
		AmdCl2Builder::new(GpuDeviceType::Bonaire, 191205, Box::new(RegisterCounter::default()))
	}

	fn usage(sgprs: u32, vgprs: u32) -> RegisterUsage {
		RegisterUsage { sgprs, vgprs, flags: 0 }
	}

	#[test]
	fn kernel_switching_saves_sections_and_registers() {
		let registers = SharedRegisters::default();
		let mut builder = AmdCl2Builder::new(GpuDeviceType::Bonaire, 191205, Box::new(registers.clone()));
		let k0 = builder.add_kernel("k0");
		let k0_code = builder.current_section();
		builder.registers_mut().set_allocated(usage(10, 4));

		let k1 = builder.add_kernel("k1");
		assert_eq!(registers.allocated(), RegisterUsage::default(), "new kernels start unallocated");
		builder.registers_mut().set_allocated(usage(3, 1));
		builder.go_to_config().unwrap();

		assert_eq!(builder.set_current_kernel(KernelScope::Kernel(k0)).unwrap(), KernelScope::Kernel(k1));
		assert_eq!(builder.current_section(), k0_code);
		assert_eq!(registers.allocated(), usage(10, 4));

		builder.set_current_kernel(KernelScope::Kernel(k1)).unwrap();
		assert_eq!(builder.section(builder.current_section()).kind, SectionKind::Config);
		builder.open_section(".text").unwrap();
		assert_eq!(registers.allocated(), usage(3, 1));
		assert!(builder.set_current_kernel(KernelScope::Kernel(7)).is_err());
	}

	#[test]
	fn global_singletons_and_extra_sections() {
		let mut b = builder();
		assert_eq!(b.open_section(".rodata").unwrap(), 0);
		let data = b.open_section(".data").unwrap();
		assert_eq!(b.section(data).kind, SectionKind::RwData);
		let extra = b.open_section(".myextra").unwrap();
		assert_eq!(b.section(extra).elf_id, Some(0));
		assert_eq!(b.open_section(".myextra").unwrap(), extra);
		assert!(b.add_section(".myextra", KernelScope::Global).is_err());
		assert!(b.add_section(".data", KernelScope::Global).is_err());

		b.add_kernel("k");
		let inner = b.open_section(".data").unwrap();
		assert_eq!(b.section(inner).kind, SectionKind::Extra, "kernel scope sections go to the inner binary");
		assert_eq!(b.current_kernel(), KernelScope::Inner);
		b.go_to_global(SectionKind::RwData).unwrap();
		assert_eq!(b.current_section(), data);
		assert_eq!(b.current_kernel(), KernelScope::Global);
	}

	#[test]
	fn config_and_records_exclude_each_other() {
		let mut b = builder();
		b.add_kernel("a");
		b.go_to_record(SectionKind::Metadata).unwrap();
		assert_eq!(b.go_to_config().unwrap_err().0, "config can't be defined if metadata, setup or stub sections exist");

		b.add_kernel("b");
		b.go_to_config().unwrap();
		assert_eq!(b.go_to_record(SectionKind::Stub).unwrap_err().0, "stub can't be defined if configuration was defined");

		b.go_to_inner().unwrap();
		assert!(b.go_to_config().is_err());
		assert_eq!(b.go_to_record(SectionKind::Setup).unwrap_err().0, "setup can be defined only inside kernel");
	}

	#[test]
	fn config_values_are_range_checked() {
		let mut b = builder();
		b.add_kernel("k");
		assert_eq!(b.set_config_value(ConfigValue::SgprsNum, 5).unwrap_err().0, "illegal place of configuration pseudo-op");
		b.go_to_config().unwrap();
		assert!(b.set_config_value(ConfigValue::SgprsNum, 105).is_err());
		assert_eq!(b.set_config_value(ConfigValue::SgprsNum, 104), Ok(None));
		assert!(b.set_config_value(ConfigValue::VgprsNum, 257).is_err());
		assert!(b.set_config_value(ConfigValue::LocalSize, 32769).is_err());
		assert_eq!(b.set_config_value(ConfigValue::LocalSize, 32768), Ok(None));
		let warning = b.set_config_value(ConfigValue::Exceptions, 0x1ff).unwrap();
		assert_eq!(warning.as_deref(), Some("value 0x1ff truncated to 7 bits (0x7f)"));
		assert!(b.set_config_value(ConfigValue::Priority, 5).unwrap().is_some());
		b.set_config_bool(ConfigBool::UseSizes).unwrap();
		b.set_dims(Dimensions::X).unwrap();

		let KernelBody::Config(config) = &b.finish().kernels[0].body else {
			panic!("expected a config body");
		};
		assert_eq!(config.used_sgprs, 104);
		assert_eq!(config.local_size, 32768);
		assert_eq!(config.exceptions, 0x7f);
		assert_eq!(config.priority, 1);
		assert!(config.use_sizes);
		assert_eq!(config.dims, Dimensions::X);
	}

	#[test]
	fn duplicate_argument_names() {
		let mut b = builder();
		b.add_kernel("k");
		let arg = KernelArg {
			name: "x".into(),
			type_name: "int".into(),
			kind: ArgKind::Value { size: 4 },
		};
		assert_eq!(b.add_arg(arg.clone()).unwrap_err().0, "illegal place of kernel argument");
		b.go_to_config().unwrap();
		b.setup_args().unwrap();
		b.add_arg(arg.clone()).unwrap();
		assert_eq!(b.add_arg(arg).unwrap_err().0, "kernel argument 'x' is already defined");
		assert!(b.setup_args().is_err());
	}

	#[test]
	fn finish_collects_sections() {
		let mut b = builder();
		b.set_acl_version(b"acl".to_vec());
		b.section_mut(0).content.extend_from_slice(&[1, 2, 3]);
		let bss = b.open_section(".bss").unwrap();
		b.section_mut(bss).alignment = 16;
		b.section_mut(bss).content.resize(40, 0);
		b.add_kernel("k");
		b.go_to_record(SectionKind::Setup).unwrap();
		let setup = b.current_section();
		b.section_mut(setup).content.push(9);
		b.open_section(".text").unwrap();
		let code = b.current_section();
		b.section_mut(code).content.extend_from_slice(&[0xaa; 8]);

		let output = b.finish();
		assert_eq!(output.driver_version, 191205);
		assert_eq!(output.acl_version, b"acl");
		assert_eq!(output.global_data, [1, 2, 3]);
		assert_eq!((output.bss_size, output.bss_alignment), (40, 16));
		assert_eq!(output.kernels[0].code, [0xaa; 8]);
		let KernelBody::Records(records) = &output.kernels[0].body else {
			panic!("expected raw records");
		};
		assert_eq!(records.setup.as_deref(), Some(&[9u8][..]));
		assert!(records.stub.is_none());
	}
}
