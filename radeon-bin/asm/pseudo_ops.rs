// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Format-specific pseudo-ops of AMD OpenCL 2.0 sources, each bound to one builder operation.

/// Numeric kernel configuration fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigValue {
	SgprsNum,
	VgprsNum,
	PgmRsrc1,
	PgmRsrc2,
	FloatMode,
	LocalSize,
	ScratchBuffer,
	Priority,
	Exceptions,
}

/// Kernel configuration switches; naming one turns it on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigBool {
	DebugMode,
	Dx10Clamp,
	IeeeMode,
	PrivMode,
	TgSize,
	UseEnqueue,
	UseSetup,
	UseSizes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoOp {
	AclVersion,
	Arg,
	BssData,
	CompileOptions,
	Config,
	Cws,
	Dims,
	DriverVersion,
	GetDriverVersion,
	GlobalData,
	Inner,
	IsaMetadata,
	Metadata,
	RwData,
	Sampler,
	SamplerInit,
	SamplerReloc,
	Setup,
	SetupArgs,
	Stub,
	Value(ConfigValue),
	Bool(ConfigBool),
}

/// Sorted by name for [`lookup`].
pub const PSEUDO_OPS: [(&str, PseudoOp); 37] = [
	("acl_version", PseudoOp::AclVersion),
	("arg", PseudoOp::Arg),
	("bssdata", PseudoOp::BssData),
	("compile_options", PseudoOp::CompileOptions),
	("config", PseudoOp::Config),
	("cws", PseudoOp::Cws),
	("debugmode", PseudoOp::Bool(ConfigBool::DebugMode)),
	("dims", PseudoOp::Dims),
	("driver_version", PseudoOp::DriverVersion),
	("dx10clamp", PseudoOp::Bool(ConfigBool::Dx10Clamp)),
	("exceptions", PseudoOp::Value(ConfigValue::Exceptions)),
	("floatmode", PseudoOp::Value(ConfigValue::FloatMode)),
	("get_driver_version", PseudoOp::GetDriverVersion),
	("globaldata", PseudoOp::GlobalData),
	("ieeemode", PseudoOp::Bool(ConfigBool::IeeeMode)),
	("inner", PseudoOp::Inner),
	("isametadata", PseudoOp::IsaMetadata),
	("localsize", PseudoOp::Value(ConfigValue::LocalSize)),
	("metadata", PseudoOp::Metadata),
	("pgmrsrc1", PseudoOp::Value(ConfigValue::PgmRsrc1)),
	("pgmrsrc2", PseudoOp::Value(ConfigValue::PgmRsrc2)),
	("priority", PseudoOp::Value(ConfigValue::Priority)),
	("privmode", PseudoOp::Bool(ConfigBool::PrivMode)),
	("rwdata", PseudoOp::RwData),
	("sampler", PseudoOp::Sampler),
	("samplerinit", PseudoOp::SamplerInit),
	("samplerreloc", PseudoOp::SamplerReloc),
	("scratchbuffer", PseudoOp::Value(ConfigValue::ScratchBuffer)),
	("setup", PseudoOp::Setup),
	("setupargs", PseudoOp::SetupArgs),
	("sgprsnum", PseudoOp::Value(ConfigValue::SgprsNum)),
	("stub", PseudoOp::Stub),
	("tgsize", PseudoOp::Bool(ConfigBool::TgSize)),
	("useenqueue", PseudoOp::Bool(ConfigBool::UseEnqueue)),
	("usesetup", PseudoOp::Bool(ConfigBool::UseSetup)),
	("usesizes", PseudoOp::Bool(ConfigBool::UseSizes)),
	("vgprsnum", PseudoOp::Value(ConfigValue::VgprsNum)),
];

/// Looks up a directive such as `.sgprsnum`; the leading dot is required.
pub fn lookup(directive: &str) -> Option<PseudoOp> {
	let name = directive.strip_prefix('.')?;
	PSEUDO_OPS.binary_search_by(|(entry, _)| (*entry).cmp(name)).ok().map(|index| PSEUDO_OPS[index].1)
}
