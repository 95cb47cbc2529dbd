// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! GPU device and architecture tables.
//!
//! Each container family stores the target device as a vendor code: CL2 main binaries keep it in
//! `e_flags` (and the meaning of the code moved between driver releases), legacy Catalyst
//! binaries in `e_machine`, and CAL inner binaries in their encoding dictionary.

use crate::error::{Error, Result};
use std::fmt;

/// First driver version producing the ELF-based ("new") CL2 inner binary.
pub const CL2_NEW_DRIVER_VERSION: u32 = 191205;
const CL2_16_3_DRIVER_VERSION: u32 = 200406;
const CL2_GPUPRO_DRIVER_VERSION: u32 = 203603;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuDeviceType {
	CapeVerde,
	Pitcairn,
	Tahiti,
	Oland,
	Bonaire,
	Spectre,
	Spooky,
	Kalindi,
	Hainan,
	Hawaii,
	Iceland,
	Tonga,
	Mullins,
	Fiji,
	Carrizo,
	Dummy,
	Goose,
	Horse,
	Stoney,
	Ellesmere,
	Baffin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GpuArchitecture {
	Gcn1_0,
	Gcn1_1,
	Gcn1_2,
}

/// Which vendor table a device code was looked up in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTable {
	Cl2,
	Legacy,
	CalInner,
}

impl GpuDeviceType {
	pub const ALL: [GpuDeviceType; 21] = [
		Self::CapeVerde,
		Self::Pitcairn,
		Self::Tahiti,
		Self::Oland,
		Self::Bonaire,
		Self::Spectre,
		Self::Spooky,
		Self::Kalindi,
		Self::Hainan,
		Self::Hawaii,
		Self::Iceland,
		Self::Tonga,
		Self::Mullins,
		Self::Fiji,
		Self::Carrizo,
		Self::Dummy,
		Self::Goose,
		Self::Horse,
		Self::Stoney,
		Self::Ellesmere,
		Self::Baffin,
	];

	pub fn name(self) -> &'static str {
		match self {
			Self::CapeVerde => "CapeVerde",
			Self::Pitcairn => "Pitcairn",
			Self::Tahiti => "Tahiti",
			Self::Oland => "Oland",
			Self::Bonaire => "Bonaire",
			Self::Spectre => "Spectre",
			Self::Spooky => "Spooky",
			Self::Kalindi => "Kalindi",
			Self::Hainan => "Hainan",
			Self::Hawaii => "Hawaii",
			Self::Iceland => "Iceland",
			Self::Tonga => "Tonga",
			Self::Mullins => "Mullins",
			Self::Fiji => "Fiji",
			Self::Carrizo => "Carrizo",
			Self::Dummy => "Dummy",
			Self::Goose => "Goose",
			Self::Horse => "Horse",
			Self::Stoney => "Stoney",
			Self::Ellesmere => "Ellesmere",
			Self::Baffin => "Baffin",
		}
	}

	/// Case-insensitive lookup by the name printed after `.gpu`.
	pub fn from_name(name: &str) -> Option<Self> {
		Self::ALL.into_iter().find(|device| device.name().eq_ignore_ascii_case(name))
	}

	pub fn architecture(self) -> GpuArchitecture {
		match self {
			Self::CapeVerde | Self::Pitcairn | Self::Tahiti | Self::Oland | Self::Hainan => GpuArchitecture::Gcn1_0,
			Self::Bonaire | Self::Spectre | Self::Spooky | Self::Kalindi | Self::Hawaii | Self::Mullins => GpuArchitecture::Gcn1_1,
			_ => GpuArchitecture::Gcn1_2,
		}
	}
}

impl fmt::Display for GpuDeviceType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl GpuArchitecture {
	pub fn name(self) -> &'static str {
		match self {
			Self::Gcn1_0 => "GCN1.0",
			Self::Gcn1_1 => "GCN1.1",
			Self::Gcn1_2 => "GCN1.2",
		}
	}

	/// Accepts both the GCN revision and the family nickname (`SI`, `CI`, `VI`).
	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_uppercase().as_str() {
			"GCN1.0" | "SI" => Some(Self::Gcn1_0),
			"GCN1.1" | "CI" => Some(Self::Gcn1_1),
			"GCN1.2" | "VI" => Some(Self::Gcn1_2),
			_ => None,
		}
	}

	/// Representative device used when only an architecture is requested.
	pub fn lowest_device(self) -> GpuDeviceType {
		match self {
			Self::Gcn1_0 => GpuDeviceType::CapeVerde,
			Self::Gcn1_1 => GpuDeviceType::Bonaire,
			Self::Gcn1_2 => GpuDeviceType::Tonga,
		}
	}

	/// Addressable SGPRs, excluding VCC and the other special registers.
	pub fn max_sgprs(self) -> u32 {
		match self {
			Self::Gcn1_0 | Self::Gcn1_1 => 104,
			Self::Gcn1_2 => 102,
		}
	}

	pub fn max_vgprs(self) -> u32 {
		256
	}
}

impl fmt::Display for GpuArchitecture {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl fmt::Display for DeviceTable {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Cl2 => "CL2 e_flags",
			Self::Legacy => "legacy e_machine",
			Self::CalInner => "CAL encoding machine",
		})
	}
}

use GpuDeviceType::*;

// Drivers before 1912.05
const CL2_TABLE_15_7: &[(u32, GpuDeviceType)] = &[
	(6, Bonaire),
	(1, Spectre),
	(2, Spooky),
	(3, Kalindi),
	(7, Hawaii),
	(8, Iceland),
	(9, Tonga),
	(4, Mullins),
	(16, Fiji),
	(15, Carrizo),
];

const CL2_TABLE_CL2: &[(u32, GpuDeviceType)] = &[
	(6, Bonaire),
	(1, Spectre),
	(2, Spooky),
	(3, Kalindi),
	(7, Hawaii),
	(8, Iceland),
	(9, Tonga),
	(4, Mullins),
	(17, Fiji),
	(16, Carrizo),
	(15, Dummy),
];

const CL2_TABLE_16_3: &[(u32, GpuDeviceType)] = &[
	(6, Bonaire),
	(1, Spectre),
	(2, Spooky),
	(3, Kalindi),
	(7, Hawaii),
	(8, Iceland),
	(9, Tonga),
	(4, Mullins),
	(16, Fiji),
	(15, Carrizo),
	(13, Goose),
	(12, Horse),
	(17, Stoney),
];

const CL2_TABLE_GPUPRO: &[(u32, GpuDeviceType)] = &[
	(6, Bonaire),
	(1, Spectre),
	(2, Spooky),
	(3, Kalindi),
	(7, Hawaii),
	(8, Iceland),
	(9, Tonga),
	(4, Mullins),
	(14, Fiji),
	(13, Carrizo),
	(17, Ellesmere),
	(16, Baffin),
	(15, Stoney),
];

const LEGACY_TABLE: &[(u32, GpuDeviceType)] = &[
	(0x3fd, Tahiti),
	(0x3fe, Pitcairn),
	(0x3ff, CapeVerde),
	(0x402, Oland),
	(0x403, Bonaire),
	(0x404, Spectre),
	(0x405, Spooky),
	(0x406, Kalindi),
	(0x407, Hainan),
	(0x408, Hawaii),
	(0x409, Iceland),
	(0x40a, Tonga),
	(0x40b, Mullins),
	(0x40c, Fiji),
	(0x40d, Carrizo),
	(0x411, Dummy),
];

const CAL_INNER_TABLE: &[(u32, GpuDeviceType)] = &[
	(0x1a, Tahiti),
	(0x1b, Pitcairn),
	(0x1c, CapeVerde),
	(0x20, Oland),
	(0x21, Bonaire),
	(0x22, Spectre),
	(0x23, Spooky),
	(0x24, Kalindi),
	(0x25, Hainan),
	(0x27, Hawaii),
	(0x29, Iceland),
	(0x2a, Tonga),
	(0x2b, Mullins),
	(0x2d, Fiji),
	(0x2e, Carrizo),
	(0x31, Dummy),
];

/// Picks the CL2 `e_flags` table for a driver release.
pub fn cl2_table(driver_version: u32) -> &'static [(u32, GpuDeviceType)] {
	if driver_version < CL2_NEW_DRIVER_VERSION {
		CL2_TABLE_15_7
	} else if driver_version < CL2_16_3_DRIVER_VERSION {
		CL2_TABLE_CL2
	} else if driver_version < CL2_GPUPRO_DRIVER_VERSION {
		CL2_TABLE_16_3
	} else {
		CL2_TABLE_GPUPRO
	}
}

fn lookup(table: &[(u32, GpuDeviceType)], code: u32) -> Option<GpuDeviceType> {
	table.iter().find(|(entry, _)| *entry == code).map(|(_, device)| *device)
}

fn reverse_lookup(table: &[(u32, GpuDeviceType)], device: GpuDeviceType) -> Option<u32> {
	table.iter().find(|(_, entry)| *entry == device).map(|(code, _)| *code)
}

pub fn resolve_cl2(elf_flags: u32, driver_version: u32) -> Result<GpuDeviceType> {
	lookup(cl2_table(driver_version), elf_flags).ok_or(Error::UnknownDevice {
		table: DeviceTable::Cl2,
		code: elf_flags,
	})
}

pub fn resolve_legacy(machine: u16) -> Result<GpuDeviceType> {
	lookup(LEGACY_TABLE, u32::from(machine)).ok_or(Error::UnknownDevice {
		table: DeviceTable::Legacy,
		code: u32::from(machine),
	})
}

pub fn resolve_cal_inner(machine: u32) -> Result<GpuDeviceType> {
	lookup(CAL_INNER_TABLE, machine).ok_or(Error::UnknownDevice {
		table: DeviceTable::CalInner,
		code: machine,
	})
}

/// True when `machine` is a Catalyst `e_machine` code.
pub fn is_legacy_machine(machine: u16) -> bool {
	lookup(LEGACY_TABLE, u32::from(machine)).is_some()
}

/// `e_flags` value a CL2 container for `device` carries under `driver_version`.
pub fn cl2_device_code(device: GpuDeviceType, driver_version: u32) -> Option<u32> {
	reverse_lookup(cl2_table(driver_version), device)
}

pub fn legacy_machine(device: GpuDeviceType) -> Option<u16> {
	reverse_lookup(LEGACY_TABLE, device).and_then(|code| u16::try_from(code).ok())
}

pub fn cal_machine(device: GpuDeviceType) -> Option<u32> {
	reverse_lookup(CAL_INNER_TABLE, device)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cl2_tables_follow_driver_version() {
		assert_eq!(resolve_cl2(16, 180005).unwrap(), Fiji);
		assert_eq!(resolve_cl2(16, 191205).unwrap(), Carrizo);
		assert_eq!(resolve_cl2(15, 191205).unwrap(), Dummy);
		assert_eq!(resolve_cl2(16, 200406).unwrap(), Fiji);
		assert_eq!(resolve_cl2(13, 200406).unwrap(), Goose);
		assert_eq!(resolve_cl2(14, 203603).unwrap(), Fiji);
		assert_eq!(resolve_cl2(17, 203603).unwrap(), Ellesmere);
		assert_eq!(resolve_cl2(2, 999999).unwrap(), Spooky);
	}

	#[test]
	fn unknown_codes_fail() {
		assert!(matches!(resolve_cl2(13, 180005), Err(Error::UnknownDevice { table: DeviceTable::Cl2, code: 13 })));
		assert!(resolve_legacy(0x400).is_err());
		assert!(resolve_cal_inner(0x26).is_err());
	}

	#[test]
	fn legacy_and_inner_tables_agree() {
		for &(machine, device) in LEGACY_TABLE {
			let inner = cal_machine(device).expect("every legacy device has a CAL machine");
			assert_eq!(resolve_cal_inner(inner).unwrap(), device);
			assert_eq!(resolve_legacy(machine as u16).unwrap(), device);
		}
	}

	#[test]
	fn reverse_lookup_round_trips() {
		for driver_version in [180005, 191205, 200406, 203603] {
			for &(code, device) in cl2_table(driver_version) {
				assert_eq!(cl2_device_code(device, driver_version), Some(code));
			}
		}
		assert_eq!(cl2_device_code(Tahiti, 191205), None);
	}

	#[test]
	fn names_and_architectures() {
		assert_eq!(GpuDeviceType::from_name("spooky"), Some(Spooky));
		assert_eq!(GpuDeviceType::from_name("Nope"), None);
		assert_eq!(Spooky.architecture(), GpuArchitecture::Gcn1_1);
		assert_eq!(GpuArchitecture::from_name("vi"), Some(GpuArchitecture::Gcn1_2));
		assert_eq!(GpuArchitecture::Gcn1_2.lowest_device(), Tonga);
		assert_eq!(GpuArchitecture::Gcn1_2.max_sgprs(), 102);
		assert_eq!(Baffin.to_string(), "Baffin");
	}
}
