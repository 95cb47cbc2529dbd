// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Structural model of the supported GPU binary containers.
//!
//! Containers borrow the caller's buffer: every kernel record, metadata block and inner binary
//! is a slice of it. Name-indexed lookups are sorted once at construction.

pub mod amd;
pub mod cl2;
pub mod gallium;

pub use amd::{AmdContainer, CalEncoding, CalInnerBinary};
pub use cl2::{Cl2Container, Cl2Inner, NewInnerBinary, OldInnerBinary};
pub use gallium::GalliumContainer;

use crate::device::{self, GpuDeviceType};
use crate::elf::{ELF_MAGIC, EM_AMDGPU};
use crate::error::Result;
use tracing::debug;

/// ELF OS ABI used by ROCm/HSA code objects, which share `EM_AMDGPU` with CL2 containers.
const ELFOSABI_AMDGPU_HSA: u8 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
	Amd,
	AmdCl2,
	Gallium,
}

pub enum Container<'a> {
	Amd(AmdContainer<'a>),
	AmdCl2(Cl2Container<'a>),
	Gallium(GalliumContainer<'a>),
}

fn elf_machine(data: &[u8]) -> Option<u16> {
	if !data.starts_with(ELF_MAGIC) || data.len() < 20 {
		return None;
	}
	Some(u16::from_le_bytes([data[18], data[19]]))
}

/// Catalyst container: ELF32 or ELF64 with a vendor `e_machine`.
pub fn is_amd_container(data: &[u8]) -> bool {
	matches!(data.get(4), Some(1 | 2)) && elf_machine(data).is_some_and(device::is_legacy_machine)
}

/// CL2 container: ELF64 with `EM_AMDGPU` outside the HSA OS ABI.
pub fn is_cl2_container(data: &[u8]) -> bool {
	data.get(4) == Some(&2) && data.get(7) != Some(&ELFOSABI_AMDGPU_HSA) && elf_machine(data) == Some(EM_AMDGPU)
}

/// Classifies a buffer without failing; anything that is not an AMD container is assumed to be
/// a Gallium container as long as it can hold the kernel count.
pub fn probe(data: &[u8]) -> Option<ContainerKind> {
	if is_amd_container(data) {
		Some(ContainerKind::Amd)
	} else if is_cl2_container(data) {
		Some(ContainerKind::AmdCl2)
	} else if data.len() >= 4 {
		Some(ContainerKind::Gallium)
	} else {
		None
	}
}

/// Probes and parses. Gallium containers carry no device code, so `gallium_device` supplies it.
pub fn parse(data: &[u8], gallium_device: GpuDeviceType) -> Result<Container<'_>> {
	let kind = probe(data).ok_or_else(|| crate::error::malformed("buffer too short for any container"))?;
	debug!(?kind, size = data.len(), "probed container");
	Ok(match kind {
		ContainerKind::Amd => Container::Amd(AmdContainer::parse(data)?),
		ContainerKind::AmdCl2 => Container::AmdCl2(Cl2Container::parse(data)?),
		ContainerKind::Gallium => Container::Gallium(GalliumContainer::parse(data, gallium_device)?),
	})
}

/// A named slice of the container (metadata block, kernel header, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRecord<'a> {
	pub name: &'a str,
	pub data: &'a [u8],
}

/// Name-sorted positions into a record list.
#[derive(Debug, Clone, Default)]
pub struct NameIndex {
	entries: Vec<(String, usize)>,
}

impl NameIndex {
	pub fn new<'n>(names: impl IntoIterator<Item = &'n str>) -> Self {
		let mut entries: Vec<(String, usize)> = names.into_iter().enumerate().map(|(i, name)| (name.to_string(), i)).collect();
		// stable: duplicates keep their first occurrence first
		entries.sort_by(|a, b| a.0.cmp(&b.0));
		Self { entries }
	}

	pub fn find(&self, name: &str) -> Option<usize> {
		let pos = self.entries.partition_point(|(entry, _)| entry.as_str() < name);
		self.entries.get(pos).filter(|(entry, _)| entry == name).map(|(_, index)| *index)
	}
}

/// Two-phase lookup: the record at `index` if its name matches, otherwise a search by name.
pub fn resolve_record<'r, T>(records: &'r [T], index: &NameIndex, position: usize, name: &str, name_of: impl Fn(&T) -> &str) -> Option<&'r T> {
	records
		.get(position)
		.filter(|record| name_of(record) == name)
		.or_else(|| index.find(name).and_then(|found| records.get(found)))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn probe_order() {
		let mut legacy = vec![0u8; 64];
		legacy[..4].copy_from_slice(ELF_MAGIC);
		legacy[4] = 1;
		legacy[18..20].copy_from_slice(&0x405u16.to_le_bytes());
		assert_eq!(probe(&legacy), Some(ContainerKind::Amd));

		let mut cl2 = legacy.clone();
		cl2[4] = 2;
		cl2[18..20].copy_from_slice(&EM_AMDGPU.to_le_bytes());
		assert_eq!(probe(&cl2), Some(ContainerKind::AmdCl2));

		cl2[7] = ELFOSABI_AMDGPU_HSA;
		assert_eq!(probe(&cl2), Some(ContainerKind::Gallium));
		assert_eq!(probe(&[1, 2]), None);
	}

	#[test]
	fn two_phase_lookup() {
		let records = [("a", 1), ("b", 2), ("c", 3)];
		let index = NameIndex::new(records.iter().map(|r| r.0));
		fn name_of<'r>(record: &'r (&'static str, i32)) -> &'r str {
			record.0
		}
		assert_eq!(resolve_record(&records, &index, 1, "b", name_of), Some(&("b", 2)));
		assert_eq!(resolve_record(&records, &index, 0, "c", name_of), Some(&("c", 3)));
		assert_eq!(resolve_record(&records, &index, 9, "a", name_of), Some(&("a", 1)));
		assert_eq!(resolve_record(&records, &index, 0, "zz", name_of), None);
	}

	#[test]
	fn name_index_prefers_first_duplicate() {
		let index = NameIndex::new(["x", "y", "x"]);
		assert_eq!(index.find("x"), Some(0));
		assert_eq!(index.find("y"), Some(1));
		assert_eq!(index.find("w"), None);
	}
}
