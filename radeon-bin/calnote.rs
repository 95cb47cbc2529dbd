// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! CAL notes: the typed records a Catalyst CAL inner binary attaches to each encoding.

use crate::bytes::{self, put_u32};
use crate::error::Result;

pub const CAL_NOTE_NAME: [u8; 8] = *b"ATI CAL\0";
pub const CAL_NOTE_HEADER_SIZE: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CalNoteHeader {
	pub name_size: u32,
	pub desc_size: u32,
	pub kind: u32,
	pub name: [u8; 8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalNoteKind {
	ProgInfo = 1,
	Inputs,
	Outputs,
	CondOut,
	Float32Consts,
	Int32Consts,
	Bool32Consts,
	EarlyExit,
	GlobalBuffers,
	ConstantBuffers,
	InputSamplers,
	PersistentBuffers,
	ScratchBuffers,
	SubConstantBuffers,
	UavMailboxSize,
	Uav,
	UavOpMask,
}

impl CalNoteKind {
	pub fn from_code(code: u32) -> Option<Self> {
		Some(match code {
			1 => Self::ProgInfo,
			2 => Self::Inputs,
			3 => Self::Outputs,
			4 => Self::CondOut,
			5 => Self::Float32Consts,
			6 => Self::Int32Consts,
			7 => Self::Bool32Consts,
			8 => Self::EarlyExit,
			9 => Self::GlobalBuffers,
			10 => Self::ConstantBuffers,
			11 => Self::InputSamplers,
			12 => Self::PersistentBuffers,
			13 => Self::ScratchBuffers,
			14 => Self::SubConstantBuffers,
			15 => Self::UavMailboxSize,
			16 => Self::Uav,
			17 => Self::UavOpMask,
			_ => return None,
		})
	}

	pub fn code(self) -> u32 {
		self as u32
	}

	/// Assembler directive introducing a note of this kind.
	pub fn directive(self) -> &'static str {
		match self {
			Self::ProgInfo => ".proginfo",
			Self::Inputs => ".inputs",
			Self::Outputs => ".outputs",
			Self::CondOut => ".condout",
			Self::Float32Consts => ".floatconsts",
			Self::Int32Consts => ".intconsts",
			Self::Bool32Consts => ".boolconsts",
			Self::EarlyExit => ".earlyexit",
			Self::GlobalBuffers => ".globalbuffers",
			Self::ConstantBuffers => ".constantbuffers",
			Self::InputSamplers => ".inputsamplers",
			Self::PersistentBuffers => ".persistentbuffers",
			Self::ScratchBuffers => ".scratchbuffers",
			Self::SubConstantBuffers => ".subconstantbuffers",
			Self::UavMailboxSize => ".uavmailboxsize",
			Self::Uav => ".uav",
			Self::UavOpMask => ".uavopmask",
		}
	}
}

impl CalNoteHeader {
	pub fn new(kind: u32, desc_size: u32) -> Self {
		Self {
			name_size: 8,
			desc_size,
			kind,
			name: CAL_NOTE_NAME,
		}
	}
}

/// Walks the packed `header || descriptor` records of one note segment.
pub fn parse_cal_notes(data: &[u8]) -> Result<Vec<(CalNoteHeader, &[u8])>> {
	let mut notes = Vec::new();
	let mut pos = 0;
	while pos < data.len() {
		let raw = bytes::slice(data, pos, CAL_NOTE_HEADER_SIZE, "CAL note header")?;
		let mut name = [0u8; 8];
		name.copy_from_slice(&raw[12..20]);
		let header = CalNoteHeader {
			name_size: bytes::u32_at(raw, 0, "CAL note name size")?,
			desc_size: bytes::u32_at(raw, 4, "CAL note size")?,
			kind: bytes::u32_at(raw, 8, "CAL note type")?,
			name,
		};
		pos += CAL_NOTE_HEADER_SIZE;
		let desc = bytes::slice(data, pos, header.desc_size as usize, "CAL note data")?;
		pos += desc.len();
		notes.push((header, desc));
	}
	Ok(notes)
}

pub fn encode_cal_note(out: &mut Vec<u8>, kind: u32, desc: &[u8]) {
	let header = CalNoteHeader::new(kind, desc.len() as u32);
	put_u32(out, header.name_size);
	put_u32(out, header.desc_size);
	put_u32(out, header.kind);
	out.extend_from_slice(&header.name);
	out.extend_from_slice(desc);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn kinds_cover_codes_one_to_seventeen() {
		for code in 1..=17 {
			assert_eq!(CalNoteKind::from_code(code).unwrap().code(), code);
		}
		assert_eq!(CalNoteKind::from_code(0x3d), None);
		assert_eq!(CalNoteKind::UavOpMask.directive(), ".uavopmask");
	}

	#[test]
	fn packed_notes_parse() {
		let mut data = Vec::new();
		encode_cal_note(&mut data, 8, &121u32.to_le_bytes());
		encode_cal_note(&mut data, 0x3d, &[]);
		let notes = parse_cal_notes(&data).unwrap();
		assert_eq!(notes.len(), 2);
		assert_eq!(notes[0].0.kind, 8);
		assert_eq!(notes[0].1, &121u32.to_le_bytes());
		assert_eq!(notes[1].0.name, CAL_NOTE_NAME);
		assert!(notes[1].1.is_empty());

		data.truncate(data.len() - 3);
		assert!(parse_cal_notes(&data).is_err());
	}
}
