// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Code sections: the instruction decoder seam, label placement and relocated literals.

use super::DisasmFlags;
use crate::lower::{Cl2Relocation, RelocKind};
use std::collections::BTreeSet;
use std::io::{self, Write};

const CODE_INDENT: &str = "        ";

/// One decoded instruction; `size` is in bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
	pub size: usize,
	pub mnemonic: String,
	pub operands: Vec<Operand>,
	/// Trailing comment text, without the comment markers.
	pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
	Text(String),
	/// Branch target as a byte offset into the code section.
	Branch(usize),
	/// 32-bit literal stored at `offset` in the code section; relocations there replace it.
	Literal { offset: usize, value: u32 },
}

pub trait IsaDecoder {
	/// Decodes the instruction at `pos`. `pos` is always inside `code`.
	fn decode(&self, code: &[u8], pos: usize, flags: DisasmFlags) -> Instruction;
}

/// Fallback decoder that knows no opcodes: whole words become `.int`, a short tail `.byte`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawWordDecoder;

impl IsaDecoder for RawWordDecoder {
	fn decode(&self, code: &[u8], pos: usize, flags: DisasmFlags) -> Instruction {
		if let Some(word) = code.get(pos..pos + 4) {
			let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
			return Instruction {
				size: 4,
				mnemonic: ".int".into(),
				operands: vec![Operand::Literal { offset: pos, value }],
				comment: flags.contains(DisasmFlags::FLOAT_LITS).then(|| format!("{:?}", f32::from_bits(value))),
			};
		}
		Instruction {
			size: code.len() - pos,
			mnemonic: ".byte".into(),
			operands: code[pos..].iter().map(|byte| Operand::Text(format!("0x{byte:02x}"))).collect(),
			comment: None,
		}
	}
}

/// Code to render together with what the listing knows about it.
#[derive(Debug, Clone, Copy)]
pub struct CodeSection<'c> {
	pub code: &'c [u8],
	/// Disambiguates numbered labels between code sections of one listing.
	pub id: usize,
	/// Labels the container names (kernel entry points); offsets may lie past the end.
	pub named_labels: &'c [(usize, String)],
	pub relocations: &'c [Cl2Relocation],
}

fn numbered_label(offset: usize, section: usize) -> String {
	format!(".L{offset}_{section}")
}

pub fn relocation_expression(reloc: &Cl2Relocation) -> String {
	let symbol = reloc.target.symbol();
	let (base, wrap) = match reloc.addend {
		0 => (symbol.to_string(), false),
		addend if addend > 0 => (format!("{symbol}+{addend}"), true),
		addend => (format!("{symbol}-{}", addend.unsigned_abs()), true),
	};
	let base = if wrap { format!("({base})") } else { base };
	match reloc.kind {
		RelocKind::Low32 => format!("{base}&0xffffffff"),
		RelocKind::High32 => format!("{base}>>32"),
	}
}

fn hex_code(bytes: &[u8]) -> String {
	let mut words: Vec<String> = bytes
		.chunks_exact(4)
		.map(|word| format!("{:08x}", u32::from_le_bytes([word[0], word[1], word[2], word[3]])))
		.collect();
	let tail = &bytes[bytes.len() & !3..];
	if !tail.is_empty() {
		words.push(tail.iter().map(|byte| format!("{byte:02x}")).collect());
	}
	words.join(" ")
}

enum Label<'l> {
	Numbered(usize),
	Named(&'l str),
}

struct PlacedLabel<'l> {
	offset: usize,
	label: Label<'l>,
}

impl PlacedLabel<'_> {
	fn name(&self, section: usize) -> String {
		match self.label {
			Label::Numbered(offset) => numbered_label(offset, section),
			Label::Named(name) => name.to_string(),
		}
	}
}

/// Writes labels that belong at or before `pos`; labels strictly inside an already written
/// instruction are bound relative to the location counter.
fn write_labels_up_to(out: &mut impl Write, labels: &[PlacedLabel<'_>], next: &mut usize, pos: usize, section: usize) -> io::Result<()> {
	while let Some(label) = labels.get(*next) {
		if label.offset > pos {
			break;
		}
		if label.offset == pos {
			writeln!(out, "{}:", label.name(section))?;
		} else {
			writeln!(out, "{}=.-{}", label.name(section), pos - label.offset)?;
		}
		*next += 1;
	}
	Ok(())
}

pub fn write_code(out: &mut impl Write, decoder: &dyn IsaDecoder, flags: DisasmFlags, section: &CodeSection<'_>) -> io::Result<()> {
	let code = section.code;
	let mut instructions = Vec::new();
	let mut pos = 0;
	while pos < code.len() {
		let mut instruction = decoder.decode(code, pos, flags);
		instruction.size = instruction.size.clamp(1, code.len() - pos);
		let size = instruction.size;
		instructions.push((pos, instruction));
		pos += size;
	}

	let targets: BTreeSet<usize> = instructions
		.iter()
		.flat_map(|(_, instruction)| instruction.operands.iter())
		.filter_map(|operand| match operand {
			Operand::Branch(target) => Some(*target),
			_ => None,
		})
		.collect();
	let mut labels: Vec<PlacedLabel<'_>> = targets
		.iter()
		.map(|&offset| PlacedLabel {
			offset,
			label: Label::Numbered(offset),
		})
		.collect();
	labels.extend(section.named_labels.iter().map(|(offset, name)| PlacedLabel {
		offset: *offset,
		label: Label::Named(name),
	}));
	// stable: numbered labels stay ahead of named ones at the same offset
	labels.sort_by_key(|label| label.offset);

	let mut next_label = 0;
	for (pos, instruction) in &instructions {
		write_labels_up_to(out, &labels, &mut next_label, *pos, section.id)?;
		let mut line = String::from(CODE_INDENT);
		if flags.contains(DisasmFlags::HEX_CODE) {
			line.push_str(&format!("/*{}*/ ", hex_code(&code[*pos..*pos + instruction.size])));
		}
		line.push_str(&instruction.mnemonic);
		let operands: Vec<String> = instruction
			.operands
			.iter()
			.map(|operand| match operand {
				Operand::Text(text) => text.clone(),
				Operand::Branch(target) => match section.named_labels.iter().find(|(offset, _)| offset == target) {
					Some((_, name)) => name.clone(),
					None => numbered_label(*target, section.id),
				},
				Operand::Literal { offset, value } => match section.relocations.iter().find(|reloc| reloc.offset == *offset) {
					Some(reloc) => relocation_expression(reloc),
					None => format!("0x{value:08x}"),
				},
			})
			.collect();
		if !operands.is_empty() {
			line.push(' ');
			line.push_str(&operands.join(", "));
		}
		if let Some(comment) = &instruction.comment {
			line.push_str(&format!(" /* {comment} */"));
		}
		writeln!(out, "{line}")?;
	}

	write_labels_up_to(out, &labels, &mut next_label, code.len(), section.id)?;
	for label in &labels[next_label..] {
		writeln!(out, ".org 0x{:x}", label.offset)?;
		writeln!(out, "{}:", label.name(section.id))?;
	}
	Ok(())
}
