// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! ELF plumbing shared by the container readers and the binary generator.
//!
//! Reading goes through goblin; these helpers only add the bounds-checked section and symbol
//! access the container formats need. goblin does not write ELF, so [`ElfBuilder`] emits the
//! small little-endian images the generator produces: user sections in order, then
//! `.symtab`/`.strtab`/`.shstrtab`, then the section header table.

use crate::bytes::{self, put_u16, put_u32, put_u64};
use crate::error::{Result, malformed};
use goblin::elf::{Elf, SectionHeader, Sym};

pub const ELF_MAGIC: &[u8] = b"\x7fELF";
pub const EM_AMDGPU: u16 = goblin::elf::header::EM_AMDGPU;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOTE: u32 = 7;
pub const SHT_NOBITS: u32 = 8;

pub const SHF_WRITE: u64 = 0x1;
pub const SHF_ALLOC: u64 = 0x2;
pub const SHF_EXECINSTR: u64 = 0x4;

pub const PT_NOTE: u32 = 4;
pub const STB_GLOBAL: u8 = 1;

pub fn section_name<'a>(elf: &Elf<'a>, shdr: &SectionHeader) -> &'a str {
	elf.shdr_strtab.get_at(shdr.sh_name).unwrap_or("")
}

/// Index of the first section called `name`.
pub fn find_section(elf: &Elf<'_>, name: &str) -> Option<usize> {
	elf.section_headers.iter().position(|shdr| section_name(elf, shdr) == name)
}

/// File contents of a section; `SHT_NOBITS` sections are empty.
pub fn section_bytes<'a>(data: &'a [u8], shdr: &SectionHeader) -> Result<&'a [u8]> {
	if shdr.sh_type == SHT_NOBITS {
		return Ok(&[]);
	}
	bytes::slice(data, to_usize(shdr.sh_offset)?, to_usize(shdr.sh_size)?, "section contents")
}

pub fn named_section_bytes<'a>(data: &'a [u8], elf: &Elf<'_>, name: &str) -> Result<Option<&'a [u8]>> {
	find_section(elf, name).map(|index| section_bytes(data, &elf.section_headers[index])).transpose()
}

pub fn symbol_name<'a>(elf: &Elf<'a>, sym: &Sym) -> &'a str {
	elf.strtab.get_at(sym.st_name).unwrap_or("")
}

/// Bytes a symbol covers, taking `st_value` as an offset into its section.
pub fn symbol_bytes<'a>(data: &'a [u8], elf: &Elf<'_>, sym: &Sym) -> Result<&'a [u8]> {
	let shdr = elf
		.section_headers
		.get(sym.st_shndx)
		.ok_or_else(|| malformed(format!("symbol '{}' refers to missing section {}", symbol_name(elf, sym), sym.st_shndx)))?;
	let section = section_bytes(data, shdr)?;
	bytes::slice(section, to_usize(sym.st_value)?, to_usize(sym.st_size)?, "symbol contents")
}

/// One ELF note record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note<'a> {
	pub name: &'a [u8],
	pub kind: u32,
	pub desc: &'a [u8],
}

/// Splits a note section into records (4-byte aligned name and descriptor).
pub fn parse_notes(data: &[u8]) -> Result<Vec<Note<'_>>> {
	let mut notes = Vec::new();
	let mut pos = 0;
	while pos < data.len() {
		let name_size = bytes::u32_at(data, pos, "note name size")? as usize;
		let desc_size = bytes::u32_at(data, pos + 4, "note descriptor size")? as usize;
		let kind = bytes::u32_at(data, pos + 8, "note type")?;
		pos += 12;
		let name = bytes::slice(data, pos, name_size, "note name")?;
		pos = bytes::align_up(pos + name_size, 4);
		let desc = bytes::slice(data, pos, desc_size, "note descriptor")?;
		pos = bytes::align_up(pos + desc_size, 4);
		// names carry their NUL terminator
		let name = name.strip_suffix(b"\0").unwrap_or(name);
		notes.push(Note { name, kind, desc });
	}
	Ok(notes)
}

pub fn encode_note(out: &mut Vec<u8>, name: &str, kind: u32, desc: &[u8]) {
	put_u32(out, name.len() as u32 + 1);
	put_u32(out, desc.len() as u32);
	put_u32(out, kind);
	out.extend_from_slice(name.as_bytes());
	out.push(0);
	out.resize(bytes::align_up(out.len(), 4), 0);
	out.extend_from_slice(desc);
	out.resize(bytes::align_up(out.len(), 4), 0);
}

pub(crate) fn to_usize(value: u64) -> Result<usize> {
	usize::try_from(value).map_err(|_| malformed(format!("offset {value:#x} does not fit in memory")))
}

#[derive(Debug, Clone)]
pub struct SectionSpec {
	pub name: String,
	pub sh_type: u32,
	pub flags: u64,
	pub align: u64,
	pub entsize: u64,
	pub data: Vec<u8>,
	/// Size recorded for `SHT_NOBITS` sections, which have no file data.
	pub nobits_size: u64,
	pub info: u32,
	/// Set `sh_link` to the generated `.symtab`.
	pub link_symtab: bool,
}

impl SectionSpec {
	pub fn progbits(name: &str, flags: u64, data: Vec<u8>) -> Self {
		Self {
			name: name.to_string(),
			sh_type: SHT_PROGBITS,
			flags,
			align: 1,
			entsize: 0,
			data,
			nobits_size: 0,
			info: 0,
			link_symtab: false,
		}
	}

	pub fn note(name: &str, data: Vec<u8>) -> Self {
		Self {
			sh_type: SHT_NOTE,
			align: 4,
			..Self::progbits(name, 0, data)
		}
	}

	pub fn nobits(name: &str, size: u64, align: u64) -> Self {
		Self {
			sh_type: SHT_NOBITS,
			align,
			nobits_size: size,
			..Self::progbits(name, SHF_ALLOC | SHF_WRITE, Vec::new())
		}
	}

	pub fn with_align(mut self, align: u64) -> Self {
		self.align = align;
		self
	}

	fn size(&self) -> u64 {
		if self.sh_type == SHT_NOBITS { self.nobits_size } else { self.data.len() as u64 }
	}
}

#[derive(Debug, Clone)]
pub struct SymbolSpec {
	pub name: String,
	/// Section header index (user sections start at 1).
	pub section: u16,
	pub value: u64,
	pub size: u64,
	pub kind: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct RelaSpec {
	pub offset: u64,
	/// Index into the builder's symbol list.
	pub symbol: usize,
	pub kind: u32,
	pub addend: i64,
}

/// Program header covering a contiguous run of user sections.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec {
	pub p_type: u32,
	pub first_section: usize,
	pub last_section: usize,
}

#[derive(Debug, Clone)]
pub struct ElfBuilder {
	is_64bit: bool,
	e_type: u16,
	machine: u16,
	flags: u32,
	osabi: u8,
	sections: Vec<SectionSpec>,
	symbols: Vec<SymbolSpec>,
	segments: Vec<SegmentSpec>,
}

/// Offsets computed by [`ElfBuilder::layout`].
#[derive(Debug, Clone)]
pub struct Layout {
	/// File offset per user section, indexed like the section list.
	pub section_offsets: Vec<u64>,
	symtab_offset: u64,
	strtab_offset: u64,
	shstrtab_offset: u64,
	shoff: u64,
	strtab: Vec<u8>,
	shstrtab: Vec<u8>,
	name_offsets: Vec<u32>,
	symbol_name_offsets: Vec<u32>,
	special_name_offsets: [u32; 3],
}

impl ElfBuilder {
	pub fn new(is_64bit: bool, machine: u16) -> Self {
		Self {
			is_64bit,
			e_type: 2,
			machine,
			flags: 0,
			osabi: 0,
			sections: Vec::new(),
			symbols: Vec::new(),
			segments: Vec::new(),
		}
	}

	pub fn flags(mut self, flags: u32) -> Self {
		self.flags = flags;
		self
	}

	pub fn osabi(mut self, osabi: u8) -> Self {
		self.osabi = osabi;
		self
	}

	pub fn e_type(mut self, e_type: u16) -> Self {
		self.e_type = e_type;
		self
	}

	/// Appends a section and returns its section header index.
	pub fn add_section(&mut self, section: SectionSpec) -> u16 {
		self.sections.push(section);
		self.sections.len() as u16
	}

	pub fn section_data_mut(&mut self, index: u16) -> &mut Vec<u8> {
		&mut self.sections[usize::from(index) - 1].data
	}

	/// Appends a global symbol and returns its position for [`RelaSpec::symbol`].
	pub fn add_symbol(&mut self, symbol: SymbolSpec) -> usize {
		self.symbols.push(symbol);
		self.symbols.len() - 1
	}

	pub fn add_segment(&mut self, segment: SegmentSpec) {
		self.segments.push(segment);
	}

	/// Adds a `SHT_RELA` section applying to `target`.
	pub fn add_rela(&mut self, name: &str, target: u16, entries: &[RelaSpec]) -> u16 {
		let mut data = Vec::new();
		for entry in entries {
			// null symbol occupies index 0
			let sym = entry.symbol as u64 + 1;
			if self.is_64bit {
				put_u64(&mut data, entry.offset);
				put_u64(&mut data, sym << 32 | u64::from(entry.kind));
				put_u64(&mut data, entry.addend as u64);
			} else {
				put_u32(&mut data, entry.offset as u32);
				put_u32(&mut data, (sym as u32) << 8 | (entry.kind & 0xff));
				put_u32(&mut data, entry.addend as u32);
			}
		}
		self.add_section(SectionSpec {
			sh_type: SHT_RELA,
			align: if self.is_64bit { 8 } else { 4 },
			entsize: if self.is_64bit { 24 } else { 12 },
			info: u32::from(target),
			link_symtab: true,
			..SectionSpec::progbits(name, 0, data)
		})
	}

	fn header_size(&self) -> u64 {
		if self.is_64bit { 64 } else { 52 }
	}

	fn phentsize(&self) -> u64 {
		if self.is_64bit { 56 } else { 32 }
	}

	fn shentsize(&self) -> u64 {
		if self.is_64bit { 64 } else { 40 }
	}

	fn symentsize(&self) -> u64 {
		if self.is_64bit { 24 } else { 16 }
	}

	fn has_symtab(&self) -> bool {
		!self.symbols.is_empty() || self.sections.iter().any(|section| section.link_symtab)
	}

	fn symtab_index(&self) -> u32 {
		self.sections.len() as u32 + 1
	}

	pub fn layout(&self) -> Layout {
		let mut shstrtab = vec![0u8];
		let intern = |table: &mut Vec<u8>, name: &str| -> u32 {
			let offset = table.len() as u32;
			table.extend_from_slice(name.as_bytes());
			table.push(0);
			offset
		};
		let name_offsets = self.sections.iter().map(|section| intern(&mut shstrtab, &section.name)).collect();
		let special_name_offsets = [
			intern(&mut shstrtab, ".symtab"),
			intern(&mut shstrtab, ".strtab"),
			intern(&mut shstrtab, ".shstrtab"),
		];
		let mut strtab = vec![0u8];
		let symbol_name_offsets = self.symbols.iter().map(|symbol| intern(&mut strtab, &symbol.name)).collect();

		let mut pos = self.header_size() + self.phentsize() * self.segments.len() as u64;
		let mut section_offsets = Vec::with_capacity(self.sections.len());
		for section in &self.sections {
			pos = bytes::align_up(pos as usize, section.align as usize) as u64;
			section_offsets.push(pos);
			if section.sh_type != SHT_NOBITS {
				pos += section.data.len() as u64;
			}
		}
		pos = bytes::align_up(pos as usize, 8) as u64;
		let symtab_offset = pos;
		if self.has_symtab() {
			pos += self.symentsize() * (self.symbols.len() as u64 + 1);
		}
		let strtab_offset = pos;
		if self.has_symtab() {
			pos += strtab.len() as u64;
		}
		let shstrtab_offset = pos;
		pos += shstrtab.len() as u64;
		let shoff = bytes::align_up(pos as usize, 8) as u64;

		Layout {
			section_offsets,
			symtab_offset,
			strtab_offset,
			shstrtab_offset,
			shoff,
			strtab,
			shstrtab,
			name_offsets,
			symbol_name_offsets,
			special_name_offsets,
		}
	}

	pub fn build(&self) -> Vec<u8> {
		let layout = self.layout();
		let special_count: u64 = if self.has_symtab() { 3 } else { 1 };
		let shnum = self.sections.len() as u64 + 1 + special_count;
		let shstrndx = shnum - 1;
		let mut out = Vec::new();

		out.extend_from_slice(ELF_MAGIC);
		out.push(if self.is_64bit { 2 } else { 1 });
		out.push(1); // little endian
		out.push(1); // EV_CURRENT
		out.push(self.osabi);
		out.resize(16, 0);
		put_u16(&mut out, self.e_type);
		put_u16(&mut out, self.machine);
		put_u32(&mut out, 1);
		let phoff = if self.segments.is_empty() { 0 } else { self.header_size() };
		self.put_word(&mut out, 0);
		self.put_word(&mut out, phoff);
		self.put_word(&mut out, layout.shoff);
		put_u32(&mut out, self.flags);
		put_u16(&mut out, self.header_size() as u16);
		put_u16(&mut out, self.phentsize() as u16);
		put_u16(&mut out, self.segments.len() as u16);
		put_u16(&mut out, self.shentsize() as u16);
		put_u16(&mut out, shnum as u16);
		put_u16(&mut out, shstrndx as u16);

		for segment in &self.segments {
			let first = segment.first_section - 1;
			let last = segment.last_section - 1;
			let offset = layout.section_offsets[first];
			let end = layout.section_offsets[last] + self.sections[last].size();
			let size = end - offset;
			put_u32(&mut out, segment.p_type);
			if self.is_64bit {
				put_u32(&mut out, 4);
				put_u64(&mut out, offset);
				put_u64(&mut out, 0);
				put_u64(&mut out, 0);
				put_u64(&mut out, size);
				put_u64(&mut out, size);
				put_u64(&mut out, 0);
			} else {
				put_u32(&mut out, offset as u32);
				put_u32(&mut out, 0);
				put_u32(&mut out, 0);
				put_u32(&mut out, size as u32);
				put_u32(&mut out, size as u32);
				put_u32(&mut out, 4);
				put_u32(&mut out, 0);
			}
		}

		for (section, &offset) in self.sections.iter().zip(&layout.section_offsets) {
			if section.sh_type != SHT_NOBITS {
				out.resize(offset as usize, 0);
				out.extend_from_slice(&section.data);
			}
		}

		if self.has_symtab() {
			out.resize(layout.symtab_offset as usize, 0);
			self.put_symbol(&mut out, 0, 0, 0, 0, 0);
			for (symbol, &name) in self.symbols.iter().zip(&layout.symbol_name_offsets) {
				self.put_symbol(&mut out, name, symbol.section, symbol.value, symbol.size, STB_GLOBAL << 4 | symbol.kind);
			}
			out.resize(layout.strtab_offset as usize, 0);
			out.extend_from_slice(&layout.strtab);
		}
		out.resize(layout.shstrtab_offset as usize, 0);
		out.extend_from_slice(&layout.shstrtab);

		out.resize(layout.shoff as usize, 0);
		self.put_section_header(&mut out, [0, 0], [0, 0, 0, 0], [0, 0]);
		for (i, section) in self.sections.iter().enumerate() {
			let link = if section.link_symtab { self.symtab_index() } else { 0 };
			self.put_section_header(
				&mut out,
				[layout.name_offsets[i], section.sh_type],
				[section.flags, layout.section_offsets[i], section.size(), section.align],
				[link, section.info],
			);
			// entsize is only meaningful for tables
			let entsize_pos = out.len() - if self.is_64bit { 8 } else { 4 };
			self.patch_word(&mut out, entsize_pos, section.entsize);
		}
		if self.has_symtab() {
			let symtab_size = self.symentsize() * (self.symbols.len() as u64 + 1);
			self.put_section_header(
				&mut out,
				[layout.special_name_offsets[0], SHT_SYMTAB],
				[0, layout.symtab_offset, symtab_size, 8],
				[self.symtab_index() + 1, 1],
			);
			let entsize_pos = out.len() - if self.is_64bit { 8 } else { 4 };
			self.patch_word(&mut out, entsize_pos, self.symentsize());
			self.put_section_header(
				&mut out,
				[layout.special_name_offsets[1], SHT_STRTAB],
				[0, layout.strtab_offset, layout.strtab.len() as u64, 1],
				[0, 0],
			);
		}
		self.put_section_header(
			&mut out,
			[layout.special_name_offsets[2], SHT_STRTAB],
			[0, layout.shstrtab_offset, layout.shstrtab.len() as u64, 1],
			[0, 0],
		);
		out
	}

	fn put_word(&self, out: &mut Vec<u8>, value: u64) {
		if self.is_64bit {
			put_u64(out, value);
		} else {
			put_u32(out, value as u32);
		}
	}

	fn patch_word(&self, out: &mut [u8], pos: usize, value: u64) {
		if self.is_64bit {
			bytes::set_u64(out, pos, value);
		} else {
			bytes::set_u32(out, pos, value as u32);
		}
	}

	fn put_symbol(&self, out: &mut Vec<u8>, name: u32, section: u16, value: u64, size: u64, info: u8) {
		put_u32(out, name);
		if self.is_64bit {
			out.push(info);
			out.push(0);
			put_u16(out, section);
			put_u64(out, value);
			put_u64(out, size);
		} else {
			put_u32(out, value as u32);
			put_u32(out, size as u32);
			out.push(info);
			out.push(0);
			put_u16(out, section);
		}
	}

	/// `[name, type]`, `[flags, offset, size, align]`, `[link, info]`; entsize is written as 0.
	fn put_section_header(&self, out: &mut Vec<u8>, id: [u32; 2], geometry: [u64; 4], links: [u32; 2]) {
		let [flags, offset, size, align] = geometry;
		put_u32(out, id[0]);
		put_u32(out, id[1]);
		self.put_word(out, flags);
		self.put_word(out, 0);
		self.put_word(out, offset);
		self.put_word(out, size);
		put_u32(out, links[0]);
		put_u32(out, links[1]);
		self.put_word(out, align);
		self.put_word(out, 0);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn built_image_parses_back() {
		let mut builder = ElfBuilder::new(true, EM_AMDGPU).flags(6);
		let text = builder.add_section(SectionSpec::progbits(".text", SHF_ALLOC | SHF_EXECINSTR, vec![1, 2, 3, 4]).with_align(4));
		let data = builder.add_section(SectionSpec::progbits(".data", SHF_ALLOC | SHF_WRITE, vec![9; 16]));
		builder.add_section(SectionSpec::nobits(".bss", 64, 16));
		let sym = builder.add_symbol(SymbolSpec {
			name: "blob".to_string(),
			section: data,
			value: 4,
			size: 8,
			kind: 1,
		});
		builder.add_rela(
			".rela.text",
			text,
			&[RelaSpec {
				offset: 0,
				symbol: sym,
				kind: 2,
				addend: -4,
			}],
		);
		let image = builder.build();

		let elf = Elf::parse(&image).unwrap();
		assert!(elf.is_64);
		assert_eq!(elf.header.e_machine, EM_AMDGPU);
		assert_eq!(elf.header.e_flags, 6);
		assert_eq!(named_section_bytes(&image, &elf, ".text").unwrap(), Some(&[1u8, 2, 3, 4][..]));
		let bss = &elf.section_headers[find_section(&elf, ".bss").unwrap()];
		assert_eq!((bss.sh_size, bss.sh_addralign), (64, 16));

		let blob = elf.syms.iter().find(|sym| symbol_name(&elf, sym) == "blob").unwrap();
		assert_eq!(symbol_bytes(&image, &elf, &blob).unwrap(), &[9; 8]);

		let (_, relocs) = &elf.shdr_relocs[0];
		let reloc = relocs.iter().next().unwrap();
		assert_eq!((reloc.r_sym, reloc.r_type, reloc.r_addend), (1, 2, Some(-4)));
	}

	#[test]
	fn segments_cover_sections_in_elf32() {
		let mut builder = ElfBuilder::new(false, 0x7d);
		let first = builder.add_section(SectionSpec::progbits(".a", 0, vec![0; 20]));
		let second = builder.add_section(SectionSpec::progbits(".b", 0, vec![0; 12]));
		builder.add_segment(SegmentSpec {
			p_type: PT_NOTE,
			first_section: usize::from(first),
			last_section: usize::from(second),
		});
		let image = builder.build();
		let elf = Elf::parse(&image).unwrap();
		assert!(!elf.is_64);
		assert_eq!(elf.program_headers.len(), 1);
		assert_eq!(elf.program_headers[0].p_filesz, 32);
		assert_eq!(elf.program_headers[0].p_offset, builder.layout().section_offsets[0]);
	}

	#[test]
	fn notes_round_trip() {
		let mut data = Vec::new();
		encode_note(&mut data, "AMD", 1, &191205u32.to_le_bytes());
		encode_note(&mut data, "X", 7, &[1, 2, 3]);
		let notes = parse_notes(&data).unwrap();
		assert_eq!(notes.len(), 2);
		assert_eq!(notes[0].name, b"AMD");
		assert_eq!(notes[0].desc, &191205u32.to_le_bytes());
		assert_eq!((notes[1].kind, notes[1].desc), (7, &[1u8, 2, 3][..]));
	}
}
