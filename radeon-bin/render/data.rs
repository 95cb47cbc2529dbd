// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Data directives: `.byte`/`.int` dumps with `.fill` run compression, and `.ascii` strings.

use std::io::{self, Write};

const BYTES_PER_LINE: usize = 8;
const WORDS_PER_LINE: usize = 4;
const STRING_CHUNK: usize = 72;
const STRING_ESCAPED_MAX: usize = 76;

pub(crate) fn indent(second_level: bool) -> &'static str {
	if second_level { "        " } else { "    " }
}

/// Escaped form of one byte, C style.
fn escape_byte(byte: u8, out: &mut String) {
	match byte {
		0x07 => out.push_str("\\a"),
		0x08 => out.push_str("\\b"),
		b'\t' => out.push_str("\\t"),
		b'\n' => out.push_str("\\n"),
		0x0b => out.push_str("\\v"),
		0x0c => out.push_str("\\f"),
		b'\r' => out.push_str("\\r"),
		b'"' => out.push_str("\\\""),
		b'\\' => out.push_str("\\\\"),
		0x20..=0x7e => out.push(char::from(byte)),
		_ => {
			out.push('\\');
			out.push(char::from(b'0' + (byte >> 6)));
			out.push(char::from(b'0' + ((byte >> 3) & 7)));
			out.push(char::from(b'0' + (byte & 7)));
		}
	}
}

pub fn escape(data: &[u8]) -> String {
	let mut out = String::with_capacity(data.len());
	for &byte in data {
		escape_byte(byte, &mut out);
	}
	out
}

/// Escapes a prefix of `data` whose escaped form fits in `max_len`; returns the number of source
/// bytes consumed. At least one byte is always consumed.
fn escape_bounded(data: &[u8], max_len: usize, out: &mut String) -> usize {
	let mut consumed = 0;
	let mut piece = String::new();
	for &byte in data {
		piece.clear();
		escape_byte(byte, &mut piece);
		if consumed != 0 && out.len() + piece.len() > max_len {
			break;
		}
		out.push_str(&piece);
		consumed += 1;
	}
	consumed
}

/// End of the run of elements equal to `data[pos]`.
fn run_end<T: PartialEq>(data: &[T], pos: usize) -> usize {
	data[pos + 1..].iter().position(|value| *value != data[pos]).map_or(data.len(), |len| pos + 1 + len)
}

/// Where a `.fill` starting at `pos` stops: the end of the run, rounded down to the line grid
/// unless the run reaches the end of the data. `None` when the run is shorter than a line.
fn fill_end(run_end: usize, pos: usize, len: usize, per_line: usize) -> Option<usize> {
	if run_end < pos + per_line {
		None
	} else if run_end == len {
		Some(run_end)
	} else {
		Some(run_end & !(per_line - 1))
	}
}

/// `.byte` lines of up to eight values; runs of at least eight equal bytes become `.fill`.
pub fn write_bytes(out: &mut impl Write, data: &[u8], second_level: bool) -> io::Result<()> {
	let indent = indent(second_level);
	let mut pos = 0;
	while pos < data.len() {
		if let Some(end) = fill_end(run_end(data, pos), pos, data.len(), BYTES_PER_LINE) {
			writeln!(out, "{indent}.fill {}, 1, 0x{:02x}", end - pos, data[pos])?;
			pos = end;
			continue;
		}
		let line_end = (pos + BYTES_PER_LINE).min(data.len());
		let values: Vec<String> = data[pos..line_end].iter().map(|byte| format!("0x{byte:02x}")).collect();
		writeln!(out, "{indent}.byte {}", values.join(", "))?;
		pos = line_end;
	}
	Ok(())
}

/// `.int` lines of up to four words; runs of at least four equal words become `.fill`.
pub fn write_words(out: &mut impl Write, data: &[u32], second_level: bool) -> io::Result<()> {
	let indent = indent(second_level);
	let mut pos = 0;
	while pos < data.len() {
		if let Some(end) = fill_end(run_end(data, pos), pos, data.len(), WORDS_PER_LINE) {
			writeln!(out, "{indent}.fill {}, 4, 0x{:08x}", end - pos, data[pos])?;
			pos = end;
			continue;
		}
		let line_end = (pos + WORDS_PER_LINE).min(data.len());
		let values: Vec<String> = data[pos..line_end].iter().map(|word| format!("0x{word:08x}")).collect();
		writeln!(out, "{indent}.int {}", values.join(", "))?;
		pos = line_end;
	}
	Ok(())
}

/// Whole little-endian words as `.int`, then the leftover bytes as `.byte`.
pub fn write_words_and_tail(out: &mut impl Write, data: &[u8], second_level: bool) -> io::Result<()> {
	let split = data.len() & !3;
	let words: Vec<u32> = data[..split]
		.chunks_exact(4)
		.map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
		.collect();
	write_words(out, &words, second_level)?;
	write_bytes(out, &data[split..], second_level)
}

/// `.ascii` lines; each takes up to 72 source bytes, ends after a newline and keeps its escaped
/// text within 76 characters.
pub fn write_long_string(out: &mut impl Write, data: &[u8], second_level: bool) -> io::Result<()> {
	let indent = indent(second_level);
	let mut pos = 0;
	let mut escaped = String::new();
	while pos < data.len() {
		let limit = (pos + STRING_CHUNK).min(data.len());
		let end = data[pos..limit].iter().position(|&byte| byte == b'\n').map_or(limit, |newline| pos + newline + 1);
		escaped.clear();
		pos += escape_bounded(&data[pos..end], STRING_ESCAPED_MAX, &mut escaped);
		writeln!(out, "{indent}.ascii \"{escaped}\"")?;
	}
	Ok(())
}
