// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Line-based assembler for AMD OpenCL 2.0 sources.
//!
//! Handles comments, labels, `name=expr` assignments, section and data directives and the
//! CL2 pseudo-ops, which drive an [`AmdCl2Builder`]. Expressions cover integers, symbols, the
//! location counter and the relocation forms the disassembler prints (`(sym+N)&0xffffffff`,
//! `sym>>32`). There is no instruction encoder: code sections hold data directives only.
//!
//! A failing statement is reported and assembly continues with the next line; the run fails
//! at the end with every diagnostic collected.

pub mod builder;
pub mod pseudo_ops;

pub use builder::{AmdCl2Builder, BuildError, KernelScope, RegisterAllocator, RegisterCounter, RegisterUsage, SectionKind};

use crate::device::{CL2_NEW_DRIVER_VERSION, GpuArchitecture, GpuDeviceType};
use crate::error::Result;
use crate::generator;
use crate::kernel_config::{AddressSpace, ArgKind, Dimensions, ImageAccess, KernelArg};
use crate::lower::{Cl2Relocation, RelocKind, RelocTarget};
use builder::SectionId;
use pseudo_ops::PseudoOp;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Device assumed when neither the options nor the source name one.
pub const DEFAULT_DEVICE: GpuDeviceType = GpuDeviceType::Bonaire;

/// Largest size `.fill`, `.skip`, `.org` and `.align` may grow a section to.
pub const MAX_SECTION_SIZE: u64 = 1 << 28;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
	/// 1-based source line.
	pub line: usize,
	pub message: String,
}

impl fmt::Display for Diagnostic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "line {}: {}", self.line, self.message)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", summarize(.diagnostics))]
pub struct AssemblyError {
	pub diagnostics: Vec<Diagnostic>,
}

fn summarize(diagnostics: &[Diagnostic]) -> String {
	let mut text = format!("assembly failed with {} error(s)", diagnostics.len());
	for diagnostic in diagnostics {
		text.push_str(&format!("\n  {diagnostic}"));
	}
	text
}

#[derive(Debug, Clone, Default)]
pub struct AssemblerOptions {
	pub device: Option<GpuDeviceType>,
	/// Driver version used when the source has no `.driver_version`.
	pub driver_version: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Assembled {
	pub binary: Vec<u8>,
	pub warnings: Vec<Diagnostic>,
}

#[instrument(level = "debug", skip_all)]
pub fn assemble(source: &str, options: &AssemblerOptions) -> Result<Assembled> {
	let builder = AmdCl2Builder::new(
		options.device.unwrap_or(DEFAULT_DEVICE),
		options.driver_version.unwrap_or(CL2_NEW_DRIVER_VERSION),
		Box::new(RegisterCounter::default()),
	);
	let mut assembler = Assembler::new(builder);
	assembler.run(source);
	if !assembler.errors.is_empty() {
		return Err(AssemblyError {
			diagnostics: assembler.errors,
		}
		.into());
	}
	let output = assembler.builder.finish();
	debug!(kernels = output.kernels.len(), warnings = assembler.warnings.len(), "assembled source");
	Ok(Assembled {
		binary: generator::generate(&output)?,
		warnings: assembler.warnings,
	})
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Value {
	Abs(i64),
	/// Address inside a relocatable data section.
	Rel { target: RelocTarget, offset: i64 },
	Reloc { kind: RelocKind, target: RelocTarget, addend: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EvalError {
	Undefined(String),
	Invalid(String),
}

type Eval<T> = std::result::Result<T, EvalError>;

fn invalid<T>(message: impl Into<String>) -> Eval<T> {
	Err(EvalError::Invalid(message.into()))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
	Int(u64),
	Name(String),
	/// The location counter.
	Dot,
	Op(&'static str),
	LParen,
	RParen,
}

fn is_name_start(c: u8) -> bool {
	c.is_ascii_alphabetic() || matches!(c, b'_' | b'.' | b'$')
}

fn is_name_char(c: u8) -> bool {
	c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'$')
}

fn parse_int(text: &str) -> std::result::Result<u64, String> {
	let lower = text.to_ascii_lowercase();
	let parsed = if let Some(hex) = lower.strip_prefix("0x") {
		u64::from_str_radix(hex, 16)
	} else if let Some(bin) = lower.strip_prefix("0b") {
		u64::from_str_radix(bin, 2)
	} else if lower.len() > 1 && lower.starts_with('0') {
		u64::from_str_radix(&lower[1..], 8)
	} else {
		lower.parse()
	};
	parsed.map_err(|_| format!("bad number '{text}'"))
}

fn tokenize(text: &str) -> Eval<Vec<Token>> {
	let bytes = text.as_bytes();
	let mut tokens = Vec::new();
	let mut i = 0;
	while i < bytes.len() {
		let c = bytes[i];
		if c.is_ascii_whitespace() {
			i += 1;
			continue;
		}
		let start = i;
		if c.is_ascii_digit() {
			while i < bytes.len() && bytes[i].is_ascii_alphanumeric() {
				i += 1;
			}
			tokens.push(Token::Int(parse_int(&text[start..i]).map_err(EvalError::Invalid)?));
			continue;
		}
		if is_name_start(c) {
			i += 1;
			while i < bytes.len() && is_name_char(bytes[i]) {
				i += 1;
			}
			let name = &text[start..i];
			tokens.push(if name == "." { Token::Dot } else { Token::Name(name.to_string()) });
			continue;
		}
		match text.get(i..i + 2) {
			Some("<<") => tokens.push(Token::Op("<<")),
			Some(">>") => tokens.push(Token::Op(">>")),
			_ => {
				tokens.push(match c {
					b'(' => Token::LParen,
					b')' => Token::RParen,
					b'+' => Token::Op("+"),
					b'-' => Token::Op("-"),
					b'*' => Token::Op("*"),
					b'/' => Token::Op("/"),
					b'%' => Token::Op("%"),
					b'&' => Token::Op("&"),
					b'|' => Token::Op("|"),
					b'^' => Token::Op("^"),
					b'~' => Token::Op("~"),
					_ => {
						let found = text[i..].chars().next().unwrap_or_default();
						return invalid(format!("unexpected '{found}' in expression"));
					}
				});
				i += 1;
				continue;
			}
		}
		i += 2;
	}
	Ok(tokens)
}

fn precedence(op: &str) -> Option<u8> {
	Some(match op {
		"|" => 1,
		"^" => 2,
		"&" => 3,
		"<<" | ">>" => 4,
		"+" | "-" => 5,
		"*" | "/" | "%" => 6,
		_ => return None,
	})
}

fn absolute_op(op: &str, a: i64, b: i64) -> Eval<i64> {
	Ok(match op {
		"+" => a.wrapping_add(b),
		"-" => a.wrapping_sub(b),
		"*" => a.wrapping_mul(b),
		"/" | "%" if b == 0 => return invalid("division by zero"),
		"/" => a.wrapping_div(b),
		"%" => a.wrapping_rem(b),
		"&" => a & b,
		"|" => a | b,
		"^" => a ^ b,
		"<<" => a.wrapping_shl(b as u32),
		_ => (a as u64).wrapping_shr(b as u32) as i64,
	})
}

fn apply(op: &str, lhs: Value, rhs: Value) -> Eval<Value> {
	use Value::{Abs, Rel, Reloc};
	Ok(match (op, lhs, rhs) {
		(_, Abs(a), Abs(b)) => Abs(absolute_op(op, a, b)?),
		("+", Rel { target, offset }, Abs(b)) | ("+", Abs(b), Rel { target, offset }) => Rel {
			target,
			offset: offset.wrapping_add(b),
		},
		("-", Rel { target, offset }, Abs(b)) => Rel {
			target,
			offset: offset.wrapping_sub(b),
		},
		("-", Rel { target, offset: a }, Rel { target: other, offset: b }) if target == other => Abs(a.wrapping_sub(b)),
		("&", Rel { target, offset }, Abs(0xffff_ffff)) => Reloc {
			kind: RelocKind::Low32,
			target,
			addend: offset,
		},
		(">>", Rel { target, offset }, Abs(32)) => Reloc {
			kind: RelocKind::High32,
			target,
			addend: offset,
		},
		_ => return invalid("expression is neither absolute nor a supported relocation"),
	})
}

#[derive(Debug, Clone, Copy)]
struct Symbol {
	value: Value,
	label: bool,
}

struct ExprParser<'e> {
	tokens: Vec<Token>,
	pos: usize,
	symbols: &'e HashMap<String, Symbol>,
	location: Option<Value>,
}

impl ExprParser<'_> {
	fn expr(&mut self, min_precedence: u8) -> Eval<Value> {
		let mut lhs = self.unary()?;
		while let Some(&Token::Op(op)) = self.tokens.get(self.pos) {
			let Some(level) = precedence(op) else {
				break;
			};
			if level < min_precedence {
				break;
			}
			self.pos += 1;
			let rhs = self.expr(level + 1)?;
			lhs = apply(op, lhs, rhs)?;
		}
		Ok(lhs)
	}

	fn unary(&mut self) -> Eval<Value> {
		match self.tokens.get(self.pos) {
			Some(&Token::Op(op @ ("-" | "~" | "+"))) => {
				self.pos += 1;
				match (op, self.unary()?) {
					("+", value) => Ok(value),
					("-", Value::Abs(value)) => Ok(Value::Abs(value.wrapping_neg())),
					("~", Value::Abs(value)) => Ok(Value::Abs(!value)),
					_ => invalid(format!("'{op}' needs an absolute value")),
				}
			}
			_ => self.primary(),
		}
	}

	fn primary(&mut self) -> Eval<Value> {
		let Some(token) = self.tokens.get(self.pos).cloned() else {
			return invalid("missing expression");
		};
		self.pos += 1;
		match token {
			Token::Int(value) => Ok(Value::Abs(value as i64)),
			Token::Name(name) => match self.symbols.get(&name) {
				Some(symbol) => Ok(symbol.value),
				None => Err(EvalError::Undefined(name)),
			},
			Token::Dot => self.location.map_or_else(|| invalid("location counter is unavailable here"), Ok),
			Token::LParen => {
				let value = self.expr(0)?;
				if self.tokens.get(self.pos) != Some(&Token::RParen) {
					return invalid("missing ')'");
				}
				self.pos += 1;
				Ok(value)
			}
			Token::RParen | Token::Op(_) => invalid("missing operand"),
		}
	}
}

fn evaluate(text: &str, symbols: &HashMap<String, Symbol>, location: Option<Value>) -> Eval<Value> {
	let mut parser = ExprParser {
		tokens: tokenize(text)?,
		pos: 0,
		symbols,
		location,
	};
	let value = parser.expr(0)?;
	if parser.pos != parser.tokens.len() {
		return invalid("garbage at end of expression");
	}
	Ok(value)
}

/// Removes `/* */` and `//` comments, keeping string literals intact; `in_block` carries an
/// open block comment to the next line.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
	let mut out = String::with_capacity(line.len());
	let mut chars = line.chars().peekable();
	let mut in_string = false;
	while let Some(c) = chars.next() {
		if *in_block {
			if c == '*' && chars.peek() == Some(&'/') {
				chars.next();
				*in_block = false;
				out.push(' ');
			}
			continue;
		}
		if in_string {
			out.push(c);
			match c {
				'\\' => {
					if let Some(escaped) = chars.next() {
						out.push(escaped);
					}
				}
				'"' => in_string = false,
				_ => {}
			}
			continue;
		}
		match (c, chars.peek()) {
			('/', Some('*')) => {
				chars.next();
				*in_block = true;
			}
			('/', Some('/')) => break,
			('"', _) => {
				in_string = true;
				out.push(c);
			}
			_ => out.push(c),
		}
	}
	out
}

/// Parses a leading string literal, returning its bytes and the text after it.
fn parse_string(text: &str) -> std::result::Result<(Vec<u8>, &str), String> {
	let Some(body) = text.strip_prefix('"') else {
		return Err("expected a string".into());
	};
	let bytes = body.as_bytes();
	let mut out = Vec::new();
	let mut i = 0;
	while i < bytes.len() {
		let c = bytes[i];
		i += 1;
		match c {
			b'"' => return Ok((out, &body[i..])),
			b'\\' => {
				let Some(&escaped) = bytes.get(i) else {
					break;
				};
				i += 1;
				match escaped {
					b'a' => out.push(0x07),
					b'b' => out.push(0x08),
					b't' => out.push(b'\t'),
					b'n' => out.push(b'\n'),
					b'v' => out.push(0x0b),
					b'f' => out.push(0x0c),
					b'r' => out.push(b'\r'),
					b'0'..=b'7' => {
						let mut value = u32::from(escaped - b'0');
						for _ in 0..2 {
							match bytes.get(i) {
								Some(&digit @ b'0'..=b'7') => {
									value = value * 8 + u32::from(digit - b'0');
									i += 1;
								}
								_ => break,
							}
						}
						out.push(value as u8);
					}
					b'x' => {
						let digits = bytes[i..].iter().take(2).take_while(|digit| digit.is_ascii_hexdigit()).count();
						if digits == 0 {
							return Err("\\x needs hexadecimal digits".into());
						}
						let hex = std::str::from_utf8(&bytes[i..i + digits]).map_err(|_| "bad escape".to_string())?;
						out.push(u8::from_str_radix(hex, 16).map_err(|_| "bad escape".to_string())?);
						i += digits;
					}
					other => out.push(other),
				}
			}
			other => out.push(other),
		}
	}
	Err("unterminated string".into())
}

fn string_operand(text: &str) -> std::result::Result<Vec<u8>, String> {
	let (value, rest) = parse_string(text.trim())?;
	if !rest.trim().is_empty() {
		return Err("garbage at end of line".into());
	}
	Ok(value)
}

/// Splits on commas outside strings and parentheses.
fn split_operands(text: &str) -> std::result::Result<Vec<&str>, String> {
	let text = text.trim();
	if text.is_empty() {
		return Ok(Vec::new());
	}
	let mut operands = Vec::new();
	let (mut depth, mut in_string, mut escaped, mut start) = (0usize, false, false, 0);
	for (i, c) in text.char_indices() {
		if in_string {
			match (escaped, c) {
				(true, _) => escaped = false,
				(false, '\\') => escaped = true,
				(false, '"') => in_string = false,
				_ => {}
			}
			continue;
		}
		match c {
			'"' => in_string = true,
			'(' => depth += 1,
			')' => depth = depth.saturating_sub(1),
			',' if depth == 0 => {
				operands.push(text[start..i].trim());
				start = i + 1;
			}
			_ => {}
		}
	}
	operands.push(text[start..].trim());
	if operands.iter().any(|operand| operand.is_empty()) {
		return Err("missing operand".into());
	}
	Ok(operands)
}

/// Splits a leading symbol name off `text`.
fn take_name(text: &str) -> (&str, &str) {
	let bytes = text.as_bytes();
	if !bytes.first().copied().is_some_and(is_name_start) {
		return ("", text);
	}
	let end = bytes.iter().position(|&c| !is_name_char(c)).unwrap_or(bytes.len());
	text.split_at(end)
}

fn is_identifier(text: &str) -> bool {
	let (name, rest) = take_name(text);
	!name.is_empty() && rest.is_empty()
}

fn check_section_size(end: u64) -> std::result::Result<(), String> {
	if end > MAX_SECTION_SIZE {
		return Err(format!("section would grow past {MAX_SECTION_SIZE:#x} bytes"));
	}
	Ok(())
}

fn no_operands(operands: &str) -> std::result::Result<(), String> {
	if operands.is_empty() { Ok(()) } else { Err("garbage at end of line".into()) }
}

struct Fixup {
	line: usize,
	section: SectionId,
	offset: usize,
	size: usize,
	expr: String,
	location: Option<Value>,
}

type StatementResult = std::result::Result<(), String>;

struct Assembler {
	builder: AmdCl2Builder,
	symbols: HashMap<String, Symbol>,
	fixups: Vec<Fixup>,
	errors: Vec<Diagnostic>,
	warnings: Vec<Diagnostic>,
	line: usize,
}

impl Assembler {
	fn new(builder: AmdCl2Builder) -> Self {
		Self {
			builder,
			symbols: HashMap::new(),
			fixups: Vec::new(),
			errors: Vec::new(),
			warnings: Vec::new(),
			line: 0,
		}
	}

	fn error(&mut self, message: String) {
		debug!(line = self.line, %message, "assembly error");
		self.errors.push(Diagnostic { line: self.line, message });
	}

	fn warning(&mut self, message: String) {
		warn!(line = self.line, "{message}");
		self.warnings.push(Diagnostic { line: self.line, message });
	}

	fn run(&mut self, source: &str) {
		let mut in_block = false;
		for (index, raw) in source.lines().enumerate() {
			self.line = index + 1;
			let line = strip_comments(raw, &mut in_block);
			if let Err(message) = self.statement(line.trim()) {
				self.error(message);
			}
		}
		if in_block {
			self.error("unterminated comment".into());
		}
		self.resolve_fixups();
	}

	fn statement(&mut self, line: &str) -> StatementResult {
		let mut rest = line;
		loop {
			let (name, after) = take_name(rest);
			if name.is_empty() {
				break;
			}
			let after = after.trim_start();
			if let Some(tail) = after.strip_prefix(':') {
				self.define_label(name)?;
				rest = tail.trim_start();
				continue;
			}
			if let Some(expr) = after.strip_prefix('=') {
				if !expr.starts_with('=') {
					return self.assign(name, expr.trim());
				}
			}
			break;
		}
		if rest.is_empty() {
			return Ok(());
		}
		let (mnemonic, operands) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
		self.directive(&mnemonic.to_ascii_lowercase(), operands.trim())
	}

	/// Location counter of the current section, if that section is addressable.
	fn location(&self) -> Option<Value> {
		let section = self.builder.section(self.builder.current_section());
		let offset = section.content.len() as i64;
		match section.kind {
			SectionKind::Config => None,
			kind => Some(match kind.reloc_target() {
				Some(target) => Value::Rel { target, offset },
				None => Value::Abs(offset),
			}),
		}
	}

	fn define_label(&mut self, name: &str) -> StatementResult {
		let value = self.location().ok_or_else(|| format!("label '{name}' in a non-addressable section"))?;
		if self.symbols.contains_key(name) {
			return Err(format!("symbol '{name}' is already defined"));
		}
		self.symbols.insert(name.to_string(), Symbol { value, label: true });
		Ok(())
	}

	fn assign(&mut self, name: &str, expr: &str) -> StatementResult {
		let value = self.evaluate(expr)?;
		self.set_symbol(name, value)
	}

	fn set_symbol(&mut self, name: &str, value: Value) -> StatementResult {
		if matches!(value, Value::Reloc { .. }) {
			return Err(format!("relocation can't be assigned to symbol '{name}'"));
		}
		if self.symbols.get(name).is_some_and(|symbol| symbol.label) {
			return Err(format!("symbol '{name}' is already defined"));
		}
		self.symbols.insert(name.to_string(), Symbol { value, label: false });
		Ok(())
	}

	fn evaluate(&self, text: &str) -> std::result::Result<Value, String> {
		match evaluate(text, &self.symbols, self.location()) {
			Ok(value) => Ok(value),
			Err(EvalError::Undefined(name)) => Err(format!("symbol '{name}' is undefined")),
			Err(EvalError::Invalid(message)) => Err(message),
		}
	}

	fn absolute(&self, text: &str) -> std::result::Result<i64, String> {
		match self.evaluate(text)? {
			Value::Abs(value) => Ok(value),
			_ => Err(format!("'{text}' is not an absolute value")),
		}
	}

	fn unsigned(&self, text: &str) -> std::result::Result<u64, String> {
		let value = self.absolute(text)?;
		u64::try_from(value).map_err(|_| format!("value {value} is negative"))
	}

	fn u32_operand(&self, text: &str, what: &str) -> std::result::Result<u32, String> {
		let value = self.unsigned(text)?;
		u32::try_from(value).map_err(|_| format!("{what} {value:#x} does not fit in 32 bits"))
	}

	fn directive(&mut self, name: &str, operands: &str) -> StatementResult {
		match name {
			".amdcl2" => no_operands(operands),
			".amd" | ".gallium" | ".rawcode" | ".amdhsa" => Err("only the AMD OpenCL 2.0 format (.amdcl2) can be assembled".into()),
			".gpu" => {
				let device = GpuDeviceType::from_name(operands).ok_or_else(|| format!("unknown GPU device type '{operands}'"))?;
				self.builder.set_device(device);
				Ok(())
			}
			".arch" => {
				let arch = GpuArchitecture::from_name(operands).ok_or_else(|| format!("unknown GPU architecture '{operands}'"))?;
				self.builder.set_device(arch.lowest_device());
				Ok(())
			}
			".64bit" => no_operands(operands),
			".32bit" => Err("AMD OpenCL 2.0 binaries are always 64-bit".into()),
			".kernel" => self.kernel(operands),
			".main" => {
				no_operands(operands)?;
				self.builder.set_current_kernel(KernelScope::Global).map(drop).map_err(|error| error.0)
			}
			".text" | ".rodata" | ".data" | ".bss" => {
				no_operands(operands)?;
				self.builder.open_section(name).map(drop).map_err(|error| error.0)
			}
			".section" => self.section(operands),
			".byte" => self.data(operands, 1),
			".short" | ".hword" | ".half" => self.data(operands, 2),
			".int" | ".long" | ".word" => self.data(operands, 4),
			".quad" => self.data(operands, 8),
			".ascii" => self.strings(operands, false),
			".asciz" | ".string" => self.strings(operands, true),
			".fill" => self.fill(operands),
			".skip" | ".space" => self.skip(operands),
			".org" => self.org(operands),
			".align" | ".balign" => self.align(operands),
			".equ" | ".set" => match split_operands(operands)?.as_slice() {
				[symbol, expr] if is_identifier(symbol) => self.assign(symbol, expr),
				_ => Err("expected SYMBOL, EXPRESSION".into()),
			},
			_ => match pseudo_ops::lookup(name) {
				Some(op) => self.pseudo_op(op, operands),
				None if name.starts_with('.') => Err(format!("unknown directive '{name}'")),
				None => Err(format!("'{name}' is not a directive, and instructions can't be encoded")),
			},
		}
	}

	fn kernel(&mut self, operands: &str) -> StatementResult {
		let name = if operands.starts_with('"') {
			String::from_utf8(string_operand(operands)?).map_err(|_| "kernel name is not UTF-8".to_string())?
		} else if is_identifier(operands) {
			operands.to_string()
		} else {
			return Err("expected a kernel name".into());
		};
		match self.builder.kernel_id(&name) {
			Some(id) => self.builder.set_current_kernel(KernelScope::Kernel(id)).map(drop).map_err(|error| error.0),
			None => {
				self.builder.add_kernel(&name);
				Ok(())
			}
		}
	}

	fn section(&mut self, operands: &str) -> StatementResult {
		let (name, attributes) = take_name(operands);
		if name.is_empty() {
			return Err("expected a section name".into());
		}
		let attributes = attributes.trim_start().trim_start_matches(',').trim();
		let alignment = match attributes.strip_prefix("align=") {
			Some(value) => {
				let alignment = self.unsigned(value)?;
				if alignment != 0 && !alignment.is_power_of_two() {
					return Err(format!("section alignment {alignment} is not a power of two"));
				}
				Some(alignment)
			}
			None if attributes.is_empty() => None,
			None => return Err(format!("unsupported section attribute '{attributes}'")),
		};
		let id = self.builder.open_section(name).map_err(|error| error.0)?;
		if let Some(alignment) = alignment {
			self.builder.section_mut(id).alignment = alignment;
		}
		Ok(())
	}

	/// Current section, if data may be written to it.
	fn writable_section(&self) -> std::result::Result<SectionId, String> {
		let id = self.builder.current_section();
		match self.builder.section(id).kind {
			kind if !kind.is_writable() => Err("writing data into the configuration section is illegal".into()),
			SectionKind::Bss => Err("the bss section can only be reserved with .skip".into()),
			_ => Ok(id),
		}
	}

	/// Current section, if space may be reserved in it.
	fn reservable_section(&self) -> std::result::Result<SectionId, String> {
		let id = self.builder.current_section();
		if self.builder.section(id).kind.is_writable() {
			Ok(id)
		} else {
			Err("writing data into the configuration section is illegal".into())
		}
	}

	fn store(&mut self, section: SectionId, offset: usize, size: usize, value: Value) -> StatementResult {
		match value {
			Value::Abs(value) => {
				if size < 8 {
					let bits = size * 8;
					if value < -(1i64 << (bits - 1)) || value >= 1i64 << bits {
						self.warning(format!("value {value:#x} truncated to {bits} bits"));
					}
				}
				self.builder.section_mut(section).content[offset..offset + size].copy_from_slice(&value.to_le_bytes()[..size]);
				Ok(())
			}
			Value::Reloc { kind, target, addend } => {
				let section = self.builder.section_mut(section);
				if section.kind != SectionKind::Code || size != 4 {
					return Err("relocations are only allowed in 32-bit values of kernel code".into());
				}
				section.relocations.push(Cl2Relocation {
					offset,
					kind,
					target,
					addend,
				});
				Ok(())
			}
			Value::Rel { .. } => Err("an address needs &0xffffffff or >>32 to become a relocation".into()),
		}
	}

	fn data(&mut self, operands: &str, size: usize) -> StatementResult {
		let section = self.writable_section()?;
		for operand in split_operands(operands)? {
			let offset = self.builder.section(section).content.len();
			let location = self.location();
			self.builder.section_mut(section).content.resize(offset + size, 0);
			match evaluate(operand, &self.symbols, location) {
				Ok(value) => self.store(section, offset, size, value)?,
				Err(EvalError::Undefined(_)) => self.fixups.push(Fixup {
					line: self.line,
					section,
					offset,
					size,
					expr: operand.to_string(),
					location,
				}),
				Err(EvalError::Invalid(message)) => return Err(message),
			}
		}
		Ok(())
	}

	fn resolve_fixups(&mut self) {
		for fixup in std::mem::take(&mut self.fixups) {
			self.line = fixup.line;
			let result = match evaluate(&fixup.expr, &self.symbols, fixup.location) {
				Ok(value) => self.store(fixup.section, fixup.offset, fixup.size, value),
				Err(EvalError::Undefined(name)) => Err(format!("symbol '{name}' is undefined")),
				Err(EvalError::Invalid(message)) => Err(message),
			};
			if let Err(message) = result {
				self.error(message);
			}
		}
	}

	fn strings(&mut self, operands: &str, terminate: bool) -> StatementResult {
		let section = self.writable_section()?;
		let mut text = Vec::new();
		for operand in split_operands(operands)? {
			text.extend(string_operand(operand)?);
			if terminate {
				text.push(0);
			}
		}
		self.builder.section_mut(section).content.extend(text);
		Ok(())
	}

	fn fill(&mut self, operands: &str) -> StatementResult {
		let parts = split_operands(operands)?;
		let (count, size, value) = match parts.as_slice() {
			[count] => (*count, "1", "0"),
			[count, size] => (*count, *size, "0"),
			[count, size, value] => (*count, *size, *value),
			_ => return Err("expected COUNT[, SIZE[, VALUE]]".into()),
		};
		let count = usize::try_from(self.unsigned(count)?).map_err(|_| "fill count too large".to_string())?;
		let size = self.unsigned(size)? as usize;
		if size > 8 {
			return Err(format!("fill size {size} is larger than 8"));
		}
		let value = self.absolute(value)?;
		let section = if value == 0 { self.reservable_section()? } else { self.writable_section()? };
		let current = self.builder.section(section).content.len() as u64;
		let end = (count as u64).checked_mul(size as u64).and_then(|grow| grow.checked_add(current));
		check_section_size(end.unwrap_or(u64::MAX))?;
		let bytes = value.to_le_bytes();
		let pattern = &bytes[..size];
		let content = &mut self.builder.section_mut(section).content;
		for _ in 0..count {
			content.extend_from_slice(pattern);
		}
		Ok(())
	}

	fn skip(&mut self, operands: &str) -> StatementResult {
		let parts = split_operands(operands)?;
		let (size, value) = match parts.as_slice() {
			[size] => (*size, "0"),
			[size, value] => (*size, *value),
			_ => return Err("expected SIZE[, VALUE]".into()),
		};
		self.fill(&format!("{size}, 1, {value}"))
	}

	fn org(&mut self, operands: &str) -> StatementResult {
		let section = self.reservable_section()?;
		let target = match self.evaluate(operands)? {
			Value::Abs(target) => target,
			Value::Rel { offset, .. } => offset,
			Value::Reloc { .. } => return Err(".org needs an address".into()),
		};
		let current = self.builder.section(section).content.len();
		let target = usize::try_from(target).map_err(|_| format!("bad .org address {target}"))?;
		check_section_size(target as u64)?;
		if target < current {
			return Err(format!("can't move the location counter backwards (from {current:#x} to {target:#x})"));
		}
		self.builder.section_mut(section).content.resize(target, 0);
		Ok(())
	}

	fn align(&mut self, operands: &str) -> StatementResult {
		let parts = split_operands(operands)?;
		let (alignment, value) = match parts.as_slice() {
			[alignment] => (*alignment, "0"),
			[alignment, value] => (*alignment, *value),
			_ => return Err("expected ALIGNMENT[, VALUE]".into()),
		};
		let alignment = self.unsigned(alignment)?;
		if !alignment.is_power_of_two() {
			return Err(format!("alignment {alignment} is not a power of two"));
		}
		check_section_size(alignment)?;
		let current = self.builder.section(self.builder.current_section()).content.len() as u64;
		let padding = current.next_multiple_of(alignment) - current;
		self.fill(&format!("{padding}, 1, {value}"))
	}

	fn pseudo_op(&mut self, op: PseudoOp, operands: &str) -> StatementResult {
		let built = |result: std::result::Result<(), BuildError>| result.map_err(|error| error.0);
		match op {
			PseudoOp::AclVersion => {
				let version = string_operand(operands)?;
				self.builder.set_acl_version(version);
				Ok(())
			}
			PseudoOp::CompileOptions => {
				let options = string_operand(operands)?;
				self.builder.set_compile_options(options);
				Ok(())
			}
			PseudoOp::DriverVersion => {
				let version = self.u32_operand(operands, "driver version")?;
				self.builder.set_driver_version(version);
				Ok(())
			}
			PseudoOp::GetDriverVersion => {
				if !is_identifier(operands) {
					return Err("illegal symbol name".into());
				}
				let version = i64::from(self.builder.driver_version());
				self.set_symbol(operands, Value::Abs(version))
			}
			PseudoOp::GlobalData => no_operands(operands).and_then(|()| built(self.builder.go_to_global(SectionKind::Data))),
			PseudoOp::RwData => no_operands(operands).and_then(|()| built(self.builder.go_to_global(SectionKind::RwData))),
			PseudoOp::BssData => no_operands(operands).and_then(|()| built(self.builder.go_to_global(SectionKind::Bss))),
			PseudoOp::SamplerInit => no_operands(operands).and_then(|()| built(self.builder.go_to_global(SectionKind::SamplerInit))),
			PseudoOp::Inner => no_operands(operands).and_then(|()| built(self.builder.go_to_inner())),
			PseudoOp::Metadata => no_operands(operands).and_then(|()| built(self.builder.go_to_record(SectionKind::Metadata))),
			PseudoOp::IsaMetadata => no_operands(operands).and_then(|()| built(self.builder.go_to_record(SectionKind::IsaMetadata))),
			PseudoOp::Setup => no_operands(operands).and_then(|()| built(self.builder.go_to_record(SectionKind::Setup))),
			PseudoOp::Stub => no_operands(operands).and_then(|()| built(self.builder.go_to_record(SectionKind::Stub))),
			PseudoOp::Config => no_operands(operands).and_then(|()| built(self.builder.go_to_config())),
			PseudoOp::SetupArgs => no_operands(operands).and_then(|()| built(self.builder.setup_args())),
			PseudoOp::Bool(target) => no_operands(operands).and_then(|()| built(self.builder.set_config_bool(target))),
			PseudoOp::Value(target) => {
				let value = self.unsigned(operands)?;
				if let Some(warning) = self.builder.set_config_value(target, value).map_err(|error| error.0)? {
					self.warning(warning);
				}
				Ok(())
			}
			PseudoOp::Dims => {
				let dims = Dimensions::parse(operands).ok_or_else(|| format!("unknown dimension set '{operands}'"))?;
				built(self.builder.set_dims(dims))
			}
			PseudoOp::Cws => {
				let parts = split_operands(operands)?;
				if parts.is_empty() || parts.len() > 3 {
					return Err("expected 1 to 3 work-group sizes".into());
				}
				let mut sizes = [1u32; 3];
				for (size, part) in sizes.iter_mut().zip(&parts) {
					*size = self.u32_operand(part, "work-group size")?;
				}
				built(self.builder.set_cws(sizes))
			}
			PseudoOp::Sampler => {
				let samplers = split_operands(operands)?
					.into_iter()
					.map(|part| self.u32_operand(part, "sampler"))
					.collect::<std::result::Result<Vec<_>, _>>()?;
				built(self.builder.add_samplers(&samplers))
			}
			PseudoOp::Arg => {
				let arg = self.parse_arg(operands)?;
				built(self.builder.add_arg(arg))
			}
			PseudoOp::SamplerReloc => match split_operands(operands)?.as_slice() {
				[offset, sampler] => {
					let offset = usize::try_from(self.unsigned(offset)?).map_err(|_| "sampler relocation offset too large".to_string())?;
					let sampler = usize::try_from(self.unsigned(sampler)?).map_err(|_| "sampler index too large".to_string())?;
					self.builder.add_sampler_reloc(offset, sampler);
					Ok(())
				}
				_ => Err("expected OFFSET, SAMPLER".into()),
			},
		}
	}

	/// `NAME, "TYPE", KIND[, PARAM]`, as [`KernelArg`]'s `Display` writes it.
	fn parse_arg(&self, operands: &str) -> std::result::Result<KernelArg, String> {
		let parts = split_operands(operands)?;
		let [name, type_name, kind, rest @ ..] = parts.as_slice() else {
			return Err("expected NAME, \"TYPE\", KIND".into());
		};
		if !is_identifier(name) {
			return Err(format!("illegal argument name '{name}'"));
		}
		let type_name = String::from_utf8(string_operand(type_name)?).map_err(|_| "argument type name is not UTF-8".to_string())?;
		let kind_name = kind.to_ascii_lowercase();
		let kind = match (kind_name.as_str(), rest) {
			("value", [size]) => ArgKind::Value {
				size: self.u32_operand(size, "argument size")?,
			},
			("sampler", []) => ArgKind::Sampler,
			("image", [access]) => ArgKind::Image {
				access: ImageAccess::from_name(access).ok_or_else(|| format!("unknown image access '{access}'"))?,
			},
			(space, rest) => {
				let space = AddressSpace::from_name(space).ok_or_else(|| format!("unknown argument kind '{space}'"))?;
				match rest {
					[] => ArgKind::Pointer { space, align: 0 },
					[align] => ArgKind::Pointer {
						space,
						align: self.u32_operand(align, "pointer alignment")?,
					},
					_ => return Err("too many operands for a pointer argument".into()),
				}
			}
		};
		Ok(KernelArg {
			name: name.to_string(),
			type_name,
			kind,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::container::cl2::Cl2Container;
	use crate::error::Error;
	use crate::lower::{Cl2Input, lower_cl2};

	fn build(source: &str) -> Assembled {
		match assemble(source, &AssemblerOptions::default()) {
			Ok(assembled) => assembled,
			Err(error) => panic!("{error}"),
		}
	}

	fn lowered(binary: &[u8]) -> Cl2Input<'_> {
		lower_cl2(&Cl2Container::parse(binary).unwrap()).unwrap()
	}

	fn diagnostics(source: &str) -> Vec<Diagnostic> {
		match assemble(source, &AssemblerOptions::default()) {
			Err(Error::Assembly(error)) => error.diagnostics,
			Err(other) => panic!("unexpected error {other}"),
			Ok(_) => panic!("assembly unexpectedly succeeded"),
		}
	}

	#[test]
	fn data_directives() {
		let assembled = build(
			r#"
			.amdcl2
			.globaldata
			start:  .byte 1, 0xff, -1
			        .short 0x0304
			        .int 0x01020304 // trailing comment
			        .quad 5
			        .ascii "a\n\101", "b"
			        .asciz "c"
			        .fill 2, 2, 0x0102
			        .skip 3
			        .org 32
			        .int end-start
			end:
			"#,
		);
		assert!(assembled.warnings.is_empty());
		let input = lowered(&assembled.binary);
		let mut expected = vec![1, 0xff, 0xff, 4, 3, 4, 3, 2, 1, 5, 0, 0, 0, 0, 0, 0, 0, b'a', b'\n', b'A', b'b', b'c', 0, 2, 1, 2, 1, 0, 0, 0];
		expected.resize(32, 0);
		expected.extend_from_slice(&36u32.to_le_bytes());
		assert_eq!(input.global_data.as_deref(), Some(expected.as_slice()));
	}

	#[test]
	fn config_kernel_with_forward_relocations() {
		let assembled = build(
			"
			.amdcl2
			.gpu Tonga
			.kernel scale
			    .config
			        .dims x
			        .sgprsnum 12
			        .vgprsnum 3
			        .arg out, \"float*\", global, 16
			        .arg n, \"uint\", value, 4
			    .text
			        .int (.gdata+8)&0xffffffff, (.gdata+8)>>32
			        .int 0x0000c0de
			.globaldata
			.gdata:
			    .fill 16, 1, 0x5a
			",
		);
		let input = lowered(&assembled.binary);
		assert_eq!(input.device, GpuDeviceType::Tonga);
		let kernel = &input.kernels[0];
		assert_eq!(kernel.name, "scale");
		assert_eq!(kernel.code.as_deref(), Some(&[0, 0, 0, 0, 0, 0, 0, 0, 0xde, 0xc0, 0, 0][..]));
		assert_eq!(
			kernel.relocations,
			[
				Cl2Relocation {
					offset: 0,
					kind: RelocKind::Low32,
					target: RelocTarget::GlobalData,
					addend: 8,
				},
				Cl2Relocation {
					offset: 4,
					kind: RelocKind::High32,
					target: RelocTarget::GlobalData,
					addend: 8,
				},
			]
		);
		let config = crate::kernel_config::KernelConfig::decode("scale", kernel.setup.as_deref().unwrap(), kernel.metadata.as_deref().unwrap()).unwrap();
		assert_eq!(config.dims, Dimensions::X);
		assert_eq!(config.used_sgprs, 12);
		assert_eq!(config.args.len(), 2);
	}

	#[test]
	fn every_failing_statement_is_reported() {
		let found = diagnostics(
			"
			.amdcl2
			.kernel k
			    .sgprsnum 5
			    .config
			    .sgprsnum 500
			    .bogus
			    .int undefined_symbol
			",
		);
		let lines: Vec<usize> = found.iter().map(|diagnostic| diagnostic.line).collect();
		assert_eq!(lines, [4, 6, 7, 8]);
		assert_eq!(found[0].message, "illegal place of configuration pseudo-op");
		assert_eq!(found[1].message, "used SGPRs number out of range (0-104)");
		assert_eq!(found[2].message, "unknown directive '.bogus'");
		assert_eq!(found[3].message, "writing data into the configuration section is illegal");
	}

	#[test]
	fn undefined_symbols_are_reported_after_the_last_line() {
		let found = diagnostics(".amdcl2\n.kernel k\n.setup\n.fill 256\n.text\n.int missing&0xffffffff\n");
		assert_eq!(
			found,
			[Diagnostic {
				line: 6,
				message: "symbol 'missing' is undefined".into(),
			}]
		);
	}

	#[test]
	fn truncations_warn() {
		let assembled = build(".amdcl2\n.globaldata\n.byte 0x1ff\n.kernel k\n.config\n.exceptions 0x80\n");
		let lines: Vec<usize> = assembled.warnings.iter().map(|warning| warning.line).collect();
		assert_eq!(lines, [3, 6]);
	}

	#[test]
	fn oversized_reservations_are_reported() {
		let found = diagnostics(
			".amdcl2\n.globaldata\n.skip 0x100000000000\n.fill 0x10000000, 8, 1\n.org 0xffffffffff\n.align 0x4000000000000000\n.fill 0xffffffffffffffff, 8\n.byte 1\n",
		);
		let lines: Vec<usize> = found.iter().map(|diagnostic| diagnostic.line).collect();
		assert_eq!(lines, [3, 4, 5, 6, 7]);
		assert_eq!(found[0].message, "section would grow past 0x10000000 bytes");
		assert!(build(".amdcl2\n.globaldata\n.skip 0x10000\n.align 0x100000\n").warnings.is_empty());
	}

	#[test]
	fn comments_and_strings() {
		let mut in_block = false;
		assert_eq!(strip_comments(r#".ascii "a//b/*c*/" // note"#, &mut in_block), r#".ascii "a//b/*c*/" "#);
		assert_eq!(strip_comments("x /* open", &mut in_block), "x ");
		assert!(in_block);
		assert_eq!(strip_comments("still */ .byte 1", &mut in_block), "  .byte 1");
		assert!(!in_block);
		assert_eq!(parse_string(r#""q\"\\\x41\7z" tail"#).unwrap(), (b"q\"\\A\x07z".to_vec(), " tail"));
		assert!(parse_string("\"open").is_err());
	}

	#[test]
	fn expressions() {
		let mut symbols = HashMap::new();
		symbols.insert(
			".gdata".to_string(),
			Symbol {
				value: Value::Rel {
					target: RelocTarget::GlobalData,
					offset: 0,
				},
				label: true,
			},
		);
		let eval = |text: &str| evaluate(text, &symbols, Some(Value::Abs(10)));
		assert_eq!(eval("1+2*3"), Ok(Value::Abs(7)));
		assert_eq!(eval("(1 << 4) | 0b11"), Ok(Value::Abs(19)));
		assert_eq!(eval(".-2"), Ok(Value::Abs(8)));
		assert_eq!(eval("-010"), Ok(Value::Abs(-8)));
		assert_eq!(
			eval("(.gdata-4)&0xffffffff"),
			Ok(Value::Reloc {
				kind: RelocKind::Low32,
				target: RelocTarget::GlobalData,
				addend: -4,
			})
		);
		assert_eq!(eval("nope+1"), Err(EvalError::Undefined("nope".into())));
		assert!(matches!(eval(".gdata*2"), Err(EvalError::Invalid(_))));
		assert!(matches!(eval("1/0"), Err(EvalError::Invalid(_))));
		assert!(matches!(eval("(1"), Err(EvalError::Invalid(_))));
	}

	#[test]
	fn labels_and_assignments() {
		let assembled = build(".amdcl2\n.globaldata\nbase: .byte 1, 2, 3\nmid=.-1\n.get_driver_version version\n.int mid-base, version\n");
		let input = lowered(&assembled.binary);
		let data = input.global_data.unwrap();
		assert_eq!(&data[3..7], &2u32.to_le_bytes());
		assert_eq!(&data[7..11], &191205u32.to_le_bytes());

		let found = diagnostics(".amdcl2\nx:\nx:\n");
		assert_eq!(found[0].message, "symbol 'x' is already defined");
	}
}
