// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

//! Bounds-checked little-endian access to container buffers.

use crate::error::{Result, malformed};

pub(crate) fn slice<'a>(data: &'a [u8], offset: usize, len: usize, what: &str) -> Result<&'a [u8]> {
	offset
		.checked_add(len)
		.and_then(|end| data.get(offset..end))
		.ok_or_else(|| malformed(format!("{what} out of range ({offset:#x}+{len:#x}, buffer size {:#x})", data.len())))
}

pub(crate) fn u16_at(data: &[u8], offset: usize, what: &str) -> Result<u16> {
	let bytes = slice(data, offset, 2, what)?;
	Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub(crate) fn u32_at(data: &[u8], offset: usize, what: &str) -> Result<u32> {
	let bytes = slice(data, offset, 4, what)?;
	Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn u64_at(data: &[u8], offset: usize, what: &str) -> Result<u64> {
	Ok(u64::from(u32_at(data, offset, what)?) | u64::from(u32_at(data, offset + 4, what)?) << 32)
}

/// Sequential reader used for the length-prefixed record streams.
pub(crate) struct Cursor<'a> {
	data: &'a [u8],
	pos: usize,
}

impl<'a> Cursor<'a> {
	pub(crate) fn new(data: &'a [u8]) -> Self {
		Self { data, pos: 0 }
	}

	pub(crate) fn position(&self) -> usize {
		self.pos
	}

	pub(crate) fn remaining(&self) -> usize {
		self.data.len() - self.pos
	}

	pub(crate) fn u32(&mut self, what: &str) -> Result<u32> {
		let value = u32_at(self.data, self.pos, what)?;
		self.pos += 4;
		Ok(value)
	}

	pub(crate) fn bytes(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
		let bytes = slice(self.data, self.pos, len, what)?;
		self.pos += len;
		Ok(bytes)
	}
}

pub(crate) fn put_u16(out: &mut Vec<u8>, value: u16) {
	out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(out: &mut Vec<u8>, value: u32) {
	out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u64(out: &mut Vec<u8>, value: u64) {
	out.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn set_u16(out: &mut [u8], offset: usize, value: u16) {
	out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn set_u32(out: &mut [u8], offset: usize, value: u32) {
	out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn set_u64(out: &mut [u8], offset: usize, value: u64) {
	out[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn align_up(value: usize, align: usize) -> usize {
	if align <= 1 { value } else { value.div_ceil(align) * align }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn out_of_range_reads_fail() {
		let data = [1, 0, 0, 0, 2];
		assert_eq!(u32_at(&data, 0, "word").unwrap(), 1);
		assert!(u32_at(&data, 2, "word").is_err());
		assert!(slice(&data, usize::MAX, 2, "span").is_err());
	}

	#[test]
	fn cursor_walks_records() {
		let data = [3, 0, 0, 0, b'a', b'b', b'c'];
		let mut cursor = Cursor::new(&data);
		let len = cursor.u32("len").unwrap() as usize;
		assert_eq!(cursor.bytes(len, "name").unwrap(), b"abc");
		assert_eq!(cursor.remaining(), 0);
		assert!(cursor.u32("next").is_err());
	}
}
