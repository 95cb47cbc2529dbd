// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

use crate::asm::AssemblyError;
use crate::device::DeviceTable;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
	/// Truncated buffer, failed structural check or a reference that points nowhere.
	#[error("malformed container: {0}")]
	Malformed(String),

	#[error("can't determine GPU device type ({table} code {code:#x})")]
	UnknownDevice { table: DeviceTable, code: u32 },

	#[error("malformed container: {0}")]
	Elf(#[from] goblin::error::Error),

	#[error(transparent)]
	Assembly(#[from] AssemblyError),

	/// Assembled state the container format cannot represent.
	#[error("can't generate binary: {0}")]
	Generate(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),
}

pub(crate) fn malformed(reason: impl Into<String>) -> Error {
	Error::Malformed(reason.into())
}
