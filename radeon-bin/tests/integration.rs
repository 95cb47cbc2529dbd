// SPDX-FileCopyrightText: 2025 LunNova
//
// SPDX-License-Identifier: MIT

mod cli_tests;

mod listing_tests;

mod roundtrip_tests;

use radeon_bin::{AssemblerOptions, DisasmFlags, DisasmOptions};

/// Panics with a line diff when the texts differ.
fn assert_text_eq(expected: &str, actual: &str, what: &str) {
	if expected == actual {
		return;
	}
	eprintln!("=== EXPECTED ===\n{expected}");
	eprintln!("=== GOT ===\n{actual}");
	eprintln!("=== DIFF ===");
	for diff in diff::lines(expected, actual) {
		match diff {
			diff::Result::Left(l) => eprintln!("-{l}"),
			diff::Result::Right(r) => eprintln!("+{r}"),
			diff::Result::Both(b, _) => eprintln!(" {b}"),
		}
	}
	panic!("{what} did not match expected output");
}

fn assemble(source: &str) -> Vec<u8> {
	match radeon_bin::assemble(source, &AssemblerOptions::default()) {
		Ok(assembled) => assembled.binary,
		Err(error) => panic!("{error}"),
	}
}

fn disassemble(binary: &[u8], flags: DisasmFlags) -> String {
	let options = DisasmOptions {
		flags,
		..DisasmOptions::default()
	};
	let mut out = Vec::new();
	radeon_bin::disassemble(binary, &options, &mut out).expect("disassembly failed");
	String::from_utf8(out).expect("listing is not UTF-8")
}
