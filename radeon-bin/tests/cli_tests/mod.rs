use super::*;
use assert_cmd::cargo_bin_cmd;
use std::fs;

const SOURCE: &str = ".amdcl2\n.gpu Bonaire\n.kernel copy\n    .config\n        .dims x\n        .arg n, \"uint\", value, 4\n    .text\n        .int 0xbf810000\n";

#[test]
fn test_disasm_help() {
	cargo_bin_cmd!("radeon-disasm").arg("--help").assert().success();
}

#[test]
fn test_disasm_no_files() {
	cargo_bin_cmd!("radeon-disasm").assert().failure();
}

#[test]
fn test_disasm_unknown_device() {
	let tempdir = tempfile::tempdir().unwrap();
	let file = tempdir.path().join("code.bin");
	fs::write(&file, [0, 0, 0x81, 0xbf]).unwrap();
	let assert = cargo_bin_cmd!("radeon-disasm").args(["-r", "-g", "Voodoo"]).arg(&file).assert().failure();
	let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
	assert!(stderr.contains("unknown GPU device type 'Voodoo'"), "{stderr}");
}

#[test]
fn test_disasm_raw_code() {
	let tempdir = tempfile::tempdir().unwrap();
	let file = tempdir.path().join("code.bin");
	fs::write(&file, [1, 0, 0, 0, 0xaa]).unwrap();
	let assert = cargo_bin_cmd!("radeon-disasm").args(["-r", "-A", "GCN1.2"]).arg(&file).assert().success();
	let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
	let expected = format!(
		"/* Disassembling '{}' */\n.rawcode\n.gpu Tonga\n.text\n        .int 0x00000001\n        .byte 0xaa\n",
		file.display()
	);
	assert_text_eq(&expected, &stdout, "raw code listing");
}

#[test]
fn test_asm_then_disasm() {
	let tempdir = tempfile::tempdir().unwrap();
	let source = tempdir.path().join("copy.s");
	let binary = tempdir.path().join("copy.bin");
	fs::write(&source, SOURCE).unwrap();

	cargo_bin_cmd!("radeon-asm").arg("-o").arg(&binary).arg(&source).assert().success();
	assert!(binary.exists());

	let assert = cargo_bin_cmd!("radeon-disasm").args(["-a", "-C"]).arg(&binary).assert().success();
	let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
	assert!(stdout.starts_with(&format!("/* Disassembling '{}' */\n.amdcl2\n.gpu Bonaire\n", binary.display())), "{stdout}");
	assert!(stdout.contains(".kernel copy\n    .config\n        .dims x\n"), "{stdout}");
	assert!(stdout.contains("        .arg n, \"uint\", value, 4\n"), "{stdout}");
}

#[test]
fn test_disasm_continues_after_a_bad_file() {
	let tempdir = tempfile::tempdir().unwrap();
	let good = tempdir.path().join("good.bin");
	let missing = tempdir.path().join("missing.bin");
	fs::write(&good, assemble(SOURCE)).unwrap();

	let assert = cargo_bin_cmd!("radeon-disasm").arg(&missing).arg(&good).assert().failure();
	let output = assert.get_output();
	let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
	assert!(stdout.starts_with(&format!("/* ERROR for '{}' */\n", missing.display())), "{stdout}");
	assert!(stdout.contains(&format!("/* Disassembling '{}' */\n.amdcl2\n", good.display())), "{stdout}");
	assert!(!String::from_utf8_lossy(&output.stderr).is_empty());
}

#[test]
fn test_asm_reports_every_error() {
	let tempdir = tempfile::tempdir().unwrap();
	let source = tempdir.path().join("bad.s");
	let binary = tempdir.path().join("bad.bin");
	fs::write(&source, ".amdcl2\n.kernel k\n.bogus\n.config\n.sgprsnum 1000\n").unwrap();

	let assert = cargo_bin_cmd!("radeon-asm").arg("-o").arg(&binary).arg(&source).assert().failure();
	let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
	assert!(stderr.contains(":3: error: unknown directive '.bogus'"), "{stderr}");
	assert!(stderr.contains(":5: error: used SGPRs number out of range (0-104)"), "{stderr}");
	assert!(!binary.exists());
}

#[test]
fn test_asm_rejects_other_formats() {
	let tempdir = tempfile::tempdir().unwrap();
	let source = tempdir.path().join("legacy.s");
	fs::write(&source, ".amd\n.gpu Pitcairn\n").unwrap();
	let assert = cargo_bin_cmd!("radeon-asm").arg("-o").arg(tempdir.path().join("out.bin")).arg(&source).assert().failure();
	let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
	assert!(stderr.contains("only the AMD OpenCL 2.0 format (.amdcl2) can be assembled"), "{stderr}");
}
