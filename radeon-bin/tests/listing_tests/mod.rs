use super::*;
use radeon_bin::calnote::{CalNoteHeader, CalNoteKind};
use radeon_bin::lower::{AmdInput, AmdKernelInput, CalNoteInput};
use radeon_bin::{Disassembler, DisasmInput, GpuDeviceType};
use std::borrow::Cow;

fn words(values: &[u32]) -> Vec<u8> {
	values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn note(kind: u32, data: Vec<u8>) -> CalNoteInput<'static> {
	CalNoteInput {
		header: CalNoteHeader::new(kind, data.len() as u32),
		data: Cow::Owned(data),
	}
}

fn legacy_kernel_input() -> DisasmInput<'static> {
	let mut header = vec![1, 2, 0, 0, 0, 44, 0, 0, 12, 3, 6, 3, 3, 2, 0, 0];
	header.extend([19; 23]);
	header.push(18);
	header.extend([19; 19]);
	assert_eq!(header.len(), 59);

	let cal_notes = vec![
		note(CalNoteKind::ProgInfo.code(), words(&[0x8000_1000, 3, 0x8000_1001, 0x17])),
		note(CalNoteKind::Inputs.code(), Vec::new()),
		note(CalNoteKind::Outputs.code(), Vec::new()),
		note(CalNoteKind::EarlyExit.code(), words(&[121])),
		note(CalNoteKind::EarlyExit.code(), words(&[0])),
		note(CalNoteKind::Float32Consts.code(), words(&[0, 4])),
		note(CalNoteKind::InputSamplers.code(), words(&[0, 0x1b])),
		note(CalNoteKind::ConstantBuffers.code(), words(&[0, 3, 1, 2])),
		note(0x3d, (1..=10).collect()),
		note(CalNoteKind::UavOpMask.code(), words(&[128])),
	];

	DisasmInput::Amd(AmdInput {
		device: GpuDeviceType::Pitcairn,
		is_64bit: false,
		driver_info: Cow::Borrowed(b"AMD-APP (1800.8)"),
		compile_options: Cow::Borrowed(b"-O2"),
		global_data: Cow::Owned(vec![13, 56, 66, 213, 55, 93, 123, 85, 164, 234, 21, 37, 44, 188]),
		kernels: vec![AmdKernelInput {
			name: Cow::Borrowed("kernelxVCR"),
			header: Some(Cow::Owned(header)),
			code: Some(Cow::Owned(words(&[0x3f80_0000, 0x4000_0000]))),
			cal_notes,
			..Default::default()
		}],
	})
}

const LEGACY_LISTING: &str = r#".amd
.gpu Pitcairn
.32bit
.compile_options "-O2"
.driver_info "AMD-APP (1800.8)"
.data
    .byte 0x0d, 0x38, 0x42, 0xd5, 0x37, 0x5d, 0x7b, 0x55
    .byte 0xa4, 0xea, 0x15, 0x25, 0x2c, 0xbc
.kernel "kernelxVCR"
    .header
        .byte 0x01, 0x02, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00
        .byte 0x0c, 0x03, 0x06, 0x03, 0x03, 0x02, 0x00, 0x00
        .fill 16, 1, 0x13
        .byte 0x13, 0x13, 0x13, 0x13, 0x13, 0x13, 0x13, 0x12
        .fill 19, 1, 0x13
    .proginfo
        .entry 0x80001000, 0x00000003
        .entry 0x80001001, 0x00000017
    .inputs
    .outputs
    .earlyexit 121
    .earlyexit 0
    .floatconsts
        .segment 0, 4
    .inputsamplers
        .sampler 0, 0x1b
    .constantbuffers
        .cbmask 0, 3
        .cbmask 1, 2
    .calnote 0x3d
        .byte 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08
        .byte 0x09, 0x0a
    .uavopmask 128
    .text
        /*3f800000*/ .int 0x3f800000 /* 1.0 */
        /*40000000*/ .int 0x40000000 /* 2.0 */
"#;

#[test]
fn legacy_kernel_with_everything_enabled() {
	let input = legacy_kernel_input();
	let mut out = Vec::new();
	Disassembler::new(&input, DisasmFlags::ALL).disassemble(&mut out).unwrap();
	assert_text_eq(LEGACY_LISTING, &String::from_utf8(out).unwrap(), "legacy listing");
}

#[test]
fn listing_is_deterministic() {
	let input = legacy_kernel_input();
	let render = || {
		let mut out = Vec::new();
		Disassembler::new(&input, DisasmFlags::ALL).disassemble(&mut out).unwrap();
		out
	};
	assert_eq!(render(), render());
}

#[test]
fn cal_notes_only_with_their_flag() {
	let input = legacy_kernel_input();
	let mut out = Vec::new();
	Disassembler::new(&input, DisasmFlags::ALL - DisasmFlags::CAL_NOTES).disassemble(&mut out).unwrap();
	let listing = String::from_utf8(out).unwrap();
	assert!(!listing.contains(".proginfo"));
	assert!(!listing.contains(".calnote"));
	assert!(listing.contains(".fill 16, 1, 0x13"));
}
