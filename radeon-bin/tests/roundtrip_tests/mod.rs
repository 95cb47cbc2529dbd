use super::*;
use radeon_bin::container::cl2::Cl2Container;
use radeon_bin::lower::{Cl2Relocation, RelocKind, RelocTarget, lower_cl2};
use radeon_bin::render::data::write_bytes;

const CL2_SOURCE: &str = r#"
.amdcl2
.gpu Tonga
.driver_version 191205
.compile_options "-O2 -DWIDTH=4"
.acl_version "AMD-COMP-LIB-v0.8 (0.0.SC_BUILD_NUMBER)"

.kernel scale
    .config
        .dims xy
        .cws 8, 8, 1
        .sgprsnum 18
        .vgprsnum 7
        .localsize 1024
        .ieeemode
        .usesetup
        .sampler 0x10
        .arg out, "float*", global, 16
        .arg in, "const float*", constant
        .arg factor, "float", value, 4
        .arg smp, "sampler_t", sampler
        .arg img, "image2d_t", image, read_only
    .text
        .int 0xbf8c007f
        .int (.gdata+8)&0xffffffff, (.gdata+8)>>32
        .int .bdata&0xffffffff
        .int (.ddata-4)&0xffffffff
        .int 0xbf810000

/* records instead of a configuration */
.kernel raw
    .metadata
        .byte 1, 2, 3, 4, 5, 6, 7, 8
    .setup
        .fill 256, 1, 0
    .text
        .int 0xbf810000

.samplerinit
    .quad 0x10, 0x22
.globaldata
.gdata:
    .fill 8, 1, 0x5a
    .quad 0
    .samplerreloc 8, 1
    .ascii "lookup table"
.data
.ddata:
    .int 1, 2, 3
.section .bss align=16
.bdata:
    .skip 64
"#;

#[test]
fn assembled_binary_lowers_to_source_contents() {
	let binary = assemble(CL2_SOURCE);
	let container = Cl2Container::parse(&binary).unwrap();
	let input = lower_cl2(&container).unwrap();
	assert_eq!(input.device, radeon_bin::GpuDeviceType::Tonga);
	assert_eq!(input.driver_version, 191205);
	assert_eq!(&input.compile_options[..], b"-O2 -DWIDTH=4");
	assert_eq!(input.bss_size, 64);
	assert_eq!(input.bss_alignment, 16);
	assert_eq!(input.sampler_relocs, [(8, 1)]);
	assert_eq!(input.rw_data.as_deref(), Some(&[1, 0, 0, 0, 2, 0, 0, 0, 3, 0, 0, 0][..]));
	assert_eq!(input.kernels.len(), 2);
	let targets: Vec<(usize, RelocKind, RelocTarget, i64)> =
		input.kernels[0].relocations.iter().map(|Cl2Relocation { offset, kind, target, addend }| (*offset, *kind, *target, *addend)).collect();
	assert_eq!(
		targets,
		[
			(4, RelocKind::Low32, RelocTarget::GlobalData, 8),
			(8, RelocKind::High32, RelocTarget::GlobalData, 8),
			(12, RelocKind::Low32, RelocTarget::Bss, 0),
			(16, RelocKind::Low32, RelocTarget::RwData, -4),
		]
	);
	assert!(input.kernels[1].relocations.is_empty());
}

#[test]
fn listing_reassembles_to_the_same_listing() {
	let flags = DisasmFlags::ALL | DisasmFlags::CONFIG;
	let first = disassemble(&assemble(CL2_SOURCE), flags);
	for line in [
		".kernel scale\n    .config\n        .dims xy\n        .cws 8, 8, 1\n",
		"        .arg out, \"float*\", global, 16\n",
		"        .arg img, \"image2d_t\", image, read_only\n",
		"(.gdata+8)&0xffffffff",
		"(.ddata-4)&0xffffffff",
		".bdata&0xffffffff",
		"    .samplerreloc 8, 1\n",
		".section .bss align=16\n.bdata:\n    .skip 64\n",
		".kernel raw\n    .metadata\n",
		"        .fill 256, 1, 0x00\n",
	] {
		assert!(first.contains(line), "missing {line:?} in\n{first}");
	}
	let second = disassemble(&assemble(&first), flags);
	assert_text_eq(&first, &second, "re-assembled listing");
}

#[test]
fn raw_records_round_trip_without_config() {
	let flags = DisasmFlags::ALL;
	let first = disassemble(&assemble(CL2_SOURCE), flags);
	assert!(!first.contains(".config"));
	assert!(first.contains(".kernel scale\n    .metadata\n"));
	let second = disassemble(&assemble(&first), flags);
	assert_text_eq(&first, &second, "re-assembled record listing");
}

#[test]
fn reassembled_listing_reproduces_the_binary_contents() {
	let original = assemble(CL2_SOURCE);
	let expected = lower_cl2(&Cl2Container::parse(&original).unwrap()).unwrap();
	for flags in [DisasmFlags::ALL, DisasmFlags::ALL | DisasmFlags::CONFIG] {
		let reassembled = assemble(&disassemble(&original, flags));
		let actual = lower_cl2(&Cl2Container::parse(&reassembled).unwrap()).unwrap();
		assert_eq!(actual, expected, "contents differ after a round trip with {flags:?}");
	}
}

/// Small deterministic generator for byte patterns with runs.
struct Lcg(u32);

impl Lcg {
	fn next(&mut self) -> u32 {
		self.0 = self.0.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
		self.0 >> 16
	}
}

#[test]
fn fill_compressed_dumps_assemble_to_the_original_bytes() {
	let mut rng = Lcg(0x5eed);
	for case in 0..40 {
		let mut data = Vec::new();
		while data.len() < 10 + case * 7 {
			let value = rng.next() as u8 % 4;
			let run = if rng.next() % 3 == 0 { rng.next() as usize % 30 } else { 1 };
			data.extend(std::iter::repeat_n(value, run.max(1)));
		}
		let mut dump = Vec::new();
		write_bytes(&mut dump, &data, false).unwrap();
		let dump = String::from_utf8(dump).unwrap();
		let binary = assemble(&format!(".amdcl2\n.globaldata\n{dump}"));
		let input = lower_cl2(&Cl2Container::parse(&binary).unwrap()).unwrap();
		assert_eq!(input.global_data.as_deref(), Some(data.as_slice()), "case {case}:\n{dump}");
	}
}

#[test]
fn mutually_exclusive_kernel_descriptions() {
	let config_then_setup = radeon_bin::assemble(".amdcl2\n.kernel k\n.config\n.setup\n", &AssemblerOptions::default());
	let setup_then_config = radeon_bin::assemble(".amdcl2\n.kernel k\n.stub\n.config\n", &AssemblerOptions::default());
	for (result, message) in [
		(config_then_setup, "setup can't be defined if configuration was defined"),
		(setup_then_config, "config can't be defined if metadata, setup or stub sections exist"),
	] {
		match result {
			Err(radeon_bin::Error::Assembly(error)) => assert_eq!(error.diagnostics[0].message, message),
			other => panic!("expected an assembly error, got {:?}", other.map(|assembled| assembled.warnings)),
		}
	}
}
