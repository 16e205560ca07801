//! Integration tests for the assembler: source through both passes to a
//! finished image, including the header, data region, reference forms and
//! the disassembly round trip.

use nn::asm::assemble::assemble;
use nn::asm::disasm::disassemble;
use nn::asm::{ImageHeader, DEFAULT_CODE_START, HEADER_SIZE, MAGIC};

fn assemble_ok(src: &str) -> Vec<u8> {
    match assemble(src, "test.nnasm") {
        Ok(image) => image,
        Err(errors) => panic!("assembly failed:\n{:#}", errors),
    }
}

#[test]
fn test_image_layout() {
    let image = assemble_ok(
        "DBS greeting \"hello world\"\n\
         MOV greeting $r0\n\
         MOV ~greeting $r1\n\
         HLT\n",
    );
    // Magic and header fields
    assert_eq!(&image[0..4], &MAGIC);
    let header = ImageHeader::read_from(&image).unwrap();
    assert_eq!(header.code_start, DEFAULT_CODE_START);
    assert!(header.data_start > header.code_start);
    assert_eq!(header.size as usize, image.len());
    // Reserved header area stays zero
    assert!(image[40..HEADER_SIZE].iter().all(|&b| b == 0));
    // The string is in the data region
    let data = &image[header.data_start as usize..];
    assert_eq!(&data[..11], b"hello world");
}

#[test]
fn test_forward_and_backward_references() {
    // Forward reference to `end`, backward reference to `top`: both are
    // pass-two patches into already-emitted code
    let image = assemble_ok(
        "LBL top\n\
         DEC $r0\n\
         CNZR $r0\n\
         JCH top\n\
         JMP end\n\
         NOP\n\
         LBL end\n\
         HLT\n",
    );
    let header = ImageHeader::read_from(&image).unwrap();
    // No unresolved (zero) operand slots remain inside the code region:
    // both jump slots must point inside the code region
    let listing = disassemble(&image).unwrap();
    for line in listing.lines() {
        if let Some(rest) = line.strip_prefix("JMP ") {
            let target: u64 = rest.trim().parse().unwrap();
            assert!(target >= header.code_start);
            assert!(target < header.data_start);
        }
    }
}

#[test]
fn test_errors_carry_positions() {
    let errors = assemble("MOV $r99 $r0", "bad.nnasm").unwrap_err();
    let rendered = format!("{}", errors);
    // file:line:col prefix per the diagnostic format
    assert!(
        rendered.starts_with("bad.nnasm:1:"),
        "unexpected rendering: {}",
        rendered
    );
}

#[test]
fn test_assembler_collects_multiple_errors() {
    let errors =
        assemble("MOV $r99 $r0\nJMP nowhere\nBADOP", "bad.nnasm")
            .unwrap_err();
    assert!(errors.errors().len() >= 3);
}

#[test]
fn test_disassembly_roundtrip() {
    // Label-free programs survive assemble → disassemble textually
    let src = "MOV 10 $r0\nADD 5 $r0\nMOV -1_s $r1_s\nSADD $r1_s $r0_s\nHLT\n";
    let image = assemble_ok(src);
    let listing = disassemble(&image).unwrap();
    let tokens = |s: &str| {
        s.split_whitespace().map(str::to_string).collect::<Vec<_>>()
    };
    assert_eq!(tokens(&listing), tokens(src));
}

#[test]
fn test_assemble_is_deterministic() {
    let src = "DB table 1_16 2_16 3_16\nMOV table $r3\nHLT";
    assert_eq!(assemble_ok(src), assemble_ok(src));
}
