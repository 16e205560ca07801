//! The two-pass assembler. Pass one tokenizes, resolves instruction forms
//! against the format table and emits code and data, recording a patch for
//! every identifier whose address is not yet known. Pass two appends the
//! data region after the code, fixes every patch with the resolved
//! absolute address (or byte length, for `~name` references) and writes
//! the image header.

use super::parse::{
    tokenize, AsmToken, Immediate, MemOperand, Memory, Register, SpannedToken,
};
use super::{
    DataType, FormatTable, ImageHeader, InstrFormat, Opcode, OperandFormat,
    HEADER_SIZE,
};
use crate::error::{AsmError, SourceErrorWrapper, WithSource};
use crate::util::Span;
use std::collections::HashMap;

/// Assemble a source file into an executable image. All diagnostics are
/// collected; any error fails the assembly as a whole.
pub fn assemble(
    src: &str,
    source_name: &str,
) -> Result<Vec<u8>, WithSource<AsmError>> {
    let mut errors = Vec::new();
    let tokens = tokenize(src, &mut errors);
    let mut assembler = Assembler {
        src,
        tokens,
        pos: 0,
        formats: FormatTable::new(),
        errors,
        values: HashMap::new(),
        idens: HashMap::new(),
        code: vec![0u8; HEADER_SIZE],
        data: Vec::new(),
        unfinished: Vec::new(),
    };
    assembler.first_pass();
    let image = assembler.second_pass();
    if assembler.errors.is_empty() {
        Ok(image)
    } else {
        Err(WithSource::new(
            assembler.errors,
            source_name.into(),
            src.into(),
        ))
    }
}

/// A DB/DBS/LBL entry: its address (code-relative for labels,
/// data-relative until pass two for data) and byte length.
#[derive(Debug)]
struct DbEntry {
    value: u64,
    length: u64,
    /// Labels are final immediately; data addresses shift in pass two
    defined: bool,
}

/// One 8-byte slot waiting for identifier resolution.
#[derive(Debug)]
struct Patch {
    /// Identifiers summed into the slot (name, negated); `~name` takes
    /// the entry's length instead of its address
    parts: Vec<(String, bool)>,
    addend: i64,
    at: usize,
    span: Span,
}

struct Assembler<'a> {
    src: &'a str,
    tokens: Vec<SpannedToken>,
    pos: usize,
    formats: FormatTable,
    errors: Vec<SourceErrorWrapper<AsmError>>,
    values: HashMap<String, AsmToken>,
    idens: HashMap<String, DbEntry>,
    code: Vec<u8>,
    data: Vec<u8>,
    unfinished: Vec<Patch>,
}

impl<'a> Assembler<'a> {
    fn error(&mut self, error: AsmError, span: Span) {
        self.errors
            .push(SourceErrorWrapper::new(error, span, self.src));
    }

    fn next(&mut self) -> Option<SpannedToken> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn peek_is_op(&self) -> bool {
        matches!(
            self.tokens.get(self.pos),
            None | Some(SpannedToken {
                token: AsmToken::Op(_),
                ..
            })
        )
    }

    /// Expand `<name` references against the VAL table.
    fn expand(&mut self, spanned: SpannedToken) -> Option<SpannedToken> {
        match spanned.token {
            AsmToken::ValRef(name) => match self.values.get(&name) {
                Some(token) => Some(SpannedToken {
                    token: token.clone(),
                    span: spanned.span,
                }),
                None => {
                    self.error(AsmError::UnknownValue, spanned.span);
                    None
                }
            },
            _ => Some(spanned),
        }
    }

    fn expect_name(&mut self) -> Option<(String, Span)> {
        match self.next() {
            Some(SpannedToken {
                token: AsmToken::Ident(name),
                span,
            }) if !name.starts_with('~') => Some((name, span)),
            Some(other) => {
                self.error(AsmError::ExpectedName, other.span);
                None
            }
            None => {
                self.error(AsmError::ExpectedName, Span::default());
                None
            }
        }
    }

    // ===== Emission =====

    fn align_code(&mut self, to: usize) {
        while self.code.len() % to != 0 {
            self.code.push(0);
        }
    }

    fn align_data(&mut self, to: usize) {
        while self.data.len() % to != 0 {
            self.data.push(0);
        }
    }

    fn emit_code(&mut self, bytes: &[u8]) {
        // Fields align to the smallest power of two that holds them
        self.align_code(bytes.len().next_power_of_two().min(8));
        self.code.extend_from_slice(bytes);
    }

    /// Operand descriptor byte: target in the low two bits, value type
    /// above them.
    fn descriptor(target: u8, ty: DataType) -> u8 {
        target | (ty.code() << 2)
    }

    // ===== Pass one =====

    fn first_pass(&mut self) {
        while let Some(spanned) = self.next() {
            let op = match spanned.token {
                AsmToken::Op(op) => op,
                AsmToken::Ident(_) => {
                    self.error(AsmError::UnknownMnemonic, spanned.span);
                    continue;
                }
                _ => {
                    self.error(AsmError::ExpectedMnemonic, spanned.span);
                    continue;
                }
            };
            match op {
                Opcode::LBL => self.define_label(),
                Opcode::VAL => self.define_value(),
                Opcode::DB | Opcode::DBS => self.define_data(),
                _ => self.instruction(op, spanned.span),
            }
        }
    }

    fn define_label(&mut self) {
        if let Some((name, span)) = self.expect_name() {
            let value = self.code.len() as u64;
            if self.idens.contains_key(&name) {
                self.error(AsmError::DuplicateName, span);
            } else {
                self.idens.insert(
                    name,
                    DbEntry {
                        value,
                        length: 0,
                        defined: true,
                    },
                );
            }
        }
    }

    fn define_value(&mut self) {
        let name = match self.expect_name() {
            Some((name, _)) => name,
            None => return,
        };
        match self.next() {
            Some(SpannedToken {
                token: AsmToken::Op(_),
                span,
            })
            | Some(SpannedToken {
                token: AsmToken::ValRef(_),
                span,
            }) => {
                self.error(AsmError::InvalidData, span);
            }
            Some(spanned) => {
                self.values.insert(name, spanned.token);
            }
            None => self.error(AsmError::InvalidData, Span::default()),
        }
    }

    /// `DB`/`DBS name v₁ v₂ …`: contiguous raw data, 8-byte-aligned
    /// start, length recorded for `~name`.
    fn define_data(&mut self) {
        let (name, span) = match self.expect_name() {
            Some(entry) => entry,
            None => return,
        };
        self.align_data(8);
        let start = self.data.len();
        while !self.peek_is_op() {
            let spanned = self.next().unwrap();
            let spanned = match self.expand(spanned) {
                Some(spanned) => spanned,
                None => continue,
            };
            match spanned.token {
                AsmToken::Str(bytes) => self.data.extend_from_slice(&bytes),
                AsmToken::Imm(imm) => {
                    let bytes = imm.bits.to_le_bytes();
                    self.data.extend_from_slice(&bytes[..imm.ty.size()]);
                }
                _ => self.error(AsmError::InvalidData, spanned.span),
            }
        }
        let length = (self.data.len() - start) as u64;
        // Every block occupies at least one aligned slot
        if length < 8 {
            self.data.resize(start + 8, 0);
        }
        if self.idens.contains_key(&name) {
            self.error(AsmError::DuplicateName, span);
        } else {
            self.idens.insert(
                name,
                DbEntry {
                    value: start as u64,
                    length,
                    defined: false,
                },
            );
        }
    }

    fn instruction(&mut self, op: Opcode, op_span: Span) {
        // Gather up to three operands
        let mut operands: Vec<SpannedToken> = Vec::new();
        while !self.peek_is_op() {
            let spanned = self.next().unwrap();
            let spanned = match self.expand(spanned) {
                Some(spanned) => spanned,
                None => continue,
            };
            if operands.len() == 3 {
                self.error(AsmError::TooManyOperands, spanned.span);
                continue;
            }
            operands.push(spanned);
        }

        // Summarize each operand into a format word
        let mut input = InstrFormat::new(&[]);
        for (i, operand) in operands.iter().enumerate() {
            input.ops[i] = match &operand.token {
                AsmToken::Imm(imm) => {
                    OperandFormat::for_operand(OperandFormat::IMM, imm.ty)
                }
                AsmToken::Reg(reg) => {
                    OperandFormat::for_operand(OperandFormat::REG, reg.ty)
                }
                AsmToken::Mem(mem) => {
                    OperandFormat::for_operand(OperandFormat::MEM, mem.ty)
                }
                // Identifiers become u64 immediates once resolved
                AsmToken::Ident(_) => OperandFormat::for_operand(
                    OperandFormat::IMM,
                    DataType::U64,
                ),
                _ => {
                    self.error(AsmError::MalformedOperand, operand.span);
                    OperandFormat::empty()
                }
            };
        }

        let internal = match self.formats.select(op, &input) {
            Some((internal, _)) => internal,
            None => {
                self.error(
                    AsmError::FormatMismatch {
                        mnemonic: op.name().into(),
                    },
                    op_span,
                );
                return;
            }
        };

        self.emit_code(&internal.to_le_bytes());
        for operand in operands {
            self.emit_operand(operand);
        }
    }

    fn emit_operand(&mut self, operand: SpannedToken) {
        match operand.token {
            AsmToken::Imm(imm) => {
                self.emit_code(&[Self::descriptor(0, imm.ty)]);
                let bytes = imm.bits.to_le_bytes();
                self.emit_code(&bytes[..imm.ty.size()]);
            }
            AsmToken::Reg(reg) => {
                self.emit_code(&[Self::descriptor(1, reg.ty)]);
                self.emit_code(&[reg.index]);
            }
            AsmToken::Ident(name) => {
                self.emit_code(&[Self::descriptor(0, DataType::U64)]);
                self.align_code(8);
                let at = self.code.len();
                self.emit_code(&[0u8; 8]);
                self.unfinished.push(Patch {
                    parts: vec![(name, false)],
                    addend: 0,
                    at,
                    span: operand.span,
                });
            }
            AsmToken::Mem(mem) => self.emit_memory(mem, operand.span),
            _ => self.error(AsmError::MalformedOperand, operand.span),
        }
    }

    /// Memory operand: header byte, location, then offset. Immediate
    /// offsets against non-register locations are folded into the
    /// location word.
    fn emit_memory(&mut self, mem: Memory, span: Span) {
        let loc_is_reg = matches!(mem.location, MemOperand::Reg(_));
        let off_type: u8 = match &mem.offset {
            None => 0,
            Some((negated, MemOperand::Reg(_))) => 1 + u8::from(*negated),
            Some(_) => 3,
        };
        self.emit_code(&[Self::descriptor(2, mem.ty)]);
        let header = u8::from(loc_is_reg) | (off_type << 1);
        self.emit_code(&[header]);

        // Location word (or register byte)
        let mut parts: Vec<(String, bool)> = Vec::new();
        let mut addend: i64 = 0;
        let mut slot: Option<usize> = None;
        match mem.location {
            MemOperand::Reg(Register { index, .. }) => {
                self.emit_code(&[index]);
            }
            MemOperand::Imm(Immediate { bits, .. }) => {
                addend += bits as i64;
                self.align_code(8);
                slot = Some(self.code.len());
                self.emit_code(&[0u8; 8]);
            }
            MemOperand::Ident(name) => {
                parts.push((name, false));
                self.align_code(8);
                slot = Some(self.code.len());
                self.emit_code(&[0u8; 8]);
            }
        }

        // Offset
        match mem.offset {
            None => {}
            Some((_, MemOperand::Reg(Register { index, .. }))) => {
                self.emit_code(&[index]);
            }
            Some((negated, MemOperand::Imm(Immediate { bits, .. }))) => {
                let value = bits as i64;
                let value = if negated { -value } else { value };
                if loc_is_reg {
                    // Separate word after the register byte
                    self.align_code(8);
                    self.emit_code(&(value as u64).to_le_bytes().to_vec());
                } else {
                    addend += value;
                }
            }
            Some((negated, MemOperand::Ident(name))) => {
                if loc_is_reg {
                    self.align_code(8);
                    let at = self.code.len();
                    self.emit_code(&[0u8; 8]);
                    self.unfinished.push(Patch {
                        parts: vec![(name, negated)],
                        addend: 0,
                        at,
                        span,
                    });
                } else {
                    parts.push((name, negated));
                }
            }
        }

        match slot {
            Some(at) if !parts.is_empty() => {
                self.unfinished.push(Patch {
                    parts,
                    addend,
                    at,
                    span,
                });
            }
            Some(at) => {
                // Fully constant: write it now
                self.code[at..at + 8]
                    .copy_from_slice(&(addend as u64).to_le_bytes());
            }
            None => {}
        }
    }

    // ===== Pass two =====

    fn second_pass(&mut self) -> Vec<u8> {
        self.align_code(8);
        self.align_data(8);

        let data_start = self.code.len() as u64;
        let total = data_start + self.data.len() as u64;

        // Data addresses become absolute
        for entry in self.idens.values_mut() {
            if !entry.defined {
                entry.value += data_start;
                entry.defined = true;
            }
        }

        let patches = std::mem::take(&mut self.unfinished);
        for patch in patches {
            let mut value = patch.addend;
            let mut ok = true;
            for (name, negated) in &patch.parts {
                let (lookup, want_length) = match name.strip_prefix('~') {
                    Some(stripped) => (stripped, true),
                    None => (name.as_str(), false),
                };
                match self.idens.get(lookup) {
                    Some(entry) => {
                        let part = if want_length {
                            entry.length as i64
                        } else {
                            entry.value as i64
                        };
                        value += if *negated { -part } else { part };
                    }
                    None => {
                        ok = false;
                        self.errors.push(SourceErrorWrapper::new(
                            AsmError::UnknownIdentifier,
                            patch.span,
                            self.src,
                        ));
                    }
                }
            }
            if ok {
                self.code[patch.at..patch.at + 8]
                    .copy_from_slice(&(value as u64).to_le_bytes());
            }
        }

        let header = ImageHeader {
            data_start,
            size: total,
            ..ImageHeader::default()
        };
        header.write_to(&mut self.code);

        let mut image = std::mem::take(&mut self.code);
        image.extend_from_slice(&self.data);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::{ImageHeader, DEFAULT_CODE_START};
    use std::convert::TryFrom;

    fn assemble_ok(src: &str) -> Vec<u8> {
        match assemble(src, "test.nnasm") {
            Ok(image) => image,
            Err(errors) => panic!("assembly failed:\n{}", errors),
        }
    }

    fn assemble_errors(src: &str) -> Vec<String> {
        match assemble(src, "test.nnasm") {
            Ok(_) => panic!("expected errors"),
            Err(errors) => {
                errors.errors().iter().map(|e| e.to_string()).collect()
            }
        }
    }

    #[test]
    fn test_header_of_trivial_program() {
        let image = assemble_ok("NOP HLT");
        let header = ImageHeader::read_from(&image).unwrap();
        assert_eq!(header.code_start, DEFAULT_CODE_START);
        assert_eq!(header.size, image.len() as u64);
        assert!(header.data_start >= DEFAULT_CODE_START + 4);
        // Two two-byte instructions right at code start
        let code = &image[DEFAULT_CODE_START as usize..];
        let formats = FormatTable::new();
        let first = u16::from_le_bytes([code[0], code[1]]);
        assert_eq!(formats.decode(first).unwrap().0, Opcode::NOP);
        let second = u16::from_le_bytes([code[2], code[3]]);
        assert_eq!(formats.decode(second).unwrap().0, Opcode::HLT);
    }

    #[test]
    fn test_forward_label_is_patched() {
        // The JMP operand slot is filled in by pass two
        let image = assemble_ok("JMP exit NOP LBL exit HLT");
        let header = ImageHeader::read_from(&image).unwrap();
        let code_start = header.code_start as usize;
        // Operand slot: opcode (2 bytes) + descriptor byte, aligned to 8
        let slot = {
            let mut at = code_start + 2 + 1;
            at += (8 - at % 8) % 8;
            at
        };
        let target = u64::from_le_bytes(
            <[u8; 8]>::try_from(&image[slot..slot + 8]).unwrap(),
        );
        // The label is past the jump and the NOP, inside the code region
        assert!(target > slot as u64);
        assert!(target < header.data_start);
        // And an HLT lives exactly there
        let hlt = u16::from_le_bytes([
            image[target as usize],
            image[target as usize + 1],
        ]);
        assert_eq!(
            FormatTable::new().decode(hlt).unwrap().0,
            Opcode::HLT
        );
    }

    #[test]
    fn test_data_blocks_and_size_refs() {
        let src = r#"
            DB stuff 1_8 2_8 3_8 4_8
            DBS msg "hello"
            MOV ~msg $r0
            MOV stuff $r1
            HLT
        "#;
        let image = assemble_ok(src);
        let header = ImageHeader::read_from(&image).unwrap();
        // Data region: 4 bytes + pad to 8, then "hello" + pad
        let data = &image[header.data_start as usize..];
        assert_eq!(&data[0..4], &[1, 2, 3, 4]);
        assert_eq!(&data[8..13], b"hello");

        // MOV ~msg $r0 loads the string's length
        let code = &image[header.code_start as usize..];
        let first = u16::from_le_bytes([code[0], code[1]]);
        assert_eq!(FormatTable::new().decode(first).unwrap().0, Opcode::MOV);
        let mut slot = header.code_start as usize + 2 + 1;
        slot += (8 - slot % 8) % 8;
        let length = u64::from_le_bytes(
            <[u8; 8]>::try_from(&image[slot..slot + 8]).unwrap(),
        );
        assert_eq!(length, 5);
    }

    #[test]
    fn test_val_aliases_expand() {
        let with_alias = assemble_ok("VAL ten 10 MOV <ten $r0 HLT");
        let direct = assemble_ok("MOV 10 $r0 HLT");
        assert_eq!(with_alias, direct);
    }

    #[test]
    fn test_duplicate_label_reports() {
        let errors = assemble_errors("LBL a LBL a HLT");
        assert!(errors[0].contains("already been defined"));
    }

    #[test]
    fn test_unknown_identifier_reports_in_pass_two() {
        let errors = assemble_errors("JMP nowhere HLT");
        assert!(errors[0].contains("could not be resolved"));
    }

    #[test]
    fn test_format_mismatch_reports() {
        // MOV into an immediate is not a thing
        let errors = assemble_errors("MOV $r0 10 HLT");
        assert!(errors[0].contains("MOV"));
    }

    #[test]
    fn test_memory_operands_encode() {
        let image = assemble_ok("LOAD [$r1 + 8] $r0 HLT");
        let header = ImageHeader::read_from(&image).unwrap();
        let code = &image[header.code_start as usize..];
        let internal = u16::from_le_bytes([code[0], code[1]]);
        assert_eq!(
            FormatTable::new().decode(internal).unwrap().0,
            Opcode::LOAD
        );
        // Descriptor: mem target
        assert_eq!(code[2] & 0b11, 2);
        // Header: location is a register, offset is an immediate
        assert_eq!(code[3] & 0b1, 1);
        assert_eq!((code[3] >> 1) & 0b11, 3);
        // Register byte
        assert_eq!(code[4], 1);
    }
}
