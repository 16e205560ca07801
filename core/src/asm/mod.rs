//! The assembly side of the toolchain: opcode and operand-format tables,
//! instruction encoding, and the executable image header. The textual
//! dialect is tokenized in [parse] and translated in [assemble]; the
//! virtual machine consumes the encoded form directly.
//!
//! Encoding of one instruction:
//!
//! ```text
//! u16  internal opcode (index into the format table)
//! per operand:
//!   u8  descriptor: bits 0-1 target (0 imm, 1 reg, 2 mem), bits 2-5 type
//!   imm: value bytes of the declared width
//!   reg: one register byte
//!   mem: header byte, location (reg byte or u64), offset (reg byte;
//!        immediate offsets are folded into the location word)
//! ```
//!
//! The code pointer is aligned to the smallest power of two that fits the
//! field before every emission.

pub mod assemble;
pub mod disasm;
pub mod parse;

use bitflags::bitflags;
use num_enum::TryFromPrimitive;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt::{self, Display, Formatter};

/// Width and signedness of a value as the machine sees it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum DataType {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    F32,
    F64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            Self::U8 | Self::S8 => 1,
            Self::U16 | Self::S16 => 2,
            Self::U32 | Self::S32 | Self::F32 => 4,
            Self::U64 | Self::S64 | Self::F64 => 8,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, Self::S8 | Self::S16 | Self::S32 | Self::S64)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// The format-word bit for this type.
    fn format_bit(self) -> OperandFormat {
        match self {
            Self::U8 => OperandFormat::T_U8,
            Self::U16 => OperandFormat::T_U16,
            Self::U32 => OperandFormat::T_U32,
            Self::U64 => OperandFormat::T_U64,
            Self::S8 => OperandFormat::T_S8,
            Self::S16 => OperandFormat::T_S16,
            Self::S32 => OperandFormat::T_S32,
            Self::S64 => OperandFormat::T_S64,
            Self::F32 => OperandFormat::T_F32,
            Self::F64 => OperandFormat::T_F64,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::U16 => 1,
            Self::U32 => 2,
            Self::U64 => 3,
            Self::S8 => 4,
            Self::S16 => 5,
            Self::S32 => 6,
            Self::S64 => 7,
            Self::F32 => 8,
            Self::F64 => 9,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::U8,
            1 => Self::U16,
            2 => Self::U32,
            3 => Self::U64,
            4 => Self::S8,
            5 => Self::S16,
            6 => Self::S32,
            7 => Self::S64,
            8 => Self::F32,
            9 => Self::F64,
            _ => return None,
        })
    }
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "u8",
            Self::U16 => "u16",
            Self::U32 => "u32",
            Self::U64 => "u64",
            Self::S8 => "s8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::S64 => "s64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Every mnemonic of the dialect, pseudo-ops included.
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, TryFromPrimitive,
)]
#[repr(u8)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    NOP, LOAD, STOR, MOV, CPY, ZRO, SET, BRK, HLT,
    CZRO, CNZR, CEQ, CNEQ, CBS, CBNS,
    CLT, SCLT, FCLT, DCLT,
    CLE, SCLE, FCLE, DCLE,
    CGT, SCGT, FCGT, DCGT,
    CGE, SCGE, FCGE, DCGE,
    JMP, JMPR, SJMPR, JCH, JNCH,
    PUSH, POP, BTIN, CALL, RET,
    CSTU, CSTF, CSTD,
    CUTS, CUTF, CUTD,
    CFTS, CFTU, CFTD,
    CDTS, CDTU, CDTF,
    ADD, SADD, FADD, DADD,
    INC, SINC,
    SUB, SSUB, FSUB, DSUB,
    DEC, SDEC,
    MUL, SMUL, FMUL, DMUL,
    DIV, SDIV, FDIV, DDIV,
    MOD, SMOD,
    SABS, FABS, DABS,
    SNEG, FNEG, DNEG,
    SHR, SSHR, SHL, SSHL, RTR, RTL,
    AND, OR, XOR, NOT,
    // Pseudo-ops; never encoded
    VAL, DB, DBS, LBL,
}

impl Opcode {
    pub fn name(self) -> &'static str {
        MNEMONICS
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
            .unwrap_or("???")
    }

    pub fn is_pseudo(self) -> bool {
        matches!(self, Self::VAL | Self::DB | Self::DBS | Self::LBL)
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

macro_rules! mnemonics {
    ($($op:ident),* $(,)?) => {
        const MNEMONICS: &[(&str, Opcode)] =
            &[$((stringify!($op), Opcode::$op)),*];
    };
}

mnemonics![
    NOP, LOAD, STOR, MOV, CPY, ZRO, SET, BRK, HLT, CZRO, CNZR, CEQ, CNEQ,
    CBS, CBNS, CLT, SCLT, FCLT, DCLT, CLE, SCLE, FCLE, DCLE, CGT, SCGT,
    FCGT, DCGT, CGE, SCGE, FCGE, DCGE, JMP, JMPR, SJMPR, JCH, JNCH, PUSH,
    POP, BTIN, CALL, RET, CSTU, CSTF, CSTD, CUTS, CUTF, CUTD, CFTS, CFTU,
    CFTD, CDTS, CDTU, CDTF, ADD, SADD, FADD, DADD, INC, SINC, SUB, SSUB,
    FSUB, DSUB, DEC, SDEC, MUL, SMUL, FMUL, DMUL, DIV, SDIV, FDIV, DDIV,
    MOD, SMOD, SABS, FABS, DABS, SNEG, FNEG, DNEG, SHR, SSHR, SHL, SSHL,
    RTR, RTL, AND, OR, XOR, NOT, VAL, DB, DBS, LBL,
];

/// Case-insensitive mnemonic lookup table.
pub fn name_to_op() -> HashMap<String, Opcode> {
    MNEMONICS
        .iter()
        .map(|(name, op)| (name.to_ascii_lowercase(), *op))
        .collect()
}

bitflags! {
    /// One operand's format word: which widths, signednesses and operand
    /// targets it covers. An instruction form accepts an operand iff the
    /// form's word is a superset of the operand's word.
    pub struct OperandFormat: u16 {
        const T_U8  = 1 << 0;
        const T_U16 = 1 << 1;
        const T_U32 = 1 << 2;
        const T_U64 = 1 << 3;
        const T_S8  = 1 << 4;
        const T_S16 = 1 << 5;
        const T_S32 = 1 << 6;
        const T_S64 = 1 << 7;
        const T_F32 = 1 << 8;
        const T_F64 = 1 << 9;
        const IMM   = 1 << 10;
        const REG   = 1 << 11;
        const MEM   = 1 << 12;

        const UINT = Self::T_U8.bits | Self::T_U16.bits | Self::T_U32.bits
            | Self::T_U64.bits;
        const SINT = Self::T_S8.bits | Self::T_S16.bits | Self::T_S32.bits
            | Self::T_S64.bits;
        const INT = Self::UINT.bits | Self::SINT.bits;
        const REAL = Self::T_F32.bits | Self::T_F64.bits;
        const ANY_TYPE = Self::INT.bits | Self::REAL.bits;
        const BYTE = Self::T_U8.bits | Self::T_S8.bits;

        const ANY_TARGET = Self::IMM.bits | Self::REG.bits | Self::MEM.bits;
        const ANY = Self::ANY_TARGET.bits | Self::ANY_TYPE.bits;
        const ANY_UINT = Self::ANY_TARGET.bits | Self::UINT.bits;
        const ANY_SINT = Self::ANY_TARGET.bits | Self::SINT.bits;
        const ANY_INT = Self::ANY_TARGET.bits | Self::INT.bits;
        const ANY_FLOAT = Self::ANY_TARGET.bits | Self::T_F32.bits;
        const ANY_DOUBLE = Self::ANY_TARGET.bits | Self::T_F64.bits;
        const ANY_BYTE = Self::ANY_TARGET.bits | Self::BYTE.bits;
        /// Anything that can denote a memory location
        const MEM_LOC = Self::ANY_TARGET.bits | Self::UINT.bits;
        const REG_UINT = Self::REG.bits | Self::UINT.bits;
        const REG_SINT = Self::REG.bits | Self::SINT.bits;
        const REG_INT = Self::REG.bits | Self::INT.bits;
        const REG_FLOAT = Self::REG.bits | Self::T_F32.bits;
        const REG_DOUBLE = Self::REG.bits | Self::T_F64.bits;
        const ANY_REG = Self::REG.bits | Self::ANY_TYPE.bits;
        const ANY_IMM = Self::IMM.bits | Self::ANY_TYPE.bits;
        const ANY_MEM = Self::MEM.bits | Self::ANY_TYPE.bits;
        const RW = Self::REG.bits | Self::MEM.bits;
    }
}

impl OperandFormat {
    pub fn for_operand(target: OperandFormat, ty: DataType) -> Self {
        target | ty.format_bit()
    }
}

/// One accepted form of an instruction: up to three operand words.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InstrFormat {
    pub ops: [OperandFormat; 3],
}

impl InstrFormat {
    pub fn new(ops: &[OperandFormat]) -> Self {
        let mut all = [OperandFormat::empty(); 3];
        all[..ops.len()].copy_from_slice(ops);
        Self { ops: all }
    }

    /// Does this form accept operands described by `input`? Counts must
    /// agree exactly; within a slot, the form's word must be a superset of
    /// the operand's word.
    pub fn accepts(&self, input: &InstrFormat) -> bool {
        self.ops.iter().zip(input.ops.iter()).all(|(form, input)| {
            form.is_empty() == input.is_empty() && form.contains(*input)
        })
    }

    pub fn operand_count(&self) -> usize {
        self.ops.iter().take_while(|op| !op.is_empty()).count()
    }
}

/// The full table of instruction forms. The index of a form is its
/// internal 16-bit opcode, shared between the assembler (encode) and the
/// VM (dispatch).
#[derive(Debug)]
pub struct FormatTable {
    entries: Vec<(Opcode, InstrFormat)>,
    by_opcode: HashMap<Opcode, Vec<u16>>,
}

impl FormatTable {
    pub fn new() -> Self {
        use OperandFormat as F;
        let mut table = Self {
            entries: Vec::new(),
            by_opcode: HashMap::new(),
        };

        let mut add = |op: Opcode, forms: &[&[F]]| {
            for ops in forms {
                let internal = table.entries.len() as u16;
                table.entries.push((op, InstrFormat::new(ops)));
                table.by_opcode.entry(op).or_default().push(internal);
            }
        };

        add(Opcode::NOP, &[&[]]);
        add(Opcode::LOAD, &[&[F::MEM_LOC, F::ANY_REG]]);
        add(Opcode::STOR, &[&[F::ANY_REG, F::MEM_LOC]]);
        add(Opcode::MOV, &[&[F::ANY, F::ANY_REG], &[F::ANY_REG, F::ANY_MEM]]);
        add(Opcode::CPY, &[&[F::MEM_LOC, F::MEM_LOC, F::ANY_UINT]]);
        add(Opcode::ZRO, &[&[F::MEM_LOC, F::ANY_UINT]]);
        add(Opcode::SET, &[&[F::ANY_BYTE, F::MEM_LOC, F::ANY_UINT]]);
        add(Opcode::BRK, &[&[]]);
        add(Opcode::HLT, &[&[]]);

        add(Opcode::CZRO, &[&[F::ANY]]);
        add(Opcode::CNZR, &[&[F::ANY]]);
        add(Opcode::CEQ, &[&[F::ANY, F::ANY]]);
        add(Opcode::CNEQ, &[&[F::ANY, F::ANY]]);
        add(Opcode::CBS, &[&[F::ANY, F::ANY_BYTE]]);
        add(Opcode::CBNS, &[&[F::ANY, F::ANY_BYTE]]);

        for (u, s, fo, d) in [
            (Opcode::CLT, Opcode::SCLT, Opcode::FCLT, Opcode::DCLT),
            (Opcode::CLE, Opcode::SCLE, Opcode::FCLE, Opcode::DCLE),
            (Opcode::CGT, Opcode::SCGT, Opcode::FCGT, Opcode::DCGT),
            (Opcode::CGE, Opcode::SCGE, Opcode::FCGE, Opcode::DCGE),
        ] {
            add(u, &[&[F::ANY_UINT, F::ANY_UINT]]);
            add(s, &[&[F::ANY_SINT, F::ANY_SINT]]);
            add(fo, &[&[F::ANY_FLOAT, F::ANY_FLOAT]]);
            add(d, &[&[F::ANY_DOUBLE, F::ANY_DOUBLE]]);
        }

        add(Opcode::JMP, &[&[F::MEM_LOC]]);
        add(Opcode::JMPR, &[&[F::ANY_UINT]]);
        add(Opcode::SJMPR, &[&[F::ANY_SINT]]);
        add(Opcode::JCH, &[&[F::MEM_LOC]]);
        add(Opcode::JNCH, &[&[F::MEM_LOC]]);

        add(Opcode::PUSH, &[&[F::ANY], &[F::MEM_LOC, F::ANY_UINT]]);
        add(
            Opcode::POP,
            &[
                &[F::ANY_REG],
                &[F::IMM | F::UINT],
                &[F::ANY_MEM, F::ANY_UINT],
            ],
        );
        add(Opcode::BTIN, &[&[F::ANY_UINT]]);
        add(Opcode::CALL, &[&[F::MEM_LOC]]);
        add(Opcode::RET, &[&[]]);

        // Casts: in-place on a register/memory cell, or value to cell
        for (op, from, to) in [
            (Opcode::CSTU, F::SINT, F::UINT),
            (Opcode::CSTF, F::SINT, F::T_F32),
            (Opcode::CSTD, F::SINT, F::T_F64),
            (Opcode::CUTS, F::UINT, F::SINT),
            (Opcode::CUTF, F::UINT, F::T_F32),
            (Opcode::CUTD, F::UINT, F::T_F64),
            (Opcode::CFTS, F::T_F32, F::SINT),
            (Opcode::CFTU, F::T_F32, F::UINT),
            (Opcode::CFTD, F::T_F32, F::T_F64),
            (Opcode::CDTS, F::T_F64, F::SINT),
            (Opcode::CDTU, F::T_F64, F::UINT),
            (Opcode::CDTF, F::T_F64, F::T_F32),
        ] {
            add(
                op,
                &[
                    &[F::RW | from],
                    &[F::ANY_TARGET | from, F::RW | to],
                ],
            );
        }

        // Two-operand arithmetic: dst op= src, or dst = a op b
        for (op, operand, reg) in [
            (Opcode::ADD, F::ANY_UINT, F::REG_UINT),
            (Opcode::SADD, F::ANY_SINT, F::REG_SINT),
            (Opcode::FADD, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DADD, F::ANY_DOUBLE, F::REG_DOUBLE),
            (Opcode::SUB, F::ANY_UINT, F::REG_UINT),
            (Opcode::SSUB, F::ANY_SINT, F::REG_SINT),
            (Opcode::FSUB, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DSUB, F::ANY_DOUBLE, F::REG_DOUBLE),
            (Opcode::MUL, F::ANY_UINT, F::REG_UINT),
            (Opcode::SMUL, F::ANY_SINT, F::REG_SINT),
            (Opcode::FMUL, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DMUL, F::ANY_DOUBLE, F::REG_DOUBLE),
            (Opcode::DIV, F::ANY_UINT, F::REG_UINT),
            (Opcode::SDIV, F::ANY_SINT, F::REG_SINT),
            (Opcode::FDIV, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DDIV, F::ANY_DOUBLE, F::REG_DOUBLE),
            (Opcode::MOD, F::ANY_UINT, F::REG_UINT),
            (Opcode::SMOD, F::ANY_SINT, F::REG_SINT),
        ] {
            add(op, &[&[operand, reg], &[operand, operand, reg]]);
        }

        // One-operand arithmetic: dst, or dst = op src
        for (op, operand, reg) in [
            (Opcode::INC, F::ANY_UINT, F::REG_UINT),
            (Opcode::SINC, F::ANY_SINT, F::REG_SINT),
            (Opcode::DEC, F::ANY_UINT, F::REG_UINT),
            (Opcode::SDEC, F::ANY_SINT, F::REG_SINT),
            (Opcode::SABS, F::ANY_SINT, F::REG_SINT),
            (Opcode::FABS, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DABS, F::ANY_DOUBLE, F::REG_DOUBLE),
            (Opcode::SNEG, F::ANY_SINT, F::REG_SINT),
            (Opcode::FNEG, F::ANY_FLOAT, F::REG_FLOAT),
            (Opcode::DNEG, F::ANY_DOUBLE, F::REG_DOUBLE),
        ] {
            add(op, &[&[reg], &[operand, reg]]);
        }

        // Shifts and rotations: amount is a byte
        for (op, reg) in [
            (Opcode::SHR, F::REG_UINT),
            (Opcode::SSHR, F::REG_SINT),
            (Opcode::SHL, F::REG_UINT),
            (Opcode::SSHL, F::REG_SINT),
            (Opcode::RTR, F::REG_UINT),
            (Opcode::RTL, F::REG_UINT),
        ] {
            add(
                op,
                &[
                    &[F::ANY_BYTE, reg],
                    &[F::ANY_BYTE, F::ANY_TARGET | F::INT, reg],
                ],
            );
        }

        // Bitwise logic
        for op in [Opcode::AND, Opcode::OR, Opcode::XOR] {
            add(
                op,
                &[
                    &[F::ANY_INT, F::REG_INT],
                    &[F::ANY_INT, F::ANY_INT, F::REG_INT],
                ],
            );
        }
        add(Opcode::NOT, &[&[F::REG_INT], &[F::ANY_INT, F::REG_INT]]);

        table
    }

    /// First form of `op` accepting `input`, with its internal opcode.
    pub fn select(
        &self,
        op: Opcode,
        input: &InstrFormat,
    ) -> Option<(u16, &InstrFormat)> {
        self.by_opcode.get(&op)?.iter().find_map(|&internal| {
            let (_, format) = &self.entries[internal as usize];
            if format.accepts(input) {
                Some((internal, format))
            } else {
                None
            }
        })
    }

    /// Look an internal opcode back up, for dispatch and disassembly.
    pub fn decode(&self, internal: u16) -> Option<(Opcode, &InstrFormat)> {
        self.entries
            .get(internal as usize)
            .map(|(op, format)| (*op, format))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for FormatTable {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Registers =====

pub const REG_PC: u8 = 16;
pub const REG_SF: u8 = 17;
pub const REG_SP: u8 = 18;
/// Float registers live after the specials in the register byte space.
pub const REG_FLOAT_BASE: u8 = 19;
pub const GENERAL_REGISTERS: usize = 16;
pub const FLOAT_REGISTERS: usize = 16;

/// Spell a register byte back out (`$r3`, `$pc`, `$f8`).
pub fn register_name(index: u8) -> String {
    match index {
        REG_PC => "$pc".into(),
        REG_SF => "$sf".into(),
        REG_SP => "$sp".into(),
        i if i >= REG_FLOAT_BASE => format!("$f{}", i - REG_FLOAT_BASE),
        i => format!("$r{}", i),
    }
}

// ===== The executable image header =====

pub const MAGIC: [u8; 4] = *b"NNEP";
pub const HEADER_SIZE: usize = 128;
pub const DEFAULT_CODE_START: u64 = 128;
pub const DEFAULT_INITIAL_ALLOC: u64 = 4 << 20;
pub const FORMAT_VERSION: u32 = 1;

/// The 128-byte header at the start of every `.nnep` image. All fields
/// little-endian; bytes 40..128 are reserved and zero.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ImageHeader {
    pub version: u32,
    pub code_start: u64,
    pub data_start: u64,
    pub size: u64,
    pub initial_alloc: u64,
}

impl Default for ImageHeader {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            code_start: DEFAULT_CODE_START,
            data_start: 0,
            size: 0,
            initial_alloc: DEFAULT_INITIAL_ALLOC,
        }
    }
}

impl ImageHeader {
    pub fn write_to(&self, out: &mut [u8]) {
        assert!(out.len() >= HEADER_SIZE);
        out[..HEADER_SIZE].iter_mut().for_each(|b| *b = 0);
        out[0..4].copy_from_slice(&MAGIC);
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..16].copy_from_slice(&self.code_start.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_start.to_le_bytes());
        out[24..32].copy_from_slice(&self.size.to_le_bytes());
        out[32..40].copy_from_slice(&self.initial_alloc.to_le_bytes());
    }

    /// Parse and validate a header against the actual image length.
    pub fn read_from(image: &[u8]) -> Result<Self, ImageError> {
        if image.len() < HEADER_SIZE {
            return Err(ImageError::Truncated);
        }
        if image[0..4] != MAGIC {
            return Err(ImageError::BadMagic);
        }
        let u32_at = |at: usize| {
            u32::from_le_bytes(<[u8; 4]>::try_from(&image[at..at + 4]).unwrap())
        };
        let u64_at = |at: usize| {
            u64::from_le_bytes(<[u8; 8]>::try_from(&image[at..at + 8]).unwrap())
        };
        let header = Self {
            version: u32_at(4),
            code_start: u64_at(8),
            data_start: u64_at(16),
            size: u64_at(24),
            initial_alloc: u64_at(32),
        };
        if header.size != image.len() as u64
            || header.code_start > header.data_start
            || header.data_start > header.size
        {
            return Err(ImageError::SizeMismatch);
        }
        Ok(header)
    }
}

/// Why an image was refused on load.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ImageError {
    Truncated,
    BadMagic,
    SizeMismatch,
}

impl Display for ImageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "image is shorter than its header"),
            Self::BadMagic => write!(f, "image magic is not NNEP"),
            Self::SizeMismatch => {
                write!(f, "image header is inconsistent with its length")
            }
        }
    }
}

impl std::error::Error for ImageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonic_lookup() {
        let names = name_to_op();
        assert_eq!(names.get("mov"), Some(&Opcode::MOV));
        assert_eq!(names.get("sclt"), Some(&Opcode::SCLT));
        assert_eq!(names.get("dbs"), Some(&Opcode::DBS));
        assert_eq!(names.get("nope"), None);
        assert_eq!(Opcode::SJMPR.name(), "SJMPR");
    }

    #[test]
    fn test_format_selection_first_match_wins() {
        let table = FormatTable::new();
        // MOV imm -> reg matches the first MOV form
        let input = InstrFormat::new(&[
            OperandFormat::for_operand(OperandFormat::IMM, DataType::U64),
            OperandFormat::for_operand(OperandFormat::REG, DataType::U64),
        ]);
        let (internal, _) = table.select(Opcode::MOV, &input).unwrap();
        let (opcode, _) = table.decode(internal).unwrap();
        assert_eq!(opcode, Opcode::MOV);

        // ADD with three operands selects the three-operand form
        let any_u = OperandFormat::for_operand(OperandFormat::IMM, DataType::U64);
        let reg_u = OperandFormat::for_operand(OperandFormat::REG, DataType::U64);
        let input = InstrFormat::new(&[any_u, any_u, reg_u]);
        let (internal, format) = table.select(Opcode::ADD, &input).unwrap();
        assert_eq!(format.operand_count(), 3);
        assert_eq!(table.decode(internal).unwrap().0, Opcode::ADD);
    }

    #[test]
    fn test_format_rejects_mismatches() {
        let table = FormatTable::new();
        // A float operand does not fit unsigned ADD
        let input = InstrFormat::new(&[
            OperandFormat::for_operand(OperandFormat::IMM, DataType::F32),
            OperandFormat::for_operand(OperandFormat::REG, DataType::U64),
        ]);
        assert!(table.select(Opcode::ADD, &input).is_none());
        // But fits FADD with a float register target
        let input = InstrFormat::new(&[
            OperandFormat::for_operand(OperandFormat::IMM, DataType::F32),
            OperandFormat::for_operand(OperandFormat::REG, DataType::F32),
        ]);
        assert!(table.select(Opcode::FADD, &input).is_some());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = ImageHeader {
            version: FORMAT_VERSION,
            code_start: 128,
            data_start: 256,
            size: 512,
            initial_alloc: 4 << 20,
        };
        let mut image = vec![0u8; 512];
        header.write_to(&mut image);
        assert_eq!(ImageHeader::read_from(&image).unwrap(), header);
    }

    #[test]
    fn test_header_validation() {
        let mut image = vec![0u8; 512];
        ImageHeader {
            version: 1,
            code_start: 128,
            data_start: 256,
            size: 512,
            initial_alloc: 0,
        }
        .write_to(&mut image);
        image[0] = b'X';
        assert_eq!(
            ImageHeader::read_from(&image),
            Err(ImageError::BadMagic)
        );
        image[0] = b'N';
        image[24] = 0; // size now wrong
        assert_eq!(
            ImageHeader::read_from(&image),
            Err(ImageError::SizeMismatch)
        );
        assert_eq!(
            ImageHeader::read_from(&image[..64]),
            Err(ImageError::Truncated)
        );
    }
}
