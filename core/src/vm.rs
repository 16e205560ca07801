//! The virtual machine: a register-plus-memory interpreter over the
//! encoded instruction stream. The machine owns one contiguous memory
//! region holding (in order) the image header, code, static data, the heap
//! and a downward-growing stack; every access is bounds-checked and every
//! failure is one of the numbered traps. Execution is stepwise, so callers
//! can single-step, inspect state between instructions, or just run to the
//! halt trap.

use crate::asm::{
    DataType, FormatTable, ImageError, ImageHeader, Opcode, GENERAL_REGISTERS,
    FLOAT_REGISTERS, REG_FLOAT_BASE, REG_PC, REG_SF, REG_SP,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// Status-flag bits in `$sf`.
pub mod flags {
    pub const ZERO: u64 = 1 << 0;
    pub const CHECK: u64 = 1 << 1;
}

/// The numbered VM traps. Negative traps are orderly stops.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Trap {
    Halt,
    Break,
    IllegalRead,
    IllegalWrite,
    StackOverflow,
    StackUnderflow,
    IllegalJump,
    IllegalBtin,
    IllegalInstruction,
}

impl Trap {
    /// The signal number of this trap.
    pub fn code(self) -> i64 {
        match self {
            Self::Halt => -2,
            Self::Break => -1,
            Self::IllegalRead => 1,
            Self::IllegalWrite => 2,
            Self::StackOverflow => 3,
            Self::StackUnderflow => 4,
            Self::IllegalJump => 5,
            Self::IllegalBtin => 6,
            Self::IllegalInstruction => 7,
        }
    }

    /// Orderly stops are not failures.
    pub fn is_error(self) -> bool {
        self.code() > 0
    }
}

impl Display for Trap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Halt => "halt",
            Self::Break => "break",
            Self::IllegalRead => "illegal read",
            Self::IllegalWrite => "illegal write",
            Self::StackOverflow => "stack overflow",
            Self::StackUnderflow => "stack underflow",
            Self::IllegalJump => "illegal jump",
            Self::IllegalBtin => "illegal builtin",
            Self::IllegalInstruction => "illegal instruction",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

/// A decoded operand.
#[derive(Copy, Clone, Debug)]
enum Operand {
    Imm(u64, DataType),
    Reg(u8, DataType),
    Mem(u64, DataType),
}

impl Operand {
    fn ty(self) -> DataType {
        match self {
            Self::Imm(_, ty) | Self::Reg(_, ty) | Self::Mem(_, ty) => ty,
        }
    }
}

/// Maximum stack size: half the free space or 8 MiB, whichever is less.
const MAX_STACK: u64 = 1 << 23;

#[derive(Debug)]
pub struct Machine {
    general: [u64; GENERAL_REGISTERS],
    float: [u64; FLOAT_REGISTERS],
    pc: u64,
    sf: u64,
    sp: u64,

    memory: Vec<u8>,
    code_start: u64,
    /// Everything below this is read-only (code and header)
    read_only_end: u64,
    /// First byte past the loaded image; the heap begins here
    heap_start: u64,
    stack_size: u64,

    formats: FormatTable,
    steps: u64,
    trap: Option<Trap>,
    /// Bytes written by the write builtin
    output: Vec<u8>,
}

impl Machine {
    /// Load an image, refusing anything with a bad magic or inconsistent
    /// size.
    pub fn load(image: &[u8]) -> Result<Self, ImageError> {
        let header = ImageHeader::read_from(image)?;
        let allocated = header.size + header.initial_alloc.max(1024);
        let mut memory = vec![0u8; allocated as usize];
        memory[..image.len()].copy_from_slice(image);
        let stack_size = ((allocated - header.size) / 2).min(MAX_STACK);
        Ok(Self {
            general: [0; GENERAL_REGISTERS],
            float: [0; FLOAT_REGISTERS],
            pc: header.code_start,
            sf: 0,
            sp: allocated,
            memory,
            code_start: header.code_start,
            read_only_end: header.data_start,
            heap_start: header.size,
            stack_size,
            formats: FormatTable::new(),
            steps: 0,
            trap: None,
            output: Vec::new(),
        })
    }

    // ===== Introspection =====

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn trap(&self) -> Option<Trap> {
        self.trap
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    /// All register values by name, for state dumps.
    pub fn registers(&self) -> HashMap<String, u64> {
        let mut map = HashMap::new();
        for (i, value) in self.general.iter().enumerate() {
            map.insert(format!("r{}", i), *value);
        }
        for (i, value) in self.float.iter().enumerate() {
            map.insert(format!("f{}", i), *value);
        }
        map.insert("pc".into(), self.pc);
        map.insert("sf".into(), self.sf);
        map.insert("sp".into(), self.sp);
        map
    }

    /// A human-readable memory-layout summary.
    pub fn info(&self) -> String {
        format!(
            "allocated {:#x} bytes\n read only: {:#x}\n static: {:#x}\n \
             heap: {:#x}\n stack: {:#x}\nexecuted {} instructions",
            self.memory.len(),
            self.read_only_end,
            self.heap_start - self.read_only_end,
            self.memory.len() as u64 - self.heap_start - self.stack_size,
            self.stack_size,
            self.steps,
        )
    }

    // ===== Memory =====

    fn read_bytes(&mut self, at: u64, len: usize) -> Result<u64, Trap> {
        let end = at.checked_add(len as u64).ok_or(Trap::IllegalRead)?;
        if end > self.memory.len() as u64 {
            return Err(Trap::IllegalRead);
        }
        let mut buf = [0u8; 8];
        buf[..len].copy_from_slice(&self.memory[at as usize..end as usize]);
        Ok(u64::from_le_bytes(buf))
    }

    fn write_bytes(&mut self, at: u64, len: usize, value: u64) -> Result<(), Trap> {
        let end = at.checked_add(len as u64).ok_or(Trap::IllegalWrite)?;
        if end > self.memory.len() as u64 {
            return Err(Trap::IllegalWrite);
        }
        if at < self.read_only_end {
            return Err(Trap::IllegalWrite);
        }
        let bytes = value.to_le_bytes();
        self.memory[at as usize..end as usize]
            .copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn push(&mut self, value: u64, len: usize) -> Result<(), Trap> {
        let limit = self.memory.len() as u64 - self.stack_size;
        if self.sp < len as u64 || self.sp - (len as u64) < limit {
            return Err(Trap::StackOverflow);
        }
        self.sp -= len as u64;
        let bytes = value.to_le_bytes();
        let at = self.sp as usize;
        self.memory[at..at + len].copy_from_slice(&bytes[..len]);
        Ok(())
    }

    fn pop(&mut self, len: usize) -> Result<u64, Trap> {
        if self.sp + len as u64 > self.memory.len() as u64 {
            return Err(Trap::StackUnderflow);
        }
        let mut buf = [0u8; 8];
        let at = self.sp as usize;
        buf[..len].copy_from_slice(&self.memory[at..at + len]);
        self.sp += len as u64;
        Ok(u64::from_le_bytes(buf))
    }

    // ===== Registers =====

    fn reg_read(&self, index: u8) -> u64 {
        match index {
            REG_PC => self.pc,
            REG_SF => self.sf,
            REG_SP => self.sp,
            i if i >= REG_FLOAT_BASE => {
                self.float[(i - REG_FLOAT_BASE) as usize]
            }
            i => self.general[i as usize],
        }
    }

    fn reg_write(&mut self, index: u8, value: u64) {
        match index {
            REG_PC => self.pc = value,
            REG_SF => self.sf = value,
            REG_SP => self.sp = value,
            i if i >= REG_FLOAT_BASE => {
                self.float[(i - REG_FLOAT_BASE) as usize] = value
            }
            i => self.general[i as usize] = value,
        }
    }

    // ===== Instruction decoding =====

    fn fetch(&mut self, len: usize) -> Result<u64, Trap> {
        // Instruction fields share the emitter's power-of-two alignment
        let align = len.next_power_of_two().min(8) as u64;
        self.pc = (self.pc + align - 1) & !(align - 1);
        let value = self.read_bytes(self.pc, len)?;
        self.pc += len as u64;
        Ok(value)
    }

    fn decode_operand(&mut self) -> Result<Operand, Trap> {
        let descriptor = self.fetch(1)? as u8;
        let target = descriptor & 0b11;
        let ty = DataType::from_code(descriptor >> 2)
            .ok_or(Trap::IllegalInstruction)?;
        match target {
            0 => {
                let bits = self.fetch(ty.size())?;
                Ok(Operand::Imm(bits, ty))
            }
            1 => {
                let index = self.fetch(1)? as u8;
                Ok(Operand::Reg(index, ty))
            }
            2 => {
                let header = self.fetch(1)? as u8;
                let loc_is_reg = header & 1 != 0;
                let off_type = (header >> 1) & 0b11;
                let mut addr = if loc_is_reg {
                    let index = self.fetch(1)? as u8;
                    self.reg_read(index)
                } else {
                    self.fetch(8)?
                };
                match off_type {
                    0 => {}
                    1 | 2 => {
                        let index = self.fetch(1)? as u8;
                        let offset = self.reg_read(index);
                        if off_type == 1 {
                            addr = addr.wrapping_add(offset);
                        } else {
                            addr = addr.wrapping_sub(offset);
                        }
                    }
                    _ => {
                        // Immediate offsets against register locations
                        // travel as a separate word; otherwise they were
                        // folded into the location at assembly time
                        if loc_is_reg {
                            let offset = self.fetch(8)?;
                            addr = addr.wrapping_add(offset);
                        }
                    }
                }
                Ok(Operand::Mem(addr, ty))
            }
            _ => Err(Trap::IllegalInstruction),
        }
    }

    /// Read an operand's value, sign-extending by its declared type.
    fn value(&mut self, operand: Operand) -> Result<u64, Trap> {
        let raw = match operand {
            Operand::Imm(bits, _) => bits,
            Operand::Reg(index, ty) => {
                let full = self.reg_read(index);
                mask(full, ty)
            }
            Operand::Mem(addr, ty) => self.read_bytes(addr, ty.size())?,
        };
        Ok(extend(raw, operand.ty()))
    }

    /// The address a `mem_loc` operand denotes: a memory operand's
    /// computed address, or a plain value used as one. (Jumps use
    /// [Machine::value] instead, so `JMP [table]` is an indirect jump.)
    fn location(&mut self, operand: Operand) -> Result<u64, Trap> {
        match operand {
            Operand::Mem(addr, _) => Ok(addr),
            other => self.value(other),
        }
    }

    /// Write a value through an operand. Writes to immediates discard.
    fn store(&mut self, operand: Operand, value: u64) -> Result<(), Trap> {
        match operand {
            Operand::Imm(..) => Ok(()),
            Operand::Reg(index, ty) => {
                if ty.size() == 8 {
                    self.reg_write(index, value);
                } else {
                    let keep = self.reg_read(index) & !type_mask(ty);
                    self.reg_write(index, keep | (value & type_mask(ty)));
                }
                Ok(())
            }
            Operand::Mem(addr, ty) => {
                self.write_bytes(addr, ty.size(), value)
            }
        }
    }

    // ===== Execution =====

    /// Run until a trap. Orderly traps (halt, break) are returned like
    /// any other.
    pub fn run(&mut self) -> Trap {
        loop {
            if let Err(trap) = self.step() {
                self.trap = Some(trap);
                return trap;
            }
        }
    }

    /// Run at most `limit` instructions; `None` means the limit was hit.
    pub fn run_bounded(&mut self, limit: u64) -> Option<Trap> {
        for _ in 0..limit {
            if let Err(trap) = self.step() {
                self.trap = Some(trap);
                return Some(trap);
            }
        }
        None
    }

    /// Execute one instruction.
    pub fn step(&mut self) -> Result<(), Trap> {
        if let Some(trap) = self.trap {
            return Err(trap);
        }
        // The program counter must sit inside the code region
        if self.pc < self.code_start || self.pc >= self.read_only_end {
            return Err(Trap::IllegalJump);
        }
        let internal = self.fetch(2)? as u16;
        let (opcode, format) = self
            .formats
            .decode(internal)
            .ok_or(Trap::IllegalInstruction)?;
        let count = format.operand_count();
        let mut ops = [None; 3];
        for slot in ops.iter_mut().take(count) {
            *slot = Some(self.decode_operand()?);
        }
        self.steps += 1;
        self.execute(opcode, &ops, count)
    }

    fn set_check(&mut self, check: bool) {
        if check {
            self.sf |= flags::CHECK;
        } else {
            self.sf &= !flags::CHECK;
        }
    }

    fn set_zero(&mut self, value: u64) {
        if value == 0 {
            self.sf |= flags::ZERO;
        } else {
            self.sf &= !flags::ZERO;
        }
    }

    fn jump(&mut self, target: u64) -> Result<(), Trap> {
        if target < self.code_start || target >= self.read_only_end {
            return Err(Trap::IllegalJump);
        }
        self.pc = target;
        Ok(())
    }

    fn execute(
        &mut self,
        opcode: Opcode,
        ops: &[Option<Operand>; 3],
        count: usize,
    ) -> Result<(), Trap> {
        use Opcode::*;
        let op = |i: usize| ops[i].expect("operand decoded");

        match opcode {
            NOP => {}
            HLT => return Err(Trap::Halt),
            BRK => return Err(Trap::Break),

            LOAD => {
                let addr = self.location(op(0))?;
                let ty = op(1).ty();
                let value = self.read_bytes(addr, ty.size())?;
                self.store(op(1), extend(value, ty))?;
            }
            STOR => {
                let value = self.value(op(0))?;
                let addr = self.location(op(1))?;
                self.write_bytes(addr, op(0).ty().size(), value)?;
            }
            MOV => {
                let value = self.value(op(0))?;
                self.store(op(1), value)?;
            }
            CPY => {
                let src = self.location(op(0))?;
                let dst = self.location(op(1))?;
                let len = self.value(op(2))?;
                for i in 0..len {
                    let byte = self.read_bytes(src + i, 1)?;
                    self.write_bytes(dst + i, 1, byte)?;
                }
            }
            ZRO => {
                let dst = self.location(op(0))?;
                let len = self.value(op(1))?;
                for i in 0..len {
                    self.write_bytes(dst + i, 1, 0)?;
                }
            }
            SET => {
                let byte = self.value(op(0))? & 0xFF;
                let dst = self.location(op(1))?;
                let len = self.value(op(2))?;
                for i in 0..len {
                    self.write_bytes(dst + i, 1, byte)?;
                }
            }

            CZRO => {
                let value = self.value(op(0))?;
                self.set_check(value == 0);
            }
            CNZR => {
                let value = self.value(op(0))?;
                self.set_check(value != 0);
            }
            CEQ => {
                let (a, b) = (self.value(op(0))?, self.value(op(1))?);
                self.set_check(a == b);
            }
            CNEQ => {
                let (a, b) = (self.value(op(0))?, self.value(op(1))?);
                self.set_check(a != b);
            }
            CBS => {
                let (a, bit) = (self.value(op(0))?, self.value(op(1))?);
                self.set_check(a & (1 << (bit & 63)) != 0);
            }
            CBNS => {
                let (a, bit) = (self.value(op(0))?, self.value(op(1))?);
                self.set_check(a & (1 << (bit & 63)) == 0);
            }
            CLT | CLE | CGT | CGE => {
                let (a, b) = (self.value(op(0))?, self.value(op(1))?);
                self.set_check(match opcode {
                    CLT => a < b,
                    CLE => a <= b,
                    CGT => a > b,
                    _ => a >= b,
                });
            }
            SCLT | SCLE | SCGT | SCGE => {
                let (a, b) =
                    (self.value(op(0))? as i64, self.value(op(1))? as i64);
                self.set_check(match opcode {
                    SCLT => a < b,
                    SCLE => a <= b,
                    SCGT => a > b,
                    _ => a >= b,
                });
            }
            FCLT | FCLE | FCGT | FCGE => {
                let (a, b) = (
                    f32_of(self.value(op(0))?),
                    f32_of(self.value(op(1))?),
                );
                self.set_check(match opcode {
                    FCLT => a < b,
                    FCLE => a <= b,
                    FCGT => a > b,
                    _ => a >= b,
                });
            }
            DCLT | DCLE | DCGT | DCGE => {
                let (a, b) = (
                    f64::from_bits(self.value(op(0))?),
                    f64::from_bits(self.value(op(1))?),
                );
                self.set_check(match opcode {
                    DCLT => a < b,
                    DCLE => a <= b,
                    DCGT => a > b,
                    _ => a >= b,
                });
            }

            JMP => {
                let target = self.value(op(0))?;
                self.jump(target)?;
            }
            JMPR => {
                let offset = self.value(op(0))?;
                let target = self.pc.wrapping_add(offset);
                self.jump(target)?;
            }
            SJMPR => {
                let offset = self.value(op(0))? as i64;
                let target = self.pc.wrapping_add(offset as u64);
                self.jump(target)?;
            }
            JCH => {
                let target = self.value(op(0))?;
                if self.sf & flags::CHECK != 0 {
                    self.jump(target)?;
                }
            }
            JNCH => {
                let target = self.value(op(0))?;
                if self.sf & flags::CHECK == 0 {
                    self.jump(target)?;
                }
            }

            PUSH => {
                if count == 1 {
                    let value = self.value(op(0))?;
                    self.push(value, op(0).ty().size())?;
                } else {
                    // Push a memory range
                    let addr = self.location(op(0))?;
                    let len = self.value(op(1))?;
                    for i in (0..len).rev() {
                        let byte = self.read_bytes(addr + i, 1)?;
                        self.push(byte, 1)?;
                    }
                }
            }
            POP => match op(0) {
                Operand::Imm(..) => {
                    // Discard n bytes
                    let n = self.value(op(0))?;
                    if self.sp + n > self.memory.len() as u64 {
                        return Err(Trap::StackUnderflow);
                    }
                    self.sp += n;
                }
                operand => {
                    let value = self.pop(operand.ty().size())?;
                    self.store(operand, value)?;
                }
            },
            BTIN => {
                let builtin = self.value(op(0))?;
                self.builtin(builtin)?;
            }
            CALL => {
                let target = self.value(op(0))?;
                self.push(self.pc, 8)?;
                self.jump(target)?;
            }
            RET => {
                let target = self.pop(8)?;
                self.jump(target)?;
            }

            // Casts. One operand converts in place; two convert into the
            // second.
            CSTU | CUTS => self.cast(ops, count, |bits| bits)?,
            CSTF => self.cast(ops, count, |bits| {
                u64::from(((bits as i64) as f32).to_bits())
            })?,
            CSTD => self.cast(ops, count, |bits| {
                ((bits as i64) as f64).to_bits()
            })?,
            CUTF => self
                .cast(ops, count, |bits| u64::from((bits as f32).to_bits()))?,
            CUTD => self.cast(ops, count, |bits| (bits as f64).to_bits())?,
            CFTS => self.cast(ops, count, |bits| {
                (f32_of(bits) as i64) as u64
            })?,
            CFTU => self.cast(ops, count, |bits| f32_of(bits) as u64)?,
            CFTD => self.cast(ops, count, |bits| {
                f64::from(f32_of(bits)).to_bits()
            })?,
            CDTS => self.cast(ops, count, |bits| {
                (f64::from_bits(bits) as i64) as u64
            })?,
            CDTU => {
                self.cast(ops, count, |bits| f64::from_bits(bits) as u64)?
            }
            CDTF => self.cast(ops, count, |bits| {
                u64::from((f64::from_bits(bits) as f32).to_bits())
            })?,

            ADD | SADD => self.arith(ops, count, u64::wrapping_add)?,
            SUB | SSUB => self.arith(ops, count, u64::wrapping_sub)?,
            MUL | SMUL => self.arith(ops, count, u64::wrapping_mul)?,
            DIV => self.arith(ops, count, |a, b| {
                if b == 0 { 0 } else { a / b }
            })?,
            SDIV => self.arith(ops, count, |a, b| {
                let (a, b) = (a as i64, b as i64);
                if b == 0 { 0 } else { a.wrapping_div(b) as u64 }
            })?,
            MOD => self.arith(ops, count, |a, b| {
                if b == 0 { 0 } else { a % b }
            })?,
            SMOD => self.arith(ops, count, |a, b| {
                let (a, b) = (a as i64, b as i64);
                if b == 0 { 0 } else { a.wrapping_rem(b) as u64 }
            })?,
            FADD => self.arith_f32(ops, count, |a, b| a + b)?,
            FSUB => self.arith_f32(ops, count, |a, b| a - b)?,
            FMUL => self.arith_f32(ops, count, |a, b| a * b)?,
            FDIV => self.arith_f32(ops, count, |a, b| a / b)?,
            DADD => self.arith_f64(ops, count, |a, b| a + b)?,
            DSUB => self.arith_f64(ops, count, |a, b| a - b)?,
            DMUL => self.arith_f64(ops, count, |a, b| a * b)?,
            DDIV => self.arith_f64(ops, count, |a, b| a / b)?,

            INC | SINC => self.unary_arith(ops, count, |v| {
                v.wrapping_add(1)
            })?,
            DEC | SDEC => self.unary_arith(ops, count, |v| {
                v.wrapping_sub(1)
            })?,
            SABS => self.unary_arith(ops, count, |v| {
                (v as i64).wrapping_abs() as u64
            })?,
            SNEG => self.unary_arith(ops, count, |v| {
                (v as i64).wrapping_neg() as u64
            })?,
            FABS => self.unary_arith(ops, count, |v| {
                u64::from(f32_of(v).abs().to_bits())
            })?,
            FNEG => self.unary_arith(ops, count, |v| {
                u64::from((-f32_of(v)).to_bits())
            })?,
            DABS => self.unary_arith(ops, count, |v| {
                f64::from_bits(v).abs().to_bits()
            })?,
            DNEG => self.unary_arith(ops, count, |v| {
                (-f64::from_bits(v)).to_bits()
            })?,

            SHR | SSHR | SHL | SSHL | RTR | RTL => {
                // (amount, dst) or (amount, src, dst); either way the
                // shifted value comes from the second operand
                let amount = (self.value(op(0))? & 63) as u32;
                let value = self.value(op(1))?;
                let result = match opcode {
                    SHR => value >> amount,
                    SSHR => ((value as i64) >> amount) as u64,
                    SHL | SSHL => value << amount,
                    RTR => value.rotate_right(amount),
                    _ => value.rotate_left(amount),
                };
                let dst = if count == 3 { op(2) } else { op(1) };
                self.set_zero(result);
                self.store(dst, result)?;
            }

            AND => self.arith(ops, count, |a, b| a & b)?,
            OR => self.arith(ops, count, |a, b| a | b)?,
            XOR => self.arith(ops, count, |a, b| a ^ b)?,
            NOT => self.unary_arith(ops, count, |v| !v)?,

            VAL | DB | DBS | LBL => return Err(Trap::IllegalInstruction),
        }
        Ok(())
    }

    /// Two-operand arithmetic: `dst op= src` or `dst = a op b`.
    fn arith(
        &mut self,
        ops: &[Option<Operand>; 3],
        count: usize,
        f: impl Fn(u64, u64) -> u64,
    ) -> Result<(), Trap> {
        let op = |i: usize| ops[i].expect("operand decoded");
        let result = if count == 3 {
            let (a, b) = (self.value(op(0))?, self.value(op(1))?);
            f(a, b)
        } else {
            let (a, dst) = (self.value(op(0))?, self.value(op(1))?);
            f(dst, a)
        };
        let dst = op(count - 1);
        self.set_zero(mask(result, dst.ty()));
        self.store(dst, result)
    }

    fn arith_f32(
        &mut self,
        ops: &[Option<Operand>; 3],
        count: usize,
        f: impl Fn(f32, f32) -> f32,
    ) -> Result<(), Trap> {
        self.arith(ops, count, |a, b| {
            u64::from(f(f32_of(a), f32_of(b)).to_bits())
        })
    }

    fn arith_f64(
        &mut self,
        ops: &[Option<Operand>; 3],
        count: usize,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<(), Trap> {
        self.arith(ops, count, |a, b| {
            f(f64::from_bits(a), f64::from_bits(b)).to_bits()
        })
    }

    /// One-operand arithmetic: `dst = op dst` or `dst = op src`.
    fn unary_arith(
        &mut self,
        ops: &[Option<Operand>; 3],
        count: usize,
        f: impl Fn(u64) -> u64,
    ) -> Result<(), Trap> {
        let op = |i: usize| ops[i].expect("operand decoded");
        let value = self.value(op(0))?;
        let result = f(value);
        let dst = op(count - 1);
        self.set_zero(mask(result, dst.ty()));
        self.store(dst, result)
    }

    fn cast(
        &mut self,
        ops: &[Option<Operand>; 3],
        count: usize,
        f: impl Fn(u64) -> u64,
    ) -> Result<(), Trap> {
        let op = |i: usize| ops[i].expect("operand decoded");
        let value = self.value(op(0))?;
        let result = f(value);
        let dst = op(count - 1);
        self.store(dst, result)
    }

    /// Builtins: 0 writes the buffer at `$r0` (length `$r1`) to the
    /// output, 1 reads nothing (reserved); anything else traps.
    fn builtin(&mut self, index: u64) -> Result<(), Trap> {
        match index {
            0 => {
                let addr = self.general[0];
                let len = self.general[1];
                for i in 0..len {
                    let byte = self.read_bytes(addr + i, 1)? as u8;
                    self.output.push(byte);
                }
                Ok(())
            }
            1 => {
                // Input is not wired up in the library; reads yield zero
                self.general[0] = 0;
                Ok(())
            }
            _ => Err(Trap::IllegalBtin),
        }
    }
}

fn type_mask(ty: DataType) -> u64 {
    match ty.size() {
        1 => 0xFF,
        2 => 0xFFFF,
        4 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

fn mask(value: u64, ty: DataType) -> u64 {
    value & type_mask(ty)
}

/// Sign-extend a masked value according to its type.
fn extend(value: u64, ty: DataType) -> u64 {
    if !ty.is_signed() {
        return value;
    }
    match ty.size() {
        1 => (value as u8 as i8) as i64 as u64,
        2 => (value as u16 as i16) as i64 as u64,
        4 => (value as u32 as i32) as i64 as u64,
        _ => value,
    }
}

fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble::assemble;

    fn run_src(src: &str) -> Machine {
        let image = assemble(src, "test.nnasm").expect("assembly failed");
        let mut machine = Machine::load(&image).expect("load failed");
        let trap = machine.run();
        assert_eq!(trap, Trap::Halt, "program did not halt cleanly");
        machine
    }

    #[test]
    fn test_refuses_bad_images() {
        assert!(Machine::load(b"not an image").is_err());
        let image = assemble("HLT", "t").unwrap();
        let mut bad = image.clone();
        bad[0] = b'M';
        assert!(Machine::load(&bad).is_err());
        assert!(Machine::load(&image).is_ok());
    }

    #[test]
    fn test_mov_and_arith() {
        let machine = run_src(
            "MOV 10 $r0 MOV 4 $r1 ADD $r1 $r0 SUB 2 $r0 MUL 3 $r0 HLT",
        );
        // ((10 + 4) - 2) * 3
        assert_eq!(machine.registers()["r0"], 36);
    }

    #[test]
    fn test_signed_arithmetic() {
        let machine =
            run_src("MOV -6s $r0_s SDIV 2s $r0_s SABS $r0_s HLT");
        assert_eq!(machine.registers()["r0"], 3);
    }

    #[test]
    fn test_float_arithmetic() {
        let machine = run_src("MOV 1.5 $f0 DADD 2.25 $f0 HLT");
        assert_eq!(f64::from_bits(machine.registers()["f0"]), 3.75);
    }

    #[test]
    fn test_compare_and_branch() {
        // Count down from 5, counting iterations in r1
        let machine = run_src(
            "MOV 5 $r0
             LBL top
             CZRO $r0
             JCH done
             DEC $r0
             INC $r1
             JMP top
             LBL done
             HLT",
        );
        assert_eq!(machine.registers()["r0"], 0);
        assert_eq!(machine.registers()["r1"], 5);
    }

    #[test]
    fn test_forward_label_and_halt_trap() {
        let mut machine = {
            let image =
                assemble("JMP over MOV 99 $r0 LBL over HLT", "t").unwrap();
            Machine::load(&image).unwrap()
        };
        let trap = machine.run();
        assert_eq!(trap, Trap::Halt);
        assert_eq!(trap.code(), -2);
        // The MOV was jumped over
        assert_eq!(machine.registers()["r0"], 0);
    }

    #[test]
    fn test_stack_and_call() {
        let machine = run_src(
            "MOV 7 $r0
             PUSH $r0
             MOV 0 $r0
             POP $r1
             CALL fn
             HLT
             LBL fn
             MOV 42 $r2
             RET",
        );
        assert_eq!(machine.registers()["r1"], 7);
        assert_eq!(machine.registers()["r2"], 42);
    }

    #[test]
    fn test_memory_load_store() {
        let machine = run_src(
            "DB cell 0_64
             MOV 123 $r0
             STOR $r0 [cell]
             LOAD [cell] $r1
             HLT",
        );
        assert_eq!(machine.registers()["r1"], 123);
    }

    #[test]
    fn test_builtin_output() {
        let machine = run_src(
            "DBS msg \"hi\"
             MOV msg $r0
             MOV ~msg $r1
             BTIN 0
             HLT",
        );
        assert_eq!(machine.output(), b"hi");
    }

    #[test]
    fn test_traps() {
        let image = assemble("LOAD [0xFFFFFFFF] $r0 HLT", "t").unwrap();
        let mut machine = Machine::load(&image).unwrap();
        assert_eq!(machine.run(), Trap::IllegalRead);

        let image = assemble("JMP 0 HLT", "t").unwrap();
        let mut machine = Machine::load(&image).unwrap();
        assert_eq!(machine.run(), Trap::IllegalJump);

        let image = assemble("POP $r0 HLT", "t").unwrap();
        let mut machine = Machine::load(&image).unwrap();
        assert_eq!(machine.run(), Trap::StackUnderflow);

        let image = assemble("BTIN 9 HLT", "t").unwrap();
        let mut machine = Machine::load(&image).unwrap();
        assert_eq!(machine.run(), Trap::IllegalBtin);
    }

    #[test]
    fn test_determinism() {
        let src = "MOV 3 $r0
                   LBL top
                   MUL 7 $r0
                   DEC $r1
                   CNZR $r1
                   JCH top
                   HLT";
        let image = assemble(src, "t").unwrap();
        let mut first = Machine::load(&image).unwrap();
        let mut second = Machine::load(&image).unwrap();
        assert_eq!(first.run(), second.run());
        assert_eq!(first.registers(), second.registers());
        assert_eq!(first.steps(), second.steps());
    }
}
