use core::fmt;

use thiserror::Error;

/// Opcodes of the register machine.
///
/// Code is a stream of 16-bit units. The first unit of every instruction
/// carries the opcode in its low byte and either one 8-bit operand (`AA`)
/// or two 4-bit operands (`B|A`) in its high byte. Trailing units hold
/// 16-bit indices and literals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Format `10x`.
    Nop = 0x00,
    /// `move vA, vB`. Format `12x`.
    Move = 0x01,
    /// `move-result vAA`. Format `11x`.
    MoveResult = 0x0a,
    /// `move-exception vAA`. Format `11x`.
    MoveException = 0x0d,
    /// Format `10x`.
    ReturnVoid = 0x0e,
    /// `return vAA`. Format `11x`.
    Return = 0x0f,
    /// `const vAA, #+BBBBBBBB`. Format `31i`.
    Const = 0x14,
    /// `array-length vA, vB`. Format `12x`.
    ArrayLength = 0x21,
    /// `new-array vA, vB, class@CCCC`. Format `22c`.
    NewArray = 0x23,
    /// `throw-new kind@AA`. Format `11x`.
    ThrowNew = 0x27,
    /// `goto +AA`. Format `10t`.
    Goto = 0x28,
    /// `if-eqz vAA, +BBBB`. Format `21t`.
    IfEqz = 0x38,
    /// `aget vAA, vBB, vCC`. Format `23x`.
    AGet = 0x44,
    /// `aput vAA, vBB, vCC`. Format `23x`.
    APut = 0x4b,
    /// `invoke-static/range {vCCCC .. vNNNN}, method@BBBB`. Format `3rc`.
    InvokeStaticRange = 0x77,
    /// `add-int vAA, vBB, vCC`. Format `23x`.
    AddInt = 0x90,
}

impl Op {
    pub const COUNT: usize = 256;

    pub fn from_u8(byte: u8) -> Option<Self> {
        let op = match byte {
            0x00 => Op::Nop,
            0x01 => Op::Move,
            0x0a => Op::MoveResult,
            0x0d => Op::MoveException,
            0x0e => Op::ReturnVoid,
            0x0f => Op::Return,
            0x14 => Op::Const,
            0x21 => Op::ArrayLength,
            0x23 => Op::NewArray,
            0x27 => Op::ThrowNew,
            0x28 => Op::Goto,
            0x38 => Op::IfEqz,
            0x44 => Op::AGet,
            0x4b => Op::APut,
            0x77 => Op::InvokeStaticRange,
            0x90 => Op::AddInt,
            _ => return None,
        };
        Some(op)
    }

    /// Width of the instruction in code units.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            Op::Nop
            | Op::Move
            | Op::MoveResult
            | Op::MoveException
            | Op::ReturnVoid
            | Op::Return
            | Op::ArrayLength
            | Op::ThrowNew
            | Op::Goto => 1,
            Op::NewArray | Op::IfEqz | Op::AGet | Op::APut | Op::AddInt => 2,
            Op::Const | Op::InvokeStaticRange => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::Move => "move",
            Op::MoveResult => "move-result",
            Op::MoveException => "move-exception",
            Op::ReturnVoid => "return-void",
            Op::Return => "return",
            Op::Const => "const",
            Op::ArrayLength => "array-length",
            Op::NewArray => "new-array",
            Op::ThrowNew => "throw-new",
            Op::Goto => "goto",
            Op::IfEqz => "if-eqz",
            Op::AGet => "aget",
            Op::APut => "aput",
            Op::InvokeStaticRange => "invoke-static/range",
            Op::AddInt => "add-int",
        }
    }
}

/// A decoded instruction. Register operands keep the width they were
/// encoded with; branch offsets are in code units relative to the branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Move { dst: u8, src: u8 },
    MoveResult { dst: u8 },
    MoveException { dst: u8 },
    ReturnVoid,
    Return { src: u8 },
    Const { dst: u8, value: i32 },
    ArrayLength { dst: u8, array: u8 },
    NewArray { dst: u8, length: u8, class_idx: u16 },
    ThrowNew { kind: u8 },
    Goto { offset: i8 },
    IfEqz { src: u8, offset: i16 },
    AGet { dst: u8, array: u8, index: u8 },
    APut { src: u8, array: u8, index: u8 },
    InvokeStaticRange { count: u8, method_idx: u16, first: u16 },
    AddInt { dst: u8, lhs: u8, rhs: u8 },
}

impl Instruction {
    pub fn op(&self) -> Op {
        match self {
            Instruction::Nop => Op::Nop,
            Instruction::Move { .. } => Op::Move,
            Instruction::MoveResult { .. } => Op::MoveResult,
            Instruction::MoveException { .. } => Op::MoveException,
            Instruction::ReturnVoid => Op::ReturnVoid,
            Instruction::Return { .. } => Op::Return,
            Instruction::Const { .. } => Op::Const,
            Instruction::ArrayLength { .. } => Op::ArrayLength,
            Instruction::NewArray { .. } => Op::NewArray,
            Instruction::ThrowNew { .. } => Op::ThrowNew,
            Instruction::Goto { .. } => Op::Goto,
            Instruction::IfEqz { .. } => Op::IfEqz,
            Instruction::AGet { .. } => Op::AGet,
            Instruction::APut { .. } => Op::APut,
            Instruction::InvokeStaticRange { .. } => Op::InvokeStaticRange,
            Instruction::AddInt { .. } => Op::AddInt,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.op().width()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op().name();
        match *self {
            Instruction::Nop | Instruction::ReturnVoid => write!(f, "{name}"),
            Instruction::Move { dst, src } => write!(f, "{name} v{dst}, v{src}"),
            Instruction::MoveResult { dst } | Instruction::MoveException { dst } => {
                write!(f, "{name} v{dst}")
            }
            Instruction::Return { src } => write!(f, "{name} v{src}"),
            Instruction::Const { dst, value } => {
                write!(f, "{name} v{dst}, #{value}")
            }
            Instruction::ArrayLength { dst, array } => {
                write!(f, "{name} v{dst}, v{array}")
            }
            Instruction::NewArray {
                dst,
                length,
                class_idx,
            } => write!(f, "{name} v{dst}, v{length}, class@{class_idx:#06x}"),
            Instruction::ThrowNew { kind } => write!(f, "{name} kind@{kind}"),
            Instruction::Goto { offset } => write!(f, "{name} {offset:+}"),
            Instruction::IfEqz { src, offset } => {
                write!(f, "{name} v{src}, {offset:+}")
            }
            Instruction::AGet { dst, array, index } => {
                write!(f, "{name} v{dst}, v{array}, v{index}")
            }
            Instruction::APut { src, array, index } => {
                write!(f, "{name} v{src}, v{array}, v{index}")
            }
            Instruction::InvokeStaticRange {
                count,
                method_idx,
                first,
            } => {
                if count == 0 {
                    write!(f, "{name} {{}}, method@{method_idx:#06x}")
                } else {
                    let last = first as usize + count as usize - 1;
                    write!(
                        f,
                        "{name} {{v{first} .. v{last}}}, method@{method_idx:#06x}"
                    )
                }
            }
            Instruction::AddInt { dst, lhs, rhs } => {
                write!(f, "{name} v{dst}, v{lhs}, v{rhs}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {op:#04x} at pc {pc}")]
    UnknownOpcode { op: u8, pc: usize },
    #[error("instruction at pc {pc} runs past the end of the code")]
    Truncated { pc: usize },
}

/// Decode the instruction starting at `pc`.
pub fn decode_at(code: &[u16], pc: usize) -> Result<Instruction, DecodeError> {
    let unit = *code.get(pc).ok_or(DecodeError::Truncated { pc })?;
    let op_byte = (unit & 0xff) as u8;
    let op = Op::from_u8(op_byte).ok_or(DecodeError::UnknownOpcode {
        op: op_byte,
        pc,
    })?;
    if pc + op.width() > code.len() {
        return Err(DecodeError::Truncated { pc });
    }

    let aa = (unit >> 8) as u8;
    let a = aa & 0x0f;
    let b = aa >> 4;
    let unit_at = |n: usize| code[pc + n];

    let instr = match op {
        Op::Nop => Instruction::Nop,
        Op::Move => Instruction::Move { dst: a, src: b },
        Op::MoveResult => Instruction::MoveResult { dst: aa },
        Op::MoveException => Instruction::MoveException { dst: aa },
        Op::ReturnVoid => Instruction::ReturnVoid,
        Op::Return => Instruction::Return { src: aa },
        Op::Const => {
            let value = unit_at(1) as u32 | (unit_at(2) as u32) << 16;
            Instruction::Const {
                dst: aa,
                value: value as i32,
            }
        }
        Op::ArrayLength => Instruction::ArrayLength { dst: a, array: b },
        Op::NewArray => Instruction::NewArray {
            dst: a,
            length: b,
            class_idx: unit_at(1),
        },
        Op::ThrowNew => Instruction::ThrowNew { kind: aa },
        Op::Goto => Instruction::Goto { offset: aa as i8 },
        Op::IfEqz => Instruction::IfEqz {
            src: aa,
            offset: unit_at(1) as i16,
        },
        Op::AGet | Op::APut | Op::AddInt => {
            let bb = (unit_at(1) & 0xff) as u8;
            let cc = (unit_at(1) >> 8) as u8;
            match op {
                Op::AGet => Instruction::AGet {
                    dst: aa,
                    array: bb,
                    index: cc,
                },
                Op::APut => Instruction::APut {
                    src: aa,
                    array: bb,
                    index: cc,
                },
                _ => Instruction::AddInt {
                    dst: aa,
                    lhs: bb,
                    rhs: cc,
                },
            }
        }
        Op::InvokeStaticRange => Instruction::InvokeStaticRange {
            count: aa,
            method_idx: unit_at(1),
            first: unit_at(2),
        },
    };

    Ok(instr)
}

/// A forward branch whose offset has not been resolved yet.
///
/// Created by [`CodeBuilder::goto`] and [`CodeBuilder::if_eqz`], resolved
/// with [`CodeBuilder::bind`].
#[derive(Debug)]
pub struct Label {
    /// Address of the branch instruction; offsets are relative to it.
    at: usize,
    op: Op,
}

/// Builds a code unit sequence.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    units: Vec<u16>,
}

impl CodeBuilder {
    pub fn new() -> Self {
        Self { units: Vec::new() }
    }

    /// Current address in code units.
    pub fn current_offset(&self) -> usize {
        self.units.len()
    }

    pub fn into_units(self) -> Vec<u16> {
        self.units
    }

    pub fn as_units(&self) -> &[u16] {
        &self.units
    }

    fn emit_aa(&mut self, op: Op, aa: u8) {
        self.units.push(op as u16 | (aa as u16) << 8);
    }

    fn emit_ba(&mut self, op: Op, a: u8, b: u8) {
        debug_assert!(a < 16 && b < 16, "nibble register out of range");
        self.emit_aa(op, (b << 4) | (a & 0x0f));
    }

    fn emit_23x(&mut self, op: Op, aa: u8, bb: u8, cc: u8) {
        self.emit_aa(op, aa);
        self.units.push(bb as u16 | (cc as u16) << 8);
    }

    pub fn nop(&mut self) {
        self.emit_aa(Op::Nop, 0);
    }

    pub fn mov(&mut self, dst: u8, src: u8) {
        self.emit_ba(Op::Move, dst, src);
    }

    pub fn move_result(&mut self, dst: u8) {
        self.emit_aa(Op::MoveResult, dst);
    }

    pub fn move_exception(&mut self, dst: u8) {
        self.emit_aa(Op::MoveException, dst);
    }

    pub fn return_void(&mut self) {
        self.emit_aa(Op::ReturnVoid, 0);
    }

    pub fn return_(&mut self, src: u8) {
        self.emit_aa(Op::Return, src);
    }

    pub fn const_(&mut self, dst: u8, value: i32) {
        self.emit_aa(Op::Const, dst);
        let raw = value as u32;
        self.units.push(raw as u16);
        self.units.push((raw >> 16) as u16);
    }

    pub fn array_length(&mut self, dst: u8, array: u8) {
        self.emit_ba(Op::ArrayLength, dst, array);
    }

    pub fn new_array(&mut self, dst: u8, length: u8, class_idx: u16) {
        self.emit_ba(Op::NewArray, dst, length);
        self.units.push(class_idx);
    }

    pub fn throw_new(&mut self, kind: u8) {
        self.emit_aa(Op::ThrowNew, kind);
    }

    pub fn aget(&mut self, dst: u8, array: u8, index: u8) {
        self.emit_23x(Op::AGet, dst, array, index);
    }

    pub fn aput(&mut self, src: u8, array: u8, index: u8) {
        self.emit_23x(Op::APut, src, array, index);
    }

    pub fn add_int(&mut self, dst: u8, lhs: u8, rhs: u8) {
        self.emit_23x(Op::AddInt, dst, lhs, rhs);
    }

    pub fn invoke_static_range(&mut self, method_idx: u16, first: u16, count: u8) {
        self.emit_aa(Op::InvokeStaticRange, count);
        self.units.push(method_idx);
        self.units.push(first);
    }

    /// Unconditional forward branch, resolved by [`bind`](Self::bind).
    pub fn goto(&mut self) -> Label {
        let at = self.current_offset();
        self.emit_aa(Op::Goto, 0);
        Label { at, op: Op::Goto }
    }

    /// Branch taken when `src` is zero, resolved by [`bind`](Self::bind).
    pub fn if_eqz(&mut self, src: u8) -> Label {
        let at = self.current_offset();
        self.emit_aa(Op::IfEqz, src);
        self.units.push(0);
        Label { at, op: Op::IfEqz }
    }

    /// Backward `goto` to an already emitted address.
    ///
    /// # Panics
    ///
    /// If `target` is more than 128 code units behind the current address;
    /// `goto` only carries an 8-bit offset.
    pub fn goto_back(&mut self, target: usize) {
        let offset = target as isize - self.current_offset() as isize;
        let offset = i8::try_from(offset).expect("goto offset fits in i8");
        self.emit_aa(Op::Goto, offset as u8);
    }

    /// Point `label` at the current address.
    ///
    /// # Panics
    ///
    /// If the distance does not fit the branch's offset field: 8 bits for
    /// `goto`, 16 bits for `if-eqz`.
    pub fn bind(&mut self, label: Label) {
        let offset = self.current_offset() as isize - label.at as isize;
        match label.op {
            Op::Goto => {
                let offset = i8::try_from(offset).expect("goto offset fits in i8");
                self.units[label.at] = Op::Goto as u16 | (offset as u8 as u16) << 8;
            }
            _ => {
                let offset =
                    i16::try_from(offset).expect("branch offset fits in i16");
                self.units[label.at + 1] = offset as u16;
            }
        }
    }
}
