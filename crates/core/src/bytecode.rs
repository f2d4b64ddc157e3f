//! Instruction encoding.
//!
//! One instruction is a 32-bit word: opcode byte plus three operand bytes
//! `A`, `B`, `C`. Some shapes read `B` and `C` together as a 16-bit field
//! (`bc`), or all three operand bytes as a 24-bit field (`abc`); both wide
//! fields are sign-extended where the shape calls for an offset or
//! immediate. Wide literals (`i32`, `i64`, `f64`) occupy one or two extra
//! words after the instruction.
//!
//! Decoding an unknown opcode byte is a typed failure, not UB: `Opcode`
//! derives `TryFromPrimitive` and the interpreter surfaces the error as a
//! runtime fault.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// `A` — store nil into slot A.
    Nil = 0,
    /// `A` — store false.
    False,
    /// `A` — store true.
    True,
    /// `A, bc` — signed 16-bit integer immediate.
    Imm16,
    /// `A` + 1 word — signed 32-bit integer immediate.
    Imm32,
    /// `A` + 2 words — 64-bit integer immediate.
    Imm64,
    /// `A` + 2 words — IEEE-754 double immediate.
    ImmF64,
    /// `A, bc` — copy literal `bc` into slot A.
    Const,
    /// `A, B` — copy slot B into slot A.
    Move,
    /// `A, B` — exchange slots.
    Swap,
    /// `A, B, C` — read slot C of environment B (0 = own frame env,
    /// N = Nth captured env) into slot A.
    GetUpval,
    /// `A, B, C` — write slot A into slot C of environment B.
    SetUpval,
    /// `abc` — unconditional relative jump.
    Jump,
    /// `A, bc` — jump when slot A is truthy.
    JumpIf,
    /// `A, B, C` — arithmetic with integer/real promotion.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    /// `A, B, C` — integer-only bitwise operations.
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    AShr,
    /// `A, B, C` — comparisons writing a boolean into A.
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    /// `A, bc` — fault unless slot A's tag is within the mask.
    TypeCheck,
    /// `A` — stage slot A as a call argument.
    Push1,
    /// `A, B` — stage two arguments.
    Push2,
    /// `A, B, C` — stage three arguments.
    Push3,
    /// `A` — stage every element of the array or tuple in slot A.
    PushArray,
    /// `A, B, C` — call the callable in slot B with the staged arguments,
    /// result into slot A; C is the caller slot holding an error handler
    /// (0xFF = none).
    Call,
    /// `A` — tail-call the callable in slot A, rewriting the current frame.
    TailCall,
    /// `A, bc` — build a closure over funcdef literal `bc` into slot A.
    Closure,
    /// `A` — return slot A from the current frame.
    Return,
    /// return nil.
    ReturnNil,
    /// `A, B, C` — transfer to the strand in slot B, passing slot C; the
    /// value arriving when this strand is next resumed lands in slot A.
    Transfer,
    /// `A, bc` — invoke entry `bc` of the syscall table with the staged
    /// arguments, result into slot A.
    Syscall,
}

/// No-handler marker for `Call`'s third operand.
pub const CALL_NO_HANDLER: u8 = 0xFF;

// Field accessors.

#[inline]
pub fn op(word: u32) -> u8 {
    (word & 0xFF) as u8
}

#[inline]
pub fn a(word: u32) -> u8 {
    ((word >> 8) & 0xFF) as u8
}

#[inline]
pub fn b(word: u32) -> u8 {
    ((word >> 16) & 0xFF) as u8
}

#[inline]
pub fn c(word: u32) -> u8 {
    ((word >> 24) & 0xFF) as u8
}

#[inline]
pub fn bc(word: u32) -> u16 {
    (word >> 16) as u16
}

#[inline]
pub fn bc_signed(word: u32) -> i16 {
    (word >> 16) as u16 as i16
}

#[inline]
pub fn abc_signed(word: u32) -> i32 {
    (word as i32) >> 8
}

// Encoders, used by the compiler and by tests that assemble by hand.

#[inline]
pub fn enc(opcode: Opcode, a: u8, b: u8, c: u8) -> u32 {
    u8::from(opcode) as u32 | (a as u32) << 8 | (b as u32) << 16 | (c as u32) << 24
}

#[inline]
pub fn enc_bc(opcode: Opcode, a: u8, bc: u16) -> u32 {
    u8::from(opcode) as u32 | (a as u32) << 8 | (bc as u32) << 16
}

#[inline]
pub fn enc_abc(opcode: Opcode, abc: i32) -> u32 {
    u8::from(opcode) as u32 | ((abc as u32) << 8)
}

/// Render one def's bytecode as an assembly-style listing.
pub fn disasm(bytecode: &[u32]) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let mut pc = 0usize;
    while pc < bytecode.len() {
        let word = bytecode[pc];
        let _ = write!(out, "{:04} ", pc);
        match Opcode::try_from(op(word)) {
            Err(_) => {
                let _ = writeln!(out, "??? {:#010x}", word);
                pc += 1;
            }
            Ok(opcode) => {
                match opcode {
                    Opcode::Imm32 => {
                        let imm = bytecode.get(pc + 1).copied().unwrap_or(0) as i32;
                        let _ = writeln!(out, "{:?} r{} <- {}", opcode, a(word), imm);
                        pc += 2;
                    }
                    Opcode::Imm64 | Opcode::ImmF64 => {
                        let lo = bytecode.get(pc + 1).copied().unwrap_or(0) as u64;
                        let hi = bytecode.get(pc + 2).copied().unwrap_or(0) as u64;
                        let bits = lo | (hi << 32);
                        if opcode == Opcode::Imm64 {
                            let _ = writeln!(out, "{:?} r{} <- {}", opcode, a(word), bits as i64);
                        } else {
                            let _ = writeln!(
                                out,
                                "{:?} r{} <- {}",
                                opcode,
                                a(word),
                                f64::from_bits(bits)
                            );
                        }
                        pc += 3;
                    }
                    Opcode::Jump => {
                        let _ = writeln!(out, "{:?} {:+}", opcode, abc_signed(word));
                        pc += 1;
                    }
                    Opcode::JumpIf => {
                        let _ =
                            writeln!(out, "{:?} r{} {:+}", opcode, a(word), bc_signed(word));
                        pc += 1;
                    }
                    Opcode::Imm16 | Opcode::Const | Opcode::Closure | Opcode::Syscall
                    | Opcode::TypeCheck => {
                        let _ = writeln!(out, "{:?} r{} {}", opcode, a(word), bc(word));
                        pc += 1;
                    }
                    _ => {
                        let _ = writeln!(
                            out,
                            "{:?} r{} r{} r{}",
                            opcode,
                            a(word),
                            b(word),
                            c(word)
                        );
                        pc += 1;
                    }
                }
            }
        }
    }
    out
}
