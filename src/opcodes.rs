//! Bytecode opcodes for the eBPF virtual machine
//!
//! This module defines all instruction bytes admitted by the runtime.
//! The opcode byte follows the classic eBPF field packing: the low three
//! bits select the instruction class, bit 3 selects the immediate or
//! register source form, and the high bits carry the operation (ALU and
//! jump classes) or the access size and mode (load and store classes).
//!
//! The enum is closed: a byte outside the table has no `Opcode` value, so
//! undefined instructions are unrepresentable past the decode boundary.

use std::fmt;

/// Bytecode opcode enumeration
///
/// Each variant is a complete instruction byte (class, source form, and
/// operation packed together). Variants are grouped by instruction family.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // === 32-bit ALU, immediate and register forms (class 0x04) ===
    /// dst = (u32)(dst + imm)
    Add32Imm = 0x04,
    /// dst = (u32)(dst + src)
    Add32Reg = 0x0c,
    /// dst = (u32)(dst - imm)
    Sub32Imm = 0x14,
    /// dst = (u32)(dst - src)
    Sub32Reg = 0x1c,
    /// dst = (u32)(dst * imm)
    Mul32Imm = 0x24,
    /// dst = (u32)(dst * src)
    Mul32Reg = 0x2c,
    /// dst = (u32)(dst / imm), unsigned
    Div32Imm = 0x34,
    /// dst = (u32)(dst / src), unsigned; src == 0 yields 0
    Div32Reg = 0x3c,
    /// dst = (u32)(dst | imm)
    Or32Imm = 0x44,
    /// dst = (u32)(dst | src)
    Or32Reg = 0x4c,
    /// dst = (u32)(dst & imm)
    And32Imm = 0x54,
    /// dst = (u32)(dst & src)
    And32Reg = 0x5c,
    /// dst = (u32)(dst << (imm & 31))
    Lsh32Imm = 0x64,
    /// dst = (u32)(dst << (src & 31))
    Lsh32Reg = 0x6c,
    /// dst = (u32)dst >> (imm & 31), logical
    Rsh32Imm = 0x74,
    /// dst = (u32)dst >> (src & 31), logical
    Rsh32Reg = 0x7c,
    /// dst = (u32)(-dst)
    Neg32 = 0x84,
    /// dst = (u32)dst % imm, unsigned
    Mod32Imm = 0x94,
    /// dst = (u32)dst % src, unsigned; src == 0 leaves the dividend
    Mod32Reg = 0x9c,
    /// dst = (u32)(dst ^ imm)
    Xor32Imm = 0xa4,
    /// dst = (u32)(dst ^ src)
    Xor32Reg = 0xac,
    /// dst = (u32)imm
    Mov32Imm = 0xb4,
    /// dst = (u32)src
    Mov32Reg = 0xbc,
    /// dst = (u32)((i32)dst >> (imm & 31)), arithmetic
    Arsh32Imm = 0xc4,
    /// dst = (u32)((i32)dst >> (src & 31)), arithmetic
    Arsh32Reg = 0xcc,
    /// dst = host-to-little-endian of the low imm bits (imm in {16, 32, 64})
    Le = 0xd4,
    /// dst = host-to-big-endian of the low imm bits (imm in {16, 32, 64})
    Be = 0xdc,

    // === 64-bit ALU, immediate and register forms (class 0x07) ===
    /// dst += imm (imm sign-extended to 64 bits)
    Add64Imm = 0x07,
    /// dst += src
    Add64Reg = 0x0f,
    /// dst -= imm
    Sub64Imm = 0x17,
    /// dst -= src
    Sub64Reg = 0x1f,
    /// dst *= imm
    Mul64Imm = 0x27,
    /// dst *= src
    Mul64Reg = 0x2f,
    /// dst /= imm, unsigned
    Div64Imm = 0x37,
    /// dst /= src, unsigned; src == 0 yields 0
    Div64Reg = 0x3f,
    /// dst |= imm
    Or64Imm = 0x47,
    /// dst |= src
    Or64Reg = 0x4f,
    /// dst &= imm
    And64Imm = 0x57,
    /// dst &= src
    And64Reg = 0x5f,
    /// dst <<= imm & 63
    Lsh64Imm = 0x67,
    /// dst <<= src & 63
    Lsh64Reg = 0x6f,
    /// dst >>= imm & 63, logical
    Rsh64Imm = 0x77,
    /// dst >>= src & 63, logical
    Rsh64Reg = 0x7f,
    /// dst = -dst
    Neg64 = 0x87,
    /// dst %= imm, unsigned
    Mod64Imm = 0x97,
    /// dst %= src, unsigned; src == 0 leaves the dividend
    Mod64Reg = 0x9f,
    /// dst ^= imm
    Xor64Imm = 0xa7,
    /// dst ^= src
    Xor64Reg = 0xaf,
    /// dst = imm (sign-extended)
    Mov64Imm = 0xb7,
    /// dst = src
    Mov64Reg = 0xbf,
    /// dst = (i64)dst >> (imm & 63), arithmetic
    Arsh64Imm = 0xc7,
    /// dst = (i64)dst >> (src & 63), arithmetic
    Arsh64Reg = 0xcf,

    // === Loads (classes 0x00 and 0x01) ===
    /// dst = imm64; occupies two slots, the second carries the high 32 bits
    Lddw = 0x18,
    /// dst = *(u32 *)(src + off)
    Ldxw = 0x61,
    /// dst = *(u16 *)(src + off)
    Ldxh = 0x69,
    /// dst = *(u8 *)(src + off)
    Ldxb = 0x71,
    /// dst = *(u64 *)(src + off)
    Ldxdw = 0x79,
    /// dst = *(i32 *)(src + off), sign-extended
    Ldxsw = 0x81,
    /// dst = *(i16 *)(src + off), sign-extended
    Ldxsh = 0x89,
    /// dst = *(i8 *)(src + off), sign-extended
    Ldxsb = 0x91,

    // === Stores (classes 0x02 and 0x03) ===
    /// *(u32 *)(dst + off) = imm
    Stw = 0x62,
    /// *(u16 *)(dst + off) = imm
    Sth = 0x6a,
    /// *(u8 *)(dst + off) = imm
    Stb = 0x72,
    /// *(u64 *)(dst + off) = imm (sign-extended)
    Stdw = 0x7a,
    /// *(u32 *)(dst + off) = src
    Stxw = 0x63,
    /// *(u16 *)(dst + off) = src
    Stxh = 0x6b,
    /// *(u8 *)(dst + off) = src
    Stxb = 0x73,
    /// *(u64 *)(dst + off) = src
    Stxdw = 0x7b,

    // === Jumps (class 0x05) ===
    /// pc += off, unconditional
    Ja = 0x05,
    /// pc += off if dst == imm
    JeqImm = 0x15,
    /// pc += off if dst == src
    JeqReg = 0x1d,
    /// pc += off if dst > imm, unsigned
    JgtImm = 0x25,
    /// pc += off if dst > src, unsigned
    JgtReg = 0x2d,
    /// pc += off if dst >= imm, unsigned
    JgeImm = 0x35,
    /// pc += off if dst >= src, unsigned
    JgeReg = 0x3d,
    /// pc += off if dst & imm
    JsetImm = 0x45,
    /// pc += off if dst & src
    JsetReg = 0x4d,
    /// pc += off if dst != imm
    JneImm = 0x55,
    /// pc += off if dst != src
    JneReg = 0x5d,
    /// pc += off if dst > imm, signed
    JsgtImm = 0x65,
    /// pc += off if dst > src, signed
    JsgtReg = 0x6d,
    /// pc += off if dst >= imm, signed
    JsgeImm = 0x75,
    /// pc += off if dst >= src, signed
    JsgeReg = 0x7d,
    /// Call the helper function selected by imm
    Call = 0x85,
    /// Terminate, returning R0
    Exit = 0x95,
    /// pc += off if dst < imm, unsigned
    JltImm = 0xa5,
    /// pc += off if dst < src, unsigned
    JltReg = 0xad,
    /// pc += off if dst <= imm, unsigned
    JleImm = 0xb5,
    /// pc += off if dst <= src, unsigned
    JleReg = 0xbd,
    /// pc += off if dst < imm, signed
    JsltImm = 0xc5,
    /// pc += off if dst < src, signed
    JsltReg = 0xcd,
    /// pc += off if dst <= imm, signed
    JsleImm = 0xd5,
    /// pc += off if dst <= src, signed
    JsleReg = 0xdd,
}

impl Opcode {
    /// Decode an opcode from its instruction byte.
    ///
    /// Returns `None` for bytes outside the defined table.
    pub fn from_byte(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        let op = match byte {
            0x04 => Add32Imm,
            0x0c => Add32Reg,
            0x14 => Sub32Imm,
            0x1c => Sub32Reg,
            0x24 => Mul32Imm,
            0x2c => Mul32Reg,
            0x34 => Div32Imm,
            0x3c => Div32Reg,
            0x44 => Or32Imm,
            0x4c => Or32Reg,
            0x54 => And32Imm,
            0x5c => And32Reg,
            0x64 => Lsh32Imm,
            0x6c => Lsh32Reg,
            0x74 => Rsh32Imm,
            0x7c => Rsh32Reg,
            0x84 => Neg32,
            0x94 => Mod32Imm,
            0x9c => Mod32Reg,
            0xa4 => Xor32Imm,
            0xac => Xor32Reg,
            0xb4 => Mov32Imm,
            0xbc => Mov32Reg,
            0xc4 => Arsh32Imm,
            0xcc => Arsh32Reg,
            0xd4 => Le,
            0xdc => Be,
            0x07 => Add64Imm,
            0x0f => Add64Reg,
            0x17 => Sub64Imm,
            0x1f => Sub64Reg,
            0x27 => Mul64Imm,
            0x2f => Mul64Reg,
            0x37 => Div64Imm,
            0x3f => Div64Reg,
            0x47 => Or64Imm,
            0x4f => Or64Reg,
            0x57 => And64Imm,
            0x5f => And64Reg,
            0x67 => Lsh64Imm,
            0x6f => Lsh64Reg,
            0x77 => Rsh64Imm,
            0x7f => Rsh64Reg,
            0x87 => Neg64,
            0x97 => Mod64Imm,
            0x9f => Mod64Reg,
            0xa7 => Xor64Imm,
            0xaf => Xor64Reg,
            0xb7 => Mov64Imm,
            0xbf => Mov64Reg,
            0xc7 => Arsh64Imm,
            0xcf => Arsh64Reg,
            0x18 => Lddw,
            0x61 => Ldxw,
            0x69 => Ldxh,
            0x71 => Ldxb,
            0x79 => Ldxdw,
            0x81 => Ldxsw,
            0x89 => Ldxsh,
            0x91 => Ldxsb,
            0x62 => Stw,
            0x6a => Sth,
            0x72 => Stb,
            0x7a => Stdw,
            0x63 => Stxw,
            0x6b => Stxh,
            0x73 => Stxb,
            0x7b => Stxdw,
            0x05 => Ja,
            0x15 => JeqImm,
            0x1d => JeqReg,
            0x25 => JgtImm,
            0x2d => JgtReg,
            0x35 => JgeImm,
            0x3d => JgeReg,
            0x45 => JsetImm,
            0x4d => JsetReg,
            0x55 => JneImm,
            0x5d => JneReg,
            0x65 => JsgtImm,
            0x6d => JsgtReg,
            0x75 => JsgeImm,
            0x7d => JsgeReg,
            0x85 => Call,
            0x95 => Exit,
            0xa5 => JltImm,
            0xad => JltReg,
            0xb5 => JleImm,
            0xbd => JleReg,
            0xc5 => JsltImm,
            0xcd => JsltReg,
            0xd5 => JsleImm,
            0xdd => JsleReg,
            _ => return None,
        };
        Some(op)
    }

    /// Get the raw instruction byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// True for the conditional and unconditional branches that carry a
    /// pc-relative target in `off` (CALL and EXIT excluded).
    pub fn is_branch(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            Ja | JeqImm
                | JeqReg
                | JgtImm
                | JgtReg
                | JgeImm
                | JgeReg
                | JsetImm
                | JsetReg
                | JneImm
                | JneReg
                | JsgtImm
                | JsgtReg
                | JsgeImm
                | JsgeReg
                | JltImm
                | JltReg
                | JleImm
                | JleReg
                | JsltImm
                | JsltReg
                | JsleImm
                | JsleReg
        )
    }

    /// True for store instructions, whose `dst` register is an address base
    /// rather than a write target.
    pub fn is_store(self) -> bool {
        use Opcode::*;
        matches!(self, Stw | Sth | Stb | Stdw | Stxw | Stxh | Stxb | Stxdw)
    }

    /// True for a division or modulo with an immediate divisor.
    pub fn is_div_or_mod_imm(self) -> bool {
        use Opcode::*;
        matches!(self, Div32Imm | Div64Imm | Mod32Imm | Mod64Imm)
    }

    /// Instruction mnemonic, as rendered by traces and the disassembler.
    pub fn mnemonic(self) -> &'static str {
        use Opcode::*;
        match self {
            Add32Imm | Add32Reg => "add32",
            Sub32Imm | Sub32Reg => "sub32",
            Mul32Imm | Mul32Reg => "mul32",
            Div32Imm | Div32Reg => "div32",
            Or32Imm | Or32Reg => "or32",
            And32Imm | And32Reg => "and32",
            Lsh32Imm | Lsh32Reg => "lsh32",
            Rsh32Imm | Rsh32Reg => "rsh32",
            Neg32 => "neg32",
            Mod32Imm | Mod32Reg => "mod32",
            Xor32Imm | Xor32Reg => "xor32",
            Mov32Imm | Mov32Reg => "mov32",
            Arsh32Imm | Arsh32Reg => "arsh32",
            Le => "le",
            Be => "be",
            Add64Imm | Add64Reg => "add64",
            Sub64Imm | Sub64Reg => "sub64",
            Mul64Imm | Mul64Reg => "mul64",
            Div64Imm | Div64Reg => "div64",
            Or64Imm | Or64Reg => "or64",
            And64Imm | And64Reg => "and64",
            Lsh64Imm | Lsh64Reg => "lsh64",
            Rsh64Imm | Rsh64Reg => "rsh64",
            Neg64 => "neg64",
            Mod64Imm | Mod64Reg => "mod64",
            Xor64Imm | Xor64Reg => "xor64",
            Mov64Imm | Mov64Reg => "mov64",
            Arsh64Imm | Arsh64Reg => "arsh64",
            Lddw => "lddw",
            Ldxw => "ldxw",
            Ldxh => "ldxh",
            Ldxb => "ldxb",
            Ldxdw => "ldxdw",
            Ldxsw => "ldxsw",
            Ldxsh => "ldxsh",
            Ldxsb => "ldxsb",
            Stw => "stw",
            Sth => "sth",
            Stb => "stb",
            Stdw => "stdw",
            Stxw => "stxw",
            Stxh => "stxh",
            Stxb => "stxb",
            Stxdw => "stxdw",
            Ja => "ja",
            JeqImm | JeqReg => "jeq",
            JgtImm | JgtReg => "jgt",
            JgeImm | JgeReg => "jge",
            JsetImm | JsetReg => "jset",
            JneImm | JneReg => "jne",
            JsgtImm | JsgtReg => "jsgt",
            JsgeImm | JsgeReg => "jsge",
            Call => "call",
            Exit => "exit",
            JltImm | JltReg => "jlt",
            JleImm | JleReg => "jle",
            JsltImm | JsltReg => "jslt",
            JsleImm | JsleReg => "jsle",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}
