//! Bytecode virtual machine
//!
//! A decode-and-dispatch interpreter over the 64-bit register
//! architecture: eleven registers R0..R10, a 512-byte scratch stack
//! addressed through the read-only R10, and byte-addressable memory
//! reached through pointer-carrying registers.
//!
//! Entry contract: R1 holds the context pointer, R10 the top of the
//! zeroed scratch stack, every other register zero. EXIT returns R0.
//! Runtime faults (undefined opcode reached by an unverified program,
//! inadmissible helper, unbound map slot) and the instruction-count cap
//! terminate execution with 0; the VM itself never errors.

use crate::helpers::{self, HelperId};
use crate::insn::Insn;
use crate::opcodes::Opcode;
use crate::prog::Program;

/// Scratch stack size, in bytes. R10 starts at the top; programs address
/// it with negative offsets.
pub const STACK_SIZE: usize = 512;

/// Instruction-count cap: the sole watchdog against runaway programs.
pub const INSN_LIMIT: u64 = 1_000_000;

/// Interpreter for one program.
///
/// Cheap to construct; make one per execution. Concurrent executions of
/// the same program on distinct contexts do not interfere.
pub struct Vm<'p> {
    prog: &'p Program,
}

impl<'p> Vm<'p> {
    pub fn new(prog: &'p Program) -> Vm<'p> {
        Vm { prog }
    }

    /// Execute against `ctx`, returning R0.
    ///
    /// Pins an epoch guard for the whole run, so value pointers obtained
    /// from map helpers stay valid until return.
    ///
    /// # Safety
    ///
    /// The program must have been verified, and the caller vouches that
    /// its loads and stores only touch `ctx`, the scratch stack, and map
    /// values (the structural verifier does not prove this).
    pub unsafe fn exec(&mut self, ctx: *mut u8, _ctx_len: usize) -> u64 {
        use Opcode::*;

        let insns = self.prog.insns();
        let mut stack = [0u8; STACK_SIZE];
        let mut reg = [0u64; 11];
        reg[1] = ctx as u64;
        reg[10] = stack.as_mut_ptr().add(STACK_SIZE) as u64;

        let _epoch = crate::epoch::pin();

        let mut pc = 0usize;
        let mut executed = 0u64;
        loop {
            if executed >= INSN_LIMIT {
                tracing::debug!(pc, "instruction cap reached, aborting");
                return 0;
            }
            executed += 1;

            let Some(insn) = insns.get(pc) else {
                return 0;
            };
            let Some(op) = Opcode::from_byte(insn.opcode) else {
                return 0;
            };
            let dst = insn.dst as usize;
            let src = insn.src as usize;
            let mut next = pc + 1;

            // Redirect to the branch target; out-of-range targets are a
            // runtime fault (unreachable once verified).
            macro_rules! jump {
                () => {{
                    let target = pc as i64 + 1 + insn.off as i64;
                    if target < 0 || target >= insns.len() as i64 {
                        return 0;
                    }
                    next = target as usize;
                }};
            }

            match op {
                // === 64-bit ALU ===
                Add64Imm => reg[dst] = reg[dst].wrapping_add(insn.imm as i64 as u64),
                Add64Reg => reg[dst] = reg[dst].wrapping_add(reg[src]),
                Sub64Imm => reg[dst] = reg[dst].wrapping_sub(insn.imm as i64 as u64),
                Sub64Reg => reg[dst] = reg[dst].wrapping_sub(reg[src]),
                Mul64Imm => reg[dst] = reg[dst].wrapping_mul(insn.imm as i64 as u64),
                Mul64Reg => reg[dst] = reg[dst].wrapping_mul(reg[src]),
                Div64Imm => {
                    reg[dst] = reg[dst].checked_div(insn.imm as i64 as u64).unwrap_or(0)
                }
                Div64Reg => reg[dst] = reg[dst].checked_div(reg[src]).unwrap_or(0),
                Or64Imm => reg[dst] |= insn.imm as i64 as u64,
                Or64Reg => reg[dst] |= reg[src],
                And64Imm => reg[dst] &= insn.imm as i64 as u64,
                And64Reg => reg[dst] &= reg[src],
                Lsh64Imm => reg[dst] <<= insn.imm as u64 & 63,
                Lsh64Reg => reg[dst] <<= reg[src] & 63,
                Rsh64Imm => reg[dst] >>= insn.imm as u64 & 63,
                Rsh64Reg => reg[dst] >>= reg[src] & 63,
                Neg64 => reg[dst] = (reg[dst] as i64).wrapping_neg() as u64,
                // Zero divisor leaves the dividend.
                Mod64Imm => {
                    if insn.imm != 0 {
                        reg[dst] %= insn.imm as i64 as u64;
                    }
                }
                Mod64Reg => {
                    if reg[src] != 0 {
                        reg[dst] %= reg[src];
                    }
                }
                Xor64Imm => reg[dst] ^= insn.imm as i64 as u64,
                Xor64Reg => reg[dst] ^= reg[src],
                Mov64Imm => reg[dst] = insn.imm as i64 as u64,
                Mov64Reg => reg[dst] = reg[src],
                Arsh64Imm => reg[dst] = ((reg[dst] as i64) >> (insn.imm as u64 & 63)) as u64,
                Arsh64Reg => reg[dst] = ((reg[dst] as i64) >> (reg[src] & 63)) as u64,

                // === 32-bit ALU (operates on the low word, zero-extends) ===
                Add32Imm => reg[dst] = (reg[dst] as u32).wrapping_add(insn.imm as u32) as u64,
                Add32Reg => reg[dst] = (reg[dst] as u32).wrapping_add(reg[src] as u32) as u64,
                Sub32Imm => reg[dst] = (reg[dst] as u32).wrapping_sub(insn.imm as u32) as u64,
                Sub32Reg => reg[dst] = (reg[dst] as u32).wrapping_sub(reg[src] as u32) as u64,
                Mul32Imm => reg[dst] = (reg[dst] as u32).wrapping_mul(insn.imm as u32) as u64,
                Mul32Reg => reg[dst] = (reg[dst] as u32).wrapping_mul(reg[src] as u32) as u64,
                Div32Imm => {
                    reg[dst] = (reg[dst] as u32).checked_div(insn.imm as u32).unwrap_or(0) as u64
                }
                Div32Reg => {
                    reg[dst] = (reg[dst] as u32).checked_div(reg[src] as u32).unwrap_or(0) as u64
                }
                Or32Imm => reg[dst] = (reg[dst] as u32 | insn.imm as u32) as u64,
                Or32Reg => reg[dst] = (reg[dst] as u32 | reg[src] as u32) as u64,
                And32Imm => reg[dst] = (reg[dst] as u32 & insn.imm as u32) as u64,
                And32Reg => reg[dst] = (reg[dst] as u32 & reg[src] as u32) as u64,
                Lsh32Imm => reg[dst] = ((reg[dst] as u32) << (insn.imm as u32 & 31)) as u64,
                Lsh32Reg => reg[dst] = ((reg[dst] as u32) << (reg[src] as u32 & 31)) as u64,
                Rsh32Imm => reg[dst] = ((reg[dst] as u32) >> (insn.imm as u32 & 31)) as u64,
                Rsh32Reg => reg[dst] = ((reg[dst] as u32) >> (reg[src] as u32 & 31)) as u64,
                Neg32 => reg[dst] = (reg[dst] as u32).wrapping_neg() as u64,
                // Zero divisor truncates the dividend to 32 bits.
                Mod32Imm => {
                    let lhs = reg[dst] as u32;
                    reg[dst] = match insn.imm as u32 {
                        0 => lhs as u64,
                        rhs => (lhs % rhs) as u64,
                    };
                }
                Mod32Reg => {
                    let lhs = reg[dst] as u32;
                    reg[dst] = match reg[src] as u32 {
                        0 => lhs as u64,
                        rhs => (lhs % rhs) as u64,
                    };
                }
                Xor32Imm => reg[dst] = (reg[dst] as u32 ^ insn.imm as u32) as u64,
                Xor32Reg => reg[dst] = (reg[dst] as u32 ^ reg[src] as u32) as u64,
                Mov32Imm => reg[dst] = insn.imm as u32 as u64,
                Mov32Reg => reg[dst] = reg[src] as u32 as u64,
                Arsh32Imm => {
                    reg[dst] = ((reg[dst] as i32) >> (insn.imm as u32 & 31)) as u32 as u64
                }
                Arsh32Reg => {
                    reg[dst] = ((reg[dst] as i32) >> (reg[src] as u32 & 31)) as u32 as u64
                }
                Le => match insn.imm {
                    16 => reg[dst] = (reg[dst] as u16).to_le() as u64,
                    32 => reg[dst] = (reg[dst] as u32).to_le() as u64,
                    64 => reg[dst] = reg[dst].to_le(),
                    _ => return 0,
                },
                Be => match insn.imm {
                    16 => reg[dst] = (reg[dst] as u16).to_be() as u64,
                    32 => reg[dst] = (reg[dst] as u32).to_be() as u64,
                    64 => reg[dst] = reg[dst].to_be(),
                    _ => return 0,
                },

                // === Loads ===
                Lddw => {
                    let Some(second) = insns.get(pc + 1) else {
                        return 0;
                    };
                    reg[dst] = Insn::pair_imm64(insn, second);
                    next = pc + 2;
                }
                Ldxdw => reg[dst] = Self::load::<u64>(reg[src], insn.off),
                Ldxw => reg[dst] = Self::load::<u32>(reg[src], insn.off) as u64,
                Ldxh => reg[dst] = Self::load::<u16>(reg[src], insn.off) as u64,
                Ldxb => reg[dst] = Self::load::<u8>(reg[src], insn.off) as u64,
                Ldxsw => reg[dst] = Self::load::<u32>(reg[src], insn.off) as i32 as i64 as u64,
                Ldxsh => reg[dst] = Self::load::<u16>(reg[src], insn.off) as i16 as i64 as u64,
                Ldxsb => reg[dst] = Self::load::<u8>(reg[src], insn.off) as i8 as i64 as u64,

                // === Stores ===
                Stdw => Self::store::<u64>(reg[dst], insn.off, insn.imm as i64 as u64),
                Stw => Self::store::<u32>(reg[dst], insn.off, insn.imm as u32),
                Sth => Self::store::<u16>(reg[dst], insn.off, insn.imm as u16),
                Stb => Self::store::<u8>(reg[dst], insn.off, insn.imm as u8),
                Stxdw => Self::store::<u64>(reg[dst], insn.off, reg[src]),
                Stxw => Self::store::<u32>(reg[dst], insn.off, reg[src] as u32),
                Stxh => Self::store::<u16>(reg[dst], insn.off, reg[src] as u16),
                Stxb => Self::store::<u8>(reg[dst], insn.off, reg[src] as u8),

                // === Branches ===
                Ja => jump!(),
                JeqImm => {
                    if reg[dst] == insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JeqReg => {
                    if reg[dst] == reg[src] {
                        jump!()
                    }
                }
                JgtImm => {
                    if reg[dst] > insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JgtReg => {
                    if reg[dst] > reg[src] {
                        jump!()
                    }
                }
                JgeImm => {
                    if reg[dst] >= insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JgeReg => {
                    if reg[dst] >= reg[src] {
                        jump!()
                    }
                }
                JltImm => {
                    if reg[dst] < insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JltReg => {
                    if reg[dst] < reg[src] {
                        jump!()
                    }
                }
                JleImm => {
                    if reg[dst] <= insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JleReg => {
                    if reg[dst] <= reg[src] {
                        jump!()
                    }
                }
                JsetImm => {
                    if reg[dst] & (insn.imm as i64 as u64) != 0 {
                        jump!()
                    }
                }
                JsetReg => {
                    if reg[dst] & reg[src] != 0 {
                        jump!()
                    }
                }
                JneImm => {
                    if reg[dst] != insn.imm as i64 as u64 {
                        jump!()
                    }
                }
                JneReg => {
                    if reg[dst] != reg[src] {
                        jump!()
                    }
                }
                JsgtImm => {
                    if (reg[dst] as i64) > insn.imm as i64 {
                        jump!()
                    }
                }
                JsgtReg => {
                    if (reg[dst] as i64) > reg[src] as i64 {
                        jump!()
                    }
                }
                JsgeImm => {
                    if (reg[dst] as i64) >= insn.imm as i64 {
                        jump!()
                    }
                }
                JsgeReg => {
                    if (reg[dst] as i64) >= reg[src] as i64 {
                        jump!()
                    }
                }
                JsltImm => {
                    if (reg[dst] as i64) < insn.imm as i64 {
                        jump!()
                    }
                }
                JsltReg => {
                    if (reg[dst] as i64) < reg[src] as i64 {
                        jump!()
                    }
                }
                JsleImm => {
                    if (reg[dst] as i64) <= insn.imm as i64 {
                        jump!()
                    }
                }
                JsleReg => {
                    if (reg[dst] as i64) <= reg[src] as i64 {
                        jump!()
                    }
                }

                // === Call / Exit ===
                Call => {
                    let helper = HelperId::from_raw(insn.imm)
                        .filter(|&id| self.prog.prog_type().admits_helper(id));
                    let Some(helper) = helper else {
                        return 0;
                    };
                    let args = [reg[1], reg[2], reg[3], reg[4], reg[5]];
                    reg[0] = helpers::call(helper, self.prog.map_table(), args);
                }
                Exit => return reg[0],
            }

            pc = next;
        }
    }

    #[inline]
    unsafe fn load<T: Copy>(base: u64, off: i16) -> T {
        let addr = (base as i64).wrapping_add(off as i64) as u64 as usize;
        std::ptr::read_unaligned(addr as *const T)
    }

    #[inline]
    unsafe fn store<T: Copy>(base: u64, off: i16, value: T) {
        let addr = (base as i64).wrapping_add(off as i64) as u64 as usize;
        std::ptr::write_unaligned(addr as *mut T, value);
    }
}
