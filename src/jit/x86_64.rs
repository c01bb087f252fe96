//! x86_64 template emitter
//!
//! Every bytecode register lives in a fixed slot on the host frame; each
//! instruction is a fixed template that loads its operands into rax/rcx,
//! computes, and stores back. Branches are patched with rel32 fixups
//! after emission.
//!
//! Frame layout, rbp-relative:
//!
//! ```text
//! [rbp -   8 .. rbp -  88]   R0..R10 slots
//! [rbp -  96]                remaining instruction budget
//! [rbp - 608 .. rbp -  96)   512-byte program stack (R10 = rbp - 96)
//! ```
//!
//! The instruction budget is debited a whole basic block at a time: a
//! prepass marks block leaders (branch targets and the slots after
//! branches and exits), and every block boundary subtracts the block's
//! instruction count, aborting with 0 when the budget goes negative.
//! Abort decisions therefore agree with the interpreter's
//! per-instruction count on every execution.

use smallvec::SmallVec;
use std::sync::Arc;

use crate::helpers::HelperId;
use crate::insn::Insn;
use crate::opcodes::Opcode;
use crate::prog::{MapTable, ProgType};
use crate::vm::{INSN_LIMIT, STACK_SIZE};

use super::runtime;

const COUNTER_DISP: i32 = -96;
const FRAME_SIZE: i32 = 96 + STACK_SIZE as i32;

fn slot_disp(reg: u8) -> i32 {
    -8 * (reg as i32 + 1)
}

struct Emitter<'a> {
    insns: &'a [Insn],
    code: Vec<u8>,
    /// x86 offset of each pc's first emitted byte
    offsets: Vec<usize>,
    /// rel32 patch sites waiting on bytecode targets
    branch_fixups: SmallVec<[(usize, usize); 16]>,
    /// rel32 patch sites waiting on the abort stub
    abort_fixups: SmallVec<[usize; 8]>,
    leaders: Vec<bool>,
    /// instructions accumulated in the current block
    block_len: u32,
    table_ptr: u64,
    prog_type: ProgType,
}

/// Compile verified instructions to machine code.
///
/// The caller has run the verifier; every opcode decodes and every branch
/// lands on an instruction start.
pub(super) fn compile(insns: &[Insn], prog_type: ProgType, table: &Arc<MapTable>) -> Vec<u8> {
    let mut emitter = Emitter {
        insns,
        code: Vec::with_capacity(insns.len() * 24 + 128),
        offsets: vec![0; insns.len()],
        branch_fixups: SmallVec::new(),
        abort_fixups: SmallVec::new(),
        leaders: find_leaders(insns),
        block_len: 0,
        table_ptr: Arc::as_ptr(table) as usize as u64,
        prog_type,
    };
    emitter.prologue();
    emitter.body();
    emitter.finish()
}

fn decode(insn: &Insn) -> Opcode {
    Opcode::from_byte(insn.opcode).expect("verifier admitted an undefined opcode")
}

/// Mark basic-block leaders: entry, branch targets, and the instruction
/// after every branch or exit.
fn find_leaders(insns: &[Insn]) -> Vec<bool> {
    let mut leaders = vec![false; insns.len()];
    leaders[0] = true;
    let mut pc = 0;
    while pc < insns.len() {
        let insn = &insns[pc];
        let op = decode(insn);
        let width = if op == Opcode::Lddw { 2 } else { 1 };
        if op.is_branch() {
            let target = (pc as i64 + 1 + insn.off as i64) as usize;
            leaders[target] = true;
            if pc + width < insns.len() {
                leaders[pc + width] = true;
            }
        } else if op == Opcode::Exit && pc + 1 < insns.len() {
            leaders[pc + 1] = true;
        }
        pc += width;
    }
    leaders
}

impl Emitter<'_> {
    // =====================================================================
    // Byte-level helpers
    // =====================================================================

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// mov rax, [rbp + slot]
    fn load_rax(&mut self, reg: u8) {
        self.emit(&[0x48, 0x8b, 0x85]);
        self.emit_i32(slot_disp(reg));
    }

    /// mov rcx, [rbp + slot]
    fn load_rcx(&mut self, reg: u8) {
        self.emit(&[0x48, 0x8b, 0x8d]);
        self.emit_i32(slot_disp(reg));
    }

    /// mov [rbp + slot], rax
    fn store_rax(&mut self, reg: u8) {
        self.emit(&[0x48, 0x89, 0x85]);
        self.emit_i32(slot_disp(reg));
    }

    /// mov rcx, imm (sign-extended)
    fn mov_rcx_imm(&mut self, imm: i32) {
        self.emit(&[0x48, 0xc7, 0xc1]);
        self.emit_i32(imm);
    }

    /// mov ecx, imm (zero-extends)
    fn mov_ecx_imm(&mut self, imm: i32) {
        self.emit(&[0xb9]);
        self.emit_i32(imm);
    }

    /// Emit a rel32 jump-family site and record its fixup.
    fn branch_site(&mut self, opcode: &[u8], target_pc: usize) {
        self.emit(opcode);
        self.branch_fixups.push((self.code.len(), target_pc));
        self.emit_i32(0);
    }

    // =====================================================================
    // Frame setup and teardown
    // =====================================================================

    fn prologue(&mut self) {
        // push rbp; mov rbp, rsp; sub rsp, FRAME_SIZE
        self.emit(&[0x55, 0x48, 0x89, 0xe5, 0x48, 0x81, 0xec]);
        self.emit_i32(FRAME_SIZE);
        // Park the context pointer in R1's slot before scratching rdi.
        self.emit(&[0x48, 0x89, 0xbd]);
        self.emit_i32(slot_disp(1));
        // xor eax, eax; lea rdi, [rbp - 608]; mov ecx, 64; rep stosq
        // zeroes the program stack.
        self.emit(&[0x31, 0xc0, 0x48, 0x8d, 0xbd]);
        self.emit_i32(COUNTER_DISP - STACK_SIZE as i32);
        self.emit(&[0xb9]);
        self.emit_i32((STACK_SIZE / 8) as i32);
        self.emit(&[0xf3, 0x48, 0xab]);
        // Zero every register slot except R1 and R10.
        for reg in [0u8, 2, 3, 4, 5, 6, 7, 8, 9] {
            self.store_rax(reg);
        }
        // lea rax, [rbp - 96]; R10 = top of the program stack.
        self.emit(&[0x48, 0x8d, 0x85]);
        self.emit_i32(COUNTER_DISP);
        self.store_rax(10);
        // mov qword [rbp - 96], INSN_LIMIT
        self.emit(&[0x48, 0xc7, 0x85]);
        self.emit_i32(COUNTER_DISP);
        self.emit_i32(INSN_LIMIT as i32);
    }

    /// Debit the current block from the instruction budget; a negative
    /// budget aborts with 0.
    fn charge(&mut self) {
        if self.block_len == 0 {
            return;
        }
        // sub qword [rbp - 96], block_len; js abort
        self.emit(&[0x48, 0x81, 0xad]);
        self.emit_i32(COUNTER_DISP);
        self.emit_i32(self.block_len as i32);
        self.emit(&[0x0f, 0x88]);
        self.abort_fixups.push(self.code.len());
        self.emit_i32(0);
        self.block_len = 0;
    }

    // =====================================================================
    // Instruction templates
    // =====================================================================

    fn body(&mut self) {
        use Opcode::*;

        let mut pc = 0;
        while pc < self.insns.len() {
            let insn = self.insns[pc];
            let op = decode(&insn);

            // Entering a new block by fallthrough settles the old one.
            if self.leaders[pc] {
                self.charge();
            }
            self.offsets[pc] = self.code.len();
            self.block_len += 1;

            match op {
                // === 64-bit ALU ===
                Add64Reg | Sub64Reg | Mul64Reg | Or64Reg | And64Reg | Xor64Reg | Lsh64Reg
                | Rsh64Reg | Arsh64Reg => {
                    self.load_rax(insn.dst);
                    self.load_rcx(insn.src);
                    self.alu64(op);
                    self.store_rax(insn.dst);
                }
                Add64Imm | Sub64Imm | Mul64Imm | Or64Imm | And64Imm | Xor64Imm | Lsh64Imm
                | Rsh64Imm | Arsh64Imm => {
                    self.load_rax(insn.dst);
                    self.mov_rcx_imm(insn.imm);
                    self.alu64(op);
                    self.store_rax(insn.dst);
                }
                Neg64 => {
                    self.load_rax(insn.dst);
                    self.emit(&[0x48, 0xf7, 0xd8]);
                    self.store_rax(insn.dst);
                }
                Div64Imm | Div64Reg | Mod64Imm | Mod64Reg => self.div_or_mod64(&insn, op),
                Mov64Imm => {
                    self.emit(&[0x48, 0xc7, 0xc0]);
                    self.emit_i32(insn.imm);
                    self.store_rax(insn.dst);
                }
                Mov64Reg => {
                    self.load_rax(insn.src);
                    self.store_rax(insn.dst);
                }

                // === 32-bit ALU ===
                Add32Reg | Sub32Reg | Mul32Reg | Or32Reg | And32Reg | Xor32Reg | Lsh32Reg
                | Rsh32Reg | Arsh32Reg => {
                    self.load_rax(insn.dst);
                    self.load_rcx(insn.src);
                    self.alu32(op);
                    self.store_rax(insn.dst);
                }
                Add32Imm | Sub32Imm | Mul32Imm | Or32Imm | And32Imm | Xor32Imm | Lsh32Imm
                | Rsh32Imm | Arsh32Imm => {
                    self.load_rax(insn.dst);
                    self.mov_ecx_imm(insn.imm);
                    self.alu32(op);
                    self.store_rax(insn.dst);
                }
                Neg32 => {
                    self.load_rax(insn.dst);
                    self.emit(&[0xf7, 0xd8]);
                    self.store_rax(insn.dst);
                }
                Div32Imm | Div32Reg | Mod32Imm | Mod32Reg => self.div_or_mod32(&insn, op),
                Mov32Imm => {
                    self.emit(&[0xb8]);
                    self.emit_i32(insn.imm);
                    self.store_rax(insn.dst);
                }
                Mov32Reg => {
                    self.load_rax(insn.src);
                    self.emit(&[0x89, 0xc0]);
                    self.store_rax(insn.dst);
                }
                Le => {
                    self.load_rax(insn.dst);
                    match insn.imm {
                        // movzx eax, ax
                        16 => self.emit(&[0x0f, 0xb7, 0xc0]),
                        // mov eax, eax
                        32 => self.emit(&[0x89, 0xc0]),
                        _ => {}
                    }
                    self.store_rax(insn.dst);
                }
                Be => {
                    self.load_rax(insn.dst);
                    match insn.imm {
                        // ror ax, 8; movzx eax, ax
                        16 => self.emit(&[0x66, 0xc1, 0xc8, 0x08, 0x0f, 0xb7, 0xc0]),
                        // bswap eax
                        32 => self.emit(&[0x0f, 0xc8]),
                        // bswap rax
                        _ => self.emit(&[0x48, 0x0f, 0xc8]),
                    }
                    self.store_rax(insn.dst);
                }

                // === Loads ===
                Lddw => {
                    let second = self.insns[pc + 1];
                    self.emit(&[0x48, 0xb8]);
                    self.emit_u64(Insn::pair_imm64(&insn, &second));
                    self.store_rax(insn.dst);
                }
                Ldxdw | Ldxw | Ldxh | Ldxb | Ldxsw | Ldxsh | Ldxsb => {
                    self.load_rax(insn.src);
                    match op {
                        Ldxdw => self.emit(&[0x48, 0x8b, 0x80]),
                        Ldxw => self.emit(&[0x8b, 0x80]),
                        Ldxh => self.emit(&[0x0f, 0xb7, 0x80]),
                        Ldxb => self.emit(&[0x0f, 0xb6, 0x80]),
                        Ldxsw => self.emit(&[0x48, 0x63, 0x80]),
                        Ldxsh => self.emit(&[0x48, 0x0f, 0xbf, 0x80]),
                        _ => self.emit(&[0x48, 0x0f, 0xbe, 0x80]),
                    }
                    self.emit_i32(insn.off as i32);
                    self.store_rax(insn.dst);
                }

                // === Stores ===
                Stdw | Stw | Sth | Stb => {
                    self.load_rax(insn.dst);
                    match op {
                        Stdw => {
                            self.emit(&[0x48, 0xc7, 0x80]);
                            self.emit_i32(insn.off as i32);
                            self.emit_i32(insn.imm);
                        }
                        Stw => {
                            self.emit(&[0xc7, 0x80]);
                            self.emit_i32(insn.off as i32);
                            self.emit_i32(insn.imm);
                        }
                        Sth => {
                            self.emit(&[0x66, 0xc7, 0x80]);
                            self.emit_i32(insn.off as i32);
                            self.emit(&(insn.imm as u16).to_le_bytes());
                        }
                        _ => {
                            self.emit(&[0xc6, 0x80]);
                            self.emit_i32(insn.off as i32);
                            self.emit(&[insn.imm as u8]);
                        }
                    }
                }
                Stxdw | Stxw | Stxh | Stxb => {
                    self.load_rax(insn.dst);
                    self.load_rcx(insn.src);
                    match op {
                        Stxdw => self.emit(&[0x48, 0x89, 0x88]),
                        Stxw => self.emit(&[0x89, 0x88]),
                        Stxh => self.emit(&[0x66, 0x89, 0x88]),
                        _ => self.emit(&[0x88, 0x88]),
                    }
                    self.emit_i32(insn.off as i32);
                }

                // === Branches ===
                Ja => {
                    self.charge();
                    let target = (pc as i64 + 1 + insn.off as i64) as usize;
                    self.branch_site(&[0xe9], target);
                }
                JeqImm | JeqReg | JgtImm | JgtReg | JgeImm | JgeReg | JltImm | JltReg
                | JleImm | JleReg | JsetImm | JsetReg | JneImm | JneReg | JsgtImm | JsgtReg
                | JsgeImm | JsgeReg | JsltImm | JsltReg | JsleImm | JsleReg => {
                    self.charge();
                    self.load_rax(insn.dst);
                    match op {
                        JeqReg | JgtReg | JgeReg | JltReg | JleReg | JsetReg | JneReg
                        | JsgtReg | JsgeReg | JsltReg | JsleReg => self.load_rcx(insn.src),
                        _ => self.mov_rcx_imm(insn.imm),
                    }
                    if matches!(op, JsetImm | JsetReg) {
                        // test rax, rcx
                        self.emit(&[0x48, 0x85, 0xc8]);
                    } else {
                        // cmp rax, rcx
                        self.emit(&[0x48, 0x39, 0xc8]);
                    }
                    let cc = match op {
                        JeqImm | JeqReg => 0x84,
                        JneImm | JneReg | JsetImm | JsetReg => 0x85,
                        JgtImm | JgtReg => 0x87,
                        JgeImm | JgeReg => 0x83,
                        JltImm | JltReg => 0x82,
                        JleImm | JleReg => 0x86,
                        JsgtImm | JsgtReg => 0x8f,
                        JsgeImm | JsgeReg => 0x8d,
                        JsltImm | JsltReg => 0x8c,
                        _ => 0x8e,
                    };
                    let target = (pc as i64 + 1 + insn.off as i64) as usize;
                    self.branch_site(&[0x0f, cc], target);
                }

                // === Call / Exit ===
                Call => self.call(&insn),
                Exit => {
                    self.charge();
                    self.load_rax(0);
                    // leave; ret
                    self.emit(&[0xc9, 0xc3]);
                }
            }

            pc += if op == Lddw { 2 } else { 1 };
        }
    }

    fn alu64(&mut self, op: Opcode) {
        use Opcode::*;
        match op {
            Add64Imm | Add64Reg => self.emit(&[0x48, 0x01, 0xc8]),
            Sub64Imm | Sub64Reg => self.emit(&[0x48, 0x29, 0xc8]),
            Mul64Imm | Mul64Reg => self.emit(&[0x48, 0x0f, 0xaf, 0xc1]),
            Or64Imm | Or64Reg => self.emit(&[0x48, 0x09, 0xc8]),
            And64Imm | And64Reg => self.emit(&[0x48, 0x21, 0xc8]),
            Xor64Imm | Xor64Reg => self.emit(&[0x48, 0x31, 0xc8]),
            Lsh64Imm | Lsh64Reg => self.emit(&[0x48, 0xd3, 0xe0]),
            Rsh64Imm | Rsh64Reg => self.emit(&[0x48, 0xd3, 0xe8]),
            _ => self.emit(&[0x48, 0xd3, 0xf8]),
        }
    }

    fn alu32(&mut self, op: Opcode) {
        use Opcode::*;
        match op {
            Add32Imm | Add32Reg => self.emit(&[0x01, 0xc8]),
            Sub32Imm | Sub32Reg => self.emit(&[0x29, 0xc8]),
            Mul32Imm | Mul32Reg => self.emit(&[0x0f, 0xaf, 0xc1]),
            Or32Imm | Or32Reg => self.emit(&[0x09, 0xc8]),
            And32Imm | And32Reg => self.emit(&[0x21, 0xc8]),
            Xor32Imm | Xor32Reg => self.emit(&[0x31, 0xc8]),
            Lsh32Imm | Lsh32Reg => self.emit(&[0xd3, 0xe0]),
            Rsh32Imm | Rsh32Reg => self.emit(&[0xd3, 0xe8]),
            _ => self.emit(&[0xd3, 0xf8]),
        }
    }

    fn div_or_mod64(&mut self, insn: &Insn, op: Opcode) {
        use Opcode::*;
        self.load_rax(insn.dst);
        if matches!(op, Div64Imm | Mod64Imm) {
            self.mov_rcx_imm(insn.imm);
        } else {
            self.load_rcx(insn.src);
        }
        if matches!(op, Div64Imm | Div64Reg) {
            // test rcx, rcx; jnz compute; xor eax, eax; jmp done
            // compute: xor edx, edx; div rcx
            self.emit(&[
                0x48, 0x85, 0xc9, 0x75, 0x04, 0x31, 0xc0, 0xeb, 0x05, 0x31, 0xd2, 0x48, 0xf7,
                0xf1,
            ]);
        } else {
            // test rcx, rcx; jz done (dividend kept)
            // xor edx, edx; div rcx; mov rax, rdx
            self.emit(&[
                0x48, 0x85, 0xc9, 0x74, 0x08, 0x31, 0xd2, 0x48, 0xf7, 0xf1, 0x48, 0x89, 0xd0,
            ]);
        }
        self.store_rax(insn.dst);
    }

    fn div_or_mod32(&mut self, insn: &Insn, op: Opcode) {
        use Opcode::*;
        self.load_rax(insn.dst);
        if matches!(op, Div32Imm | Mod32Imm) {
            self.mov_ecx_imm(insn.imm);
        } else {
            self.load_rcx(insn.src);
        }
        if matches!(op, Div32Imm | Div32Reg) {
            // test ecx, ecx; jnz compute; xor eax, eax; jmp done
            // compute: xor edx, edx; div ecx
            self.emit(&[
                0x85, 0xc9, 0x75, 0x04, 0x31, 0xc0, 0xeb, 0x04, 0x31, 0xd2, 0xf7, 0xf1,
            ]);
        } else {
            // mov eax, eax truncates the dividend first; a zero divisor
            // keeps it.
            // test ecx, ecx; jz done; xor edx, edx; div ecx; mov eax, edx
            self.emit(&[
                0x89, 0xc0, 0x85, 0xc9, 0x74, 0x06, 0x31, 0xd2, 0xf7, 0xf1, 0x89, 0xd0,
            ]);
        }
        self.store_rax(insn.dst);
    }

    fn call(&mut self, insn: &Insn) {
        let helper = HelperId::from_raw(insn.imm)
            .filter(|&id| self.prog_type.admits_helper(id));
        let Some(helper) = helper else {
            // Same fault rule as the interpreter: terminate with 0.
            self.emit(&[0xe9]);
            self.abort_fixups.push(self.code.len());
            self.emit_i32(0);
            return;
        };
        // mov rsi/rdx/rcx/r8/r9 from the R1..R5 slots
        for (prefix, reg) in [
            ([0x48u8, 0x8b, 0xb5], 1u8),
            ([0x48, 0x8b, 0x95], 2),
            ([0x48, 0x8b, 0x8d], 3),
            ([0x4c, 0x8b, 0x85], 4),
            ([0x4c, 0x8b, 0x8d], 5),
        ] {
            self.emit(&prefix);
            self.emit_i32(slot_disp(reg));
        }
        // movabs rdi, table; movabs rax, shim; call rax
        self.emit(&[0x48, 0xbf]);
        self.emit_u64(self.table_ptr);
        self.emit(&[0x48, 0xb8]);
        self.emit_u64(runtime::shim_addr(helper));
        self.emit(&[0xff, 0xd0]);
        self.store_rax(0);
    }

    // =====================================================================
    // Fixups
    // =====================================================================

    fn finish(mut self) -> Vec<u8> {
        // Abort stub: xor eax, eax; leave; ret
        let abort_off = self.code.len();
        self.emit(&[0x31, 0xc0, 0xc9, 0xc3]);

        for (site, target_pc) in std::mem::take(&mut self.branch_fixups) {
            let rel = self.offsets[target_pc] as i64 - (site as i64 + 4);
            self.code[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        for site in std::mem::take(&mut self.abort_fixups) {
            let rel = abort_off as i64 - (site as i64 + 4);
            self.code[site..site + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.code
    }
}
